//! An ordered key-value list: a contiguous `Vec` plus a
//! name→index side table for lookup, replacing the C daemon's intrusive
//! linked list without changing observable semantics -- insertion order is
//! preserved, duplicate names are rejected on insert but allowed on update,
//! and deletion-by-empty-value still works.

use std::collections::HashMap;

use crate::error::{ErrorKind, PayprocError};

/// A validated data-line name: non-empty, `Letter(-Letter)*`, optionally
/// `_`-prefixed for internal-only fields, optionally carrying a bracketed
/// `Meta[...]` suffix. Constructing a `Name` is the only way to get one past
/// the name grammar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(String);

impl Name {
    /// Accepts an already-well-formed name verbatim (e.g. names payproc
    /// constructs internally like `_SESSID`, `Meta[Foo]`, `D[3]`). Does not
    /// apply client-input capitalization; use [`Name::parse_normalizing`]
    /// for that.
    pub fn new(raw: impl Into<String>) -> Result<Self, PayprocError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(PayprocError::new(ErrorKind::InvalidName, "empty name"));
        }
        if raw.contains(':') {
            return Err(PayprocError::new(
                ErrorKind::InvalidName,
                "':' is forbidden in a name",
            ));
        }
        let body = if let Some(rest) = raw.strip_prefix('_') {
            rest
        } else {
            raw.as_str()
        };
        if body.is_empty() {
            return Err(PayprocError::new(ErrorKind::InvalidName, "empty name"));
        }
        validate_letter_hyphen_or_bracket(body)?;
        Ok(Name(raw))
    }

    /// Parses a client-supplied name, applying capitalization
    /// normalization: within each hyphen-delimited segment, the first
    /// letter is uppercased and the rest lowercased, with any `[...]`
    /// region left verbatim.
    pub fn parse_normalizing(raw: &str) -> Result<Self, PayprocError> {
        if raw.is_empty() {
            return Err(PayprocError::new(ErrorKind::InvalidName, "empty name"));
        }
        if raw.contains(':') {
            return Err(PayprocError::new(
                ErrorKind::InvalidName,
                "':' is forbidden in a name",
            ));
        }
        let (head, internal) = if let Some(rest) = raw.strip_prefix('_') {
            (rest, true)
        } else {
            (raw, false)
        };
        let normalized = normalize_segments(head)?;
        let full = if internal {
            format!("_{normalized}")
        } else {
            normalized
        };
        Name::new(full)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Internal names (leading `_`) are never emitted to clients, except a
    /// small allow-list (see [`Name::is_wire_allowed`]).
    pub fn is_internal(&self) -> bool {
        self.0.starts_with('_')
    }

    const WIRE_ALLOWLIST: &'static [&'static str] = &["_SESSID", "_ALIASID", "_timestamp", "_amount"];

    /// Whether this name may be emitted on the wire even though it is
    /// internal -- [`Self::WIRE_ALLOWLIST`], plus `D[n]` list rows.
    pub fn is_wire_allowed(&self) -> bool {
        if !self.is_internal() {
            return true;
        }
        Self::WIRE_ALLOWLIST.contains(&self.0.as_str()) || self.0.starts_with("D[")
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::ops::Deref for Name {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

/// Validates that `s` is `Letter(-Letter)*`, where a `[...]` region (as in
/// `Meta[Foo-Bar]`) is permitted to contain anything except `=&\t\n` and is
/// not itself subject to the hyphen grammar.
fn validate_letter_hyphen_or_bracket(s: &str) -> Result<(), PayprocError> {
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut expect_letter_start = true;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '[' {
            let close = s[i..]
                .find(']')
                .map(|off| i + off)
                .ok_or_else(|| PayprocError::new(ErrorKind::InvalidName, "unterminated '['"))?;
            let inner = &s[i + 1..close];
            if inner.chars().any(|c| "=&\t\n".contains(c)) {
                return Err(PayprocError::new(
                    ErrorKind::InvalidName,
                    "Meta[...] name contains a forbidden character",
                ));
            }
            i = close + 1;
            expect_letter_start = false;
            continue;
        }
        if c == '-' {
            if expect_letter_start {
                return Err(PayprocError::new(ErrorKind::InvalidName, "empty hyphen segment"));
            }
            expect_letter_start = true;
            i += 1;
            continue;
        }
        if !c.is_ascii_alphabetic() {
            return Err(PayprocError::new(
                ErrorKind::InvalidName,
                format!("'{c}' is not a letter, '-', or '[...]'"),
            ));
        }
        expect_letter_start = false;
        i += 1;
    }
    if expect_letter_start {
        return Err(PayprocError::new(ErrorKind::InvalidName, "trailing '-'"));
    }
    Ok(())
}

fn normalize_segments(s: &str) -> Result<String, PayprocError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.char_indices().peekable();
    let mut segment_start = true;
    while let Some((i, c)) = chars.next() {
        if c == '[' {
            let close = s[i..]
                .find(']')
                .map(|off| i + off)
                .ok_or_else(|| PayprocError::new(ErrorKind::InvalidName, "unterminated '['"))?;
            out.push_str(&s[i..=close]);
            while let Some(&(j, _)) = chars.peek() {
                if j <= close {
                    chars.next();
                } else {
                    break;
                }
            }
            segment_start = false;
            continue;
        }
        if c == '-' {
            out.push('-');
            segment_start = true;
            continue;
        }
        if segment_start {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        segment_start = false;
    }
    Ok(out)
}

/// An ordered (name, value) list. Values are UTF-8 byte strings; embedded
/// `\n` is allowed (it round-trips through continuation lines on the wire).
#[derive(Debug, Clone, Default)]
pub struct KvList {
    entries: Vec<(Name, String)>,
    index: HashMap<Name, usize>,
}

impl KvList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new entry. Fails if `name` is already present -- use
    /// [`KvList::put`] to allow replacing an existing value.
    pub fn insert(&mut self, name: Name, value: impl Into<String>) -> Result<(), PayprocError> {
        if self.index.contains_key(&name) {
            return Err(PayprocError::new(
                ErrorKind::ProtocolViolation,
                format!("duplicate name '{name}'"),
            ));
        }
        let idx = self.entries.len();
        self.index.insert(name.clone(), idx);
        self.entries.push((name, value.into()));
        Ok(())
    }

    /// Upserts `name`: an empty `value` deletes the entry; a
    /// non-empty value replaces it if present or appends it otherwise.
    pub fn put(&mut self, name: Name, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            self.remove(&name);
            return;
        }
        if let Some(&idx) = self.index.get(&name) {
            self.entries[idx].1 = value;
        } else {
            let idx = self.entries.len();
            self.index.insert(name.clone(), idx);
            self.entries.push((name, value));
        }
    }

    pub fn remove(&mut self, name: &Name) -> Option<String> {
        let idx = self.index.remove(name)?;
        let (_, value) = self.entries.remove(idx);
        for i in self.index.values_mut() {
            if *i > idx {
                *i -= 1;
            }
        }
        Some(value)
    }

    pub fn get(&self, name: &Name) -> Option<&str> {
        self.index.get(name).map(|&i| self.entries[i].1.as_str())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &Name) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Name, &str)> {
        self.entries.iter().map(|(n, v)| (n, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries whose name is `Meta[<inner>]`, yielded as `(inner, value)`.
    pub fn meta_entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|(n, v)| {
            let s = n.as_str();
            let s = s.strip_prefix("Meta[")?;
            let inner = s.strip_suffix(']')?;
            Some((inner, v.as_str()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn normalizes_basic_segments() {
        let n = Name::parse_normalizing("content-type").unwrap();
        assert_eq!(n.as_str(), "Content-Type");
    }

    #[test]
    fn normalizes_bracket_verbatim() {
        let n = Name::parse_normalizing("meta[X-Y]").unwrap();
        assert_eq!(n.as_str(), "Meta[X-Y]");

        let n = Name::parse_normalizing("Foo-bar[nested-Name]").unwrap();
        assert_eq!(n.as_str(), "Foo-Bar[nested-Name]");
    }

    #[test]
    fn rejects_colon_in_name() {
        assert!(Name::new("Foo:Bar").is_err());
    }

    #[test]
    fn internal_allowlist() {
        let sessid = Name::new("_SESSID").unwrap();
        assert!(sessid.is_internal());
        assert!(sessid.is_wire_allowed());

        let secret = Name::new("_secret").unwrap();
        assert!(secret.is_internal());
        assert!(!secret.is_wire_allowed());
    }

    #[test]
    fn put_empty_value_deletes() {
        let mut kv = KvList::new();
        let name = Name::new("Foo").unwrap();
        kv.insert(name.clone(), "bar").unwrap();
        kv.put(name.clone(), "");
        assert!(kv.get(&name).is_none());
    }

    #[test]
    fn insert_rejects_duplicate() {
        let mut kv = KvList::new();
        let name = Name::new("Foo").unwrap();
        kv.insert(name.clone(), "1").unwrap();
        assert!(kv.insert(name, "2").is_err());
    }

    #[test]
    fn meta_entries_extracted() {
        let mut kv = KvList::new();
        kv.insert(Name::new("Meta[Order-Id]").unwrap(), "42").unwrap();
        kv.insert(Name::new("Desc").unwrap(), "hi").unwrap();
        let metas: Vec<_> = kv.meta_entries().collect();
        assert_eq!(metas, vec![("Order-Id", "42")]);
    }

    proptest! {
        // Normalizing is idempotent.
        #[test]
        fn normalize_is_idempotent(segs in prop::collection::vec("[a-zA-Z]{1,8}", 1..4)) {
            let raw = segs.join("-");
            let once = normalize_segments(&raw).unwrap();
            let twice = normalize_segments(&once).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
