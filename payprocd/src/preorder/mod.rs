//! The SQL-backed preorder store: a SEPA-ref-keyed table
//! of pending bank-transfer orders, with prepared statements held behind a
//! single lock spanning bind + step + reset, not the SQL library's
//! own serialization.

pub mod sepa_ref;

use std::sync::Mutex;

use payproc_api_core::error::{ErrorKind, PayprocError};
use payproc_api_core::kv::{KvList, Name};
use rand::rngs::OsRng;
use rusqlite::{params, Connection, OptionalExtension};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS preorder (
    ref       TEXT PRIMARY KEY,
    refnn     INTEGER NOT NULL,
    created   TEXT NOT NULL,
    paid      TEXT,
    npaid     INTEGER NOT NULL DEFAULT 0,
    amount    TEXT NOT NULL,
    currency  TEXT NOT NULL,
    desc      TEXT,
    email     TEXT,
    meta      TEXT
);
"#;

/// Formats `now` as `YYYY-MM-DD HH:MM:SS` UTC.
pub fn sql_datetime_now() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Serializes `Meta[...]` KV entries into `k1=v1&k2=v2` percent-escaped form.
pub(crate) fn serialize_meta(dict: &KvList) -> String {
    let pairs: Vec<String> = dict
        .meta_entries()
        .map(|(k, v)| {
            format!(
                "{}={}",
                percent_encoding::utf8_percent_encode(k, percent_encoding::NON_ALPHANUMERIC),
                percent_encoding::utf8_percent_encode(v, percent_encoding::NON_ALPHANUMERIC),
            )
        })
        .collect();
    pairs.join("&")
}

/// The inverse of [`serialize_meta`], yielding `Meta[k]` entries.
pub(crate) fn deserialize_meta(encoded: &str, out: &mut KvList) -> Result<(), PayprocError> {
    if encoded.is_empty() {
        return Ok(());
    }
    for pair in encoded.split('&') {
        let Some((k, v)) = pair.split_once('=') else { continue };
        let k = percent_encoding::percent_decode_str(k).decode_utf8_lossy();
        let v = percent_encoding::percent_decode_str(v).decode_utf8_lossy();
        out.put(Name::new(format!("Meta[{k}]"))?, v.into_owned());
    }
    Ok(())
}

pub struct PreorderStore {
    conn: Mutex<Connection>,
}

impl PreorderStore {
    pub fn open(path: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// `store(dict)`: allocates a fresh SEPA-ref (retried per
    /// [`sepa_ref::allocate`]) and inserts a new row. `dict` must contain
    /// `Amount`/`Currency` and may contain `Desc`/`Email`/`Meta[...]`.
    pub fn store(&self, dict: &KvList) -> Result<(String, u8), PayprocError> {
        let amount = dict.get_str("Amount").ok_or_else(|| PayprocError::missing_value("Amount"))?;
        let currency = dict.get_str("Currency").ok_or_else(|| PayprocError::missing_value("Currency"))?;
        let desc = dict.get_str("Desc");
        let email = dict.get_str("Email");
        let meta = serialize_meta(dict);
        let created = sql_datetime_now();

        let conn = self.conn.lock().expect("preorder db lock poisoned");
        let mut rng = OsRng;
        let (sepa_ref, refnn) = sepa_ref::allocate(&mut rng, |candidate| -> rusqlite::Result<bool> {
            conn.query_row("SELECT 1 FROM preorder WHERE ref = ?1", params![candidate], |_| Ok(()))
                .optional()
                .map(|row| row.is_some())
        })?;

        conn.execute(
            "INSERT INTO preorder (ref, refnn, created, npaid, amount, currency, desc, email, meta)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?7, ?8)",
            params![sepa_ref, refnn, created, amount, currency, desc, email, meta],
        )
        .map_err(|e| PayprocError::new(ErrorKind::General, format!("inserting preorder: {e}")))?;

        Ok((sepa_ref, refnn))
    }

    /// `get(ref)`: returns the caller-facing KV with names
    /// `Sepa-Ref, Created, Paid, N-Paid, Amount, Currency, Desc, Email` plus
    /// de-serialized `Meta[...]` entries.
    pub fn get(&self, sepa_ref: &str) -> Result<KvList, PayprocError> {
        let conn = self.conn.lock().expect("preorder db lock poisoned");
        let row = conn
            .query_row(
                "SELECT ref, refnn, created, paid, npaid, amount, currency, desc, email, meta
                 FROM preorder WHERE ref = ?1",
                params![sepa_ref],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, Option<String>>(9)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| PayprocError::new(ErrorKind::General, format!("reading preorder: {e}")))?
            .ok_or_else(PayprocError::not_found)?;

        let (sref, _refnn, created, paid, npaid, amount, currency, desc, email, meta) = row;
        let mut out = KvList::new();
        out.put(Name::new("Sepa-Ref")?, sref);
        out.put(Name::new("Created")?, created);
        out.put(Name::new("Paid")?, paid.unwrap_or_default());
        out.put(Name::new("N-Paid")?, npaid.to_string());
        out.put(Name::new("Amount")?, amount);
        out.put(Name::new("Currency")?, currency);
        out.put(Name::new("Desc")?, desc.unwrap_or_default());
        out.put(Name::new("Email")?, email.unwrap_or_default());
        deserialize_meta(&meta.unwrap_or_default(), &mut out)?;
        Ok(out)
    }

    /// `list(refnn|none)`: all rows (optionally filtered by
    /// `refnn`) into `D[0], D[1], …` pipe-delimited rows, `|` escaped as
    /// `=7C`, plus a `Count`.
    pub fn list(&self, refnn: Option<u8>) -> Result<KvList, PayprocError> {
        let conn = self.conn.lock().expect("preorder db lock poisoned");
        let mut stmt = if refnn.is_some() {
            conn.prepare("SELECT ref, created, paid, npaid, amount, currency FROM preorder WHERE refnn = ?1 ORDER BY ref")
        } else {
            conn.prepare("SELECT ref, created, paid, npaid, amount, currency FROM preorder ORDER BY ref")
        }
        .map_err(|e| PayprocError::new(ErrorKind::General, format!("preparing preorder list: {e}")))?;

        let rows = if let Some(refnn) = refnn {
            stmt.query_map(params![refnn], row_to_pipe_line)
        } else {
            stmt.query_map(params![], row_to_pipe_line)
        }
        .map_err(|e| PayprocError::new(ErrorKind::General, format!("listing preorders: {e}")))?;

        let mut out = KvList::new();
        let mut count = 0usize;
        for (i, row) in rows.enumerate() {
            let line = row.map_err(|e| PayprocError::new(ErrorKind::General, format!("reading preorder row: {e}")))?;
            out.put(Name::new(format!("D[{i}]"))?, line);
            count = i + 1;
        }
        out.put(Name::new("Count")?, count.to_string());
        Ok(out)
    }

    /// `update(ref, dict)`: bumps `paid = now`, `npaid += 1`, and
    /// stores `_timestamp` back into `dict` for the caller to relay/journal.
    /// Only the error branch here is ever logged -- logging, if any, is the
    /// caller's responsibility since this returns `Result`.
    pub fn update(&self, sepa_ref: &str, dict: &mut KvList) -> Result<(), PayprocError> {
        let now = sql_datetime_now();
        let conn = self.conn.lock().expect("preorder db lock poisoned");
        let affected = conn
            .execute(
                "UPDATE preorder SET paid = ?1, npaid = npaid + 1 WHERE ref = ?2",
                params![now, sepa_ref],
            )
            .map_err(|e| PayprocError::new(ErrorKind::General, format!("updating preorder: {e}")))?;
        if affected == 0 {
            return Err(PayprocError::not_found());
        }
        dict.put(Name::new("_timestamp")?, crate::journal::new_timestamp());
        Ok(())
    }
}

fn row_to_pipe_line(row: &rusqlite::Row<'_>) -> rusqlite::Result<String> {
    let fields: [String; 6] = [
        row.get::<_, String>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        row.get::<_, i64>(3)?.to_string(),
        row.get::<_, String>(4)?,
        row.get::<_, String>(5)?,
    ];
    Ok(fields.iter().map(|f| f.replace('|', "=7C")).collect::<Vec<_>>().join("|"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict_with(pairs: &[(&str, &str)]) -> KvList {
        let mut kv = KvList::new();
        for (k, v) in pairs {
            kv.put(Name::new(*k).unwrap(), *v);
        }
        kv
    }

    #[test]
    fn store_get_round_trip() {
        let store = PreorderStore::open_in_memory().unwrap();
        let dict = dict_with(&[("Amount", "10.00"), ("Currency", "EUR"), ("Desc", "widget")]);
        let (sepa_ref, refnn) = store.store(&dict).unwrap();
        assert!((10..=99).contains(&refnn));

        let got = store.get(&sepa_ref).unwrap();
        assert_eq!(got.get_str("Amount"), Some("10.00"));
        assert_eq!(got.get_str("Currency"), Some("EUR"));
        assert_eq!(got.get_str("N-Paid"), Some("0"));
    }

    #[test]
    fn update_bumps_paid_and_npaid() {
        let store = PreorderStore::open_in_memory().unwrap();
        let dict = dict_with(&[("Amount", "10.00"), ("Currency", "EUR")]);
        let (sepa_ref, _refnn) = store.store(&dict).unwrap();

        let mut upd = KvList::new();
        store.update(&sepa_ref, &mut upd).unwrap();
        assert!(upd.get_str("_timestamp").is_some());

        let got = store.get(&sepa_ref).unwrap();
        assert_eq!(got.get_str("N-Paid"), Some("1"));
        assert!(!got.get_str("Paid").unwrap().is_empty());
    }

    #[test]
    fn update_missing_ref_is_not_found() {
        let store = PreorderStore::open_in_memory().unwrap();
        let mut upd = KvList::new();
        assert!(store.update("ZZZZZ-99", &mut upd).is_err());
    }

    #[test]
    fn list_produces_distinct_refs() {
        let store = PreorderStore::open_in_memory().unwrap();
        for _ in 0..20 {
            let dict = dict_with(&[("Amount", "1.00"), ("Currency", "EUR")]);
            store.store(&dict).unwrap();
        }
        let listed = store.list(None).unwrap();
        assert_eq!(listed.get_str("Count"), Some("20"));
    }
}
