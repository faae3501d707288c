//! The in-memory session store: sessions keyed by a
//! 32-character zbase32 id, each with up to three aliases, a bounded
//! lifetime, and a single coarse lock.

use std::collections::HashMap;
use std::sync::Arc;

use payproc_api_core::clock::{Clock, SystemClock};
use payproc_api_core::error::{ErrorKind, PayprocError};
use payproc_api_core::ids;
use payproc_api_core::kv::{KvList, Name};
use rand::rngs::OsRng;
use tokio::sync::Mutex;

/// `accessed + ttl_seconds < now` or `created + MAX_LIFETIME < now` means
/// expired.
pub const MAX_LIFETIME_SECS: i64 = 6 * 3600;
pub const DEFAULT_TTL_SECS: i64 = 1800;
pub const MAX_SESSIONS: usize = 65_536;
pub const MAX_ALIASES_PER_SESSION: usize = 3;

pub struct Session {
    pub created: i64,
    pub accessed: i64,
    pub ttl_seconds: i64,
    pub dict: KvList,
    pub aliases: Vec<String>,
}

impl Session {
    fn is_expired(&self, now: i64) -> bool {
        self.accessed + self.ttl_seconds < now || self.created + MAX_LIFETIME_SECS < now
    }
}

#[derive(Default)]
struct SessionTables {
    sessions: HashMap<String, Session>,
    /// alias id -> session id. Destroying a session destroys all aliases
    /// pointing to it; destroying an alias never touches the
    /// session.
    aliases: HashMap<String, String>,
}

/// The "first two base32 digits" bucket a session/alias id falls in, kept
/// only as a sweep-granularity concept for `housekeeping`; the digit index
/// is clamped into `0..=31` since the alphabet has exactly 32 symbols.
/// Lookups themselves go through the `HashMap`s above, not this bucketing.
pub fn bucket_of(id: &str) -> (u8, u8) {
    let bytes = id.as_bytes();
    let digit = |b: u8| -> u8 {
        const ALPHABET: &[u8; 32] = b"ybndrfg8ejkmcpqxot1uwisza345h769";
        ALPHABET.iter().position(|&c| c == b).unwrap_or(0) as u8
    };
    let d0 = bytes.first().copied().map(digit).unwrap_or(0).min(31);
    let d1 = bytes.get(1).copied().map(digit).unwrap_or(0).min(31);
    (d0, d1)
}

pub struct SessionStore {
    tables: Mutex<SessionTables>,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { tables: Mutex::new(SessionTables::default()), clock }
    }

    pub fn with_system_clock() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// `create(ttl, dict) -> sessid`. Copies only non-empty
    /// values from `dict`.
    pub async fn create(&self, ttl: Option<i64>, dict: KvList) -> Result<String, PayprocError> {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;
        if tables.sessions.len() >= MAX_SESSIONS {
            return Err(PayprocError::new(ErrorKind::LimitReached, "session store is full"));
        }
        let mut rng = OsRng;
        let sessid = loop {
            let candidate = ids::generate_session_id(&mut rng);
            if !tables.sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let mut owned = KvList::new();
        for (name, value) in dict.iter() {
            if !value.is_empty() {
                owned.put(name.clone(), value);
            }
        }
        let ttl_seconds = ttl.unwrap_or(DEFAULT_TTL_SECS).min(MAX_LIFETIME_SECS);
        tables.sessions.insert(
            sessid.clone(),
            Session { created: now, accessed: now, ttl_seconds, dict: owned, aliases: Vec::new() },
        );
        Ok(sessid)
    }

    /// `destroy(sessid)`: removes the session and all its
    /// aliases. Idempotent: destroying an unknown session returns `NotFound`.
    pub async fn destroy(&self, sessid: &str) -> Result<(), PayprocError> {
        let mut tables = self.tables.lock().await;
        let Some(session) = tables.sessions.remove(sessid) else {
            return Err(PayprocError::not_found());
        };
        for alias in session.aliases {
            tables.aliases.remove(&alias);
        }
        Ok(())
    }

    /// `get(sessid, &dict)`: checks TTL, updates `accessed`, returns a copy
    /// of the session's KV dict.
    pub async fn get(&self, sessid: &str) -> Result<KvList, PayprocError> {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;
        let session = Self::live_session_mut(&mut tables, sessid, now)?;
        session.accessed = now;
        Ok(session.dict.clone())
    }

    /// `put(sessid, dict)`: checks TTL, updates `accessed`, upserts each
    /// entry (empty value deletes).
    pub async fn put(&self, sessid: &str, dict: KvList) -> Result<(), PayprocError> {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;
        let session = Self::live_session_mut(&mut tables, sessid, now)?;
        session.accessed = now;
        for (name, value) in dict.iter() {
            session.dict.put(name.clone(), value);
        }
        Ok(())
    }

    /// `create_alias(sessid) -> aliasid`, capped at
    /// [`MAX_ALIASES_PER_SESSION`].
    pub async fn create_alias(&self, sessid: &str) -> Result<String, PayprocError> {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;
        {
            let session = Self::live_session_mut(&mut tables, sessid, now)?;
            if session.aliases.len() >= MAX_ALIASES_PER_SESSION {
                return Err(PayprocError::new(ErrorKind::LimitReached, "alias limit reached for session"));
            }
        }
        let mut rng = OsRng;
        let aliasid = loop {
            let candidate = ids::generate_session_id(&mut rng);
            if !tables.aliases.contains_key(&candidate) {
                break candidate;
            }
        };
        tables.aliases.insert(aliasid.clone(), sessid.to_owned());
        tables.sessions.get_mut(sessid).expect("checked above").aliases.push(aliasid.clone());
        Ok(aliasid)
    }

    pub async fn destroy_alias(&self, aliasid: &str) -> Result<(), PayprocError> {
        let mut tables = self.tables.lock().await;
        let Some(sessid) = tables.aliases.remove(aliasid) else {
            return Err(PayprocError::not_found());
        };
        if let Some(session) = tables.sessions.get_mut(&sessid) {
            session.aliases.retain(|a| a != aliasid);
        }
        Ok(())
    }

    /// `get_sessid(aliasid) -> sessid`. Does not prolong the session.
    pub async fn get_sessid(&self, aliasid: &str) -> Result<String, PayprocError> {
        let now = self.clock.now();
        let tables = self.tables.lock().await;
        let sessid = tables.aliases.get(aliasid).cloned().ok_or_else(PayprocError::not_found)?;
        match tables.sessions.get(&sessid) {
            Some(session) if !session.is_expired(now) => Ok(sessid),
            _ => Err(PayprocError::not_found()),
        }
    }

    /// Sweeps every session, destroying (with their aliases) any that have
    /// expired. Run periodically by housekeeping.
    pub async fn housekeeping(&self) -> usize {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;
        let expired: Vec<String> = tables
            .sessions
            .iter()
            .filter(|(_, s)| s.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for sessid in &expired {
            if let Some(session) = tables.sessions.remove(sessid) {
                for alias in session.aliases {
                    tables.aliases.remove(&alias);
                }
            }
        }
        expired.len()
    }

    /// Looks up `sessid`, treating an expired entry as absent and evicting
    /// it eagerly (rather than waiting for the next housekeeping sweep).
    fn live_session_mut<'a>(
        tables: &'a mut SessionTables,
        sessid: &str,
        now: i64,
    ) -> Result<&'a mut Session, PayprocError> {
        if let Some(session) = tables.sessions.get(sessid) {
            if session.is_expired(now) {
                if let Some(session) = tables.sessions.remove(sessid) {
                    for alias in session.aliases {
                        tables.aliases.remove(&alias);
                    }
                }
                return Err(PayprocError::not_found());
            }
        } else {
            return Err(PayprocError::not_found());
        }
        Ok(tables.sessions.get_mut(sessid).expect("checked above"))
    }
}

/// Returns the session's internal `_amount`-style working fields as wire
/// entries, filtering names the wire allow-list does not permit.
pub fn filter_wire_allowed(dict: &KvList) -> Vec<(Name, String)> {
    dict.iter()
        .filter(|(name, _)| name.is_wire_allowed())
        .map(|(name, value)| (name.clone(), value.to_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use payproc_api_core::clock::FakeClock;

    #[tokio::test]
    async fn create_get_put_destroy_round_trip() {
        let store = SessionStore::with_system_clock();
        let mut dict = KvList::new();
        dict.insert(Name::new("Name").unwrap(), "Bob").unwrap();
        let sessid = store.create(Some(60), dict).await.unwrap();
        assert_eq!(sessid.len(), 32);

        let got = store.get(&sessid).await.unwrap();
        assert_eq!(got.get_str("Name"), Some("Bob"));

        let mut upd = KvList::new();
        upd.insert(Name::new("Name").unwrap(), "Carol").unwrap();
        store.put(&sessid, upd).await.unwrap();
        let got = store.get(&sessid).await.unwrap();
        assert_eq!(got.get_str("Name"), Some("Carol"));

        store.destroy(&sessid).await.unwrap();
        assert!(store.get(&sessid).await.is_err());
    }

    #[tokio::test]
    async fn ttl_expiry_evicts_session() {
        let clock = FakeClock::new(1_000);
        let store = SessionStore::new(clock.clone());
        let sessid = store.create(Some(10), KvList::new()).await.unwrap();
        clock.advance(11);
        assert!(matches!(store.get(&sessid).await, Err(e) if matches!(e.kind, ErrorKind::NotFound)));
    }

    #[tokio::test]
    async fn max_lifetime_caps_long_ttl() {
        let clock = FakeClock::new(0);
        let store = SessionStore::new(clock.clone());
        let sessid = store.create(Some(1_000_000), KvList::new()).await.unwrap();
        clock.advance(MAX_LIFETIME_SECS + 1);
        assert!(store.get(&sessid).await.is_err());
    }

    #[tokio::test]
    async fn alias_cap_is_three() {
        let store = SessionStore::with_system_clock();
        let sessid = store.create(None, KvList::new()).await.unwrap();
        for _ in 0..MAX_ALIASES_PER_SESSION {
            store.create_alias(&sessid).await.unwrap();
        }
        assert!(store.create_alias(&sessid).await.is_err());
    }

    #[tokio::test]
    async fn destroying_session_destroys_aliases() {
        let store = SessionStore::with_system_clock();
        let sessid = store.create(None, KvList::new()).await.unwrap();
        let aliasid = store.create_alias(&sessid).await.unwrap();
        store.destroy(&sessid).await.unwrap();
        assert!(store.get_sessid(&aliasid).await.is_err());
    }
}
