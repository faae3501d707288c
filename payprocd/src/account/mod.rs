//! The SQL-backed account store: customer-facing account
//! records, with `stripe_cus`/`meta` encrypted at rest via `payproc-crypto`.

use std::sync::Mutex;

use payproc_api_core::error::{ErrorKind, PayprocError};
use payproc_api_core::ids;
use payproc_api_core::kv::{KvList, Name};
use payproc_crypto::{EncryptFlags, Keys};
use rand::rngs::OsRng;
use rusqlite::{params, Connection, OptionalExtension};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS account (
    account_id TEXT PRIMARY KEY,
    created    TEXT NOT NULL,
    updated    TEXT NOT NULL,
    email      TEXT,
    verified   INTEGER NOT NULL DEFAULT 0,
    stripe_cus TEXT,
    meta       TEXT
);
"#;

const MAX_ID_ATTEMPTS: u32 = 1_000;

pub struct AccountStore {
    conn: Mutex<Connection>,
}

impl AccountStore {
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

    /// Creates a fresh account, retrying the id on primary-key collision.
    /// `email` may be empty.
    pub fn create(&self, email: Option<&str>) -> Result<String, PayprocError> {
        let now = super::preorder::sql_datetime_now();
        let conn = self.conn.lock().expect("account db lock poisoned");
        let mut rng = OsRng;

        for _ in 0..MAX_ID_ATTEMPTS {
            let account_id = ids::generate_account_id(&mut rng);
            let exists = conn
                .query_row("SELECT 1 FROM account WHERE account_id = ?1", params![account_id], |_| Ok(()))
                .optional()
                .map_err(|e| PayprocError::new(ErrorKind::General, format!("checking account id: {e}")))?
                .is_some();
            if exists {
                continue;
            }
            conn.execute(
                "INSERT INTO account (account_id, created, updated, email, verified) VALUES (?1, ?2, ?2, ?3, 0)",
                params![account_id, now, email],
            )
            .map_err(|e| PayprocError::new(ErrorKind::General, format!("inserting account: {e}")))?;
            return Ok(account_id);
        }
        Err(PayprocError::new(ErrorKind::General, "exhausted account id collision retry budget"))
    }

    /// Encrypts `stripe_cus` with `keys` (targeting both the database and
    /// back-office keys) and binds it to `account_id`. Returns `NotFound` if
    /// the account does not exist.
    pub fn set_stripe_customer(&self, account_id: &str, stripe_cus: &str, keys: &Keys) -> Result<(), PayprocError> {
        let ciphertext = keys
            .encrypt_string(stripe_cus, EncryptFlags::DATABASE | EncryptFlags::BACKOFFICE)
            .map_err(PayprocError::from)?;
        let now = super::preorder::sql_datetime_now();
        let conn = self.conn.lock().expect("account db lock poisoned");
        let affected = conn
            .execute(
                "UPDATE account SET stripe_cus = ?1, updated = ?2 WHERE account_id = ?3",
                params![ciphertext, now, account_id],
            )
            .map_err(|e| PayprocError::new(ErrorKind::General, format!("updating account: {e}")))?;
        if affected == 0 {
            return Err(PayprocError::not_found());
        }
        Ok(())
    }

    /// Updates the account's `meta` (www-form-encoded, same as preorder's
    /// meta) and encrypts it with `keys`. `NotFound` if the
    /// account does not exist.
    pub fn update_meta(&self, account_id: &str, dict: &KvList, keys: &Keys) -> Result<(), PayprocError> {
        let encoded = crate::preorder::serialize_meta(dict);
        let ciphertext = keys
            .encrypt_string(&encoded, EncryptFlags::DATABASE | EncryptFlags::BACKOFFICE)
            .map_err(PayprocError::from)?;
        let now = super::preorder::sql_datetime_now();
        let conn = self.conn.lock().expect("account db lock poisoned");
        let affected = conn
            .execute(
                "UPDATE account SET meta = ?1, updated = ?2 WHERE account_id = ?3",
                params![ciphertext, now, account_id],
            )
            .map_err(|e| PayprocError::new(ErrorKind::General, format!("updating account meta: {e}")))?;
        if affected == 0 {
            return Err(PayprocError::not_found());
        }
        Ok(())
    }

    pub fn get(&self, account_id: &str, keys: &Keys) -> Result<KvList, PayprocError> {
        let conn = self.conn.lock().expect("account db lock poisoned");
        let row = conn
            .query_row(
                "SELECT account_id, created, updated, email, verified, stripe_cus, meta
                 FROM account WHERE account_id = ?1",
                params![account_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| PayprocError::new(ErrorKind::General, format!("reading account: {e}")))?
            .ok_or_else(PayprocError::not_found)?;

        let (id, created, updated, email, verified, stripe_cus, meta) = row;
        let mut out = KvList::new();
        out.put(Name::new("Account-Id")?, id);
        out.put(Name::new("Created")?, created);
        out.put(Name::new("Updated")?, updated);
        out.put(Name::new("Email")?, email.unwrap_or_default());
        out.put(Name::new("Verified")?, if verified != 0 { "t" } else { "f" });
        if let Some(ciphertext) = stripe_cus {
            if !ciphertext.is_empty() {
                let plain = keys.decrypt_string(&ciphertext).map_err(PayprocError::from)?;
                out.put(Name::new("_Stripe-Cus")?, plain);
            }
        }
        if let Some(ciphertext) = meta {
            if !ciphertext.is_empty() {
                let plain = keys.decrypt_string(&ciphertext).map_err(PayprocError::from)?;
                crate::preorder::deserialize_meta(&plain, &mut out)?;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequoia_openpgp::cert::CertBuilder;

    fn test_keys() -> Keys {
        let (cert, _rev) = CertBuilder::general_purpose(None, Some("payproc test <test@example.com>"))
            .generate()
            .unwrap();
        Keys::new(cert, None).unwrap()
    }

    #[test]
    fn create_account_generates_valid_id() {
        let store = AccountStore::open_in_memory().unwrap();
        let account_id = store.create(Some("a@b.com")).unwrap();
        ids::validate_account_id(&account_id).unwrap();
    }

    #[test]
    fn stripe_customer_round_trips_through_encryption() {
        let store = AccountStore::open_in_memory().unwrap();
        let keys = test_keys();
        let account_id = store.create(None).unwrap();
        store.set_stripe_customer(&account_id, "cus_123", &keys).unwrap();

        let got = store.get(&account_id, &keys).unwrap();
        assert_eq!(got.get_str("_Stripe-Cus"), Some("cus_123"));
    }

    #[test]
    fn update_missing_account_is_not_found() {
        let store = AccountStore::open_in_memory().unwrap();
        let keys = test_keys();
        assert!(store.set_stripe_customer("Annnnnnnnnnnnn", "cus_x", &keys).is_err());
    }
}
