//! The shared daemon context: every store, adapter, and piece of
//! configuration a connection handler needs, bundled behind `Arc` so each
//! connection task gets a cheap clone rather than a reference with a
//! lifetime tied to the accept loop.

use std::collections::HashSet;
use std::sync::Arc;

use payproc_api_core::clock::SystemClock;
use payproc_crypto::Keys;
use payproc_tokio::NotifyOnce;

use crate::account::AccountStore;
use crate::currency::CurrencyTable;
use crate::gateway::paypal::PaypalClient;
use crate::gateway::stripe::StripeClient;
use crate::journal::Journal;
use crate::preorder::PreorderStore;
use crate::session::SessionStore;

/// Configuration that survives past `main`'s CLI parsing -- the uid
/// allow-lists and the live/test mode flag.
pub struct Config {
    /// Empty means "unrestricted": every uid may issue ordinary commands.
    /// An empty allow-list is the natural "no restriction configured"
    /// default for a daemon meant to run with a known, cooperating set of
    /// local clients. See `DESIGN.md`.
    pub allow_uid: HashSet<u32>,
    /// Empty means "nobody": `SHUTDOWN` is refused by default rather than
    /// silently open to every local uid, the safer fail-closed default
    /// for an admin-gated command. See `DESIGN.md`.
    pub admin_uid: HashSet<u32>,
    pub live: bool,
}

pub struct Context {
    pub config: Config,
    pub sessions: SessionStore,
    pub preorders: PreorderStore,
    pub accounts: AccountStore,
    pub journal: Journal,
    pub currency: CurrencyTable,
    pub stripe: StripeClient,
    pub paypal: PaypalClient,
    pub keys: Keys,
    pub shutdown: NotifyOnce,
}

impl Context {
    pub fn new(
        config: Config,
        preorders: PreorderStore,
        accounts: AccountStore,
        journal: Journal,
        stripe: StripeClient,
        paypal: PaypalClient,
        keys: Keys,
        shutdown: NotifyOnce,
    ) -> Self {
        Self {
            config,
            sessions: SessionStore::new(Arc::new(SystemClock)),
            preorders,
            accounts,
            journal,
            currency: CurrencyTable::new(),
            stripe,
            paypal,
            keys,
            shutdown,
        }
    }

    /// Whether `uid` may issue ordinary service commands.
    pub fn is_allowed(&self, uid: u32) -> bool {
        self.config.allow_uid.is_empty() || self.config.allow_uid.contains(&uid)
    }

    /// Whether `uid` may issue admin-gated commands (`SHUTDOWN`).
    pub fn is_admin(&self, uid: u32) -> bool {
        !self.config.admin_uid.is_empty() && self.config.admin_uid.contains(&uid)
    }
}
