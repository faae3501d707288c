//! A tiny injectable clock, shared by every subsystem that needs to reason
//! about elapsed wall-clock time without baking a real sleep into its tests:
//! the session store's TTL checks and the PayPal access-token
//! cache's expiry window both take an `Arc<dyn Clock>` rather
//! than calling `SystemTime::now()` directly.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub trait Clock: Send + Sync {
    /// Unix timestamp, in seconds.
    fn now(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs() as i64
    }
}

/// A clock tests can advance deterministically.
pub struct FakeClock(AtomicI64);

impl FakeClock {
    pub fn new(t: i64) -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(t)))
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, t: i64) {
        self.0.store(t, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}
