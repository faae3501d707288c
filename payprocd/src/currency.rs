//! The mutable, hourly-refreshed exchange-rate table. Static
//! per-currency metadata (decimal digits, descriptions) lives in
//! `payproc_api_core::currency`; this module adds the rate-to-euro map that
//! housekeeping refreshes periodically from a configured source.

use std::collections::HashMap;

use payproc_api_core::currency::{self, CurrencyMeta};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// A single lock for the rate map ("Currency table: one lock for
/// the rate map"). `RwLock` rather than `Mutex` since reads (every amount
/// conversion) vastly outnumber the hourly refresh write.
pub struct CurrencyTable {
    rates_to_euro: RwLock<HashMap<&'static str, f64>>,
}

impl CurrencyTable {
    /// EUR always maps to itself; everything else starts unset until the
    /// first refresh succeeds.
    pub fn new() -> Self {
        let mut rates = HashMap::new();
        rates.insert("EUR", 1.0);
        Self { rates_to_euro: RwLock::new(rates) }
    }

    pub fn lookup(&self, code: &str) -> Option<&'static CurrencyMeta> {
        currency::lookup(code)
    }

    pub async fn rate_to_euro(&self, code: &str) -> Option<f64> {
        self.rates_to_euro.read().await.get(code).copied()
    }

    /// `convert_currency(cents, curr)`: the Euro amount as a
    /// decimal string, or the empty string if the rate is unknown or the
    /// conversion otherwise fails.
    pub async fn convert_to_euro(&self, minor: i64, decdigits: u32, code: &str) -> String {
        match self.rate_to_euro(code).await {
            Some(rate) => currency::convert_to_euro(minor, decdigits, rate),
            None => String::new(),
        }
    }

    /// Refreshes every non-EUR rate from `source`. Run by housekeeping on an
    /// hourly timer. A failed fetch logs a warning and keeps the
    /// previous rates rather than clearing them -- a stale rate is less
    /// harmful than `CHECKAMOUNT`'s `Euro?` field going empty for everyone.
    pub async fn refresh<F, Fut>(&self, source: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<HashMap<String, f64>>>,
    {
        match source().await {
            Ok(fresh) => {
                let mut rates = self.rates_to_euro.write().await;
                for (code, rate) in fresh {
                    if let Some(code) = currency::lookup(&code).map(|m| m.code) {
                        rates.insert(code, rate);
                    }
                }
                info!(count = rates.len(), "refreshed currency rate table");
            }
            Err(e) => warn!(error = %e, "currency rate refresh failed; keeping previous rates"),
        }
    }
}

impl Default for CurrencyTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn eur_rate_is_one_by_default() {
        let table = CurrencyTable::new();
        assert_eq!(table.rate_to_euro("EUR").await, Some(1.0));
        assert_eq!(table.rate_to_euro("USD").await, None);
    }

    #[tokio::test]
    async fn refresh_populates_known_currencies_only() {
        let table = CurrencyTable::new();
        table
            .refresh(|| async {
                let mut m = HashMap::new();
                m.insert("usd".to_owned(), 1.08);
                m.insert("XXX".to_owned(), 2.0);
                Ok(m)
            })
            .await;
        assert_eq!(table.rate_to_euro("USD").await, Some(1.08));
        assert_eq!(table.rate_to_euro("XXX").await, None);
    }
}
