//! Currency metadata and decimal/minor-unit amount conversion.
//! The mutable, hourly-refreshed exchange-rate table lives in
//! `payprocd::currency::CurrencyTable`, which is built on top of the static
//! data and pure conversion functions here.

use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error::{ErrorKind, PayprocError};

/// Static per-currency metadata: a human description and the number of
/// decimal digits in its minor unit ("JPY 0, EUR/USD/GBP 2").
#[derive(Debug, Clone, Copy)]
pub struct CurrencyMeta {
    pub code: &'static str,
    pub description: &'static str,
    pub decdigits: u32,
}

/// The fixed set of currencies payproc understands out of the box. The
/// exchange rate to EUR is *not* part of this static table -- it is
/// maintained separately by `payprocd::currency::CurrencyTable` and
/// refreshed hourly by housekeeping.
pub const CURRENCIES: &[CurrencyMeta] = &[
    CurrencyMeta { code: "EUR", description: "Euro", decdigits: 2 },
    CurrencyMeta { code: "USD", description: "US Dollar", decdigits: 2 },
    CurrencyMeta { code: "GBP", description: "Pound Sterling", decdigits: 2 },
    CurrencyMeta { code: "CHF", description: "Swiss Franc", decdigits: 2 },
    CurrencyMeta { code: "CAD", description: "Canadian Dollar", decdigits: 2 },
    CurrencyMeta { code: "AUD", description: "Australian Dollar", decdigits: 2 },
    CurrencyMeta { code: "SEK", description: "Swedish Krona", decdigits: 2 },
    CurrencyMeta { code: "NOK", description: "Norwegian Krone", decdigits: 2 },
    CurrencyMeta { code: "DKK", description: "Danish Krone", decdigits: 2 },
    CurrencyMeta { code: "PLN", description: "Polish Zloty", decdigits: 2 },
    CurrencyMeta { code: "CZK", description: "Czech Koruna", decdigits: 2 },
    CurrencyMeta { code: "JPY", description: "Japanese Yen", decdigits: 0 },
];

pub fn lookup(code: &str) -> Option<&'static CurrencyMeta> {
    CURRENCIES.iter().find(|c| c.code.eq_ignore_ascii_case(code))
}

pub fn validate_code(code: &str) -> Result<String, PayprocError> {
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(PayprocError::new(ErrorKind::InvalidValue, "currency code must be 3 letters"));
    }
    let upper = code.to_ascii_uppercase();
    lookup(&upper).ok_or_else(|| PayprocError::new(ErrorKind::InvalidValue, format!("unknown currency '{upper}'")))?;
    Ok(upper)
}

/// Parses a decimal amount string matching `[+]?\d+(\.\d{0,decdigits})?` and
/// converts it to an integer count of minor units. Overflow and excess
/// fractional digits are treated as conversion failures, not rounding.
pub fn to_minor_units(amount: &str, decdigits: u32) -> Option<i64> {
    let s = amount.strip_prefix('+').unwrap_or(amount);
    if s.is_empty() {
        return None;
    }
    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if frac_part.len() > decdigits as usize || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let scale = 10i64.checked_pow(decdigits)?;
    let int_val: i64 = int_part.parse().ok()?;
    let int_minor = int_val.checked_mul(scale)?;

    let frac_minor: i64 = if frac_part.is_empty() {
        0
    } else {
        let padded_scale = 10i64.checked_pow(decdigits - frac_part.len() as u32)?;
        let frac_val: i64 = frac_part.parse().ok()?;
        frac_val.checked_mul(padded_scale)?
    };

    int_minor.checked_add(frac_minor)
}

/// The inverse of [`to_minor_units`]: renders a minor-unit integer as a
/// canonical decimal string with exactly `decdigits` fractional digits (or
/// none, if `decdigits == 0`).
pub fn from_minor_units(minor: i64, decdigits: u32) -> String {
    if decdigits == 0 {
        return minor.to_string();
    }
    let scale = 10i64.pow(decdigits);
    let sign = if minor < 0 { "-" } else { "" };
    let minor_abs = minor.unsigned_abs();
    let scale_abs = scale as u64;
    let int_part = minor_abs / scale_abs;
    let frac_part = minor_abs % scale_abs;
    format!("{sign}{int_part}.{frac_part:0width$}", width = decdigits as usize)
}

/// Re-renders `amount` into its canonical decimal form for the given
/// currency.
pub fn canonicalize(amount: &str, decdigits: u32) -> Option<String> {
    to_minor_units(amount, decdigits).map(|minor| from_minor_units(minor, decdigits))
}

/// Converts a minor-units amount in `curr` to a Euro decimal amount string
/// given `rate_to_euro` (amount_in_curr / rate = amount_in_eur, i.e. rate is
/// "units of `curr` per Euro"). Returns the empty string on any failure.
pub fn convert_to_euro(minor: i64, decdigits: u32, rate_to_euro: f64) -> String {
    if rate_to_euro <= 0.0 {
        return String::new();
    }
    let Some(amount) = Decimal::from_str(&from_minor_units(minor, decdigits)).ok() else {
        return String::new();
    };
    let Some(rate) = Decimal::try_from(rate_to_euro).ok() else {
        return String::new();
    };
    let euros = amount / rate;
    euros.round_dp(2).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn basic_conversion() {
        assert_eq!(to_minor_units("10.00", 2), Some(1000));
        assert_eq!(to_minor_units("10", 2), Some(1000));
        assert_eq!(to_minor_units("10.5", 2), Some(1050));
        assert_eq!(to_minor_units("0.01", 2), Some(1));
        assert_eq!(to_minor_units("100", 0), Some(100));
    }

    #[test]
    fn rejects_excess_fraction() {
        assert_eq!(to_minor_units("1.999", 2), None);
    }

    #[test]
    fn rejects_overflow() {
        assert_eq!(to_minor_units("99999999999999999999", 2), None);
    }

    #[test]
    fn from_minor_units_formats() {
        assert_eq!(from_minor_units(1050, 2), "10.50");
        assert_eq!(from_minor_units(5, 2), "0.05");
        assert_eq!(from_minor_units(100, 0), "100");
    }

    proptest! {
        // reconvert(convert(s, d), d) == canonical(s).
        #[test]
        fn round_trip(int_part in 0u32..1_000_000, frac in 0u32..100, decdigits in 0u32..3) {
            let frac_str = format!("{:0width$}", frac % 10u32.pow(decdigits.max(1)), width = decdigits as usize);
            let s = if decdigits == 0 {
                int_part.to_string()
            } else {
                format!("{int_part}.{frac_str}")
            };
            if let Some(minor) = to_minor_units(&s, decdigits) {
                let back = from_minor_units(minor, decdigits);
                let re_minor = to_minor_units(&back, decdigits).unwrap();
                prop_assert_eq!(minor, re_minor);
            }
        }
    }
}
