//! SEPA-ref collision retry: id *generation* lives in
//! `payproc_api_core::ids`; this module is only the store-level "keep
//! drawing until the primary key is free, give up after 11 000 tries"
//! policy.

use payproc_api_core::error::{ErrorKind, PayprocError};
use payproc_api_core::ids;
use rand::RngCore;

pub const MAX_ATTEMPTS: u32 = 11_000;

/// Draws candidate SEPA-refs via `generate`, calling `exists` to probe the
/// store, until one is free or [`MAX_ATTEMPTS`] is exhausted.
pub fn allocate<R, E>(
    rng: &mut R,
    mut exists: impl FnMut(&str) -> Result<bool, E>,
) -> Result<(String, u8), PayprocError>
where
    R: RngCore,
    E: std::fmt::Display,
{
    for _ in 0..MAX_ATTEMPTS {
        let (candidate, refnn) = ids::generate_sepa_ref(rng);
        match exists(&candidate) {
            Ok(true) => continue,
            Ok(false) => return Ok((candidate, refnn)),
            Err(e) => return Err(PayprocError::new(ErrorKind::General, format!("checking SEPA-ref uniqueness: {e}"))),
        }
    }
    Err(PayprocError::new(ErrorKind::General, "exhausted SEPA-ref collision retry budget"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn allocates_first_free_candidate() {
        let mut rng = rand::rngs::mock::StepRng::new(0, 1);
        let taken: HashSet<String> = HashSet::new();
        let (r, refnn) = allocate::<_, std::convert::Infallible>(&mut rng, |c| Ok(taken.contains(c))).unwrap();
        assert_eq!(r.len(), 8);
        assert!((10..=99).contains(&refnn));
    }

    #[test]
    fn gives_up_after_budget_exhausted() {
        let mut rng = rand::rngs::mock::StepRng::new(0, 1);
        let result = allocate::<_, std::convert::Infallible>(&mut rng, |_| Ok(true));
        assert!(result.is_err());
    }
}
