//! Identifier formats. Each alphabet is reproduced exactly as specified --
//! they deliberately omit visually ambiguous characters, and "close
//! enough" is not close enough here.

use rand::RngCore;

use crate::error::{ErrorKind, PayprocError};

/// Zooko's zbase32 alphabet: 5 bits per symbol, chosen for OCR/phonetic
/// friendliness. Used for session and alias ids.
const ZBASE32_ALPHABET: &[u8; 32] = b"ybndrfg8ejkmcpqxot1uwisza345h769";

/// A session or alias id: 32 zbase32 characters derived from 20 random
/// bytes (160 bits -> 32 * 5-bit symbols exactly).
pub fn generate_session_id(rng: &mut impl RngCore) -> String {
    let mut bytes = [0u8; 20];
    rng.fill_bytes(&mut bytes);
    zbase32_encode(&bytes)
}

fn zbase32_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buf: u32 = 0;
    let mut bits: u32 = 0;
    for &b in bytes {
        buf = (buf << 8) | b as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            let idx = (buf >> bits) & 0x1f;
            out.push(ZBASE32_ALPHABET[idx as usize] as char);
        }
    }
    if bits > 0 {
        let idx = (buf << (5 - bits)) & 0x1f;
        out.push(ZBASE32_ALPHABET[idx as usize] as char);
    }
    out
}

/// Validates a 32-character zbase32 session/alias id.
pub fn validate_session_id(s: &str) -> Result<(), PayprocError> {
    if s.chars().count() != 32 {
        return Err(PayprocError::new(ErrorKind::InvalidLength, "session id must be 32 characters"));
    }
    if !s.bytes().all(|b| ZBASE32_ALPHABET.contains(&b)) {
        return Err(PayprocError::new(ErrorKind::InvalidValue, "session id has invalid characters"));
    }
    Ok(())
}

/// The 31-character account-id alphabet: `0-9 a b c d e f g h k m n p q r s
/// t u w x y z` (omits `i j l o v`, the letters most easily confused with
/// digits or each other).
const ACCOUNT_ID_ALPHABET: &[u8; 31] = b"0123456789abcdefghkmnpqrstuwxyz";

/// An account id: literal `A` followed by 14 symbols from
/// [`ACCOUNT_ID_ALPHABET`], derived from a 14-byte random nonce reduced
/// modulo 31 per byte.
pub fn generate_account_id(rng: &mut impl RngCore) -> String {
    let mut bytes = [0u8; 14];
    rng.fill_bytes(&mut bytes);
    let mut out = String::with_capacity(15);
    out.push('A');
    for b in bytes {
        out.push(ACCOUNT_ID_ALPHABET[(b as usize) % ACCOUNT_ID_ALPHABET.len()] as char);
    }
    out
}

pub fn validate_account_id(s: &str) -> Result<(), PayprocError> {
    if s.len() != 15 {
        return Err(PayprocError::new(ErrorKind::InvalidLength, "account id must be 15 characters"));
    }
    if !s.starts_with('A') {
        return Err(PayprocError::new(ErrorKind::InvalidValue, "account id must start with 'A'"));
    }
    if !s[1..].bytes().all(|b| ACCOUNT_ID_ALPHABET.contains(&b)) {
        return Err(PayprocError::new(ErrorKind::InvalidValue, "account id has invalid characters"));
    }
    Ok(())
}

/// The SEPA-ref body alphabet: `A B C D E G H J K L N R S T W X Y Z 0-9` (28
/// characters). The first character of a ref is additionally restricted to
/// the 18 letters in this set (no leading digit).
const SEPA_REF_ALPHABET: &[u8; 28] = b"ABCDEGHJKLNRSTWXYZ0123456789";
const SEPA_REF_FIRST_CHARS: &[u8; 18] = b"ABCDEGHJKLNRSTWXYZ";

/// A SEPA-ref: 5 characters from [`SEPA_REF_ALPHABET`] (first restricted to
/// [`SEPA_REF_FIRST_CHARS`]), a literal `-`, and a 2-digit check suffix in
/// `[10, 99]`. The suffix (`refnn`) is generated and returned separately
/// since the preorder store persists it in its own column.
pub fn generate_sepa_ref(rng: &mut impl RngCore) -> (String, u8) {
    let mut body = String::with_capacity(5);
    body.push(SEPA_REF_FIRST_CHARS[(rng.next_u32() as usize) % SEPA_REF_FIRST_CHARS.len()] as char);
    for _ in 0..4 {
        body.push(SEPA_REF_ALPHABET[(rng.next_u32() as usize) % SEPA_REF_ALPHABET.len()] as char);
    }
    let refnn = 10 + (rng.next_u32() % 90) as u8;
    (format!("{body}-{refnn:02}"), refnn)
}

/// Splits and validates a `ref-nn` SEPA-ref string, returning the 5-char
/// body and the 2-digit `refnn` suffix.
pub fn parse_sepa_ref(s: &str) -> Result<(&str, u8), PayprocError> {
    let (body, suffix) = s
        .split_once('-')
        .ok_or_else(|| PayprocError::new(ErrorKind::InvalidValue, "malformed SEPA-ref"))?;
    if body.len() != 5 {
        return Err(PayprocError::new(ErrorKind::InvalidLength, "SEPA-ref body must be 5 characters"));
    }
    let mut chars = body.bytes();
    let first = chars.next().unwrap();
    if !SEPA_REF_FIRST_CHARS.contains(&first) {
        return Err(PayprocError::new(ErrorKind::InvalidValue, "SEPA-ref first character invalid"));
    }
    if !chars.all(|b| SEPA_REF_ALPHABET.contains(&b)) {
        return Err(PayprocError::new(ErrorKind::InvalidValue, "SEPA-ref contains invalid characters"));
    }
    if suffix.len() != 2 {
        return Err(PayprocError::new(ErrorKind::InvalidLength, "SEPA-ref suffix must be 2 digits"));
    }
    let refnn: u8 = suffix
        .parse()
        .map_err(|_| PayprocError::new(ErrorKind::InvalidValue, "SEPA-ref suffix must be numeric"))?;
    if !(10..=99).contains(&refnn) {
        return Err(PayprocError::new(ErrorKind::InvalidValue, "SEPA-ref suffix out of range"));
    }
    Ok((body, refnn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn session_id_is_32_chars_from_alphabet() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            let id = generate_session_id(&mut rng);
            assert_eq!(id.len(), 32);
            validate_session_id(&id).unwrap();
        }
    }

    #[test]
    fn account_id_round_trips() {
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..100 {
            let id = generate_account_id(&mut rng);
            validate_account_id(&id).unwrap();
        }
    }

    #[test]
    fn sepa_ref_round_trips() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..1000 {
            let (r, refnn) = generate_sepa_ref(&mut rng);
            let (_body, parsed_refnn) = parse_sepa_ref(&r).unwrap();
            assert_eq!(parsed_refnn, refnn);
            assert!((10..=99).contains(&refnn));
        }
    }

    #[test]
    fn sepa_ref_rejects_malformed() {
        assert!(parse_sepa_ref("ABCDE10").is_err());
        assert!(parse_sepa_ref("1BCDE-10").is_err());
        assert!(parse_sepa_ref("ABCDE-09").is_err());
        assert!(parse_sepa_ref("ABCDE-100").is_err());
    }
}
