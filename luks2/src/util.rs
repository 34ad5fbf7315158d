//! Integer safety, constant-time helpers and size parsing.

use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

/// Convert a `u64` offset or size to `usize`, failing on narrowing.
pub fn to_usize(v: u64) -> Result<usize> {
    usize::try_from(v).map_err(|_| Error::IntegerOverflow)
}

/// Convert a `usize` length to `u64`, failing on narrowing.
pub fn to_u64(v: usize) -> Result<u64> {
    u64::try_from(v).map_err(|_| Error::IntegerOverflow)
}

/// Multiply two `u64` values, failing on overflow.
pub fn mul_u64(a: u64, b: u64) -> Result<u64> {
    a.checked_mul(b).ok_or(Error::IntegerOverflow)
}

/// Add two `u64` values, failing on overflow.
pub fn add_u64(a: u64, b: u64) -> Result<u64> {
    a.checked_add(b).ok_or(Error::IntegerOverflow)
}

/// Round `v` up to the next multiple of `align` (a power of two).
pub fn align_up(v: u64, align: u64) -> Result<u64> {
    debug_assert!(align.is_power_of_two());
    add_u64(v, align - 1).map(|n| n & !(align - 1))
}

/// Compare two byte slices in constant time. Slices of different
/// lengths compare unequal without inspecting contents.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Fill a buffer with cryptographically secure random bytes.
pub fn random_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Parse a decimal size with an optional K/M/G/T binary suffix.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::InvalidSize);
    }
    let (digits, shift) = match s.as_bytes()[s.len() - 1].to_ascii_uppercase() {
        b'K' => (&s[..s.len() - 1], 10),
        b'M' => (&s[..s.len() - 1], 20),
        b'G' => (&s[..s.len() - 1], 30),
        b'T' => (&s[..s.len() - 1], 40),
        _ => (s, 0),
    };
    let n: u64 = digits.trim().parse().map_err(|_| Error::InvalidSize)?;
    n.checked_shl(shift)
        .filter(|v| v >> shift == n)
        .ok_or(Error::IntegerOverflow)
}

/// Render a byte count with the largest exact binary suffix.
pub fn format_size(bytes: u64) -> String {
    for (shift, suffix) in [(40, "T"), (30, "G"), (20, "M"), (10, "K")] {
        if bytes != 0 && bytes & ((1 << shift) - 1) == 0 {
            return format!("{}{}", bytes >> shift, suffix);
        }
    }
    bytes.to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("16m").unwrap(), 16 << 20);
        assert_eq!(parse_size("2G").unwrap(), 2 << 30);
        assert_eq!(parse_size("1T").unwrap(), 1 << 40);
        assert_eq!(parse_size(" 8K ").unwrap(), 8192);

        assert!(parse_size("").is_err());
        assert!(parse_size("K").is_err());
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("-1K").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512");
        assert_eq!(format_size(4096), "4K");
        assert_eq!(format_size(16 << 20), "16M");
        assert_eq!(format_size((16 << 20) + 1), "16777217");
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4096).unwrap(), 0);
        assert_eq!(align_up(1, 4096).unwrap(), 4096);
        assert_eq!(align_up(4096, 4096).unwrap(), 4096);
        assert_eq!(align_up(4097, 4096).unwrap(), 8192);
        assert!(align_up(u64::MAX, 4096).is_err());
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"abcd"));
        assert!(ct_eq(b"", b""));
    }
}
