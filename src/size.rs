//! Capacity strings such as `512M` or `2G`.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

const KIB: u64 = 1024;

/// Parse a capacity string into a byte count.
///
/// Accepts decimal digits followed by at most one unit: `K`, `M`, `G` or
/// `T` (powers of 1024). A bare number is a byte count. Zero is rejected.
pub fn parse_size(s: &str) -> Result<u64> {
    let invalid = || Error::InvalidSizeFormat(s.to_string());

    let (digits, multiplier) = match s.as_bytes().last() {
        Some(b'K') => (&s[..s.len() - 1], KIB),
        Some(b'M') => (&s[..s.len() - 1], KIB.pow(2)),
        Some(b'G') => (&s[..s.len() - 1], KIB.pow(3)),
        Some(b'T') => (&s[..s.len() - 1], KIB.pow(4)),
        Some(_) => (s, 1),
        None => return Err(invalid()),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let magnitude: u64 = digits.parse().map_err(|_| invalid())?;
    match magnitude.checked_mul(multiplier) {
        Some(0) | None => Err(invalid()),
        Some(bytes) => Ok(bytes),
    }
}

/// A byte count parsed from a capacity string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_size(s).map(ByteSize)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let units = [(KIB.pow(4), 'T'), (KIB.pow(3), 'G'), (KIB.pow(2), 'M'), (KIB, 'K')];
        for (scale, unit) in units {
            if self.0 >= scale && self.0 % scale == 0 {
                return write!(f, "{}{}", self.0 / scale, unit);
            }
        }
        write!(f, "{}", self.0)
    }
}
