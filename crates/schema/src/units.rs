//! Minor-unit amount conversion.

use rust_decimal::Decimal;
use std::fmt;

/// TON is divisible into 10^9 nanotons
pub const TON_DECIMALS: u32 = 9;

/// XAUH jetton decimals
pub const XAUH_DECIMALS: u32 = 18;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    Empty,
    NotAnInteger(String),
    OutOfRange(String),
}

impl fmt::Display for AmountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmountError::Empty => write!(f, "empty amount"),
            AmountError::NotAnInteger(s) => write!(f, "amount {s:?} is not an unsigned integer"),
            AmountError::OutOfRange(s) => write!(f, "amount {s:?} is out of decimal range"),
        }
    }
}

impl std::error::Error for AmountError {}

/// Convert an unsigned integer string of minor units into human units.
///
/// The result is exact: `"5000000000"` with 9 decimals is `5`, not `4.999..`.
pub fn from_minor_units(raw: &str, decimals: u32) -> Result<Decimal, AmountError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(AmountError::Empty);
    }
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AmountError::NotAnInteger(s.to_string()));
    }

    // digits only, so a parse failure can only be overflow
    let n: i128 = s
        .parse()
        .map_err(|_| AmountError::OutOfRange(s.to_string()))?;

    Decimal::try_from_i128_with_scale(n, decimals)
        .map(|d| d.normalize())
        .map_err(|_| AmountError::OutOfRange(s.to_string()))
}
