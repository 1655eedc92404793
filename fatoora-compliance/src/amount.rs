//! Monetary amounts in halalas (1/100 SAR).
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Integer amount in the smallest currency unit.
///
/// Threshold routing compares amounts exactly, so totals are never floats.
///
/// # Examples
/// ```rust
/// use fatoora_compliance::Amount;
///
/// let total: Amount = "1000.01".parse()?;
/// assert_eq!(total.halalas(), 100_001);
/// assert_eq!(total.to_string(), "1000.01");
/// # Ok::<(), fatoora_compliance::amount::AmountParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(i64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid amount '{input}'")]
pub struct AmountParseError {
    input: String,
}

impl Amount {
    pub const fn from_halalas(halalas: i64) -> Self {
        Self(halalas)
    }

    pub const fn halalas(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl FromStr for Amount {
    type Err = AmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || AmountParseError {
            input: s.to_string(),
        };
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (whole, fraction) = match digits.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (digits, ""),
        };
        if whole.is_empty()
            || fraction.len() > 2
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !fraction.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(err());
        }
        let whole: i64 = whole.parse().map_err(|_| err())?;
        let cents: i64 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<i64>().map_err(|_| err())? * 10,
            _ => fraction.parse().map_err(|_| err())?,
        };
        let value = whole
            .checked_mul(100)
            .and_then(|v| v.checked_add(cents))
            .ok_or_else(err)?;
        Ok(Amount(if negative { -value } else { value }))
    }
}
