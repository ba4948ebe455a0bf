// Fixed-point money. One ZLD is 2^24 zents; all arithmetic is checked and
// overflow is a hard error, never a wrap.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Zents per ZLD.
pub const FRACTION: i64 = 1 << 24;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);
    pub const MAX: Amount = Amount(i64::MAX);

    pub fn from_zents(zents: i64) -> Self {
        Amount(zents)
    }

    /// Lossy constructor for human-entered values, rounded to the nearest zent.
    pub fn from_zld(zld: f64) -> Self {
        Amount((zld * FRACTION as f64).round() as i64)
    }

    pub fn zents(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn add(&self, other: Amount) -> Result<Amount> {
        self.0
            .checked_add(other.0)
            .map(Amount)
            .ok_or(Error::AmountOverflow)
    }

    pub fn sub(&self, other: Amount) -> Result<Amount> {
        self.0
            .checked_sub(other.0)
            .map(Amount)
            .ok_or(Error::AmountOverflow)
    }

    pub fn neg(&self) -> Result<Amount> {
        self.0.checked_neg().map(Amount).ok_or(Error::AmountOverflow)
    }

    pub fn mul(&self, factor: i64) -> Result<Amount> {
        self.0
            .checked_mul(factor)
            .map(Amount)
            .ok_or(Error::AmountOverflow)
    }

    /// Two-decimal ZLD rendering for human-facing dumps.
    pub fn to_zld(&self) -> String {
        format!("{:.2}", self.0 as f64 / FRACTION as f64)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Amount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Amount> {
        s.parse::<i64>()
            .map(Amount)
            .map_err(|_| Error::validation(format!("not a valid amount: {:?}", s)))
    }
}
