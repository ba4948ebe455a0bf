// Wallet identifier: 64 bits, rendered as exactly sixteen lowercase hex
// digits. The all-zero id is the issuer wallet and the only one whose balance
// may go negative.

use crate::error::{Error, Result};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u64);

impl Id {
    pub const ROOT: Id = Id(0);

    pub fn new(value: u64) -> Self {
        Id(value)
    }

    pub fn is_root(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if s.len() != 16 || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(Error::validation(format!(
                "invalid wallet id {:?}, expected 16 lowercase hex digits",
                s
            )));
        }
        let value = u64::from_str_radix(s, 16)
            .map_err(|_| Error::validation(format!("invalid wallet id {:?}", s)))?;
        Ok(Id(value))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Id, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_sixteen_hex_digits() {
        assert_eq!(Id::new(0xdeadbeef).to_string(), "00000000deadbeef");
        assert_eq!(Id::ROOT.to_string(), "0000000000000000");
    }

    #[test]
    fn parses_only_canonical_form() {
        assert_eq!("00000000deadbeef".parse::<Id>().unwrap(), Id::new(0xdeadbeef));
        assert!("deadbeef".parse::<Id>().is_err());
        assert!("00000000DEADBEEF".parse::<Id>().is_err());
        assert!("00000000deadbeez".parse::<Id>().is_err());
    }

    #[test]
    fn root_is_all_zeros() {
        assert!("0000000000000000".parse::<Id>().unwrap().is_root());
        assert!(!Id::new(1).is_root());
    }
}
