// One row of a wallet ledger. Outgoing rows carry a negative amount and an
// RSA signature by the wallet owner; incoming rows are unsigned mirrors
// created by propagation.
//
// Line codec: `id;date;amount;prefix;bnf;details;sign` with a 4-hex-digit id,
// ISO8601 UTC date and the amount in zents. The canonical signing bytes bind
// the owning wallet id so a row cannot be replayed into another ledger.

use crate::amount::Amount;
use crate::error::{Error, Result};
use crate::id::Id;
use crate::key::Key;
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

pub const MAX_TXN_ID: u32 = 0xFFFF;
pub const MAX_DETAILS_LENGTH: usize = 512;

static RE_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new("^[a-zA-Z0-9]{8,32}$").unwrap());
static RE_DETAILS: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-zA-Z0-9 @!?*_\\-.:,'/]+$").unwrap());

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn format_time(time: DateTime<Utc>) -> String {
    time.format(DATE_FORMAT).to_string()
}

pub fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| Error::validation(format!("invalid time {:?}", text)))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Txn {
    pub id: u16,
    pub date: DateTime<Utc>,
    pub amount: Amount,
    pub prefix: String,
    pub bnf: Id,
    pub details: String,
    /// Base64 RSA signature; empty on incoming (positive) rows.
    pub sign: String,
}

impl Txn {
    pub fn new(
        id: u16,
        date: DateTime<Utc>,
        amount: Amount,
        prefix: &str,
        bnf: Id,
        details: &str,
    ) -> Result<Txn> {
        let txn = Txn {
            id,
            date,
            amount,
            prefix: prefix.to_string(),
            bnf,
            details: details.to_string(),
            sign: String::new(),
        };
        txn.validate()?;
        Ok(txn)
    }

    pub fn validate(&self) -> Result<()> {
        if self.amount.is_zero() {
            return Err(Error::validation("transaction amount can't be zero"));
        }
        if !RE_PREFIX.is_match(&self.prefix) {
            return Err(Error::validation(format!(
                "invalid prefix {:?}, expected 8-32 alphanumeric chars",
                self.prefix
            )));
        }
        if self.details.len() > MAX_DETAILS_LENGTH {
            return Err(Error::validation(format!(
                "details too long: {} chars",
                self.details.len()
            )));
        }
        if !RE_DETAILS.is_match(&self.details) {
            return Err(Error::validation(format!(
                "invalid details {:?}",
                self.details
            )));
        }
        Ok(())
    }

    /// Canonical bytes the RSA signature covers, bound to the owning wallet.
    pub fn body(&self, wallet: Id) -> Vec<u8> {
        format!(
            "{} {:04x} {} {} {} {} {}",
            wallet,
            self.id,
            format_time(self.date),
            self.amount,
            self.prefix,
            self.bnf,
            self.details
        )
        .into_bytes()
    }

    /// Sign this row as the owner of `wallet`.
    pub fn signed(mut self, key: &Key, wallet: Id) -> Result<Txn> {
        self.sign = key.sign(&self.body(wallet))?;
        Ok(self)
    }

    /// Check the signature against the public key of the owning wallet.
    pub fn verify(&self, key: &Key, wallet: Id) -> Result<bool> {
        if self.sign.is_empty() {
            return Ok(false);
        }
        key.verify(&self.body(wallet), &self.sign)
    }

    /// The mirror row for the beneficiary's ledger: same id, date, prefix and
    /// details, amount negated, `bnf` pointing back at the paying wallet, no
    /// signature.
    pub fn inverse(&self, payer: Id) -> Result<Txn> {
        Ok(Txn {
            id: self.id,
            date: self.date,
            amount: self.amount.neg()?,
            prefix: self.prefix.clone(),
            bnf: payer,
            details: self.details.clone(),
            sign: String::new(),
        })
    }

    /// Human-readable rendering for ledger dumps.
    pub fn to_text(&self) -> String {
        format!(
            "#{:04x} {} {} ZLD {} {} {}",
            self.id,
            format_time(self.date),
            self.amount.to_zld(),
            if self.amount.is_negative() { "to" } else { "from" },
            self.bnf,
            self.details
        )
    }
}

impl fmt::Display for Txn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x};{};{};{};{};{};{}",
            self.id,
            format_time(self.date),
            self.amount,
            self.prefix,
            self.bnf,
            self.details,
            self.sign
        )
    }
}

impl FromStr for Txn {
    type Err = Error;

    fn from_str(line: &str) -> Result<Txn> {
        let parts: Vec<&str> = line.split(';').collect();
        if parts.len() != 7 {
            return Err(Error::validation(format!(
                "invalid transaction line, {} fields instead of 7: {:?}",
                parts.len(),
                line
            )));
        }
        let id = u32::from_str_radix(parts[0], 16)
            .map_err(|_| Error::validation(format!("invalid txn id {:?}", parts[0])))?;
        if id > MAX_TXN_ID {
            return Err(Error::validation(format!("txn id {:#x} too big", id)));
        }
        let txn = Txn {
            id: id as u16,
            date: parse_time(parts[1])?,
            amount: parts[2].parse()?,
            prefix: parts[3].to_string(),
            bnf: parts[4].parse()?,
            details: parts[5].to_string(),
            sign: parts[6].to_string(),
        };
        txn.validate()?;
        Ok(txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn() -> Txn {
        Txn::new(
            7,
            parse_time("2018-06-26T00:32:43Z").unwrap(),
            Amount::from_zld(-14.99),
            "NOPREFIX",
            Id::new(0xcafe),
            "for pizza",
        )
        .unwrap()
    }

    #[test]
    fn line_round_trips() {
        let t = txn();
        let parsed: Txn = t.to_string().parse().unwrap();
        assert_eq!(t, parsed);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!("garbage".parse::<Txn>().is_err());
        assert!("0007;2018-06-26T00:32:43Z;0;NOPREFIX;000000000000cafe;x;"
            .parse::<Txn>()
            .is_err());
        assert!("10000;2018-06-26T00:32:43Z;-5;NOPREFIX;000000000000cafe;x;"
            .parse::<Txn>()
            .is_err());
    }

    #[test]
    fn rejects_bad_prefix_and_details() {
        assert!(Txn::new(
            1,
            Utc::now(),
            Amount::from_zents(-1),
            "short",
            Id::ROOT,
            "ok"
        )
        .is_err());
        assert!(Txn::new(
            1,
            Utc::now(),
            Amount::from_zents(-1),
            "NOPREFIX",
            Id::ROOT,
            "bad;details"
        )
        .is_err());
    }

    #[test]
    fn inverse_mirrors_the_row() {
        let t = txn();
        let payer = Id::new(0xbeef);
        let inv = t.inverse(payer).unwrap();
        assert_eq!(inv.id, t.id);
        assert_eq!(inv.amount, t.amount.neg().unwrap());
        assert_eq!(inv.bnf, payer);
        assert!(inv.sign.is_empty());
    }

    #[test]
    fn body_is_bound_to_wallet_id() {
        let t = txn();
        assert_ne!(t.body(Id::new(1)), t.body(Id::new(2)));
    }
}
