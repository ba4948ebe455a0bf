// Proof-of-work score. Immutable: extending produces a new value. The hash
// chain starts from `"<time> <host> <port> <invoice>"` and folds each suffix
// in as `h' = sha256_hex(h + " " + suffix)`; the score is valid while the
// tail hash ends in `strength` hex zeros.
//
// Two text forms exist: the canonical one (`value/strength: time host port
// invoice suffixes...`) used in logs and the farm history, and the compact
// header form (`strength time-hex host port-hex prefix id suffixes...`)
// carried in X-Zold-Score.

use crate::error::{Error, Result};
use crate::txn::{format_time, parse_time};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Default required trailing hex zeros.
pub const STRENGTH: usize = 6;

/// A score expires this many hours after its start time.
pub const BEST_BEFORE_HOURS: i64 = 24;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Score {
    pub time: DateTime<Utc>,
    pub host: String,
    pub port: u16,
    pub invoice: String,
    pub suffixes: Vec<String>,
    pub strength: usize,
}

impl Score {
    pub fn new(
        time: DateTime<Utc>,
        host: &str,
        port: u16,
        invoice: &str,
        strength: usize,
    ) -> Score {
        Score {
            time,
            host: host.to_string(),
            port,
            invoice: invoice.to_string(),
            suffixes: Vec::new(),
            strength,
        }
    }

    pub fn value(&self) -> usize {
        self.suffixes.len()
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now - self.time > Duration::hours(BEST_BEFORE_HOURS)
    }

    /// The seed of the hash chain.
    pub fn prefix(&self) -> String {
        format!(
            "{} {} {} {}",
            format_time(self.time),
            self.host,
            self.port,
            self.invoice
        )
    }

    /// Tail of the chain: the last accumulated hash, or the raw prefix when
    /// no suffix has been mined yet.
    pub fn tail(&self) -> String {
        let mut acc = self.prefix();
        for suffix in &self.suffixes {
            acc = sha256_hex(&format!("{} {}", acc, suffix));
        }
        acc
    }

    /// An empty chain is valid by definition; otherwise the tail must end in
    /// `strength` hex zeros.
    pub fn valid(&self) -> bool {
        self.suffixes.is_empty() || ends_in_zeros(&self.tail(), self.strength)
    }

    /// Trailing hex zeros the tail hash actually has, which may exceed the
    /// declared strength.
    pub fn actual_strength(&self) -> usize {
        let tail = self.tail();
        tail.bytes().rev().take_while(|b| *b == b'0').count()
    }

    /// A new score with one more suffix. Does not check validity.
    pub fn extended(&self, suffix: &str) -> Score {
        let mut score = self.clone();
        score.suffixes.push(suffix.to_string());
        score
    }

    /// Test helper: the same score cut down to its first `n` suffixes.
    pub fn reduced(&self, n: usize) -> Score {
        let mut score = self.clone();
        score.suffixes.truncate(n);
        score
    }

    /// `value/strength` shorthand for logs.
    pub fn to_mnemo(&self) -> String {
        format!("{}/{}", self.value(), self.strength)
    }

    /// Compact wire form for the X-Zold-Score header.
    pub fn to_header(&self) -> String {
        let mut out = format!(
            "{} {:x} {} {:x} {}",
            self.strength,
            self.time.timestamp(),
            self.host,
            self.port,
            self.invoice.replacen('@', " ", 1)
        );
        for suffix in &self.suffixes {
            out.push(' ');
            out.push_str(suffix);
        }
        out
    }

    pub fn parse_header(text: &str) -> Result<Score> {
        let parts: Vec<&str> = text.split(' ').collect();
        if parts.len() < 6 {
            return Err(Error::validation(format!("invalid score header {:?}", text)));
        }
        let strength: usize = parts[0]
            .parse()
            .map_err(|_| Error::validation(format!("invalid strength in {:?}", text)))?;
        let seconds = i64::from_str_radix(parts[1], 16)
            .map_err(|_| Error::validation(format!("invalid time in {:?}", text)))?;
        let time = Utc
            .timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| Error::validation(format!("time out of range in {:?}", text)))?;
        let port = u16::from_str_radix(parts[3], 16)
            .map_err(|_| Error::validation(format!("invalid port in {:?}", text)))?;
        Ok(Score {
            time,
            host: parts[2].to_string(),
            port,
            invoice: format!("{}@{}", parts[4], parts[5]),
            suffixes: parts[6..].iter().map(|s| s.to_string()).collect(),
            strength,
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "value": self.value(),
            "strength": self.strength,
            "time": format_time(self.time),
            "host": self.host,
            "port": self.port,
            "invoice": self.invoice,
            "expired": self.expired(Utc::now()),
        })
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}: {} {} {} {}",
            self.value(),
            self.strength,
            format_time(self.time),
            self.host,
            self.port,
            self.invoice
        )?;
        for suffix in &self.suffixes {
            write!(f, " {}", suffix)?;
        }
        Ok(())
    }
}

impl FromStr for Score {
    type Err = Error;

    fn from_str(text: &str) -> Result<Score> {
        let (head, rest) = text
            .split_once(": ")
            .ok_or_else(|| Error::validation(format!("invalid score {:?}", text)))?;
        let (value, strength) = head
            .split_once('/')
            .ok_or_else(|| Error::validation(format!("invalid score head {:?}", head)))?;
        let value: usize = value
            .parse()
            .map_err(|_| Error::validation(format!("invalid score value {:?}", value)))?;
        let strength: usize = strength
            .parse()
            .map_err(|_| Error::validation(format!("invalid strength {:?}", strength)))?;
        let parts: Vec<&str> = rest.split(' ').collect();
        if parts.len() < 4 {
            return Err(Error::validation(format!("invalid score body {:?}", rest)));
        }
        let score = Score {
            time: parse_time(parts[0])?,
            host: parts[1].to_string(),
            port: parts[2]
                .parse()
                .map_err(|_| Error::validation(format!("invalid port {:?}", parts[2])))?,
            invoice: parts[3].to_string(),
            suffixes: parts[4..].iter().map(|s| s.to_string()).collect(),
            strength,
        };
        if score.value() != value {
            return Err(Error::validation(format!(
                "score claims value {} but carries {} suffixes",
                value,
                score.value()
            )));
        }
        if !score.invoice.contains('@') {
            return Err(Error::validation(format!(
                "invalid invoice {:?} in score",
                score.invoice
            )));
        }
        Ok(score)
    }
}

pub fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

pub fn ends_in_zeros(hash: &str, strength: usize) -> bool {
    hash.len() >= strength && hash.as_bytes()[hash.len() - strength..].iter().all(|b| *b == b'0')
}
