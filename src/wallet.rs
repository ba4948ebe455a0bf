// File-backed append-only ledger for one wallet. The file is the source of
// truth; a Wallet is a cheap path handle and every operation re-reads it.
//
// Layout (UTF-8, LF): network, protocol, id, public key (until a blank
// line), then one transaction per line.

use crate::amount::Amount;
use crate::atomic_file::AtomicFile;
use crate::error::{Error, Result};
use crate::id::Id;
use crate::key::Key;
use crate::txn::Txn;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Wallet file extension under `zold-wallets/`.
pub const EXT: &str = "z";

static RE_NETWORK: Lazy<Regex> = Lazy::new(|| Regex::new("^[a-z]{4,16}$").unwrap());

/// The parsed content of a wallet file. Patch works on bodies directly so
/// that copies fetched from peers never need to touch the wallets directory.
#[derive(Clone, Debug)]
pub struct WalletBody {
    pub network: String,
    pub protocol: u16,
    pub id: Id,
    pub key: Key,
    pub txns: Vec<Txn>,
}

impl WalletBody {
    pub fn parse(text: &str) -> Result<WalletBody> {
        let mut lines = text.lines();
        let network = lines
            .next()
            .ok_or_else(|| Error::validation("empty wallet body"))?
            .to_string();
        let protocol: u16 = lines
            .next()
            .ok_or_else(|| Error::validation("wallet body has no protocol line"))?
            .parse()
            .map_err(|_| Error::validation("invalid protocol line"))?;
        let id: Id = lines
            .next()
            .ok_or_else(|| Error::validation("wallet body has no id line"))?
            .parse()?;
        let mut key_lines = Vec::new();
        for line in lines.by_ref() {
            if line.is_empty() {
                break;
            }
            key_lines.push(line);
        }
        if key_lines.is_empty() {
            return Err(Error::validation("wallet body has no public key"));
        }
        let key = Key::from_text(&key_lines.join("\n"))?;
        let mut txns = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            txns.push(Txn::from_str(line)?);
        }
        Ok(WalletBody {
            network,
            protocol,
            id,
            key,
            txns,
        })
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("{}\n{}\n{}\n", self.network, self.protocol, self.id));
        out.push_str(self.key.to_pub_pem().trim_end());
        out.push_str("\n\n");
        for txn in &self.txns {
            out.push_str(&txn.to_string());
            out.push('\n');
        }
        out
    }

    pub fn balance(&self) -> Result<Amount> {
        let mut total = Amount::ZERO;
        for txn in &self.txns {
            total = total.add(txn.amount)?;
        }
        Ok(total)
    }

    /// Transactions in canonical order: date ascending, then amount descending.
    pub fn sorted_txns(&self) -> Vec<Txn> {
        let mut txns = self.txns.clone();
        txns.sort_by(|a, b| a.date.cmp(&b.date).then(b.amount.cmp(&a.amount)));
        txns
    }
}

pub struct Wallet {
    path: PathBuf,
}

impl Wallet {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Wallet {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Create the wallet file. Refuses to clobber an existing wallet unless
    /// `overwrite` is set, and refuses malformed network names.
    pub fn init(path: &Path, id: Id, key: &Key, network: &str, overwrite: bool) -> Result<Wallet> {
        if !RE_NETWORK.is_match(network) {
            return Err(Error::validation(format!(
                "invalid network name {:?}, expected ^[a-z]{{4,16}}$",
                network
            )));
        }
        let wallet = Wallet::new(path);
        if wallet.exists() && !overwrite {
            return Err(Error::validation(format!(
                "wallet file {} already exists",
                path.display()
            )));
        }
        let body = WalletBody {
            network: network.to_string(),
            protocol: crate::PROTOCOL,
            id,
            key: key.clone(),
            txns: Vec::new(),
        };
        wallet.file().write(&body.to_text())?;
        Ok(wallet)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn body(&self) -> Result<WalletBody> {
        WalletBody::parse(&self.file().read()?)
    }

    pub fn id(&self) -> Result<Id> {
        Ok(self.body()?.id)
    }

    pub fn network(&self) -> Result<String> {
        Ok(self.body()?.network)
    }

    pub fn protocol(&self) -> Result<u16> {
        Ok(self.body()?.protocol)
    }

    pub fn key(&self) -> Result<Key> {
        Ok(self.body()?.key)
    }

    pub fn root(&self) -> Result<bool> {
        Ok(self.id()?.is_root())
    }

    pub fn balance(&self) -> Result<Amount> {
        self.body()?.balance()
    }

    pub fn txns(&self) -> Result<Vec<Txn>> {
        Ok(self.body()?.sorted_txns())
    }

    pub fn has(&self, id: u16, bnf: Id) -> Result<bool> {
        Ok(self.body()?.txns.iter().any(|t| t.id == id && t.bnf == bnf))
    }

    /// Whether `prefix` can belong to an invoice of this wallet: invoice
    /// prefixes are substrings of the public key text.
    pub fn prefix(&self, prefix: &str) -> Result<bool> {
        Ok(self.key()?.to_text().contains(prefix))
    }

    /// SHA-256 of the raw file bytes, the ETag-like identity of this copy.
    pub fn digest(&self) -> Result<String> {
        let bytes = self.file().read_bytes()?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    pub fn mtime(&self) -> Result<DateTime<Utc>> {
        let meta = std::fs::metadata(&self.path)?;
        Ok(DateTime::<Utc>::from(meta.modified()?))
    }

    /// Hours since the last mutation.
    pub fn age(&self) -> Result<f64> {
        let mtime = self.mtime()?;
        Ok((Utc::now() - mtime).num_seconds().max(0) as f64 / 3600.0)
    }

    /// Append a transaction after the refusal checks: duplicate `(id, bnf)`
    /// pair, duplicate tax payment, or total overflow.
    pub fn add(&self, txn: &Txn) -> Result<()> {
        txn.validate()?;
        let body = self.body()?;
        if body.txns.iter().any(|t| t.id == txn.id && t.bnf == txn.bnf) {
            return Err(Error::validation(format!(
                "transaction #{:04x}/{} already exists",
                txn.id, txn.bnf
            )));
        }
        if txn.amount.is_negative()
            && txn.details.starts_with("TAXES ")
            && body.txns.iter().any(|t| t.details == txn.details)
        {
            return Err(Error::validation(format!(
                "tax payment already exists: {:?}",
                txn.details
            )));
        }
        body.balance()?.add(txn.amount)?;
        let mut text = self.file().read()?;
        if !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&txn.to_string());
        text.push('\n');
        self.file().write(&text)
    }

    /// Construct, sign, self-verify and append the outgoing side of a payment.
    pub fn sub(
        &self,
        amount: Amount,
        invoice: &str,
        key: &Key,
        details: &str,
        time: DateTime<Utc>,
    ) -> Result<Txn> {
        if amount.is_negative() || amount.is_zero() {
            return Err(Error::validation(format!(
                "payment amount must be positive, got {}",
                amount
            )));
        }
        let (prefix, bnf) = parse_invoice(invoice)?;
        let body = self.body()?;
        let max = body
            .txns
            .iter()
            .filter(|t| t.amount.is_negative())
            .map(|t| t.id as u32)
            .max()
            .unwrap_or(0);
        let id = max + 1;
        if id > crate::txn::MAX_TXN_ID {
            return Err(Error::validation(format!("txn id {:#x} is too big", id)));
        }
        let txn = Txn::new(id as u16, time, amount.neg()?, &prefix, bnf, details)?
            .signed(key, body.id)?;
        if !txn.verify(&body.key, body.id)? {
            return Err(Error::integrity(
                "signature does not match the wallet public key",
            ));
        }
        self.add(&txn)?;
        Ok(txn)
    }

    /// Rewrite header and body canonically, transactions sorted by date then
    /// descending amount.
    pub fn refurbish(&self) -> Result<()> {
        let mut body = self.body()?;
        body.txns = body.sorted_txns();
        self.file().write(&body.to_text())
    }

    /// Human-readable dump for `/wallet/{id}.txt`.
    pub fn to_text(&self) -> Result<String> {
        let body = self.body()?;
        let mut out = format!(
            "id: {}\nnetwork: {}\nprotocol: {}\nbalance: {} ZLD\ntxns: {}\n\n",
            body.id,
            body.network,
            body.protocol,
            body.balance()?.to_zld(),
            body.txns.len()
        );
        for txn in body.sorted_txns() {
            out.push_str(&txn.to_text());
            out.push('\n');
        }
        Ok(out)
    }

    fn file(&self) -> AtomicFile {
        AtomicFile::new(&self.path)
    }
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Wallet({})", self.path.display())
    }
}

pub fn parse_invoice(invoice: &str) -> Result<(String, Id)> {
    let mut parts = invoice.splitn(2, '@');
    let prefix = parts
        .next()
        .ok_or_else(|| Error::validation("empty invoice"))?;
    let id = parts
        .next()
        .ok_or_else(|| Error::validation(format!("invoice {:?} has no @", invoice)))?;
    if prefix.len() < 8 || prefix.len() > 32 || !prefix.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(Error::validation(format!(
            "invalid invoice prefix {:?}",
            prefix
        )));
    }
    Ok((prefix.to_string(), id.parse()?))
}
