// Server-side intake for pushed wallet bodies: store a copy, merge all
// known copies with the local wallet, and if the ledger changed mirror every
// outgoing transaction into the local wallet of its beneficiary.

use crate::copies::Copies;
use crate::error::{Error, Result};
use crate::id::Id;
use crate::patch::Patch;
use crate::wallet::WalletBody;
use crate::wallets::Wallets;
use chrono::Utc;
use log::{debug, error, info};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct Entrance {
    home: PathBuf,
    network: String,
    wallets: Wallets,
    pushed: AtomicU64,
    modified: AtomicU64,
}

impl Entrance {
    pub fn new(home: PathBuf, network: &str) -> Entrance {
        Entrance {
            wallets: Wallets::new(&home),
            home,
            network: network.to_string(),
            pushed: AtomicU64::new(0),
            modified: AtomicU64::new(0),
        }
    }

    /// Accept one pushed body. Returns the ids of all wallets that actually
    /// changed: the target wallet plus every beneficiary that received a
    /// mirrored transaction. Empty means the push was a no-op.
    pub fn push(
        &self,
        id: Id,
        body: &str,
        source: Option<(String, u16, u64)>,
    ) -> Result<Vec<Id>> {
        let parsed = WalletBody::parse(body)
            .map_err(|e| Error::validation(format!("can't parse pushed wallet: {}", e)))?;
        if parsed.id != id {
            return Err(Error::validation(format!(
                "pushed body is for wallet {}, not {}",
                parsed.id, id
            )));
        }
        if parsed.network != self.network {
            return Err(Error::validation(format!(
                "wrong network {:?}, this node is in {:?}",
                parsed.network, self.network
            )));
        }
        if parsed.protocol != crate::PROTOCOL {
            return Err(Error::validation(format!(
                "wrong protocol {}, this node speaks {}",
                parsed.protocol,
                crate::PROTOCOL
            )));
        }
        self.pushed.fetch_add(1, Ordering::Relaxed);

        let copies = Copies::new(&self.home, id);
        let (host, port, score) = source.unwrap_or(("0.0.0.0".to_string(), 0, 0));
        copies.add(body, &host, port, score, Utc::now())?;

        let mut patch = Patch::new();
        for copy in copies.all()? {
            let text = copies.load(&copy.name)?;
            match WalletBody::parse(&text) {
                Ok(candidate) => {
                    if let Err(e) = patch.join(&candidate) {
                        error!("Copy {} of {} rejected: {}", copy.name, id, e);
                    }
                }
                Err(e) => error!("Copy {} of {} is not a wallet: {}", copy.name, id, e),
            }
        }
        let wallet = self.wallets.wallet(id);
        if wallet.exists() {
            if let Err(e) = patch.join(&wallet.body()?) {
                error!("Local wallet {} rejected by its own merge: {}", id, e);
            }
        }
        if !patch.save(wallet.path(), true)? {
            debug!("Push of {} changed nothing", id);
            return Ok(Vec::new());
        }
        info!("Wallet {} modified by push, {} txns now", id, wallet.txns()?.len());

        let mut ids = vec![id];
        ids.extend(self.propagate(id)?);
        self.modified.fetch_add(ids.len() as u64, Ordering::Relaxed);
        Ok(ids)
    }

    /// Mirror outgoing transactions of `id` into the beneficiaries we host.
    fn propagate(&self, id: Id) -> Result<Vec<Id>> {
        let body = self.wallets.wallet(id).body()?;
        let mut modified = Vec::new();
        for txn in body.txns.iter().filter(|t| t.amount.is_negative()) {
            let bnf = txn.bnf;
            if bnf == id {
                debug!("Self-paying txn #{:04x} in {}, skipped", txn.id, id);
                continue;
            }
            let target = self.wallets.wallet(bnf);
            if !target.exists() {
                continue;
            }
            if target.has(txn.id, id)? {
                continue;
            }
            if target.network()? != body.network {
                debug!("Network mismatch, txn #{:04x} not mirrored into {}", txn.id, bnf);
                continue;
            }
            if !target.prefix(&txn.prefix)? {
                debug!("Prefix mismatch, txn #{:04x} not mirrored into {}", txn.id, bnf);
                continue;
            }
            match target.add(&txn.inverse(id)?) {
                Ok(()) => {
                    info!("Txn #{:04x} of {} mirrored into {}", txn.id, id, bnf);
                    if !modified.contains(&bnf) {
                        modified.push(bnf);
                    }
                }
                Err(e) => error!("Can't mirror txn #{:04x} into {}: {}", txn.id, bnf, e),
            }
        }
        Ok(modified)
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "pushed": self.pushed.load(Ordering::Relaxed),
            "modified": self.modified.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::key::Key;
    use crate::txn::parse_time;
    use crate::wallet::Wallet;
    use rsa::RsaPrivateKey;
    use tempfile::TempDir;

    fn test_key() -> Key {
        let mut rng = rand::thread_rng();
        Key::from_private(RsaPrivateKey::new(&mut rng, 1024).expect("keygen"))
    }

    fn prefix_of(key: &Key) -> String {
        let text = key.to_text();
        let bytes = text.as_bytes();
        for start in 0..bytes.len() - 12 {
            let run = &bytes[start..start + 12];
            if run.iter().all(|b| b.is_ascii_alphanumeric()) {
                return String::from_utf8(run.to_vec()).unwrap();
            }
        }
        unreachable!()
    }

    #[test]
    fn push_stores_merges_and_reports_change() {
        let home = TempDir::new().unwrap();
        let entrance = Entrance::new(home.path().to_path_buf(), "testnet");
        let key = test_key();
        let id = Id::new(0xaa);
        let body = WalletBody {
            network: "testnet".to_string(),
            protocol: crate::PROTOCOL,
            id,
            key: Key::from_pem(&key.to_pub_pem()).unwrap(),
            txns: Vec::new(),
        };
        let ids = entrance.push(id, &body.to_text(), None).unwrap();
        assert_eq!(ids, vec![id]);
        assert!(Wallets::new(home.path()).exists(id));
        // Same body again is a no-op.
        let ids = entrance.push(id, &body.to_text(), None).unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn push_rejects_foreign_network_and_wrong_id() {
        let home = TempDir::new().unwrap();
        let entrance = Entrance::new(home.path().to_path_buf(), "testnet");
        let key = test_key();
        let id = Id::new(0xaa);
        let mut body = WalletBody {
            network: "othernet".to_string(),
            protocol: crate::PROTOCOL,
            id,
            key,
            txns: Vec::new(),
        };
        assert!(entrance.push(id, &body.to_text(), None).is_err());
        body.network = "testnet".to_string();
        assert!(entrance.push(Id::new(0xbb), &body.to_text(), None).is_err());
        assert!(entrance.push(id, "not a wallet at all", None).is_err());
    }

    #[test]
    fn propagation_mirrors_payment_into_beneficiary() {
        let home = TempDir::new().unwrap();
        let entrance = Entrance::new(home.path().to_path_buf(), "testnet");
        let wallets = Wallets::new(home.path());
        let payer_key = test_key();
        let payee_key = test_key();
        let payer = Id::new(0xa1);
        let payee = Id::new(0xb2);

        // The payee lives on this node already.
        Wallet::init(&wallets.path(payee), payee, &payee_key, "testnet", false).unwrap();

        // The payer's wallet arrives by push, carrying a payment to the payee.
        let payer_wallet = Wallet::init(
            home.path().join("payer.z").as_path(),
            payer,
            &payer_key,
            "testnet",
            false,
        )
        .unwrap();
        payer_wallet
            .add(
                &crate::txn::Txn::new(
                    1,
                    parse_time("2018-06-26T00:32:43Z").unwrap(),
                    Amount::from_zld(100.0),
                    "AAAABBBB",
                    Id::new(0x77),
                    "funding",
                )
                .unwrap(),
            )
            .unwrap();
        let invoice = format!("{}@{}", prefix_of(&payee_key), payee);
        payer_wallet
            .sub(
                Amount::from_zld(14.99),
                &invoice,
                &payer_key,
                "pizza",
                parse_time("2018-06-26T10:00:00Z").unwrap(),
            )
            .unwrap();

        let body = std::fs::read_to_string(payer_wallet.path()).unwrap();
        let mut ids = entrance.push(payer, &body, None).unwrap();
        ids.sort();
        assert_eq!(ids, vec![payer, payee]);

        let hosted = wallets.wallet(payee);
        assert_eq!(hosted.balance().unwrap(), Amount::from_zld(14.99));
        let mirrored = &hosted.txns().unwrap()[0];
        assert_eq!(mirrored.id, 1);
        assert_eq!(mirrored.bnf, payer);
        assert!(mirrored.sign.is_empty());

        // Pushing the payer again must not double-mirror.
        let ids = entrance.push(payer, &body, None).unwrap();
        assert!(ids.is_empty());
        assert_eq!(hosted.balance().unwrap(), Amount::from_zld(14.99));
    }
}
