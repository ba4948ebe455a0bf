// Merge algorithm: fuses candidate copies of one wallet into a single
// canonical ledger. The first body joined is the baseline (callers join the
// strongest copy first); later candidates contribute only rows that survive
// the merge rules: negatives must extend committed history with a verifiable
// signature, positives must arrive unsigned.

use crate::amount::Amount;
use crate::atomic_file::AtomicFile;
use crate::error::{Error, Result};
use crate::txn::Txn;
use crate::wallet::WalletBody;
use log::debug;
use std::path::Path;

pub struct Patch {
    strict: bool,
    base: Option<WalletBody>,
}

impl Patch {
    pub fn new() -> Self {
        Patch {
            strict: false,
            base: None,
        }
    }

    /// Strict variant for tests: the balance ceiling for a candidate negative
    /// is checked over the canonically ordered sequence, every prefix sum must
    /// stay non-negative.
    pub fn new_strict() -> Self {
        Patch {
            strict: true,
            base: None,
        }
    }

    pub fn empty(&self) -> bool {
        self.base.is_none()
    }

    pub fn txns(&self) -> &[Txn] {
        self.base.as_ref().map(|b| b.txns.as_slice()).unwrap_or(&[])
    }

    /// Merge one candidate body in. The first call seats the baseline; any
    /// later candidate must agree with it on network, id and public key.
    pub fn join(&mut self, body: &WalletBody) -> Result<()> {
        let strict = self.strict;
        let base = match &mut self.base {
            None => {
                self.base = Some(body.clone());
                return Ok(());
            }
            Some(base) => base,
        };
        if body.network != base.network {
            return Err(Error::integrity(format!(
                "network mismatch: {:?} vs {:?}",
                body.network, base.network
            )));
        }
        if body.id != base.id {
            return Err(Error::integrity(format!(
                "wallet id mismatch: {} vs {}",
                body.id, base.id
            )));
        }
        if body.key != base.key {
            return Err(Error::integrity("public key mismatch"));
        }
        let max_neg_id = base
            .txns
            .iter()
            .filter(|t| t.amount.is_negative())
            .map(|t| t.id)
            .max()
            .unwrap_or(0);
        for txn in body.sorted_txns() {
            if base.txns.contains(&txn) {
                continue;
            }
            if txn.amount.is_negative() {
                if base
                    .txns
                    .iter()
                    .any(|t| t.amount.is_negative() && t.id == txn.id)
                {
                    debug!("Transaction already exists: #{:04x} of {}", txn.id, base.id);
                    continue;
                }
                if txn.id <= max_neg_id {
                    debug!(
                        "Txn #{:04x} of {} revises committed history, skipped",
                        txn.id, base.id
                    );
                    continue;
                }
                if !base.id.is_root() && !Self::balance_allows(strict, base, &txn)? {
                    debug!(
                        "Txn #{:04x} would drive {} below zero, skipped",
                        txn.id, base.id
                    );
                    continue;
                }
                if !txn.verify(&base.key, base.id)? {
                    debug!(
                        "Invalid signature on txn #{:04x} of {}, skipped",
                        txn.id, base.id
                    );
                    continue;
                }
            } else if !txn.sign.is_empty() {
                debug!(
                    "Incoming txn #{:04x} of {} carries a signature, skipped",
                    txn.id, base.id
                );
                continue;
            }
            base.txns.push(txn);
        }
        Ok(())
    }

    /// Write the merged ledger to `path`. Returns true iff the file content
    /// actually changed.
    pub fn save(&self, path: &Path, overwrite: bool) -> Result<bool> {
        let base = self
            .base
            .as_ref()
            .ok_or_else(|| Error::validation("nothing joined, nothing to save"))?;
        if path.exists() && !overwrite {
            return Err(Error::validation(format!(
                "wallet file {} already exists",
                path.display()
            )));
        }
        let mut body = base.clone();
        body.txns = body.sorted_txns();
        let text = body.to_text();
        let file = AtomicFile::new(path);
        if file.exists() && file.read()? == text {
            return Ok(false);
        }
        file.write(&text)?;
        Ok(true)
    }

    fn balance_allows(strict: bool, base: &WalletBody, txn: &Txn) -> Result<bool> {
        if strict {
            let mut seq = base.txns.clone();
            seq.push(txn.clone());
            seq.sort_by(|a, b| a.date.cmp(&b.date).then(b.amount.cmp(&a.amount)));
            let mut running = Amount::ZERO;
            for t in &seq {
                running = running.add(t.amount)?;
                if running.is_negative() {
                    return Ok(false);
                }
            }
            Ok(true)
        } else {
            Ok(!base.balance()?.add(txn.amount)?.is_negative())
        }
    }
}

impl Default for Patch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Id;
    use crate::key::Key;
    use crate::txn::parse_time;
    use chrono::{DateTime, Utc};
    use rsa::RsaPrivateKey;

    fn test_key() -> Key {
        let mut rng = rand::thread_rng();
        Key::from_private(RsaPrivateKey::new(&mut rng, 1024).expect("keygen"))
    }

    fn body(id: Id, key: &Key) -> WalletBody {
        WalletBody {
            network: "testnet".to_string(),
            protocol: crate::PROTOCOL,
            id,
            key: key.clone(),
            txns: Vec::new(),
        }
    }

    fn time(s: &str) -> DateTime<Utc> {
        parse_time(s).unwrap()
    }

    fn outgoing(id: u16, zld: f64, bnf: Id, details: &str, key: &Key, wallet: Id) -> Txn {
        Txn::new(
            id,
            time("2018-06-26T00:32:43Z"),
            Amount::from_zld(-zld),
            "NOPREFIX",
            bnf,
            details,
        )
        .unwrap()
        .signed(key, wallet)
        .unwrap()
    }

    fn incoming(id: u16, zld: f64, bnf: Id) -> Txn {
        Txn::new(
            id,
            time("2018-06-26T00:00:00Z"),
            Amount::from_zld(zld),
            "NOPREFIX",
            bnf,
            "payment",
        )
        .unwrap()
    }

    #[test]
    fn join_is_idempotent() {
        let key = test_key();
        let id = Id::new(0xbeef);
        let mut a = body(id, &key);
        a.txns.push(incoming(1, 10.0, Id::new(2)));
        a.txns.push(outgoing(1, 3.0, Id::new(2), "back", &key, id));

        let mut patch = Patch::new();
        patch.join(&a).unwrap();
        patch.join(&a).unwrap();
        patch.join(&a).unwrap();
        assert_eq!(patch.txns().len(), 2);
    }

    #[test]
    fn join_commutes_for_equal_rank() {
        let key = test_key();
        let id = Id::new(0xbeef);
        let mut x = body(id, &key);
        x.txns.push(incoming(1, 10.0, Id::new(2)));
        x.txns.push(outgoing(1, 3.0, Id::new(2), "first", &key, id));
        let mut y = x.clone();
        y.txns.push(outgoing(2, 4.0, Id::new(3), "second", &key, id));

        let dir = tempfile::TempDir::new().unwrap();
        let p1 = dir.path().join("xy.z");
        let p2 = dir.path().join("yx.z");

        let mut xy = Patch::new();
        xy.join(&x).unwrap();
        xy.join(&y).unwrap();
        xy.save(&p1, false).unwrap();

        let mut yx = Patch::new();
        yx.join(&y).unwrap();
        yx.join(&x).unwrap();
        yx.save(&p2, false).unwrap();

        assert_eq!(
            std::fs::read_to_string(&p1).unwrap(),
            std::fs::read_to_string(&p2).unwrap()
        );
    }

    #[test]
    fn double_spend_keeps_the_stronger_copy() {
        let key = test_key();
        let id = Id::new(0xbeef);
        let mut base = body(id, &key);
        base.txns.push(incoming(1, 10.0, Id::new(7)));

        let mut strong = base.clone();
        strong
            .txns
            .push(outgoing(1, 5.0, Id::new(2), "to alice", &key, id));
        let mut weak = base.clone();
        weak.txns
            .push(outgoing(1, 5.0, Id::new(3), "to bob", &key, id));

        let mut patch = Patch::new();
        patch.join(&strong).unwrap();
        patch.join(&weak).unwrap();
        let spends: Vec<&Txn> = patch
            .txns()
            .iter()
            .filter(|t| t.amount.is_negative())
            .collect();
        assert_eq!(spends.len(), 1);
        assert_eq!(spends[0].bnf, Id::new(2));
    }

    #[test]
    fn unverifiable_signature_never_survives() {
        let key = test_key();
        let stranger = test_key();
        let id = Id::new(0xbeef);
        let mut base = body(id, &key);
        base.txns.push(incoming(1, 10.0, Id::new(7)));
        let mut forged = base.clone();
        forged
            .txns
            .push(outgoing(1, 5.0, Id::new(2), "forged", &stranger, id));

        let mut patch = Patch::new();
        patch.join(&base).unwrap();
        patch.join(&forged).unwrap();
        assert!(patch.txns().iter().all(|t| !t.amount.is_negative()));
    }

    #[test]
    fn negative_below_zero_is_skipped_for_non_root() {
        let key = test_key();
        let id = Id::new(0xbeef);
        let base = body(id, &key);
        let mut overdraft = base.clone();
        overdraft
            .txns
            .push(outgoing(1, 5.0, Id::new(2), "overdraft", &key, id));

        let mut patch = Patch::new();
        patch.join(&base).unwrap();
        patch.join(&overdraft).unwrap();
        assert!(patch.txns().is_empty());
    }

    #[test]
    fn root_wallet_may_go_negative() {
        let key = test_key();
        let base = body(Id::ROOT, &key);
        let mut issue = base.clone();
        issue
            .txns
            .push(outgoing(1, 1000.0, Id::new(2), "issuance", &key, Id::ROOT));

        let mut patch = Patch::new();
        patch.join(&base).unwrap();
        patch.join(&issue).unwrap();
        assert_eq!(patch.txns().len(), 1);
    }

    #[test]
    fn signed_positive_is_evidence_of_tampering() {
        let key = test_key();
        let id = Id::new(0xbeef);
        let base = body(id, &key);
        let mut tampered = base.clone();
        let mut fake = incoming(1, 100.0, Id::new(2));
        fake.sign = "YWJj".to_string();
        tampered.txns.push(fake);

        let mut patch = Patch::new();
        patch.join(&base).unwrap();
        patch.join(&tampered).unwrap();
        assert!(patch.txns().is_empty());
    }

    #[test]
    fn rejects_foreign_bodies() {
        let key = test_key();
        let mut patch = Patch::new();
        patch.join(&body(Id::new(1), &key)).unwrap();
        assert!(patch.join(&body(Id::new(2), &key)).is_err());
        let mut other_net = body(Id::new(1), &key);
        other_net.network = "othernet".to_string();
        assert!(patch.join(&other_net).is_err());
        assert!(patch.join(&body(Id::new(1), &test_key())).is_err());
    }

    #[test]
    fn strict_mode_enforces_running_balance() {
        let key = test_key();
        let id = Id::new(0xbeef);
        let mut base = body(id, &key);
        // Income arrives later in the day than the spend is dated.
        base.txns.push(
            Txn::new(
                1,
                time("2018-06-26T23:00:00Z"),
                Amount::from_zld(10.0),
                "NOPREFIX",
                Id::new(7),
                "late income",
            )
            .unwrap(),
        );
        let mut candidate = base.clone();
        candidate
            .txns
            .push(outgoing(1, 5.0, Id::new(2), "early spend", &key, id));

        let mut lax = Patch::new();
        lax.join(&base).unwrap();
        lax.join(&candidate).unwrap();
        assert_eq!(lax.txns().len(), 2);

        let mut strict = Patch::new_strict();
        strict.join(&base).unwrap();
        strict.join(&candidate).unwrap();
        assert_eq!(strict.txns().len(), 1);
    }

    #[test]
    fn save_reports_change() {
        let key = test_key();
        let id = Id::new(0xbeef);
        let mut b = body(id, &key);
        b.txns.push(incoming(1, 10.0, Id::new(7)));
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("w.z");

        let mut patch = Patch::new();
        patch.join(&b).unwrap();
        assert!(patch.save(&path, false).unwrap());
        assert!(!patch.save(&path, true).unwrap());
        assert!(patch.save(&path, false).is_err());
    }
}
