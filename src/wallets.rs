// Directory of wallets, keyed by Id. A thin handle over `$home/zold-wallets`.

use crate::error::Result;
use crate::id::Id;
use crate::wallet::{Wallet, EXT};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DIR: &str = "zold-wallets";

#[derive(Clone, Debug)]
pub struct Wallets {
    dir: PathBuf,
}

impl Wallets {
    pub fn new<P: AsRef<Path>>(home: P) -> Self {
        Wallets {
            dir: home.as_ref().join(DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, id: Id) -> PathBuf {
        self.dir.join(format!("{}.{}", id, EXT))
    }

    /// Handle for the wallet with this id; the file may not exist yet.
    pub fn wallet(&self, id: Id) -> Wallet {
        Wallet::new(self.path(id))
    }

    pub fn exists(&self, id: Id) -> bool {
        self.path(id).exists()
    }

    /// Ids of all wallet files present, unsorted.
    pub fn all(&self) -> Result<Vec<Id>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == EXT) != Some(true) {
                continue;
            }
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem,
                None => continue,
            };
            if let Ok(id) = Id::from_str(stem) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.all()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use crate::wallet::Wallet;
    use rsa::RsaPrivateKey;
    use tempfile::TempDir;

    #[test]
    fn lists_only_wallet_files() {
        let home = TempDir::new().unwrap();
        let wallets = Wallets::new(home.path());
        let mut rng = rand::thread_rng();
        let key = Key::from_private(RsaPrivateKey::new(&mut rng, 1024).unwrap());
        let id = Id::new(42);
        Wallet::init(&wallets.path(id), id, &key, "testnet", false).unwrap();
        std::fs::write(wallets.dir().join("junk.txt"), "noise").unwrap();
        std::fs::write(wallets.dir().join("badname.z"), "noise").unwrap();
        assert_eq!(wallets.all().unwrap(), vec![id]);
        assert_eq!(wallets.count().unwrap(), 1);
        assert!(wallets.exists(id));
        assert!(!wallets.exists(Id::new(43)));
    }
}
