// Per-wallet set of candidate bodies fetched from peers. A copy file is
// immutable once written; re-adding the same body is idempotent (dedup by
// content hash). Each source host contributes one score row to the sidecar,
// and a copy is ranked by the sum of its non-expired rows.
//
// Layout: `zold-copies/<id>/<n>` plus a `scores` sidecar with
// `n,host,port,score,time` lines.

use crate::atomic_file::AtomicFile;
use crate::error::{Error, Result};
use crate::id::Id;
use crate::txn::{format_time, parse_time};
use chrono::{DateTime, Duration, Utc};
use log::error;
use std::fs;
use std::path::{Path, PathBuf};

pub const DIR: &str = "zold-copies";

/// Score rows older than this no longer count.
pub const MAX_AGE_HOURS: i64 = 24;

#[derive(Clone, Debug)]
pub struct CopyHost {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub score: u64,
    pub time: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct Copy {
    pub name: String,
    pub path: PathBuf,
    /// Sum of the non-expired score rows pointing at this copy.
    pub score: u64,
}

pub struct Copies {
    dir: PathBuf,
}

impl Copies {
    pub fn new<P: AsRef<Path>>(home: P, id: Id) -> Self {
        Copies {
            dir: home.as_ref().join(DIR).join(id.to_string()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store `body` as a copy credited to `host:port` with the given score.
    /// Returns the copy name, reusing an existing one when the content is
    /// already known.
    pub fn add(
        &self,
        body: &str,
        host: &str,
        port: u16,
        score: u64,
        time: DateTime<Utc>,
    ) -> Result<String> {
        fs::create_dir_all(&self.dir)?;
        let name = match self.find_identical(body)? {
            Some(name) => name,
            None => {
                let name = (self.max_name()? + 1).to_string();
                AtomicFile::new(self.dir.join(&name)).write(body)?;
                name
            }
        };
        let mut rows = self.load_hosts()?;
        rows.retain(|r| !(r.host == host && r.port == port));
        rows.push(CopyHost {
            name: name.clone(),
            host: host.to_string(),
            port,
            score,
            time,
        });
        self.save_hosts(&rows)?;
        Ok(name)
    }

    /// All copies, strongest first.
    pub fn all(&self) -> Result<Vec<Copy>> {
        let now = Utc::now();
        let rows = self.load_hosts()?;
        let mut copies = Vec::new();
        if !self.dir.exists() {
            return Ok(copies);
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if name.parse::<u64>().is_err() {
                continue;
            }
            let score = rows
                .iter()
                .filter(|r| r.name == name && !expired(r.time, now))
                .map(|r| r.score)
                .sum();
            copies.push(Copy { name, path, score });
        }
        copies.sort_by(|a, b| b.score.cmp(&a.score).then(a.name.cmp(&b.name)));
        Ok(copies)
    }

    pub fn load(&self, name: &str) -> Result<String> {
        AtomicFile::new(self.dir.join(name)).read()
    }

    /// Drop expired score rows and copies left with no rows at all.
    pub fn clean(&self) -> Result<usize> {
        let now = Utc::now();
        let mut rows = self.load_hosts()?;
        rows.retain(|r| !expired(r.time, now));
        self.save_hosts(&rows)?;
        let mut removed = 0;
        for copy in self.all()? {
            if !rows.iter().any(|r| r.name == copy.name) {
                fs::remove_file(&copy.path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn find_identical(&self, body: &str) -> Result<Option<String>> {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(body.as_bytes());
        for copy in self.all()? {
            let existing = self.load(&copy.name)?;
            if Sha256::digest(existing.as_bytes()) == digest {
                return Ok(Some(copy.name));
            }
        }
        Ok(None)
    }

    fn max_name(&self) -> Result<u64> {
        let mut max = 0;
        if !self.dir.exists() {
            return Ok(0);
        }
        for entry in fs::read_dir(&self.dir)? {
            if let Some(name) = entry?.path().file_name().and_then(|n| n.to_str()) {
                if let Ok(n) = name.parse::<u64>() {
                    max = max.max(n);
                }
            }
        }
        Ok(max)
    }

    fn scores_file(&self) -> AtomicFile {
        AtomicFile::new(self.dir.join("scores"))
    }

    fn load_hosts(&self) -> Result<Vec<CopyHost>> {
        let file = self.scores_file();
        if !file.exists() {
            return Ok(Vec::new());
        }
        let mut rows = Vec::new();
        for line in file.read()?.lines() {
            if line.is_empty() {
                continue;
            }
            match parse_host_line(line) {
                Ok(row) => rows.push(row),
                Err(_) => error!("Invalid copy score line dropped: {:?}", line),
            }
        }
        Ok(rows)
    }

    fn save_hosts(&self, rows: &[CopyHost]) -> Result<()> {
        let mut out = String::new();
        for r in rows {
            out.push_str(&format!(
                "{},{},{},{},{}\n",
                r.name,
                r.host,
                r.port,
                r.score,
                format_time(r.time)
            ));
        }
        self.scores_file().write(&out)
    }
}

fn expired(time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - time > Duration::hours(MAX_AGE_HOURS)
}

fn parse_host_line(line: &str) -> Result<CopyHost> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() != 5 {
        return Err(Error::Corrupt(format!("copy score line {:?}", line)));
    }
    Ok(CopyHost {
        name: parts[0].to_string(),
        host: parts[1].to_string(),
        port: parts[2]
            .parse()
            .map_err(|_| Error::Corrupt(format!("port in {:?}", line)))?,
        score: parts[3]
            .parse()
            .map_err(|_| Error::Corrupt(format!("score in {:?}", line)))?,
        time: parse_time(parts[4]).map_err(|_| Error::Corrupt(format!("time in {:?}", line)))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn copies(home: &TempDir) -> Copies {
        Copies::new(home.path(), Id::new(0xaaaa))
    }

    #[test]
    fn adds_and_ranks_copies() {
        let home = TempDir::new().unwrap();
        let c = copies(&home);
        let now = Utc::now();
        c.add("body one", "1.1.1.1", 4096, 3, now).unwrap();
        c.add("body two", "2.2.2.2", 4096, 10, now).unwrap();
        let all = c.all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].score, 10);
        assert_eq!(c.load(&all[0].name).unwrap(), "body two");
    }

    #[test]
    fn same_body_is_deduplicated_and_scores_accumulate() {
        let home = TempDir::new().unwrap();
        let c = copies(&home);
        let now = Utc::now();
        let n1 = c.add("the body", "1.1.1.1", 4096, 3, now).unwrap();
        let n2 = c.add("the body", "2.2.2.2", 4096, 4, now).unwrap();
        assert_eq!(n1, n2);
        let all = c.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].score, 7);
    }

    #[test]
    fn same_source_rescores_instead_of_accumulating() {
        let home = TempDir::new().unwrap();
        let c = copies(&home);
        let now = Utc::now();
        c.add("the body", "1.1.1.1", 4096, 3, now).unwrap();
        c.add("the body", "1.1.1.1", 4096, 5, now).unwrap();
        assert_eq!(c.all().unwrap()[0].score, 5);
    }

    #[test]
    fn clean_drops_expired_copies() {
        let home = TempDir::new().unwrap();
        let c = copies(&home);
        let stale = Utc::now() - Duration::hours(MAX_AGE_HOURS + 1);
        c.add("old body", "1.1.1.1", 4096, 3, stale).unwrap();
        c.add("new body", "2.2.2.2", 4096, 2, Utc::now()).unwrap();
        assert_eq!(c.clean().unwrap(), 1);
        let all = c.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(c.load(&all[0].name).unwrap(), "new body");
    }
}
