// Persistent peer table: a CSV of `host,port,score,errors` rows guarded by
// one mutex. Iteration yields peers best-ranked first and returns an explicit
// per-peer outcome; error bookkeeping and TOLERANCE-based eviction are
// applied once, at loop end.

use crate::atomic_file::AtomicFile;
use crate::error::{Error, Result};
use crate::node::http::{HttpClient, HttpResponse};
use crate::score::Score;
use log::{debug, error, info};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Peer file name under `$home`.
pub const FILE: &str = "zold-remotes";

/// Errors a peer may accumulate before eviction.
pub const TOLERANCE: u64 = 8;

/// A peer interaction longer than this counts as a failure.
pub const RUNTIME_LIMIT: Duration = Duration::from_secs(16);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Remote {
    pub host: String,
    pub port: u16,
    pub score: u64,
    pub errors: u64,
}

impl Remote {
    /// Low-error high-score peers first; errors degrade the rank five times
    /// faster than score lifts it.
    fn rank(&self, max_errors: u64, max_score: u64) -> f64 {
        (1.0 - self.errors as f64 / max_errors.max(1) as f64) * 5.0
            + self.score as f64 / max_score.max(1) as f64
    }
}

/// One peer visit during [`Remotes::iterate`].
#[derive(Debug)]
pub struct Outcome {
    pub host: String,
    pub port: u16,
    pub ok: bool,
    pub message: String,
    pub elapsed: Duration,
}

pub struct Remotes {
    /// `None` is the standalone registry: always empty, never mutates.
    file: Option<AtomicFile>,
    guard: Mutex<()>,
    runtime_limit: Duration,
}

impl Remotes {
    pub fn new<P: AsRef<Path>>(home: P) -> Self {
        Remotes {
            file: Some(AtomicFile::new(home.as_ref().join(FILE))),
            guard: Mutex::new(()),
            runtime_limit: RUNTIME_LIMIT,
        }
    }

    /// The registry for `--standalone` operation.
    pub fn standalone() -> Self {
        Remotes {
            file: None,
            guard: Mutex::new(()),
            runtime_limit: RUNTIME_LIMIT,
        }
    }

    pub fn with_runtime_limit(mut self, limit: Duration) -> Self {
        self.runtime_limit = limit;
        self
    }

    /// All peers, best-ranked first.
    pub fn all(&self) -> Result<Vec<Remote>> {
        let _guard = self.guard.lock().expect("remotes guard poisoned");
        let mut remotes = self.load()?;
        let max_errors = remotes.iter().map(|r| r.errors).max().unwrap_or(0);
        let max_score = remotes.iter().map(|r| r.score).max().unwrap_or(0);
        remotes.sort_by(|a, b| {
            b.rank(max_errors, max_score)
                .partial_cmp(&a.rank(max_errors, max_score))
                .expect("rank is never NaN")
                .then_with(|| (&a.host, a.port).cmp(&(&b.host, b.port)))
        });
        Ok(remotes)
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.all()?.len())
    }

    pub fn exists(&self, host: &str, port: u16) -> Result<bool> {
        Ok(self
            .all()?
            .iter()
            .any(|r| r.host == host && r.port == port))
    }

    pub fn add(&self, host: &str, port: u16) -> Result<()> {
        self.update(|remotes| {
            if !remotes.iter().any(|r| r.host == host && r.port == port) {
                info!("New remote registered: {}:{}", host, port);
                remotes.push(Remote {
                    host: host.to_string(),
                    port,
                    score: 0,
                    errors: 0,
                });
            }
        })
    }

    pub fn remove(&self, host: &str, port: u16) -> Result<()> {
        self.update(|remotes| {
            remotes.retain(|r| !(r.host == host && r.port == port));
        })
    }

    pub fn error(&self, host: &str, port: u16) -> Result<()> {
        self.update(|remotes| {
            for r in remotes.iter_mut() {
                if r.host == host && r.port == port {
                    r.errors += 1;
                }
            }
        })
    }

    pub fn errors(&self, host: &str, port: u16) -> Result<u64> {
        Ok(self
            .all()?
            .iter()
            .find(|r| r.host == host && r.port == port)
            .map(|r| r.errors)
            .unwrap_or(0))
    }

    pub fn rescore(&self, host: &str, port: u16, score: u64) -> Result<()> {
        self.update(|remotes| {
            for r in remotes.iter_mut() {
                if r.host == host && r.port == port {
                    r.score = score;
                }
            }
        })
    }

    /// Drop every peer whose error counter went past TOLERANCE.
    pub fn trim(&self) -> Result<()> {
        self.update(|remotes| {
            remotes.retain(|r| r.errors <= TOLERANCE);
        })
    }

    /// Visit every peer, best first, with an HTTP helper stamped with our
    /// best score. The visit outcome is recorded per peer: a failure (or a
    /// visit that outlives the runtime limit) increments the error counter,
    /// success resets it; eviction happens once, after the loop.
    pub fn iterate<F>(&self, best: Option<&Score>, mut visit: F) -> Result<Vec<Outcome>>
    where
        F: FnMut(&RemoteNode) -> Result<()>,
    {
        let mut outcomes = Vec::new();
        for remote in self.all()? {
            let node = RemoteNode::new(&remote.host, remote.port, best, self.runtime_limit);
            let started = Instant::now();
            let mut result = visit(&node);
            let elapsed = started.elapsed();
            if result.is_ok() && elapsed > self.runtime_limit {
                result = Err(Error::Peer("Took too long to execute".to_string()));
            }
            let outcome = match result {
                Ok(()) => Outcome {
                    host: remote.host,
                    port: remote.port,
                    ok: true,
                    message: String::new(),
                    elapsed,
                },
                Err(e) => {
                    error!("Remote {}:{} failed: {}", remote.host, remote.port, e);
                    Outcome {
                        host: remote.host,
                        port: remote.port,
                        ok: false,
                        message: e.to_string(),
                        elapsed,
                    }
                }
            };
            outcomes.push(outcome);
        }
        self.update(|remotes| {
            for outcome in &outcomes {
                for r in remotes.iter_mut() {
                    if r.host == outcome.host && r.port == outcome.port {
                        if outcome.ok {
                            r.errors = 0;
                        } else {
                            r.errors += 1;
                        }
                    }
                }
            }
            remotes.retain(|r| {
                if r.errors > TOLERANCE {
                    info!(
                        "Remote {}:{} evicted after {} errors",
                        r.host, r.port, r.errors
                    );
                    false
                } else {
                    true
                }
            });
        })?;
        Ok(outcomes)
    }

    fn update<F: FnOnce(&mut Vec<Remote>)>(&self, f: F) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let _guard = self.guard.lock().expect("remotes guard poisoned");
        let mut remotes = self.load()?;
        f(&mut remotes);
        self.save(&remotes)
    }

    fn load(&self) -> Result<Vec<Remote>> {
        let file = match &self.file {
            Some(file) => file,
            None => return Ok(Vec::new()),
        };
        if !file.exists() {
            return Ok(Vec::new());
        }
        let mut remotes = Vec::new();
        for line in file.read()?.lines() {
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Ok(remote) => remotes.push(remote),
                Err(_) => error!("Invalid remote line dropped: {:?}", line),
            }
        }
        Ok(remotes)
    }

    fn save(&self, remotes: &[Remote]) -> Result<()> {
        let file = match &self.file {
            Some(file) => file,
            None => return Ok(()),
        };
        let mut out = String::new();
        for r in remotes {
            out.push_str(&format!("{},{},{},{}\n", r.host, r.port, r.score, r.errors));
        }
        file.write(&out)
    }
}

fn parse_line(line: &str) -> Result<Remote> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() != 4 {
        return Err(Error::Corrupt(format!("remote line {:?}", line)));
    }
    Ok(Remote {
        host: parts[0].to_string(),
        port: parts[1]
            .parse()
            .map_err(|_| Error::Corrupt(format!("port in {:?}", line)))?,
        score: parts[2]
            .parse()
            .map_err(|_| Error::Corrupt(format!("score in {:?}", line)))?,
        errors: parts[3]
            .parse()
            .map_err(|_| Error::Corrupt(format!("errors in {:?}", line)))?,
    })
}

/// A peer handle passed to the [`Remotes::iterate`] visitor: plain HTTP
/// with this node's best score stamped on every request.
pub struct RemoteNode {
    host: String,
    port: u16,
    headers: Vec<(String, String)>,
    timeout: Duration,
}

impl RemoteNode {
    fn new(host: &str, port: u16, best: Option<&Score>, timeout: Duration) -> Self {
        let mut headers = vec![("X-Zold-Version".to_string(), crate::VERSION.to_string())];
        if let Some(score) = best {
            headers.push(("X-Zold-Score".to_string(), score.to_header()));
        }
        RemoteNode {
            host: host.to_string(),
            port,
            headers,
            timeout,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn get(&self, path: &str) -> Result<HttpResponse> {
        debug!("GET http://{}:{}{}", self.host, self.port, path);
        HttpClient::new(&self.host, self.port, self.timeout).get(path, &self.headers)
    }

    pub fn put(&self, path: &str, body: &str) -> Result<HttpResponse> {
        debug!("PUT http://{}:{}{}", self.host, self.port, path);
        HttpClient::new(&self.host, self.port, self.timeout).put(path, &self.headers, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn adds_removes_and_lists() {
        let home = TempDir::new().unwrap();
        let remotes = Remotes::new(home.path());
        remotes.add("a.example.com", 4096).unwrap();
        remotes.add("a.example.com", 4096).unwrap();
        remotes.add("b.example.com", 80).unwrap();
        assert_eq!(remotes.count().unwrap(), 2);
        assert!(remotes.exists("a.example.com", 4096).unwrap());
        remotes.remove("a.example.com", 4096).unwrap();
        assert!(!remotes.exists("a.example.com", 4096).unwrap());
    }

    #[test]
    fn ranking_prefers_low_errors_and_high_score() {
        let home = TempDir::new().unwrap();
        let remotes = Remotes::new(home.path());
        remotes.add("weak", 1).unwrap();
        remotes.add("strong", 2).unwrap();
        remotes.rescore("strong", 2, 20).unwrap();
        remotes.rescore("weak", 1, 20).unwrap();
        for _ in 0..3 {
            remotes.error("weak", 1).unwrap();
        }
        let all = remotes.all().unwrap();
        assert_eq!(all[0].host, "strong");
    }

    #[test]
    fn eviction_after_tolerance_and_reset_on_success() {
        let home = TempDir::new().unwrap();
        let remotes = Remotes::new(home.path()).with_runtime_limit(Duration::from_secs(1));
        remotes.add("flaky", 4096).unwrap();
        for i in 0..TOLERANCE {
            remotes
                .iterate(None, |_| Err(Error::Peer("refused".to_string())))
                .unwrap();
            assert_eq!(remotes.errors("flaky", 4096).unwrap(), i + 1);
        }
        assert!(remotes.exists("flaky", 4096).unwrap());
        // One success wipes the slate.
        remotes.iterate(None, |_| Ok(())).unwrap();
        assert_eq!(remotes.errors("flaky", 4096).unwrap(), 0);
        // TOLERANCE + 1 consecutive failures evict.
        for _ in 0..=TOLERANCE {
            remotes
                .iterate(None, |_| Err(Error::Peer("refused".to_string())))
                .unwrap();
        }
        assert!(!remotes.exists("flaky", 4096).unwrap());
    }

    #[test]
    fn slow_visit_is_a_failure() {
        let home = TempDir::new().unwrap();
        let remotes = Remotes::new(home.path()).with_runtime_limit(Duration::from_millis(50));
        remotes.add("sleepy", 4096).unwrap();
        let outcomes = remotes
            .iterate(None, |_| {
                std::thread::sleep(Duration::from_millis(120));
                Ok(())
            })
            .unwrap();
        assert!(!outcomes[0].ok);
        assert_eq!(outcomes[0].message, "peer: Took too long to execute");
        assert_eq!(remotes.errors("sleepy", 4096).unwrap(), 1);
    }

    #[test]
    fn garbage_csv_lines_are_dropped() {
        let home = TempDir::new().unwrap();
        std::fs::write(
            home.path().join(FILE),
            "good.example.com,4096,5,0\nthis is not a remote\nbad.example.com,notaport,0,0\n",
        )
        .unwrap();
        let remotes = Remotes::new(home.path());
        let all = remotes.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].host, "good.example.com");
    }

    #[test]
    fn standalone_registry_stays_empty() {
        let remotes = Remotes::standalone();
        remotes.add("a.example.com", 4096).unwrap();
        assert_eq!(remotes.count().unwrap(), 0);
        let outcomes = remotes.iterate(None, |_| Ok(())).unwrap();
        assert!(outcomes.is_empty());
    }
}
