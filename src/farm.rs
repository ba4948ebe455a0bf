// The score farm: worker threads continuously extend the best known score
// for this node's identity. Workers coordinate through one mutex-guarded
// list; a commit only lands if the score it extends is still the best.
// Every advance is appended to the `farm` history file, which is replayed
// on startup.

use crate::atomic_file::AtomicFile;
use crate::error::Result;
use crate::score::Score;
use chrono::Utc;
use log::{debug, error, info};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// History file name under `$home`.
pub const HISTORY: &str = "farm";

/// How many scores the candidate pool keeps.
const POOL_CAP: usize = 8;

/// Nonces checked between alive/epoch polls in the inner loop.
const SPIN: u64 = 4096;

struct Inner {
    host: String,
    port: u16,
    invoice: String,
    strength: usize,
    threads: usize,
    scores: Mutex<Vec<Score>>,
    epoch: AtomicU64,
    alive: AtomicBool,
    history: AtomicFile,
}

pub struct Farm {
    inner: Arc<Inner>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Farm {
    /// Replay history, seed the pool and launch `threads` workers. With zero
    /// threads the farm only serves whatever history provided.
    pub fn start(
        home: &Path,
        host: &str,
        port: u16,
        invoice: &str,
        threads: usize,
        strength: usize,
    ) -> Result<Farm> {
        let history = AtomicFile::new(home.join(HISTORY));
        let mut pool = Vec::new();
        if history.exists() {
            let now = Utc::now();
            for line in history.read()?.lines() {
                if line.is_empty() {
                    continue;
                }
                match line.parse::<Score>() {
                    Ok(score) => {
                        if score.invoice == invoice
                            && score.host == host
                            && score.port == port
                            && score.strength == strength
                            && score.valid()
                            && !score.expired(now)
                        {
                            pool.push(score);
                        } else {
                            debug!("Stale or foreign score in history skipped: {}", line);
                        }
                    }
                    Err(_) => error!("Invalid score in farm history: {:?}", line),
                }
            }
        }
        if pool.is_empty() {
            pool.push(Score::new(Utc::now(), host, port, invoice, strength));
        }
        pool.sort_by(|a, b| b.value().cmp(&a.value()));
        pool.truncate(POOL_CAP);
        info!(
            "Farm starts with {} candidate(s), best is {}",
            pool.len(),
            pool[0].to_mnemo()
        );
        let inner = Arc::new(Inner {
            host: host.to_string(),
            port,
            invoice: invoice.to_string(),
            strength,
            threads,
            scores: Mutex::new(pool),
            epoch: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            history,
        });
        let mut workers = Vec::with_capacity(threads);
        for idx in 0..threads {
            let inner = Arc::clone(&inner);
            workers.push(
                thread::Builder::new()
                    .name(format!("farm-{}", idx))
                    .spawn(move || worker(inner, idx))
                    .expect("spawn farm worker"),
            );
        }
        Ok(Farm {
            inner,
            workers: Mutex::new(workers),
        })
    }

    /// Current scores, best first. Never empty.
    pub fn best(&self) -> Vec<Score> {
        self.inner.scores.lock().expect("farm pool poisoned").clone()
    }

    pub fn threads(&self) -> usize {
        self.inner.threads
    }

    pub fn to_json(&self) -> serde_json::Value {
        let best = self.best();
        json!({
            "threads": self.inner.threads,
            "farming": self.inner.alive.load(Ordering::Relaxed) && self.inner.threads > 0,
            "best": best.iter().map(|s| s.to_mnemo()).collect::<Vec<_>>(),
            "current": best[0].to_string(),
        })
    }

    pub fn to_text(&self) -> String {
        let best = self.best();
        let mut out = format!(
            "Threads: {}\nInvoice: {}\nStrength: {}\n",
            self.inner.threads, self.inner.invoice, self.inner.strength
        );
        for score in best {
            out.push_str(&score.to_string());
            out.push('\n');
        }
        out
    }

    /// Cooperative shutdown; joins all workers.
    pub fn stop(&self) {
        self.inner.alive.store(false, Ordering::Relaxed);
        let mut workers = self.workers.lock().expect("farm workers poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Farm {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker(inner: Arc<Inner>, idx: usize) {
    let stride = u64::MAX / inner.threads.max(1) as u64;
    let start = stride.wrapping_mul(idx as u64);
    while inner.alive.load(Ordering::Relaxed) {
        let epoch = inner.epoch.load(Ordering::Relaxed);
        let best = {
            let pool = inner.scores.lock().expect("farm pool poisoned");
            pool[0].clone()
        };
        if best.expired(Utc::now()) {
            reset(&inner, &best);
            continue;
        }
        if let Some(suffix) = search(&inner, &best, start, epoch) {
            commit(&inner, &best, &suffix);
        }
    }
}

/// Scan nonces from `start` until one extends `best`, the epoch moves, or the
/// farm stops. The SHA-256 state over `"<tail> "` is computed once and cloned
/// per candidate nonce.
fn search(inner: &Inner, best: &Score, start: u64, epoch: u64) -> Option<String> {
    let tail = best.tail();
    let mut base = Sha256::new();
    base.update(tail.as_bytes());
    base.update(b" ");
    let mut nonce = start;
    loop {
        for _ in 0..SPIN {
            let suffix = format!("{:x}", nonce);
            let mut hasher = base.clone();
            hasher.update(suffix.as_bytes());
            if digest_ends_in_zeros(&hasher.finalize(), inner.strength) {
                return Some(suffix);
            }
            nonce = nonce.wrapping_add(1);
        }
        if !inner.alive.load(Ordering::Relaxed) || inner.epoch.load(Ordering::Relaxed) != epoch {
            return None;
        }
    }
}

fn commit(inner: &Inner, base: &Score, suffix: &str) {
    let extended = base.extended(suffix);
    if !extended.valid() {
        return;
    }
    let mut pool = inner.scores.lock().expect("farm pool poisoned");
    if pool[0] != *base {
        // Another worker advanced first; this extension is stale.
        return;
    }
    info!("New score: {}", extended.to_mnemo());
    if let Err(e) = inner.history.append_line(&extended.to_string()) {
        error!("Can't append to farm history: {}", e);
    }
    pool.insert(0, extended);
    pool.sort_by(|a, b| b.value().cmp(&a.value()));
    pool.truncate(POOL_CAP);
    inner.epoch.fetch_add(1, Ordering::Relaxed);
}

fn reset(inner: &Inner, expired: &Score) {
    let now = Utc::now();
    let mut pool = inner.scores.lock().expect("farm pool poisoned");
    if pool[0] != *expired {
        return;
    }
    debug!("Score expired, restarting from zero: {}", expired.to_mnemo());
    pool.retain(|s| !s.expired(now));
    if pool.is_empty() {
        pool.push(Score::new(
            now,
            &inner.host,
            inner.port,
            &inner.invoice,
            inner.strength,
        ));
    }
    inner.epoch.fetch_add(1, Ordering::Relaxed);
}

/// `strength` trailing hex zeros, checked on the raw digest.
fn digest_ends_in_zeros(digest: &[u8], strength: usize) -> bool {
    let full = strength / 2;
    if digest.len() < full + 1 {
        return false;
    }
    if !digest[digest.len() - full..].iter().all(|b| *b == 0) {
        return false;
    }
    strength % 2 == 0 || digest[digest.len() - full - 1] & 0x0F == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::{ends_in_zeros, sha256_hex};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    const INVOICE: &str = "NOPREFIX@ffffffffffffffff";

    fn wait_for_value(farm: &Farm, value: usize, timeout: Duration) {
        let start = Instant::now();
        loop {
            if farm.best()[0].value() >= value {
                return;
            }
            if start.elapsed() > timeout {
                panic!("timeout waiting for farm to reach value {}", value);
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn digest_check_matches_hex_check() {
        for text in ["a", "b", "c", "seed", "another"] {
            let hash = sha256_hex(text);
            let digest = Sha256::digest(text.as_bytes());
            for strength in 1..=4 {
                assert_eq!(
                    ends_in_zeros(&hash, strength),
                    digest_ends_in_zeros(&digest, strength),
                    "disagree on {:?} at strength {}",
                    text,
                    strength
                );
            }
        }
    }

    #[test]
    fn mines_a_valid_score() {
        let home = TempDir::new().unwrap();
        let farm = Farm::start(home.path(), "localhost", 4096, INVOICE, 4, 2).unwrap();
        wait_for_value(&farm, 2, Duration::from_secs(60));
        let best = &farm.best()[0];
        assert!(best.value() >= 2);
        assert!(best.valid());
        assert!(best.tail().ends_with("00"));
        for _ in 0..100 {
            assert!(!farm.to_json()["best"].as_array().unwrap().is_empty());
        }
        farm.stop();
        let history = std::fs::read_to_string(home.path().join(HISTORY)).unwrap();
        assert!(history.lines().count() >= 2);
        for line in history.lines() {
            assert!(line.parse::<Score>().unwrap().valid());
        }
    }

    #[test]
    fn replays_history_and_drops_garbage() {
        let home = TempDir::new().unwrap();
        let good = Score::new(Utc::now(), "localhost", 4096, INVOICE, 4);
        let mut lines = String::new();
        lines.push_str("0/6: 2018-06-26ABCT00:32:43Z 178.128.165.12 4096 MIR@ffff\n");
        lines.push_str(&good.to_string());
        lines.push('\n');
        std::fs::write(home.path().join(HISTORY), lines).unwrap();
        let farm = Farm::start(home.path(), "localhost", 4096, INVOICE, 0, 4).unwrap();
        let best = farm.best();
        assert_eq!(best.len(), 1);
        assert_eq!(best[0], good);
        farm.stop();
    }

    #[test]
    fn foreign_history_entries_are_not_candidates() {
        let home = TempDir::new().unwrap();
        let foreign = Score::new(Utc::now(), "other.host", 4096, INVOICE, 4);
        std::fs::write(home.path().join(HISTORY), format!("{}\n", foreign)).unwrap();
        let farm = Farm::start(home.path(), "localhost", 4096, INVOICE, 0, 4).unwrap();
        let best = farm.best();
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].value(), 0);
        assert_eq!(best[0].host, "localhost");
        farm.stop();
    }

    #[test]
    fn zero_threads_serves_without_mining() {
        let home = TempDir::new().unwrap();
        let farm = Farm::start(home.path(), "localhost", 4096, INVOICE, 0, 6).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(farm.best()[0].value(), 0);
        assert!(!farm.to_json()["farming"].as_bool().unwrap());
        farm.stop();
    }
}
