// Background updater: on every tick it probes each peer's `/` endpoint,
// refreshes the cached score, lets the remotes registry do its error
// bookkeeping, and asks the node to shut down when the cluster advertises a
// strictly newer version (unless --never-reboot).

use crate::error::{Error, Result};
use crate::node::NodeContext;
use log::{debug, info};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Production tick period.
pub const PERIOD: Duration = Duration::from_secs(60);

pub struct Metronome {
    handle: thread::JoinHandle<()>,
}

impl Metronome {
    pub fn start(ctx: Arc<NodeContext>, period: Duration) -> Metronome {
        let handle = thread::Builder::new()
            .name("metronome".to_string())
            .spawn(move || {
                let mut last = Instant::now() - period;
                while ctx.is_alive() {
                    if last.elapsed() < period {
                        thread::sleep(Duration::from_millis(50));
                        continue;
                    }
                    last = Instant::now();
                    let started = Instant::now();
                    if let Err(e) = tick(&ctx) {
                        debug!("Metronome tick failed: {}", e);
                    }
                    ctx.metronome.ticks.fetch_add(1, Ordering::Relaxed);
                    ctx.metronome
                        .last_tick_ms
                        .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                }
            })
            .expect("spawn metronome thread");
        Metronome { handle }
    }

    pub fn join(self) {
        let _ = self.handle.join();
    }
}

pub fn tick(ctx: &NodeContext) -> Result<()> {
    let best = ctx.best_score();
    ctx.remotes.iterate(Some(&best), |remote| {
        let resp = remote.get("/")?;
        if resp.status != 200 {
            return Err(Error::Peer(format!(
                "{}:{} answered {}",
                remote.host(),
                remote.port(),
                resp.status
            )));
        }
        let status = resp.json()?;
        if let Some(value) = status["score"]["value"].as_u64() {
            ctx.remotes.rescore(remote.host(), remote.port(), value)?;
        }
        if let Some(version) = status["version"].as_str() {
            if !ctx.never_reboot && newer(version, crate::VERSION) {
                info!(
                    "Peer {}:{} runs {}, we are behind with {}",
                    remote.host(),
                    remote.port(),
                    version,
                    crate::VERSION
                );
                ctx.request_shutdown("a newer version is available in the network");
            }
        }
        Ok(())
    })?;
    ctx.remotes.trim()?;
    Ok(())
}

/// Dotted-numeric version comparison; non-numeric segments count as zero.
fn newer(theirs: &str, ours: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.parse::<u64>().unwrap_or(0))
            .collect()
    };
    let a = parse(theirs);
    let b = parse(ours);
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        if x != y {
            return x > y;
        }
    }
    false
}
