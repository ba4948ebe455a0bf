// The node: an explicit context object owning every shared subsystem. Route
// handlers, the entrance and the metronome all borrow it; nothing lives in
// process-global state.

pub mod entrance;
pub mod front;
pub mod http;
pub mod metronome;

use crate::farm::Farm;
use crate::remotes::Remotes;
use crate::score::Score;
use crate::wallets::Wallets;
use entrance::Entrance;
use log::info;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Metronome counters, updated by its thread and read by `/metronome`.
#[derive(Default)]
pub struct MetronomeStats {
    pub ticks: AtomicU64,
    pub last_tick_ms: AtomicU64,
}

impl MetronomeStats {
    pub fn to_text(&self) -> String {
        format!(
            "Ticks: {}\nLast tick: {}ms\n",
            self.ticks.load(Ordering::Relaxed),
            self.last_tick_ms.load(Ordering::Relaxed)
        )
    }
}

pub struct NodeContext {
    pub network: String,
    /// Advertised endpoint, what peers will dial.
    pub host: String,
    pub port: u16,
    pub home: PathBuf,
    pub wallets: Wallets,
    pub remotes: Remotes,
    pub farm: Farm,
    pub entrance: Entrance,
    pub metronome: MetronomeStats,
    pub strength: usize,
    pub halt_code: String,
    pub ignore_score_weakness: bool,
    pub never_reboot: bool,
    pub alive: AtomicBool,
    pub started: Instant,
}

impl NodeContext {
    pub fn best_score(&self) -> Score {
        self.farm.best().remove(0)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn request_shutdown(&self, reason: &str) {
        info!("Shutting down: {}", reason);
        self.alive.store(false, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}
