// Peer-to-peer payment node: append-only wallet ledgers gossiped over HTTP,
// reconciled by a commutative merge, ranked by proof-of-work scores.

pub mod amount;
pub mod atomic_file;
pub mod copies;
pub mod error;
pub mod farm;
pub mod id;
pub mod key;
pub mod node;
pub mod patch;
pub mod remotes;
pub mod score;
pub mod txn;
pub mod wallet;
pub mod wallets;

/// Wire protocol generation; peers on another protocol are refused.
pub const PROTOCOL: u16 = 2;

/// Software version, advertised in X-Zold-Version and on `/version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default network name; wallets and peers from other networks are refused.
pub const NETWORK: &str = "zold";
