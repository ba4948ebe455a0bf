// Crate-wide error taxonomy. Validation refusals surface as 400s at the HTTP
// front; integrity failures are logged and skipped by the merge; peer failures
// feed the remotes error counters.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Input refused before any state changed. Never retried.
    #[error("{0}")]
    Validation(String),

    /// Cryptographic or structural mismatch in otherwise well-formed input.
    #[error("integrity: {0}")]
    Integrity(String),

    /// A remote node misbehaved or went away.
    #[error("peer: {0}")]
    Peer(String),

    /// Persisted state that no longer parses.
    #[error("corrupt: {0}")]
    Corrupt(String),

    /// RSA key or signature machinery failed.
    #[error("crypto: {0}")]
    Crypto(String),

    #[error("amount overflow")]
    AmountOverflow,

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Error::Integrity(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
