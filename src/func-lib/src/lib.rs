mod config;
mod envelope;
mod node;
mod path_codec;
mod record;

pub use config::*;
pub use envelope::*;
pub use node::*;
pub use path_codec::*;
pub use record::*;

use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FnError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("name conflict: {0}")]
    Conflict(String),
    #[error("cycle detected: {0}")]
    CycleDetected(String),
    #[error("not empty: {0}")]
    NotEmpty(String),
    #[error("method mismatch: {0}")]
    MethodMismatch(String),
    #[error("invalid node kind: {0}")]
    InvalidKind(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("call timed out: {0}")]
    TimedOut(String),
    #[error("remote error (code {code}): {msg}")]
    RemoteError { code: String, msg: String },
    #[error("transport error: {0}")]
    TransportError(String),
    #[error("call cancelled: {0}")]
    Cancelled(String),

    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl FnError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FnError::NotFound(_))
    }

    /// Only failures where the runner may never have seen the call are worth
    /// retrying. A remote error is a well-formed answer from user code.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FnError::TimedOut(_) | FnError::TransportError(_))
    }
}

pub type FnResult<T> = std::result::Result<T, FnError>;

impl From<std::io::Error> for FnError {
    fn from(err: std::io::Error) -> Self {
        FnError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for FnError {
    fn from(err: serde_json::Error) -> Self {
        FnError::DecodeError(err.to_string())
    }
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Hex sha256 over the given source blobs, in order. Each blob is
/// prefixed with its little-endian u64 length so boundaries count.
pub fn hash_content<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let part = part.as_ref();
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}
