//! Error taxonomy.
//!
//! Grounded on `storage::buffer::BufferPoolError` / `wal::WalError`: one `thiserror`-derived
//! enum, `#[from]` for I/O, string payloads so a caller can log without a second lookup.
//! Invariant violations and device errors are not represented here — by design they are
//! fatal and unwind as a panic rather than a `Result`.

use thiserror::Error;

/// Errors returned to callers of the façade and file engine.
#[derive(Debug, Error)]
pub enum UnfsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("no space left on device")]
    NoSpace,

    #[error("invalid handle")]
    InvalidHandle,

    #[error("device i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type UnfsResult<T> = Result<T, UnfsError>;

impl UnfsError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn exists(msg: impl Into<String>) -> Self {
        Self::Exists(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }
}

/// Aborts the process after logging a diagnostic: invariant violations and device errors are
/// fatal, since UNFS keeps no journal to recover from and the process cleans up and aborts
/// instead. Treats impossible conditions as bugs, not recoverable errors.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        log::error!("unfs: fatal inconsistency: {msg}");
        panic!("unfs: fatal inconsistency: {msg}");
    }};
}
