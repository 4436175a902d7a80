#![forbid(unsafe_code)]
//! Shared identifiers, the crate error type, and the cancellation context.

/// Checksum helpers shared by the journal and checkpoint formats.
pub mod checksum;
mod context;

pub use checksum::{Checksum, Crc32Fast};
pub use context::Context;

/// Transaction identifier assigned by the journal at `Begin`.
pub type Xid = u64;

/// Durable node identifier within one superblock.
pub type InodeId = i64;

/// Errors surfaced by the graph filesystem.
#[derive(thiserror::Error, Debug)]
pub enum GraphFsError {
    /// Underlying I/O failure, propagated verbatim from a backing store.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk data failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Caller supplied an invalid argument (owned message).
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// Path resolution or backing-store lookup missed.
    #[error("not found")]
    NotFound,
    /// Operation issued on a closed node handle.
    #[error("handle closed")]
    HandleClosed,
    /// Handle was not opened with the flags the operation needs.
    #[error("permission denied")]
    PermissionDenied,
    /// Exclusive create hit an existing node.
    #[error("already exists")]
    AlreadyExists,
    /// A transaction log could not be replayed.
    #[error("invalid transaction log: {0}")]
    InvalidTransactionLog(&'static str),
    /// Transaction was already committed or rolled back.
    #[error("transaction already finished")]
    TransactionFinished,
    /// No superblock is registered under the namespace.
    #[error("no such superblock: {0}")]
    NoSuchSuperBlock(String),
    /// Component was shut down.
    #[error("closed")]
    Closed,
    /// The operation's context was cancelled.
    #[error("cancelled")]
    Cancelled,
    /// Configuration could not be loaded.
    #[error("config: {0}")]
    Config(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GraphFsError>;

impl GraphFsError {
    /// Returns true for resolution misses.
    pub fn is_not_found(&self) -> bool {
        matches!(self, GraphFsError::NotFound)
    }
}

