//! Durable building blocks: positioned file I/O, the write-ahead journal, and
//! the checkpoint.

/// Durable high-water mark of applied transactions.
pub mod checkpoint;

/// Positioned file I/O.
pub mod io;

/// Write-ahead journal of transaction records.
pub mod journal;
