//! Backing stores behind the filesystem seams.
//!
//! Production adapters live outside this crate; the in-memory store here
//! serves ephemeral graphs and tests.

/// In-process reference backing store.
pub mod memory;

pub use memory::{MemoryProvider, MemoryStore, ROOT_INODE};
