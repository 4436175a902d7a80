//! Graph filesystem: a VFS-style namespace of superblocks, inodes, and a
//! directory-entry cache over pluggable backing stores, with a write-ahead
//! journal giving atomic multi-operation commits and crash recovery.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use graphfs::primitives::checkpoint::MemoryCheckpoint;
//! use graphfs::primitives::journal::MemoryJournal;
//! use graphfs::storage::MemoryProvider;
//! use graphfs::{Context, OpenOptions, Path, SerializedNode, VirtualGraph};
//!
//! let provider = MemoryProvider::new();
//! provider.add_graph("g");
//! let graph = VirtualGraph::new(
//!     Arc::new(provider),
//!     Arc::new(MemoryJournal::new()),
//!     Arc::new(MemoryCheckpoint::new()),
//! );
//! let ctx = Context::background();
//! let path: Path = "g//a".parse()?;
//! let tx = graph.begin_transaction(&ctx)?;
//! let mut handle = graph.open(&ctx, &path, OpenOptions::create_if_missing().transaction(&tx))?;
//! handle.write(&ctx, SerializedNode::default())?;
//! handle.close(&ctx)?;
//! tx.commit(&ctx)?;
//! # Ok::<(), graphfs::GraphFsError>(())
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod metrics;
pub mod model;
pub mod primitives;
pub mod storage;
pub mod txn;
pub mod types;
pub mod vfs;

pub use config::Config;
pub use metrics::{CounterMetrics, GraphFsMetrics, MetricsSnapshot, NoopMetrics};
pub use model::{
    EdgeFlags, EdgeKey, JournalEntry, JournalOp, NodeFlags, Path, PathElement, SerializedEdge,
    SerializedNode,
};
pub use txn::{
    RecoveryReport, ReplicationMessage, ReplicationSlot, Transaction, TransactionManager,
};
pub use types::{Context, GraphFsError, InodeId, Result, Xid};
pub use vfs::{CacheEntry, HandleKind, INode, NodeHandle, OpenFlags, OpenOptions, VirtualGraph};
