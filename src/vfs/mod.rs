//! Virtual graph filesystem: superblocks, inodes, the cache-entry tree,
//! node handles, and the namespace router.
//!
//! Paths are rooted at a superblock UUID. Resolution walks the cache-entry
//! tree and asks the backing store only on a cache miss; misses are cached
//! as negative entries until invalidated.

mod entry;
mod graph;
mod handle;
mod inode;
mod options;
mod superblock;

/// Cache-entry tree.
pub use entry::CacheEntry;

/// Namespace router and public entry point.
pub use graph::VirtualGraph;

/// Open node capabilities.
pub use handle::{HandleKind, NodeHandle};

/// Refcounted in-memory inodes.
pub use inode::INode;

/// Open flags and options.
pub use options::{OpenFlags, OpenOptions};

/// Superblocks and the backing-store seams.
pub use superblock::{
    EdgeIter, INodeOperations, NodeHandleOperations, SuperBlock, SuperBlockProvider,
};
