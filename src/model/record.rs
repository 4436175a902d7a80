use std::ops::{BitOr, BitOrAssign};

use super::path::{EdgeKey, Path};
use crate::types::{InodeId, Xid};

/// `xmax` value of an edge that is still visible.
pub const XMAX_OPEN: Xid = u64::MAX;

macro_rules! record_flags {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $bit:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
        pub struct $name(u8);

        impl $name {
            /// No bits set.
            pub const NONE: Self = Self(0);
            $($(#[$fmeta])* pub const $flag: Self = Self($bit);)+

            /// Raw bit representation.
            pub const fn bits(self) -> u8 {
                self.0
            }

            /// Rebuilds flags from raw bits, keeping unknown bits.
            pub const fn from_bits(bits: u8) -> Self {
                Self(bits)
            }

            /// True when every bit of `other` is set.
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// Sets the bits of `other`.
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            /// Clears the bits of `other`.
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

record_flags! {
    /// Bitmask carried by [`SerializedNode::flags`].
    NodeFlags {
        /// Node carries inline data.
        HAS_DATA = 0x01,
        /// Node data is a link to external content.
        HAS_DATA_LINK = 0x02,
        /// Node is a tombstone.
        REMOVED = 0x04,
        /// Cached copy is stale and must be re-read.
        INVALID = 0x08,
    }
}

record_flags! {
    /// Bitmask carried by [`SerializedEdge::flags`].
    EdgeFlags {
        /// Ordinary edge owned by its source node.
        REGULAR = 0x01,
        /// Edge points at a node owned elsewhere.
        LINK = 0x02,
        /// Edge is a tombstone.
        REMOVED = 0x04,
    }
}

/// Durable, opaque node payload as stored by a backing store.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SerializedNode {
    /// Inode id of this node.
    pub index: InodeId,
    /// Inode id of the parent node.
    pub parent: InodeId,
    /// Per-inode version counter maintained by the writer.
    pub version: u64,
    /// Path the node was written under.
    pub path: Path,
    /// Node flags.
    pub flags: NodeFlags,
    /// Type name of the payload.
    pub node_type: String,
    /// Encoded payload.
    pub data: Vec<u8>,
}

impl SerializedNode {
    /// True for tombstones.
    pub fn is_removed(&self) -> bool {
        self.flags.contains(NodeFlags::REMOVED)
    }
}

/// Durable edge record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SerializedEdge {
    /// Edge id within its source node.
    pub index: i64,
    /// Version counter maintained by the writer.
    pub version: u64,
    /// Edge flags.
    pub flags: EdgeFlags,
    /// Key of the edge under its source node.
    pub key: EdgeKey,
    /// Inode id of the target node.
    pub to_index: InodeId,
    /// Path of the target node when it lives outside the source's subtree.
    pub to_path: Option<Path>,
    /// Optional edge payload.
    pub data: Option<Vec<u8>>,
    /// Xid of the transaction that created the edge.
    pub xmin: Xid,
    /// Xid that hid the edge; [`XMAX_OPEN`] while visible.
    pub xmax: Xid,
}

impl SerializedEdge {
    /// A regular, visible edge from the current node to `to_index`.
    pub fn new(key: EdgeKey, to_index: InodeId) -> Self {
        Self {
            index: 0,
            version: 0,
            flags: EdgeFlags::REGULAR,
            key,
            to_index,
            to_path: None,
            data: None,
            xmin: 0,
            xmax: XMAX_OPEN,
        }
    }

    /// Tombstone carrying only a key; used by `RemoveEdge` journal entries.
    pub fn tombstone(key: EdgeKey) -> Self {
        Self {
            flags: EdgeFlags::REMOVED,
            ..Self::new(key, 0)
        }
    }

    /// True for tombstones.
    pub fn is_removed(&self) -> bool {
        self.flags.contains(EdgeFlags::REMOVED)
    }
}
