use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use crate::txn::Transaction;
use crate::types::InodeId;

/// Access and creation flags for [`VirtualGraph::open`](super::VirtualGraph::open).
#[derive(Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// No flags; `open` substitutes [`OpenFlags::READ`].
    pub const NONE: Self = Self(0);
    /// Reads are permitted.
    pub const READ: Self = Self(1 << 0);
    /// Mutations are permitted.
    pub const WRITE: Self = Self(1 << 1);
    /// Create the node when the path resolves to a cached miss.
    pub const CREATE: Self = Self(1 << 2);
    /// With `CREATE`, fail if the node already exists.
    pub const EXCLUSIVE: Self = Self(1 << 3);

    /// True when every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when no bits are set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::READ, "READ"),
            (Self::WRITE, "WRITE"),
            (Self::CREATE, "CREATE"),
            (Self::EXCLUSIVE, "EXCLUSIVE"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// Options for opening a node handle.
///
/// Binding a transaction makes the handle transactional: its mutations are
/// journaled and staged instead of reaching the backing store.
#[derive(Clone, Default)]
pub struct OpenOptions {
    /// Access flags.
    pub flags: OpenFlags,
    /// Transaction the handle stages its mutations in.
    pub transaction: Option<Arc<Transaction>>,
    /// Inode id to use when the open creates the node.
    pub force_inode: Option<InodeId>,
}

impl OpenOptions {
    /// Read-only options.
    pub fn new() -> Self {
        Self::with_flags(OpenFlags::READ)
    }

    /// Options with exactly `flags`.
    pub fn with_flags(flags: OpenFlags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    /// Read-write options that create the node when it is missing.
    pub fn create_if_missing() -> Self {
        Self::with_flags(OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE)
    }

    /// Adds `flags`.
    pub fn flag(mut self, flags: OpenFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Binds `tx`.
    pub fn transaction(mut self, tx: &Arc<Transaction>) -> Self {
        self.transaction = Some(Arc::clone(tx));
        self
    }

    /// Forces the inode id of a created node.
    pub fn force_inode(mut self, id: InodeId) -> Self {
        self.force_inode = Some(id);
        self
    }
}

impl fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenOptions")
            .field("flags", &self.flags)
            .field("xid", &self.transaction.as_ref().map(|tx| tx.xid()))
            .field("force_inode", &self.force_inode)
            .finish()
    }
}
