use std::time::{SystemTime, UNIX_EPOCH};

use super::path::Path;
use super::record::{SerializedEdge, SerializedNode};
use crate::types::{GraphFsError, InodeId, Result, Xid};

/// Operation recorded by a [`JournalEntry`].
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum JournalOp {
    /// Opens a transaction; the journal assigns its xid.
    Begin = 1,
    /// Terminal: the transaction's log must be applied.
    Commit = 2,
    /// Terminal: the transaction's log is discarded.
    Rollback = 3,
    /// A node was created at `path` with id `inode`.
    Create = 4,
    /// Node payload replaced.
    Write = 5,
    /// Edge inserted or replaced by key.
    SetEdge = 6,
    /// Edge removed by key.
    RemoveEdge = 7,
}

impl JournalOp {
    /// Wire byte for this op.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for `Commit` and `Rollback`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, JournalOp::Commit | JournalOp::Rollback)
    }

    /// True for ops that change node or edge state.
    pub const fn is_mutation(self) -> bool {
        matches!(
            self,
            JournalOp::Create | JournalOp::Write | JournalOp::SetEdge | JournalOp::RemoveEdge
        )
    }
}

impl TryFrom<u8> for JournalOp {
    type Error = GraphFsError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(JournalOp::Begin),
            2 => Ok(JournalOp::Commit),
            3 => Ok(JournalOp::Rollback),
            4 => Ok(JournalOp::Create),
            5 => Ok(JournalOp::Write),
            6 => Ok(JournalOp::SetEdge),
            7 => Ok(JournalOp::RemoveEdge),
            _ => Err(GraphFsError::Corruption("unknown journal op")),
        }
    }
}

/// One record of the write-ahead journal; the sole source of truth for
/// recovery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JournalEntry {
    /// Operation.
    pub op: JournalOp,
    /// Owning transaction; zero until stamped.
    pub xid: Xid,
    /// Unix timestamp in nanoseconds; zero until stamped.
    pub ts: i64,
    /// Inode the op applies to; zero for lifecycle ops.
    pub inode: InodeId,
    /// Path of the inode, when known.
    pub path: Option<Path>,
    /// Node payload for `Write`.
    pub node: Option<SerializedNode>,
    /// Edge payload for `SetEdge` / `RemoveEdge`.
    pub edge: Option<SerializedEdge>,
}

impl JournalEntry {
    /// Entry with only an op set.
    pub fn new(op: JournalOp) -> Self {
        Self {
            op,
            xid: 0,
            ts: 0,
            inode: 0,
            path: None,
            node: None,
            edge: None,
        }
    }

    /// `Begin` marker.
    pub fn begin() -> Self {
        Self::new(JournalOp::Begin)
    }

    /// `Commit` marker.
    pub fn commit() -> Self {
        Self::new(JournalOp::Commit)
    }

    /// `Rollback` marker.
    pub fn rollback() -> Self {
        Self::new(JournalOp::Rollback)
    }

    /// Creation of `inode` at `path`.
    pub fn create(inode: InodeId, path: Path) -> Self {
        Self {
            inode,
            path: Some(path),
            ..Self::new(JournalOp::Create)
        }
    }

    /// Payload replacement for `inode`.
    pub fn write(inode: InodeId, path: Path, node: SerializedNode) -> Self {
        Self {
            inode,
            path: Some(path),
            node: Some(node),
            ..Self::new(JournalOp::Write)
        }
    }

    /// Edge upsert on `inode`.
    pub fn set_edge(inode: InodeId, path: Path, edge: SerializedEdge) -> Self {
        Self {
            inode,
            path: Some(path),
            edge: Some(edge),
            ..Self::new(JournalOp::SetEdge)
        }
    }

    /// Edge removal on `inode`; `edge` carries the key.
    pub fn remove_edge(inode: InodeId, path: Path, edge: SerializedEdge) -> Self {
        Self {
            inode,
            path: Some(path),
            edge: Some(edge),
            ..Self::new(JournalOp::RemoveEdge)
        }
    }
}

/// Current wall-clock time in unix nanoseconds.
pub fn now_unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or(0)
}
