use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use super::manager::TransactionManager;
use crate::metrics::GraphFsMetrics;
use crate::model::{
    now_unix_nanos, EdgeFlags, EdgeKey, JournalEntry, JournalOp, Path, SerializedEdge,
    SerializedNode,
};
use crate::primitives::journal::Journal;
use crate::types::{Context, GraphFsError, InodeId, Result, Xid};

/// Per-inode overlay folded from a transaction's log.
#[derive(Clone, Debug, Default)]
struct StagedNode {
    node: Option<SerializedNode>,
    edges: BTreeMap<EdgeKey, SerializedEdge>,
}

#[derive(Default)]
struct TxState {
    log: Vec<JournalEntry>,
    dirty: FxHashMap<InodeId, StagedNode>,
    created: FxHashMap<Path, InodeId>,
    done: bool,
}

/// A unit of journaled, atomically applied mutations.
///
/// A live transaction persists every appended entry to the journal before
/// staging it. A replay transaction, rebuilt by recovery from entries that
/// are already durable, has no journal.
pub struct Transaction {
    xid: Xid,
    journal: Option<Arc<dyn Journal>>,
    manager: Weak<TransactionManager>,
    metrics: Arc<dyn GraphFsMetrics>,
    state: Mutex<TxState>,
}

impl Transaction {
    /// Live transaction whose `Begin` entry was already journaled.
    pub(crate) fn live(
        begin: JournalEntry,
        journal: Arc<dyn Journal>,
        manager: Weak<TransactionManager>,
        metrics: Arc<dyn GraphFsMetrics>,
    ) -> Self {
        Self {
            xid: begin.xid,
            journal: Some(journal),
            manager,
            metrics,
            state: Mutex::new(TxState {
                log: vec![begin],
                ..TxState::default()
            }),
        }
    }

    /// Replay transaction for `xid`; its log is rebuilt through `append`.
    pub(crate) fn replay(
        xid: Xid,
        manager: Weak<TransactionManager>,
        metrics: Arc<dyn GraphFsMetrics>,
    ) -> Self {
        Self {
            xid,
            journal: None,
            manager,
            metrics,
            state: Mutex::new(TxState::default()),
        }
    }

    /// Transaction id assigned at `Begin`.
    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// False once committed or rolled back.
    pub fn is_open(&self) -> bool {
        !self.state.lock().done
    }

    /// True for transactions rebuilt by recovery.
    pub fn is_replay(&self) -> bool {
        self.journal.is_none()
    }

    /// Copy of the entries appended so far.
    pub fn log(&self) -> Vec<JournalEntry> {
        self.state.lock().log.clone()
    }

    /// Node payload staged for `inode`, if the transaction wrote one.
    pub fn staged_node(&self, inode: InodeId) -> Option<SerializedNode> {
        self.state
            .lock()
            .dirty
            .get(&inode)
            .and_then(|staged| staged.node.clone())
    }

    /// Staged edge (possibly a tombstone) for `inode` under `key`.
    pub fn staged_edge(&self, inode: InodeId, key: &EdgeKey) -> Option<SerializedEdge> {
        self.state
            .lock()
            .dirty
            .get(&inode)
            .and_then(|staged| staged.edges.get(key).cloned())
    }

    /// Snapshot of every staged edge for `inode`, tombstones included.
    pub fn staged_edges(&self, inode: InodeId) -> BTreeMap<EdgeKey, SerializedEdge> {
        self.state
            .lock()
            .dirty
            .get(&inode)
            .map(|staged| staged.edges.clone())
            .unwrap_or_default()
    }

    /// Inode this transaction created at `path`.
    pub fn created_inode(&self, path: &Path) -> Option<InodeId> {
        self.state.lock().created.get(path).copied()
    }

    /// Stamps `entry` with this transaction's xid, journals it (live
    /// transactions only), and folds it into the staged overlay.
    pub fn append(&self, ctx: &Context, entry: JournalEntry) -> Result<()> {
        ctx.check_cancel()?;
        let mut state = self.state.lock();
        if state.done {
            return Err(GraphFsError::TransactionFinished);
        }
        self.append_locked(&mut state, entry)
    }

    fn append_locked(&self, state: &mut TxState, mut entry: JournalEntry) -> Result<()> {
        validate_payload(&entry)?;
        entry.xid = self.xid;
        if entry.ts == 0 {
            entry.ts = now_unix_nanos();
        }
        if let Some(journal) = &self.journal {
            journal.write(&mut entry)?;
            self.metrics.journal_appended();
        }
        fold(state, &entry);
        state.log.push(entry);
        Ok(())
    }

    /// Journals `Commit` and applies the log to the backing stores.
    ///
    /// The transaction is finished even when the replay fails; the error is
    /// returned and the checkpoint is left where it was.
    pub fn commit(&self, ctx: &Context) -> Result<()> {
        ctx.check_cancel()?;
        {
            let mut state = self.state.lock();
            if state.done {
                return Err(GraphFsError::TransactionFinished);
            }
            self.append_locked(&mut state, JournalEntry::commit())?;
            state.done = true;
        }
        let manager = self.manager.upgrade().ok_or(GraphFsError::Closed)?;
        let applied = manager.commit_transaction(ctx, self);
        manager.deregister(self.xid);
        debug!(xid = self.xid, ok = applied.is_ok(), "graphfs.txn.commit");
        applied
    }

    /// Journals `Rollback` and discards the staged overlay.
    pub fn rollback(&self, _ctx: &Context) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.done {
                return Err(GraphFsError::TransactionFinished);
            }
            self.append_locked(&mut state, JournalEntry::rollback())?;
            state.done = true;
            state.dirty.clear();
            state.created.clear();
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.deregister(self.xid);
        }
        self.metrics.txn_rolled_back();
        debug!(xid = self.xid, replay = self.is_replay(), "graphfs.txn.rollback");
        Ok(())
    }
}

fn validate_payload(entry: &JournalEntry) -> Result<()> {
    match entry.op {
        JournalOp::Write if entry.node.is_none() => {
            Err(GraphFsError::Invalid("write entry has no node"))
        }
        JournalOp::SetEdge | JournalOp::RemoveEdge if entry.edge.is_none() => {
            Err(GraphFsError::Invalid("edge entry has no edge"))
        }
        JournalOp::Create if entry.path.is_none() => {
            Err(GraphFsError::Invalid("create entry has no path"))
        }
        _ => Ok(()),
    }
}

fn fold(state: &mut TxState, entry: &JournalEntry) {
    match entry.op {
        JournalOp::Create => {
            if let Some(path) = &entry.path {
                state.created.insert(path.clone(), entry.inode);
            }
        }
        JournalOp::Write => {
            let staged = state.dirty.entry(entry.inode).or_default();
            staged.node = entry.node.clone();
        }
        JournalOp::SetEdge => {
            if let Some(edge) = &entry.edge {
                let staged = state.dirty.entry(entry.inode).or_default();
                staged.edges.insert(edge.key.clone(), edge.clone());
            }
        }
        JournalOp::RemoveEdge => {
            if let Some(edge) = &entry.edge {
                let staged = state.dirty.entry(entry.inode).or_default();
                match staged.edges.get_mut(&edge.key) {
                    Some(existing) => existing.flags.insert(EdgeFlags::REMOVED),
                    None => {
                        let mut tombstone = edge.clone();
                        tombstone.flags.insert(EdgeFlags::REMOVED);
                        staged.edges.insert(tombstone.key.clone(), tombstone);
                    }
                }
            }
        }
        JournalOp::Begin | JournalOp::Commit | JournalOp::Rollback => {}
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("xid", &self.xid)
            .field("replay", &self.is_replay())
            .field("open", &self.is_open())
            .finish()
    }
}
