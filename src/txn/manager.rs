use std::collections::hash_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use super::transaction::Transaction;
use crate::metrics::GraphFsMetrics;
use crate::model::{JournalEntry, JournalOp, Path};
use crate::primitives::checkpoint::Checkpoint;
use crate::primitives::journal::Journal;
use crate::types::{Context, GraphFsError, InodeId, Result, Xid};
use crate::vfs::{NodeHandle, OpenOptions, SuperBlock, VirtualGraph};

/// Outcome of [`TransactionManager::recover`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecoveryReport {
    /// Committed transactions re-applied.
    pub committed: usize,
    /// Transactions rolled back, explicitly or for lacking a terminal entry.
    pub rolled_back: usize,
    /// Committed transactions whose replay failed.
    pub failed: usize,
}

/// Owns the transaction lifecycle: begin, replay on commit, and recovery
/// from the journal.
pub struct TransactionManager {
    me: Weak<TransactionManager>,
    graph: Weak<VirtualGraph>,
    journal: Arc<dyn Journal>,
    checkpoint: Arc<dyn Checkpoint>,
    metrics: Arc<dyn GraphFsMetrics>,
    active: RwLock<FxHashMap<Xid, Arc<Transaction>>>,
    commit_lock: Mutex<()>,
    closed: AtomicBool,
}

impl TransactionManager {
    /// Manager applying committed transactions to `graph`.
    pub fn new(
        graph: Weak<VirtualGraph>,
        journal: Arc<dyn Journal>,
        checkpoint: Arc<dyn Checkpoint>,
        metrics: Arc<dyn GraphFsMetrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            graph,
            journal,
            checkpoint,
            metrics,
            active: RwLock::new(FxHashMap::default()),
            commit_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Journals a `Begin` entry and registers the new live transaction.
    pub fn begin_transaction(&self, ctx: &Context) -> Result<Arc<Transaction>> {
        ctx.check_cancel()?;
        let mut active = self.active.write();
        if self.closed.load(Ordering::Acquire) {
            return Err(GraphFsError::Closed);
        }
        let mut begin = JournalEntry::begin();
        let xid = self.journal.write(&mut begin)?;
        self.metrics.journal_appended();
        let tx = Arc::new(Transaction::live(
            begin,
            Arc::clone(&self.journal),
            self.me.clone(),
            Arc::clone(&self.metrics),
        ));
        active.insert(xid, Arc::clone(&tx));
        self.metrics.txn_begun();
        debug!(xid, "graphfs.txn.begin");
        Ok(tx)
    }

    /// Transactions that are neither committed nor rolled back.
    pub fn active_transactions(&self) -> Vec<Arc<Transaction>> {
        let mut txs: Vec<_> = self.active.read().values().cloned().collect();
        txs.sort_by_key(|tx| tx.xid());
        txs
    }

    pub(crate) fn deregister(&self, xid: Xid) {
        self.active.write().remove(&xid);
    }

    /// Applies a committed log to the backing stores through direct
    /// handles and advances the checkpoint.
    ///
    /// The log must open with `Begin`, end with `Commit`, and hold nothing
    /// after its first terminal entry. Replays are serialized; replaying the
    /// same log again leaves the stores unchanged.
    pub fn commit_transaction(&self, ctx: &Context, tx: &Transaction) -> Result<()> {
        let log = tx.log();
        validate_log(&log)?;
        let graph = self.graph.upgrade().ok_or(GraphFsError::Closed)?;

        let _guard = self.commit_lock.lock();
        let mut replay = Replay::default();
        let mut applied = replay.apply(ctx, &graph, &log);
        if applied.is_ok() {
            applied = replay.flush(ctx);
        }
        replay.close(ctx);
        applied?;

        let xid = tx.xid();
        match self.checkpoint.get()? {
            Some(current) if current >= xid => {}
            _ => self.checkpoint.update(xid)?,
        }
        self.metrics.txn_committed();
        debug!(xid, entries = log.len(), "graphfs.txn.replay");
        Ok(())
    }

    /// Re-applies every transaction committed past the checkpoint and rolls
    /// back those the journal never finished.
    pub fn recover(&self, ctx: &Context) -> Result<RecoveryReport> {
        ctx.check_cancel()?;
        let mut report = RecoveryReport::default();
        let checkpoint = self.checkpoint.get()?;
        if checkpoint.is_none() && self.journal.is_empty()? {
            return Ok(report);
        }
        let from = checkpoint.map_or(0, |xid| xid + 1);
        let entries = self.journal.iterate(from, None)?;
        info!(from, entries = entries.len(), "graphfs.txn.recover_start");

        let mut pending: BTreeMap<Xid, Arc<Transaction>> = BTreeMap::new();
        for entry in entries {
            ctx.check_cancel()?;
            let xid = entry.xid;
            if entry.op == JournalOp::Begin {
                let tx = Arc::new(Transaction::replay(
                    xid,
                    self.me.clone(),
                    Arc::clone(&self.metrics),
                ));
                tx.append(ctx, entry)?;
                pending.insert(xid, tx);
                continue;
            }
            let Some(tx) = pending.get(&xid).cloned() else {
                warn!(xid, op = ?entry.op, "graphfs.txn.recover_orphan");
                continue;
            };
            match entry.op {
                JournalOp::Commit => {
                    pending.remove(&xid);
                    match tx.commit(ctx) {
                        Ok(()) => {
                            report.committed += 1;
                            self.metrics.txn_recovered();
                        }
                        Err(err) => {
                            error!(xid, error = %err, "graphfs.txn.recover_failed");
                            report.failed += 1;
                        }
                    }
                }
                JournalOp::Rollback => {
                    pending.remove(&xid);
                    tx.rollback(ctx)?;
                    report.rolled_back += 1;
                }
                _ => {
                    if let Err(err) = tx.append(ctx, entry) {
                        error!(xid, error = %err, "graphfs.txn.recover_failed");
                        pending.remove(&xid);
                        tx.rollback(ctx)?;
                        report.failed += 1;
                    }
                }
            }
        }
        for (xid, tx) in pending {
            warn!(xid, "graphfs.txn.recover_incomplete");
            tx.rollback(ctx)?;
            report.rolled_back += 1;
        }
        info!(
            committed = report.committed,
            rolled_back = report.rolled_back,
            failed = report.failed,
            "graphfs.txn.recover_done"
        );
        Ok(report)
    }

    /// Rejects new transactions and rolls back the open ones. Later calls
    /// are no-ops.
    pub fn close(&self, ctx: &Context) -> Result<()> {
        let open: Vec<Arc<Transaction>> = {
            let active = self.active.write();
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            active.values().cloned().collect()
        };
        for tx in open {
            match tx.rollback(ctx) {
                Ok(()) | Err(GraphFsError::TransactionFinished) => {}
                Err(err) => return Err(err),
            }
        }
        debug!("graphfs.txn.manager_close");
        Ok(())
    }
}

fn validate_log(log: &[JournalEntry]) -> Result<()> {
    let Some(first) = log.first() else {
        return Err(GraphFsError::InvalidTransactionLog("empty log"));
    };
    if first.op != JournalOp::Begin {
        return Err(GraphFsError::InvalidTransactionLog("log does not start with begin"));
    }
    let mut finished = false;
    for entry in &log[1..] {
        if finished {
            return Err(GraphFsError::InvalidTransactionLog("entry after terminal op"));
        }
        match entry.op {
            JournalOp::Begin => {
                return Err(GraphFsError::InvalidTransactionLog("second begin"));
            }
            JournalOp::Commit | JournalOp::Rollback => finished = true,
            _ => {}
        }
    }
    match log.last() {
        Some(last) if last.op == JournalOp::Commit => Ok(()),
        _ => Err(GraphFsError::InvalidTransactionLog("log does not end with commit")),
    }
}

/// Direct handles opened while applying one log, by path and by inode.
#[derive(Default)]
struct Replay {
    by_path: FxHashMap<Path, NodeHandle>,
    by_inode: FxHashMap<InodeId, Path>,
}

impl Replay {
    fn handle(
        &mut self,
        ctx: &Context,
        graph: &VirtualGraph,
        entry: &JournalEntry,
    ) -> Result<&NodeHandle> {
        let path = match &entry.path {
            Some(path) => path.clone(),
            None => self
                .by_inode
                .get(&entry.inode)
                .cloned()
                .ok_or(GraphFsError::InvalidTransactionLog(
                    "mutation of an unopened inode has no path",
                ))?,
        };
        let handle = match self.by_path.entry(path) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let options = OpenOptions::create_if_missing().force_inode(entry.inode);
                let handle = graph.open(ctx, slot.key(), options)?;
                self.by_inode.insert(handle.inode()?.id(), slot.key().clone());
                slot.insert(handle)
            }
        };
        Ok(handle)
    }

    fn apply(&mut self, ctx: &Context, graph: &VirtualGraph, log: &[JournalEntry]) -> Result<()> {
        for entry in log.iter().filter(|entry| entry.op.is_mutation()) {
            ctx.check_cancel()?;
            let handle = self.handle(ctx, graph, entry)?;
            match (entry.op, &entry.node, &entry.edge) {
                (JournalOp::Create, _, _) => {}
                (JournalOp::Write, Some(node), _) => handle.write(ctx, node.clone())?,
                (JournalOp::SetEdge, _, Some(edge)) => handle.set_edge(ctx, edge.clone())?,
                (JournalOp::RemoveEdge, _, Some(edge)) => handle.remove_edge(ctx, &edge.key)?,
                _ => {
                    return Err(GraphFsError::InvalidTransactionLog(
                        "mutation without payload",
                    ))
                }
            }
        }
        Ok(())
    }

    fn superblocks(&self) -> Vec<Arc<SuperBlock>> {
        let mut seen: FxHashMap<String, Arc<SuperBlock>> = FxHashMap::default();
        for handle in self.by_path.values() {
            if let Some(sb) = handle.inode().ok().and_then(|inode| inode.superblock()) {
                seen.entry(sb.uuid().to_string()).or_insert(sb);
            }
        }
        seen.into_values().collect()
    }

    fn flush(&self, ctx: &Context) -> Result<()> {
        for sb in self.superblocks() {
            sb.flush(ctx)?;
        }
        Ok(())
    }

    fn close(self, ctx: &Context) {
        for (path, mut handle) in self.by_path {
            if let Err(err) = handle.close(ctx) {
                error!(path = %path, error = %err, "graphfs.txn.replay_close_failed");
            }
        }
    }
}
