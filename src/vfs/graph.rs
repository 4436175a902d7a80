use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use super::entry::CacheEntry;
use super::handle::NodeHandle;
use super::options::{OpenFlags, OpenOptions};
use super::superblock::{SuperBlock, SuperBlockProvider};
use crate::config::Config;
use crate::metrics::{default_metrics, GraphFsMetrics};
use crate::model::{JournalEntry, Path, SerializedEdge, SerializedNode};
use crate::primitives::checkpoint::Checkpoint;
use crate::primitives::journal::Journal;
use crate::txn::{
    RecoveryReport, ReplicationManager, ReplicationSlot, SlotStorage, Transaction,
    TransactionManager,
};
use crate::types::{Context, GraphFsError, Result};

/// Namespace router: resolves paths rooted at a superblock UUID and owns the
/// transaction manager.
pub struct VirtualGraph {
    provider: Arc<dyn SuperBlockProvider>,
    superblocks: Mutex<FxHashMap<String, Arc<SuperBlock>>>,
    transactions: Arc<TransactionManager>,
    replication: ReplicationManager,
    metrics: Arc<dyn GraphFsMetrics>,
    closed: AtomicBool,
}

impl VirtualGraph {
    /// Graph over `provider`, journaling through `journal`.
    pub fn new(
        provider: Arc<dyn SuperBlockProvider>,
        journal: Arc<dyn Journal>,
        checkpoint: Arc<dyn Checkpoint>,
    ) -> Arc<Self> {
        Self::with_metrics(provider, journal, checkpoint, default_metrics())
    }

    /// Like [`VirtualGraph::new`], reporting to `metrics`.
    pub fn with_metrics(
        provider: Arc<dyn SuperBlockProvider>,
        journal: Arc<dyn Journal>,
        checkpoint: Arc<dyn Checkpoint>,
        metrics: Arc<dyn GraphFsMetrics>,
    ) -> Arc<Self> {
        Self::assemble(provider, journal, checkpoint, metrics, SlotStorage::Memory)
    }

    fn assemble(
        provider: Arc<dyn SuperBlockProvider>,
        journal: Arc<dyn Journal>,
        checkpoint: Arc<dyn Checkpoint>,
        metrics: Arc<dyn GraphFsMetrics>,
        slots: SlotStorage,
    ) -> Arc<Self> {
        Arc::new_cyclic(|graph| VirtualGraph {
            provider,
            superblocks: Mutex::new(FxHashMap::default()),
            replication: ReplicationManager::new(Arc::clone(&journal), slots),
            transactions: TransactionManager::new(
                graph.clone(),
                journal,
                checkpoint,
                Arc::clone(&metrics),
            ),
            metrics,
            closed: AtomicBool::new(false),
        })
    }

    /// Opens the durable journal, checkpoint, and slot directory named by
    /// `config` and, when `recover_on_open` is set, runs recovery before
    /// returning.
    pub fn from_config(
        ctx: &Context,
        config: &Config,
        provider: Arc<dyn SuperBlockProvider>,
    ) -> Result<Arc<Self>> {
        let journal = config.open_journal()?;
        let checkpoint = config.open_checkpoint();
        let graph = Self::assemble(
            provider,
            Arc::new(journal),
            Arc::new(checkpoint),
            default_metrics(),
            config.slot_storage(),
        );
        if config.recover_on_open {
            let report = graph.recover(ctx)?;
            info!(
                committed = report.committed,
                rolled_back = report.rolled_back,
                failed = report.failed,
                "graphfs.graph.open_recovered"
            );
        }
        Ok(graph)
    }

    /// Opens replication slot `name` over this graph's journal.
    ///
    /// Graphs built from a [`Config`] keep persistent slot positions in the
    /// configured slot directory; other graphs keep them in memory.
    pub fn create_replication_slot(
        &self,
        ctx: &Context,
        name: &str,
        persistent: bool,
    ) -> Result<Arc<ReplicationSlot>> {
        self.check_open(ctx)?;
        self.replication.create_slot(ctx, name, persistent)
    }

    /// Transaction manager of this graph.
    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    fn check_open(&self, ctx: &Context) -> Result<()> {
        ctx.check_cancel()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(GraphFsError::Closed);
        }
        Ok(())
    }

    /// Mounted superblock for `uuid`, asking the provider on first use.
    pub fn superblock(&self, ctx: &Context, uuid: &str) -> Result<Arc<SuperBlock>> {
        self.check_open(ctx)?;
        let mut superblocks = self.superblocks.lock();
        if let Some(sb) = superblocks.get(uuid) {
            return Ok(Arc::clone(sb));
        }
        let sb = self
            .provider
            .provide(ctx, uuid)?
            .ok_or_else(|| GraphFsError::NoSuchSuperBlock(uuid.to_string()))?;
        sb.set_metrics(Arc::clone(&self.metrics));
        superblocks.insert(uuid.to_string(), Arc::clone(&sb));
        debug!(uuid, "graphfs.graph.mount");
        Ok(sb)
    }

    /// Walks `path` through the entry cache. Intermediate misses are
    /// `NotFound`; the final entry may be negative.
    ///
    /// The returned entry carries a reference for the caller.
    pub fn resolve(&self, ctx: &Context, path: &Path) -> Result<Arc<CacheEntry>> {
        let sb = self.superblock(ctx, path.root())?;
        let mut current = sb.root()?;
        for element in path.elements() {
            if current.is_negative() {
                current.release(ctx)?;
                return Err(GraphFsError::NotFound);
            }
            let next = current.lookup(ctx, element);
            let released = current.release(ctx);
            let next = next?;
            if let Err(err) = released {
                next.release(ctx)?;
                return Err(err);
            }
            current = next;
        }
        Ok(current)
    }

    /// Drops the cached entry for `path` so the next resolution consults the
    /// backing store.
    pub fn invalidate(&self, ctx: &Context, path: &Path) -> Result<()> {
        let entry = self.resolve(ctx, path)?;
        let invalidated = entry.invalidate(ctx);
        entry.release(ctx)?;
        invalidated
    }

    /// Opens the node at `path`.
    ///
    /// Empty flags mean read-only. A cached miss is `NotFound` unless the
    /// options ask to create; creation inside a transaction only journals the
    /// new node, which reaches the backing store when the transaction
    /// commits.
    pub fn open(&self, ctx: &Context, path: &Path, options: OpenOptions) -> Result<NodeHandle> {
        let mut options = options;
        if options.flags.is_empty() {
            options.flags = OpenFlags::READ;
        }
        let entry = self.resolve(ctx, path)?;
        let opened = self.open_entry(ctx, &entry, options);
        entry.release(ctx)?;
        opened
    }

    fn open_entry(
        &self,
        ctx: &Context,
        entry: &Arc<CacheEntry>,
        options: OpenOptions,
    ) -> Result<NodeHandle> {
        let flags = options.flags;
        if !entry.is_negative() {
            if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
                return Err(GraphFsError::AlreadyExists);
            }
            let inode = entry.inode().ok_or(GraphFsError::NotFound)?;
            return Ok(NodeHandle::new(inode.get(), entry.get(), options));
        }
        let sb = entry.superblock()?;
        if let Some(tx) = options.transaction.clone() {
            if let Some(id) = tx.created_inode(&entry.path()) {
                return Ok(NodeHandle::new(sb.inode(id), entry.get(), options));
            }
            if !flags.contains(OpenFlags::CREATE) {
                return Err(GraphFsError::NotFound);
            }
            let id = match options.force_inode {
                Some(id) => id,
                None => sb.inode_operations().allocate_inode_id(ctx)?,
            };
            tx.append(ctx, JournalEntry::create(id, entry.path()))?;
            return Ok(NodeHandle::new(sb.inode(id), entry.get(), options));
        }
        if !flags.contains(OpenFlags::CREATE) {
            return Err(GraphFsError::NotFound);
        }
        match sb.inode_operations().create(ctx, entry, &options) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                entry.make_negative(ctx)?;
                Err(err)
            }
        }
    }

    /// Current payload of the node at `path`.
    pub fn read(&self, ctx: &Context, path: &Path) -> Result<SerializedNode> {
        let mut handle = self.open(ctx, path, OpenOptions::new())?;
        let node = handle.read(ctx);
        handle.close(ctx)?;
        node
    }

    /// Replaces the payload of the existing node at `path`.
    pub fn write(&self, ctx: &Context, path: &Path, node: SerializedNode) -> Result<()> {
        let mut handle = self.open(
            ctx,
            path,
            OpenOptions::with_flags(OpenFlags::READ | OpenFlags::WRITE),
        )?;
        let written = handle.write(ctx, node);
        handle.close(ctx)?;
        written
    }

    /// Edge named by the last element of `path`, read from the node at the
    /// parent path.
    pub fn read_edge(&self, ctx: &Context, path: &Path) -> Result<SerializedEdge> {
        let key = path
            .name()
            .cloned()
            .ok_or(GraphFsError::Invalid("edge path must name an edge key"))?;
        let mut handle = self.open(ctx, &path.parent(), OpenOptions::new())?;
        let edge = handle.read_edge(ctx, &key);
        handle.close(ctx)?;
        edge
    }

    /// Every edge of the node at `path`.
    pub fn read_edges(&self, ctx: &Context, path: &Path) -> Result<Vec<SerializedEdge>> {
        let mut handle = self.open(ctx, path, OpenOptions::new())?;
        let edges = handle
            .read_edges(ctx)
            .and_then(|iter| iter.collect::<Result<Vec<_>>>());
        handle.close(ctx)?;
        edges
    }

    /// Starts a transaction.
    pub fn begin_transaction(&self, ctx: &Context) -> Result<Arc<Transaction>> {
        self.check_open(ctx)?;
        self.transactions.begin_transaction(ctx)
    }

    /// Replays committed journal entries past the checkpoint.
    pub fn recover(&self, ctx: &Context) -> Result<RecoveryReport> {
        self.check_open(ctx)?;
        self.transactions.recover(ctx)
    }

    /// Rolls back open transactions and unmounts every superblock.
    pub fn close(&self, ctx: &Context) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.transactions.close(ctx)?;
        self.replication.close()?;
        let superblocks: Vec<Arc<SuperBlock>> =
            self.superblocks.lock().drain().map(|(_, sb)| sb).collect();
        for sb in superblocks {
            sb.close(ctx)?;
        }
        debug!("graphfs.graph.close");
        Ok(())
    }
}
