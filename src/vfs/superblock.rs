use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::debug;

use super::entry::CacheEntry;
use super::handle::NodeHandle;
use super::inode::INode;
use super::options::OpenOptions;
use crate::metrics::{default_metrics, GraphFsMetrics};
use crate::model::{EdgeKey, SerializedEdge, SerializedNode};
use crate::types::{Context, GraphFsError, InodeId, Result};

/// Stream of edges produced by [`NodeHandleOperations::read_edges`].
pub type EdgeIter = Box<dyn Iterator<Item = Result<SerializedEdge>> + Send>;

/// Namespace-level operations a backing store provides.
pub trait INodeOperations: Send + Sync {
    /// Resolves `dentry`'s name under directory `dir`.
    ///
    /// On a hit the store binds the entry, normally through
    /// [`CacheEntry::add`]; on a miss it leaves `dentry` disconnected and the
    /// cache links it as negative. The returned entry is usually `dentry`
    /// itself; the caller takes its own reference on whatever is returned.
    fn lookup(
        &self,
        ctx: &Context,
        dir: &Arc<INode>,
        dentry: &Arc<CacheEntry>,
    ) -> Result<Arc<CacheEntry>>;

    /// Creates the node named by the negative `dentry` and opens a direct
    /// handle on it. `options.force_inode`, when set, is the id to use.
    fn create(
        &self,
        ctx: &Context,
        dentry: &Arc<CacheEntry>,
        options: &OpenOptions,
    ) -> Result<NodeHandle>;

    /// Reserves a fresh inode id.
    fn allocate_inode_id(&self, ctx: &Context) -> Result<InodeId>;

    /// Called once an inode's last reference is gone.
    fn evict(&self, _ctx: &Context, _inode: &INode) -> Result<()> {
        Ok(())
    }

    /// Makes completed writes durable.
    fn flush(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }
}

/// Node-level operations a backing store provides, keyed by inode.
pub trait NodeHandleOperations: Send + Sync {
    /// Current node payload; `NotFound` if none was written.
    fn read(&self, ctx: &Context, inode: &INode) -> Result<SerializedNode>;

    /// Replaces the node payload.
    fn write(&self, ctx: &Context, inode: &INode, node: &SerializedNode) -> Result<()>;

    /// Inserts or replaces the edge with `edge.key`.
    fn set_edge(&self, ctx: &Context, inode: &INode, edge: &SerializedEdge) -> Result<()>;

    /// Removes the edge with `key`; removing an absent edge succeeds.
    fn remove_edge(&self, ctx: &Context, inode: &INode, key: &EdgeKey) -> Result<()>;

    /// Edge with `key`; `NotFound` if absent.
    fn read_edge(&self, ctx: &Context, inode: &INode, key: &EdgeKey) -> Result<SerializedEdge>;

    /// Every edge of the node, in key order.
    fn read_edges(&self, ctx: &Context, inode: &INode) -> Result<EdgeIter>;
}

/// Source of superblocks by namespace UUID.
pub trait SuperBlockProvider: Send + Sync {
    /// Mounts the namespace `uuid`; `None` when no such graph exists.
    fn provide(&self, ctx: &Context, uuid: &str) -> Result<Option<Arc<SuperBlock>>>;
}

/// One mounted namespace: its root entry, inode cache, and store seams.
pub struct SuperBlock {
    uuid: String,
    me: Weak<SuperBlock>,
    root: Arc<CacheEntry>,
    icache: Mutex<FxHashMap<InodeId, Weak<INode>>>,
    iops: Arc<dyn INodeOperations>,
    nops: Arc<dyn NodeHandleOperations>,
    metrics: RwLock<Arc<dyn GraphFsMetrics>>,
    closed: AtomicBool,
}

impl SuperBlock {
    /// Mounts namespace `uuid` whose root node is `root_inode`.
    pub fn new(
        uuid: impl Into<String>,
        root_inode: InodeId,
        iops: Arc<dyn INodeOperations>,
        nops: Arc<dyn NodeHandleOperations>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<SuperBlock>| {
            let root = CacheEntry::alloc_root(me.clone());
            let inode = Arc::new(INode::new(root_inode, me.clone()));
            root.instantiate(&inode);
            let mut icache = FxHashMap::default();
            icache.insert(root_inode, Arc::downgrade(&inode));
            SuperBlock {
                uuid: uuid.into(),
                me: me.clone(),
                root,
                icache: Mutex::new(icache),
                iops,
                nops,
                metrics: RwLock::new(default_metrics()),
                closed: AtomicBool::new(false),
            }
        })
    }

    /// Namespace UUID.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Root entry, with a reference for the caller.
    pub fn root(&self) -> Result<Arc<CacheEntry>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GraphFsError::Closed);
        }
        Ok(self.root.get())
    }

    /// Namespace operations of the backing store.
    pub fn inode_operations(&self) -> &Arc<dyn INodeOperations> {
        &self.iops
    }

    /// Node operations of the backing store.
    pub fn node_handle_operations(&self) -> &Arc<dyn NodeHandleOperations> {
        &self.nops
    }

    pub(crate) fn metrics(&self) -> Arc<dyn GraphFsMetrics> {
        Arc::clone(&self.metrics.read())
    }

    pub(crate) fn set_metrics(&self, metrics: Arc<dyn GraphFsMetrics>) {
        *self.metrics.write() = metrics;
    }

    /// The live inode for `id`, allocating one if none is cached. The caller
    /// owns one reference on the result.
    pub fn inode(&self, id: InodeId) -> Arc<INode> {
        let mut icache = self.icache.lock();
        if let Some(existing) = icache.get(&id).and_then(Weak::upgrade) {
            if !existing.is_freed() {
                return existing.get();
            }
        }
        let inode = Arc::new(INode::new(id, self.me.clone()));
        icache.insert(id, Arc::downgrade(&inode));
        inode.get()
    }

    /// Number of inodes currently cached.
    pub fn cached_inodes(&self) -> usize {
        self.icache
            .lock()
            .values()
            .filter(|weak| weak.upgrade().map_or(false, |inode| !inode.is_freed()))
            .count()
    }

    pub(crate) fn evict_inode(&self, ctx: &Context, inode: &INode) -> Result<()> {
        {
            let mut icache = self.icache.lock();
            if !inode.mark_freed() {
                return Ok(());
            }
            let cached = icache
                .get(&inode.id())
                .map_or(false, |weak| std::ptr::eq(weak.as_ptr(), inode));
            if cached {
                icache.remove(&inode.id());
            }
        }
        debug!(uuid = %self.uuid, inode = inode.id(), "graphfs.icache.evict");
        self.iops.evict(ctx, inode)
    }

    /// Flushes the backing store.
    pub fn flush(&self, ctx: &Context) -> Result<()> {
        ctx.check_cancel()?;
        self.iops.flush(ctx)
    }

    /// Prunes the entry cache, flushes, and drops the root. Later calls are
    /// no-ops.
    pub fn close(&self, ctx: &Context) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.root.prune(ctx)?;
        self.iops.flush(ctx)?;
        self.root.release(ctx)?;
        debug!(uuid = %self.uuid, "graphfs.superblock.close");
        Ok(())
    }
}

impl fmt::Debug for SuperBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuperBlock")
            .field("uuid", &self.uuid)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}
