#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::model::{EdgeKey, PathElement, SerializedEdge, SerializedNode};
use crate::types::{Context, GraphFsError, InodeId, Result};
use crate::vfs::{
    CacheEntry, EdgeIter, INode, INodeOperations, NodeHandle, NodeHandleOperations,
    OpenOptions, SuperBlock, SuperBlockProvider,
};

/// Inode id of every in-memory namespace root.
pub const ROOT_INODE: InodeId = 1;

#[derive(Default)]
struct StoreState {
    children: FxHashMap<(InodeId, PathElement), InodeId>,
    nodes: FxHashMap<InodeId, SerializedNode>,
    edges: FxHashMap<InodeId, BTreeMap<EdgeKey, SerializedEdge>>,
    next_inode: InodeId,
}

/// Reference backing store keeping one namespace's names, nodes, and edges
/// in process memory.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    lookups: AtomicU64,
    flushes: AtomicU64,
    fail_creates: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty store holding only the root.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState {
                next_inode: ROOT_INODE + 1,
                ..StoreState::default()
            }),
            lookups: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            fail_creates: AtomicBool::new(false),
        }
    }

    /// Stored payload of `inode`.
    pub fn node(&self, inode: InodeId) -> Option<SerializedNode> {
        self.state.lock().nodes.get(&inode).cloned()
    }

    /// Stored edges of `inode` in key order.
    pub fn edges(&self, inode: InodeId) -> Vec<SerializedEdge> {
        self.state
            .lock()
            .edges
            .get(&inode)
            .map(|edges| edges.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Inode bound to `name` under `parent`.
    pub fn child(&self, parent: InodeId, name: &PathElement) -> Option<InodeId> {
        self.state
            .lock()
            .children
            .get(&(parent, name.clone()))
            .copied()
    }

    /// Binds `name` under `parent` to `inode` behind the cache's back.
    pub fn link(&self, parent: InodeId, name: PathElement, inode: InodeId) {
        let mut state = self.state.lock();
        state.children.insert((parent, name), inode);
        state.next_inode = state.next_inode.max(inode + 1);
    }

    /// Number of backing-store lookups served so far.
    pub fn lookup_calls(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Number of flushes requested so far.
    pub fn flush_calls(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Makes every subsequent create fail with an I/O error.
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::Release);
    }
}

impl INodeOperations for MemoryStore {
    fn lookup(
        &self,
        ctx: &Context,
        dir: &Arc<INode>,
        dentry: &Arc<CacheEntry>,
    ) -> Result<Arc<CacheEntry>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let found = self.child(dir.id(), dentry.name());
        if let Some(id) = found {
            let sb = dentry.superblock()?;
            let inode = sb.inode(id);
            dentry.add(&inode);
            inode.release(ctx)?;
        }
        Ok(Arc::clone(dentry))
    }

    fn create(
        &self,
        ctx: &Context,
        dentry: &Arc<CacheEntry>,
        options: &OpenOptions,
    ) -> Result<NodeHandle> {
        if self.fail_creates.load(Ordering::Acquire) {
            return Err(GraphFsError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "create rejected",
            )));
        }
        let sb = dentry.superblock()?;
        let parent = dentry
            .parent()
            .and_then(|parent| parent.inode())
            .ok_or(GraphFsError::NotFound)?;
        let key = (parent.id(), dentry.name().clone());
        let id = match self.child(key.0, &key.1) {
            Some(existing) => existing,
            None => {
                let id = match options.force_inode {
                    Some(id) => id,
                    None => self.allocate_inode_id(ctx)?,
                };
                self.link(key.0, key.1, id);
                id
            }
        };
        let inode = sb.inode(id);
        if dentry.is_disconnected() {
            dentry.add(&inode);
        } else {
            dentry.instantiate(&inode);
        }
        debug!(inode = id, path = %dentry.path(), "graphfs.memory.create");
        Ok(NodeHandle::new(inode, dentry.get(), options.clone()))
    }

    fn allocate_inode_id(&self, _ctx: &Context) -> Result<InodeId> {
        let mut state = self.state.lock();
        let id = state.next_inode;
        state.next_inode += 1;
        Ok(id)
    }

    fn flush(&self, _ctx: &Context) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl NodeHandleOperations for MemoryStore {
    fn read(&self, _ctx: &Context, inode: &INode) -> Result<SerializedNode> {
        self.node(inode.id()).ok_or(GraphFsError::NotFound)
    }

    fn write(&self, _ctx: &Context, inode: &INode, node: &SerializedNode) -> Result<()> {
        self.state.lock().nodes.insert(inode.id(), node.clone());
        Ok(())
    }

    fn set_edge(&self, _ctx: &Context, inode: &INode, edge: &SerializedEdge) -> Result<()> {
        self.state
            .lock()
            .edges
            .entry(inode.id())
            .or_default()
            .insert(edge.key.clone(), edge.clone());
        Ok(())
    }

    fn remove_edge(&self, _ctx: &Context, inode: &INode, key: &EdgeKey) -> Result<()> {
        if let Some(edges) = self.state.lock().edges.get_mut(&inode.id()) {
            edges.remove(key);
        }
        Ok(())
    }

    fn read_edge(&self, _ctx: &Context, inode: &INode, key: &EdgeKey) -> Result<SerializedEdge> {
        self.state
            .lock()
            .edges
            .get(&inode.id())
            .and_then(|edges| edges.get(key).cloned())
            .ok_or(GraphFsError::NotFound)
    }

    fn read_edges(&self, _ctx: &Context, inode: &INode) -> Result<EdgeIter> {
        let edges: Vec<Result<SerializedEdge>> =
            self.edges(inode.id()).into_iter().map(Ok).collect();
        Ok(Box::new(edges.into_iter()))
    }
}

/// Provider mounting [`MemoryStore`]s registered by UUID.
#[derive(Default)]
pub struct MemoryProvider {
    graphs: RwLock<FxHashMap<String, Arc<MemoryStore>>>,
}

impl MemoryProvider {
    /// Provider with no namespaces.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an empty namespace `uuid`, or returns the existing one.
    pub fn add_graph(&self, uuid: impl Into<String>) -> Arc<MemoryStore> {
        let mut graphs = self.graphs.write();
        Arc::clone(graphs.entry(uuid.into()).or_default())
    }

    /// Store behind namespace `uuid`.
    pub fn store(&self, uuid: &str) -> Option<Arc<MemoryStore>> {
        self.graphs.read().get(uuid).cloned()
    }
}

impl SuperBlockProvider for MemoryProvider {
    fn provide(&self, _ctx: &Context, uuid: &str) -> Result<Option<Arc<SuperBlock>>> {
        Ok(self.store(uuid).map(|store| {
            SuperBlock::new(
                uuid,
                ROOT_INODE,
                Arc::clone(&store) as Arc<dyn INodeOperations>,
                store as Arc<dyn NodeHandleOperations>,
            )
        }))
    }
}
