use std::collections::{btree_map, BTreeMap};
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashSet;
use tracing::{error, warn};

use super::entry::CacheEntry;
use super::inode::INode;
use super::options::{OpenFlags, OpenOptions};
use super::superblock::{EdgeIter, NodeHandleOperations};
use crate::model::{EdgeKey, JournalEntry, SerializedEdge, SerializedNode, XMAX_OPEN};
use crate::txn::Transaction;
use crate::types::{Context, GraphFsError, Result};

/// How a handle's mutations take effect.
#[derive(Clone)]
pub enum HandleKind {
    /// Straight to the backing store.
    Direct,
    /// Journaled and staged in the transaction until it commits.
    Transactional(Arc<Transaction>),
}

impl fmt::Debug for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::Direct => f.write_str("Direct"),
            HandleKind::Transactional(tx) => write!(f, "Transactional(xid={})", tx.xid()),
        }
    }
}

struct Bound {
    inode: Arc<INode>,
    entry: Arc<CacheEntry>,
}

/// Open capability on a node.
///
/// The kind is fixed when the handle is opened. Every operation after
/// [`close`](NodeHandle::close) fails with `HandleClosed`.
pub struct NodeHandle {
    bound: Option<Bound>,
    options: OpenOptions,
    kind: HandleKind,
}

impl NodeHandle {
    /// Wraps `inode` and `entry`, taking over one reference on each.
    pub fn new(inode: Arc<INode>, entry: Arc<CacheEntry>, options: OpenOptions) -> Self {
        let kind = match &options.transaction {
            Some(tx) => HandleKind::Transactional(Arc::clone(tx)),
            None => HandleKind::Direct,
        };
        Self {
            bound: Some(Bound { inode, entry }),
            options,
            kind,
        }
    }

    /// Direct or transactional.
    pub fn kind(&self) -> &HandleKind {
        &self.kind
    }

    /// Options the handle was opened with.
    pub fn options(&self) -> &OpenOptions {
        &self.options
    }

    /// True after `close`.
    pub fn is_closed(&self) -> bool {
        self.bound.is_none()
    }

    /// Inode the handle is open on.
    pub fn inode(&self) -> Result<&Arc<INode>> {
        self.bound()
            .map(|bound| &bound.inode)
    }

    /// Cache entry the handle was opened through.
    pub fn entry(&self) -> Result<&Arc<CacheEntry>> {
        self.bound()
            .map(|bound| &bound.entry)
    }

    fn bound(&self) -> Result<&Bound> {
        self.bound.as_ref().ok_or(GraphFsError::HandleClosed)
    }

    fn check(&self, ctx: &Context, needs: OpenFlags) -> Result<&Bound> {
        ctx.check_cancel()?;
        let bound = self.bound()?;
        if !self.options.flags.contains(needs) {
            return Err(GraphFsError::PermissionDenied);
        }
        Ok(bound)
    }

    fn nops(bound: &Bound) -> Result<Arc<dyn NodeHandleOperations>> {
        let sb = bound.inode.superblock().ok_or(GraphFsError::Closed)?;
        Ok(Arc::clone(sb.node_handle_operations()))
    }

    /// Current node payload; a transaction's staged write wins over the
    /// backing store.
    pub fn read(&self, ctx: &Context) -> Result<SerializedNode> {
        let bound = self.check(ctx, OpenFlags::READ)?;
        if let HandleKind::Transactional(tx) = &self.kind {
            if let Some(node) = tx.staged_node(bound.inode.id()) {
                if node.is_removed() {
                    return Err(GraphFsError::NotFound);
                }
                return Ok(node);
            }
        }
        if let Some(node) = bound.inode.cached_version() {
            if node.is_removed() {
                return Err(GraphFsError::NotFound);
            }
            return Ok(node);
        }
        let node = Self::nops(bound)?.read(ctx, &bound.inode)?;
        bound.inode.store_version(node.clone());
        if node.is_removed() {
            return Err(GraphFsError::NotFound);
        }
        Ok(node)
    }

    /// Replaces the node payload.
    pub fn write(&self, ctx: &Context, node: SerializedNode) -> Result<()> {
        let bound = self.check(ctx, OpenFlags::WRITE)?;
        match &self.kind {
            HandleKind::Transactional(tx) => tx.append(
                ctx,
                JournalEntry::write(bound.inode.id(), bound.entry.path(), node),
            ),
            HandleKind::Direct => {
                Self::nops(bound)?.write(ctx, &bound.inode, &node)?;
                bound.inode.store_version(node);
                Ok(())
            }
        }
    }

    /// Inserts or replaces the edge with `edge.key`. Transactional handles
    /// stamp the edge as created by their transaction.
    pub fn set_edge(&self, ctx: &Context, mut edge: SerializedEdge) -> Result<()> {
        let bound = self.check(ctx, OpenFlags::WRITE)?;
        match &self.kind {
            HandleKind::Transactional(tx) => {
                edge.xmin = tx.xid();
                edge.xmax = XMAX_OPEN;
                tx.append(
                    ctx,
                    JournalEntry::set_edge(bound.inode.id(), bound.entry.path(), edge),
                )
            }
            HandleKind::Direct => Self::nops(bound)?.set_edge(ctx, &bound.inode, &edge),
        }
    }

    /// Removes the edge with `key`.
    pub fn remove_edge(&self, ctx: &Context, key: &EdgeKey) -> Result<()> {
        let bound = self.check(ctx, OpenFlags::WRITE)?;
        match &self.kind {
            HandleKind::Transactional(tx) => tx.append(
                ctx,
                JournalEntry::remove_edge(
                    bound.inode.id(),
                    bound.entry.path(),
                    SerializedEdge::tombstone(key.clone()),
                ),
            ),
            HandleKind::Direct => Self::nops(bound)?.remove_edge(ctx, &bound.inode, key),
        }
    }

    /// Edge with `key`; staged edges shadow the backing store.
    pub fn read_edge(&self, ctx: &Context, key: &EdgeKey) -> Result<SerializedEdge> {
        let bound = self.check(ctx, OpenFlags::READ)?;
        if let HandleKind::Transactional(tx) = &self.kind {
            if let Some(edge) = tx.staged_edge(bound.inode.id(), key) {
                if edge.is_removed() {
                    return Err(GraphFsError::NotFound);
                }
                return Ok(edge);
            }
        }
        Self::nops(bound)?.read_edge(ctx, &bound.inode, key)
    }

    /// Every visible edge of the node.
    ///
    /// For a transactional handle the backing stream is merged with the
    /// transaction's staged edges: a staged edge replaces or hides the
    /// backing edge with the same key, and staged-only edges follow the
    /// backing stream in key order. A node the backing store has never
    /// seen reads as empty once the transaction has staged edges on it.
    pub fn read_edges(&self, ctx: &Context) -> Result<EdgeIter> {
        let bound = self.check(ctx, OpenFlags::READ)?;
        let backing = Self::nops(bound)?.read_edges(ctx, &bound.inode);
        let HandleKind::Transactional(tx) = &self.kind else {
            return backing;
        };
        let staged = tx.staged_edges(bound.inode.id());
        let backing: EdgeIter = match backing {
            Ok(backing) => backing,
            Err(GraphFsError::NotFound) if !staged.is_empty() => Box::new(std::iter::empty()),
            Err(err) => return Err(err),
        };
        Ok(Box::new(OverlayEdges::new(backing, staged)))
    }

    /// Releases the handle's references. Closing twice is a no-op.
    pub fn close(&mut self, ctx: &Context) -> Result<()> {
        let Some(bound) = self.bound.take() else {
            return Ok(());
        };
        let entry = bound.entry.release(ctx);
        let inode = bound.inode.release(ctx);
        entry.and(inode)
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        if let Some(bound) = &self.bound {
            warn!(
                inode = bound.inode.id(),
                path = %bound.entry.path(),
                "graphfs.handle.leaked"
            );
            if let Err(err) = self.close(&Context::background()) {
                error!(error = %err, "graphfs.handle.drop_close_failed");
            }
        }
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("inode", &self.bound.as_ref().map(|bound| bound.inode.id()))
            .field("kind", &self.kind)
            .field("flags", &self.options.flags)
            .finish()
    }
}

/// Backing edges merged with a snapshot of staged edges.
struct OverlayEdges {
    backing: Option<EdgeIter>,
    staged: BTreeMap<EdgeKey, SerializedEdge>,
    tail: Option<btree_map::IntoValues<EdgeKey, SerializedEdge>>,
    seen: FxHashSet<EdgeKey>,
}

impl OverlayEdges {
    fn new(backing: EdgeIter, staged: BTreeMap<EdgeKey, SerializedEdge>) -> Self {
        Self {
            backing: Some(backing),
            staged,
            tail: None,
            seen: FxHashSet::default(),
        }
    }
}

impl Iterator for OverlayEdges {
    type Item = Result<SerializedEdge>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(backing) = self.backing.as_mut() {
            for item in backing.by_ref() {
                let edge = match item {
                    Ok(edge) => edge,
                    Err(err) => return Some(Err(err)),
                };
                if !self.seen.insert(edge.key.clone()) {
                    continue;
                }
                let edge = self.staged.remove(&edge.key).unwrap_or(edge);
                if edge.is_removed() {
                    continue;
                }
                return Some(Ok(edge));
            }
            self.backing = None;
            self.tail = Some(std::mem::take(&mut self.staged).into_values());
        }
        let tail = self.tail.as_mut()?;
        for edge in tail.by_ref() {
            if edge.is_removed() || !self.seen.insert(edge.key.clone()) {
                continue;
            }
            return Some(Ok(edge));
        }
        None
    }
}
