use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::entry::CacheEntry;
use super::superblock::SuperBlock;
use crate::model::{NodeFlags, SerializedNode};
use crate::types::{Context, InodeId, Result};

const INODE_REFERENCED: u8 = 0x01;
const INODE_FREED: u8 = 0x02;

/// Refcounted identity of one durable node within a superblock.
///
/// Inodes are handed out by [`SuperBlock::inode`]; the last
/// [`release`](INode::release) evicts the inode from its superblock so the
/// id resolves to a fresh instance afterwards.
pub struct INode {
    id: InodeId,
    sb: Weak<SuperBlock>,
    refcount: AtomicI32,
    flags: AtomicU8,
    entries: Mutex<Vec<Option<Weak<CacheEntry>>>>,
    last_version: RwLock<Option<SerializedNode>>,
}

impl INode {
    pub(crate) fn new(id: InodeId, sb: Weak<SuperBlock>) -> Self {
        Self {
            id,
            sb,
            refcount: AtomicI32::new(0),
            flags: AtomicU8::new(0),
            entries: Mutex::new(Vec::new()),
            last_version: RwLock::new(None),
        }
    }

    /// Durable node id.
    pub fn id(&self) -> InodeId {
        self.id
    }

    /// Owning superblock, unless it has been dropped.
    pub fn superblock(&self) -> Option<Arc<SuperBlock>> {
        self.sb.upgrade()
    }

    /// Current reference count.
    pub fn refcount(&self) -> i32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// True once the inode has been referenced at least once since its last
    /// teardown.
    pub fn is_referenced(&self) -> bool {
        self.flags.load(Ordering::Acquire) & INODE_REFERENCED != 0
    }

    /// True after teardown.
    pub fn is_freed(&self) -> bool {
        self.flags.load(Ordering::Acquire) & INODE_FREED != 0
    }

    /// Takes a reference.
    pub fn get(self: &Arc<Self>) -> Arc<Self> {
        self.refcount.fetch_add(1, Ordering::AcqRel);
        self.flags.fetch_or(INODE_REFERENCED, Ordering::AcqRel);
        Arc::clone(self)
    }

    /// Drops a reference; the last one evicts the inode.
    ///
    /// # Panics
    ///
    /// Panics when called with no outstanding reference.
    pub fn release(&self, ctx: &Context) -> Result<()> {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            self.refcount.fetch_add(1, Ordering::AcqRel);
            panic!("inode {} released with no outstanding reference", self.id);
        }
        if prev > 1 {
            return Ok(());
        }
        match self.sb.upgrade() {
            Some(sb) => sb.evict_inode(ctx, self),
            None => {
                self.mark_freed();
                Ok(())
            }
        }
    }

    /// Tears the inode down if it is still unreferenced. Returns whether it
    /// did; a concurrent `get` between the atomic decrement and this recheck
    /// keeps the inode alive.
    pub(crate) fn mark_freed(&self) -> bool {
        let mut entries = self.entries.lock();
        if self.refcount.load(Ordering::Acquire) != 0 || self.is_freed() {
            return false;
        }
        self.flags.store(INODE_FREED, Ordering::Release);
        entries.clear();
        *self.last_version.write() = None;
        true
    }

    pub(crate) fn attach(&self, entry: &Arc<CacheEntry>) {
        let mut entries = self.entries.lock();
        let mut free_slot = None;
        for (idx, slot) in entries.iter().enumerate() {
            match slot.as_ref().map(Weak::as_ptr) {
                Some(ptr) if std::ptr::eq(ptr, Arc::as_ptr(entry)) => return,
                None if free_slot.is_none() => free_slot = Some(idx),
                _ => {}
            }
        }
        let weak = Some(Arc::downgrade(entry));
        match free_slot {
            Some(idx) => entries[idx] = weak,
            None => entries.push(weak),
        }
    }

    pub(crate) fn detach(&self, entry: &CacheEntry) {
        let mut entries = self.entries.lock();
        for slot in entries.iter_mut() {
            if matches!(slot, Some(weak) if std::ptr::eq(weak.as_ptr(), entry)) {
                *slot = None;
                return;
            }
        }
    }

    /// Cache entries currently bound to this inode.
    pub fn cache_entries(&self) -> Vec<Arc<CacheEntry>> {
        self.entries
            .lock()
            .iter()
            .flatten()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Last node version read or written through a direct handle, unless it
    /// was invalidated.
    pub fn cached_version(&self) -> Option<SerializedNode> {
        self.last_version
            .read()
            .as_ref()
            .filter(|node| !node.flags.contains(NodeFlags::INVALID))
            .cloned()
    }

    pub(crate) fn store_version(&self, node: SerializedNode) {
        *self.last_version.write() = Some(node);
    }

    /// Forces the next direct read to go to the backing store.
    pub fn invalidate_cached_version(&self) {
        if let Some(node) = self.last_version.write().as_mut() {
            node.flags.insert(NodeFlags::INVALID);
        }
    }
}

impl fmt::Debug for INode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("INode")
            .field("id", &self.id)
            .field("refcount", &self.refcount())
            .field("freed", &self.is_freed())
            .finish()
    }
}
