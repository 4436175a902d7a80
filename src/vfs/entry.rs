use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::inode::INode;
use super::superblock::SuperBlock;
use crate::model::{Path, PathElement};
use crate::types::{Context, GraphFsError, Result};

const ENTRY_REFERENCED: u8 = 0x01;
const ENTRY_NEGATIVE: u8 = 0x02;
const ENTRY_DISCONNECTED: u8 = 0x04;

#[derive(Default)]
struct EntryState {
    inode: Option<Arc<INode>>,
    parent: Option<Arc<CacheEntry>>,
    children: Vec<Option<Arc<CacheEntry>>>,
}

/// Directory-entry cache node: a refcounted name-to-inode binding.
///
/// Entries form the path-resolution tree of one superblock. A *negative*
/// entry caches a miss; a *disconnected* entry is not linked under its
/// parent. Linking an entry under its parent costs one reference on the
/// child, so a cached subtree stays alive until it is invalidated or pruned.
///
/// Locks are taken child before parent. `REFERENCED` is the only flag
/// changed without holding the entry's own lock.
pub struct CacheEntry {
    name: PathElement,
    sb: Weak<SuperBlock>,
    refcount: AtomicI32,
    flags: AtomicU8,
    state: Mutex<EntryState>,
}

impl CacheEntry {
    /// Allocates a disconnected, negative child of `parent` named `name`.
    ///
    /// The returned entry carries one reference for the caller and holds a
    /// reference on `parent` until it is deleted.
    pub fn alloc(sb: Weak<SuperBlock>, parent: &Arc<CacheEntry>, name: PathElement) -> Arc<Self> {
        Arc::new(Self {
            name,
            sb,
            refcount: AtomicI32::new(1),
            flags: AtomicU8::new(ENTRY_REFERENCED | ENTRY_NEGATIVE | ENTRY_DISCONNECTED),
            state: Mutex::new(EntryState {
                parent: Some(parent.get()),
                ..EntryState::default()
            }),
        })
    }

    /// Allocates the connected, negative root entry of a namespace with one
    /// reference held by the superblock.
    pub(crate) fn alloc_root(sb: Weak<SuperBlock>) -> Arc<Self> {
        Arc::new(Self {
            name: PathElement::default(),
            sb,
            refcount: AtomicI32::new(1),
            flags: AtomicU8::new(ENTRY_REFERENCED | ENTRY_NEGATIVE),
            state: Mutex::new(EntryState::default()),
        })
    }

    /// Name of this entry under its parent.
    pub fn name(&self) -> &PathElement {
        &self.name
    }

    /// Owning superblock.
    pub fn superblock(&self) -> Result<Arc<SuperBlock>> {
        self.sb.upgrade().ok_or(GraphFsError::Closed)
    }

    /// Parent entry; `None` for a namespace root or a deleted entry.
    pub fn parent(&self) -> Option<Arc<CacheEntry>> {
        self.state.lock().parent.clone()
    }

    /// Bound inode; `None` while negative.
    pub fn inode(&self) -> Option<Arc<INode>> {
        self.state.lock().inode.clone()
    }

    /// Linked children, positive and negative.
    pub fn children(&self) -> Vec<Arc<CacheEntry>> {
        self.state.lock().children.iter().flatten().cloned().collect()
    }

    /// Current reference count.
    pub fn refcount(&self) -> i32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// True while the entry caches a miss.
    pub fn is_negative(&self) -> bool {
        self.has_flag(ENTRY_NEGATIVE)
    }

    /// True while the entry is not linked under its parent.
    pub fn is_disconnected(&self) -> bool {
        self.has_flag(ENTRY_DISCONNECTED)
    }

    /// True once referenced since allocation or the last teardown.
    pub fn is_referenced(&self) -> bool {
        self.has_flag(ENTRY_REFERENCED)
    }

    fn has_flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    fn set_flags(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    fn clear_flags(&self, flag: u8) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    /// Takes a reference.
    pub fn get(self: &Arc<Self>) -> Arc<Self> {
        self.refcount.fetch_add(1, Ordering::AcqRel);
        self.set_flags(ENTRY_REFERENCED);
        Arc::clone(self)
    }

    /// Drops a reference; the last one deletes the entry.
    ///
    /// # Panics
    ///
    /// Panics when called with no outstanding reference.
    pub fn release(&self, ctx: &Context) -> Result<()> {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            self.refcount.fetch_add(1, Ordering::AcqRel);
            panic!("cache entry {} released with no outstanding reference", self.name);
        }
        if prev == 1 {
            self.delete(ctx)?;
        }
        Ok(())
    }

    /// Tears the entry down if it is unreferenced: unlinks it, releases its
    /// parent and inode, and leaves it disconnected and negative. Repeated
    /// calls are no-ops.
    pub fn delete(&self, ctx: &Context) -> Result<()> {
        let (parent, inode) = {
            let mut state = self.state.lock();
            if self.refcount() != 0 {
                return Ok(());
            }
            if state.parent.is_none() && state.inode.is_none() && self.is_disconnected() {
                return Ok(());
            }
            self.flags
                .store(ENTRY_DISCONNECTED | ENTRY_NEGATIVE, Ordering::Release);
            state.children.clear();
            (state.parent.take(), state.inode.take())
        };
        let mut result = Ok(());
        if let Some(inode) = inode {
            inode.detach(self);
            result = inode.release(ctx);
        }
        if let Some(parent) = parent {
            parent.forget_child(self);
            let released = parent.release(ctx);
            if result.is_ok() {
                result = released;
            }
        }
        result
    }

    /// Binds `inode` and clears the negative flag; the entry takes its own
    /// reference on the inode.
    ///
    /// # Panics
    ///
    /// Panics if the entry is disconnected or already bound to another inode.
    pub fn instantiate(self: &Arc<Self>, inode: &Arc<INode>) {
        {
            let mut state = self.state.lock();
            if self.is_disconnected() {
                panic!("instantiate on disconnected cache entry {}", self.name);
            }
            match &state.inode {
                Some(current) if Arc::ptr_eq(current, inode) => {
                    self.clear_flags(ENTRY_NEGATIVE);
                    return;
                }
                Some(current) => panic!(
                    "cache entry {} already bound to inode {}",
                    self.name,
                    current.id()
                ),
                None => {}
            }
            state.inode = Some(inode.get());
            self.clear_flags(ENTRY_NEGATIVE);
        }
        inode.attach(self);
    }

    /// Links a disconnected entry under its parent and binds `inode`.
    ///
    /// # Panics
    ///
    /// Panics if the entry is not disconnected.
    pub fn add(self: &Arc<Self>, inode: &Arc<INode>) {
        self.link();
        self.instantiate(inode);
    }

    /// Links a disconnected entry under its parent as a cached miss.
    ///
    /// # Panics
    ///
    /// Panics if the entry is not disconnected.
    pub fn add_negative(self: &Arc<Self>) {
        self.link();
    }

    fn link(self: &Arc<Self>) {
        let state = self.state.lock();
        if !self.is_disconnected() {
            panic!("cache entry {} is already linked", self.name);
        }
        if let Some(parent) = &state.parent {
            parent.insert_child(self.get());
        }
        self.clear_flags(ENTRY_DISCONNECTED);
    }

    fn insert_child(&self, child: Arc<CacheEntry>) {
        let mut state = self.state.lock();
        match state.children.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => *slot = Some(child),
            None => state.children.push(Some(child)),
        }
    }

    fn forget_child(&self, child: &CacheEntry) -> bool {
        let mut state = self.state.lock();
        for slot in state.children.iter_mut() {
            if matches!(slot, Some(linked) if std::ptr::eq(Arc::as_ptr(linked), child)) {
                *slot = None;
                return true;
            }
        }
        false
    }

    /// Turns the entry into a cached miss, releasing its inode.
    pub fn make_negative(&self, ctx: &Context) -> Result<()> {
        let inode = {
            let mut state = self.state.lock();
            self.set_flags(ENTRY_NEGATIVE);
            state.inode.take()
        };
        if let Some(inode) = inode {
            inode.detach(self);
            inode.release(ctx)?;
        }
        Ok(())
    }

    /// Unlinks the entry from its parent so the next lookup of its name asks
    /// the backing store again. Roots and disconnected entries are left alone.
    pub fn invalidate(&self, ctx: &Context) -> Result<()> {
        let unlinked = {
            let state = self.state.lock();
            if self.is_disconnected() {
                return Ok(());
            }
            let parent = match &state.parent {
                Some(parent) => Arc::clone(parent),
                None => return Ok(()),
            };
            self.set_flags(ENTRY_DISCONNECTED);
            parent.forget_child(self)
        };
        if unlinked {
            debug!(name = %self.name, "graphfs.dcache.invalidate");
            self.release(ctx)?;
        }
        Ok(())
    }

    /// Invalidates every descendant nobody else references, deepest first.
    pub fn prune(&self, ctx: &Context) -> Result<()> {
        for child in self.children() {
            child.prune(ctx)?;
            if child.refcount() == 1 {
                child.invalidate(ctx)?;
            }
        }
        Ok(())
    }

    /// Looks up the child `name`, consulting the backing store on a cache
    /// miss. A miss in the backing store is cached as a negative child.
    ///
    /// The returned child carries a reference for the caller.
    pub fn lookup(self: &Arc<Self>, ctx: &Context, name: &PathElement) -> Result<Arc<CacheEntry>> {
        ctx.check_cancel()?;
        let sb = self.superblock()?;
        let (cached, dir) = {
            let state = self.state.lock();
            let cached = state
                .children
                .iter()
                .flatten()
                .find(|child| child.name == *name)
                .map(|child| child.get());
            (cached, state.inode.clone())
        };
        if let Some(child) = cached {
            sb.metrics().cache_lookup(true, child.is_negative());
            return Ok(child);
        }
        let dir = dir.ok_or(GraphFsError::NotFound)?;
        let child = CacheEntry::alloc(Arc::downgrade(&sb), self, name.clone());
        let found = match sb.inode_operations().lookup(ctx, &dir, &child) {
            Ok(found) => found,
            Err(err) => {
                child.release(ctx)?;
                return Err(err);
            }
        };
        let found = if Arc::ptr_eq(&found, &child) {
            if child.is_disconnected() {
                child.add_negative();
            }
            child
        } else {
            let found = found.get();
            child.release(ctx)?;
            found
        };
        let negative = found.is_negative();
        sb.metrics().cache_lookup(false, negative);
        debug!(name = %name, negative, "graphfs.dcache.lookup");
        Ok(found)
    }

    /// Full path of the entry, rooted at its superblock's UUID.
    pub fn path(&self) -> Path {
        let root = self
            .sb
            .upgrade()
            .map(|sb| sb.uuid().to_string())
            .unwrap_or_default();
        let mut elements = Vec::new();
        let mut parent = self.parent();
        if parent.is_some() {
            elements.push(self.name.clone());
        }
        while let Some(entry) = parent {
            let next = entry.parent();
            if next.is_some() {
                elements.push(entry.name.clone());
            }
            parent = next;
        }
        elements.reverse();
        Path::from_elements(root, elements)
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("name", &self.name)
            .field("refcount", &self.refcount())
            .field("negative", &self.is_negative())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}
