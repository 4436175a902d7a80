#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use graphfs::primitives::checkpoint::MemoryCheckpoint;
use graphfs::primitives::journal::MemoryJournal;
use graphfs::storage::{MemoryProvider, MemoryStore, ROOT_INODE};
use graphfs::types::Result;
use graphfs::vfs::{INodeOperations, NodeHandleOperations, SuperBlock};
use graphfs::{
    CacheEntry, Context, CounterMetrics, GraphFsError, INode, InodeId, NodeHandle, OpenFlags,
    OpenOptions, Path, PathElement, SerializedNode, VirtualGraph,
};
use proptest::prelude::*;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("graphfs=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn path(src: &str) -> Path {
    src.parse().expect("valid path")
}

fn memory_graph() -> (Arc<VirtualGraph>, Arc<MemoryStore>, Arc<CounterMetrics>) {
    init_tracing();
    let provider = MemoryProvider::new();
    let store = provider.add_graph("g");
    let metrics = Arc::new(CounterMetrics::default());
    let graph = VirtualGraph::with_metrics(
        Arc::new(provider),
        Arc::new(MemoryJournal::new()),
        Arc::new(MemoryCheckpoint::new()),
        Arc::clone(&metrics) as Arc<dyn graphfs::GraphFsMetrics>,
    );
    (graph, store, metrics)
}

/// Namespace operations that count evictions and delegate to a memory store.
struct CountingOps {
    inner: Arc<MemoryStore>,
    evictions: AtomicUsize,
}

impl INodeOperations for CountingOps {
    fn lookup(
        &self,
        ctx: &Context,
        dir: &Arc<INode>,
        dentry: &Arc<CacheEntry>,
    ) -> Result<Arc<CacheEntry>> {
        self.inner.lookup(ctx, dir, dentry)
    }

    fn create(
        &self,
        ctx: &Context,
        dentry: &Arc<CacheEntry>,
        options: &OpenOptions,
    ) -> Result<NodeHandle> {
        self.inner.create(ctx, dentry, options)
    }

    fn allocate_inode_id(&self, ctx: &Context) -> Result<InodeId> {
        self.inner.allocate_inode_id(ctx)
    }

    fn evict(&self, _ctx: &Context, _inode: &INode) -> Result<()> {
        self.evictions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn counting_superblock() -> (Arc<SuperBlock>, Arc<CountingOps>, Arc<MemoryStore>) {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let ops = Arc::new(CountingOps {
        inner: Arc::clone(&store),
        evictions: AtomicUsize::new(0),
    });
    let sb = SuperBlock::new(
        "g",
        ROOT_INODE,
        Arc::clone(&ops) as Arc<dyn INodeOperations>,
        Arc::clone(&store) as Arc<dyn NodeHandleOperations>,
    );
    (sb, ops, store)
}

#[test]
fn inode_is_torn_down_once_when_the_last_reference_goes() -> Result<()> {
    let (sb, ops, _store) = counting_superblock();
    let ctx = Context::background();
    let inode = sb.inode(42);
    let again = sb.inode(42);
    assert!(Arc::ptr_eq(&inode, &again));
    assert_eq!(inode.refcount(), 2);

    again.release(&ctx)?;
    assert!(!inode.is_freed());
    assert_eq!(ops.evictions.load(Ordering::SeqCst), 0);

    inode.release(&ctx)?;
    assert!(inode.is_freed());
    assert_eq!(ops.evictions.load(Ordering::SeqCst), 1);

    let fresh = sb.inode(42);
    assert!(!Arc::ptr_eq(&inode, &fresh));
    assert!(!fresh.is_freed());
    fresh.release(&ctx)?;
    assert_eq!(ops.evictions.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn concurrent_get_and_release_evict_exactly_once() -> Result<()> {
    const THREADS: usize = 8;
    const ROUNDS: usize = 2_000;
    let (sb, ops, _store) = counting_superblock();
    let ctx = Context::background();
    let base = sb.inode(9);

    let outcomes: Vec<Result<()>> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let base = &base;
                scope.spawn(move || -> Result<()> {
                    let ctx = Context::background();
                    for _ in 0..ROUNDS {
                        let held = base.get();
                        held.release(&ctx)?;
                    }
                    Ok(())
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().expect("worker panicked"))
            .collect()
    });
    for outcome in outcomes {
        outcome?;
    }
    assert_eq!(base.refcount(), 1);
    assert!(!base.is_freed());
    assert_eq!(ops.evictions.load(Ordering::SeqCst), 0);

    base.release(&ctx)?;
    assert!(base.is_freed());
    assert_eq!(ops.evictions.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn lookups_racing_the_last_release_tear_each_inode_down_once() -> Result<()> {
    const THREADS: usize = 8;
    const ROUNDS: usize = 500;
    let (sb, ops, _store) = counting_superblock();

    let seen: Vec<Result<Vec<Arc<INode>>>> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let sb = &sb;
                scope.spawn(move || -> Result<Vec<Arc<INode>>> {
                    let ctx = Context::background();
                    let mut seen = Vec::with_capacity(ROUNDS);
                    for _ in 0..ROUNDS {
                        let inode = sb.inode(9);
                        assert!(!inode.is_freed());
                        inode.release(&ctx)?;
                        seen.push(inode);
                    }
                    Ok(seen)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().expect("worker panicked"))
            .collect()
    });

    let mut instances: Vec<Arc<INode>> = Vec::new();
    for outcome in seen {
        for inode in outcome? {
            if !instances.iter().any(|known| Arc::ptr_eq(known, &inode)) {
                instances.push(inode);
            }
        }
    }
    assert!(instances.iter().all(|inode| inode.is_freed()));
    assert_eq!(ops.evictions.load(Ordering::SeqCst), instances.len());
    assert_eq!(sb.cached_inodes(), 1);
    Ok(())
}

#[test]
#[should_panic(expected = "no outstanding reference")]
fn releasing_an_unreferenced_inode_panics() {
    let (sb, _ops, _store) = counting_superblock();
    let ctx = Context::background();
    let inode = sb.inode(7);
    inode.release(&ctx).expect("first release");
    let _ = inode.release(&ctx);
}

proptest! {
    #[test]
    fn paired_gets_and_releases_tear_down_exactly_at_zero(
        steps in proptest::collection::vec(any::<bool>(), 0..64)
    ) {
        let (sb, ops, _store) = counting_superblock();
        let ctx = Context::background();
        let inode = sb.inode(9);
        let mut extra: Vec<Arc<INode>> = Vec::new();
        for take in steps {
            if take || extra.is_empty() {
                extra.push(inode.get());
            } else if let Some(held) = extra.pop() {
                held.release(&ctx).expect("release");
            }
            prop_assert!(!inode.is_freed());
            prop_assert_eq!(inode.refcount() as usize, extra.len() + 1);
        }
        for held in extra.drain(..) {
            held.release(&ctx).expect("release");
        }
        prop_assert_eq!(ops.evictions.load(Ordering::SeqCst), 0);
        inode.release(&ctx).expect("release");
        prop_assert!(inode.is_freed());
        prop_assert_eq!(ops.evictions.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn entry_teardown_unlinks_and_releases_everything_once() -> Result<()> {
    let (sb, ops, store) = counting_superblock();
    let ctx = Context::background();
    store.link(ROOT_INODE, PathElement::named("a"), 5);

    let root = sb.root()?;
    let before = root.refcount();
    let child = root.lookup(&ctx, &PathElement::named("a"))?;
    assert_eq!(child.refcount(), 2, "caller plus parent link");
    assert_eq!(root.refcount(), before + 1, "child holds its parent");
    let inode = child.inode().expect("positive entry");
    assert_eq!(inode.cache_entries().len(), 1);

    let extra = child.get();
    extra.release(&ctx)?;
    assert_eq!(child.refcount(), 2);

    child.invalidate(&ctx)?;
    assert!(child.is_disconnected());
    assert!(root.children().is_empty());
    assert_eq!(child.refcount(), 1);
    assert_eq!(ops.evictions.load(Ordering::SeqCst), 0);

    child.release(&ctx)?;
    assert_eq!(child.refcount(), 0);
    assert!(child.is_negative() && child.is_disconnected());
    assert!(child.parent().is_none());
    assert!(inode.is_freed());
    assert_eq!(ops.evictions.load(Ordering::SeqCst), 1);
    assert_eq!(root.refcount(), before);

    child.delete(&ctx)?;
    assert_eq!(ops.evictions.load(Ordering::SeqCst), 1);
    assert_eq!(root.refcount(), before);
    root.release(&ctx)?;
    Ok(())
}

#[test]
fn negative_lookups_are_served_from_the_cache() -> Result<()> {
    let (graph, store, metrics) = memory_graph();
    let ctx = Context::background();

    let missing = graph.resolve(&ctx, &path("g//missing"))?;
    assert!(missing.is_negative());
    missing.release(&ctx)?;
    assert_eq!(store.lookup_calls(), 1);

    for _ in 0..3 {
        let again = graph.resolve(&ctx, &path("g//missing"))?;
        assert!(again.is_negative());
        again.release(&ctx)?;
    }
    assert!(matches!(
        graph.read(&ctx, &path("g//missing")),
        Err(GraphFsError::NotFound)
    ));
    assert_eq!(store.lookup_calls(), 1);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.cache_misses, 1);
    assert!(snapshot.cache_hits >= 3);
    assert!(snapshot.negative_lookups >= 4);

    graph.invalidate(&ctx, &path("g//missing"))?;
    let refreshed = graph.resolve(&ctx, &path("g//missing"))?;
    refreshed.release(&ctx)?;
    assert_eq!(store.lookup_calls(), 2);
    Ok(())
}

#[test]
fn invalidation_picks_up_names_linked_behind_the_cache() -> Result<()> {
    let (graph, store, _metrics) = memory_graph();
    let ctx = Context::background();
    let first = graph.resolve(&ctx, &path("g//late"))?;
    assert!(first.is_negative());
    first.release(&ctx)?;

    store.link(ROOT_INODE, PathElement::named("late"), 30);
    let stale = graph.resolve(&ctx, &path("g//late"))?;
    assert!(stale.is_negative());
    stale.release(&ctx)?;

    graph.invalidate(&ctx, &path("g//late"))?;
    let fresh = graph.resolve(&ctx, &path("g//late"))?;
    assert_eq!(fresh.inode().map(|inode| inode.id()), Some(30));
    fresh.release(&ctx)?;
    Ok(())
}

#[test]
fn negative_intermediate_elements_are_not_found() {
    let (graph, store, _metrics) = memory_graph();
    let ctx = Context::background();
    assert!(matches!(
        graph.resolve(&ctx, &path("g//nope/child")),
        Err(GraphFsError::NotFound)
    ));
    assert!(matches!(
        graph.resolve(&ctx, &path("g//nope/child")),
        Err(GraphFsError::NotFound)
    ));
    assert_eq!(store.lookup_calls(), 1);
}

#[test]
fn unknown_namespace_is_reported() {
    let (graph, _store, _metrics) = memory_graph();
    let ctx = Context::background();
    assert!(matches!(
        graph.resolve(&ctx, &path("other//a")),
        Err(GraphFsError::NoSuchSuperBlock(uuid)) if uuid == "other"
    ));
}

#[test]
fn direct_create_turns_the_negative_entry_positive() -> Result<()> {
    let (graph, store, _metrics) = memory_graph();
    let ctx = Context::background();
    let target = path("g//a");
    assert!(matches!(
        graph.open(&ctx, &target, OpenOptions::new()),
        Err(GraphFsError::NotFound)
    ));

    let mut handle = graph.open(&ctx, &target, OpenOptions::create_if_missing())?;
    let id = handle.inode()?.id();
    handle.write(
        &ctx,
        SerializedNode {
            index: id,
            version: 1,
            data: b"direct".to_vec(),
            ..SerializedNode::default()
        },
    )?;
    handle.close(&ctx)?;
    assert!(handle.is_closed());
    assert!(matches!(handle.read(&ctx), Err(GraphFsError::HandleClosed)));
    handle.close(&ctx)?;

    assert_eq!(store.child(ROOT_INODE, &PathElement::named("a")), Some(id));
    assert_eq!(graph.read(&ctx, &target)?.data, b"direct".to_vec());
    assert_eq!(store.lookup_calls(), 1);

    assert!(matches!(
        graph.open(
            &ctx,
            &target,
            OpenOptions::create_if_missing().flag(OpenFlags::EXCLUSIVE)
        ),
        Err(GraphFsError::AlreadyExists)
    ));
    Ok(())
}

#[test]
fn failed_create_leaves_a_negative_entry() -> Result<()> {
    let (graph, store, _metrics) = memory_graph();
    let ctx = Context::background();
    store.set_fail_creates(true);
    assert!(matches!(
        graph.open(&ctx, &path("g//a"), OpenOptions::create_if_missing()),
        Err(GraphFsError::Io(_))
    ));
    let entry = graph.resolve(&ctx, &path("g//a"))?;
    assert!(entry.is_negative());
    assert!(entry.inode().is_none());
    entry.release(&ctx)?;

    store.set_fail_creates(false);
    let mut handle = graph.open(&ctx, &path("g//a"), OpenOptions::create_if_missing())?;
    handle.close(&ctx)?;
    Ok(())
}

#[test]
fn read_only_handles_refuse_mutation() -> Result<()> {
    let (graph, _store, _metrics) = memory_graph();
    let ctx = Context::background();
    let mut created = graph.open(&ctx, &path("g//ro"), OpenOptions::create_if_missing())?;
    created.close(&ctx)?;

    let mut handle = graph.open(&ctx, &path("g//ro"), OpenOptions::with_flags(OpenFlags::NONE))?;
    assert_eq!(handle.options().flags, OpenFlags::READ);
    assert!(matches!(
        handle.write(&ctx, SerializedNode::default()),
        Err(GraphFsError::PermissionDenied)
    ));
    handle.close(&ctx)?;
    Ok(())
}

#[test]
fn cancelled_context_stops_operations_at_entry() -> Result<()> {
    let (graph, store, _metrics) = memory_graph();
    let ctx = Context::background();
    let mut handle = graph.open(&ctx, &path("g//c"), OpenOptions::create_if_missing())?;

    let token = Arc::new(AtomicBool::new(false));
    let cancellable = Context::with_cancel(Arc::clone(&token));
    handle.write(&cancellable, SerializedNode::default())?;
    token.store(true, Ordering::SeqCst);

    let lookups = store.lookup_calls();
    assert!(matches!(
        graph.open(&cancellable, &path("g//other"), OpenOptions::new()),
        Err(GraphFsError::Cancelled)
    ));
    assert_eq!(store.lookup_calls(), lookups);
    assert!(matches!(
        handle.read(&cancellable),
        Err(GraphFsError::Cancelled)
    ));
    assert!(matches!(
        graph.begin_transaction(&cancellable),
        Err(GraphFsError::Cancelled)
    ));
    handle.close(&ctx)?;
    Ok(())
}

#[test]
fn graph_close_tears_the_namespace_down() -> Result<()> {
    let (sb, ops, store) = counting_superblock();
    let ctx = Context::background();
    store.link(ROOT_INODE, PathElement::named("a"), 5);
    store.link(5, PathElement::named("b"), 6);
    let root = sb.root()?;
    let a = root.lookup(&ctx, &PathElement::named("a"))?;
    let b = a.lookup(&ctx, &PathElement::named("b"))?;
    b.release(&ctx)?;
    a.release(&ctx)?;
    root.release(&ctx)?;

    sb.close(&ctx)?;
    assert!(a.is_disconnected() && b.is_disconnected());
    assert_eq!(sb.cached_inodes(), 0);
    assert_eq!(ops.evictions.load(Ordering::SeqCst), 3);
    assert!(matches!(sb.root(), Err(GraphFsError::Closed)));
    sb.close(&ctx)?;
    Ok(())
}
