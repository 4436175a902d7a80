#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::{Arc, Barrier, Once};
use std::thread;

use graphfs::primitives::checkpoint::{Checkpoint, MemoryCheckpoint};
use graphfs::primitives::journal::{Journal, MemoryJournal};
use graphfs::storage::{MemoryProvider, MemoryStore, ROOT_INODE};
use graphfs::types::Result;
use graphfs::{
    Context, InodeId, JournalOp, OpenOptions, Path, PathElement, SerializedNode, VirtualGraph,
    Xid,
};

const THREADS: usize = 8;
const TXNS_PER_THREAD: usize = 16;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("graphfs=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

struct Fixture {
    graph: Arc<VirtualGraph>,
    store: Arc<MemoryStore>,
    journal: Arc<MemoryJournal>,
    checkpoint: Arc<MemoryCheckpoint>,
}

fn fixture() -> Fixture {
    init_tracing();
    let provider = MemoryProvider::new();
    let store = provider.add_graph("g");
    let journal = Arc::new(MemoryJournal::new());
    let checkpoint = Arc::new(MemoryCheckpoint::new());
    let graph = VirtualGraph::new(
        Arc::new(provider),
        Arc::clone(&journal) as Arc<dyn Journal>,
        Arc::clone(&checkpoint) as Arc<dyn Checkpoint>,
    );
    Fixture {
        graph,
        store,
        journal,
        checkpoint,
    }
}

/// One transaction creating `g//<name>` with `name` as its payload.
fn create_node(graph: &VirtualGraph, ctx: &Context, name: &str) -> Result<(Xid, InodeId)> {
    let tx = graph.begin_transaction(ctx)?;
    let target: Path = format!("g//{name}").parse()?;
    let mut handle = graph.open(ctx, &target, OpenOptions::create_if_missing().transaction(&tx))?;
    let id = handle.inode()?.id();
    let written = handle.write(
        ctx,
        SerializedNode {
            index: id,
            version: 1,
            data: name.as_bytes().to_vec(),
            ..SerializedNode::default()
        },
    );
    handle.close(ctx)?;
    written?;
    tx.commit(ctx)?;
    Ok((tx.xid(), id))
}

#[test]
fn concurrent_transactions_each_commit_once() -> Result<()> {
    let fx = fixture();
    let barrier = Arc::new(Barrier::new(THREADS));

    let results: Vec<Result<Vec<(String, Xid, InodeId)>>> = thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|worker| {
                let graph = Arc::clone(&fx.graph);
                let barrier = Arc::clone(&barrier);
                scope.spawn(move || -> Result<Vec<(String, Xid, InodeId)>> {
                    let ctx = Context::background();
                    barrier.wait();
                    let mut done = Vec::with_capacity(TXNS_PER_THREAD);
                    for n in 0..TXNS_PER_THREAD {
                        let name = format!("t{worker}-{n}");
                        let (xid, id) = create_node(&graph, &ctx, &name)?;
                        done.push((name, xid, id));
                    }
                    Ok(done)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().expect("worker panicked"))
            .collect()
    });

    let mut xids = BTreeSet::new();
    let mut inodes = BTreeSet::new();
    for outcome in results {
        for (name, xid, id) in outcome? {
            assert!(xids.insert(xid), "xid {xid} issued twice");
            assert!(inodes.insert(id), "inode {id} allocated twice");
            assert_eq!(fx.store.node(id).map(|node| node.data), Some(name.clone().into_bytes()));
            assert_eq!(fx.store.child(ROOT_INODE, &PathElement::named(name)), Some(id));
        }
    }
    let total = (THREADS * TXNS_PER_THREAD) as Xid;
    assert_eq!(xids.len() as Xid, total);
    assert_eq!(xids.iter().next().copied(), Some(1));
    assert_eq!(xids.iter().next_back().copied(), Some(total));
    assert_eq!(fx.checkpoint.get()?, Some(total));
    assert!(fx.graph.transaction_manager().active_transactions().is_empty());

    let commits = fx
        .journal
        .iterate(0, None)?
        .iter()
        .filter(|entry| entry.op == JournalOp::Commit)
        .count();
    assert_eq!(commits as Xid, total);
    fx.graph.close(&Context::background())?;
    Ok(())
}

#[test]
fn concurrent_writers_to_one_node_leave_a_committed_version() -> Result<()> {
    let fx = fixture();
    let ctx = Context::background();
    let (_, id) = create_node(&fx.graph, &ctx, "shared")?;
    let target: Path = "g//shared".parse()?;
    let barrier = Arc::new(Barrier::new(THREADS));

    let outcomes: Vec<Result<()>> = thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|worker| {
                let graph = Arc::clone(&fx.graph);
                let barrier = Arc::clone(&barrier);
                let target = target.clone();
                scope.spawn(move || -> Result<()> {
                    let ctx = Context::background();
                    barrier.wait();
                    let tx = graph.begin_transaction(&ctx)?;
                    let mut handle = graph.open(
                        &ctx,
                        &target,
                        OpenOptions::create_if_missing().transaction(&tx),
                    )?;
                    let written = handle.write(
                        &ctx,
                        SerializedNode {
                            index: id,
                            version: worker as u64 + 2,
                            data: format!("w{worker}").into_bytes(),
                            ..SerializedNode::default()
                        },
                    );
                    handle.close(&ctx)?;
                    written?;
                    tx.commit(&ctx)
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

    let stored = fx.store.node(id).map(|node| node.data);
    let candidates: Vec<Vec<u8>> = (0..THREADS)
        .map(|worker| format!("w{worker}").into_bytes())
        .collect();
    assert!(stored.is_some_and(|data| candidates.contains(&data)));
    assert_eq!(fx.checkpoint.get()?, Some(1 + THREADS as Xid));
    fx.graph.close(&ctx)?;
    Ok(())
}
