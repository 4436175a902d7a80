#![allow(missing_docs)]

use std::sync::{Arc, Once};

use graphfs::primitives::checkpoint::{Checkpoint, FileCheckpoint, MemoryCheckpoint};
use graphfs::primitives::journal::MemoryJournal;
use graphfs::storage::MemoryProvider;
use graphfs::types::Result;
use graphfs::vfs::SuperBlockProvider;
use graphfs::{
    Config, Context, GraphFsError, JournalOp, OpenOptions, Path, ReplicationMessage,
    ReplicationSlot, SerializedNode, VirtualGraph, Xid,
};
use tempfile::tempdir;

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

fn provider() -> Arc<dyn SuperBlockProvider> {
    let provider = MemoryProvider::new();
    provider.add_graph("g");
    Arc::new(provider) as Arc<dyn SuperBlockProvider>
}

/// Writes `g//<name>` in one transaction, committing or rolling back.
fn touch(graph: &VirtualGraph, ctx: &Context, name: &str, commit: bool) -> Result<Xid> {
    let tx = graph.begin_transaction(ctx)?;
    let target: Path = format!("g//{name}").parse()?;
    let mut handle = graph.open(ctx, &target, OpenOptions::create_if_missing().transaction(&tx))?;
    let id = handle.inode()?.id();
    handle.write(
        ctx,
        SerializedNode {
            index: id,
            version: 1,
            data: name.as_bytes().to_vec(),
            ..SerializedNode::default()
        },
    )?;
    handle.close(ctx)?;
    if commit {
        tx.commit(ctx)?;
    } else {
        tx.rollback(ctx)?;
    }
    Ok(tx.xid())
}

fn drain(slot: &ReplicationSlot, ctx: &Context) -> Result<Vec<ReplicationMessage>> {
    let mut out = Vec::new();
    let mut buf = vec![ReplicationMessage::default(); 2];
    loop {
        let n = slot.read(ctx, &mut buf)?;
        if n == 0 {
            return Ok(out);
        }
        out.extend(buf[..n].iter().cloned());
    }
}

#[test]
fn slot_streams_committed_transactions_only() -> Result<()> {
    init_tracing();
    let ctx = Context::background();
    let graph = VirtualGraph::new(
        provider(),
        Arc::new(MemoryJournal::new()),
        Arc::new(MemoryCheckpoint::new()),
    );
    let kept = touch(&graph, &ctx, "a", true)?;
    touch(&graph, &ctx, "dropped", false)?;
    let later = touch(&graph, &ctx, "b", true)?;

    let slot = graph.create_replication_slot(&ctx, "pubsub", false)?;
    let messages = drain(&slot, &ctx)?;
    let xids: Vec<Xid> = messages.iter().map(|message| message.xid).collect();
    assert_eq!(xids, vec![kept, later]);
    for message in &messages {
        assert_eq!(message.entries.first().map(|e| e.op), Some(JournalOp::Begin));
        assert_eq!(message.entries.last().map(|e| e.op), Some(JournalOp::Commit));
        assert!(message
            .entries
            .iter()
            .any(|entry| entry.op == JournalOp::Write));
    }

    let next = touch(&graph, &ctx, "c", true)?;
    let tail = drain(&slot, &ctx)?;
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].xid, next);
    graph.close(&ctx)?;
    assert!(matches!(
        graph.create_replication_slot(&ctx, "pubsub", false),
        Err(GraphFsError::Closed)
    ));
    Ok(())
}

#[test]
fn persistent_slot_resumes_after_reopen() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let config = Config::in_dir(dir.path());
    let ctx = Context::background();

    let (first, position) = {
        let graph = VirtualGraph::from_config(&ctx, &config, provider())?;
        let first = touch(&graph, &ctx, "one", true)?;
        let slot = graph.create_replication_slot(&ctx, "indexer", true)?;
        assert_eq!(drain(&slot, &ctx)?.len(), 1);
        let position = slot.last_lsn()?;
        touch(&graph, &ctx, "two", true)?;
        graph.close(&ctx)?;
        (first, position)
    };
    let stored = FileCheckpoint::new(config.replication.dir.join("indexer.slot"));
    assert_eq!(stored.get()?, Some(position));

    let graph = VirtualGraph::from_config(&ctx, &config, provider())?;
    let slot = graph.create_replication_slot(&ctx, "indexer", true)?;
    assert_eq!(slot.last_lsn()?, position);
    let resumed = drain(&slot, &ctx)?;
    assert_eq!(resumed.len(), 1);
    assert!(resumed[0].xid > first);

    let fresh = graph.create_replication_slot(&ctx, "audit", false)?;
    assert_eq!(drain(&fresh, &ctx)?.len(), 2);

    slot.set_last_lsn(0)?;
    slot.flush_position()?;
    assert_eq!(stored.get()?, Some(0));
    graph.close(&ctx)?;
    Ok(())
}
