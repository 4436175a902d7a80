#![allow(missing_docs)]

use std::fs::{self, OpenOptions as FsOpenOptions};
use std::io::Write;
use std::sync::{Arc, Once};

use graphfs::primitives::checkpoint::{Checkpoint, FileCheckpoint};
use graphfs::primitives::journal::{FileJournal, Journal, SyncMode};
use graphfs::storage::{MemoryProvider, MemoryStore, ROOT_INODE};
use graphfs::types::Result;
use graphfs::vfs::SuperBlockProvider;
use graphfs::{
    Config, Context, InodeId, JournalEntry, JournalOp, OpenOptions, Path, PathElement,
    RecoveryReport, SerializedNode, VirtualGraph,
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

fn fresh_store() -> (Arc<dyn SuperBlockProvider>, Arc<MemoryStore>) {
    let provider = MemoryProvider::new();
    let store = provider.add_graph("g");
    (Arc::new(provider) as Arc<dyn SuperBlockProvider>, store)
}

fn node(index: InodeId, data: &str) -> SerializedNode {
    SerializedNode {
        index,
        version: 1,
        data: data.as_bytes().to_vec(),
        ..SerializedNode::default()
    }
}

/// Commits one transaction per name, each creating `g//<name>`.
fn commit_nodes(graph: &VirtualGraph, ctx: &Context, names: &[&str]) -> Result<Vec<InodeId>> {
    let mut ids = Vec::new();
    for name in names {
        let tx = graph.begin_transaction(ctx)?;
        let target: Path = format!("g//{name}").parse()?;
        let mut handle =
            graph.open(ctx, &target, OpenOptions::create_if_missing().transaction(&tx))?;
        let id = handle.inode()?.id();
        handle.write(ctx, node(id, name))?;
        handle.close(ctx)?;
        tx.commit(ctx)?;
        ids.push(id);
    }
    Ok(ids)
}

#[test]
fn recovery_replays_committed_and_rolls_back_the_unfinished() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let config = Config::in_dir(dir.path());
    let ctx = Context::background();

    let ids = {
        let (provider, _lost) = fresh_store();
        let graph = VirtualGraph::from_config(&ctx, &config, provider)?;
        let ids = commit_nodes(&graph, &ctx, &["n1", "n2", "n3"])?;
        let crashed = graph.begin_transaction(&ctx)?;
        assert_eq!(crashed.xid(), 4);
        ids
    };
    // the store and the checkpoint were lost with the process
    fs::remove_file(&config.checkpoint.path)?;

    let (provider, store) = fresh_store();
    let graph = VirtualGraph::new(
        provider,
        Arc::new(config.open_journal()?),
        Arc::new(config.open_checkpoint()),
    );
    let report = graph.recover(&ctx)?;
    assert_eq!(
        report,
        RecoveryReport {
            committed: 3,
            rolled_back: 1,
            failed: 0
        }
    );
    for (id, name) in ids.iter().zip(["n1", "n2", "n3"]) {
        assert_eq!(store.node(*id).map(|n| n.data), Some(name.as_bytes().to_vec()));
        assert_eq!(store.child(ROOT_INODE, &PathElement::named(name)), Some(*id));
    }
    assert_eq!(config.open_checkpoint().get()?, Some(3));

    let next = graph.begin_transaction(&ctx)?;
    assert_eq!(next.xid(), 5);
    next.rollback(&ctx)?;
    graph.close(&ctx)?;
    Ok(())
}

#[test]
fn recovery_skips_transactions_at_or_below_the_checkpoint() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let config = Config::in_dir(dir.path());
    let ctx = Context::background();
    let ids = {
        let (provider, _lost) = fresh_store();
        let graph = VirtualGraph::from_config(&ctx, &config, provider)?;
        commit_nodes(&graph, &ctx, &["a", "b", "c"])?
    };
    config.open_checkpoint().update(2)?;

    let (provider, store) = fresh_store();
    let graph = VirtualGraph::from_config(&ctx, &config, provider)?;
    assert_eq!(store.node(ids[0]), None);
    assert_eq!(store.node(ids[1]), None);
    assert_eq!(store.node(ids[2]).map(|n| n.data), Some(b"c".to_vec()));
    assert_eq!(config.open_checkpoint().get()?, Some(3));
    graph.close(&ctx)?;
    Ok(())
}

#[test]
fn recovery_counts_journaled_rollbacks_and_ignores_orphans() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let journal_path = dir.path().join("hand.journal");
    {
        let journal = FileJournal::open(&journal_path, SyncMode::Full)?;
        let mut begin = JournalEntry::begin();
        let xid = journal.write(&mut begin)?;
        let mut create = JournalEntry::create(10, "g//x".parse()?);
        create.xid = xid;
        journal.write(&mut create)?;
        let mut rollback = JournalEntry::rollback();
        rollback.xid = xid;
        journal.write(&mut rollback)?;

        let mut orphan = JournalEntry::write(11, "g//y".parse()?, node(11, "orphan"));
        orphan.xid = 99;
        journal.write(&mut orphan)?;
    }

    let ctx = Context::background();
    let (provider, store) = fresh_store();
    let checkpoint = Arc::new(FileCheckpoint::new(dir.path().join("hand.checkpoint")));
    let graph = VirtualGraph::new(
        provider,
        Arc::new(FileJournal::open(&journal_path, SyncMode::Full)?),
        Arc::clone(&checkpoint) as Arc<dyn Checkpoint>,
    );
    let report = graph.recover(&ctx)?;
    assert_eq!(
        report,
        RecoveryReport {
            committed: 0,
            rolled_back: 1,
            failed: 0
        }
    );
    assert_eq!(store.node(10), None);
    assert_eq!(store.node(11), None);
    assert_eq!(checkpoint.get()?, None);
    Ok(())
}

#[test]
fn replay_failure_is_reported_without_stopping_siblings() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let journal_path = dir.path().join("mixed.journal");
    {
        let journal = FileJournal::open(&journal_path, SyncMode::Normal)?;
        let plan = [
            (20, "g//ok1", false),
            (21, "g//missing/child", true),
            (22, "g//ok2", false),
        ];
        for (inode, target, bad) in plan {
            let mut begin = JournalEntry::begin();
            let xid = journal.write(&mut begin)?;
            let mut entries = vec![
                JournalEntry::create(inode, target.parse()?),
                JournalEntry::write(inode, target.parse()?, node(inode, target)),
                JournalEntry::commit(),
            ];
            if bad {
                entries.remove(0);
            }
            for mut entry in entries {
                entry.xid = xid;
                journal.write(&mut entry)?;
            }
        }
    }

    let ctx = Context::background();
    let (provider, store) = fresh_store();
    let checkpoint = Arc::new(FileCheckpoint::new(dir.path().join("mixed.checkpoint")));
    let graph = VirtualGraph::new(
        provider,
        Arc::new(FileJournal::open(&journal_path, SyncMode::Normal)?),
        Arc::clone(&checkpoint) as Arc<dyn Checkpoint>,
    );
    let report = graph.recover(&ctx)?;
    assert_eq!(
        report,
        RecoveryReport {
            committed: 2,
            rolled_back: 0,
            failed: 1
        }
    );
    assert!(store.node(20).is_some());
    assert!(store.node(21).is_none());
    assert!(store.node(22).is_some());
    assert_eq!(checkpoint.get()?, Some(3));
    Ok(())
}

#[test]
fn torn_journal_tail_does_not_block_reopen() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let config = Config::in_dir(dir.path());
    let ctx = Context::background();
    {
        let (provider, _store) = fresh_store();
        let graph = VirtualGraph::from_config(&ctx, &config, provider)?;
        commit_nodes(&graph, &ctx, &["kept"])?;
        graph.close(&ctx)?;
    }
    let intact = fs::metadata(&config.journal.path)?.len();
    {
        let mut file = FsOpenOptions::new().append(true).open(&config.journal.path)?;
        file.write_all(&[0xA5; 37])?;
        file.sync_all()?;
    }

    let journal = config.open_journal()?;
    assert_eq!(journal.len(), intact);
    let ops: Vec<JournalOp> = journal
        .iterate(0, None)?
        .into_iter()
        .map(|entry| entry.op)
        .collect();
    assert_eq!(
        ops,
        vec![
            JournalOp::Begin,
            JournalOp::Create,
            JournalOp::Write,
            JournalOp::Commit
        ]
    );
    assert_eq!(fs::metadata(&config.journal.path)?.len(), intact);
    Ok(())
}

#[test]
fn config_file_drives_the_durable_layout() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let config_path = dir.path().join("graphfs.toml");
    fs::write(
        &config_path,
        "recover_on_open = true\n[journal]\npath = \"state/wal\"\nsync = \"full\"\n[checkpoint]\npath = \"state/ckpt\"\n",
    )?;
    fs::create_dir_all(dir.path().join("state"))?;
    let config = Config::load(&config_path)?;
    assert_eq!(config.journal.sync, SyncMode::Full);

    let ctx = Context::background();
    let (provider, _store) = fresh_store();
    let graph = VirtualGraph::from_config(&ctx, &config, provider)?;
    commit_nodes(&graph, &ctx, &["cfg"])?;
    graph.close(&ctx)?;

    assert!(dir.path().join("state/wal").exists());
    assert_eq!(
        FileCheckpoint::new(dir.path().join("state/ckpt")).get()?,
        Some(1)
    );
    Ok(())
}
