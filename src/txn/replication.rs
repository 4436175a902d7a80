use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::model::{JournalEntry, JournalOp};
use crate::primitives::checkpoint::{Checkpoint, FileCheckpoint, MemoryCheckpoint};
use crate::primitives::journal::Journal;
use crate::types::{Context, GraphFsError, Result, Xid};

const SLOT_FILE_EXTENSION: &str = "slot";

/// One committed transaction as delivered by a [`ReplicationSlot`]: every
/// journal entry of `xid` from `Begin` through `Commit`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReplicationMessage {
    /// Transaction id.
    pub xid: Xid,
    /// The transaction's entries in append order.
    pub entries: Vec<JournalEntry>,
}

/// Where persistent slots keep their positions.
#[derive(Clone, Debug)]
pub enum SlotStorage {
    /// Positions live as long as the manager.
    Memory,
    /// One `<name>.slot` record per slot under the directory.
    Dir(PathBuf),
}

/// Registry of the replication slots reading one journal.
pub struct ReplicationManager {
    journal: Arc<dyn Journal>,
    storage: SlotStorage,
    slots: Mutex<FxHashMap<String, Arc<ReplicationSlot>>>,
    memory_positions: Mutex<FxHashMap<String, Arc<MemoryCheckpoint>>>,
}

impl ReplicationManager {
    /// Manager over `journal`, persisting positions in `storage`.
    pub fn new(journal: Arc<dyn Journal>, storage: SlotStorage) -> Self {
        Self {
            journal,
            storage,
            slots: Mutex::new(FxHashMap::default()),
            memory_positions: Mutex::new(FxHashMap::default()),
        }
    }

    /// Opens slot `name`.
    ///
    /// A persistent slot is shared by name while it stays open and resumes
    /// from its stored position once reopened. A volatile slot is private to
    /// the caller and starts at the head of the journal.
    pub fn create_slot(
        &self,
        ctx: &Context,
        name: &str,
        persistent: bool,
    ) -> Result<Arc<ReplicationSlot>> {
        ctx.check_cancel()?;
        validate_name(name)?;
        if !persistent {
            return Ok(Arc::new(ReplicationSlot::new(
                name,
                Arc::clone(&self.journal),
                None,
                0,
            )));
        }

        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(name) {
            if !slot.is_closed() {
                return Ok(Arc::clone(slot));
            }
        }
        let position = self.position_store(name);
        let lsn = position.get()?.unwrap_or(0);
        let slot = Arc::new(ReplicationSlot::new(
            name,
            Arc::clone(&self.journal),
            Some(position),
            lsn,
        ));
        slots.insert(name.to_string(), Arc::clone(&slot));
        debug!(slot = name, lsn, "graphfs.replication.slot_open");
        Ok(slot)
    }

    fn position_store(&self, name: &str) -> Arc<dyn Checkpoint> {
        match &self.storage {
            SlotStorage::Memory => {
                let mut positions = self.memory_positions.lock();
                let position = positions
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(MemoryCheckpoint::new()));
                Arc::clone(position) as Arc<dyn Checkpoint>
            }
            SlotStorage::Dir(dir) => {
                let file = dir.join(format!("{name}.{SLOT_FILE_EXTENSION}"));
                Arc::new(FileCheckpoint::new(file))
            }
        }
    }

    /// Closes every persistent slot, flushing its position.
    pub fn close(&self) -> Result<()> {
        let slots: Vec<Arc<ReplicationSlot>> =
            self.slots.lock().drain().map(|(_, slot)| slot).collect();
        let mut first_err = None;
        for slot in slots {
            if let Err(err) = slot.close() {
                warn!(slot = slot.name(), error = %err, "graphfs.replication.close_failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(GraphFsError::Invalid("slot name must not be empty"));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if !name.chars().all(allowed) || name.starts_with('.') {
        return Err(GraphFsError::InvalidOwned(format!(
            "slot name {name:?} must be ASCII letters, digits, '-', '_' or '.'"
        )));
    }
    Ok(())
}

struct SlotState {
    last_lsn: u64,
    pending: FxHashMap<Xid, Vec<JournalEntry>>,
    closed: bool,
}

/// Position-tracked feed of committed transactions read from the journal.
///
/// The position (LSN) counts journal entries consumed in append order.
/// Entries of a transaction are buffered until its `Commit`, which emits one
/// [`ReplicationMessage`]; a `Rollback` discards them.
pub struct ReplicationSlot {
    name: String,
    journal: Arc<dyn Journal>,
    position: Option<Arc<dyn Checkpoint>>,
    state: Mutex<SlotState>,
}

impl ReplicationSlot {
    fn new(
        name: &str,
        journal: Arc<dyn Journal>,
        position: Option<Arc<dyn Checkpoint>>,
        last_lsn: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            journal,
            position,
            state: Mutex::new(SlotState {
                last_lsn,
                pending: FxHashMap::default(),
                closed: false,
            }),
        }
    }

    /// Slot name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the position survives a restart.
    pub fn is_persistent(&self) -> bool {
        self.position.is_some()
    }

    /// True after [`ReplicationSlot::close`].
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of journal entries consumed so far.
    pub fn last_lsn(&self) -> Result<u64> {
        let state = self.state.lock();
        if state.closed {
            return Err(GraphFsError::Closed);
        }
        Ok(state.last_lsn)
    }

    /// Moves the position to `lsn`. Partially read transactions are dropped.
    pub fn set_last_lsn(&self, lsn: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(GraphFsError::Closed);
        }
        state.last_lsn = lsn;
        state.pending.clear();
        Ok(())
    }

    /// Fills `buf` with the next committed transactions and returns how many
    /// were written. Zero means the journal holds nothing new.
    pub fn read(&self, ctx: &Context, buf: &mut [ReplicationMessage]) -> Result<usize> {
        ctx.check_cancel()?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(GraphFsError::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let skip = usize::try_from(state.last_lsn).unwrap_or(usize::MAX);
        let entries = self.journal.iterate(0, None)?;
        let mut filled = 0;
        for entry in entries.into_iter().skip(skip) {
            if filled == buf.len() {
                break;
            }
            state.last_lsn += 1;
            let (op, xid) = (entry.op, entry.xid);
            if op == JournalOp::Begin {
                state.pending.insert(xid, vec![entry]);
                continue;
            }
            let Some(log) = state.pending.get_mut(&xid) else {
                warn!(slot = %self.name, xid, op = ?op, "graphfs.replication.orphan");
                continue;
            };
            log.push(entry);
            match op {
                JournalOp::Commit => {
                    let entries = state.pending.remove(&xid).unwrap_or_default();
                    buf[filled] = ReplicationMessage { xid, entries };
                    filled += 1;
                }
                JournalOp::Rollback => {
                    state.pending.remove(&xid);
                }
                _ => {}
            }
        }
        debug!(
            slot = %self.name,
            delivered = filled,
            lsn = state.last_lsn,
            "graphfs.replication.read"
        );
        Ok(filled)
    }

    /// Persists the current position. Volatile slots have nothing to do.
    pub fn flush_position(&self) -> Result<()> {
        let state = self.state.lock();
        self.flush_locked(&state)
    }

    fn flush_locked(&self, state: &SlotState) -> Result<()> {
        let Some(position) = &self.position else {
            return Ok(());
        };
        position.update(state.last_lsn)?;
        debug!(slot = %self.name, lsn = state.last_lsn, "graphfs.replication.flush");
        Ok(())
    }

    /// Flushes the position and rejects further use. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.pending.clear();
        self.flush_locked(&state)
    }
}

impl std::fmt::Debug for ReplicationSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReplicationSlot")
            .field("name", &self.name)
            .field("persistent", &self.is_persistent())
            .field("last_lsn", &state.last_lsn)
            .field("pending", &state.pending.len())
            .field("closed", &state.closed)
            .finish()
    }
}
