#![forbid(unsafe_code)]
//! Write-ahead journal of transaction records.
//!
//! The journal is the only source of truth for recovery: a transaction is
//! durable once its `Commit` entry is, regardless of whether its replay into
//! the backing stores finished.

use std::io::IoSlice;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::codec::{decode_entry, encode_entry};
use crate::model::{now_unix_nanos, JournalEntry, JournalOp};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::checksum::{chain_crc32, crc32_of};
use crate::types::{GraphFsError, Result, Xid};

const JOURNAL_MAGIC: [u8; 4] = *b"GFSJ";
const JOURNAL_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 32;
const FRAME_HEADER_LEN: usize = 24;
/// Upper bound on one encoded entry; anything larger is a torn length field.
const MAX_ENTRY_LEN: u32 = 64 << 20;

/// Durable, append-only log of [`JournalEntry`] records.
pub trait Journal: Send + Sync {
    /// Appends `entry` and returns its xid.
    ///
    /// A `Begin` with xid zero is assigned the next fresh xid, written back
    /// into `entry`. Any other op must already carry its transaction's xid.
    /// A zero timestamp is stamped with the current time.
    fn write(&self, entry: &mut JournalEntry) -> Result<Xid>;

    /// Entries with `from_xid <= xid <= to_xid` in append order; `None`
    /// reads through the end of the log.
    fn iterate(&self, from_xid: Xid, to_xid: Option<Xid>) -> Result<Vec<JournalEntry>>;

    /// True when nothing has ever been appended.
    fn is_empty(&self) -> Result<bool>;

    /// Forces appended entries to stable storage.
    fn sync(&self) -> Result<()>;
}

/// When [`FileJournal`] forces appended entries to disk.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// After every entry.
    Full,
    /// After `Commit` and `Rollback` entries.
    #[default]
    Normal,
    /// Never; callers sync explicitly.
    Off,
}

impl SyncMode {
    fn should_sync(self, op: JournalOp) -> bool {
        match self {
            SyncMode::Full => true,
            SyncMode::Normal => op.is_terminal(),
            SyncMode::Off => false,
        }
    }
}

/// Append statistics for a [`FileJournal`].
#[derive(Clone, Debug, Default)]
pub struct JournalStats {
    /// Entries appended by this instance.
    pub entries_appended: u64,
    /// Bytes appended, frame headers included.
    pub bytes_appended: u64,
    /// Sync calls issued.
    pub syncs: u64,
}

fn in_range(xid: Xid, from_xid: Xid, to_xid: Option<Xid>) -> bool {
    xid >= from_xid && to_xid.map_or(true, |to| xid <= to)
}

/// Stamps `entry` and reports the xid it will carry once appended.
fn prepare_entry(entry: &mut JournalEntry, next_xid: Xid) -> Result<Xid> {
    if entry.ts == 0 {
        entry.ts = now_unix_nanos();
    }
    match (entry.op, entry.xid) {
        (JournalOp::Begin, 0) => Ok(next_xid),
        (_, 0) => Err(GraphFsError::Invalid("journal entry has no xid")),
        (_, xid) => Ok(xid),
    }
}

#[derive(Clone, Debug)]
struct FileHeader {
    salt: u64,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&JOURNAL_MAGIC);
        buf[4..6].copy_from_slice(&JOURNAL_FORMAT_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.salt.to_be_bytes());
        let crc = crc32_of(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8; FILE_HEADER_LEN]) -> Result<Self> {
        if src[0..4] != JOURNAL_MAGIC {
            return Err(GraphFsError::Corruption("journal magic mismatch"));
        }
        if read_u16(src, 4) != JOURNAL_FORMAT_VERSION {
            return Err(GraphFsError::Corruption("journal format version mismatch"));
        }
        if src[6..8] != [0, 0] || src[16..28].iter().any(|b| *b != 0) {
            return Err(GraphFsError::Corruption(
                "journal reserved header bytes non-zero",
            ));
        }
        if read_u32(src, 28) != crc32_of(&[&src[..28]]) {
            return Err(GraphFsError::Corruption("journal header crc mismatch"));
        }
        Ok(Self {
            salt: read_u64(src, 8),
        })
    }
}

#[derive(Clone, Debug)]
struct FrameHeader {
    payload_len: u32,
    payload_crc32: u32,
    prev_chain: u64,
}

impl FrameHeader {
    fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[4..8].copy_from_slice(&self.payload_crc32.to_be_bytes());
        buf[8..16].copy_from_slice(&self.prev_chain.to_be_bytes());
        let crc = crc32_of(&[&buf[..16]]);
        buf[16..20].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// `None` when the header does not validate.
    fn decode(src: &[u8; FRAME_HEADER_LEN]) -> Option<Self> {
        if read_u32(src, 16) != crc32_of(&[&src[..16]]) || src[20..24] != [0; 4] {
            return None;
        }
        Some(Self {
            payload_len: read_u32(src, 0),
            payload_crc32: read_u32(src, 4),
            prev_chain: read_u64(src, 8),
        })
    }
}

fn read_u16(src: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([src[at], src[at + 1]])
}

fn read_u32(src: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&src[at..at + 4]);
    u32::from_be_bytes(raw)
}

fn read_u64(src: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&src[at..at + 8]);
    u64::from_be_bytes(raw)
}

/// Walks frames from the start of the log, stopping at the first frame that
/// is truncated or fails its checksums.
struct FrameScanner<'a> {
    io: &'a dyn FileIo,
    offset: u64,
    end: u64,
    chain: u64,
}

impl<'a> FrameScanner<'a> {
    fn new(io: &'a dyn FileIo, salt: u64, end: u64) -> Self {
        Self {
            io,
            offset: FILE_HEADER_LEN as u64,
            end,
            chain: salt,
        }
    }

    /// Offset just past the last valid frame.
    fn valid_up_to(&self) -> u64 {
        self.offset
    }

    fn next_entry(&mut self) -> Result<Option<JournalEntry>> {
        if self.offset + FRAME_HEADER_LEN as u64 > self.end {
            return Ok(None);
        }
        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        self.io.read_at(self.offset, &mut header_buf)?;
        let header = match FrameHeader::decode(&header_buf) {
            Some(header) => header,
            None => return Ok(None),
        };
        if header.prev_chain != self.chain || header.payload_len > MAX_ENTRY_LEN {
            return Ok(None);
        }
        let payload_off = self.offset + FRAME_HEADER_LEN as u64;
        if payload_off + u64::from(header.payload_len) > self.end {
            return Ok(None);
        }
        let mut payload = vec![0u8; header.payload_len as usize];
        self.io.read_at(payload_off, &mut payload)?;
        if crc32_of(&[&payload]) != header.payload_crc32 {
            return Ok(None);
        }
        let entry = decode_entry(&payload)?;
        self.chain = chain_crc32(self.chain, &header_buf, &payload);
        self.offset = payload_off + payload.len() as u64;
        Ok(Some(entry))
    }
}

struct FileJournalState {
    append_offset: u64,
    chain: u64,
    next_xid: Xid,
    entries: u64,
    stats: JournalStats,
}

/// [`Journal`] persisted as a single CRC-chained file.
///
/// Reopening scans every frame, truncates whatever follows the last valid
/// one, and resumes xid assignment past the highest xid seen.
pub struct FileJournal {
    io: Arc<dyn FileIo>,
    salt: u64,
    sync_mode: SyncMode,
    state: Mutex<FileJournalState>,
}

impl FileJournal {
    /// Opens or creates the journal file at `path`.
    pub fn open(path: impl AsRef<Path>, sync_mode: SyncMode) -> Result<Self> {
        let io = StdFileIo::open(path)?;
        Self::with_io(Arc::new(io), sync_mode)
    }

    /// Opens a journal over an arbitrary [`FileIo`].
    pub fn with_io(io: Arc<dyn FileIo>, sync_mode: SyncMode) -> Result<Self> {
        let len = io.len()?;
        let header = if len < FILE_HEADER_LEN as u64 {
            let header = FileHeader {
                salt: OsRng.next_u64(),
            };
            io.write_at(0, &header.encode())?;
            io.truncate(FILE_HEADER_LEN as u64)?;
            io.sync_all()?;
            header
        } else {
            let mut buf = [0u8; FILE_HEADER_LEN];
            io.read_at(0, &mut buf)?;
            FileHeader::decode(&buf)?
        };
        let len = io.len()?;
        let mut scanner = FrameScanner::new(io.as_ref(), header.salt, len);
        let mut entries = 0u64;
        let mut max_xid = 0;
        while let Some(entry) = scanner.next_entry()? {
            entries += 1;
            max_xid = max_xid.max(entry.xid);
        }
        let append_offset = scanner.valid_up_to();
        let chain = scanner.chain;
        if append_offset < len {
            warn!(
                valid_up_to = append_offset,
                len,
                "graphfs.journal.truncate_torn_tail"
            );
            io.truncate(append_offset)?;
            io.sync_all()?;
        }
        info!(entries, next_xid = max_xid + 1, "graphfs.journal.open");
        Ok(Self {
            io,
            salt: header.salt,
            sync_mode,
            state: Mutex::new(FileJournalState {
                append_offset,
                chain,
                next_xid: max_xid + 1,
                entries,
                stats: JournalStats::default(),
            }),
        })
    }

    /// Sync policy in effect.
    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    /// Statistics for this instance.
    pub fn stats(&self) -> JournalStats {
        self.state.lock().stats.clone()
    }

    /// Size of the valid portion of the log in bytes.
    pub fn len(&self) -> u64 {
        self.state.lock().append_offset
    }
}

impl Journal for FileJournal {
    fn write(&self, entry: &mut JournalEntry) -> Result<Xid> {
        let mut state = self.state.lock();
        let xid = prepare_entry(entry, state.next_xid)?;
        let assigned = entry.xid == 0;
        entry.xid = xid;
        let payload = match encode_entry(entry) {
            Ok(payload) => payload,
            Err(err) => {
                if assigned {
                    entry.xid = 0;
                }
                return Err(err);
            }
        };
        let payload_len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_ENTRY_LEN)
            .ok_or(GraphFsError::Invalid("journal entry too large"))?;
        let header = FrameHeader {
            payload_len,
            payload_crc32: crc32_of(&[&payload]),
            prev_chain: state.chain,
        }
        .encode();
        let slices = [IoSlice::new(&header), IoSlice::new(&payload)];
        if let Err(err) = self.io.writev_at(state.append_offset, &slices) {
            if assigned {
                entry.xid = 0;
            }
            return Err(err);
        }
        let frame_len = (FRAME_HEADER_LEN + payload.len()) as u64;
        state.chain = chain_crc32(state.chain, &header, &payload);
        state.append_offset += frame_len;
        state.entries += 1;
        state.next_xid = state.next_xid.max(xid + 1);
        state.stats.entries_appended += 1;
        state.stats.bytes_appended += frame_len;
        debug!(xid, op = ?entry.op, inode = entry.inode, "graphfs.journal.append");
        if self.sync_mode.should_sync(entry.op) {
            self.io.sync_all()?;
            state.stats.syncs += 1;
        }
        Ok(xid)
    }

    fn iterate(&self, from_xid: Xid, to_xid: Option<Xid>) -> Result<Vec<JournalEntry>> {
        let state = self.state.lock();
        let mut scanner = FrameScanner::new(self.io.as_ref(), self.salt, state.append_offset);
        let mut out = Vec::new();
        while let Some(entry) = scanner.next_entry()? {
            if in_range(entry.xid, from_xid, to_xid) {
                out.push(entry);
            }
        }
        if scanner.valid_up_to() != state.append_offset {
            return Err(GraphFsError::Corruption("journal frame chain broken"));
        }
        Ok(out)
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.state.lock().entries == 0)
    }

    fn sync(&self) -> Result<()> {
        self.io.sync_all()?;
        self.state.lock().stats.syncs += 1;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryJournalState {
    entries: Vec<JournalEntry>,
    next_xid: Xid,
}

/// In-process [`Journal`] for tests and ephemeral graphs.
#[derive(Default)]
pub struct MemoryJournal {
    state: Mutex<MemoryJournalState>,
}

impl MemoryJournal {
    /// Empty journal; the first `Begin` receives xid 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries appended so far.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }
}

impl Journal for MemoryJournal {
    fn write(&self, entry: &mut JournalEntry) -> Result<Xid> {
        let mut state = self.state.lock();
        let next = state.next_xid.max(1);
        let xid = prepare_entry(entry, next)?;
        entry.xid = xid;
        state.next_xid = next.max(xid + 1);
        state.entries.push(entry.clone());
        debug!(xid, op = ?entry.op, inode = entry.inode, "graphfs.journal.append");
        Ok(xid)
    }

    fn iterate(&self, from_xid: Xid, to_xid: Option<Xid>) -> Result<Vec<JournalEntry>> {
        let state = self.state.lock();
        Ok(state
            .entries
            .iter()
            .filter(|entry| in_range(entry.xid, from_xid, to_xid))
            .cloned()
            .collect())
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.state.lock().entries.is_empty())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
