#![forbid(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::types::checksum::crc32_of;
use crate::types::{GraphFsError, Result, Xid};

const RECORD_LEN: usize = 12;

/// Durable xid of the last transaction whose replay fully completed.
pub trait Checkpoint: Send + Sync {
    /// Stored xid; `None` for a fresh graph.
    fn get(&self) -> Result<Option<Xid>>;
    /// Atomically replaces the stored xid.
    fn update(&self, xid: Xid) -> Result<()>;
}

/// [`Checkpoint`] stored as a 12-byte file: the xid followed by its CRC32.
///
/// Updates go through a sibling temp file that is fsynced and renamed over
/// the target, so readers see either the old or the new record.
pub struct FileCheckpoint {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCheckpoint {
    /// Checkpoint backed by `path`; the file is created on first update.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the checkpoint file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(xid: Xid) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0..8].copy_from_slice(&xid.to_be_bytes());
        let crc = crc32_of(&[&buf[0..8]]);
        buf[8..12].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(buf: &[u8; RECORD_LEN]) -> Result<Xid> {
        let mut xid = [0u8; 8];
        xid.copy_from_slice(&buf[0..8]);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&buf[8..12]);
        if u32::from_be_bytes(crc) != crc32_of(&[&xid]) {
            return Err(GraphFsError::Corruption("checkpoint crc mismatch"));
        }
        Ok(u64::from_be_bytes(xid))
    }
}

impl Checkpoint for FileCheckpoint {
    fn get(&self) -> Result<Option<Xid>> {
        match File::open(&self.path) {
            Ok(mut file) => {
                let mut buf = [0u8; RECORD_LEN];
                file.read_exact(&mut buf).map_err(|err| match err.kind() {
                    ErrorKind::UnexpectedEof => GraphFsError::Corruption("checkpoint truncated"),
                    _ => GraphFsError::from(err),
                })?;
                Self::decode(&buf).map(Some)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(GraphFsError::from(err)),
        }
    }

    fn update(&self, xid: Xid) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut tmp = self.path.clone();
        tmp.set_extension("tmp");
        if let Some(parent) = tmp.parent() {
            fs::create_dir_all(parent)?;
        }
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&Self::encode(xid))?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(xid, "graphfs.checkpoint.update");
        Ok(())
    }
}

/// Volatile [`Checkpoint`].
#[derive(Default)]
pub struct MemoryCheckpoint {
    xid: Mutex<Option<Xid>>,
}

impl MemoryCheckpoint {
    /// Fresh checkpoint with no stored xid.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Checkpoint for MemoryCheckpoint {
    fn get(&self) -> Result<Option<Xid>> {
        Ok(*self.xid.lock())
    }

    fn update(&self, xid: Xid) -> Result<()> {
        *self.xid.lock() = Some(xid);
        Ok(())
    }
}
