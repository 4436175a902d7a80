//! TOML configuration for durable graphs.
//!
//! ```toml
//! recover_on_open = true
//!
//! [journal]
//! path = "graph.journal"
//! sync = "normal"
//!
//! [checkpoint]
//! path = "graph.checkpoint"
//!
//! [replication]
//! dir = "graph.slots"
//! ```
//!
//! Relative paths in a file loaded with [`Config::load`] resolve against the
//! file's directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::primitives::checkpoint::FileCheckpoint;
use crate::primitives::journal::{FileJournal, SyncMode};
use crate::txn::SlotStorage;
use crate::types::{GraphFsError, Result};

const DEFAULT_JOURNAL_FILE: &str = "graphfs.journal";
const DEFAULT_CHECKPOINT_FILE: &str = "graphfs.checkpoint";
const DEFAULT_SLOT_DIR: &str = "graphfs.slots";

/// Journal section.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JournalConfig {
    /// Journal file.
    pub path: PathBuf,
    /// When appended entries are forced to disk.
    pub sync: SyncMode,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_JOURNAL_FILE),
            sync: SyncMode::default(),
        }
    }
}

/// Checkpoint section.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Checkpoint file.
    pub path: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_CHECKPOINT_FILE),
        }
    }
}

/// Replication section.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicationConfig {
    /// Directory holding one position record per persistent slot.
    pub dir: PathBuf,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_SLOT_DIR),
        }
    }
}

/// Durable-graph configuration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Replay committed journal entries when the graph is opened.
    pub recover_on_open: bool,
    /// Journal settings.
    pub journal: JournalConfig,
    /// Checkpoint settings.
    pub checkpoint: CheckpointConfig,
    /// Replication slot settings.
    pub replication: ReplicationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recover_on_open: true,
            journal: JournalConfig::default(),
            checkpoint: CheckpointConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl Config {
    /// Defaults with every durable file placed in `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let mut config = Self::default();
        config.rebase(dir.as_ref());
        config
    }

    /// Parses TOML text; paths are taken as written.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        toml::from_str(src).map_err(|err| GraphFsError::Config(err.to_string()))
    }

    /// Reads and parses the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|err| GraphFsError::Config(format!("{}: {err}", path.display())))?;
        let mut config = Self::from_toml_str(&contents)?;
        if let Some(dir) = path.parent() {
            config.rebase(dir);
        }
        Ok(config)
    }

    /// Serializes to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| GraphFsError::Config(err.to_string()))
    }

    fn rebase(&mut self, dir: &Path) {
        for path in [
            &mut self.journal.path,
            &mut self.checkpoint.path,
            &mut self.replication.dir,
        ] {
            if path.is_relative() {
                *path = dir.join(&*path);
            }
        }
    }

    /// Opens the configured journal, creating it if missing.
    pub fn open_journal(&self) -> Result<FileJournal> {
        FileJournal::open(&self.journal.path, self.journal.sync)
    }

    /// The configured checkpoint.
    pub fn open_checkpoint(&self) -> FileCheckpoint {
        FileCheckpoint::new(&self.checkpoint.path)
    }

    /// Where persistent replication slots store their positions.
    pub fn slot_storage(&self) -> SlotStorage {
        SlotStorage::Dir(self.replication.dir.clone())
    }
}
