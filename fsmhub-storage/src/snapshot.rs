//! Durable automaton snapshot.
//!
//! The whole registry state lives in one JSON file:
//!
//! ```json
//! {
//!   "checksum": "1c291ca3",
//!   "automata": {
//!     "front_door": {"state": "open", "since": "2026-10-16T08:30:00Z"}
//!   }
//! }
//! ```
//!
//! The checksum is the crc32c of the serialized `automata` object. Writes go
//! to a temporary file that is renamed over the old one.

use crate::error::StorageError;
use chrono::{DateTime, Utc};
use fsmhub_core::Snapshot;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize)]
struct Envelope {
    checksum: String,
    automata: Snapshot,
}

/// Details of the last snapshot written or loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub checksum: String,
    pub automata: usize,
    pub size_bytes: u64,
    pub at: DateTime<Utc>,
}

/// Reads and writes the snapshot file.
pub struct SnapshotStore {
    path: PathBuf,
    last: RwLock<Option<SnapshotMeta>>,
}

impl SnapshotStore {
    /// Creates a store for the given file. The parent directory is created
    /// if needed; the file itself is only written on [`SnapshotStore::save`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        Ok(Self {
            path,
            last: RwLock::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the snapshot. A missing file is an empty snapshot.
    pub fn load(&self) -> Result<Snapshot, StorageError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Snapshot::new()),
            Err(e) => return Err(e.into()),
        };

        let envelope: Envelope = serde_json::from_slice(&data).map_err(|e| {
            StorageError::Corruption(format!("{}: {}", self.path.display(), e))
        })?;

        let actual = checksum(&envelope.automata)?;
        if actual != envelope.checksum {
            return Err(StorageError::Corruption(format!(
                "{}: checksum mismatch (expected {}, got {})",
                self.path.display(),
                envelope.checksum,
                actual
            )));
        }

        *self.last.write() = Some(SnapshotMeta {
            checksum: actual,
            automata: envelope.automata.len(),
            size_bytes: data.len() as u64,
            at: Utc::now(),
        });

        Ok(envelope.automata)
    }

    /// Atomically replaces the snapshot file.
    pub fn save(&self, snapshot: &Snapshot) -> Result<SnapshotMeta, StorageError> {
        let envelope = Envelope {
            checksum: checksum(snapshot)?,
            automata: snapshot.clone(),
        };
        let data = serde_json::to_vec_pretty(&envelope)?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&data)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        let meta = SnapshotMeta {
            checksum: envelope.checksum,
            automata: snapshot.len(),
            size_bytes: data.len() as u64,
            at: Utc::now(),
        };
        *self.last.write() = Some(meta.clone());

        tracing::debug!(
            "Wrote snapshot of {} automata to {}",
            meta.automata,
            self.path.display()
        );

        Ok(meta)
    }

    /// The last snapshot written or loaded by this store.
    pub fn last(&self) -> Option<SnapshotMeta> {
        self.last.read().clone()
    }
}

fn checksum(snapshot: &Snapshot) -> Result<String, StorageError> {
    let data = serde_json::to_vec(snapshot)?;
    Ok(format!("{:08x}", crc32c::crc32c(&data)))
}
