//! JSON snapshot persistence for the registry.
//!
//! Saves the live record map to a flat JSON file and loads it back at
//! startup, upgrading legacy entries that predate the `created_at` /
//! `access_count` fields. Rate-window state is never persisted; rate
//! limits reset on restart by design.

use crate::registry::{MediaKind, MediaRecord};
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Errors from snapshot save/load.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// File read/write failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Encode/decode failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// On-disk record form. Legacy snapshots omit `created_at` and
/// `access_count`; decoding through this type keeps the upgrade step out
/// of the steady-state registry types.
#[derive(Debug, Deserialize)]
struct StoredRecord {
    id: String,
    #[serde(rename = "type")]
    kind: MediaKind,
    #[serde(default)]
    created_at: Option<i64>,
    #[serde(default)]
    access_count: Option<u64>,
}

impl StoredRecord {
    /// One-time, idempotent upgrade: legacy records get `created_at = now`
    /// and a zero access count; native records pass through unchanged.
    fn upgrade(self, now: i64) -> (MediaRecord, bool) {
        let legacy = self.created_at.is_none();
        (
            MediaRecord {
                file_id: self.id,
                kind: self.kind,
                created_at: self.created_at.unwrap_or(now),
                access_count: self.access_count.unwrap_or(0),
            },
            legacy,
        )
    }
}

/// Serializes the registry map to a JSON file and back.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Creates a store backed by the given file path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the record map as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the file write fails. The
    /// caller logs and continues; the in-memory registry stays
    /// authoritative.
    pub async fn save(&self, records: &HashMap<String, MediaRecord>) -> Result<(), SnapshotError> {
        let body = serde_json::to_string_pretty(records)?;
        tokio::fs::write(&self.path, body).await?;
        info!(count = records.len(), path = %self.path.display(), "snapshot saved");
        Ok(())
    }

    /// Reads and upgrades the record map from disk.
    ///
    /// A missing file yields an empty map, not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or decoded. The caller
    /// logs it and starts with an empty registry.
    pub async fn load(&self) -> Result<HashMap<String, MediaRecord>, SnapshotError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no snapshot file, starting empty");
                return Ok(HashMap::new());
            }
            Err(e) => return Err(e.into()),
        };

        let stored: HashMap<String, StoredRecord> = serde_json::from_slice(&raw)?;
        let now = Utc::now().timestamp();

        let mut upgraded = 0usize;
        let records = stored
            .into_iter()
            .map(|(key, stored)| {
                let (record, legacy) = stored.upgrade(now);
                if legacy {
                    upgraded += 1;
                }
                (key, record)
            })
            .collect::<HashMap<_, _>>();

        if upgraded > 0 {
            info!(upgraded, "upgraded legacy-format records");
        }
        info!(count = records.len(), "snapshot loaded");
        Ok(records)
    }
}
