//! # Sync Cursors
//!
//! Durable record of how far each record source has been uploaded.
//!
//! All cursors live in one JSON object `{ state_key: last_synced_seq }`
//! stored at `{state_dir}/sync_cursors.json`. Writes go to a temp file that
//! is renamed over the original, so a crash leaves the previous cursor
//! value intact. An unreadable file counts as every cursor being zero,
//! which re-uploads rather than skips.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

/// File name of the cursor map inside the state directory.
pub const CURSOR_FILE: &str = "sync_cursors.json";

/// Upload progress of one record source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub key: String,
    pub last_synced_seq: u64,
}

/// Persisted map of sync cursors.
#[derive(Debug)]
pub struct CursorStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CursorStore {
    /// Cursor store inside `state_dir`.
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(CURSOR_FILE),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cursor for `key`; zero if it has never advanced.
    pub async fn load(&self, key: &str) -> SyncCursor {
        let last_synced_seq = self.read_map().await.get(key).copied().unwrap_or(0);
        SyncCursor {
            key: key.to_string(),
            last_synced_seq,
        }
    }

    /// Moves the cursor for `key` forward to `seq`.
    ///
    /// Never moves a cursor backwards; returns the value now stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor file cannot be written.
    pub async fn advance(&self, key: &str, seq: u64) -> Result<u64> {
        let _guard = self.write_lock.lock().await;

        let mut cursors = self.read_map().await;
        let current = cursors.get(key).copied().unwrap_or(0);
        if seq <= current {
            return Ok(current);
        }
        cursors.insert(key.to_string(), seq);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&cursors)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(key, from = current, to = seq, "Sync cursor advanced");
        Ok(seq)
    }

    /// Every stored cursor.
    pub async fn all(&self) -> Vec<SyncCursor> {
        self.read_map()
            .await
            .into_iter()
            .map(|(key, last_synced_seq)| SyncCursor {
                key,
                last_synced_seq,
            })
            .collect()
    }

    async fn read_map(&self) -> BTreeMap<String, u64> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cursor file unreadable, using zero cursors");
                return BTreeMap::new();
            }
        };

        serde_json::from_slice(&raw).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "Cursor file corrupt, using zero cursors");
            BTreeMap::new()
        })
    }
}
