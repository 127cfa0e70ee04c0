//! # Local Record Store
//!
//! Source of the records the sync manager uploads. Each record carries a
//! sequence number assigned on append; sequence numbers start at 1 and
//! only grow, which is what lets a single integer cursor track progress.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

/// One locally captured record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub seq: u64,
    pub payload: serde_json::Value,
}

/// Read side of a local record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Name used for the uploaded file.
    fn name(&self) -> &str;

    /// Records with `seq > after`, ascending.
    async fn load_since(&self, after: u64) -> Result<Vec<Record>>;

    /// Highest sequence number stored, 0 when empty.
    async fn max_seq(&self) -> Result<u64> {
        Ok(self.load_since(0).await?.last().map_or(0, |r| r.seq))
    }

    /// Records whose `seq` falls in `range`, ascending.
    async fn load_range(&self, range: RangeInclusive<u64>) -> Result<Vec<Record>> {
        let mut records = self.load_since(range.start().saturating_sub(1)).await?;
        records.retain(|r| range.contains(&r.seq));
        Ok(records)
    }
}

/// Append-only JSON Lines record store.
///
/// Each line is `{"seq": n, "payload": ...}`. Lines that fail to parse are
/// skipped with a warning rather than failing the whole read.
#[derive(Debug)]
pub struct JsonlRecordStore {
    path: PathBuf,
    name: String,
    append_lock: Mutex<()>,
}

impl JsonlRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "records.jsonl".to_string());
        Self {
            path,
            name,
            append_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a record and returns its sequence number.
    ///
    /// A final line left without its newline by an interrupted write is
    /// terminated first, so the new record always starts on its own line.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or written.
    pub async fn append(&self, payload: serde_json::Value) -> Result<u64> {
        let _guard = self.append_lock.lock().await;

        let seq = self.max_seq().await? + 1;
        let mut line = Vec::new();
        if self.ends_mid_line().await? {
            warn!(store = %self.name, "Terminating torn final line before append");
            line.push(b'\n');
        }
        serde_json::to_writer(&mut line, &Record { seq, payload })?;
        line.push(b'\n');

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        debug!(store = %self.name, seq, "Record appended");
        Ok(seq)
    }

    /// True when the file is non-empty and its last byte is not a newline.
    async fn ends_mid_line(&self) -> Result<bool> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if file.metadata().await?.len() == 0 {
            return Ok(false);
        }
        file.seek(SeekFrom::End(-1)).await?;
        Ok(file.read_u8().await? != b'\n')
    }

    async fn read_all(&self) -> Result<Vec<Record>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Record>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    store = %self.name,
                    line = line_no + 1,
                    error = %e,
                    "Skipping malformed record"
                ),
            }
        }
        records.sort_by_key(|r| r.seq);
        Ok(records)
    }
}

#[async_trait]
impl RecordStore for JsonlRecordStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_since(&self, after: u64) -> Result<Vec<Record>> {
        let mut records = self.read_all().await?;
        records.retain(|r| r.seq > after);
        Ok(records)
    }
}
