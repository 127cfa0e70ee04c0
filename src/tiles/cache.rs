//! # Tile Cache
//!
//! Bounded offline cache of map tiles.
//!
//! Tile bytes live in a [`BlobStore`]; what is cached, how big it is and
//! when it was stored lives in an index persisted as JSON next to the
//! tiles. Every index mutation (put, purge, limit enforcement) is a
//! whole-index read-modify-write under one lock, persisted with a
//! write-then-rename so a crash leaves either the old or the new index.
//! A route prefetch merges all of its downloads into the index with a
//! single write.
//!
//! A missing or unreadable index is treated as an empty cache; tiles that
//! are on disk but not indexed are re-adopted the first time they are read.

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::key::{TileKey, TileRange};
use super::store::BlobStore;
use super::transport::TileTransport;
use crate::clock::Clock;
use crate::error::Result;

/// Default number of concurrent downloads during a prefetch.
pub const DEFAULT_PREFETCH_CONCURRENCY: usize = 4;

/// Default upper bound on tiles requested by one prefetch.
pub const DEFAULT_MAX_PREFETCH_TILES: usize = 5000;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// One cached tile. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileCacheEntry {
    pub key: TileKey,
    pub size_bytes: u64,
    pub stored_at: DateTime<Utc>,
    /// Insertion order; breaks ties between equal `stored_at`.
    pub seq: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TileIndex {
    #[serde(default)]
    next_seq: u64,
    /// Keyed by `"{zoom}/{x}/{y}"`.
    #[serde(default)]
    entries: BTreeMap<String, TileCacheEntry>,
}

impl TileIndex {
    /// Returns the entry it replaced, if any.
    fn insert(&mut self, key: TileKey, size_bytes: u64, stored_at: DateTime<Utc>) -> Option<TileCacheEntry> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            key.index_key(),
            TileCacheEntry {
                key,
                size_bytes,
                stored_at,
                seq,
            },
        )
    }

    fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }
}

/// Outcome of a purge or limit-enforcement pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub entries_removed: usize,
    pub bytes_freed: u64,
}

impl fmt::Display for PurgeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "removed {} tiles, freed {} bytes",
            self.entries_removed, self.bytes_freed
        )
    }
}

/// Outcome of a route prefetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    /// Distinct tiles covering the route.
    pub requested: usize,
    pub already_cached: usize,
    pub fetched: usize,
    pub failed: usize,
    /// Tile ranges left out because they would exceed the per-pass cap.
    pub ranges_over_cap: usize,
}

/// Size of the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
}

/// Offline tile cache with age and size budgets.
pub struct TileCache {
    store: Arc<dyn BlobStore>,
    index_path: PathBuf,
    clock: Arc<dyn Clock>,
    index: Mutex<TileIndex>,
    prefetch_concurrency: usize,
    max_prefetch_tiles: usize,
}

impl fmt::Debug for TileCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileCache")
            .field("index_path", &self.index_path)
            .field("prefetch_concurrency", &self.prefetch_concurrency)
            .field("max_prefetch_tiles", &self.max_prefetch_tiles)
            .finish_non_exhaustive()
    }
}

impl TileCache {
    /// Opens the cache, loading the index at `index_path`.
    ///
    /// A missing or corrupt index yields an empty cache; this never fails.
    pub async fn open(
        store: Arc<dyn BlobStore>,
        index_path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let index_path = index_path.into();
        let index = load_index(&index_path).await;
        info!(
            path = %index_path.display(),
            entries = index.entries.len(),
            bytes = index.total_bytes(),
            "Tile cache opened"
        );

        Self {
            store,
            index_path,
            clock,
            index: Mutex::new(index),
            prefetch_concurrency: DEFAULT_PREFETCH_CONCURRENCY,
            max_prefetch_tiles: DEFAULT_MAX_PREFETCH_TILES,
        }
    }

    /// Sets how many tiles a prefetch downloads at once (minimum 1).
    pub fn with_prefetch_concurrency(mut self, concurrency: usize) -> Self {
        self.prefetch_concurrency = concurrency.max(1);
        self
    }

    /// Caps the distinct tiles one prefetch may request (minimum 1).
    pub fn with_max_prefetch_tiles(mut self, max_tiles: usize) -> Self {
        self.max_prefetch_tiles = max_tiles.max(1);
        self
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Returns a cached tile, or `None` if it is not cached.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid tile address or a storage failure.
    pub async fn get(&self, zoom: u8, x: u32, y: u32) -> Result<Option<Bytes>> {
        let key = TileKey::new(zoom, x, y)?;
        self.get_key(&key).await
    }

    /// [`get`](Self::get) by key.
    pub async fn get_key(&self, key: &TileKey) -> Result<Option<Bytes>> {
        let indexed = self.index.lock().await.entries.contains_key(&key.index_key());
        let data = self.store.read(key).await?;

        match (indexed, data) {
            (true, Some(data)) => Ok(Some(data)),
            (true, None) => {
                warn!(tile = %key, "Indexed tile missing from storage, dropping index entry");
                let mut index = self.index.lock().await;
                if index.entries.remove(&key.index_key()).is_some() {
                    self.persist(&index).await?;
                }
                Ok(None)
            }
            (false, Some(data)) => {
                debug!(tile = %key, "Adopting unindexed tile");
                let mut index = self.index.lock().await;
                if !index.entries.contains_key(&key.index_key()) {
                    index.insert(*key, data.len() as u64, self.clock.now());
                    self.persist(&index).await?;
                }
                Ok(Some(data))
            }
            (false, None) => Ok(None),
        }
    }

    /// Stores a tile and records it in the index.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid tile address or a storage failure.
    pub async fn put(&self, zoom: u8, x: u32, y: u32, data: &[u8]) -> Result<()> {
        let key = TileKey::new(zoom, x, y)?;
        self.put_key(&key, data).await
    }

    /// [`put`](Self::put) by key.
    ///
    /// If the index cannot be persisted the in-memory index is left as it
    /// was and the error is returned.
    pub async fn put_key(&self, key: &TileKey, data: &[u8]) -> Result<()> {
        self.store.write(key, data).await?;
        self.index_stored(&[(*key, data.len() as u64)]).await?;

        debug!(tile = %key, bytes = data.len(), "Tile cached");
        Ok(())
    }

    /// Records tiles already written to the blob store, with one index write.
    async fn index_stored(&self, stored: &[(TileKey, u64)]) -> Result<()> {
        let now = self.clock.now();
        let mut index = self.index.lock().await;
        let next_seq = index.next_seq;
        let replaced: Vec<Option<TileCacheEntry>> = stored
            .iter()
            .map(|(key, size)| index.insert(*key, *size, now))
            .collect();

        if let Err(e) = self.persist(&index).await {
            for ((key, _), previous) in stored.iter().zip(replaced).rev() {
                match previous {
                    Some(entry) => index.entries.insert(key.index_key(), entry),
                    None => index.entries.remove(&key.index_key()),
                };
            }
            index.next_seq = next_seq;
            return Err(e);
        }
        Ok(())
    }

    /// Whether a tile is in the index.
    pub async fn contains(&self, key: &TileKey) -> bool {
        self.index.lock().await.entries.contains_key(&key.index_key())
    }

    /// Current entry count and total size.
    pub async fn stats(&self) -> CacheStats {
        let index = self.index.lock().await;
        CacheStats {
            entries: index.entries.len(),
            total_bytes: index.total_bytes(),
        }
    }

    /// Entries ordered oldest first.
    pub async fn entries(&self) -> Vec<TileCacheEntry> {
        let index = self.index.lock().await;
        let mut entries: Vec<TileCacheEntry> = index.entries.values().cloned().collect();
        entries.sort_by_key(|e| (e.stored_at, e.seq));
        entries
    }

    /// Whether the cache has reached either maintenance trigger.
    pub async fn needs_maintenance(&self, trigger_entries: usize, limit_mb: u64) -> bool {
        let stats = self.stats().await;
        stats.entries >= trigger_entries || stats.total_bytes >= limit_mb * BYTES_PER_MB
    }

    /// Deletes every tile stored more than `max_age_days` days ago.
    ///
    /// A tile whose bytes cannot be deleted stays in the index, so the
    /// persisted index always matches the tiles that survived the pass.
    ///
    /// # Errors
    ///
    /// Returns an error only if the updated index cannot be persisted.
    pub async fn purge_older_than(&self, max_age_days: u32) -> Result<PurgeReport> {
        let max_age = ChronoDuration::days(i64::from(max_age_days));
        let now = self.clock.now();

        let mut index = self.index.lock().await;
        let expired: Vec<TileCacheEntry> = index
            .entries
            .values()
            .filter(|e| now - e.stored_at > max_age)
            .cloned()
            .collect();

        let mut report = PurgeReport::default();
        for entry in expired {
            match self.store.remove(&entry.key).await {
                Ok(()) => {
                    index.entries.remove(&entry.key.index_key());
                    report.entries_removed += 1;
                    report.bytes_freed += entry.size_bytes;
                }
                Err(e) => warn!(tile = %entry.key, error = %e, "Failed to delete expired tile"),
            }
        }

        if report.entries_removed > 0 {
            self.persist(&index).await?;
            info!(max_age_days, %report, "Purged expired tiles");
        }
        Ok(report)
    }

    /// Evicts oldest tiles until the cache holds at most `limit_mb` MiB.
    ///
    /// # Errors
    ///
    /// Returns an error only if the updated index cannot be persisted.
    pub async fn enforce_byte_limit(&self, limit_mb: u64) -> Result<PurgeReport> {
        self.enforce_limit_bytes(limit_mb.saturating_mul(BYTES_PER_MB)).await
    }

    /// Evicts oldest tiles (insertion order on equal timestamps) until the
    /// cache holds at most `limit_bytes`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the updated index cannot be persisted.
    pub async fn enforce_limit_bytes(&self, limit_bytes: u64) -> Result<PurgeReport> {
        let mut index = self.index.lock().await;
        let mut total = index.total_bytes();
        if total <= limit_bytes {
            return Ok(PurgeReport::default());
        }

        let mut oldest_first: Vec<TileCacheEntry> = index.entries.values().cloned().collect();
        oldest_first.sort_by_key(|e| (e.stored_at, e.seq));

        let mut report = PurgeReport::default();
        for entry in oldest_first {
            if total <= limit_bytes {
                break;
            }
            match self.store.remove(&entry.key).await {
                Ok(()) => {
                    index.entries.remove(&entry.key.index_key());
                    total -= entry.size_bytes;
                    report.entries_removed += 1;
                    report.bytes_freed += entry.size_bytes;
                }
                Err(e) => warn!(tile = %entry.key, error = %e, "Failed to evict tile"),
            }
        }

        if report.entries_removed > 0 {
            self.persist(&index).await?;
        }
        if total > limit_bytes {
            warn!(total, limit_bytes, "Cache still over limit after eviction pass");
        } else {
            info!(limit_bytes, %report, "Enforced cache size limit");
        }
        Ok(report)
    }

    /// Age purge followed by size enforcement.
    pub async fn run_maintenance(&self, max_age_days: u32, limit_mb: u64) -> Result<PurgeReport> {
        let purged = self.purge_older_than(max_age_days).await?;
        let evicted = self.enforce_byte_limit(limit_mb).await?;
        Ok(PurgeReport {
            entries_removed: purged.entries_removed + evicted.entries_removed,
            bytes_freed: purged.bytes_freed + evicted.bytes_freed,
        })
    }

    /// Downloads one tile unless it is already cached.
    ///
    /// Returns `true` if the tile is cached afterwards. Failures are logged,
    /// never returned.
    pub async fn fetch_and_put(&self, key: TileKey, transport: &dyn TileTransport) -> bool {
        if self.contains(&key).await {
            return true;
        }

        let Some(size) = self.download(key, transport).await else {
            return false;
        };
        match self.index_stored(&[(key, size)]).await {
            Ok(()) => true,
            Err(e) => {
                warn!(tile = %key, error = %e, "Failed to index fetched tile");
                false
            }
        }
    }

    /// Fetches one tile into the blob store without indexing it. Returns
    /// its size, or `None` after logging the failure.
    async fn download(&self, key: TileKey, transport: &dyn TileTransport) -> Option<u64> {
        let data = match transport.fetch(&key).await {
            Ok(data) => data,
            Err(e) => {
                warn!(tile = %key, error = %e, "Tile fetch failed");
                return None;
            }
        };
        match self.store.write(&key, &data).await {
            Ok(()) => Some(data.len() as u64),
            Err(e) => {
                warn!(tile = %key, error = %e, "Failed to store fetched tile");
                None
            }
        }
    }

    /// Caches every tile within `buffer_degrees` of any route point, at
    /// every zoom in `zoom_levels`.
    ///
    /// Tiles already cached are not requested again. One tile failing does
    /// not stop the rest. A point whose tile range would push the pass over
    /// the prefetch cap is left out. Downloaded tiles are indexed together
    /// at the end of the pass; if that index write fails they count as
    /// failed, and their blobs are adopted the next time they are read.
    pub async fn prefetch_route(
        &self,
        points: &[(f64, f64)],
        zoom_levels: &[u8],
        buffer_degrees: f64,
        transport: &dyn TileTransport,
    ) -> PrefetchReport {
        let (wanted, ranges_over_cap) =
            route_tiles(points, zoom_levels, buffer_degrees, self.max_prefetch_tiles);
        if ranges_over_cap > 0 {
            warn!(
                ranges_over_cap,
                max_tiles = self.max_prefetch_tiles,
                "Prefetch capped, some route points left out"
            );
        }

        let missing: Vec<TileKey> = {
            let index = self.index.lock().await;
            wanted
                .iter()
                .filter(|k| !index.entries.contains_key(&k.index_key()))
                .copied()
                .collect()
        };

        let mut report = PrefetchReport {
            requested: wanted.len(),
            already_cached: wanted.len() - missing.len(),
            ranges_over_cap,
            ..PrefetchReport::default()
        };

        if missing.is_empty() {
            debug!(tiles = wanted.len(), "Route already cached");
            return report;
        }

        let attempted = missing.len();
        let stored: Vec<(TileKey, u64)> = stream::iter(missing)
            .map(|key| async move { self.download(key, transport).await.map(|size| (key, size)) })
            .buffer_unordered(self.prefetch_concurrency)
            .filter_map(|outcome| async move { outcome })
            .collect()
            .await;

        report.fetched = stored.len();
        if !stored.is_empty() {
            if let Err(e) = self.index_stored(&stored).await {
                warn!(tiles = stored.len(), error = %e, "Failed to index prefetched tiles");
                report.fetched = 0;
            }
        }
        report.failed = attempted - report.fetched;

        info!(
            requested = report.requested,
            cached = report.already_cached,
            fetched = report.fetched,
            failed = report.failed,
            "Route prefetch finished"
        );
        report
    }

    async fn persist(&self, index: &TileIndex) -> Result<()> {
        let json = serde_json::to_vec(index)?;
        if let Some(parent) = self.index_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.index_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.index_path).await?;
        Ok(())
    }
}

/// Distinct tiles around every route point, at most `max_tiles` of them.
/// Also returns how many ranges were left out to respect the cap.
fn route_tiles(
    points: &[(f64, f64)],
    zoom_levels: &[u8],
    buffer_degrees: f64,
    max_tiles: usize,
) -> (BTreeSet<TileKey>, usize) {
    let mut tiles = BTreeSet::new();
    let mut over_cap = 0;
    for &(lat, lon) in points {
        for &zoom in zoom_levels {
            let range = TileRange::covering(
                lat - buffer_degrees,
                lon - buffer_degrees,
                lat + buffer_degrees,
                lon + buffer_degrees,
                zoom,
            );
            match range {
                Ok(range) if tiles.len() as u64 + range.tile_count() > max_tiles as u64 => {
                    debug!(lat, lon, zoom, tiles = range.tile_count(), "Tile range over prefetch cap");
                    over_cap += 1;
                }
                Ok(range) => tiles.extend(range.keys()),
                Err(e) => warn!(lat, lon, zoom, error = %e, "Skipping unprojectable route point"),
            }
        }
    }
    (tiles, over_cap)
}

async fn load_index(path: &Path) -> TileIndex {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return TileIndex::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Tile index unreadable, starting empty");
            return TileIndex::default();
        }
    };

    match serde_json::from_slice::<TileIndex>(&raw) {
        Ok(mut index) => {
            // Guard against a hand-edited index whose counter lags its entries.
            let max_seq = index.entries.values().map(|e| e.seq + 1).max().unwrap_or(0);
            index.next_seq = index.next_seq.max(max_seq);
            index
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Tile index corrupt, starting empty");
            TileIndex::default()
        }
    }
}
