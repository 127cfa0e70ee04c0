//! # Tiles
//!
//! Offline map tile cache with age and size budgets, plus route-ahead
//! prefetching.
//!
//! This module handles:
//! - Slippy-map tile addressing ([`TileKey`], [`TileRange`])
//! - Tile byte storage ([`BlobStore`], [`FsBlobStore`])
//! - Downloading tiles ([`TileTransport`], [`HttpTileTransport`])
//! - The persisted cache index and its maintenance ([`TileCache`])
//! - Predicting where the device is heading ([`predict_route`])

pub mod cache;
pub mod key;
pub mod route;
pub mod store;
pub mod transport;

pub use cache::{CacheStats, PrefetchReport, PurgeReport, TileCache, TileCacheEntry};
pub use key::{TileKey, TileRange, MAX_ZOOM};
pub use route::{bearing_deg, destination, haversine_m, predict_route};
pub use store::{BlobStore, FsBlobStore};
pub use transport::{HttpTileTransport, TileTransport};
