//! # Runtime Composition
//!
//! Wires the agent's components to one [`JobScheduler`].
//!
//! Registered jobs:
//! - `positioning`: polls the GPS; its delay is re-read from the controller
//!   after every tick
//! - `tile_maintenance`: age purge, then size enforcement
//! - `route_prefetch`: caches tiles along the recent and predicted track
//!   (when prefetch is enabled)
//! - `remote_sync`: uploads new records (when sync is enabled)
//!
//! Each job's failures stay in that job's metrics. Any job can be gated
//! by run rules from the `[rules.<job>]` config section; geofences are
//! checked against the latest smoothed position.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Result;
use crate::positioning::{AdaptivePositioning, FilteredPosition, GpsdClient, PositionSource, PositioningSettings};
use crate::scheduler::{job_fn, DispatchMode, JobOptions, JobScheduler, PositionLookup};
use crate::sync::{CursorStore, HttpUploader, JsonlRecordStore, RecordStore, SyncManager, SyncOptions, UploadTransport};
use crate::tiles::{predict_route, BlobStore, FsBlobStore, HttpTileTransport, TileCache, TileTransport};

pub const POSITIONING_JOB: &str = "positioning";
pub const TILE_MAINTENANCE_JOB: &str = "tile_maintenance";
pub const ROUTE_PREFETCH_JOB: &str = "route_prefetch";
pub const REMOTE_SYNC_JOB: &str = "remote_sync";

/// Every job the runtime can register.
pub const JOB_NAMES: [&str; 4] = [POSITIONING_JOB, TILE_MAINTENANCE_JOB, ROUTE_PREFETCH_JOB, REMOTE_SYNC_JOB];

/// External dependencies of a [`Runtime`].
pub struct RuntimeParts {
    pub clock: Arc<dyn Clock>,
    pub position_source: Arc<dyn PositionSource>,
    pub tile_store: Arc<dyn BlobStore>,
    pub tile_transport: Arc<dyn TileTransport>,
    pub record_store: Arc<dyn RecordStore>,
    pub uploader: Arc<dyn UploadTransport>,
}

impl RuntimeParts {
    /// Production dependencies described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Http`](crate::error::AgentError::Http) if an HTTP
    /// client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        let pos = &config.positioning;
        Ok(Self {
            clock: Arc::new(SystemClock),
            position_source: Arc::new(GpsdClient::new(
                pos.gpsd_host.clone(),
                pos.gpsd_port,
                Duration::from_millis(pos.fix_timeout_ms),
            )),
            tile_store: Arc::new(FsBlobStore::new(&config.tiles.cache_dir)),
            tile_transport: Arc::new(HttpTileTransport::new(
                &config.tiles.server_url,
                Duration::from_millis(config.tiles.fetch_timeout_ms),
            )?),
            record_store: Arc::new(JsonlRecordStore::new(&config.sync.record_store)),
            uploader: Arc::new(HttpUploader::new(&config.sync.token)?),
        })
    }
}

/// The running agent.
pub struct Runtime {
    scheduler: JobScheduler,
    cache: Arc<TileCache>,
    positioning: Arc<AdaptivePositioning>,
    sync: Option<Arc<SyncManager>>,
}

impl Runtime {
    /// Builds production components from `config` and starts every job.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if a component cannot be built or a job cannot be
    /// registered.
    pub async fn start(config: &Config) -> Result<Self> {
        Self::start_with(config, RuntimeParts::from_config(config)?).await
    }

    /// Starts every job on the given dependencies.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::InvalidInterval`](crate::error::AgentError::InvalidInterval)
    /// if a configured interval is zero.
    pub async fn start_with(config: &Config, parts: RuntimeParts) -> Result<Self> {
        let scheduler = JobScheduler::new(DispatchMode::AwaitBeforeRearm);

        let cache = Arc::new(
            TileCache::open(parts.tile_store, config.tiles.index_path(), parts.clock)
                .await
                .with_prefetch_concurrency(config.tiles.concurrency)
                .with_max_prefetch_tiles(config.tiles.max_prefetch_tiles),
        );

        let pos = &config.positioning;
        let positioning = Arc::new(AdaptivePositioning::new(
            parts.position_source,
            PositioningSettings {
                base_interval: Duration::from_secs(pos.base_poll_secs),
                max_interval: Duration::from_secs(pos.max_poll_secs),
                movement_threshold_kmh: pos.movement_threshold_kmh,
                process_noise: pos.process_noise,
                measurement_noise: pos.measurement_noise,
                track_length: pos.track_length,
            },
        ));

        let lookup: PositionLookup = {
            let positioning = Arc::clone(&positioning);
            Arc::new(move || positioning.latest().map(|p| (p.lat, p.lon)))
        };
        let options_for = |job: &str, options: JobOptions| -> Result<JobOptions> {
            let rules = config.rules_for(job)?;
            if !rules.is_empty() {
                info!(job, %rules, "Run rules attached");
            }
            Ok(options.with_rules(rules, Arc::clone(&lookup)))
        };

        register_positioning(
            &scheduler,
            &positioning,
            options_for(POSITIONING_JOB, JobOptions::shared(positioning.interval()).serialized())?,
        )?;
        register_tile_maintenance(
            &scheduler,
            &cache,
            config,
            options_for(
                TILE_MAINTENANCE_JOB,
                JobOptions::every(Duration::from_secs(config.tiles.maintenance_interval_secs)).serialized(),
            )?,
        )?;
        if config.tiles.prefetch_enabled {
            register_route_prefetch(
                &scheduler,
                &cache,
                &positioning,
                parts.tile_transport,
                config,
                options_for(
                    ROUTE_PREFETCH_JOB,
                    JobOptions::every(Duration::from_secs(config.tiles.prefetch_interval_secs))
                        .fire_and_continue(),
                )?,
            )?;
        }

        let sync = if config.sync.enabled {
            let manager = Arc::new(SyncManager::new(
                parts.uploader,
                CursorStore::new(&config.sync.state_dir),
                SyncOptions {
                    retries: config.sync.retries,
                    timeout: config.sync.timeout(),
                    retry_delay: config.sync.retry_delay(),
                    row_range: None,
                },
            ));
            register_remote_sync(
                &scheduler,
                &manager,
                parts.record_store,
                config,
                options_for(
                    REMOTE_SYNC_JOB,
                    JobOptions::every(Duration::from_secs(config.sync.interval_secs)).serialized(),
                )?,
            )?;
            Some(manager)
        } else {
            None
        };

        info!(jobs = ?scheduler.job_names(), "Runtime started");
        Ok(Self {
            scheduler,
            cache,
            positioning,
            sync,
        })
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn cache(&self) -> &Arc<TileCache> {
        &self.cache
    }

    pub fn positioning(&self) -> &Arc<AdaptivePositioning> {
        &self.positioning
    }

    pub fn sync_manager(&self) -> Option<&Arc<SyncManager>> {
        self.sync.as_ref()
    }

    /// Live smoothed positions for the dashboard.
    pub fn position_feed(&self) -> watch::Receiver<Option<FilteredPosition>> {
        self.positioning.subscribe()
    }

    /// Stops every job, letting in-flight executions finish.
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
    }
}

fn register_positioning(
    scheduler: &JobScheduler,
    positioning: &Arc<AdaptivePositioning>,
    options: JobOptions,
) -> Result<()> {
    let positioning = Arc::clone(positioning);

    scheduler.schedule_with(
        POSITIONING_JOB,
        job_fn(move || {
            let positioning = Arc::clone(&positioning);
            async move {
                positioning.poll().await?;
                Ok(())
            }
        }),
        options,
    )
}

fn register_tile_maintenance(
    scheduler: &JobScheduler,
    cache: &Arc<TileCache>,
    config: &Config,
    options: JobOptions,
) -> Result<()> {
    let cache = Arc::clone(cache);
    let max_age_days = config.tiles.max_age_days;
    let limit_mb = config.tiles.limit_mb;

    scheduler.schedule_with(
        TILE_MAINTENANCE_JOB,
        job_fn(move || {
            let cache = Arc::clone(&cache);
            async move {
                let report = cache.run_maintenance(max_age_days, limit_mb).await?;
                if report.entries_removed > 0 {
                    info!(%report, "Tile maintenance finished");
                }
                Ok(())
            }
        }),
        options,
    )
}

fn register_route_prefetch(
    scheduler: &JobScheduler,
    cache: &Arc<TileCache>,
    positioning: &Arc<AdaptivePositioning>,
    transport: Arc<dyn TileTransport>,
    config: &Config,
    options: JobOptions,
) -> Result<()> {
    let cache = Arc::clone(cache);
    let positioning = Arc::clone(positioning);
    let zoom_levels: Arc<[u8]> = config.tiles.prefetch_zoom_levels.clone().into();
    let buffer_degrees = config.tiles.buffer_degrees;
    let lookahead = config.tiles.lookahead;

    scheduler.schedule_with(
        ROUTE_PREFETCH_JOB,
        job_fn(move || {
            let cache = Arc::clone(&cache);
            let positioning = Arc::clone(&positioning);
            let transport = Arc::clone(&transport);
            let zoom_levels = Arc::clone(&zoom_levels);
            async move {
                let mut points = positioning.track();
                if points.is_empty() {
                    return Ok(());
                }
                points.extend(predict_route(&points, lookahead));

                let report = cache
                    .prefetch_route(&points, &zoom_levels, buffer_degrees, transport.as_ref())
                    .await;
                if report.failed > 0 {
                    warn!(failed = report.failed, fetched = report.fetched, "Some tiles could not be prefetched");
                }
                Ok(())
            }
        }),
        options,
    )
}

fn register_remote_sync(
    scheduler: &JobScheduler,
    manager: &Arc<SyncManager>,
    store: Arc<dyn RecordStore>,
    config: &Config,
    options: JobOptions,
) -> Result<()> {
    let manager = Arc::clone(manager);
    let endpoint: Arc<str> = config.sync.endpoint.as_str().into();
    let state_key: Arc<str> = config.sync.state_key.as_str().into();

    scheduler.schedule_with(
        REMOTE_SYNC_JOB,
        job_fn(move || {
            let manager = Arc::clone(&manager);
            let store = Arc::clone(&store);
            let endpoint = Arc::clone(&endpoint);
            let state_key = Arc::clone(&state_key);
            async move {
                let sent = manager
                    .sync_new_records(store.as_ref(), &endpoint, &state_key)
                    .await?;
                if sent > 0 {
                    info!(sent, "Remote sync uploaded new records");
                }
                Ok(())
            }
        }),
        options,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::AgentError;
    use crate::positioning::{FixQuality, PositionSample};
    use crate::sync::transport::{MockUploadTransport, UploadReceipt};
    use crate::tiles::store::fakes::MemoryBlobStore;
    use crate::tiles::transport::fakes::FakeTileTransport;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Heads north-east, one fix per call.
    struct MovingSource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl PositionSource for MovingSource {
        async fn next_fix(&self) -> Result<PositionSample> {
            let n = f64::from(self.calls.fetch_add(1, Ordering::SeqCst));
            Ok(PositionSample {
                lat: 47.0 + n * 1e-4,
                lon: 8.0 + n * 1e-4,
                speed_kmh: Some(20.0),
                timestamp: Utc::now(),
                fix: FixQuality::ThreeD,
                accuracy_m: Some(4.0),
            })
        }
    }

    struct FailingSource;

    #[async_trait]
    impl PositionSource for FailingSource {
        async fn next_fix(&self) -> Result<PositionSample> {
            Err(AgentError::FixTimeout(Duration::from_millis(1)))
        }
    }

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.tiles.cache_dir = dir.path().join("tiles").to_string_lossy().into_owned();
        config.tiles.maintenance_interval_secs = 3;
        config.tiles.prefetch_interval_secs = 5;
        config.tiles.prefetch_zoom_levels = vec![10];
        config.tiles.buffer_degrees = 0.0;
        config.tiles.lookahead = 2;
        config.sync.state_dir = dir.path().join("state").to_string_lossy().into_owned();
        config.sync.endpoint = "https://collector.example.org/upload".to_string();
        config.sync.interval_secs = 4;
        config.sync.retry_delay_ms = 10;
        config
    }

    fn parts(
        dir: &TempDir,
        source: Arc<dyn PositionSource>,
        transport: Arc<FakeTileTransport>,
        uploader: MockUploadTransport,
    ) -> RuntimeParts {
        RuntimeParts {
            clock: Arc::new(ManualClock::new(Utc::now())),
            position_source: source,
            tile_store: Arc::new(MemoryBlobStore::new()),
            tile_transport: transport,
            record_store: Arc::new(JsonlRecordStore::new(dir.path().join("records.jsonl"))),
            uploader: Arc::new(uploader),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_registers_core_jobs_only_by_default() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.tiles.prefetch_enabled = false;

        let runtime = Runtime::start_with(
            &config,
            parts(
                &dir,
                Arc::new(FailingSource),
                Arc::new(FakeTileTransport::new(8)),
                MockUploadTransport::new(),
            ),
        )
        .await
        .unwrap();

        assert_eq!(
            runtime.scheduler().job_names(),
            vec![POSITIONING_JOB.to_string(), TILE_MAINTENANCE_JOB.to_string()]
        );
        assert!(runtime.sync_manager().is_none());
        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_jobs_run() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.sync.enabled = true;

        let records = JsonlRecordStore::new(dir.path().join("records.jsonl"));
        for i in 0..3 {
            records.append(json!({ "reading": i })).await.unwrap();
        }

        let mut uploader = MockUploadTransport::new();
        uploader
            .expect_upload()
            .withf(|_, batch| batch.record_count == 3)
            .times(1)
            .returning(|_, _| {
                Ok(UploadReceipt {
                    status: 200,
                    uploaded: Some(3),
                })
            });

        let transport = Arc::new(FakeTileTransport::new(32));
        let runtime = Runtime::start_with(
            &config,
            parts(
                &dir,
                Arc::new(MovingSource {
                    calls: AtomicU32::new(0),
                }),
                transport.clone(),
                uploader,
            ),
        )
        .await
        .unwrap();
        let feed = runtime.position_feed();

        tokio::time::sleep(Duration::from_secs(12)).await;

        let metrics = runtime.scheduler().get_metrics();
        assert_eq!(metrics.len(), 4);
        for name in [POSITIONING_JOB, TILE_MAINTENANCE_JOB, ROUTE_PREFETCH_JOB, REMOTE_SYNC_JOB] {
            assert!(metrics[name].run_count >= 1, "{} never ran", name);
            assert!(metrics[name].last_error.is_none(), "{} failed: {:?}", name, metrics[name].last_error);
        }

        assert!(feed.borrow().is_some());
        assert!(!transport.requested().is_empty());
        assert!(runtime.cache().stats().await.entries > 0);

        let cursor = CursorStore::new(&config.sync.state_dir).load("records").await;
        assert_eq!(cursor.last_synced_seq, 3);

        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_geofenced_sync_waits_for_position() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::from_toml(
            r#"
[[rules.remote_sync.geofences]]
name = "depot"
points = [[10.0, 10.0], [10.0, 10.1], [10.1, 10.1], [10.1, 10.0]]
"#,
        )
        .unwrap();
        let base = test_config(&dir);
        config.tiles = base.tiles;
        config.sync = base.sync;
        config.sync.enabled = true;

        let records = JsonlRecordStore::new(dir.path().join("records.jsonl"));
        records.append(json!({ "reading": 1 })).await.unwrap();

        let mut uploader = MockUploadTransport::new();
        uploader.expect_upload().times(0);

        let runtime = Runtime::start_with(
            &config,
            parts(
                &dir,
                Arc::new(MovingSource {
                    calls: AtomicU32::new(0),
                }),
                Arc::new(FakeTileTransport::new(8)),
                uploader,
            ),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_secs(9)).await;

        let sync = runtime.scheduler().metrics_for(REMOTE_SYNC_JOB).unwrap();
        assert_eq!(sync.run_count, 0);
        assert!(sync.skipped_by_rules >= 2);
        let maintenance = runtime.scheduler().metrics_for(TILE_MAINTENANCE_JOB).unwrap();
        assert_eq!(maintenance.skipped_by_rules, 0);
        assert!(maintenance.run_count >= 1);

        let cursor = CursorStore::new(&config.sync.state_dir).load("records").await;
        assert_eq!(cursor.last_synced_seq, 0);

        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_positioning_failure_is_isolated() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let runtime = Runtime::start_with(
            &config,
            parts(
                &dir,
                Arc::new(FailingSource),
                Arc::new(FakeTileTransport::new(8)),
                MockUploadTransport::new(),
            ),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_secs(7)).await;

        let positioning = runtime.scheduler().metrics_for(POSITIONING_JOB).unwrap();
        assert!(positioning.run_count >= 2);
        assert!(positioning.last_error.unwrap().contains("No position fix"));

        let maintenance = runtime.scheduler().metrics_for(TILE_MAINTENANCE_JOB).unwrap();
        assert!(maintenance.run_count >= 1);
        assert!(maintenance.last_error.is_none());

        runtime.shutdown().await;
    }
}
