//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every field has a default, so a missing section or an empty file yields
//! a runnable configuration (with remote sync disabled).

use serde::de::Error;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AgentError, Result};
use crate::runtime::JOB_NAMES;
use crate::scheduler::{Geofence, ScheduleRules, TimeWindow};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub positioning: PositioningConfig,
    #[serde(default)]
    pub tiles: TilesConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Run rules keyed by job name (`[rules.remote_sync]`).
    #[serde(default)]
    pub rules: BTreeMap<String, RulesConfig>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily log files; empty logs to stdout only.
    #[serde(default)]
    pub log_dir: String,
}

/// Positioning configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PositioningConfig {
    #[serde(default = "default_gpsd_host")]
    pub gpsd_host: String,

    #[serde(default = "default_gpsd_port")]
    pub gpsd_port: u16,

    #[serde(default = "default_base_poll_secs")]
    pub base_poll_secs: u64,

    #[serde(default = "default_max_poll_secs")]
    pub max_poll_secs: u64,

    #[serde(default = "default_movement_threshold_kmh")]
    pub movement_threshold_kmh: f64,

    #[serde(default = "default_fix_timeout_ms")]
    pub fix_timeout_ms: u64,

    #[serde(default = "default_process_noise")]
    pub process_noise: f64,

    #[serde(default = "default_measurement_noise")]
    pub measurement_noise: f64,

    #[serde(default = "default_track_length")]
    pub track_length: usize,
}

/// Tile cache configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TilesConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    #[serde(default = "default_server_url")]
    pub server_url: String,

    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,

    #[serde(default = "default_limit_mb")]
    pub limit_mb: u64,

    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    #[serde(default = "default_prefetch_enabled")]
    pub prefetch_enabled: bool,

    #[serde(default = "default_prefetch_interval_secs")]
    pub prefetch_interval_secs: u64,

    #[serde(default = "default_prefetch_zoom_levels")]
    pub prefetch_zoom_levels: Vec<u8>,

    #[serde(default = "default_buffer_degrees")]
    pub buffer_degrees: f64,

    /// Predicted points appended to the track before prefetching.
    #[serde(default = "default_lookahead")]
    pub lookahead: usize,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Upper bound on tiles requested by one prefetch pass.
    #[serde(default = "default_max_prefetch_tiles")]
    pub max_prefetch_tiles: usize,
}

/// Remote sync configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub endpoint: String,

    /// Bearer token; empty sends no `Authorization` header.
    #[serde(default)]
    pub token: String,

    #[serde(default = "default_record_store")]
    pub record_store: String,

    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    #[serde(default = "default_state_key")]
    pub state_key: String,

    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_sync_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Run rules for one job
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RulesConfig {
    /// `[start, end]` pairs as `"HH:MM"`; a start after the end wraps midnight.
    #[serde(default)]
    pub time_ranges: Vec<[String; 2]>,

    #[serde(default)]
    pub geofences: Vec<GeofenceConfig>,
}

/// Polygon of `[lat, lon]` vertices
#[derive(Debug, Deserialize, Clone)]
pub struct GeofenceConfig {
    pub name: String,
    pub points: Vec<[f64; 2]>,
}

impl RulesConfig {
    /// # Errors
    ///
    /// Returns [`AgentError::InvalidRule`] for an unparseable time or a
    /// degenerate polygon.
    pub fn to_rules(&self) -> Result<ScheduleRules> {
        let time_windows = self
            .time_ranges
            .iter()
            .map(|[start, end]| TimeWindow::parse(start, end))
            .collect::<Result<Vec<_>>>()?;
        let geofences = self
            .geofences
            .iter()
            .map(|fence| {
                Geofence::new(
                    fence.name.clone(),
                    fence.points.iter().map(|[lat, lon]| (*lat, *lon)).collect(),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ScheduleRules {
            time_windows,
            geofences,
        })
    }
}

// Default value functions
fn default_log_level() -> String { "info".to_string() }

fn default_gpsd_host() -> String { "127.0.0.1".to_string() }
fn default_gpsd_port() -> u16 { 2947 }
fn default_base_poll_secs() -> u64 { 1 }
fn default_max_poll_secs() -> u64 { 30 }
fn default_movement_threshold_kmh() -> f64 { 1.0 }
fn default_fix_timeout_ms() -> u64 { 2000 }
fn default_process_noise() -> f64 { 1e-4 }
fn default_measurement_noise() -> f64 { 1e-2 }
fn default_track_length() -> usize { 32 }

fn default_cache_dir() -> String { "./tiles".to_string() }
fn default_server_url() -> String { "https://tile.openstreetmap.org".to_string() }
fn default_max_age_days() -> u32 { 30 }
fn default_limit_mb() -> u64 { 512 }
fn default_maintenance_interval_secs() -> u64 { 3600 }
fn default_prefetch_enabled() -> bool { true }
fn default_prefetch_interval_secs() -> u64 { 300 }
fn default_prefetch_zoom_levels() -> Vec<u8> { vec![15, 16] }
fn default_buffer_degrees() -> f64 { 0.01 }
fn default_lookahead() -> usize { 5 }
fn default_concurrency() -> usize { 4 }
fn default_fetch_timeout_ms() -> u64 { 10000 }
fn default_max_prefetch_tiles() -> usize { 5000 }

fn default_record_store() -> String { "./records.jsonl".to_string() }
fn default_state_dir() -> String { "./state".to_string() }
fn default_state_key() -> String { "records".to_string() }
fn default_sync_interval_secs() -> u64 { 3600 }
fn default_retries() -> u32 { 3 }
fn default_sync_timeout_ms() -> u64 { 5000 }
fn default_retry_delay_ms() -> u64 { 1000 }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: String::new(),
        }
    }
}

impl Default for PositioningConfig {
    fn default() -> Self {
        Self {
            gpsd_host: default_gpsd_host(),
            gpsd_port: default_gpsd_port(),
            base_poll_secs: default_base_poll_secs(),
            max_poll_secs: default_max_poll_secs(),
            movement_threshold_kmh: default_movement_threshold_kmh(),
            fix_timeout_ms: default_fix_timeout_ms(),
            process_noise: default_process_noise(),
            measurement_noise: default_measurement_noise(),
            track_length: default_track_length(),
        }
    }
}

impl Default for TilesConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            server_url: default_server_url(),
            max_age_days: default_max_age_days(),
            limit_mb: default_limit_mb(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            prefetch_enabled: default_prefetch_enabled(),
            prefetch_interval_secs: default_prefetch_interval_secs(),
            prefetch_zoom_levels: default_prefetch_zoom_levels(),
            buffer_degrees: default_buffer_degrees(),
            lookahead: default_lookahead(),
            concurrency: default_concurrency(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            max_prefetch_tiles: default_max_prefetch_tiles(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            token: String::new(),
            record_store: default_record_store(),
            state_dir: default_state_dir(),
            state_key: default_state_key(),
            interval_secs: default_sync_interval_secs(),
            retries: default_retries(),
            timeout_ms: default_sync_timeout_ms(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl TilesConfig {
    /// Path of the persisted tile index.
    pub fn index_path(&self) -> PathBuf {
        Path::new(&self.cache_dir).join("index.json")
    }
}

impl SyncConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn invalid(message: impl std::fmt::Display) -> AgentError {
    AgentError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Run rules for `job`; empty when none are configured.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::InvalidRule`] if the configured rules are malformed.
    pub fn rules_for(&self, job: &str) -> Result<ScheduleRules> {
        self.rules
            .get(job)
            .map_or_else(|| Ok(ScheduleRules::default()), RulesConfig::to_rules)
    }

    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use recon_relay::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns error if parsing or validation fails
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.logging.level.trim().is_empty() {
            return Err(invalid("logging level cannot be empty"));
        }

        // Positioning cadence
        let pos = &self.positioning;
        if pos.gpsd_host.is_empty() {
            return Err(invalid("gpsd_host cannot be empty"));
        }
        if pos.base_poll_secs == 0 {
            return Err(invalid("base_poll_secs must be greater than 0"));
        }
        if pos.base_poll_secs > pos.max_poll_secs {
            return Err(invalid("base_poll_secs must not exceed max_poll_secs"));
        }
        if !(pos.movement_threshold_kmh > 0.0) {
            return Err(invalid("movement_threshold_kmh must be greater than 0"));
        }
        if pos.fix_timeout_ms == 0 || pos.fix_timeout_ms > 60000 {
            return Err(invalid("fix_timeout_ms must be between 1 and 60000"));
        }
        for (name, value) in [
            ("process_noise", pos.process_noise),
            ("measurement_noise", pos.measurement_noise),
        ] {
            if !(value > 0.0) || !value.is_finite() {
                return Err(invalid(format!("{} must be a positive number", name)));
            }
        }
        if pos.track_length < 2 {
            return Err(invalid("track_length must be at least 2"));
        }

        // Tile cache
        let tiles = &self.tiles;
        if tiles.cache_dir.is_empty() {
            return Err(invalid("tiles cache_dir cannot be empty"));
        }
        if tiles.server_url.is_empty() {
            return Err(invalid("tiles server_url cannot be empty"));
        }
        for (name, value) in [
            ("max_age_days", u64::from(tiles.max_age_days)),
            ("limit_mb", tiles.limit_mb),
            ("maintenance_interval_secs", tiles.maintenance_interval_secs),
            ("prefetch_interval_secs", tiles.prefetch_interval_secs),
            ("fetch_timeout_ms", tiles.fetch_timeout_ms),
        ] {
            if value == 0 {
                return Err(invalid(format!("{} must be greater than 0", name)));
            }
        }
        if let Some(zoom) = tiles.prefetch_zoom_levels.iter().find(|z| **z > 19) {
            return Err(invalid(format!("prefetch zoom level {} is out of bounds (must be 0-19)", zoom)));
        }
        if tiles.prefetch_enabled && tiles.prefetch_zoom_levels.is_empty() {
            return Err(invalid("prefetch_zoom_levels cannot be empty when prefetch is enabled"));
        }
        if !(0.0..=1.0).contains(&tiles.buffer_degrees) {
            return Err(invalid("buffer_degrees must be between 0.0 and 1.0"));
        }
        if tiles.concurrency == 0 {
            return Err(invalid("tiles concurrency must be greater than 0"));
        }
        if tiles.max_prefetch_tiles == 0 {
            return Err(invalid("max_prefetch_tiles must be greater than 0"));
        }

        // Remote sync
        let sync = &self.sync;
        if sync.enabled && sync.endpoint.is_empty() {
            return Err(invalid("sync endpoint cannot be empty when enabled"));
        }
        if sync.enabled && sync.record_store.is_empty() {
            return Err(invalid("sync record_store cannot be empty when enabled"));
        }
        if sync.state_key.is_empty() {
            return Err(invalid("sync state_key cannot be empty"));
        }
        if sync.interval_secs == 0 {
            return Err(invalid("sync interval_secs must be greater than 0"));
        }
        if sync.retries > 10 {
            return Err(invalid("sync retries must be between 0 and 10"));
        }
        if sync.timeout_ms == 0 || sync.timeout_ms > 300000 {
            return Err(invalid("sync timeout_ms must be between 1 and 300000"));
        }

        // Run rules
        for (job, rules) in &self.rules {
            if !JOB_NAMES.contains(&job.as_str()) {
                return Err(invalid(format!("rules given for unknown job '{}'", job)));
            }
            rules
                .to_rules()
                .map_err(|e| invalid(format!("rules for '{}': {}", job, e)))?;
        }

        Ok(())
    }
}
