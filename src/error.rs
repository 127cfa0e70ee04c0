//! # Error Types
//!
//! Custom error types for Recon Relay using `thiserror`.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Recon Relay
#[derive(Debug, Error)]
pub enum AgentError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode errors (index, cursors, records, daemon messages)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A job was registered with a zero interval
    #[error("Invalid interval for job '{0}': must be greater than zero")]
    InvalidInterval(String),

    /// Strict cancellation of a job that is not registered
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    /// Malformed time window or geofence
    #[error("Invalid run rule: {0}")]
    InvalidRule(String),

    /// Coordinates or zoom outside the projectable range
    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    /// Tile fetch failure
    #[error("Tile transport error: {0}")]
    Transport(String),

    /// Server answered an upload with a non-success status
    #[error("Upload rejected with HTTP status {0}")]
    UploadRejected(u16),

    /// Upload still failing after the whole retry budget
    #[error("Sync failed after {attempts} attempts: {last_error}")]
    SyncFailed { attempts: u32, last_error: String },

    /// Positioning daemon protocol or connection failure
    #[error("Positioning error: {0}")]
    Positioning(String),

    /// No fix arrived before the caller's deadline
    #[error("No position fix within {0:?}")]
    FixTimeout(Duration),
}

/// Result type alias for Recon Relay
pub type Result<T> = std::result::Result<T, AgentError>;
