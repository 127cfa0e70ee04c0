//! # gpsd Client
//!
//! Reads position fixes from a gpsd daemon over its JSON socket protocol.
//!
//! Each poll opens a connection, sends
//! `?WATCH={"enable":true,"json":true}` and reads newline-delimited JSON
//! until a `TPV` report with a 2D or 3D fix arrives. gpsd pushes reports
//! continuously, so a connection held between polls would hand back a
//! stale backlog; the connection is dropped after every poll instead.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::error::{AgentError, Result};

/// Default gpsd port.
pub const DEFAULT_GPSD_PORT: u16 = 2947;

const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true}\n";

const MS_TO_KMH: f64 = 3.6;

/// Quality of a usable fix, from the gpsd `mode` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FixQuality {
    #[serde(rename = "2D")]
    TwoD,
    #[serde(rename = "3D")]
    ThreeD,
    #[serde(rename = "DGPS")]
    Dgps,
}

impl FixQuality {
    /// `None` for modes without a position (0 unknown, 1 no fix).
    pub fn from_mode(mode: u8) -> Option<Self> {
        match mode {
            0 | 1 => None,
            2 => Some(Self::TwoD),
            3 => Some(Self::ThreeD),
            _ => Some(Self::Dgps),
        }
    }
}

impl fmt::Display for FixQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TwoD => "2D",
            Self::ThreeD => "3D",
            Self::Dgps => "DGPS",
        })
    }
}

/// One raw position fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    pub lat: f64,
    pub lon: f64,
    /// Ground speed when the receiver reports it.
    pub speed_kmh: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub fix: FixQuality,
    /// Worse of the longitude and latitude error estimates, in meters.
    pub accuracy_m: Option<f64>,
}

/// Anything that can produce position fixes.
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// Waits for the next fix.
    async fn next_fix(&self) -> Result<PositionSample>;
}

#[derive(Debug, Deserialize)]
struct GpsdReport {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
    /// Meters per second.
    speed: Option<f64>,
    time: Option<DateTime<Utc>>,
    /// Longitude error estimate, meters.
    epx: Option<f64>,
    /// Latitude error estimate, meters.
    epy: Option<f64>,
}

impl GpsdReport {
    fn into_sample(self) -> Option<PositionSample> {
        if self.class != "TPV" {
            return None;
        }
        let fix = FixQuality::from_mode(self.mode)?;
        let accuracy_m = match (self.epx, self.epy) {
            (Some(x), Some(y)) => Some(x.max(y)),
            (x, y) => x.or(y),
        };
        Some(PositionSample {
            lat: self.lat?,
            lon: self.lon?,
            speed_kmh: self.speed.map(|s| s * MS_TO_KMH),
            timestamp: self.time.unwrap_or_else(Utc::now),
            fix,
            accuracy_m,
        })
    }
}

/// gpsd TCP client.
#[derive(Debug, Clone)]
pub struct GpsdClient {
    host: String,
    port: u16,
    fix_timeout: Duration,
}

impl GpsdClient {
    /// Client for the daemon at `host:port`; each poll gives up after `fix_timeout`.
    pub fn new(host: impl Into<String>, port: u16, fix_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            fix_timeout,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn read_fix(&self) -> Result<PositionSample> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| AgentError::Positioning(format!("connect to gpsd at {}: {}", self.address(), e)))?;

        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(WATCH_COMMAND).await?;

        let mut lines = BufReader::new(read_half).lines();
        while let Some(line) = lines.next_line().await? {
            match serde_json::from_str::<GpsdReport>(&line) {
                Ok(report) => {
                    trace!(class = %report.class, mode = report.mode, "gpsd report");
                    if let Some(sample) = report.into_sample() {
                        debug!(
                            lat = sample.lat,
                            lon = sample.lon,
                            speed_kmh = ?sample.speed_kmh,
                            fix = %sample.fix,
                            accuracy_m = ?sample.accuracy_m,
                            "Fix received"
                        );
                        return Ok(sample);
                    }
                }
                Err(e) => debug!(error = %e, "Ignoring unparseable gpsd line"),
            }
        }

        Err(AgentError::Positioning("gpsd closed the connection".to_string()))
    }
}

#[async_trait]
impl PositionSource for GpsdClient {
    async fn next_fix(&self) -> Result<PositionSample> {
        match tokio::time::timeout(self.fix_timeout, self.read_fix()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(address = %self.address(), timeout_ms = self.fix_timeout.as_millis() as u64, "GPS fix timed out");
                Err(AgentError::FixTimeout(self.fix_timeout))
            }
        }
    }
}
