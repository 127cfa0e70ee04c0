//! # Adaptive Positioning Controller
//!
//! Polls the position source, smooths each fix, and decides how long to
//! wait before the next poll.
//!
//! While the device is effectively stationary the poll interval doubles up
//! to a ceiling; as soon as it moves again the interval drops back to the
//! base cadence. The decision is written into a [`SharedInterval`] that the
//! scheduler re-reads after every tick.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use super::filter::KalmanFilter;
use super::gpsd::{FixQuality, PositionSample, PositionSource};
use crate::error::Result;
use crate::scheduler::SharedInterval;
use crate::tiles::haversine_m;

/// Computes the next poll interval.
///
/// At or above `movement_threshold_kmh` the interval resets to `base`;
/// below it the current interval doubles, never exceeding `max`.
///
/// # Examples
///
/// ```
/// use recon_relay::positioning::next_interval;
/// use std::time::Duration;
///
/// let base = Duration::from_secs(1);
/// let max = Duration::from_secs(30);
///
/// assert_eq!(next_interval(Duration::from_secs(4), 0.2, base, max, 1.0), Duration::from_secs(8));
/// assert_eq!(next_interval(Duration::from_secs(20), 0.2, base, max, 1.0), max);
/// assert_eq!(next_interval(Duration::from_secs(16), 1.0, base, max, 1.0), base);
/// ```
pub fn next_interval(
    current: Duration,
    observed_speed_kmh: f64,
    base: Duration,
    max: Duration,
    movement_threshold_kmh: f64,
) -> Duration {
    if observed_speed_kmh >= movement_threshold_kmh {
        return base;
    }
    current.saturating_mul(2).max(base).min(max)
}

/// Tuning for [`AdaptivePositioning`].
#[derive(Debug, Clone, PartialEq)]
pub struct PositioningSettings {
    pub base_interval: Duration,
    pub max_interval: Duration,
    pub movement_threshold_kmh: f64,
    pub process_noise: f64,
    pub measurement_noise: f64,
    /// Filtered points kept for route prediction.
    pub track_length: usize,
}

impl Default for PositioningSettings {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            movement_threshold_kmh: 1.0,
            process_noise: super::filter::DEFAULT_PROCESS_NOISE,
            measurement_noise: super::filter::DEFAULT_MEASUREMENT_NOISE,
            track_length: 32,
        }
    }
}

/// Smoothed position published to the dashboard feed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FilteredPosition {
    pub lat: f64,
    pub lon: f64,
    pub raw_lat: f64,
    pub raw_lon: f64,
    pub speed_kmh: f64,
    pub timestamp: DateTime<Utc>,
    pub fix: FixQuality,
    /// Receiver error estimate of the raw fix, meters.
    pub accuracy_m: Option<f64>,
    /// Delay until the next poll.
    #[serde(with = "duration_ms")]
    pub next_poll: Duration,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

struct TrackState {
    lat: KalmanFilter,
    lon: KalmanFilter,
    last: Option<FilteredPosition>,
    track: VecDeque<(f64, f64)>,
}

/// Self-adjusting position poller.
pub struct AdaptivePositioning {
    source: Arc<dyn PositionSource>,
    settings: PositioningSettings,
    interval: SharedInterval,
    state: Mutex<TrackState>,
    feed: watch::Sender<Option<FilteredPosition>>,
}

impl std::fmt::Debug for AdaptivePositioning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptivePositioning")
            .field("settings", &self.settings)
            .field("interval", &self.interval.get())
            .finish_non_exhaustive()
    }
}

impl AdaptivePositioning {
    /// Creates a controller polling `source`, starting at the base interval.
    pub fn new(source: Arc<dyn PositionSource>, settings: PositioningSettings) -> Self {
        let (feed, _) = watch::channel(None);
        Self {
            source,
            interval: SharedInterval::new(settings.base_interval),
            state: Mutex::new(TrackState {
                lat: KalmanFilter::new(settings.process_noise, settings.measurement_noise),
                lon: KalmanFilter::new(settings.process_noise, settings.measurement_noise),
                last: None,
                track: VecDeque::with_capacity(settings.track_length),
            }),
            settings,
            feed,
        }
    }

    /// Handle the scheduler reads the next delay from.
    pub fn interval(&self) -> SharedInterval {
        self.interval.clone()
    }

    /// Subscribes to smoothed positions.
    pub fn subscribe(&self) -> watch::Receiver<Option<FilteredPosition>> {
        self.feed.subscribe()
    }

    pub fn latest(&self) -> Option<FilteredPosition> {
        *self.feed.borrow()
    }

    /// Recent filtered points, oldest first.
    pub fn track(&self) -> Vec<(f64, f64)> {
        self.lock_state().track.iter().copied().collect()
    }

    /// Waits for a fix from the source and ingests it.
    ///
    /// # Errors
    ///
    /// Returns the source's error; the filter and interval are unchanged.
    pub async fn poll(&self) -> Result<FilteredPosition> {
        let sample = self.source.next_fix().await?;
        Ok(self.ingest(sample))
    }

    /// Smooths one fix, updates the poll interval, and publishes the result.
    pub fn ingest(&self, sample: PositionSample) -> FilteredPosition {
        let mut state = self.lock_state();

        let lat = state.lat.update(sample.lat);
        let lon = state.lon.update(sample.lon);

        let speed_kmh = match (sample.speed_kmh, state.last) {
            (Some(reported), _) => reported,
            (None, Some(previous)) => derived_speed_kmh(&previous, (lat, lon), sample.timestamp),
            (None, None) => 0.0,
        };

        let next_poll = next_interval(
            self.interval.get(),
            speed_kmh,
            self.settings.base_interval,
            self.settings.max_interval,
            self.settings.movement_threshold_kmh,
        );
        self.interval.set(next_poll);

        if state.track.len() >= self.settings.track_length {
            state.track.pop_front();
        }
        state.track.push_back((lat, lon));

        let position = FilteredPosition {
            lat,
            lon,
            raw_lat: sample.lat,
            raw_lon: sample.lon,
            speed_kmh,
            timestamp: sample.timestamp,
            fix: sample.fix,
            accuracy_m: sample.accuracy_m,
            next_poll,
        };
        state.last = Some(position);
        drop(state);

        debug!(
            lat,
            lon,
            speed_kmh,
            next_poll_ms = next_poll.as_millis() as u64,
            "Position updated"
        );
        self.feed.send_replace(Some(position));
        position
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TrackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn derived_speed_kmh(previous: &FilteredPosition, current: (f64, f64), at: DateTime<Utc>) -> f64 {
    let elapsed = (at - previous.timestamp).num_milliseconds() as f64 / 1000.0;
    if elapsed <= 0.0 {
        return 0.0;
    }
    haversine_m((previous.lat, previous.lon), current) / elapsed * 3.6
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};

    const BASE: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(30);

    #[test]
    fn test_stationary_doubles_up_to_max() {
        let mut interval = BASE;
        let mut seen = Vec::new();
        for _ in 0..8 {
            interval = next_interval(interval, 0.0, BASE, MAX, 1.0);
            seen.push(interval.as_secs());
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 30, 30, 30, 30]);
    }

    #[test]
    fn test_moving_resets_to_base() {
        assert_eq!(next_interval(Duration::from_secs(30), 12.0, BASE, MAX, 1.0), BASE);
    }

    #[test]
    fn test_threshold_counts_as_moving() {
        assert_eq!(next_interval(Duration::from_secs(8), 1.0, BASE, MAX, 1.0), BASE);
        assert_eq!(
            next_interval(Duration::from_secs(8), 0.999, BASE, MAX, 1.0),
            Duration::from_secs(16)
        );
    }

    #[test]
    fn test_never_below_base() {
        assert_eq!(next_interval(Duration::ZERO, 0.0, BASE, MAX, 1.0), BASE);
    }

    /// Replays a fixed list of fixes.
    struct ScriptedSource {
        fixes: Mutex<VecDeque<PositionSample>>,
    }

    #[async_trait]
    impl PositionSource for ScriptedSource {
        async fn next_fix(&self) -> Result<PositionSample> {
            self.fixes
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(AgentError::FixTimeout(Duration::from_millis(10)))
        }
    }

    fn sample(lat: f64, lon: f64, speed: Option<f64>, secs: i64) -> PositionSample {
        PositionSample {
            lat,
            lon,
            speed_kmh: speed,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
                + ChronoDuration::seconds(secs),
            fix: FixQuality::ThreeD,
            accuracy_m: None,
        }
    }

    fn controller(fixes: Vec<PositionSample>, track_length: usize) -> AdaptivePositioning {
        AdaptivePositioning::new(
            Arc::new(ScriptedSource {
                fixes: Mutex::new(fixes.into()),
            }),
            PositioningSettings {
                track_length,
                ..PositioningSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn test_first_fix_passes_through_and_backs_off() {
        let positioning = controller(vec![sample(48.0, 11.0, None, 0)], 8);
        let mut feed = positioning.subscribe();

        let position = positioning.poll().await.unwrap();
        assert_eq!((position.lat, position.lon), (48.0, 11.0));
        assert_eq!(position.speed_kmh, 0.0);
        assert_eq!(positioning.interval().get(), Duration::from_secs(2));

        assert!(feed.has_changed().unwrap());
        assert_eq!(*feed.borrow_and_update(), Some(position));
    }

    #[tokio::test]
    async fn test_fix_quality_carries_into_position() {
        let fix = PositionSample {
            fix: FixQuality::Dgps,
            accuracy_m: Some(1.8),
            ..sample(48.0, 11.0, None, 0)
        };
        let positioning = controller(vec![fix], 8);

        let position = positioning.poll().await.unwrap();
        assert_eq!(position.fix, FixQuality::Dgps);
        assert_eq!(position.accuracy_m, Some(1.8));

        let json = serde_json::to_value(position).unwrap();
        assert_eq!(json["fix"], "DGPS");
        assert_eq!(json["accuracy_m"], 1.8);
    }

    #[tokio::test]
    async fn test_reported_speed_resets_interval() {
        let positioning = controller(
            vec![
                sample(48.0, 11.0, Some(0.0), 0),
                sample(48.0, 11.0, Some(0.0), 2),
                sample(48.0, 11.0, Some(25.0), 6),
            ],
            8,
        );

        positioning.poll().await.unwrap();
        positioning.poll().await.unwrap();
        assert_eq!(positioning.interval().get(), Duration::from_secs(4));

        positioning.poll().await.unwrap();
        assert_eq!(positioning.interval().get(), BASE);
    }

    #[test]
    fn test_speed_derived_from_motion() {
        let positioning = controller(Vec::new(), 8);
        positioning.ingest(sample(0.0, 0.0, None, 0));
        // About 111 m north in 10 s
        let moved = positioning.ingest(sample(0.001, 0.0, None, 10));

        assert!(moved.speed_kmh > 1.0, "speed {}", moved.speed_kmh);
        assert_eq!(moved.next_poll, BASE);
    }

    #[test]
    fn test_track_is_bounded() {
        let positioning = controller(Vec::new(), 3);
        for i in 0..5 {
            positioning.ingest(sample(10.0 + i as f64 * 1e-4, 20.0, Some(5.0), i));
        }
        let track = positioning.track();
        assert_eq!(track.len(), 3);
        assert!(track[0].0 < track[2].0);
    }

    #[tokio::test]
    async fn test_source_error_leaves_state_untouched() {
        let positioning = controller(Vec::new(), 4);
        assert!(matches!(positioning.poll().await, Err(AgentError::FixTimeout(_))));
        assert_eq!(positioning.interval().get(), BASE);
        assert!(positioning.latest().is_none());
        assert!(positioning.track().is_empty());
    }
}
