//! # Run Rules
//!
//! Conditions checked before every tick of a job. A tick whose rules do
//! not hold is skipped: the body does not run and the run count does not
//! move.

use chrono::{Local, NaiveTime};
use std::fmt;
use std::sync::Arc;

use crate::error::{AgentError, Result};

/// Predicate consulted before each tick.
pub type RuleCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Source of the current position for geofence rules.
pub type PositionLookup = Arc<dyn Fn() -> Option<(f64, f64)> + Send + Sync>;

/// Time-of-day window. A window whose start is after its end wraps
/// around midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Parses `"HH:MM"` or `"HH:MM:SS"` bounds.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::InvalidRule`] if either bound is not a time of day.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        Ok(Self::new(parse_time(start)?, parse_time(end)?))
    }

    /// Inclusive on both ends.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= t && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }
}

fn parse_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| AgentError::InvalidRule(format!("'{}' is not a time of day", s)))
}

/// Named polygon of `(lat, lon)` vertices.
#[derive(Debug, Clone, PartialEq)]
pub struct Geofence {
    pub name: String,
    pub points: Vec<(f64, f64)>,
}

impl Geofence {
    /// # Errors
    ///
    /// Returns [`AgentError::InvalidRule`] if the polygon has fewer than
    /// three vertices.
    pub fn new(name: impl Into<String>, points: Vec<(f64, f64)>) -> Result<Self> {
        let name = name.into();
        if points.len() < 3 {
            return Err(AgentError::InvalidRule(format!(
                "geofence '{}' needs at least 3 points",
                name
            )));
        }
        Ok(Self { name, points })
    }

    /// Even-odd ray cast.
    pub fn contains(&self, (lat, lon): (f64, f64)) -> bool {
        let mut inside = false;
        let mut j = self.points.len() - 1;
        for i in 0..self.points.len() {
            let (yi, xi) = self.points[i];
            let (yj, xj) = self.points[j];
            if (yi > lat) != (yj > lat) && lon < (xj - xi) * (lat - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

/// Time windows and geofences gating a job.
///
/// Empty windows allow any time; empty geofences allow any position. With
/// geofences set, an unknown position blocks the tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleRules {
    pub time_windows: Vec<TimeWindow>,
    pub geofences: Vec<Geofence>,
}

impl ScheduleRules {
    pub fn is_empty(&self) -> bool {
        self.time_windows.is_empty() && self.geofences.is_empty()
    }

    pub fn allows(&self, now: NaiveTime, position: Option<(f64, f64)>) -> bool {
        if !self.time_windows.is_empty() && !self.time_windows.iter().any(|w| w.contains(now)) {
            return false;
        }
        if self.geofences.is_empty() {
            return true;
        }
        match position {
            Some(position) => self.geofences.iter().any(|fence| fence.contains(position)),
            None => false,
        }
    }

    /// Check against local wall-clock time and `position`.
    pub fn into_check(self, position: PositionLookup) -> RuleCheck {
        Arc::new(move || self.allows(Local::now().time(), position()))
    }
}

impl fmt::Display for ScheduleRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} time window(s), {} geofence(s)",
            self.time_windows.len(),
            self.geofences.len()
        )
    }
}
