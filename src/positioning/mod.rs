//! # Positioning Module
//!
//! Turns raw GPS fixes into a smoothed position feed and adapts how often
//! the receiver is polled.
//!
//! This module handles:
//! - Scalar Kalman smoothing per axis ([`KalmanFilter`])
//! - Poll interval policy ([`next_interval`])
//! - The polling controller and its dashboard feed ([`AdaptivePositioning`])
//! - Reading fixes from gpsd ([`GpsdClient`])

pub mod controller;
pub mod filter;
pub mod gpsd;

pub use controller::{next_interval, AdaptivePositioning, FilteredPosition, PositioningSettings};
pub use filter::{FilterState, KalmanFilter};
pub use gpsd::{FixQuality, GpsdClient, PositionSample, PositionSource};
