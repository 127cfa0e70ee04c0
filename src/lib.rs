//! # Recon Relay Library
//!
//! Runtime core of a field telemetry agent.
//!
//! This library provides a job scheduler that drives every periodic task,
//! an offline map tile cache with route-ahead prefetching, a retrying
//! record uploader with a durable progress cursor, and an adaptive GPS
//! poller with Kalman smoothing.

pub mod clock;
pub mod config;
pub mod error;
pub mod positioning;
pub mod runtime;
pub mod scheduler;
pub mod sync;
pub mod tiles;
