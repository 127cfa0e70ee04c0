//! # Smoothing Filter
//!
//! Scalar Kalman filter for one coordinate axis.
//!
//! Each update predicts (`P += q`), computes the gain `K = P / (P + r)`,
//! blends the sample in (`x += K (z - x)`) and shrinks the covariance
//! (`P *= 1 - K`). The first sample is taken as-is so the output never lags
//! at startup.

/// Default process noise `q`.
pub const DEFAULT_PROCESS_NOISE: f64 = 1e-4;

/// Default measurement noise `r`.
pub const DEFAULT_MEASUREMENT_NOISE: f64 = 1e-2;

/// Filter state between samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterState {
    pub estimate: f64,
    pub error_covariance: f64,
}

impl FilterState {
    /// State after one more sample. Pure; does not touch `self`.
    pub fn step(&self, sample: f64, process_noise: f64, measurement_noise: f64) -> FilterState {
        let predicted = self.error_covariance + process_noise;
        let gain = predicted / (predicted + measurement_noise);
        FilterState {
            estimate: self.estimate + gain * (sample - self.estimate),
            error_covariance: (1.0 - gain) * predicted,
        }
    }
}

/// One-dimensional Kalman filter.
#[derive(Debug, Clone, PartialEq)]
pub struct KalmanFilter {
    process_noise: f64,
    measurement_noise: f64,
    state: Option<FilterState>,
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new(DEFAULT_PROCESS_NOISE, DEFAULT_MEASUREMENT_NOISE)
    }
}

impl KalmanFilter {
    pub fn new(process_noise: f64, measurement_noise: f64) -> Self {
        Self {
            process_noise,
            measurement_noise,
            state: None,
        }
    }

    /// Feeds one raw sample and returns the smoothed value.
    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.state {
            None => FilterState {
                estimate: sample,
                error_covariance: 1.0,
            },
            Some(state) => state.step(sample, self.process_noise, self.measurement_noise),
        };
        self.state = Some(next);
        next.estimate
    }

    /// Current estimate, `None` before the first sample.
    pub fn estimate(&self) -> Option<f64> {
        self.state.map(|s| s.estimate)
    }

    pub fn state(&self) -> Option<FilterState> {
        self.state
    }

    /// Forgets all history; the next sample passes through unchanged.
    pub fn reset(&mut self) {
        self.state = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn variance(values: &[f64]) -> f64 {
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
    }

    #[test]
    fn test_first_sample_passes_through() {
        let mut filter = KalmanFilter::default();
        assert_eq!(filter.estimate(), None);
        assert_eq!(filter.update(47.123456), 47.123456);
        assert_eq!(filter.estimate(), Some(47.123456));
    }

    #[test]
    fn test_reduces_variance_of_noisy_constant() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let raw: Vec<f64> = (0..2_000)
            .map(|_| 52.0 + rng.random_range(-0.05..0.05))
            .collect();

        let mut filter = KalmanFilter::default();
        let smoothed: Vec<f64> = raw.iter().map(|&z| filter.update(z)).collect();

        // Skip the warm-up where the filter is still converging
        let raw_var = variance(&raw[100..]);
        let smooth_var = variance(&smoothed[100..]);
        assert!(
            smooth_var < raw_var,
            "smoothed variance {} not below raw {}",
            smooth_var,
            raw_var
        );
    }

    #[test]
    fn test_tracks_constant_input_exactly() {
        let mut filter = KalmanFilter::default();
        for _ in 0..50 {
            assert_eq!(filter.update(-3.5), -3.5);
        }
    }

    #[test]
    fn test_step_is_pure() {
        let state = FilterState {
            estimate: 0.0,
            error_covariance: 1.0,
        };
        let a = state.step(1.0, 1e-4, 1e-2);
        let b = state.step(1.0, 1e-4, 1e-2);
        assert_eq!(a, b);
        assert!(a.estimate > 0.0 && a.estimate < 1.0);
        assert!(a.error_covariance < state.error_covariance);
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut filter = KalmanFilter::new(1e-4, 1e-2);
        filter.update(10.0);
        filter.update(10.5);
        filter.reset();
        assert_eq!(filter.update(99.0), 99.0);
    }
}
