//! Watermark prediction.
//!
//! Predictors fit a linear model `watermark ≈ f(wall_clock)` to observed
//! samples and extrapolate it. Estimates are advisory: they only decide when
//! speculative work such as slice pre-creation happens, never what is emitted.
//!
//! All predictors are single-threaded (`&mut self` updates). Wrap one in
//! [`SharedPredictor`] to share it across threads.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;

use crate::config::{PredictorConfig, PredictorKind};
use crate::Timestamp;

/// One observation: the watermark seen at a wall-clock instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkSample {
    /// Wall-clock time of the observation.
    pub wall_clock: u64,
    /// Observed watermark.
    pub watermark: Timestamp,
}

impl WatermarkSample {
    /// Creates a sample.
    #[must_use]
    pub fn new(wall_clock: u64, watermark: Timestamp) -> Self {
        Self {
            wall_clock,
            watermark,
        }
    }
}

/// Estimates future watermarks from `(wall_clock, watermark)` samples.
pub trait WatermarkPredictor: Send + fmt::Debug {
    /// Folds samples into the model, in order. O(1) per sample.
    fn update(&mut self, samples: &[WatermarkSample]);

    /// Estimated watermark at `wall_clock`.
    ///
    /// Never below the highest watermark observed so far.
    fn estimated_watermark(&self, wall_clock: u64) -> Timestamp;

    /// Number of samples folded in.
    fn samples_seen(&self) -> u64;
}

#[allow(clippy::cast_precision_loss)]
fn as_f64(value: u64) -> f64 {
    value as f64
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_timestamp(value: f64) -> Timestamp {
    // `as` saturates and maps NaN to 0.
    value as Timestamp
}

/// Anchor that keeps the regression inputs small: time and watermark are
/// measured relative to the first sample.
#[derive(Debug, Clone, Copy)]
struct Origin {
    wall_clock: u64,
    watermark: Timestamp,
}

impl Origin {
    fn x(&self, wall_clock: u64) -> f64 {
        as_f64(wall_clock) - as_f64(self.wall_clock)
    }

    fn y(&self, watermark: Timestamp) -> f64 {
        as_f64(watermark) - as_f64(self.watermark)
    }

    fn value(&self, y: f64) -> Timestamp {
        to_timestamp(as_f64(self.watermark) + y)
    }
}

// ── Kalman ──────────────────────────────────────────────────────────────

/// Two-state Kalman filter over `(level, rate)`.
///
/// Constant-velocity model: between samples the level advances by
/// `rate * dt`, with white-noise acceleration of intensity `process_noise`.
/// Only the level is measured, with variance `measurement_noise`.
#[derive(Debug, Clone)]
pub struct KalmanPredictor {
    level: f64,
    rate: f64,
    covariance: [[f64; 2]; 2],
    initial_covariance: f64,
    process_noise: f64,
    measurement_noise: f64,
    last_wall_clock: u64,
    floor: Timestamp,
    samples: u64,
}

impl KalmanPredictor {
    /// Creates a filter.
    #[must_use]
    pub fn new(initial_covariance: f64, process_noise: f64, measurement_noise: f64) -> Self {
        Self {
            level: 0.0,
            rate: 0.0,
            covariance: [[initial_covariance, 0.0], [0.0, initial_covariance]],
            initial_covariance,
            process_noise,
            measurement_noise,
            last_wall_clock: 0,
            floor: 0,
            samples: 0,
        }
    }

    /// Current rate estimate (watermark units per wall-clock unit).
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn observe(&mut self, sample: WatermarkSample) {
        let z = as_f64(sample.watermark);
        if self.samples == 0 {
            self.level = z;
            self.rate = 0.0;
            self.covariance = [
                [self.initial_covariance, 0.0],
                [0.0, self.initial_covariance],
            ];
            self.last_wall_clock = sample.wall_clock;
            return;
        }

        // Predict.
        let dt = as_f64(sample.wall_clock.saturating_sub(self.last_wall_clock));
        let q = self.process_noise;
        let [[p00, p01], [p10, p11]] = self.covariance;
        let level = self.level + self.rate * dt;
        let p00 = p00 + dt * (p10 + p01) + dt * dt * p11 + q * dt * dt * dt / 3.0;
        let p01 = p01 + dt * p11 + q * dt * dt / 2.0;
        let p10 = p10 + dt * p11 + q * dt * dt / 2.0;
        let p11 = p11 + q * dt;

        // Correct.
        let innovation = z - level;
        let s = p00 + self.measurement_noise;
        let (k0, k1) = (p00 / s, p10 / s);
        self.level = level + k0 * innovation;
        self.rate += k1 * innovation;
        self.covariance = [
            [(1.0 - k0) * p00, (1.0 - k0) * p01],
            [p10 - k1 * p00, p11 - k1 * p01],
        ];
        self.last_wall_clock = self.last_wall_clock.max(sample.wall_clock);
    }
}

impl WatermarkPredictor for KalmanPredictor {
    fn update(&mut self, samples: &[WatermarkSample]) {
        for &sample in samples {
            self.observe(sample);
            self.floor = self.floor.max(sample.watermark);
            self.samples += 1;
        }
    }

    fn estimated_watermark(&self, wall_clock: u64) -> Timestamp {
        if self.samples == 0 {
            return self.floor;
        }
        let dt = as_f64(wall_clock.saturating_sub(self.last_wall_clock));
        to_timestamp(self.level + self.rate * dt).max(self.floor)
    }

    fn samples_seen(&self) -> u64 {
        self.samples
    }
}

// ── Recursive least squares ─────────────────────────────────────────────

/// Recursive least squares over `watermark = slope * t + intercept` with
/// exponential forgetting factor `lambda`.
#[derive(Debug, Clone)]
pub struct RlsPredictor {
    theta: [f64; 2],
    covariance: [[f64; 2]; 2],
    lambda: f64,
    anchor: Option<Origin>,
    floor: Timestamp,
    samples: u64,
}

impl RlsPredictor {
    /// Creates a filter with `P = initial_covariance * I`.
    #[must_use]
    pub fn new(initial_covariance: f64, lambda: f64) -> Self {
        Self {
            theta: [0.0, 0.0],
            covariance: [[initial_covariance, 0.0], [0.0, initial_covariance]],
            lambda,
            anchor: None,
            floor: 0,
            samples: 0,
        }
    }

    /// Current slope estimate.
    #[must_use]
    pub fn slope(&self) -> f64 {
        self.theta[0]
    }

    fn observe(&mut self, anchor: Origin, sample: WatermarkSample) {
        let x = anchor.x(sample.wall_clock);
        let y = anchor.y(sample.watermark);
        let p = self.covariance;

        // phi = [x, 1]
        let p_phi = [p[0][0] * x + p[0][1], p[1][0] * x + p[1][1]];
        let denominator = self.lambda + x * p_phi[0] + p_phi[1];
        let gain = [p_phi[0] / denominator, p_phi[1] / denominator];
        let error = y - (self.theta[0] * x + self.theta[1]);
        self.theta[0] += gain[0] * error;
        self.theta[1] += gain[1] * error;

        let phi_p = [x * p[0][0] + p[1][0], x * p[0][1] + p[1][1]];
        for (i, row) in self.covariance.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (p[i][j] - gain[i] * phi_p[j]) / self.lambda;
            }
        }
    }
}

impl WatermarkPredictor for RlsPredictor {
    fn update(&mut self, samples: &[WatermarkSample]) {
        for &sample in samples {
            let anchor = *self.anchor.get_or_insert(Origin {
                wall_clock: sample.wall_clock,
                watermark: sample.watermark,
            });
            self.observe(anchor, sample);
            self.floor = self.floor.max(sample.watermark);
            self.samples += 1;
        }
    }

    fn estimated_watermark(&self, wall_clock: u64) -> Timestamp {
        let Some(anchor) = self.anchor else {
            return self.floor;
        };
        let x = anchor.x(wall_clock);
        anchor
            .value(self.theta[0] * x + self.theta[1])
            .max(self.floor)
    }

    fn samples_seen(&self) -> u64 {
        self.samples
    }
}

// ── Sliding-window regression ───────────────────────────────────────────

/// Ordinary least squares over the most recent `window` samples.
///
/// Keeps running sums so adding and expiring a sample are both O(1).
#[derive(Debug, Clone)]
pub struct RegressionPredictor {
    window: usize,
    points: VecDeque<(f64, f64)>,
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_xy: f64,
    anchor: Option<Origin>,
    floor: Timestamp,
    samples: u64,
}

impl RegressionPredictor {
    /// Creates a predictor over the last `window` samples.
    #[must_use]
    pub fn new(window: usize) -> Self {
        let window = window.max(2);
        Self {
            window,
            points: VecDeque::with_capacity(window),
            sum_x: 0.0,
            sum_y: 0.0,
            sum_xx: 0.0,
            sum_xy: 0.0,
            anchor: None,
            floor: 0,
            samples: 0,
        }
    }

    /// Returns `(slope, intercept)` in anchor-relative coordinates.
    fn fit(&self) -> (f64, f64) {
        let n = as_f64(self.points.len() as u64);
        let mean_y = self.sum_y / n;
        let denominator = n * self.sum_xx - self.sum_x * self.sum_x;
        if denominator.abs() < f64::EPSILON {
            return (0.0, mean_y);
        }
        let slope = (n * self.sum_xy - self.sum_x * self.sum_y) / denominator;
        let intercept = (self.sum_y - slope * self.sum_x) / n;
        (slope, intercept)
    }
}

impl WatermarkPredictor for RegressionPredictor {
    fn update(&mut self, samples: &[WatermarkSample]) {
        for &sample in samples {
            let anchor = *self.anchor.get_or_insert(Origin {
                wall_clock: sample.wall_clock,
                watermark: sample.watermark,
            });
            let (x, y) = (anchor.x(sample.wall_clock), anchor.y(sample.watermark));
            self.points.push_back((x, y));
            self.sum_x += x;
            self.sum_y += y;
            self.sum_xx += x * x;
            self.sum_xy += x * y;
            if self.points.len() > self.window {
                if let Some((ox, oy)) = self.points.pop_front() {
                    self.sum_x -= ox;
                    self.sum_y -= oy;
                    self.sum_xx -= ox * ox;
                    self.sum_xy -= ox * oy;
                }
            }
            self.floor = self.floor.max(sample.watermark);
            self.samples += 1;
        }
    }

    fn estimated_watermark(&self, wall_clock: u64) -> Timestamp {
        let Some(anchor) = self.anchor else {
            return self.floor;
        };
        let (slope, intercept) = self.fit();
        anchor
            .value(slope * anchor.x(wall_clock) + intercept)
            .max(self.floor)
    }

    fn samples_seen(&self) -> u64 {
        self.samples
    }
}

// ── Construction and sharing ────────────────────────────────────────────

/// Builds the configured predictor, or `None` when prediction is disabled.
#[must_use]
pub fn build_predictor(config: &PredictorConfig) -> Option<Box<dyn WatermarkPredictor>> {
    match config.kind {
        PredictorKind::Kalman => Some(Box::new(KalmanPredictor::new(
            config.initial_covariance,
            config.process_noise,
            config.measurement_noise,
        ))),
        PredictorKind::Rls => Some(Box::new(RlsPredictor::new(
            config.initial_covariance,
            config.forgetting_factor,
        ))),
        PredictorKind::Regression => {
            Some(Box::new(RegressionPredictor::new(config.regression_window)))
        }
        PredictorKind::Disabled => None,
    }
}

/// A predictor behind a mutex, safe to update and query from any thread.
#[derive(Debug)]
pub struct SharedPredictor {
    inner: Mutex<Box<dyn WatermarkPredictor>>,
}

impl SharedPredictor {
    /// Wraps a predictor.
    #[must_use]
    pub fn new(predictor: Box<dyn WatermarkPredictor>) -> Self {
        Self {
            inner: Mutex::new(predictor),
        }
    }

    /// See [`WatermarkPredictor::update`].
    pub fn update(&self, samples: &[WatermarkSample]) {
        self.inner.lock().update(samples);
    }

    /// See [`WatermarkPredictor::estimated_watermark`].
    #[must_use]
    pub fn estimated_watermark(&self, wall_clock: u64) -> Timestamp {
        self.inner.lock().estimated_watermark(wall_clock)
    }

    /// See [`WatermarkPredictor::samples_seen`].
    #[must_use]
    pub fn samples_seen(&self) -> u64 {
        self.inner.lock().samples_seen()
    }
}

/// Minimum estimate across predictors that have seen at least one sample.
///
/// Mirrors the global-watermark rule: the slowest origin bounds the estimate.
#[must_use]
pub fn min_estimated_watermark<'a>(
    predictors: impl IntoIterator<Item = &'a SharedPredictor>,
    wall_clock: u64,
) -> Option<Timestamp> {
    predictors
        .into_iter()
        .filter(|p| p.samples_seen() > 0)
        .map(|p| p.estimated_watermark(wall_clock))
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear(slope: u64, offset: u64, walls: impl Iterator<Item = u64>) -> Vec<WatermarkSample> {
        walls
            .map(|w| WatermarkSample::new(w, offset + slope * w))
            .collect()
    }

    fn assert_close(actual: Timestamp, expected: Timestamp, tolerance: Timestamp) {
        assert!(
            actual.abs_diff(expected) <= tolerance,
            "expected {expected} ± {tolerance}, got {actual}"
        );
    }

    fn all_predictors() -> Vec<Box<dyn WatermarkPredictor>> {
        vec![
            Box::new(KalmanPredictor::new(1000.0, 1e-3, 10.0)),
            Box::new(RlsPredictor::new(1000.0, 0.99)),
            Box::new(RegressionPredictor::new(16)),
        ]
    }

    // ==================== Common Behaviour Tests ====================

    #[test]
    fn test_empty_predictor_estimates_zero() {
        for predictor in all_predictors() {
            assert_eq!(predictor.estimated_watermark(1_000), 0);
            assert_eq!(predictor.samples_seen(), 0);
        }
    }

    #[test]
    fn test_linear_extrapolation() {
        let samples = linear(2, 0, (0..=100).step_by(10));
        for mut predictor in all_predictors() {
            predictor.update(&samples);
            assert_eq!(predictor.samples_seen(), 11);
            assert_close(predictor.estimated_watermark(200), 400, 4);
        }
    }

    #[test]
    fn test_large_absolute_timestamps() {
        let base_wall = 1_700_000_000_000;
        let base_wm = 1_699_999_990_000;
        let samples: Vec<_> = (0..=1000)
            .step_by(100)
            .map(|d| WatermarkSample::new(base_wall + d, base_wm + 3 * d))
            .collect();
        for mut predictor in all_predictors() {
            predictor.update(&samples);
            assert_close(predictor.estimated_watermark(base_wall + 2000), base_wm + 6000, 60);
        }
    }

    #[test]
    fn test_estimate_never_below_observed() {
        // A decelerating source: the fitted line undershoots the last sample.
        let samples = vec![
            WatermarkSample::new(0, 0),
            WatermarkSample::new(10, 100),
            WatermarkSample::new(20, 110),
            WatermarkSample::new(30, 112),
        ];
        for mut predictor in all_predictors() {
            predictor.update(&samples);
            assert!(predictor.estimated_watermark(0) >= 112);
        }
    }

    #[test]
    fn test_single_sample_is_flat() {
        for mut predictor in all_predictors() {
            predictor.update(&[WatermarkSample::new(5, 50)]);
            assert_eq!(predictor.estimated_watermark(1_000), 50);
        }
    }

    // ==================== Strategy-Specific Tests ====================

    #[test]
    fn test_kalman_learns_rate() {
        let mut kalman = KalmanPredictor::new(1000.0, 1e-3, 10.0);
        kalman.update(&linear(5, 0, (0..=500).step_by(25)));
        assert!((kalman.rate() - 5.0).abs() < 0.1, "rate {}", kalman.rate());
    }

    #[test]
    fn test_rls_forgets_old_regime() {
        let mut rls = RlsPredictor::new(1000.0, 0.7);
        rls.update(&linear(1, 0, (0..=100).step_by(10)));
        // Rate jumps from 1 to 4 at wall 100.
        let fast: Vec<_> = (110..=500)
            .step_by(10)
            .map(|w| WatermarkSample::new(w, 100 + 4 * (w - 100)))
            .collect();
        rls.update(&fast);
        assert!((rls.slope() - 4.0).abs() < 0.2, "slope {}", rls.slope());
    }

    #[test]
    fn test_regression_window_expires_samples() {
        let mut regression = RegressionPredictor::new(4);
        regression.update(&linear(1, 0, (0..=100).step_by(10)));
        let fast: Vec<_> = (110..=140)
            .step_by(10)
            .map(|w| WatermarkSample::new(w, 100 + 10 * (w - 100)))
            .collect();
        regression.update(&fast);
        // Only the last four samples (slope 10) remain.
        assert_close(regression.estimated_watermark(150), 600, 1);
    }

    // ==================== Sharing Tests ====================

    #[test]
    fn test_build_predictor() {
        for kind in [
            PredictorKind::Kalman,
            PredictorKind::Rls,
            PredictorKind::Regression,
        ] {
            assert!(build_predictor(&PredictorConfig::new(kind)).is_some());
        }
        assert!(build_predictor(&PredictorConfig::new(PredictorKind::Disabled)).is_none());
    }

    #[test]
    fn test_min_estimate_across_origins() {
        let fast = SharedPredictor::new(Box::new(RegressionPredictor::new(8)));
        let slow = SharedPredictor::new(Box::new(RegressionPredictor::new(8)));
        let idle = SharedPredictor::new(Box::new(RegressionPredictor::new(8)));
        fast.update(&linear(4, 0, (0..=40).step_by(10)));
        slow.update(&linear(1, 0, (0..=40).step_by(10)));

        let estimate = min_estimated_watermark([&fast, &slow, &idle], 100);
        assert_close(estimate.unwrap_or_default(), 100, 1);
        assert_eq!(min_estimated_watermark([&idle], 100), None);
    }

    #[test]
    fn test_shared_predictor_across_threads() {
        let shared = std::sync::Arc::new(SharedPredictor::new(Box::new(
            KalmanPredictor::new(1000.0, 1e-3, 10.0),
        )));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let shared = std::sync::Arc::clone(&shared);
                std::thread::spawn(move || {
                    shared.update(&[WatermarkSample::new(t, t)]);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(shared.samples_seen(), 4);
    }
}
