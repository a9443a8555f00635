//! Window operator configuration types.
//!
//! Covers the window specification, slice-cache policy, watermark predictor
//! hyperparameters and the ingestion limits of a [`WindowOperator`].
//!
//! [`WindowOperator`]: crate::operator::WindowOperator

/// Default number of slice-cache entries per worker.
pub const DEFAULT_CACHE_ENTRIES: usize = 64;

/// Maximum number of slice-cache entries per worker.
pub const MAX_CACHE_ENTRIES: usize = 1 << 16;

/// Default number of lock stripes (aggregation) or hash partitions (join) per slice.
pub const DEFAULT_PARTITIONS: usize = 16;

/// Maximum number of lock stripes or hash partitions per slice.
pub const MAX_PARTITIONS: usize = 1024;

/// Default number of worker threads feeding one operator instance.
pub const DEFAULT_WORKER_THREADS: usize = 1;

/// Default bound on buffered out-of-order sequence numbers per origin.
pub const DEFAULT_MAX_PENDING_SEQUENCES: usize = 1 << 16;

/// Default window size (tumbling).
pub const DEFAULT_WINDOW_SIZE: u64 = 1000;

/// Window specification: `size` and `slide` in timestamp units.
///
/// Tumbling windows have `size == slide`. Sliding windows overlap and are
/// partitioned into non-overlapping slices at every window and slide boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    /// Window length.
    pub size: u64,
    /// Distance between consecutive window starts.
    pub slide: u64,
}

impl WindowSpec {
    /// Creates a tumbling window specification.
    #[must_use]
    pub fn tumbling(size: u64) -> Self {
        Self { size, slide: size }
    }

    /// Creates a sliding window specification.
    #[must_use]
    pub fn sliding(size: u64, slide: u64) -> Self {
        Self { size, slide }
    }

    /// Returns `true` if windows do not overlap.
    #[must_use]
    pub fn is_tumbling(&self) -> bool {
        self.size == self.slide
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.size == 0 {
            return Err(ConfigError::invalid("window.size", "must be positive"));
        }
        if self.slide == 0 {
            return Err(ConfigError::invalid("window.slide", "must be positive"));
        }
        if self.slide > self.size {
            return Err(ConfigError::invalid(
                "window.slide",
                format!("slide {} exceeds size {}", self.slide, self.size),
            ));
        }
        Ok(())
    }
}

impl Default for WindowSpec {
    fn default() -> Self {
        Self::tumbling(DEFAULT_WINDOW_SIZE)
    }
}

/// Eviction policy of the slice cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Evict the oldest inserted entry.
    Fifo,
    /// Evict the least recently used entry.
    #[default]
    Lru,
    /// FIFO order, but entries hit since their last pass get moved back to the head once.
    SecondChance,
}

/// Slice-cache settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceCacheConfig {
    /// When `false` every lookup goes to the slice store.
    pub enable_slice_cache: bool,
    /// Eviction policy.
    pub policy: CachePolicy,
    /// Capacity per worker cache; must be positive when enabled.
    pub number_of_entries: usize,
}

impl Default for SliceCacheConfig {
    fn default() -> Self {
        Self {
            enable_slice_cache: true,
            policy: CachePolicy::Lru,
            number_of_entries: DEFAULT_CACHE_ENTRIES,
        }
    }
}

impl SliceCacheConfig {
    /// A configuration with the cache turned off.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enable_slice_cache: false,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.enable_slice_cache
            && (self.number_of_entries == 0 || self.number_of_entries > MAX_CACHE_ENTRIES)
        {
            return Err(ConfigError::invalid(
                "slice_cache.number_of_entries",
                format!(
                    "{} not in 1..={MAX_CACHE_ENTRIES}",
                    self.number_of_entries
                ),
            ));
        }
        Ok(())
    }
}

/// Watermark predictor strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PredictorKind {
    /// Two-state (level, rate) Kalman filter.
    #[default]
    Kalman,
    /// Recursive least squares with exponential forgetting.
    Rls,
    /// Ordinary least squares over a bounded sample window.
    Regression,
    /// No prediction; pre-warming is a no-op.
    Disabled,
}

/// Watermark predictor hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictorConfig {
    /// Strategy.
    pub kind: PredictorKind,
    /// Diagonal of the initial state covariance (Kalman and RLS).
    pub initial_covariance: f64,
    /// Kalman process noise per unit of wall-clock time.
    pub process_noise: f64,
    /// Kalman measurement noise.
    pub measurement_noise: f64,
    /// RLS forgetting factor `lambda` in `(0, 1]`.
    pub forgetting_factor: f64,
    /// Number of samples kept by the regression predictor.
    pub regression_window: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            kind: PredictorKind::Kalman,
            initial_covariance: 1000.0,
            process_noise: 1e-3,
            measurement_noise: 10.0,
            forgetting_factor: 0.99,
            regression_window: 64,
        }
    }
}

impl PredictorConfig {
    /// Creates a configuration for the given strategy with default hyperparameters.
    #[must_use]
    pub fn new(kind: PredictorKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Sets the initial covariance.
    #[must_use]
    pub fn with_initial_covariance(mut self, value: f64) -> Self {
        self.initial_covariance = value;
        self
    }

    /// Sets the Kalman process and measurement noise.
    #[must_use]
    pub fn with_noise(mut self, process: f64, measurement: f64) -> Self {
        self.process_noise = process;
        self.measurement_noise = measurement;
        self
    }

    /// Sets the RLS forgetting factor.
    #[must_use]
    pub fn with_forgetting_factor(mut self, lambda: f64) -> Self {
        self.forgetting_factor = lambda;
        self
    }

    /// Sets the regression sample window.
    #[must_use]
    pub fn with_regression_window(mut self, samples: usize) -> Self {
        self.regression_window = samples;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.initial_covariance.is_finite() && self.initial_covariance > 0.0) {
            return Err(ConfigError::invalid(
                "predictor.initial_covariance",
                "must be finite and positive",
            ));
        }
        if !(self.process_noise.is_finite() && self.process_noise >= 0.0) {
            return Err(ConfigError::invalid(
                "predictor.process_noise",
                "must be finite and non-negative",
            ));
        }
        if !(self.measurement_noise.is_finite() && self.measurement_noise > 0.0) {
            return Err(ConfigError::invalid(
                "predictor.measurement_noise",
                "must be finite and positive",
            ));
        }
        if !(self.forgetting_factor > 0.0 && self.forgetting_factor <= 1.0) {
            return Err(ConfigError::invalid(
                "predictor.forgetting_factor",
                "must be in (0, 1]",
            ));
        }
        if self.regression_window < 2 {
            return Err(ConfigError::invalid(
                "predictor.regression_window",
                "needs at least 2 samples",
            ));
        }
        Ok(())
    }
}

/// What a slice stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SliceKind {
    /// Record counts and per-key partial aggregates.
    #[default]
    Aggregation,
    /// Per-side hash-partitioned tuples for a two-input join.
    Join,
}

/// Configuration of one window operator instance.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowOperatorConfig {
    /// Window specification.
    pub window: WindowSpec,
    /// State kept per slice.
    pub slice_kind: SliceKind,
    /// Lock stripes (aggregation) or hash partitions (join) per slice.
    pub partitions: usize,
    /// Slice-cache settings.
    pub slice_cache: SliceCacheConfig,
    /// Predictor settings.
    pub predictor: PredictorConfig,
    /// Number of worker threads; one slice cache is kept per worker.
    pub worker_threads: usize,
    /// Bound on buffered out-of-order sequence numbers per origin.
    pub max_pending_sequences: usize,
}

impl Default for WindowOperatorConfig {
    fn default() -> Self {
        Self {
            window: WindowSpec::default(),
            slice_kind: SliceKind::Aggregation,
            partitions: DEFAULT_PARTITIONS,
            slice_cache: SliceCacheConfig::default(),
            predictor: PredictorConfig::default(),
            worker_threads: DEFAULT_WORKER_THREADS,
            max_pending_sequences: DEFAULT_MAX_PENDING_SEQUENCES,
        }
    }
}

impl WindowOperatorConfig {
    /// Creates a builder for custom configuration.
    #[must_use]
    pub fn builder() -> WindowOperatorConfigBuilder {
        WindowOperatorConfigBuilder::default()
    }

    /// Checks every field.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.window.validate()?;
        self.slice_cache.validate()?;
        self.predictor.validate()?;
        if self.partitions == 0 || self.partitions > MAX_PARTITIONS {
            return Err(ConfigError::invalid(
                "partitions",
                format!("{} not in 1..={MAX_PARTITIONS}", self.partitions),
            ));
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::invalid("worker_threads", "must be positive"));
        }
        if self.max_pending_sequences == 0 {
            return Err(ConfigError::invalid(
                "max_pending_sequences",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Builder for `WindowOperatorConfig`.
#[derive(Debug, Default)]
pub struct WindowOperatorConfigBuilder {
    window: Option<WindowSpec>,
    slice_kind: Option<SliceKind>,
    partitions: Option<usize>,
    slice_cache: Option<SliceCacheConfig>,
    predictor: Option<PredictorConfig>,
    worker_threads: Option<usize>,
    max_pending_sequences: Option<usize>,
}

impl WindowOperatorConfigBuilder {
    /// Sets the window specification.
    #[must_use]
    pub fn window(mut self, window: WindowSpec) -> Self {
        self.window = Some(window);
        self
    }

    /// Uses tumbling windows of `size`.
    #[must_use]
    pub fn tumbling(self, size: u64) -> Self {
        self.window(WindowSpec::tumbling(size))
    }

    /// Uses sliding windows of `size` advancing by `slide`.
    #[must_use]
    pub fn sliding(self, size: u64, slide: u64) -> Self {
        self.window(WindowSpec::sliding(size, slide))
    }

    /// Sets the slice kind.
    #[must_use]
    pub fn slice_kind(mut self, kind: SliceKind) -> Self {
        self.slice_kind = Some(kind);
        self
    }

    /// Sets the number of stripes or partitions per slice.
    #[must_use]
    pub fn partitions(mut self, partitions: usize) -> Self {
        self.partitions = Some(partitions);
        self
    }

    /// Sets the slice-cache configuration.
    #[must_use]
    pub fn slice_cache(mut self, cache: SliceCacheConfig) -> Self {
        self.slice_cache = Some(cache);
        self
    }

    /// Sets the predictor configuration.
    #[must_use]
    pub fn predictor(mut self, predictor: PredictorConfig) -> Self {
        self.predictor = Some(predictor);
        self
    }

    /// Sets the number of worker threads.
    #[must_use]
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    /// Sets the per-origin sequencer backlog bound.
    #[must_use]
    pub fn max_pending_sequences(mut self, limit: usize) -> Self {
        self.max_pending_sequences = Some(limit);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if any field is out of range.
    pub fn build(self) -> Result<WindowOperatorConfig, ConfigError> {
        let config = WindowOperatorConfig {
            window: self.window.unwrap_or_default(),
            slice_kind: self.slice_kind.unwrap_or_default(),
            partitions: self.partitions.unwrap_or(DEFAULT_PARTITIONS),
            slice_cache: self.slice_cache.unwrap_or_default(),
            predictor: self.predictor.unwrap_or_default(),
            worker_threads: self.worker_threads.unwrap_or(DEFAULT_WORKER_THREADS),
            max_pending_sequences: self
                .max_pending_sequences
                .unwrap_or(DEFAULT_MAX_PENDING_SEQUENCES),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A field holds an unusable value.
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        /// Dotted field path.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    /// Shorthand for [`ConfigError::Invalid`].
    #[must_use]
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = WindowOperatorConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.window.is_tumbling());
        assert_eq!(config.slice_cache.policy, CachePolicy::Lru);
    }

    #[test]
    fn test_builder() {
        let config = WindowOperatorConfig::builder()
            .sliding(100, 25)
            .slice_kind(SliceKind::Join)
            .partitions(8)
            .slice_cache(SliceCacheConfig {
                enable_slice_cache: true,
                policy: CachePolicy::SecondChance,
                number_of_entries: 4,
            })
            .predictor(PredictorConfig::new(PredictorKind::Rls).with_forgetting_factor(0.95))
            .worker_threads(4)
            .max_pending_sequences(128)
            .build()
            .unwrap();

        assert_eq!(config.window, WindowSpec::sliding(100, 25));
        assert!(!config.window.is_tumbling());
        assert_eq!(config.slice_kind, SliceKind::Join);
        assert_eq!(config.partitions, 8);
        assert_eq!(config.slice_cache.number_of_entries, 4);
        assert!((config.predictor.forgetting_factor - 0.95).abs() < f64::EPSILON);
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.max_pending_sequences, 128);
    }

    #[test]
    fn test_window_validation() {
        let err = WindowOperatorConfig::builder().tumbling(0).build().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "window.size", .. }));

        let err = WindowOperatorConfig::builder()
            .sliding(10, 20)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "window.slide", .. }));
    }

    #[test]
    fn test_cache_capacity_validation() {
        let err = WindowOperatorConfig::builder()
            .slice_cache(SliceCacheConfig {
                number_of_entries: 0,
                ..SliceCacheConfig::default()
            })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("number_of_entries"));

        // Capacity is irrelevant once the cache is off.
        let config = WindowOperatorConfig::builder()
            .slice_cache(SliceCacheConfig {
                number_of_entries: 0,
                ..SliceCacheConfig::disabled()
            })
            .build();
        assert!(config.is_ok());
    }

    #[test]
    fn test_predictor_validation() {
        for lambda in [0.0, 1.5, f64::NAN] {
            let err = WindowOperatorConfig::builder()
                .predictor(PredictorConfig::default().with_forgetting_factor(lambda))
                .build()
                .unwrap_err();
            assert!(matches!(
                err,
                ConfigError::Invalid {
                    field: "predictor.forgetting_factor",
                    ..
                }
            ));
        }

        let err = WindowOperatorConfig::builder()
            .predictor(PredictorConfig::default().with_initial_covariance(-1.0))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("initial_covariance"));
    }

    #[test]
    fn test_worker_and_backlog_validation() {
        assert!(WindowOperatorConfig::builder()
            .worker_threads(0)
            .build()
            .is_err());
        assert!(WindowOperatorConfig::builder()
            .max_pending_sequences(0)
            .build()
            .is_err());
        assert!(WindowOperatorConfig::builder().partitions(0).build().is_err());
    }
}
