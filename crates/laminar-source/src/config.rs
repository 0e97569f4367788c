//! Configuration for readers, fetchers, watermarks and the coordinator.
//!
//! Structured configs implement `Default` and can be built from a flat
//! [`SourceConfig`] property map (the `WITH (...)` options of a source
//! definition). Unknown keys are ignored for forward compatibility.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::SourceError;

/// Flat string property map for a source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceConfig {
    connector: String,
    properties: HashMap<String, String>,
}

impl SourceConfig {
    /// Creates an empty property map for the given connector type.
    #[must_use]
    pub fn new(connector: impl Into<String>) -> Self {
        Self {
            connector: connector.into(),
            properties: HashMap::new(),
        }
    }

    /// Connector type name.
    #[must_use]
    pub fn connector(&self) -> &str {
        &self.connector
    }

    /// Sets a property, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Builder-style [`SourceConfig::set`].
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Raw property value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Parses a property value.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Config` if the value is present but unparseable.
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>, SourceError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|e| {
                    SourceError::Config(format!("invalid value '{raw}' for '{key}': {e}"))
                })
            })
            .transpose()
    }

    /// Returns a property that must be present.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Config` if the key is missing.
    pub fn require(&self, key: &str) -> Result<&str, SourceError> {
        self.get(key).ok_or_else(|| {
            SourceError::Config(format!(
                "connector '{}' requires property '{key}'",
                self.connector
            ))
        })
    }

    fn get_millis(&self, key: &str) -> Result<Option<Duration>, SourceError> {
        Ok(self.get_parsed::<u64>(key)?.map(Duration::from_millis))
    }
}

/// How splits are distributed over fetcher tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetcherMode {
    /// One fetcher reads all splits of the reader.
    #[default]
    Single,
    /// One fetcher per split.
    PerSplit,
    /// A fixed pool of fetchers; splits go to the least loaded one.
    Pool,
}

str_enum!(FetcherMode, lowercase_udash, "invalid fetcher mode",
    Single => "single";
    PerSplit => "per-split", "split";
    Pool => "pool"
);

/// Configuration of a [`SourceReader`](crate::reader::SourceReader) and its fetchers.
#[derive(Debug, Clone)]
pub struct SourceReaderConfig {
    /// Capacity (in fetched batches) of the queue between fetchers and the reader.
    ///
    /// Fetchers block when the queue is full; this is the only flow control
    /// between fetch I/O and downstream processing.
    pub queue_capacity: usize,
    /// Fetcher-to-split assignment policy.
    pub fetcher_mode: FetcherMode,
    /// Maximum fetchers when `fetcher_mode` is [`FetcherMode::Pool`].
    pub fetcher_pool_size: usize,
    /// Retries of a failing `fetch()` before the reader fails.
    pub fetch_max_retries: u32,
    /// Initial retry backoff, doubled on every consecutive failure.
    pub fetch_retry_backoff: Duration,
    /// Upper bound of the retry backoff.
    pub fetch_retry_max_backoff: Duration,
    /// Pause after a fetch that returned no records and finished no split.
    pub empty_fetch_interval: Duration,
    /// How long a fetcher without splits is kept alive.
    pub fetcher_idle_timeout: Duration,
    /// Bound on how long `close()` waits for fetchers to stop.
    pub shutdown_timeout: Duration,
    /// Whether the reader requests a split on start and after each finished split.
    pub request_splits: bool,
}

impl Default for SourceReaderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            fetcher_mode: FetcherMode::Single,
            fetcher_pool_size: 4,
            fetch_max_retries: 3,
            fetch_retry_backoff: Duration::from_millis(100),
            fetch_retry_max_backoff: Duration::from_secs(10),
            empty_fetch_interval: Duration::from_millis(10),
            fetcher_idle_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
            request_splits: true,
        }
    }
}

impl SourceReaderConfig {
    /// Builds a reader config from a flat property map.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Config` if a value cannot be parsed or is out of range.
    pub fn from_config(config: &SourceConfig) -> Result<Self, SourceError> {
        let defaults = Self::default();
        let parsed = Self {
            queue_capacity: config
                .get_parsed("reader.queue.capacity")?
                .unwrap_or(defaults.queue_capacity),
            fetcher_mode: config
                .get_parsed("fetcher.mode")?
                .unwrap_or(defaults.fetcher_mode),
            fetcher_pool_size: config
                .get_parsed("fetcher.pool.size")?
                .unwrap_or(defaults.fetcher_pool_size),
            fetch_max_retries: config
                .get_parsed("fetch.max.retries")?
                .unwrap_or(defaults.fetch_max_retries),
            fetch_retry_backoff: config
                .get_millis("fetch.retry.backoff.ms")?
                .unwrap_or(defaults.fetch_retry_backoff),
            fetch_retry_max_backoff: config
                .get_millis("fetch.retry.max.backoff.ms")?
                .unwrap_or(defaults.fetch_retry_max_backoff),
            empty_fetch_interval: config
                .get_millis("fetch.empty.interval.ms")?
                .unwrap_or(defaults.empty_fetch_interval),
            fetcher_idle_timeout: config
                .get_millis("fetcher.idle.timeout.ms")?
                .unwrap_or(defaults.fetcher_idle_timeout),
            shutdown_timeout: config
                .get_millis("reader.shutdown.timeout.ms")?
                .unwrap_or(defaults.shutdown_timeout),
            request_splits: config
                .get_parsed("reader.request.splits")?
                .unwrap_or(defaults.request_splits),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Config` for a zero queue capacity or pool size.
    pub fn validate(&self) -> Result<(), SourceError> {
        if self.queue_capacity == 0 {
            return Err(SourceError::Config(
                "reader.queue.capacity must be at least 1".into(),
            ));
        }
        if self.fetcher_mode == FetcherMode::Pool && self.fetcher_pool_size == 0 {
            return Err(SourceError::Config(
                "fetcher.pool.size must be at least 1 in pool mode".into(),
            ));
        }
        Ok(())
    }
}

/// Watermark emission knobs shared by all splits of a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkSettings {
    /// Interval of periodic watermark emission and idleness checks.
    pub interval: Duration,
    /// A split without watermark progress for this long is idle.
    ///
    /// `None` disables idleness detection.
    pub idle_timeout: Option<Duration>,
    /// Maximum lead of a split's watermark over the merged watermark before
    /// the split is paused. `None` disables alignment.
    pub max_drift: Option<Duration>,
}

impl Default for WatermarkSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            idle_timeout: None,
            max_drift: None,
        }
    }
}

impl WatermarkSettings {
    /// Builds watermark settings from a flat property map.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Config` if a value cannot be parsed.
    pub fn from_config(config: &SourceConfig) -> Result<Self, SourceError> {
        let defaults = Self::default();
        let interval = config
            .get_millis("watermark.interval.ms")?
            .unwrap_or(defaults.interval);
        if interval.is_zero() {
            return Err(SourceError::Config(
                "watermark.interval.ms must be positive".into(),
            ));
        }
        Ok(Self {
            interval,
            idle_timeout: config.get_millis("watermark.idle.timeout.ms")?,
            max_drift: config.get_millis("watermark.alignment.max.drift.ms")?,
        })
    }
}

/// Configuration of a [`SourceCoordinator`](crate::coordinator::SourceCoordinator).
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Number of parallel readers of the source.
    pub parallelism: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { parallelism: 1 }
    }
}

/// Configuration of the in-process [`LocalSourceRuntime`](crate::runtime::LocalSourceRuntime).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of reader tasks.
    pub parallelism: usize,
    /// Per-reader configuration.
    pub reader: SourceReaderConfig,
    /// Capacity of the fan-in output channel shared by all reader tasks.
    pub output_capacity: usize,
    /// Records buffered by a reader task before flushing to the output channel.
    pub flush_batch_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            reader: SourceReaderConfig::default(),
            output_capacity: 1024,
            flush_batch_size: 64,
        }
    }
}

impl RuntimeConfig {
    /// Builder-style parallelism override.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }
}
