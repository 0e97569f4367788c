//! Line-file source configuration.

use std::path::PathBuf;
use std::time::Duration;

use laminar_source::{Boundedness, SourceConfig};

use crate::error::ConnectorError;

/// Configuration of a [`LineFileSource`](super::LineFileSource).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineFileConfig {
    /// Directory scanned for files.
    pub directory: PathBuf,
    /// Bounded sources list the directory once; unbounded ones keep
    /// monitoring it.
    pub boundedness: Boundedness,
    /// Period between directory scans of an unbounded source.
    pub discovery_interval: Duration,
    /// Only files with this extension are read (without the dot).
    pub extension: Option<String>,
    /// Maximum lines returned by one fetch.
    pub max_lines_per_fetch: usize,
}

impl LineFileConfig {
    /// Bounded configuration for `directory` with defaults elsewhere.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            boundedness: Boundedness::Bounded,
            discovery_interval: Duration::from_secs(10),
            extension: None,
            max_lines_per_fetch: 256,
        }
    }

    /// Parses a configuration from properties.
    ///
    /// | key | default |
    /// |-----|---------|
    /// | `path` | required |
    /// | `boundedness` | `bounded` |
    /// | `discovery.interval.ms` | `10000` |
    /// | `file.extension` | none |
    /// | `fetch.max.lines` | `256` |
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::MissingConfig` without `path`, and
    /// `ConnectorError::ConfigurationError` for invalid values.
    pub fn from_config(config: &SourceConfig) -> Result<Self, ConnectorError> {
        let directory = config
            .get("path")
            .ok_or_else(|| ConnectorError::MissingConfig("path".into()))?;
        let mut cfg = Self::new(directory);
        if let Some(boundedness) = config.get_parsed("boundedness")? {
            cfg.boundedness = boundedness;
        }
        if let Some(ms) = config.get_parsed::<u64>("discovery.interval.ms")? {
            cfg.discovery_interval = Duration::from_millis(ms);
        }
        cfg.extension = config
            .get("file.extension")
            .map(|ext| ext.trim_start_matches('.').to_string())
            .filter(|ext| !ext.is_empty());
        if let Some(lines) = config.get_parsed("fetch.max.lines")? {
            cfg.max_lines_per_fetch = lines;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates value ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ConfigurationError` for a zero fetch size or
    /// a zero discovery interval on an unbounded source.
    pub fn validate(&self) -> Result<(), ConnectorError> {
        if self.max_lines_per_fetch == 0 {
            return Err(ConnectorError::ConfigurationError(
                "fetch.max.lines must be at least 1".into(),
            ));
        }
        if !self.boundedness.is_bounded() && self.discovery_interval.is_zero() {
            return Err(ConnectorError::ConfigurationError(
                "discovery.interval.ms must be positive for an unbounded source".into(),
            ));
        }
        Ok(())
    }
}
