//! Connector error type.

use laminar_source::SourceError;

/// Errors raised while configuring or running a connector.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// A configuration value is invalid.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// A required configuration key is missing.
    #[error("missing required config: {0}")]
    MissingConfig(String),

    /// Reading from the external system failed.
    #[error("read error: {0}")]
    ReadError(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Error raised by the source framework.
    #[error(transparent)]
    Source(#[from] SourceError),
}

impl From<ConnectorError> for SourceError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::ConfigurationError(msg) => SourceError::Config(msg),
            ConnectorError::MissingConfig(key) => {
                SourceError::Config(format!("missing required config: {key}"))
            }
            ConnectorError::ReadError(msg) => SourceError::SplitReader(msg),
            ConnectorError::Io(e) => SourceError::Io(e),
            ConnectorError::Serde(e) => SourceError::Serde(e),
            ConnectorError::Source(e) => e,
        }
    }
}
