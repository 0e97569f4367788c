//! Error types for the source framework.

use crate::split::{ReaderId, SplitId};

/// Errors raised by enumerators, coordinators, readers and fetchers.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// An event or assignment named a reader that never registered.
    #[error("reader {0} is not registered")]
    UnknownReader(ReaderId),

    /// A split was assigned while another reader still owns it.
    #[error("split '{split}' is already owned by reader {owner}")]
    DuplicateAssignment {
        /// The split that was assigned twice.
        split: SplitId,
        /// The reader currently owning the split.
        owner: ReaderId,
    },

    /// Any other violation of the assign/acknowledge protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A checkpoint payload was written by an unknown serializer version.
    #[error("unsupported serializer version {found} (supported: {supported})")]
    UnsupportedVersion {
        /// Version found in the payload.
        found: u32,
        /// Version the serializer understands.
        supported: u32,
    },

    /// A checkpoint payload is truncated or malformed.
    #[error("corrupt checkpoint payload: {0}")]
    CorruptCheckpoint(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A fetcher exhausted its retries.
    #[error("fetch failed on fetcher {fetcher} after {attempts} attempts: {message}")]
    FetchFailed {
        /// Fetcher that gave up.
        fetcher: u64,
        /// Number of attempts made.
        attempts: u32,
        /// Last error reported by the split reader.
        message: String,
    },

    /// Error reported by a connector's split reader.
    #[error("split reader error: {0}")]
    SplitReader(String),

    /// Error reported by an enumerator callback.
    #[error("enumerator error: {0}")]
    Enumerator(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// The coordinator mailbox has shut down.
    #[error("source coordinator is closed")]
    CoordinatorClosed,

    /// The reader (or its task) has shut down.
    #[error("source reader is closed")]
    ReaderClosed,
}

impl SourceError {
    /// Returns `true` for errors that indicate a protocol bug rather than an
    /// environmental failure.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::UnknownReader(_) | Self::DuplicateAssignment { .. } | Self::ProtocolViolation(_)
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = SourceError> = std::result::Result<T, E>;
