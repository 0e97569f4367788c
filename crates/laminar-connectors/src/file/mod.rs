//! Newline-delimited file source.
//!
//! Every file in a directory is one split; its records are lines and its
//! position is the byte offset of the next unread line, so a restored reader
//! continues exactly after the last emitted line.
//!
//! A bounded source lists the directory once. An unbounded source rescans it
//! every `discovery.interval.ms` and picks up files it has not seen before.
//! Files are assumed immutable once they appear.
//!
//! ```text
//! WITH (
//!     'connector' = 'files',
//!     'path' = '/data/incoming',
//!     'boundedness' = 'continuous',
//!     'discovery.interval.ms' = '5000',
//!     'file.extension' = 'jsonl'
//! )
//! ```

pub mod config;
pub mod enumerator;
pub mod reader;
pub mod split;

use std::sync::Arc;

use laminar_source::checkpoint::{JsonSerializer, VersionedSerializer};
use laminar_source::enumerator::EnumeratorContext;
use laminar_source::source::{EnumeratorCheckpointOf, Source};
use laminar_source::{Boundedness, SourceConfig};

use crate::error::ConnectorError;

pub use config::LineFileConfig;
pub use enumerator::{FileEnumerator, FileEnumeratorState};
pub use reader::{LineEmitter, LineRecord, LineSplitReader};
pub use split::{FileSplit, FileSplitState};

/// Source of the lines of the files in a directory.
#[derive(Debug, Clone)]
pub struct LineFileSource {
    config: LineFileConfig,
}

impl LineFileSource {
    /// Creates a source.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ConfigurationError` if the configuration is
    /// invalid.
    pub fn new(config: LineFileConfig) -> Result<Self, ConnectorError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Creates a source from properties (see
    /// [`LineFileConfig::from_config`]).
    ///
    /// # Errors
    ///
    /// Returns configuration errors.
    pub fn from_config(config: &SourceConfig) -> Result<Self, ConnectorError> {
        Self::new(LineFileConfig::from_config(config)?)
    }

    /// Source configuration.
    #[must_use]
    pub fn config(&self) -> &LineFileConfig {
        &self.config
    }
}

impl Source for LineFileSource {
    type Split = FileSplit;
    type Output = String;
    type Enumerator = FileEnumerator;
    type Reader = LineSplitReader;
    type Emitter = LineEmitter;

    fn boundedness(&self) -> Boundedness {
        self.config.boundedness
    }

    fn create_enumerator(
        &self,
        _ctx: &EnumeratorContext<FileEnumerator>,
    ) -> laminar_source::Result<FileEnumerator> {
        Ok(FileEnumerator::new(
            self.config.clone(),
            FileEnumeratorState::default(),
            Vec::new(),
        ))
    }

    fn restore_enumerator(
        &self,
        _ctx: &EnumeratorContext<FileEnumerator>,
        checkpoint: EnumeratorCheckpointOf<Self>,
    ) -> laminar_source::Result<FileEnumerator> {
        Ok(FileEnumerator::new(
            self.config.clone(),
            checkpoint.state,
            checkpoint.pending_splits,
        ))
    }

    fn create_split_reader(&self) -> LineSplitReader {
        LineSplitReader::new(self.config.max_lines_per_fetch)
    }

    fn create_record_emitter(&self) -> LineEmitter {
        LineEmitter
    }

    fn split_serializer(&self) -> Arc<dyn VersionedSerializer<FileSplit>> {
        JsonSerializer::shared(1)
    }

    fn enumerator_checkpoint_serializer(&self) -> Arc<dyn VersionedSerializer<EnumeratorCheckpointOf<Self>>> {
        JsonSerializer::shared(1)
    }
}
