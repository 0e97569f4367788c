//! The [`Source`] trait: the factory tying a connector's parts together.
//!
//! A source is created once per job. The coordinator uses it to build (or
//! restore) the single enumerator; every reader uses it to build split
//! readers, a record emitter and the checkpoint serializers.

use std::sync::Arc;

use crate::checkpoint::{EnumeratorCheckpoint, VersionedSerializer};
use crate::config::SourceReaderConfig;
use crate::enumerator::{EnumeratorContext, SplitEnumerator};
use crate::error::Result;
use crate::fetcher::SplitReader;
use crate::reader::{ReaderContext, RecordEmitter, SourceReader};
use crate::split::{Boundedness, SourceSplit};
use crate::watermark::WatermarkStrategy;

/// Mutable progress type of a source's splits.
pub type SplitStateOf<S> = <<S as Source>::Split as SourceSplit>::State;

/// Raw record type fetched by a source's split readers.
pub type RecordOf<S> = <<S as Source>::Reader as SplitReader>::Record;

/// Enumerator checkpoint type of a source.
pub type EnumeratorCheckpointOf<S> = EnumeratorCheckpoint<
    <<S as Source>::Enumerator as SplitEnumerator>::State,
    <S as Source>::Split,
>;

/// A split-based data source.
pub trait Source: Send + Sync + Sized + 'static {
    /// Unit of work.
    type Split: SourceSplit;
    /// Record type emitted downstream.
    type Output: Send + 'static;
    /// Coordinator-side split discovery and assignment.
    type Enumerator: SplitEnumerator<Split = Self::Split>;
    /// Fetcher-side I/O.
    type Reader: SplitReader<Split = Self::Split>;
    /// Reader-side record conversion.
    type Emitter: RecordEmitter<
        <Self::Reader as SplitReader>::Record,
        Self::Output,
        <Self::Split as SourceSplit>::State,
    >;

    /// Whether the source ends.
    fn boundedness(&self) -> Boundedness;

    /// Creates a fresh enumerator.
    ///
    /// # Errors
    ///
    /// Fails coordinator creation.
    fn create_enumerator(&self, ctx: &EnumeratorContext<Self::Enumerator>) -> Result<Self::Enumerator>;

    /// Re-creates an enumerator from a checkpoint.
    ///
    /// # Errors
    ///
    /// Fails coordinator restore.
    fn restore_enumerator(
        &self,
        ctx: &EnumeratorContext<Self::Enumerator>,
        checkpoint: EnumeratorCheckpointOf<Self>,
    ) -> Result<Self::Enumerator>;

    /// Creates a split reader for one fetcher.
    fn create_split_reader(&self) -> Self::Reader;

    /// Creates the record emitter of one reader.
    fn create_record_emitter(&self) -> Self::Emitter;

    /// Serializer for splits in reader checkpoints.
    fn split_serializer(&self) -> Arc<dyn VersionedSerializer<Self::Split>>;

    /// Serializer for enumerator checkpoints.
    fn enumerator_checkpoint_serializer(&self) -> Arc<dyn VersionedSerializer<EnumeratorCheckpointOf<Self>>>;

    /// Creates the reader of one subtask.
    fn create_reader(
        self: Arc<Self>,
        context: ReaderContext,
        config: SourceReaderConfig,
        strategy: WatermarkStrategy<Self::Output>,
    ) -> SourceReader<Self> {
        SourceReader::new(self, context, config, strategy)
    }
}
