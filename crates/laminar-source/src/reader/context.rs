//! Reader-side view of the runtime.

use std::sync::Arc;

use crate::error::Result;
use crate::event::{CoordinatorGateway, ReaderRequest, SourceEvent};
use crate::metrics::SourceReaderMetrics;
use crate::split::{ReaderId, ReaderInfo, SplitId};

/// What a [`SourceReader`](super::SourceReader) knows about its surroundings.
#[derive(Clone)]
pub struct ReaderContext {
    info: ReaderInfo,
    parallelism: usize,
    gateway: Arc<dyn CoordinatorGateway>,
    metrics: Arc<SourceReaderMetrics>,
}

impl std::fmt::Debug for ReaderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderContext")
            .field("info", &self.info)
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

impl ReaderContext {
    /// Creates a context for reader `info` out of `parallelism` readers.
    #[must_use]
    pub fn new(info: ReaderInfo, parallelism: usize, gateway: Arc<dyn CoordinatorGateway>) -> Self {
        Self {
            info,
            parallelism,
            gateway,
            metrics: Arc::new(SourceReaderMetrics::new()),
        }
    }

    /// Asks the enumerator for more work.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::CoordinatorClosed` if the coordinator is gone.
    pub fn send_split_request(&self) -> Result<()> {
        tracing::debug!(reader = %self.info.reader_id, "Requesting split");
        self.gateway.send(ReaderRequest::SplitRequest {
            reader: self.info.reader_id,
            location: self.info.location.clone(),
        })
    }

    /// Sends a connector event to the enumerator.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::CoordinatorClosed` if the coordinator is gone.
    pub fn send_source_event_to_coordinator(&self, event: SourceEvent) -> Result<()> {
        self.gateway.send(ReaderRequest::SourceEvent {
            reader: self.info.reader_id,
            event,
        })
    }

    /// Tells the coordinator these splits were read to their end.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::CoordinatorClosed` if the coordinator is gone.
    pub fn send_splits_finished(&self, splits: Vec<SplitId>) -> Result<()> {
        self.gateway.send(ReaderRequest::SplitsFinished {
            reader: self.info.reader_id,
            splits,
        })
    }

    /// Number of parallel readers of this source.
    #[must_use]
    pub fn current_parallelism(&self) -> usize {
        self.parallelism
    }

    /// This reader's subtask index.
    #[must_use]
    pub fn subtask_index(&self) -> ReaderId {
        self.info.reader_id
    }

    /// Registration info of this reader.
    #[must_use]
    pub fn info(&self) -> &ReaderInfo {
        &self.info
    }

    /// Reader metrics.
    #[must_use]
    pub fn metrics(&self) -> &Arc<SourceReaderMetrics> {
        &self.metrics
    }
}
