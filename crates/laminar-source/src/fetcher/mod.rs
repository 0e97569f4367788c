//! # Split fetching
//!
//! Connector I/O runs on fetcher tasks, decoupled from the reader that emits
//! records:
//!
//! ```text
//!  ┌────────────┐  FetchEvent   ┌─────────────────┐
//!  │ fetcher 0  │──────┐        │                 │
//!  │ SplitReader│      ├──────► │ bounded mpsc    │──► SourceReader::poll_next
//!  └────────────┘      │        │ (backpressure)  │
//!  ┌────────────┐      │        └─────────────────┘
//!  │ fetcher 1  │──────┘
//!  └────────────┘
//!        ▲ FetcherCommand (add / remove / pause / event) + Notify wakeup
//!        └──────────── SplitFetcherManager (reader task)
//! ```
//!
//! Each fetcher owns a disjoint subset of the reader's splits and a private
//! [`SplitReader`]. The queue is the only flow control: a full queue blocks
//! the fetcher in `send().await`.

pub mod manager;
pub mod split_fetcher;

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::{Result, SourceError};
use crate::event::SourceEvent;
use crate::split::{SourceSplit, SplitId};

pub use manager::SplitFetcherManager;
pub use split_fetcher::{FetcherCommand, FetcherHandle};

/// Records of one `fetch()` call, grouped by split, plus the splits that
/// reached their end during the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordsBySplits<R> {
    records: Vec<(SplitId, Vec<R>)>,
    finished: BTreeSet<SplitId>,
}

impl<R> Default for RecordsBySplits<R> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            finished: BTreeSet::new(),
        }
    }
}

impl<R> RecordsBySplits<R> {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one record of `split`.
    pub fn add(&mut self, split: &SplitId, record: R) {
        match self.records.last_mut() {
            Some((last, records)) if last == split => records.push(record),
            _ => self.records.push((split.clone(), vec![record])),
        }
    }

    /// Appends records of `split`.
    pub fn add_all(&mut self, split: &SplitId, records: impl IntoIterator<Item = R>) {
        for record in records {
            self.add(split, record);
        }
    }

    /// Marks `split` as finished. Its records in this batch are still emitted.
    pub fn finish(&mut self, split: SplitId) {
        self.finished.insert(split);
    }

    /// Builder-style [`RecordsBySplits::finish`].
    #[must_use]
    pub fn with_finished(mut self, split: SplitId) -> Self {
        self.finish(split);
        self
    }

    /// `true` if the batch carries neither records nor finished splits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.iter().all(|(_, r)| r.is_empty()) && self.finished.is_empty()
    }

    /// Number of records in the batch.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.iter().map(|(_, r)| r.len()).sum()
    }

    /// Splits finished in this batch.
    #[must_use]
    pub fn finished_splits(&self) -> &BTreeSet<SplitId> {
        &self.finished
    }

    /// Decomposes the batch.
    #[must_use]
    pub fn into_parts(self) -> (Vec<(SplitId, Vec<R>)>, BTreeSet<SplitId>) {
        (self.records, self.finished)
    }
}

/// A change of the split set owned by one fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitsChange<S> {
    /// Start reading these splits.
    Add(Vec<S>),
    /// Stop reading these splits.
    Remove(Vec<SplitId>),
}

/// Connector-specific reader of one or more splits. Owned by exactly one
/// fetcher task.
#[async_trait]
pub trait SplitReader: Send + 'static {
    /// Split type read by this reader.
    type Split: SourceSplit;
    /// Raw record type handed to the record emitter.
    type Record: Send + 'static;

    /// Fetches the next records of the owned splits.
    ///
    /// Must be cancel-safe: the fetcher drops the future when it is woken for
    /// a split change or shut down, and calls `fetch` again later. An empty
    /// batch means "nothing right now".
    ///
    /// # Errors
    ///
    /// A failing fetch is retried with backoff by the fetcher.
    async fn fetch(&mut self) -> Result<RecordsBySplits<Self::Record>>;

    /// Applies a change of the owned split set.
    ///
    /// # Errors
    ///
    /// An error fails the fetcher (and thereby the reader).
    fn handle_splits_change(&mut self, change: SplitsChange<Self::Split>) -> Result<()>;

    /// Stops or resumes fetching from individual splits.
    fn pause_or_resume_splits(&mut self, _pause: &[SplitId], _resume: &[SplitId]) {}

    /// Receives a connector event forwarded by the reader.
    fn handle_source_event(&mut self, _event: &SourceEvent) {}

    /// Releases resources. Called once when the fetcher stops.
    ///
    /// # Errors
    ///
    /// Errors are logged, not propagated.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Event sent from a fetcher to its reader through the bounded queue.
#[derive(Debug)]
pub enum FetchEvent<R> {
    /// A non-empty batch.
    Records {
        /// Producing fetcher.
        fetcher: u64,
        /// The batch.
        batch: RecordsBySplits<R>,
    },
    /// The fetcher exhausted its retries or failed to apply a split change.
    Failed {
        /// Failed fetcher.
        fetcher: u64,
        /// Final error.
        error: SourceError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_grouped_by_split() {
        let (a, b) = (SplitId::new("a"), SplitId::new("b"));
        let mut batch = RecordsBySplits::new();
        batch.add(&a, 1);
        batch.add(&a, 2);
        batch.add(&b, 3);
        batch.add_all(&a, [4, 5]);
        assert_eq!(batch.record_count(), 5);
        let (records, finished) = batch.into_parts();
        assert_eq!(
            records,
            vec![(a.clone(), vec![1, 2]), (b, vec![3]), (a, vec![4, 5])]
        );
        assert!(finished.is_empty());
    }

    #[test]
    fn test_finished_only_batch_is_not_empty() {
        let batch = RecordsBySplits::<u8>::new();
        assert!(batch.is_empty());
        let batch = batch.with_finished(SplitId::new("done"));
        assert!(!batch.is_empty());
        assert_eq!(batch.record_count(), 0);
    }
}
