//! # Split enumeration
//!
//! The coordinator-side half of a source. A [`SplitEnumerator`] discovers
//! splits and decides which reader reads which split. It runs on the
//! coordinator's mailbox task, one callback at a time, and talks to readers
//! only through its [`EnumeratorContext`].
//!
//! Assignment must be deterministic given the order of discovery and reader
//! registration. Blocking discovery goes through
//! [`EnumeratorContext::call_async`].

pub mod context;
pub mod tracker;

use crate::checkpoint::EnumeratorCheckpoint;
use crate::error::Result;
use crate::event::SourceEvent;
use crate::split::{ReaderId, SourceSplit};

pub use context::{EnumeratorContext, RegisteredReaders, SplitsAssignment};
pub use tracker::SplitAssignmentTracker;

/// Discovers splits and assigns them to readers.
///
/// Every callback receives the context mutably; callbacks never run
/// concurrently. An `Err` from any callback fails the coordinator.
pub trait SplitEnumerator: Send + Sized + 'static {
    /// Split type produced.
    type Split: SourceSplit;
    /// Connector-private state carried in checkpoints.
    type State: Clone + Send + 'static;

    /// Called once before any other callback.
    ///
    /// # Errors
    ///
    /// Fails the coordinator.
    fn start(&mut self, ctx: &mut EnumeratorContext<Self>) -> Result<()>;

    /// A reader asks for work.
    ///
    /// # Errors
    ///
    /// Fails the coordinator.
    fn handle_split_request(
        &mut self,
        ctx: &mut EnumeratorContext<Self>,
        reader: ReaderId,
        location: Option<&str>,
    ) -> Result<()>;

    /// Splits of a failed reader come back. They must return to the pending
    /// pool and be assigned again.
    ///
    /// # Errors
    ///
    /// Fails the coordinator.
    fn add_splits_back(
        &mut self,
        ctx: &mut EnumeratorContext<Self>,
        splits: Vec<Self::Split>,
        reader: ReaderId,
    ) -> Result<()>;

    /// A reader registered (first attempt or after a failure).
    ///
    /// # Errors
    ///
    /// Fails the coordinator.
    fn add_reader(&mut self, ctx: &mut EnumeratorContext<Self>, reader: ReaderId) -> Result<()>;

    /// A reader sent a connector event. Ignored by default.
    ///
    /// # Errors
    ///
    /// Fails the coordinator.
    fn handle_source_event(
        &mut self,
        _ctx: &mut EnumeratorContext<Self>,
        reader: ReaderId,
        event: SourceEvent,
    ) -> Result<()> {
        tracing::warn!(
            reader = %reader,
            bytes = event.payload().len(),
            "Enumerator ignores source event"
        );
        Ok(())
    }

    /// Snapshots state and pending splits.
    ///
    /// # Errors
    ///
    /// Fails the coordinator.
    fn snapshot_state(
        &mut self,
        checkpoint_id: u64,
    ) -> Result<EnumeratorCheckpoint<Self::State, Self::Split>>;

    /// Checkpoint `checkpoint_id` is durable.
    fn notify_checkpoint_complete(&mut self, _checkpoint_id: u64) {}

    /// Releases resources on coordinator shutdown.
    ///
    /// # Errors
    ///
    /// Logged by the coordinator.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
