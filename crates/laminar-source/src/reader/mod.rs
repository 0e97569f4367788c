//! # Source reader
//!
//! The per-subtask half of a source. A [`SourceReader`] owns a set of splits,
//! hands them to fetcher tasks, and turns fetched raw records into output on
//! its owning task through the source's [`RecordEmitter`].
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──start()──► Started ──record──► Running ⇄ Idle ──► Finished
//! ```
//!
//! `poll_next` never blocks. When it reports
//! [`InputStatus::NothingAvailable`], the owning task awaits
//! [`SourceReader::is_available`] before polling again.
//!
//! Split progress is only mutated here, on the owning task, so
//! [`SourceReader::snapshot_state`] sees exactly the positions of the records
//! emitted so far.

pub mod context;
pub mod emitter;
pub mod output;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::checkpoint::{ReaderCheckpoint, ReaderCheckpointSerializer};
use crate::config::SourceReaderConfig;
use crate::error::{Result, SourceError};
use crate::event::{ReaderControl, SourceEvent};
use crate::fetcher::{FetchEvent, SplitFetcherManager};
use crate::metrics::{now_millis, SourceReaderMetrics};
use crate::source::{RecordOf, Source, SplitStateOf};
use crate::split::{Boundedness, ReaderId, SourceSplit, SplitId, SplitState};
use crate::watermark::{WatermarkOutputMultiplexer, WatermarkStrategy};

pub use context::ReaderContext;
pub use emitter::RecordEmitter;
pub use output::{ReaderOutput, SplitOutput, StreamElement, VecOutput};

use output::MeteredOutput;

/// Reader lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Constructed; may still be restored.
    Created,
    /// Started, nothing emitted yet.
    Started,
    /// Last poll emitted a record.
    Running,
    /// Last poll found nothing to emit.
    Idle,
    /// Bounded input fully consumed.
    Finished,
}

/// Result of one [`SourceReader::poll_next`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputStatus {
    /// A record was processed; poll again.
    Record,
    /// Nothing to emit right now; await `is_available()`.
    NothingAvailable,
    /// All splits are finished and no more will arrive.
    EndOfInput,
}

struct InFlight<R> {
    records: VecDeque<(SplitId, std::vec::IntoIter<R>)>,
    finished: BTreeSet<SplitId>,
}

/// Reader of one source subtask.
pub struct SourceReader<S: Source> {
    context: ReaderContext,
    config: SourceReaderConfig,
    boundedness: Boundedness,
    fetchers: SplitFetcherManager<S::Reader>,
    queue: mpsc::Receiver<FetchEvent<RecordOf<S>>>,
    peeked: Option<FetchEvent<RecordOf<S>>>,
    current: Option<InFlight<RecordOf<S>>>,
    splits: BTreeMap<SplitId, SplitStateOf<S>>,
    emitter: S::Emitter,
    multiplexer: WatermarkOutputMultiplexer,
    strategy: WatermarkStrategy<S::Output>,
    aligned_paused: BTreeSet<SplitId>,
    control_paused: BTreeSet<SplitId>,
    checkpoints: ReaderCheckpointSerializer<S::Split>,
    state: ReaderState,
    no_more_splits: bool,
}

impl<S: Source> std::fmt::Debug for SourceReader<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceReader")
            .field("reader", &self.context.subtask_index())
            .field("state", &self.state)
            .field("splits", &self.splits.len())
            .field("no_more_splits", &self.no_more_splits)
            .finish_non_exhaustive()
    }
}

impl<S: Source> SourceReader<S> {
    /// Creates a reader. Fetchers are spawned lazily once splits arrive.
    pub fn new(
        source: Arc<S>,
        context: ReaderContext,
        config: SourceReaderConfig,
        strategy: WatermarkStrategy<S::Output>,
    ) -> Self {
        let factory_source = Arc::clone(&source);
        let (fetchers, queue) = SplitFetcherManager::new(
            context.subtask_index(),
            move || factory_source.create_split_reader(),
            config.clone(),
        );
        Self {
            boundedness: source.boundedness(),
            emitter: source.create_record_emitter(),
            checkpoints: ReaderCheckpointSerializer::new(source.split_serializer()),
            multiplexer: WatermarkOutputMultiplexer::new(strategy.settings().idle_timeout),
            context,
            config,
            fetchers,
            queue,
            peeked: None,
            current: None,
            splits: BTreeMap::new(),
            strategy,
            aligned_paused: BTreeSet::new(),
            control_paused: BTreeSet::new(),
            state: ReaderState::Created,
            no_more_splits: false,
        }
    }

    /// Starts the reader and, if configured, asks for the first split.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::ProtocolViolation` if already started.
    pub fn start(&mut self) -> Result<()> {
        if self.state != ReaderState::Created {
            return Err(SourceError::ProtocolViolation(format!(
                "reader {} started twice",
                self.reader_id()
            )));
        }
        self.state = ReaderState::Started;
        tracing::info!(
            reader = %self.reader_id(),
            restored_splits = self.splits.len(),
            boundedness = %self.boundedness,
            "Source reader started"
        );
        if self.config.request_splits && self.splits.is_empty() {
            self.request_split();
        }
        Ok(())
    }

    /// Emits at most one record into `output`. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns fetch failures (after retries), emitter errors, and
    /// `SourceError::ProtocolViolation` when polled before `start()`.
    pub fn poll_next(&mut self, output: &mut dyn ReaderOutput<S::Output>) -> Result<InputStatus> {
        match self.state {
            ReaderState::Created => {
                return Err(SourceError::ProtocolViolation(
                    "poll_next called before start".into(),
                ));
            }
            ReaderState::Finished => return Ok(InputStatus::EndOfInput),
            _ => {}
        }

        let now = Instant::now();
        loop {
            if self.emit_next(output, now)? {
                self.state = ReaderState::Running;
                return Ok(InputStatus::Record);
            }
            match self.peeked.take().or_else(|| self.queue.try_recv().ok()) {
                Some(FetchEvent::Records { batch, .. }) => {
                    let (records, finished) = batch.into_parts();
                    self.current = Some(InFlight {
                        records: records
                            .into_iter()
                            .map(|(split, r)| (split, r.into_iter()))
                            .collect(),
                        finished,
                    });
                }
                Some(FetchEvent::Failed { fetcher, error }) => {
                    tracing::error!(reader = %self.reader_id(), fetcher, error = %error, "Fetcher failed");
                    return Err(error);
                }
                None => break,
            }
        }

        self.fetchers.maintain(now);

        if self.is_end_of_input() {
            let metrics = Arc::clone(self.context.metrics());
            let mut out = MeteredOutput {
                inner: output,
                metrics: &metrics,
            };
            self.multiplexer.finish(&mut out);
            self.state = ReaderState::Finished;
            metrics.set_holding_splits(false);
            tracing::info!(reader = %self.reader_id(), "Source reader reached end of input");
            return Ok(InputStatus::EndOfInput);
        }

        if self.splits.is_empty() {
            self.multiplexer.mark_idle(output);
        }
        self.context.metrics().mark_idle_at(now_millis());
        self.state = ReaderState::Idle;
        Ok(InputStatus::NothingAvailable)
    }

    fn is_end_of_input(&self) -> bool {
        self.no_more_splits
            && self.splits.is_empty()
            && self.current.is_none()
            && self.peeked.is_none()
    }

    /// Emits the next buffered record. Returns `false` once the in-flight
    /// batch is exhausted (its finished splits are then retired).
    fn emit_next(&mut self, output: &mut dyn ReaderOutput<S::Output>, now: Instant) -> Result<bool> {
        loop {
            let Some(batch) = self.current.as_mut() else {
                return Ok(false);
            };
            let next = loop {
                let Some((split, records)) = batch.records.front_mut() else {
                    break None;
                };
                match records.next() {
                    Some(record) => break Some((split.clone(), record)),
                    None => {
                        batch.records.pop_front();
                    }
                }
            };

            let Some((split_id, record)) = next else {
                let finished = self
                    .current
                    .take()
                    .map(|b| b.finished)
                    .unwrap_or_default();
                self.retire_splits(&finished, output, now);
                return Ok(false);
            };

            // Records of a split removed while its batch was queued.
            let Some(state) = self.splits.get_mut(&split_id) else {
                continue;
            };

            let metrics = self.context.metrics();
            if self.multiplexer.is_idle() {
                let mut out = MeteredOutput {
                    inner: &mut *output,
                    metrics,
                };
                self.multiplexer.mark_active(&split_id, now, &mut out);
            }
            let mut split_output = SplitOutput {
                split_id: &split_id,
                inner: &mut *output,
                multiplexer: &mut self.multiplexer,
                assigner: self.strategy.assigner().map(|a| &**a),
                metrics,
                now,
            };
            self.emitter.emit_record(record, &mut split_output, state)?;
            refresh_pending(&self.splits, metrics);
            return Ok(true);
        }
    }

    fn retire_splits(
        &mut self,
        finished: &BTreeSet<SplitId>,
        output: &mut dyn ReaderOutput<S::Output>,
        now: Instant,
    ) {
        if finished.is_empty() {
            return;
        }
        let metrics = Arc::clone(self.context.metrics());
        let mut out = MeteredOutput {
            inner: output,
            metrics: &metrics,
        };
        let mut retired = Vec::new();
        for split in finished {
            if self.splits.remove(split).is_some() {
                tracing::debug!(reader = %self.reader_id(), split = %split, "Split finished");
                self.multiplexer.split_finished(split, &mut out);
                self.aligned_paused.remove(split);
                self.control_paused.remove(split);
                retired.push(split.clone());
            }
        }
        self.fetchers.on_splits_finished(finished, now);
        if !retired.is_empty() {
            if let Err(e) = self.context.send_splits_finished(retired) {
                tracing::warn!(reader = %self.reader_id(), error = %e, "Finished splits not reported");
            }
        }
        refresh_pending(&self.splits, &metrics);
        metrics.set_holding_splits(!self.splits.is_empty());

        if self.config.request_splits && !self.no_more_splits {
            for _ in finished {
                self.request_split();
            }
        }
    }

    fn request_split(&self) {
        if let Err(e) = self.context.send_split_request() {
            tracing::warn!(reader = %self.reader_id(), error = %e, "Split request not delivered");
        }
    }

    /// Takes ownership of newly assigned splits.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::ProtocolViolation` if a split is already owned
    /// (or listed twice) or arrives after `notify_no_more_splits`. Nothing is
    /// applied in that case.
    pub fn add_splits(&mut self, splits: Vec<S::Split>) -> Result<()> {
        let mut incoming = BTreeSet::new();
        for split in &splits {
            let id = split.split_id();
            if self.splits.contains_key(id) || !incoming.insert(id.clone()) {
                tracing::warn!(reader = %self.reader_id(), split = %id, "Rejecting duplicate split");
                return Err(SourceError::ProtocolViolation(format!(
                    "reader {} already owns split '{id}'",
                    self.reader_id()
                )));
            }
        }
        if self.no_more_splits && !splits.is_empty() {
            return Err(SourceError::ProtocolViolation(format!(
                "reader {} received splits after no-more-splits",
                self.reader_id()
            )));
        }
        if splits.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        tracing::debug!(reader = %self.reader_id(), count = splits.len(), "Adding splits");
        for split in &splits {
            let id = split.split_id().clone();
            self.multiplexer
                .register_split(id.clone(), self.strategy.create_generator(), now);
            self.splits.insert(id, split.clone().into_state());
        }
        self.fetchers.add_splits(splits);

        let metrics = self.context.metrics();
        metrics.set_holding_splits(true);
        refresh_pending(&self.splits, metrics);
        if self.state == ReaderState::Idle {
            self.state = ReaderState::Running;
        }
        Ok(())
    }

    /// Records that the enumerator will assign nothing more. Idempotent.
    pub fn notify_no_more_splits(&mut self) {
        if !self.no_more_splits {
            tracing::debug!(reader = %self.reader_id(), "No more splits");
            self.no_more_splits = true;
        }
    }

    /// Handles a source event from the enumerator.
    ///
    /// [`ReaderControl`] messages pause or resume splits; everything else is
    /// forwarded to the split readers.
    pub fn handle_source_event(&mut self, event: &SourceEvent) {
        match ReaderControl::from_event(event) {
            Some(ReaderControl::PauseSplits(ids)) => {
                let owned: Vec<SplitId> = ids
                    .into_iter()
                    .filter(|id| self.splits.contains_key(id))
                    .collect();
                self.control_paused.extend(owned.iter().cloned());
                self.fetchers.pause_or_resume(&owned, &[]);
            }
            Some(ReaderControl::ResumeSplits(ids)) => {
                for id in &ids {
                    self.control_paused.remove(id);
                }
                let resumable: Vec<SplitId> = ids
                    .into_iter()
                    .filter(|id| !self.aligned_paused.contains(id))
                    .collect();
                self.fetchers.pause_or_resume(&[], &resumable);
            }
            None => self.fetchers.send_source_event(event),
        }
    }

    /// Periodic hook: periodic watermarks, idleness, alignment, and idle
    /// fetcher shutdown.
    pub fn emit_periodic_watermark(&mut self, now: Instant, output: &mut dyn ReaderOutput<S::Output>) {
        if self.state == ReaderState::Finished {
            return;
        }
        let metrics = Arc::clone(self.context.metrics());
        let mut out = MeteredOutput {
            inner: output,
            metrics: &metrics,
        };
        self.multiplexer.on_periodic_emit(now, &mut out);

        if let Some(max_drift) = self.strategy.settings().max_drift {
            let ahead: BTreeSet<SplitId> = self
                .multiplexer
                .splits_ahead(max_drift)
                .into_iter()
                .collect();
            let pause: Vec<SplitId> = ahead.difference(&self.aligned_paused).cloned().collect();
            let resume: Vec<SplitId> = self
                .aligned_paused
                .difference(&ahead)
                .filter(|id| !self.control_paused.contains(*id))
                .cloned()
                .collect();
            if !pause.is_empty() || !resume.is_empty() {
                tracing::debug!(
                    reader = %self.reader_id(),
                    paused = pause.len(),
                    resumed = resume.len(),
                    "Watermark alignment"
                );
                self.fetchers.pause_or_resume(&pause, &resume);
            }
            self.aligned_paused = ahead;
        }
        self.fetchers.maintain(now);
    }

    /// Completes when `poll_next` would return something other than
    /// [`InputStatus::NothingAvailable`]. Cancel-safe.
    pub async fn is_available(&mut self) {
        if self.current.is_some() || self.peeked.is_some() || self.is_end_of_input() {
            return;
        }
        if self.state == ReaderState::Finished {
            return;
        }
        if let Some(event) = self.queue.recv().await {
            self.peeked = Some(event);
        }
    }

    /// Snapshots every owned split with its current position.
    #[must_use]
    pub fn snapshot_state(&self, checkpoint_id: u64) -> ReaderCheckpoint<S::Split> {
        ReaderCheckpoint {
            checkpoint_id,
            splits: self.splits.values().map(SplitState::to_split).collect(),
        }
    }

    /// Serialized [`SourceReader::snapshot_state`].
    ///
    /// # Errors
    ///
    /// Propagates split serializer errors.
    pub fn snapshot_bytes(&self, checkpoint_id: u64) -> Result<Bytes> {
        let checkpoint = self.snapshot_state(checkpoint_id);
        tracing::debug!(
            reader = %self.reader_id(),
            checkpoint_id,
            splits = checkpoint.splits.len(),
            "Reader snapshot"
        );
        self.checkpoints.encode(&checkpoint)
    }

    /// Restores owned splits from a snapshot. Only valid before `start()`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::ProtocolViolation` after start or for duplicate
    /// splits.
    pub fn restore_state(&mut self, checkpoint: ReaderCheckpoint<S::Split>) -> Result<()> {
        if self.state != ReaderState::Created {
            return Err(SourceError::ProtocolViolation(
                "restore_state called after start".into(),
            ));
        }
        tracing::info!(
            reader = %self.reader_id(),
            checkpoint_id = checkpoint.checkpoint_id,
            splits = checkpoint.splits.len(),
            "Restoring reader"
        );
        self.add_splits(checkpoint.splits)
    }

    /// Decodes and restores a snapshot produced by
    /// [`SourceReader::snapshot_bytes`].
    ///
    /// # Errors
    ///
    /// Returns decode errors and the errors of [`SourceReader::restore_state`].
    pub fn restore_from_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let checkpoint = self.checkpoints.decode(bytes)?;
        self.restore_state(checkpoint)
    }

    /// Checkpoint `checkpoint_id` is durable.
    pub fn notify_checkpoint_complete(&mut self, checkpoint_id: u64) {
        tracing::debug!(reader = %self.reader_id(), checkpoint_id, "Checkpoint complete");
    }

    /// Stops all fetchers, waiting at most the configured shutdown timeout.
    pub async fn close(&mut self) {
        self.fetchers.close(self.config.shutdown_timeout).await;
        self.context.metrics().set_holding_splits(false);
        tracing::info!(reader = %self.reader_id(), "Source reader closed");
    }

    /// Ids of the owned splits, in order.
    #[must_use]
    pub fn owned_split_ids(&self) -> Vec<SplitId> {
        self.splits.keys().cloned().collect()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// This reader's subtask index.
    #[must_use]
    pub fn reader_id(&self) -> ReaderId {
        self.context.subtask_index()
    }

    /// Reader context.
    #[must_use]
    pub fn context(&self) -> &ReaderContext {
        &self.context
    }

    /// Reader metrics.
    #[must_use]
    pub fn metrics(&self) -> &Arc<SourceReaderMetrics> {
        self.context.metrics()
    }

    /// Interval of periodic watermark emission.
    #[must_use]
    pub fn watermark_interval(&self) -> std::time::Duration {
        self.strategy.settings().interval
    }

    /// Whether the enumerator signalled no more splits.
    #[must_use]
    pub fn no_more_splits(&self) -> bool {
        self.no_more_splits
    }
}

fn refresh_pending<St: SplitState>(splits: &BTreeMap<SplitId, St>, metrics: &SourceReaderMetrics) {
    let mut records: Option<u64> = None;
    let mut bytes: Option<u64> = None;
    for state in splits.values() {
        if let Some(r) = state.pending_records() {
            *records.get_or_insert(0) += r;
        }
        if let Some(b) = state.pending_bytes() {
            *bytes.get_or_insert(0) += b;
        }
    }
    metrics.update_pending(records, bytes);
}
