//! Deterministic number-sequence source.
//!
//! Split `i` of a source with `n` records per split emits the values
//! `start + i * n .. start + (i + 1) * n` in order. Splits are handed out one
//! per split request; a bounded source signals no-more-splits to a reader as
//! soon as the pool is empty.
//!
//! Fetch failures can be injected to exercise retry handling.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use laminar_source::checkpoint::{EnumeratorCheckpoint, JsonSerializer, VersionedSerializer};
use laminar_source::enumerator::{EnumeratorContext, SplitEnumerator};
use laminar_source::fetcher::{RecordsBySplits, SplitReader, SplitsChange};
use laminar_source::reader::{RecordEmitter, SplitOutput};
use laminar_source::source::{EnumeratorCheckpointOf, Source};
use laminar_source::{Boundedness, ReaderId, SourceConfig, SourceError, SourceSplit, SplitId, SplitState};

use crate::error::ConnectorError;

/// Bytes accounted per emitted number.
pub const RECORD_SIZE_IN_BYTES: u64 = 4;

/// Configuration of a [`NumberSequenceSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumberSequenceConfig {
    /// Number of splits.
    pub splits: u32,
    /// Numbers per split.
    pub records_per_split: u64,
    /// First number of split 0.
    pub start: i64,
    /// Whether the source ends.
    pub boundedness: Boundedness,
    /// If set, a number `v` gets event time `event_time_base + v`.
    pub event_time_base: Option<i64>,
    /// Numbers per fetch.
    pub fetch_batch_size: usize,
}

impl Default for NumberSequenceConfig {
    fn default() -> Self {
        Self {
            splits: 1,
            records_per_split: 10,
            start: 0,
            boundedness: Boundedness::Bounded,
            event_time_base: None,
            fetch_batch_size: 4,
        }
    }
}

impl NumberSequenceConfig {
    /// Parses `splits`, `records.per.split`, `start`, `boundedness`,
    /// `event.time.base` and `fetch.batch.size`.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ConfigurationError` for unparseable or
    /// out-of-range values.
    pub fn from_config(config: &SourceConfig) -> Result<Self, ConnectorError> {
        let defaults = Self::default();
        let cfg = Self {
            splits: config.get_parsed("splits")?.unwrap_or(defaults.splits),
            records_per_split: config
                .get_parsed("records.per.split")?
                .unwrap_or(defaults.records_per_split),
            start: config.get_parsed("start")?.unwrap_or(defaults.start),
            boundedness: config
                .get_parsed("boundedness")?
                .unwrap_or(defaults.boundedness),
            event_time_base: config.get_parsed("event.time.base")?,
            fetch_batch_size: config
                .get_parsed("fetch.batch.size")?
                .unwrap_or(defaults.fetch_batch_size),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates value ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ConfigurationError` for zero splits or a zero
    /// fetch batch size.
    pub fn validate(&self) -> Result<(), ConnectorError> {
        if self.splits == 0 {
            return Err(ConnectorError::ConfigurationError(
                "splits must be at least 1".into(),
            ));
        }
        if self.fetch_batch_size == 0 {
            return Err(ConnectorError::ConfigurationError(
                "fetch.batch.size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// One contiguous range of numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSplit {
    id: SplitId,
    /// Next number to emit.
    pub next: i64,
    /// Exclusive end of the range.
    pub end: i64,
}

impl SequenceSplit {
    /// Creates a split covering `next..end`.
    #[must_use]
    pub fn new(id: impl Into<SplitId>, next: i64, end: i64) -> Self {
        Self {
            id: id.into(),
            next,
            end,
        }
    }

    fn remaining(&self) -> u64 {
        u64::try_from(self.end.saturating_sub(self.next)).unwrap_or(0)
    }
}

/// Reader-side progress of a [`SequenceSplit`].
#[derive(Debug)]
pub struct SequenceSplitState(SequenceSplit);

impl SourceSplit for SequenceSplit {
    type State = SequenceSplitState;

    fn split_id(&self) -> &SplitId {
        &self.id
    }

    fn into_state(self) -> SequenceSplitState {
        SequenceSplitState(self)
    }
}

impl SplitState for SequenceSplitState {
    type Split = SequenceSplit;

    fn split_id(&self) -> &SplitId {
        &self.0.id
    }

    fn to_split(&self) -> SequenceSplit {
        self.0.clone()
    }

    fn pending_records(&self) -> Option<u64> {
        Some(self.0.remaining())
    }

    fn pending_bytes(&self) -> Option<u64> {
        Some(self.0.remaining() * RECORD_SIZE_IN_BYTES)
    }
}

/// Pull-based enumerator: one split per request.
///
/// An unbounded source parks readers whose request found no split and
/// serves them when splits come back from a failed reader.
#[derive(Debug)]
pub struct SequenceEnumerator {
    pending: VecDeque<SequenceSplit>,
    waiting: BTreeSet<ReaderId>,
    boundedness: Boundedness,
}

impl SequenceEnumerator {
    fn new(pending: VecDeque<SequenceSplit>, boundedness: Boundedness) -> Self {
        Self {
            pending,
            waiting: BTreeSet::new(),
            boundedness,
        }
    }

    /// Splits not yet assigned.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Readers waiting for a split.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    fn serve_waiting(&mut self, ctx: &mut EnumeratorContext<Self>) -> laminar_source::Result<()> {
        let waiting: Vec<ReaderId> = self.waiting.iter().copied().collect();
        for reader in waiting {
            if !ctx.is_registered(reader) {
                self.waiting.remove(&reader);
                continue;
            }
            if let Some(split) = self.pending.pop_front() {
                tracing::debug!(reader = %reader, split = %split.id, "Assigning sequence split");
                ctx.assign_split(split, reader)?;
                self.waiting.remove(&reader);
            } else if self.boundedness.is_bounded() {
                ctx.signal_no_more_splits(reader)?;
                self.waiting.remove(&reader);
            } else {
                break;
            }
        }
        ctx.metrics().set_unassigned_splits(self.pending.len());
        Ok(())
    }
}

impl SplitEnumerator for SequenceEnumerator {
    type Split = SequenceSplit;
    type State = ();

    fn start(&mut self, ctx: &mut EnumeratorContext<Self>) -> laminar_source::Result<()> {
        ctx.metrics().set_unassigned_splits(self.pending.len());
        Ok(())
    }

    fn handle_split_request(
        &mut self,
        ctx: &mut EnumeratorContext<Self>,
        reader: ReaderId,
        _location: Option<&str>,
    ) -> laminar_source::Result<()> {
        self.waiting.insert(reader);
        self.serve_waiting(ctx)
    }

    fn add_splits_back(
        &mut self,
        ctx: &mut EnumeratorContext<Self>,
        splits: Vec<SequenceSplit>,
        reader: ReaderId,
    ) -> laminar_source::Result<()> {
        tracing::debug!(reader = %reader, count = splits.len(), "Sequence splits returned");
        self.waiting.remove(&reader);
        for split in splits.into_iter().rev() {
            self.pending.push_front(split);
        }
        self.serve_waiting(ctx)
    }

    fn add_reader(&mut self, ctx: &mut EnumeratorContext<Self>, _reader: ReaderId) -> laminar_source::Result<()> {
        // Readers pull splits; a new registration may unblock parked ones.
        self.serve_waiting(ctx)
    }

    fn snapshot_state(
        &mut self,
        _checkpoint_id: u64,
    ) -> laminar_source::Result<EnumeratorCheckpoint<(), SequenceSplit>> {
        Ok(EnumeratorCheckpoint::new((), self.pending.iter().cloned().collect()))
    }
}

/// Emits the numbers of its splits in batches.
#[derive(Debug)]
pub struct SequenceSplitReader {
    splits: VecDeque<SequenceSplit>,
    paused: HashSet<SplitId>,
    batch_size: usize,
    failures: Arc<AtomicU32>,
}

#[async_trait]
impl SplitReader for SequenceSplitReader {
    type Split = SequenceSplit;
    type Record = i64;

    async fn fetch(&mut self) -> laminar_source::Result<RecordsBySplits<i64>> {
        let injected = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SourceError::SplitReader("injected fetch failure".into()));
        }

        let mut batch = RecordsBySplits::new();
        let Some(index) = self
            .splits
            .iter()
            .position(|s| !self.paused.contains(&s.id))
        else {
            return Ok(batch);
        };
        let split = &mut self.splits[index];
        let take = split.remaining().min(self.batch_size as u64);
        let from = split.next;
        let to = from.saturating_add(i64::try_from(take).unwrap_or(i64::MAX));
        batch.add_all(&split.id, from..to);
        split.next = to;
        if split.next >= split.end {
            let id = split.id.clone();
            self.splits.remove(index);
            batch.finish(id);
        }
        Ok(batch)
    }

    fn handle_splits_change(&mut self, change: SplitsChange<SequenceSplit>) -> laminar_source::Result<()> {
        match change {
            SplitsChange::Add(splits) => self.splits.extend(splits),
            SplitsChange::Remove(ids) => {
                self.splits.retain(|s| !ids.contains(&s.id));
                for id in &ids {
                    self.paused.remove(id);
                }
            }
        }
        Ok(())
    }

    fn pause_or_resume_splits(&mut self, pause: &[SplitId], resume: &[SplitId]) {
        self.paused.extend(pause.iter().cloned());
        for id in resume {
            self.paused.remove(id);
        }
    }
}

/// Emits each number, optionally with an event time.
#[derive(Debug, Clone, Copy)]
pub struct SequenceEmitter {
    event_time_base: Option<i64>,
}

impl RecordEmitter<i64, i64, SequenceSplitState> for SequenceEmitter {
    fn emit_record(
        &mut self,
        value: i64,
        output: &mut SplitOutput<'_, i64>,
        state: &mut SequenceSplitState,
    ) -> laminar_source::Result<()> {
        state.0.next = value.saturating_add(1);
        output.add_bytes_in(RECORD_SIZE_IN_BYTES);
        match self.event_time_base {
            Some(base) => output.collect_with_timestamp(value, Some(base.saturating_add(value))),
            None => output.collect(value),
        }
        Ok(())
    }
}

/// Bounded or unbounded source of number sequences.
#[derive(Debug, Clone)]
pub struct NumberSequenceSource {
    config: NumberSequenceConfig,
    failures: Arc<AtomicU32>,
}

impl NumberSequenceSource {
    /// Creates a source.
    #[must_use]
    pub fn new(config: NumberSequenceConfig) -> Self {
        Self {
            config,
            failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Creates a source from properties (see
    /// [`NumberSequenceConfig::from_config`]).
    ///
    /// # Errors
    ///
    /// Returns configuration errors.
    pub fn from_config(config: &SourceConfig) -> Result<Self, ConnectorError> {
        Ok(Self::new(NumberSequenceConfig::from_config(config)?))
    }

    /// Bounded source of `splits` splits with `records_per_split` numbers
    /// each, starting at `start`.
    #[must_use]
    pub fn bounded(splits: u32, records_per_split: u64, start: i64) -> Self {
        Self::new(NumberSequenceConfig {
            splits,
            records_per_split,
            start,
            ..NumberSequenceConfig::default()
        })
    }

    /// Makes the next `count` fetches (across all readers) fail.
    #[must_use]
    pub fn with_fetch_failures(self, count: u32) -> Self {
        self.failures.store(count, Ordering::Release);
        self
    }

    /// Source configuration.
    #[must_use]
    pub fn config(&self) -> &NumberSequenceConfig {
        &self.config
    }

    /// All splits of the source, in id order.
    #[must_use]
    pub fn splits(&self) -> Vec<SequenceSplit> {
        let n = i64::try_from(self.config.records_per_split).unwrap_or(i64::MAX);
        (0..self.config.splits)
            .map(|i| {
                let from = self.config.start.saturating_add(n.saturating_mul(i64::from(i)));
                SequenceSplit::new(format!("sequence-{i}"), from, from.saturating_add(n))
            })
            .collect()
    }
}

impl Source for NumberSequenceSource {
    type Split = SequenceSplit;
    type Output = i64;
    type Enumerator = SequenceEnumerator;
    type Reader = SequenceSplitReader;
    type Emitter = SequenceEmitter;

    fn boundedness(&self) -> Boundedness {
        self.config.boundedness
    }

    fn create_enumerator(
        &self,
        _ctx: &EnumeratorContext<SequenceEnumerator>,
    ) -> laminar_source::Result<SequenceEnumerator> {
        Ok(SequenceEnumerator::new(
            self.splits().into(),
            self.config.boundedness,
        ))
    }

    fn restore_enumerator(
        &self,
        _ctx: &EnumeratorContext<SequenceEnumerator>,
        checkpoint: EnumeratorCheckpointOf<Self>,
    ) -> laminar_source::Result<SequenceEnumerator> {
        Ok(SequenceEnumerator::new(
            checkpoint.pending_splits.into(),
            self.config.boundedness,
        ))
    }

    fn create_split_reader(&self) -> SequenceSplitReader {
        SequenceSplitReader {
            splits: VecDeque::new(),
            paused: HashSet::new(),
            batch_size: self.config.fetch_batch_size.max(1),
            failures: Arc::clone(&self.failures),
        }
    }

    fn create_record_emitter(&self) -> SequenceEmitter {
        SequenceEmitter {
            event_time_base: self.config.event_time_base,
        }
    }

    fn split_serializer(&self) -> Arc<dyn VersionedSerializer<SequenceSplit>> {
        JsonSerializer::shared(1)
    }

    fn enumerator_checkpoint_serializer(&self) -> Arc<dyn VersionedSerializer<EnumeratorCheckpointOf<Self>>> {
        JsonSerializer::shared(1)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use laminar_source::event::CoordinatorGateway;
    use laminar_source::{CoordinatorConfig, ReaderEvent, ReaderInfo, ReaderRequest, SourceCoordinator};

    use super::*;

    #[test]
    fn test_split_ranges() {
        let source = NumberSequenceSource::bounded(2, 10, 20);
        let splits = source.splits();
        assert_eq!(splits[0], SequenceSplit::new("sequence-0", 20, 30));
        assert_eq!(splits[1], SequenceSplit::new("sequence-1", 30, 40));
    }

    #[test]
    fn test_config_from_properties() {
        let props = SourceConfig::new("sequence")
            .with("splits", "3")
            .with("records.per.split", "7")
            .with("boundedness", "unbounded")
            .with("event.time.base", "1000");
        let cfg = NumberSequenceConfig::from_config(&props).unwrap();
        assert_eq!(cfg.splits, 3);
        assert_eq!(cfg.records_per_split, 7);
        assert_eq!(cfg.boundedness, Boundedness::ContinuousUnbounded);
        assert_eq!(cfg.event_time_base, Some(1000));

        let bad = SourceConfig::new("sequence").with("splits", "0");
        assert!(NumberSequenceConfig::from_config(&bad).is_err());
    }

    #[tokio::test]
    async fn test_reader_batches_and_finishes() {
        let source = NumberSequenceSource::new(NumberSequenceConfig {
            records_per_split: 5,
            fetch_batch_size: 3,
            ..NumberSequenceConfig::default()
        });
        let mut reader = source.create_split_reader();
        reader
            .handle_splits_change(SplitsChange::Add(source.splits()))
            .unwrap();

        let first = reader.fetch().await.unwrap();
        assert_eq!(first.record_count(), 3);
        assert!(first.finished_splits().is_empty());

        let second = reader.fetch().await.unwrap();
        let (records, finished) = second.into_parts();
        assert_eq!(records, vec![(SplitId::new("sequence-0"), vec![3, 4])]);
        assert!(finished.contains(&SplitId::new("sequence-0")));
        assert!(reader.fetch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let source = NumberSequenceSource::bounded(1, 2, 0).with_fetch_failures(2);
        let mut reader = source.create_split_reader();
        reader
            .handle_splits_change(SplitsChange::Add(source.splits()))
            .unwrap();
        assert!(reader.fetch().await.is_err());
        assert!(reader.fetch().await.is_err());
        assert_eq!(reader.fetch().await.unwrap().record_count(), 2);
    }

    #[tokio::test]
    async fn test_paused_split_is_skipped() {
        let source = NumberSequenceSource::bounded(2, 2, 0);
        let mut reader = source.create_split_reader();
        reader
            .handle_splits_change(SplitsChange::Add(source.splits()))
            .unwrap();
        reader.pause_or_resume_splits(&[SplitId::new("sequence-0")], &[]);
        let (records, _) = reader.fetch().await.unwrap().into_parts();
        assert_eq!(records, vec![(SplitId::new("sequence-1"), vec![2, 3])]);
    }

    #[test]
    fn test_split_state_pending() {
        let mut state = SequenceSplit::new("s", 0, 10).into_state();
        state.0.next = 4;
        assert_eq!(state.pending_records(), Some(6));
        assert_eq!(state.pending_bytes(), Some(24));
        assert_eq!(state.to_split().next, 4);
    }

    #[tokio::test]
    async fn test_unbounded_waiting_reader_gets_returned_splits() {
        let source = NumberSequenceSource::new(NumberSequenceConfig {
            splits: 1,
            records_per_split: 10,
            boundedness: Boundedness::ContinuousUnbounded,
            ..NumberSequenceConfig::default()
        });
        let (coordinator, handle) =
            SourceCoordinator::for_source(&source, &CoordinatorConfig { parallelism: 2 }).unwrap();
        let task = coordinator.spawn();
        let mut first = handle
            .register_reader(ReaderInfo::new(ReaderId(0)), Vec::new())
            .await
            .unwrap();
        let mut second = handle
            .register_reader(ReaderInfo::new(ReaderId(1)), Vec::new())
            .await
            .unwrap();
        let gateway = handle.gateway();
        let request = |reader| ReaderRequest::SplitRequest {
            reader: ReaderId(reader),
            location: None,
        };

        gateway.send(request(0)).unwrap();
        gateway.send(request(1)).unwrap();
        let split = SequenceSplit::new("sequence-0", 0, 10);
        assert_eq!(
            first.recv().await.unwrap(),
            ReaderEvent::AddSplits(vec![split.clone()])
        );

        // Reader 1 is parked, not told that splits ran out.
        handle.reader_failed(ReaderId(0), None).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), second.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ReaderEvent::AddSplits(vec![split]));
        assert!(second.try_recv().is_err());

        handle.close().await;
        task.await.unwrap().unwrap();
    }
}
