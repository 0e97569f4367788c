//! In-process runtime: one coordinator plus N reader tasks.
//!
//! ```text
//!                 ┌──────────────┐
//!                 │ Coordinator  │ (mailbox task)
//!                 └──┬────────▲──┘
//!       ReaderEvent  │        │  ReaderRequest
//!          ┌─────────┼────────┼─────────┐
//!          ▼         ▼        │         ▼
//!     reader 0   reader 1   ...    reader N-1   (owning tasks + fetchers)
//!          └─────────┴────┬─────────────┘
//!                         ▼
//!              bounded fan-in output
//! ```
//!
//! Checkpoints are aligned: the coordinator snapshots first, then every
//! reader, then reader event delivery resumes. A failed reader restarts
//! empty; its splits return to the enumerator from its last completed
//! checkpoint.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::checkpoint::{ReaderCheckpoint, ReaderCheckpointSerializer};
use crate::config::{CoordinatorConfig, RuntimeConfig};
use crate::coordinator::{CoordinatorHandle, SourceCoordinator};
use crate::error::{Result, SourceError};
use crate::metrics::ReaderMetricsSnapshot;
use crate::reader::{ReaderContext, StreamElement};
use crate::source::Source;
use crate::split::{ReaderId, ReaderInfo};
use crate::task::{spawn_reader_task, ReaderTaskHandle, TaggedElement};
use crate::watermark::WatermarkStrategy;

/// Interval at which waiting loops check for failed reader tasks.
const FAILURE_CHECK_INTERVAL: Duration = Duration::from_millis(20);

/// A globally consistent snapshot of a source: enumerator plus all readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCheckpoint {
    /// Checkpoint id.
    pub checkpoint_id: u64,
    /// Versioned enumerator checkpoint.
    pub coordinator: Bytes,
    /// Encoded reader checkpoints.
    pub readers: BTreeMap<ReaderId, Bytes>,
}

/// Runs a source in-process.
pub struct LocalSourceRuntime<S: Source> {
    source: Arc<S>,
    config: RuntimeConfig,
    strategy: WatermarkStrategy<S::Output>,
    coordinator: CoordinatorHandle<S::Enumerator>,
    coordinator_task: Option<JoinHandle<Result<()>>>,
    readers: BTreeMap<ReaderId, ReaderTaskHandle>,
    checkpoints: ReaderCheckpointSerializer<S::Split>,
    completed: BTreeMap<ReaderId, ReaderCheckpoint<S::Split>>,
    output_tx: mpsc::Sender<TaggedElement<S::Output>>,
    output: mpsc::Receiver<TaggedElement<S::Output>>,
    pending: VecDeque<TaggedElement<S::Output>>,
    finished: BTreeSet<ReaderId>,
}

impl<S: Source> std::fmt::Debug for LocalSourceRuntime<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSourceRuntime")
            .field("parallelism", &self.config.parallelism)
            .field("readers", &self.readers.keys().collect::<Vec<_>>())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<S: Source> LocalSourceRuntime<S> {
    /// Starts a fresh job.
    ///
    /// # Errors
    ///
    /// Returns configuration errors and enumerator creation errors.
    pub async fn start(
        source: Arc<S>,
        config: RuntimeConfig,
        strategy: WatermarkStrategy<S::Output>,
    ) -> Result<Self> {
        let (coordinator, handle) =
            SourceCoordinator::for_source(&*source, &coordinator_config(&config))?;
        let mut runtime = Self::assemble(source, config, strategy, coordinator, handle)?;
        for index in 0..runtime.parallelism() {
            runtime.spawn_reader(ReaderId(index), None).await?;
        }
        Ok(runtime)
    }

    /// Restarts a job from a [`JobCheckpoint`].
    ///
    /// # Errors
    ///
    /// Returns decode errors of the enumerator or reader checkpoints.
    pub async fn restore(
        source: Arc<S>,
        config: RuntimeConfig,
        strategy: WatermarkStrategy<S::Output>,
        checkpoint: &JobCheckpoint,
    ) -> Result<Self> {
        tracing::info!(
            checkpoint_id = checkpoint.checkpoint_id,
            readers = checkpoint.readers.len(),
            "Restoring source job"
        );
        let (coordinator, handle) = SourceCoordinator::restore(
            &*source,
            &coordinator_config(&config),
            &checkpoint.coordinator,
        )?;
        let mut runtime = Self::assemble(source, config, strategy, coordinator, handle)?;
        // Readers beyond the new parallelism return their splits before anyone registers.
        for (reader, bytes) in checkpoint.readers.range(ReaderId(runtime.parallelism())..) {
            let decoded = runtime.checkpoints.decode(bytes)?;
            tracing::info!(
                reader = %reader,
                splits = decoded.splits.len(),
                "Reassigning splits of removed reader"
            );
            runtime.coordinator.reader_failed(*reader, Some(decoded)).await?;
        }
        for index in 0..runtime.parallelism() {
            let reader = ReaderId(index);
            let restored = checkpoint.readers.get(&reader).cloned();
            if let Some(bytes) = &restored {
                let decoded = runtime.checkpoints.decode(bytes)?;
                runtime.completed.insert(reader, decoded);
            }
            runtime.spawn_reader(reader, restored.as_deref()).await?;
        }
        Ok(runtime)
    }

    fn assemble(
        source: Arc<S>,
        config: RuntimeConfig,
        strategy: WatermarkStrategy<S::Output>,
        coordinator: SourceCoordinator<S::Enumerator>,
        handle: CoordinatorHandle<S::Enumerator>,
    ) -> Result<Self> {
        config.reader.validate()?;
        let (output_tx, output) = mpsc::channel(config.output_capacity.max(1));
        Ok(Self {
            checkpoints: ReaderCheckpointSerializer::new(source.split_serializer()),
            source,
            config,
            strategy,
            coordinator: handle,
            coordinator_task: Some(coordinator.spawn()),
            readers: BTreeMap::new(),
            completed: BTreeMap::new(),
            output_tx,
            output,
            pending: VecDeque::new(),
            finished: BTreeSet::new(),
        })
    }

    async fn spawn_reader(&mut self, reader: ReaderId, restored: Option<&[u8]>) -> Result<()> {
        let info = ReaderInfo::new(reader);
        let context = ReaderContext::new(
            info.clone(),
            self.config.parallelism,
            self.coordinator.gateway(),
        );
        let mut source_reader = Arc::clone(&self.source).create_reader(
            context,
            self.config.reader.clone(),
            self.strategy.clone(),
        );
        if let Some(bytes) = restored {
            source_reader.restore_from_bytes(bytes)?;
        }
        let events = self
            .coordinator
            .register_reader(info, source_reader.owned_split_ids())
            .await?;
        source_reader.start()?;
        let handle = spawn_reader_task(
            source_reader,
            events,
            self.output_tx.clone(),
            self.config.flush_batch_size,
        );
        self.finished.remove(&reader);
        self.readers.insert(reader, handle);
        Ok(())
    }

    /// Number of readers.
    #[must_use]
    pub fn parallelism(&self) -> u32 {
        u32::try_from(self.config.parallelism).unwrap_or(u32::MAX)
    }

    /// Coordinator handle.
    #[must_use]
    pub fn coordinator(&self) -> &CoordinatorHandle<S::Enumerator> {
        &self.coordinator
    }

    /// Metrics of one reader.
    #[must_use]
    pub fn reader_metrics(&self, reader: ReaderId) -> Option<ReaderMetricsSnapshot> {
        self.readers.get(&reader).map(|h| h.metrics().snapshot())
    }

    /// Next output element of any reader, in arrival order.
    pub async fn next(&mut self) -> Option<TaggedElement<S::Output>> {
        let element = match self.pending.pop_front() {
            Some(element) => element,
            None => self.output.recv().await?,
        };
        if matches!(element.element, StreamElement::EndOfInput) {
            self.finished.insert(element.reader);
        }
        Some(element)
    }

    /// Collects output until every reader reached end of input.
    ///
    /// # Errors
    ///
    /// Returns the first reader failure, or `SourceError::ReaderClosed` if
    /// `timeout` elapses first.
    pub async fn collect_bounded(&mut self, timeout: Duration) -> Result<Vec<TaggedElement<S::Output>>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut collected = Vec::new();
        let mut check = tokio::time::interval(FAILURE_CHECK_INTERVAL);
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while self.finished.len() < self.readers.len() {
            tokio::select! {
                biased;
                element = self.next() => match element {
                    Some(element) => collected.push(element),
                    None => return Err(SourceError::ReaderClosed),
                },
                _ = check.tick() => self.check_readers().await?,
                () = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(
                        finished = self.finished.len(),
                        readers = self.readers.len(),
                        "Timed out waiting for end of input"
                    );
                    return Err(SourceError::ReaderClosed);
                }
            }
        }
        Ok(collected)
    }

    /// Surfaces the failure of any reader task that stopped on its own.
    async fn check_readers(&mut self) -> Result<()> {
        let stopped: Vec<ReaderId> = self
            .readers
            .iter()
            .filter(|(id, h)| h.is_finished() && !self.finished.contains(*id))
            .map(|(id, _)| *id)
            .collect();
        for reader in stopped {
            if let Some(handle) = self.readers.remove(&reader) {
                handle.join().await?;
                return Err(SourceError::ReaderClosed);
            }
        }
        Ok(())
    }

    /// Takes an aligned checkpoint of the coordinator and every reader.
    ///
    /// Output arriving while readers snapshot is buffered and returned by
    /// later [`LocalSourceRuntime::next`] calls.
    ///
    /// # Errors
    ///
    /// Returns the first snapshot failure; the checkpoint is aborted.
    pub async fn checkpoint(&mut self, checkpoint_id: u64) -> Result<JobCheckpoint> {
        let coordinator = self.coordinator.checkpoint(checkpoint_id).await?;
        let mut readers = BTreeMap::new();
        for (id, handle) in &self.readers {
            let snapshot = buffering(
                &mut self.output,
                &mut self.pending,
                handle.checkpoint(checkpoint_id),
            )
            .await;
            match snapshot {
                Ok(bytes) => {
                    readers.insert(*id, bytes);
                }
                Err(e) => {
                    tracing::warn!(reader = %id, checkpoint_id, error = %e, "Reader snapshot failed");
                    self.coordinator.notify_checkpoint_aborted(checkpoint_id)?;
                    return Err(e);
                }
            }
        }
        self.coordinator.resume_event_delivery(checkpoint_id)?;

        for (id, bytes) in &readers {
            self.completed.insert(*id, self.checkpoints.decode(bytes)?);
        }
        self.coordinator.notify_checkpoint_complete(checkpoint_id)?;
        for handle in self.readers.values() {
            handle.notify_checkpoint_complete(checkpoint_id).await;
        }
        tracing::info!(checkpoint_id, readers = readers.len(), "Checkpoint complete");
        Ok(JobCheckpoint {
            checkpoint_id,
            coordinator,
            readers,
        })
    }

    /// Kills one reader and starts a new attempt. The new attempt starts
    /// without splits; the enumerator gets back everything the failed
    /// attempt owned since its last completed checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::UnknownReader` for an unknown reader, or
    /// coordinator errors.
    pub async fn fail_reader(&mut self, reader: ReaderId) -> Result<()> {
        let handle = self
            .readers
            .remove(&reader)
            .ok_or(SourceError::UnknownReader(reader))?;
        handle.cancel();
        if let Err(e) = buffering(&mut self.output, &mut self.pending, handle.join()).await {
            tracing::debug!(reader = %reader, error = %e, "Failed reader attempt ended with error");
        }
        let restored = self.completed.remove(&reader);
        tracing::info!(
            reader = %reader,
            restored_checkpoint = ?restored.as_ref().map(|c| c.checkpoint_id),
            "Restarting failed reader"
        );
        self.coordinator.reader_failed(reader, restored).await?;
        self.spawn_reader(reader, None).await
    }

    /// Stops every reader and the coordinator.
    ///
    /// # Errors
    ///
    /// Returns the first reader or coordinator failure.
    pub async fn shutdown(mut self) -> Result<()> {
        for handle in self.readers.values() {
            handle.cancel();
        }
        let mut first_error = None;
        let readers = std::mem::take(&mut self.readers);
        for (id, handle) in readers {
            if let Err(e) = buffering(&mut self.output, &mut self.pending, handle.join()).await {
                tracing::warn!(reader = %id, error = %e, "Reader ended with error");
                first_error.get_or_insert(e);
            }
        }
        self.coordinator.close().await;
        if let Some(task) = self.coordinator_task.take() {
            match task.await {
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Ok(Ok(())) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Coordinator task panicked");
                    first_error.get_or_insert(SourceError::CoordinatorClosed);
                }
            }
        }
        tracing::info!("Source runtime shut down");
        first_error.map_or(Ok(()), Err)
    }
}

fn coordinator_config(config: &RuntimeConfig) -> CoordinatorConfig {
    CoordinatorConfig {
        parallelism: config.parallelism,
    }
}

/// Awaits `work` while moving arriving output into `pending`, so readers
/// blocked on a full output channel can make progress.
async fn buffering<T, F: Future>(
    output: &mut mpsc::Receiver<TaggedElement<T>>,
    pending: &mut VecDeque<TaggedElement<T>>,
    work: F,
) -> F::Output {
    tokio::pin!(work);
    loop {
        tokio::select! {
            biased;
            result = &mut work => return result,
            Some(element) = output.recv() => pending.push_back(element),
        }
    }
}
