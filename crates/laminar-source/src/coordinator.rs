//! # Source coordinator
//!
//! Hosts the single [`SplitEnumerator`] of a source behind an unbounded
//! mailbox. One tokio task drains the mailbox and runs every enumerator
//! callback, so the enumerator never needs locks.
//!
//! ```text
//!  readers ──ReaderRequest──┐
//!  runtime ──checkpoint/────┼──► mailbox ──► enumerator ──ReaderEvent──► readers
//!            failure        │       ▲
//!  call_async results ──────┘       │
//! ```
//!
//! Checkpoints follow a two-step protocol: `checkpoint(id)` snapshots the
//! enumerator and holds back all reader events; `resume_event_delivery(id)`
//! (or completion / abort of `id`) releases them once every reader has taken
//! its own snapshot.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::checkpoint::{
    deserialize_versioned, serialize_versioned, EnumeratorCheckpoint, ReaderCheckpoint,
    VersionedSerializer,
};
use crate::config::CoordinatorConfig;
use crate::enumerator::{EnumeratorContext, RegisteredReaders, SplitEnumerator};
use crate::error::{Result, SourceError};
use crate::event::{CoordinatorGateway, ReaderEvent, ReaderRequest};
use crate::metrics::EnumeratorMetrics;
use crate::source::Source;
use crate::split::{ReaderId, ReaderInfo, SourceSplit, SplitId};

type CheckpointSerializer<E> = Arc<
    dyn VersionedSerializer<
        EnumeratorCheckpoint<<E as SplitEnumerator>::State, <E as SplitEnumerator>::Split>,
    >,
>;

/// Deferred enumerator work executed on the mailbox task.
pub type EnumeratorCallback<E> =
    Box<dyn FnOnce(&mut E, &mut EnumeratorContext<E>) -> Result<()> + Send>;

/// Per-reader event receiver handed out at registration.
pub type ReaderEvents<S> = mpsc::UnboundedReceiver<ReaderEvent<S>>;

/// Messages processed by the coordinator mailbox task.
pub enum CoordinatorMessage<E: SplitEnumerator> {
    /// A reader (attempt) joins.
    RegisterReader {
        /// Registration info.
        info: ReaderInfo,
        /// Splits the reader already owns after a restore.
        owned_splits: Vec<SplitId>,
        /// Receives the reader's event channel.
        reply: oneshot::Sender<Result<ReaderEvents<E::Split>>>,
    },
    /// A request from a registered reader.
    Request(ReaderRequest),
    /// Snapshot the enumerator for checkpoint `checkpoint_id`.
    Checkpoint {
        /// Checkpoint being taken.
        checkpoint_id: u64,
        /// Receives the versioned enumerator checkpoint.
        reply: oneshot::Sender<Result<Bytes>>,
    },
    /// All readers snapshotted `checkpoint_id`; release held events.
    ResumeEventDelivery {
        /// Checkpoint whose reader snapshots are done.
        checkpoint_id: u64,
    },
    /// Checkpoint `checkpoint_id` is durable.
    CheckpointComplete {
        /// Completed checkpoint.
        checkpoint_id: u64,
    },
    /// Checkpoint `checkpoint_id` was abandoned.
    CheckpointAborted {
        /// Aborted checkpoint.
        checkpoint_id: u64,
    },
    /// A reader failed and will restart from `restored` (or from scratch).
    ReaderFailed {
        /// Failed reader.
        reader: ReaderId,
        /// Checkpoint the next attempt restarts from, if any.
        restored: Option<ReaderCheckpoint<E::Split>>,
        /// Acknowledged once the splits are back with the enumerator.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Result of `call_async` work.
    Callback(EnumeratorCallback<E>),
    /// Close the enumerator and stop. Queued messages are discarded.
    Close {
        /// Acknowledged after the enumerator closed.
        reply: oneshot::Sender<()>,
    },
}

impl<E: SplitEnumerator> std::fmt::Debug for CoordinatorMessage<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RegisterReader { info, .. } => write!(f, "RegisterReader({})", info.reader_id),
            Self::Request(request) => write!(f, "Request({request:?})"),
            Self::Checkpoint { checkpoint_id, .. } => write!(f, "Checkpoint({checkpoint_id})"),
            Self::ResumeEventDelivery { checkpoint_id } => {
                write!(f, "ResumeEventDelivery({checkpoint_id})")
            }
            Self::CheckpointComplete { checkpoint_id } => {
                write!(f, "CheckpointComplete({checkpoint_id})")
            }
            Self::CheckpointAborted { checkpoint_id } => {
                write!(f, "CheckpointAborted({checkpoint_id})")
            }
            Self::ReaderFailed { reader, .. } => write!(f, "ReaderFailed({reader})"),
            Self::Callback(_) => f.write_str("Callback"),
            Self::Close { .. } => f.write_str("Close"),
        }
    }
}

/// Coordinator of one source: the enumerator plus its mailbox.
pub struct SourceCoordinator<E: SplitEnumerator> {
    enumerator: E,
    context: EnumeratorContext<E>,
    mailbox: mpsc::UnboundedReceiver<CoordinatorMessage<E>>,
    serializer: CheckpointSerializer<E>,
    started: bool,
}

impl<E: SplitEnumerator> std::fmt::Debug for SourceCoordinator<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceCoordinator")
            .field("context", &self.context)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl<E: SplitEnumerator> SourceCoordinator<E> {
    /// Creates a coordinator around the enumerator built by `create`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Config` for zero parallelism, or the error of
    /// `create`.
    pub fn new<F>(
        config: &CoordinatorConfig,
        serializer: CheckpointSerializer<E>,
        create: F,
    ) -> Result<(Self, CoordinatorHandle<E>)>
    where
        F: FnOnce(&EnumeratorContext<E>) -> Result<E>,
    {
        if config.parallelism == 0 {
            return Err(SourceError::Config(
                "coordinator parallelism must be at least 1".into(),
            ));
        }
        let (sender, mailbox) = mpsc::unbounded_channel();
        let registered = RegisteredReaders::default();
        let metrics = Arc::new(EnumeratorMetrics::new());
        let context = EnumeratorContext::new(
            sender.downgrade(),
            config.parallelism,
            Arc::clone(&registered),
            Arc::clone(&metrics),
        );
        let enumerator = create(&context)?;
        let coordinator = Self {
            enumerator,
            context,
            mailbox,
            serializer,
            started: false,
        };
        let handle = CoordinatorHandle {
            sender,
            registered,
            metrics,
        };
        Ok((coordinator, handle))
    }

    /// Creates a coordinator with a fresh enumerator of `source`.
    ///
    /// # Errors
    ///
    /// See [`SourceCoordinator::new`].
    pub fn for_source<S>(source: &S, config: &CoordinatorConfig) -> Result<(Self, CoordinatorHandle<E>)>
    where
        S: Source<Enumerator = E, Split = E::Split>,
    {
        Self::new(config, source.enumerator_checkpoint_serializer(), |ctx| {
            source.create_enumerator(ctx)
        })
    }

    /// Creates a coordinator whose enumerator is restored from a checkpoint
    /// produced by [`CoordinatorHandle::checkpoint`].
    ///
    /// # Errors
    ///
    /// Returns decode errors (`SourceError::UnsupportedVersion`,
    /// `SourceError::CorruptCheckpoint`) and restore errors of the source.
    pub fn restore<S>(
        source: &S,
        config: &CoordinatorConfig,
        checkpoint: &[u8],
    ) -> Result<(Self, CoordinatorHandle<E>)>
    where
        S: Source<Enumerator = E, Split = E::Split>,
    {
        let serializer = source.enumerator_checkpoint_serializer();
        let restored = deserialize_versioned(&*serializer, checkpoint)?;
        tracing::info!(
            pending_splits = restored.pending_splits.len(),
            "Restoring split enumerator"
        );
        Self::new(config, serializer, move |ctx| {
            source.restore_enumerator(ctx, restored)
        })
    }

    /// Calls [`SplitEnumerator::start`]. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates the enumerator's error.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        tracing::info!(
            parallelism = self.context.current_parallelism(),
            "Source coordinator started"
        );
        self.enumerator.start(&mut self.context)
    }

    /// Drains the mailbox until closed.
    ///
    /// # Errors
    ///
    /// Returns the first enumerator callback error; the coordinator is
    /// failed at that point.
    pub async fn run(mut self) -> Result<()> {
        let result = self.run_loop().await;
        self.context.cancel_background_work();
        if let Err(e) = &result {
            tracing::error!(error = %e, "Source coordinator failed");
        }
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        self.start()?;
        while let Some(message) = self.mailbox.recv().await {
            if !self.handle_message(message)? {
                return Ok(());
            }
        }
        tracing::debug!("Coordinator mailbox closed");
        self.close_enumerator();
        Ok(())
    }

    /// Spawns [`SourceCoordinator::run`] on the tokio runtime.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Processes one message. Returns `false` after `Close`.
    fn handle_message(&mut self, message: CoordinatorMessage<E>) -> Result<bool> {
        match message {
            CoordinatorMessage::RegisterReader {
                info,
                owned_splits,
                reply,
            } => {
                let reader = info.reader_id;
                let (gateway, events) = mpsc::unbounded_channel();
                if let Err(e) = self.context.register(info, owned_splits, gateway) {
                    tracing::warn!(reader = %reader, error = %e, "Reader registration rejected");
                    let _ = reply.send(Err(e));
                    return Ok(true);
                }
                tracing::info!(reader = %reader, "Reader registered");
                let _ = reply.send(Ok(events));
                self.enumerator.add_reader(&mut self.context, reader)?;
            }
            CoordinatorMessage::Request(request) => self.handle_request(request)?,
            CoordinatorMessage::Checkpoint {
                checkpoint_id,
                reply,
            } => self.checkpoint(checkpoint_id, reply)?,
            CoordinatorMessage::ResumeEventDelivery { checkpoint_id }
            | CoordinatorMessage::CheckpointAborted { checkpoint_id } => {
                self.context.open_valve(checkpoint_id);
            }
            CoordinatorMessage::CheckpointComplete { checkpoint_id } => {
                self.context.open_valve(checkpoint_id);
                self.context
                    .tracker_mut()
                    .on_checkpoint_complete(checkpoint_id);
                self.enumerator.notify_checkpoint_complete(checkpoint_id);
                tracing::debug!(checkpoint_id, "Coordinator checkpoint complete");
            }
            CoordinatorMessage::ReaderFailed {
                reader,
                restored,
                reply,
            } => {
                let result = self.reader_failed(reader, restored);
                let _ = reply.send(Ok(()));
                result?;
            }
            CoordinatorMessage::Callback(callback) => {
                callback(&mut self.enumerator, &mut self.context)?;
            }
            CoordinatorMessage::Close { reply } => {
                self.close_enumerator();
                self.context.cancel_background_work();
                self.mailbox.close();
                let _ = reply.send(());
                tracing::info!("Source coordinator closed");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn handle_request(&mut self, request: ReaderRequest) -> Result<()> {
        let reader = request.reader();
        if !self.context.is_registered(reader) {
            tracing::warn!(reader = %reader, "Request from unregistered reader dropped");
            return Ok(());
        }
        match request {
            ReaderRequest::SplitRequest { location, .. } => {
                tracing::debug!(reader = %reader, "Split request");
                self.enumerator
                    .handle_split_request(&mut self.context, reader, location.as_deref())
            }
            ReaderRequest::SourceEvent { event, .. } => {
                self.enumerator
                    .handle_source_event(&mut self.context, reader, event)
            }
            ReaderRequest::SplitsFinished { splits, .. } => {
                tracing::debug!(reader = %reader, count = splits.len(), "Splits finished");
                self.context.release_splits(reader, &splits);
                Ok(())
            }
        }
    }

    fn checkpoint(&mut self, checkpoint_id: u64, reply: oneshot::Sender<Result<Bytes>>) -> Result<()> {
        let snapshot = match self.enumerator.snapshot_state(checkpoint_id) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let _ = reply.send(Err(SourceError::Enumerator(format!(
                    "snapshot of checkpoint {checkpoint_id} failed: {e}"
                ))));
                return Err(e);
            }
        };
        self.context
            .metrics()
            .set_unassigned_splits(snapshot.pending_splits.len());
        match serialize_versioned(&*self.serializer, &snapshot) {
            Ok(bytes) => {
                self.context.tracker_mut().snapshot(checkpoint_id);
                self.context.close_valve(checkpoint_id);
                tracing::debug!(
                    checkpoint_id,
                    pending_splits = snapshot.pending_splits.len(),
                    bytes = bytes.len(),
                    "Enumerator snapshot"
                );
                let _ = reply.send(Ok(bytes));
            }
            Err(e) => {
                tracing::warn!(checkpoint_id, error = %e, "Enumerator snapshot not serializable");
                let _ = reply.send(Err(e));
            }
        }
        Ok(())
    }

    fn reader_failed(
        &mut self,
        reader: ReaderId,
        restored: Option<ReaderCheckpoint<E::Split>>,
    ) -> Result<()> {
        let restored_id = restored.as_ref().map(|c| c.checkpoint_id);
        let mut splits = restored.map(|c| c.splits).unwrap_or_default();
        splits.extend(self.context.tracker_mut().assignments_after(reader, restored_id));
        self.context.tracker_mut().remove_reader(reader);

        let mut seen = HashSet::new();
        splits.retain(|split| seen.insert(split.split_id().clone()));

        self.context.unregister(reader);
        tracing::info!(
            reader = %reader,
            restored_checkpoint = ?restored_id,
            splits = splits.len(),
            "Reader failed, returning splits"
        );
        if splits.is_empty() {
            return Ok(());
        }
        self.context.metrics().add_added_back(splits.len());
        self.enumerator
            .add_splits_back(&mut self.context, splits, reader)
    }

    fn close_enumerator(&mut self) {
        if let Err(e) = self.enumerator.close() {
            tracing::warn!(error = %e, "Split enumerator close failed");
        }
    }
}

/// Cloneable handle to a running coordinator.
pub struct CoordinatorHandle<E: SplitEnumerator> {
    sender: mpsc::UnboundedSender<CoordinatorMessage<E>>,
    registered: RegisteredReaders,
    metrics: Arc<EnumeratorMetrics>,
}

impl<E: SplitEnumerator> Clone for CoordinatorHandle<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            registered: Arc::clone(&self.registered),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<E: SplitEnumerator> std::fmt::Debug for CoordinatorHandle<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("closed", &self.sender.is_closed())
            .finish_non_exhaustive()
    }
}

impl<E: SplitEnumerator> CoordinatorHandle<E> {
    fn post(&self, message: CoordinatorMessage<E>) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| SourceError::CoordinatorClosed)
    }

    async fn ask<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> CoordinatorMessage<E>,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.post(message(reply))?;
        response.await.map_err(|_| SourceError::CoordinatorClosed)
    }

    /// Registers a reader attempt and returns its event channel.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::ProtocolViolation` if the reader is already
    /// registered, `SourceError::DuplicateAssignment` if a restored split is
    /// owned elsewhere, or `SourceError::CoordinatorClosed`.
    pub async fn register_reader(
        &self,
        info: ReaderInfo,
        owned_splits: Vec<SplitId>,
    ) -> Result<ReaderEvents<E::Split>> {
        self.ask(|reply| CoordinatorMessage::RegisterReader {
            info,
            owned_splits,
            reply,
        })
        .await?
    }

    /// Reader-side gateway into this coordinator's mailbox.
    #[must_use]
    pub fn gateway(&self) -> Arc<dyn CoordinatorGateway> {
        Arc::new(MailboxGateway {
            sender: self.sender.clone(),
        })
    }

    /// Snapshots the enumerator and holds back reader events until
    /// [`CoordinatorHandle::resume_event_delivery`].
    ///
    /// # Errors
    ///
    /// Returns snapshot or serialization errors, or
    /// `SourceError::CoordinatorClosed`.
    pub async fn checkpoint(&self, checkpoint_id: u64) -> Result<Bytes> {
        self.ask(|reply| CoordinatorMessage::Checkpoint {
            checkpoint_id,
            reply,
        })
        .await?
    }

    /// Releases reader events held since the snapshot of `checkpoint_id`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::CoordinatorClosed`.
    pub fn resume_event_delivery(&self, checkpoint_id: u64) -> Result<()> {
        self.post(CoordinatorMessage::ResumeEventDelivery { checkpoint_id })
    }

    /// Checkpoint `checkpoint_id` is durable.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::CoordinatorClosed`.
    pub fn notify_checkpoint_complete(&self, checkpoint_id: u64) -> Result<()> {
        self.post(CoordinatorMessage::CheckpointComplete { checkpoint_id })
    }

    /// Checkpoint `checkpoint_id` was abandoned.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::CoordinatorClosed`.
    pub fn notify_checkpoint_aborted(&self, checkpoint_id: u64) -> Result<()> {
        self.post(CoordinatorMessage::CheckpointAborted { checkpoint_id })
    }

    /// Reports a failed reader. Its splits (restored checkpoint plus later
    /// assignments) go back to the enumerator and its ownership is released.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::CoordinatorClosed`.
    pub async fn reader_failed(
        &self,
        reader: ReaderId,
        restored: Option<ReaderCheckpoint<E::Split>>,
    ) -> Result<()> {
        self.ask(|reply| CoordinatorMessage::ReaderFailed {
            reader,
            restored,
            reply,
        })
        .await?
    }

    /// Closes the enumerator and stops the mailbox task. Returns once the
    /// coordinator has stopped (immediately if it already has).
    pub async fn close(&self) {
        let _ = self.ask(|reply| CoordinatorMessage::Close { reply }).await;
    }

    /// Readers currently registered.
    #[must_use]
    pub fn registered_readers(&self) -> Vec<ReaderId> {
        self.registered.read().keys().copied().collect()
    }

    /// Enumerator metrics.
    #[must_use]
    pub fn metrics(&self) -> &Arc<EnumeratorMetrics> {
        &self.metrics
    }
}

struct MailboxGateway<E: SplitEnumerator> {
    sender: mpsc::UnboundedSender<CoordinatorMessage<E>>,
}

impl<E: SplitEnumerator> CoordinatorGateway for MailboxGateway<E> {
    fn send(&self, request: ReaderRequest) -> Result<()> {
        self.sender
            .send(CoordinatorMessage::Request(request))
            .map_err(|_| SourceError::CoordinatorClosed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::checkpoint::JsonSerializer;
    use crate::enumerator::SplitsAssignment;
    use crate::event::SourceEvent;
    use crate::split::SplitState;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct TestSplit {
        id: SplitId,
        position: u64,
    }

    impl TestSplit {
        fn new(id: &str) -> Self {
            Self {
                id: SplitId::new(id),
                position: 0,
            }
        }
    }

    struct TestSplitState(TestSplit);

    impl SourceSplit for TestSplit {
        type State = TestSplitState;

        fn split_id(&self) -> &SplitId {
            &self.id
        }

        fn into_state(self) -> TestSplitState {
            TestSplitState(self)
        }
    }

    impl SplitState for TestSplitState {
        type Split = TestSplit;

        fn split_id(&self) -> &SplitId {
            &self.0.id
        }

        fn to_split(&self) -> TestSplit {
            self.0.clone()
        }
    }

    /// Hands out one pending split per request; signals no-more-splits
    /// once the pool is empty.
    #[derive(Default)]
    struct PoolEnumerator {
        pending: VecDeque<TestSplit>,
        discovered: u64,
        added_back: Vec<(ReaderId, usize)>,
        readers: Vec<ReaderId>,
        completed: Vec<u64>,
        fail_on_event: bool,
    }

    impl SplitEnumerator for PoolEnumerator {
        type Split = TestSplit;
        type State = u64;

        fn start(&mut self, _ctx: &mut EnumeratorContext<Self>) -> Result<()> {
            Ok(())
        }

        fn handle_split_request(
            &mut self,
            ctx: &mut EnumeratorContext<Self>,
            reader: ReaderId,
            _location: Option<&str>,
        ) -> Result<()> {
            match self.pending.pop_front() {
                Some(split) => ctx.assign_split(split, reader),
                None => ctx.signal_no_more_splits(reader),
            }
        }

        fn add_splits_back(
            &mut self,
            _ctx: &mut EnumeratorContext<Self>,
            splits: Vec<TestSplit>,
            reader: ReaderId,
        ) -> Result<()> {
            self.added_back.push((reader, splits.len()));
            for split in splits.into_iter().rev() {
                self.pending.push_front(split);
            }
            Ok(())
        }

        fn add_reader(&mut self, _ctx: &mut EnumeratorContext<Self>, reader: ReaderId) -> Result<()> {
            self.readers.push(reader);
            Ok(())
        }

        fn handle_source_event(
            &mut self,
            _ctx: &mut EnumeratorContext<Self>,
            _reader: ReaderId,
            _event: SourceEvent,
        ) -> Result<()> {
            if self.fail_on_event {
                return Err(SourceError::Enumerator("boom".into()));
            }
            Ok(())
        }

        fn snapshot_state(
            &mut self,
            _checkpoint_id: u64,
        ) -> Result<EnumeratorCheckpoint<u64, TestSplit>> {
            Ok(EnumeratorCheckpoint::new(
                self.discovered,
                self.pending.iter().cloned().collect(),
            ))
        }

        fn notify_checkpoint_complete(&mut self, checkpoint_id: u64) {
            self.completed.push(checkpoint_id);
        }
    }

    fn coordinator(
        splits: &[&str],
        parallelism: usize,
    ) -> (SourceCoordinator<PoolEnumerator>, CoordinatorHandle<PoolEnumerator>) {
        let pending: VecDeque<TestSplit> = splits.iter().map(|s| TestSplit::new(s)).collect();
        let config = CoordinatorConfig { parallelism };
        SourceCoordinator::new(&config, JsonSerializer::shared(1), move |_ctx| {
            Ok(PoolEnumerator {
                discovered: pending.len() as u64,
                pending,
                ..PoolEnumerator::default()
            })
        })
        .unwrap()
    }

    fn request(reader: u32) -> ReaderRequest {
        ReaderRequest::SplitRequest {
            reader: ReaderId(reader),
            location: None,
        }
    }

    async fn next_event(events: &mut ReaderEvents<TestSplit>) -> ReaderEvent<TestSplit> {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_split_requests_are_served_in_order() {
        let (coordinator, handle) = coordinator(&["a", "b"], 1);
        let task = coordinator.spawn();
        let mut events = handle
            .register_reader(ReaderInfo::new(ReaderId(0)), Vec::new())
            .await
            .unwrap();
        let gateway = handle.gateway();

        for _ in 0..3 {
            gateway.send(request(0)).unwrap();
        }
        assert_eq!(
            next_event(&mut events).await,
            ReaderEvent::AddSplits(vec![TestSplit::new("a")])
        );
        assert_eq!(
            next_event(&mut events).await,
            ReaderEvent::AddSplits(vec![TestSplit::new("b")])
        );
        assert_eq!(next_event(&mut events).await, ReaderEvent::NoMoreSplits);

        // Idempotent: a further request sends nothing.
        gateway.send(request(0)).unwrap();
        handle.close().await;
        task.await.unwrap().unwrap();
        assert!(events.recv().await.is_none());

        let metrics = handle.metrics().snapshot();
        assert_eq!(metrics.assigned_splits, 2);
        assert_eq!(metrics.registered_readers, 1);
    }

    #[tokio::test]
    async fn test_request_from_unregistered_reader_is_dropped() {
        let (coordinator, handle) = coordinator(&["a"], 2);
        let task = coordinator.spawn();
        let mut events = handle
            .register_reader(ReaderInfo::new(ReaderId(0)), Vec::new())
            .await
            .unwrap();

        handle.gateway().send(request(1)).unwrap();
        handle.gateway().send(request(0)).unwrap();
        // "a" went to reader 0: the request of reader 1 did not consume it.
        assert_eq!(
            next_event(&mut events).await,
            ReaderEvent::AddSplits(vec![TestSplit::new("a")])
        );
        handle.close().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_double_registration_rejected() {
        let (coordinator, handle) = coordinator(&[], 1);
        let task = coordinator.spawn();
        let info = ReaderInfo::new(ReaderId(0));
        handle.register_reader(info.clone(), Vec::new()).await.unwrap();
        let err = handle.register_reader(info, Vec::new()).await.unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(handle.registered_readers(), vec![ReaderId(0)]);
        handle.close().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_assignment_rejected() {
        let (coordinator, handle) = coordinator(&[], 2);
        let task = coordinator.spawn();
        let mut e0 = handle
            .register_reader(ReaderInfo::new(ReaderId(0)), Vec::new())
            .await
            .unwrap();
        let _e1 = handle
            .register_reader(ReaderInfo::new(ReaderId(1)), Vec::new())
            .await
            .unwrap();

        let (tx, rx) = oneshot::channel();
        handle
            .post(CoordinatorMessage::Callback(Box::new(
                move |_e: &mut PoolEnumerator, ctx: &mut EnumeratorContext<PoolEnumerator>| -> Result<()> {
                    ctx.assign_split(TestSplit::new("x"), ReaderId(0))?;
                    let second = ctx.assign_split(TestSplit::new("x"), ReaderId(1));
                    let unknown = ctx.assign_split(TestSplit::new("y"), ReaderId(7));
                    let both = ctx.assign_splits(
                        SplitsAssignment::new()
                            .with(ReaderId(0), TestSplit::new("z"))
                            .with(ReaderId(1), TestSplit::new("z")),
                    );
                    let _ = tx.send((second, unknown, both, ctx.owner_of(&SplitId::new("z"))));
                    Ok(())
                },
            )))
            .unwrap();
        let (second, unknown, both, z_owner) = rx.await.unwrap();
        assert!(matches!(
            second,
            Err(SourceError::DuplicateAssignment { owner: ReaderId(0), .. })
        ));
        assert!(matches!(unknown, Err(SourceError::UnknownReader(ReaderId(7)))));
        assert!(both.is_err());
        assert_eq!(z_owner, None);

        assert_eq!(
            next_event(&mut e0).await,
            ReaderEvent::AddSplits(vec![TestSplit::new("x")])
        );
        handle.close().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_call_async_delivers_on_mailbox() {
        let (coordinator, handle) = coordinator(&[], 1);
        let task = coordinator.spawn();
        let mut events = handle
            .register_reader(ReaderInfo::new(ReaderId(0)), Vec::new())
            .await
            .unwrap();

        handle
            .post(CoordinatorMessage::Callback(Box::new(
                |_e: &mut PoolEnumerator, ctx: &mut EnumeratorContext<PoolEnumerator>| -> Result<()> {
                    ctx.call_async(
                        || Ok(vec![TestSplit::new("found-0"), TestSplit::new("found-1")]),
                        |e: &mut PoolEnumerator, ctx: &mut EnumeratorContext<PoolEnumerator>, found: Result<Vec<TestSplit>>| {
                            e.pending.extend(found?);
                            let split = e.pending.pop_front();
                            if let Some(split) = split {
                                ctx.assign_split(split, ReaderId(0))?;
                            }
                            Ok(())
                        },
                    );
                    Ok(())
                },
            )))
            .unwrap();

        assert_eq!(
            next_event(&mut events).await,
            ReaderEvent::AddSplits(vec![TestSplit::new("found-0")])
        );
        handle.close().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_valve_holds_events_until_resume() {
        let (coordinator, handle) = coordinator(&["a", "b"], 1);
        let task = coordinator.spawn();
        let mut events = handle
            .register_reader(ReaderInfo::new(ReaderId(0)), Vec::new())
            .await
            .unwrap();
        let gateway = handle.gateway();

        let bytes = handle.checkpoint(1).await.unwrap();
        assert_eq!(&bytes[..4], &1u32.to_be_bytes());

        gateway.send(request(0)).unwrap();
        // Round-trip through the mailbox so the request has been handled.
        let _other = handle
            .register_reader(ReaderInfo::new(ReaderId(1)), Vec::new())
            .await
            .unwrap();
        assert!(events.try_recv().is_err());

        // Resuming an older checkpoint leaves the valve closed.
        handle.resume_event_delivery(0).unwrap();
        let _third = handle
            .register_reader(ReaderInfo::new(ReaderId(2)), Vec::new())
            .await
            .unwrap();
        assert!(events.try_recv().is_err());

        handle.resume_event_delivery(1).unwrap();
        assert_eq!(
            next_event(&mut events).await,
            ReaderEvent::AddSplits(vec![TestSplit::new("a")])
        );
        handle.close().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_overlapping_checkpoint_releases_held_events() {
        let (coordinator, handle) = coordinator(&["a", "b"], 1);
        let task = coordinator.spawn();
        let mut events = handle
            .register_reader(ReaderInfo::new(ReaderId(0)), Vec::new())
            .await
            .unwrap();

        handle.checkpoint(1).await.unwrap();
        handle.gateway().send(request(0)).unwrap();
        // Checkpoint 2 starts before delivery for checkpoint 1 resumed.
        let bytes = handle.checkpoint(2).await.unwrap();

        let serializer: CheckpointSerializer<PoolEnumerator> = JsonSerializer::shared(1);
        let decoded = deserialize_versioned(&*serializer, &bytes).unwrap();
        assert_eq!(decoded.pending_splits, vec![TestSplit::new("b")]);
        // "a" left the enumerator snapshot, so it reaches the reader before
        // the reader snapshots checkpoint 2.
        assert_eq!(
            events.try_recv().unwrap(),
            ReaderEvent::AddSplits(vec![TestSplit::new("a")])
        );

        // Events after snapshot 2 are still held until it resumes.
        handle.gateway().send(request(0)).unwrap();
        let _other = handle
            .register_reader(ReaderInfo::new(ReaderId(1)), Vec::new())
            .await
            .unwrap();
        assert!(events.try_recv().is_err());
        handle.resume_event_delivery(2).unwrap();
        assert_eq!(
            next_event(&mut events).await,
            ReaderEvent::AddSplits(vec![TestSplit::new("b")])
        );
        handle.close().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_checkpoint_restore_round_trip() {
        let (coordinator, handle) = coordinator(&["a", "b", "c"], 1);
        let task = coordinator.spawn();
        let _events = handle
            .register_reader(ReaderInfo::new(ReaderId(0)), Vec::new())
            .await
            .unwrap();
        handle.gateway().send(request(0)).unwrap();
        let bytes = handle.checkpoint(4).await.unwrap();
        handle.notify_checkpoint_complete(4).unwrap();
        handle.close().await;
        task.await.unwrap().unwrap();

        let serializer: CheckpointSerializer<PoolEnumerator> = JsonSerializer::shared(1);
        let decoded = deserialize_versioned(&*serializer, &bytes).unwrap();
        assert_eq!(decoded.state, 3);
        assert_eq!(
            decoded.pending_splits,
            vec![TestSplit::new("b"), TestSplit::new("c")]
        );

        let wrong: CheckpointSerializer<PoolEnumerator> = JsonSerializer::shared(2);
        assert!(matches!(
            deserialize_versioned(&*wrong, &bytes),
            Err(SourceError::UnsupportedVersion { found: 1, supported: 2 })
        ));
    }

    #[tokio::test]
    async fn test_reader_failure_returns_uncheckpointed_splits() {
        let (coordinator, handle) = coordinator(&["a", "b", "c"], 1);
        let task = coordinator.spawn();
        let mut events = handle
            .register_reader(ReaderInfo::new(ReaderId(0)), Vec::new())
            .await
            .unwrap();
        let gateway = handle.gateway();

        gateway.send(request(0)).unwrap();
        next_event(&mut events).await;
        handle.checkpoint(1).await.unwrap();
        handle.resume_event_delivery(1).unwrap();
        gateway.send(request(0)).unwrap();
        next_event(&mut events).await;

        // Reader restarts from checkpoint 1, which holds "a" at position 5.
        let restored = ReaderCheckpoint {
            checkpoint_id: 1,
            splits: vec![TestSplit {
                id: SplitId::new("a"),
                position: 5,
            }],
        };
        handle.reader_failed(ReaderId(0), Some(restored)).await.unwrap();
        assert!(handle.registered_readers().is_empty());
        assert_eq!(handle.metrics().snapshot().splits_added_back, 2);

        // Ownership was released: the new attempt gets "a" (from its
        // checkpointed position) and "b" again.
        let mut events = handle
            .register_reader(ReaderInfo::new(ReaderId(0)), Vec::new())
            .await
            .unwrap();
        gateway.send(request(0)).unwrap();
        gateway.send(request(0)).unwrap();
        assert_eq!(
            next_event(&mut events).await,
            ReaderEvent::AddSplits(vec![TestSplit {
                id: SplitId::new("a"),
                position: 5,
            }])
        );
        assert_eq!(
            next_event(&mut events).await,
            ReaderEvent::AddSplits(vec![TestSplit::new("b")])
        );
        handle.close().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_restored_ownership_enforced_at_registration() {
        let (coordinator, handle) = coordinator(&[], 2);
        let task = coordinator.spawn();
        handle
            .register_reader(ReaderInfo::new(ReaderId(0)), vec![SplitId::new("a")])
            .await
            .unwrap();
        let err = handle
            .register_reader(ReaderInfo::new(ReaderId(1)), vec![SplitId::new("a")])
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::DuplicateAssignment { .. }));
        handle.close().await;
        task.await.unwrap().unwrap();
    }

    async fn owner_of(handle: &CoordinatorHandle<PoolEnumerator>, split: &str) -> Option<ReaderId> {
        let split = SplitId::new(split);
        let (tx, rx) = oneshot::channel();
        handle
            .post(CoordinatorMessage::Callback(Box::new(
                move |_e: &mut PoolEnumerator, ctx: &mut EnumeratorContext<PoolEnumerator>| -> Result<()> {
                    let _ = tx.send(ctx.owner_of(&split));
                    Ok(())
                },
            )))
            .unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_finished_splits_release_ownership() {
        let (coordinator, handle) = coordinator(&["a"], 2);
        let task = coordinator.spawn();
        let mut events = handle
            .register_reader(ReaderInfo::new(ReaderId(0)), Vec::new())
            .await
            .unwrap();
        let _e1 = handle
            .register_reader(ReaderInfo::new(ReaderId(1)), Vec::new())
            .await
            .unwrap();
        let gateway = handle.gateway();
        gateway.send(request(0)).unwrap();
        assert_eq!(
            next_event(&mut events).await,
            ReaderEvent::AddSplits(vec![TestSplit::new("a")])
        );
        assert_eq!(owner_of(&handle, "a").await, Some(ReaderId(0)));

        // Only the owner can release a split.
        gateway
            .send(ReaderRequest::SplitsFinished {
                reader: ReaderId(1),
                splits: vec![SplitId::new("a")],
            })
            .unwrap();
        assert_eq!(owner_of(&handle, "a").await, Some(ReaderId(0)));

        gateway
            .send(ReaderRequest::SplitsFinished {
                reader: ReaderId(0),
                splits: vec![SplitId::new("a"), SplitId::new("unknown")],
            })
            .unwrap();
        assert_eq!(owner_of(&handle, "a").await, None);

        handle.close().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_enumerator_error_fails_coordinator() {
        let config = CoordinatorConfig { parallelism: 1 };
        let (coordinator, handle) =
            SourceCoordinator::new(&config, JsonSerializer::shared(1), |_ctx| {
                Ok(PoolEnumerator {
                    fail_on_event: true,
                    ..PoolEnumerator::default()
                })
            })
            .unwrap();
        let task = coordinator.spawn();
        handle
            .register_reader(ReaderInfo::new(ReaderId(0)), Vec::new())
            .await
            .unwrap();
        handle
            .gateway()
            .send(ReaderRequest::SourceEvent {
                reader: ReaderId(0),
                event: SourceEvent::new("x"),
            })
            .unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SourceError::Enumerator(_)));
        assert!(matches!(
            handle.checkpoint(1).await,
            Err(SourceError::CoordinatorClosed)
        ));
    }

    #[tokio::test]
    async fn test_zero_parallelism_rejected() {
        let config = CoordinatorConfig { parallelism: 0 };
        let result = SourceCoordinator::new(&config, JsonSerializer::shared(1), |_ctx| {
            Ok(PoolEnumerator::default())
        });
        assert!(matches!(result, Err(SourceError::Config(_))));
    }
}
