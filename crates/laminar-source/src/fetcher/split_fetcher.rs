//! A single fetcher task: one [`SplitReader`], a disjoint split subset.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{FetchEvent, SplitReader, SplitsChange};
use crate::config::SourceReaderConfig;
use crate::error::SourceError;
use crate::event::SourceEvent;
use crate::split::{ReaderId, SourceSplit, SplitId};

/// Command from the fetcher manager to a fetcher task.
#[derive(Debug)]
pub enum FetcherCommand<S> {
    /// Take ownership of new splits.
    AddSplits(Vec<S>),
    /// Drop splits (reassignment or shutdown).
    RemoveSplits(Vec<SplitId>),
    /// Stop or resume fetching from splits.
    PauseOrResume {
        /// Splits to pause.
        pause: Vec<SplitId>,
        /// Splits to resume.
        resume: Vec<SplitId>,
    },
    /// Connector event to forward to the split reader.
    SourceEvent(SourceEvent),
}

impl<S> FetcherCommand<S> {
    /// Whether a pending `fetch()` may still read from splits this command
    /// takes away. Additions, resumes and events apply on the next fetch.
    fn interrupts_fetch(&self) -> bool {
        match self {
            Self::RemoveSplits(ids) => !ids.is_empty(),
            Self::PauseOrResume { pause, .. } => !pause.is_empty(),
            Self::AddSplits(_) | Self::SourceEvent(_) => false,
        }
    }
}

/// Handle to a running fetcher task, held by the manager.
#[derive(Debug)]
pub struct FetcherHandle<S> {
    /// Fetcher identifier, unique per reader.
    pub id: u64,
    commands: mpsc::UnboundedSender<FetcherCommand<S>>,
    wakeup: Arc<Notify>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl<S> FetcherHandle<S> {
    /// Enqueues a command. Removals and pauses also interrupt a pending
    /// `fetch()`.
    ///
    /// Returns `false` if the task has already stopped.
    pub fn send(&self, command: FetcherCommand<S>) -> bool {
        let interrupt = command.interrupts_fetch();
        let sent = self.commands.send(command).is_ok();
        if interrupt {
            self.wakeup.notify_one();
        }
        sent
    }

    /// Signals the task to stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Whether the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the task to exit.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            tracing::warn!(fetcher = self.id, error = %e, "Fetcher task panicked");
        }
    }

    /// Handle that aborts the task without waiting for `close()`.
    #[must_use]
    pub fn abort_handle(&self) -> tokio::task::AbortHandle {
        self.join.abort_handle()
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    empty_interval: Duration,
}

impl From<&SourceReaderConfig> for RetryPolicy {
    fn from(config: &SourceReaderConfig) -> Self {
        Self {
            max_retries: config.fetch_max_retries,
            initial_backoff: config.fetch_retry_backoff,
            max_backoff: config.fetch_retry_max_backoff,
            empty_interval: config.empty_fetch_interval,
        }
    }
}

struct SplitFetcher<R: SplitReader> {
    id: u64,
    reader_id: ReaderId,
    split_reader: R,
    commands: mpsc::UnboundedReceiver<FetcherCommand<R::Split>>,
    wakeup: Arc<Notify>,
    cancel: CancellationToken,
    queue: mpsc::Sender<FetchEvent<R::Record>>,
    policy: RetryPolicy,
    assigned: BTreeSet<SplitId>,
    paused: BTreeSet<SplitId>,
}

/// Spawns a fetcher task around `split_reader`, feeding `queue`.
#[must_use]
pub fn spawn_split_fetcher<R: SplitReader>(
    id: u64,
    reader_id: ReaderId,
    split_reader: R,
    queue: mpsc::Sender<FetchEvent<R::Record>>,
    config: &SourceReaderConfig,
) -> FetcherHandle<R::Split> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let wakeup = Arc::new(Notify::new());
    let cancel = CancellationToken::new();

    let fetcher = SplitFetcher {
        id,
        reader_id,
        split_reader,
        commands: cmd_rx,
        wakeup: Arc::clone(&wakeup),
        cancel: cancel.clone(),
        queue,
        policy: RetryPolicy::from(config),
        assigned: BTreeSet::new(),
        paused: BTreeSet::new(),
    };
    let join = tokio::spawn(fetcher.run());

    FetcherHandle {
        id,
        commands: cmd_tx,
        wakeup,
        cancel,
        join,
    }
}

enum Step {
    Continue,
    Stop,
}

impl<R: SplitReader> SplitFetcher<R> {
    async fn run(mut self) {
        tracing::debug!(reader = %self.reader_id, fetcher = self.id, "Fetcher started");
        let mut failures = 0u32;
        let mut backoff = self.policy.initial_backoff;

        loop {
            if let Step::Stop = self.drain_commands().await {
                break;
            }

            if !self.has_fetchable_splits() {
                tokio::select! {
                    biased;

                    () = self.cancel.cancelled() => break,

                    cmd = self.commands.recv() => match cmd {
                        Some(cmd) => {
                            if let Step::Stop = self.apply(cmd).await {
                                break;
                            }
                        }
                        None => break,
                    },
                }
                continue;
            }

            let fetched = tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                // Removal or pause: drop the in-flight fetch and re-plan.
                () = self.wakeup.notified() => continue,

                result = self.split_reader.fetch() => result,
            };

            match fetched {
                Ok(batch) => {
                    failures = 0;
                    backoff = self.policy.initial_backoff;
                    for split in batch.finished_splits() {
                        self.assigned.remove(split);
                        self.paused.remove(split);
                    }
                    if batch.is_empty() {
                        if !self.pause(self.policy.empty_interval).await {
                            break;
                        }
                        continue;
                    }
                    let event = FetchEvent::Records {
                        fetcher: self.id,
                        batch,
                    };
                    if !self.deliver(event).await {
                        break;
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures > self.policy.max_retries {
                        tracing::error!(
                            reader = %self.reader_id,
                            fetcher = self.id,
                            attempts = failures,
                            error = %e,
                            "Fetch failed, giving up"
                        );
                        let event = FetchEvent::Failed {
                            fetcher: self.id,
                            error: SourceError::FetchFailed {
                                fetcher: self.id,
                                attempts: failures,
                                message: e.to_string(),
                            },
                        };
                        self.deliver(event).await;
                        break;
                    }
                    tracing::warn!(
                        reader = %self.reader_id,
                        fetcher = self.id,
                        attempt = failures,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Fetch failed, retrying"
                    );
                    if !self.pause(backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(self.policy.max_backoff);
                }
            }
        }

        if let Err(e) = self.split_reader.close().await {
            tracing::warn!(fetcher = self.id, error = %e, "Split reader close failed");
        }
        tracing::debug!(reader = %self.reader_id, fetcher = self.id, "Fetcher stopped");
    }

    fn has_fetchable_splits(&self) -> bool {
        self.assigned.iter().any(|s| !self.paused.contains(s))
    }

    async fn drain_commands(&mut self) -> Step {
        loop {
            match self.commands.try_recv() {
                Ok(cmd) => {
                    if let Step::Stop = self.apply(cmd).await {
                        return Step::Stop;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return Step::Continue,
                Err(mpsc::error::TryRecvError::Disconnected) => return Step::Stop,
            }
        }
    }

    async fn apply(&mut self, cmd: FetcherCommand<R::Split>) -> Step {
        let result = match cmd {
            FetcherCommand::AddSplits(splits) => {
                for split in &splits {
                    self.assigned.insert(split.split_id().clone());
                }
                self.split_reader
                    .handle_splits_change(SplitsChange::Add(splits))
            }
            FetcherCommand::RemoveSplits(ids) => {
                for id in &ids {
                    self.assigned.remove(id);
                    self.paused.remove(id);
                }
                self.split_reader
                    .handle_splits_change(SplitsChange::Remove(ids))
            }
            FetcherCommand::PauseOrResume { pause, resume } => {
                for id in &resume {
                    self.paused.remove(id);
                }
                for id in &pause {
                    if self.assigned.contains(id) {
                        self.paused.insert(id.clone());
                    }
                }
                self.split_reader.pause_or_resume_splits(&pause, &resume);
                Ok(())
            }
            FetcherCommand::SourceEvent(event) => {
                self.split_reader.handle_source_event(&event);
                Ok(())
            }
        };

        match result {
            Ok(()) => Step::Continue,
            Err(error) => {
                tracing::error!(fetcher = self.id, error = %error, "Split change rejected");
                self.deliver(FetchEvent::Failed {
                    fetcher: self.id,
                    error,
                })
                .await;
                Step::Stop
            }
        }
    }

    /// Sends to the reader; blocks while the queue is full. Returns `false`
    /// on shutdown or when the reader is gone.
    async fn deliver(&mut self, event: FetchEvent<R::Record>) -> bool {
        tokio::select! {
            biased;

            () = self.cancel.cancelled() => false,

            sent = self.queue.send(event) => sent.is_ok(),
        }
    }

    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            biased;

            () = self.cancel.cancelled() => false,

            () = tokio::time::sleep(duration) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::error::Result;
    use crate::fetcher::RecordsBySplits;
    use crate::split::SplitState;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestSplit {
        id: SplitId,
        values: Vec<u32>,
    }

    impl SourceSplit for TestSplit {
        type State = TestSplit;
        fn split_id(&self) -> &SplitId {
            &self.id
        }
        fn into_state(self) -> Self::State {
            self
        }
    }

    impl SplitState for TestSplit {
        type Split = TestSplit;
        fn split_id(&self) -> &SplitId {
            &self.id
        }
        fn to_split(&self) -> Self::Split {
            self.clone()
        }
    }

    /// Emits one record per fetch; fails the first `failures` fetches.
    struct TestReader {
        splits: VecDeque<TestSplit>,
        failures: u32,
    }

    #[async_trait]
    impl SplitReader for TestReader {
        type Split = TestSplit;
        type Record = u32;

        async fn fetch(&mut self) -> Result<RecordsBySplits<u32>> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(SourceError::SplitReader("flaky".into()));
            }
            let mut batch = RecordsBySplits::new();
            if let Some(split) = self.splits.front_mut() {
                if split.values.is_empty() {
                    let done = self.splits.pop_front().map(|s| s.id);
                    if let Some(id) = done {
                        batch.finish(id);
                    }
                } else {
                    let value = split.values.remove(0);
                    batch.add(&split.id, value);
                }
            }
            Ok(batch)
        }

        fn handle_splits_change(&mut self, change: SplitsChange<TestSplit>) -> Result<()> {
            match change {
                SplitsChange::Add(splits) => self.splits.extend(splits),
                SplitsChange::Remove(ids) => self.splits.retain(|s| !ids.contains(&s.id)),
            }
            Ok(())
        }
    }

    fn config() -> SourceReaderConfig {
        SourceReaderConfig {
            fetch_retry_backoff: Duration::from_millis(1),
            fetch_retry_max_backoff: Duration::from_millis(4),
            empty_fetch_interval: Duration::from_millis(1),
            ..SourceReaderConfig::default()
        }
    }

    fn split(id: &str, values: &[u32]) -> TestSplit {
        TestSplit {
            id: SplitId::new(id),
            values: values.to_vec(),
        }
    }

    async fn drain(rx: &mut mpsc::Receiver<FetchEvent<u32>>, until_finished: usize) -> Vec<u32> {
        let mut values = Vec::new();
        let mut finished = 0;
        while finished < until_finished {
            match rx.recv().await {
                Some(FetchEvent::Records { batch, .. }) => {
                    finished += batch.finished_splits().len();
                    let (records, _) = batch.into_parts();
                    values.extend(records.into_iter().flat_map(|(_, r)| r));
                }
                Some(FetchEvent::Failed { error, .. }) => panic!("unexpected failure: {error}"),
                None => break,
            }
        }
        values
    }

    #[tokio::test]
    async fn test_fetcher_reads_splits_to_end() {
        let (tx, mut rx) = mpsc::channel(4);
        let reader = TestReader {
            splits: VecDeque::new(),
            failures: 0,
        };
        let handle = spawn_split_fetcher(0, ReaderId(0), reader, tx, &config());
        assert!(handle.send(FetcherCommand::AddSplits(vec![
            split("a", &[1, 2]),
            split("b", &[3]),
        ])));

        let values = drain(&mut rx, 2).await;
        assert_eq!(values, vec![1, 2, 3]);

        handle.shutdown();
        handle.join().await;
    }

    #[tokio::test]
    async fn test_fetcher_retries_then_succeeds() {
        let (tx, mut rx) = mpsc::channel(4);
        let reader = TestReader {
            splits: VecDeque::new(),
            failures: 2,
        };
        let handle = spawn_split_fetcher(7, ReaderId(0), reader, tx, &config());
        handle.send(FetcherCommand::AddSplits(vec![split("a", &[9])]));
        assert_eq!(drain(&mut rx, 1).await, vec![9]);
        handle.shutdown();
        handle.join().await;
    }

    #[tokio::test]
    async fn test_fetcher_gives_up_after_retries() {
        let (tx, mut rx) = mpsc::channel(4);
        let reader = TestReader {
            splits: VecDeque::new(),
            failures: 100,
        };
        let handle = spawn_split_fetcher(3, ReaderId(1), reader, tx, &config());
        handle.send(FetcherCommand::AddSplits(vec![split("a", &[1])]));

        match rx.recv().await {
            Some(FetchEvent::Failed { fetcher, error }) => {
                assert_eq!(fetcher, 3);
                assert!(matches!(
                    error,
                    SourceError::FetchFailed { attempts: 4, .. }
                ));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        handle.join().await;
    }

    #[tokio::test]
    async fn test_fetcher_blocks_on_full_queue_and_shuts_down() {
        let (tx, mut rx) = mpsc::channel(1);
        let reader = TestReader {
            splits: VecDeque::new(),
            failures: 0,
        };
        let handle = spawn_split_fetcher(0, ReaderId(0), reader, tx, &config());
        handle.send(FetcherCommand::AddSplits(vec![split("a", &[1, 2, 3, 4])]));

        // One batch fits the queue, the fetcher then blocks in send.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        assert!(rx.recv().await.is_some());

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .expect("blocked fetcher must observe shutdown");
    }

    #[tokio::test]
    async fn test_paused_split_not_fetched() {
        let (tx, mut rx) = mpsc::channel(4);
        let reader = TestReader {
            splits: VecDeque::new(),
            failures: 0,
        };
        let handle = spawn_split_fetcher(0, ReaderId(0), reader, tx, &config());
        handle.send(FetcherCommand::PauseOrResume {
            pause: vec![SplitId::new("a")],
            resume: vec![],
        });
        handle.send(FetcherCommand::AddSplits(vec![split("a", &[1])]));
        handle.send(FetcherCommand::PauseOrResume {
            pause: vec![SplitId::new("a")],
            resume: vec![],
        });

        let nothing = tokio::time::timeout(Duration::from_millis(30), rx.recv()).await;
        assert!(nothing.is_err(), "paused split must not be fetched");

        handle.send(FetcherCommand::PauseOrResume {
            pause: vec![],
            resume: vec![SplitId::new("a")],
        });
        assert_eq!(drain(&mut rx, 1).await, vec![1]);
        handle.shutdown();
        handle.join().await;
    }

    /// [`TestReader`] with a delay in every fetch; counts started fetches.
    struct SlowReader {
        inner: TestReader,
        started: Arc<AtomicU32>,
        events: Arc<AtomicU32>,
    }

    #[async_trait]
    impl SplitReader for SlowReader {
        type Split = TestSplit;
        type Record = u32;

        async fn fetch(&mut self) -> Result<RecordsBySplits<u32>> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.inner.fetch().await
        }

        fn handle_splits_change(&mut self, change: SplitsChange<TestSplit>) -> Result<()> {
            self.inner.handle_splits_change(change)
        }

        fn handle_source_event(&mut self, _event: &SourceEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn slow_reader(started: &Arc<AtomicU32>, events: &Arc<AtomicU32>) -> SlowReader {
        SlowReader {
            inner: TestReader {
                splits: VecDeque::new(),
                failures: 0,
            },
            started: Arc::clone(started),
            events: Arc::clone(events),
        }
    }

    #[tokio::test]
    async fn test_source_event_keeps_in_flight_fetch() {
        let (tx, mut rx) = mpsc::channel(4);
        let started = Arc::new(AtomicU32::new(0));
        let events = Arc::new(AtomicU32::new(0));
        let reader = slow_reader(&started, &events);
        let handle = spawn_split_fetcher(0, ReaderId(0), reader, tx, &config());
        handle.send(FetcherCommand::AddSplits(vec![split("a", &[1, 2, 3])]));

        let first = rx.recv().await;
        assert!(matches!(first, Some(FetchEvent::Records { .. })));
        // Second fetch is now sleeping inside the reader.
        tokio::time::sleep(Duration::from_millis(5)).await;
        for i in 0..5u8 {
            assert!(handle.send(FetcherCommand::SourceEvent(SourceEvent::new(vec![i]))));
        }
        assert!(handle.send(FetcherCommand::AddSplits(vec![split("b", &[4])])));

        let values = drain(&mut rx, 2).await;
        assert_eq!(values, vec![2, 3, 4]);
        assert_eq!(events.load(Ordering::SeqCst), 5);
        // Four record fetches plus one finishing fetch per split.
        assert_eq!(started.load(Ordering::SeqCst), 6);

        handle.shutdown();
        handle.join().await;
    }

    #[tokio::test]
    async fn test_pause_interrupts_in_flight_fetch() {
        let (tx, mut rx) = mpsc::channel(4);
        let started = Arc::new(AtomicU32::new(0));
        let reader = slow_reader(&started, &Arc::new(AtomicU32::new(0)));
        let handle = spawn_split_fetcher(0, ReaderId(0), reader, tx, &config());
        handle.send(FetcherCommand::AddSplits(vec![split("a", &[1, 2])]));
        assert!(rx.recv().await.is_some());

        tokio::time::sleep(Duration::from_millis(5)).await;
        handle.send(FetcherCommand::PauseOrResume {
            pause: vec![SplitId::new("a")],
            resume: vec![],
        });
        let nothing = tokio::time::timeout(Duration::from_millis(60), rx.recv()).await;
        assert!(nothing.is_err(), "pause must drop the in-flight fetch");
        assert_eq!(started.load(Ordering::SeqCst), 2);

        handle.shutdown();
        handle.join().await;
    }
}
