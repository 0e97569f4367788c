//! Fetcher lifecycle and split-to-fetcher placement.
//!
//! The manager lives on the reader's owning task. It spawns fetchers lazily
//! when splits arrive, keeps a per-fetcher count of assigned splits, and shuts
//! down fetchers that have held no split for longer than the idle timeout.
//! All bookkeeping happens on the reader task, so placement and idle shutdown
//! never race.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use super::split_fetcher::{spawn_split_fetcher, FetcherCommand, FetcherHandle};
use super::{FetchEvent, SplitReader};
use crate::config::{FetcherMode, SourceReaderConfig};
use crate::event::SourceEvent;
use crate::split::{ReaderId, SourceSplit, SplitId};

type ReaderFactory<R> = dyn Fn() -> R + Send + Sync;

struct ManagedFetcher<S> {
    handle: FetcherHandle<S>,
    splits: usize,
    idle_since: Option<Instant>,
}

/// Owns the fetchers of one reader.
pub struct SplitFetcherManager<R: SplitReader> {
    reader_id: ReaderId,
    factory: Arc<ReaderFactory<R>>,
    config: SourceReaderConfig,
    queue: mpsc::Sender<FetchEvent<R::Record>>,
    fetchers: BTreeMap<u64, ManagedFetcher<R::Split>>,
    owners: HashMap<SplitId, u64>,
    next_id: u64,
}

impl<R: SplitReader> std::fmt::Debug for SplitFetcherManager<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitFetcherManager")
            .field("reader_id", &self.reader_id)
            .field("mode", &self.config.fetcher_mode)
            .field("fetchers", &self.fetchers.len())
            .field("splits", &self.owners.len())
            .finish_non_exhaustive()
    }
}

impl<R: SplitReader> SplitFetcherManager<R> {
    /// Creates a manager and the receiving end of its element queue.
    pub fn new<F>(
        reader_id: ReaderId,
        factory: F,
        config: SourceReaderConfig,
    ) -> (Self, mpsc::Receiver<FetchEvent<R::Record>>)
    where
        F: Fn() -> R + Send + Sync + 'static,
    {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let manager = Self {
            reader_id,
            factory: Arc::new(factory),
            config,
            queue,
            fetchers: BTreeMap::new(),
            owners: HashMap::new(),
            next_id: 0,
        };
        (manager, rx)
    }

    /// Hands new splits to fetchers according to the fetcher mode.
    pub fn add_splits(&mut self, splits: Vec<R::Split>) {
        let mut per_fetcher: BTreeMap<u64, Vec<R::Split>> = BTreeMap::new();
        for split in splits {
            let target = self.place();
            if let Some(fetcher) = self.fetchers.get_mut(&target) {
                fetcher.splits += 1;
                fetcher.idle_since = None;
            }
            self.owners.insert(split.split_id().clone(), target);
            per_fetcher.entry(target).or_default().push(split);
        }

        for (id, splits) in per_fetcher {
            if let Some(fetcher) = self.fetchers.get(&id) {
                tracing::debug!(
                    reader = %self.reader_id,
                    fetcher = id,
                    splits = splits.len(),
                    "Assigning splits to fetcher"
                );
                if !fetcher.handle.send(FetcherCommand::AddSplits(splits)) {
                    tracing::warn!(reader = %self.reader_id, fetcher = id, "Fetcher already stopped");
                }
            }
        }
    }

    /// Picks (or spawns) the fetcher for one more split.
    fn place(&mut self) -> u64 {
        let least_loaded = self
            .fetchers
            .iter()
            .min_by_key(|(id, f)| (f.splits, **id))
            .map(|(id, f)| (*id, f.splits));

        match (self.config.fetcher_mode, least_loaded) {
            (FetcherMode::Single, Some((id, _))) => id,
            (FetcherMode::Pool, Some((id, load)))
                if load == 0 || self.fetchers.len() >= self.config.fetcher_pool_size =>
            {
                id
            }
            _ => self.spawn_fetcher(),
        }
    }

    fn spawn_fetcher(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let handle = spawn_split_fetcher(
            id,
            self.reader_id,
            (self.factory)(),
            self.queue.clone(),
            &self.config,
        );
        tracing::debug!(reader = %self.reader_id, fetcher = id, "Spawned fetcher");
        self.fetchers.insert(
            id,
            ManagedFetcher {
                handle,
                splits: 0,
                idle_since: None,
            },
        );
        id
    }

    fn release(&mut self, split: &SplitId, now: Instant) -> Option<u64> {
        let id = self.owners.remove(split)?;
        if let Some(fetcher) = self.fetchers.get_mut(&id) {
            fetcher.splits = fetcher.splits.saturating_sub(1);
            if fetcher.splits == 0 {
                fetcher.idle_since = Some(now);
            }
        }
        Some(id)
    }

    /// Releases splits a fetcher reported as finished.
    pub fn on_splits_finished<'a>(&mut self, splits: impl IntoIterator<Item = &'a SplitId>, now: Instant) {
        for split in splits {
            self.release(split, now);
        }
    }

    /// Takes splits away from their fetchers.
    pub fn remove_splits(&mut self, splits: &[SplitId], now: Instant) {
        let mut per_fetcher: BTreeMap<u64, Vec<SplitId>> = BTreeMap::new();
        for split in splits {
            if let Some(id) = self.release(split, now) {
                per_fetcher.entry(id).or_default().push(split.clone());
            }
        }
        for (id, ids) in per_fetcher {
            if let Some(fetcher) = self.fetchers.get(&id) {
                fetcher.handle.send(FetcherCommand::RemoveSplits(ids));
            }
        }
    }

    /// Pauses and resumes splits on whichever fetchers own them.
    pub fn pause_or_resume(&mut self, pause: &[SplitId], resume: &[SplitId]) {
        let mut per_fetcher: BTreeMap<u64, (Vec<SplitId>, Vec<SplitId>)> = BTreeMap::new();
        for split in pause {
            if let Some(id) = self.owners.get(split) {
                per_fetcher.entry(*id).or_default().0.push(split.clone());
            }
        }
        for split in resume {
            if let Some(id) = self.owners.get(split) {
                per_fetcher.entry(*id).or_default().1.push(split.clone());
            }
        }
        for (id, (pause, resume)) in per_fetcher {
            if let Some(fetcher) = self.fetchers.get(&id) {
                fetcher
                    .handle
                    .send(FetcherCommand::PauseOrResume { pause, resume });
            }
        }
    }

    /// Forwards a connector event to every running fetcher.
    pub fn send_source_event(&mut self, event: &SourceEvent) {
        for fetcher in self.fetchers.values() {
            fetcher
                .handle
                .send(FetcherCommand::SourceEvent(event.clone()));
        }
    }

    /// Shuts down fetchers that have been without splits for longer than the
    /// idle timeout. Returns the number of fetchers stopped.
    pub fn maintain(&mut self, now: Instant) -> usize {
        let timeout = self.config.fetcher_idle_timeout;
        let expired: Vec<u64> = self
            .fetchers
            .iter()
            .filter(|(_, f)| {
                f.splits == 0
                    && f.idle_since
                        .is_some_and(|since| now.saturating_duration_since(since) >= timeout)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(fetcher) = self.fetchers.remove(id) {
                tracing::debug!(reader = %self.reader_id, fetcher = id, "Closing idle fetcher");
                fetcher.handle.shutdown();
            }
        }
        expired.len()
    }

    /// Number of running fetchers.
    #[must_use]
    pub fn fetcher_count(&self) -> usize {
        self.fetchers.len()
    }

    /// Fetcher currently owning `split`.
    #[must_use]
    pub fn owner_of(&self, split: &SplitId) -> Option<u64> {
        self.owners.get(split).copied()
    }

    /// Number of splits currently handed to fetchers.
    #[must_use]
    pub fn assigned_split_count(&self) -> usize {
        self.owners.len()
    }

    /// Stops every fetcher and waits up to `timeout` for them to exit.
    /// Fetchers still running after the timeout are aborted.
    pub async fn close(&mut self, timeout: Duration) {
        let fetchers = std::mem::take(&mut self.fetchers);
        self.owners.clear();
        for fetcher in fetchers.values() {
            fetcher.handle.shutdown();
        }

        let handles: Vec<_> = fetchers.into_values().map(|f| f.handle).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let join_all = async {
            for handle in handles {
                handle.join().await;
            }
        };
        if tokio::time::timeout(timeout, join_all).await.is_err() {
            tracing::warn!(
                reader = %self.reader_id,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Fetchers did not stop in time, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::Result;
    use crate::fetcher::{RecordsBySplits, SplitsChange};
    use crate::split::SplitState;

    #[derive(Debug, Clone)]
    struct IdSplit(SplitId);

    impl SourceSplit for IdSplit {
        type State = IdSplit;
        fn split_id(&self) -> &SplitId {
            &self.0
        }
        fn into_state(self) -> Self::State {
            self
        }
    }

    impl SplitState for IdSplit {
        type Split = IdSplit;
        fn split_id(&self) -> &SplitId {
            &self.0
        }
        fn to_split(&self) -> Self::Split {
            self.clone()
        }
    }

    /// Never produces records.
    struct SilentReader;

    #[async_trait]
    impl SplitReader for SilentReader {
        type Split = IdSplit;
        type Record = ();

        async fn fetch(&mut self) -> Result<RecordsBySplits<()>> {
            std::future::pending().await
        }

        fn handle_splits_change(&mut self, _change: SplitsChange<IdSplit>) -> Result<()> {
            Ok(())
        }
    }

    fn splits(ids: &[&str]) -> Vec<IdSplit> {
        ids.iter().map(|id| IdSplit(SplitId::new(id))).collect()
    }

    fn manager(mode: FetcherMode) -> SplitFetcherManager<SilentReader> {
        let config = SourceReaderConfig {
            fetcher_mode: mode,
            fetcher_pool_size: 2,
            fetcher_idle_timeout: Duration::from_millis(50),
            ..SourceReaderConfig::default()
        };
        SplitFetcherManager::new(ReaderId(0), || SilentReader, config).0
    }

    #[tokio::test]
    async fn test_single_mode_uses_one_fetcher() {
        let mut m = manager(FetcherMode::Single);
        m.add_splits(splits(&["a", "b"]));
        m.add_splits(splits(&["c"]));
        assert_eq!(m.fetcher_count(), 1);
        assert_eq!(m.owner_of(&SplitId::new("c")), Some(0));
        m.close(Duration::from_secs(1)).await;
        assert_eq!(m.fetcher_count(), 0);
    }

    #[tokio::test]
    async fn test_per_split_mode() {
        let mut m = manager(FetcherMode::PerSplit);
        m.add_splits(splits(&["a", "b", "c"]));
        assert_eq!(m.fetcher_count(), 3);
        assert_eq!(m.owner_of(&SplitId::new("b")), Some(1));
        m.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_pool_mode_balances() {
        let mut m = manager(FetcherMode::Pool);
        m.add_splits(splits(&["a", "b", "c", "d", "e"]));
        assert_eq!(m.fetcher_count(), 2);
        let on_zero = ["a", "b", "c", "d", "e"]
            .iter()
            .filter(|id| m.owner_of(&SplitId::new(id)) == Some(0))
            .count();
        assert_eq!(on_zero, 3);
        m.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_idle_fetcher_shut_down_after_timeout() {
        let mut m = manager(FetcherMode::PerSplit);
        m.add_splits(splits(&["a", "b"]));
        let start = Instant::now();
        m.on_splits_finished([&SplitId::new("a")], start);

        assert_eq!(m.maintain(start + Duration::from_millis(10)), 0);
        assert_eq!(m.fetcher_count(), 2);
        assert_eq!(m.maintain(start + Duration::from_millis(60)), 1);
        assert_eq!(m.fetcher_count(), 1);
        assert_eq!(m.assigned_split_count(), 1);

        // a new split after shutdown gets a fresh fetcher
        m.add_splits(splits(&["c"]));
        assert_eq!(m.owner_of(&SplitId::new("c")), Some(2));
        m.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_reused_fetcher_not_shut_down() {
        let mut m = manager(FetcherMode::Single);
        m.add_splits(splits(&["a"]));
        let start = Instant::now();
        m.remove_splits(&[SplitId::new("a")], start);
        m.add_splits(splits(&["b"]));
        assert_eq!(m.maintain(start + Duration::from_secs(5)), 0);
        assert_eq!(m.owner_of(&SplitId::new("b")), Some(0));
        m.close(Duration::from_secs(1)).await;
    }
}
