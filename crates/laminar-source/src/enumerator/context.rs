//! The enumerator's view of the runtime: registered readers, split
//! ownership, and delivery of events to readers.
//!
//! Only the coordinator mailbox task touches an [`EnumeratorContext`], so no
//! method here takes a lock on the assignment path.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::tracker::SplitAssignmentTracker;
use super::SplitEnumerator;
use crate::coordinator::CoordinatorMessage;
use crate::error::{Result, SourceError};
use crate::event::{ReaderEvent, SourceEvent};
use crate::metrics::EnumeratorMetrics;
use crate::split::{ReaderId, ReaderInfo, SourceSplit, SplitId};

/// Shared, read-mostly view of the registered readers.
pub type RegisteredReaders = Arc<RwLock<BTreeMap<ReaderId, ReaderInfo>>>;

/// Splits to hand out, per reader. Delivered in reader-id order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitsAssignment<S> {
    assignment: BTreeMap<ReaderId, Vec<S>>,
}

impl<S> Default for SplitsAssignment<S> {
    fn default() -> Self {
        Self {
            assignment: BTreeMap::new(),
        }
    }
}

impl<S> SplitsAssignment<S> {
    /// Creates an empty assignment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one split for `reader`.
    pub fn add(&mut self, reader: ReaderId, split: S) {
        self.assignment.entry(reader).or_default().push(split);
    }

    /// Builder-style [`SplitsAssignment::add`].
    #[must_use]
    pub fn with(mut self, reader: ReaderId, split: S) -> Self {
        self.add(reader, split);
        self
    }

    /// `true` if no split is assigned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assignment.values().all(Vec::is_empty)
    }

    /// Per-reader splits.
    #[must_use]
    pub fn as_map(&self) -> &BTreeMap<ReaderId, Vec<S>> {
        &self.assignment
    }
}

impl<S> From<BTreeMap<ReaderId, Vec<S>>> for SplitsAssignment<S> {
    fn from(assignment: BTreeMap<ReaderId, Vec<S>>) -> Self {
        Self { assignment }
    }
}

type Gateway<S> = mpsc::UnboundedSender<ReaderEvent<S>>;

/// Events held back between an enumerator snapshot and the readers' snapshots.
struct Valve<S> {
    checkpoint_id: u64,
    held: Vec<(ReaderId, ReaderEvent<S>)>,
}

/// Context passed to every [`SplitEnumerator`] callback.
pub struct EnumeratorContext<E: SplitEnumerator> {
    gateways: BTreeMap<ReaderId, Gateway<E::Split>>,
    registered: RegisteredReaders,
    owners: HashMap<SplitId, ReaderId>,
    no_more_splits: BTreeSet<ReaderId>,
    tracker: SplitAssignmentTracker<E::Split>,
    valve: Option<Valve<E::Split>>,
    mailbox: mpsc::WeakUnboundedSender<CoordinatorMessage<E>>,
    cancel: CancellationToken,
    parallelism: usize,
    metrics: Arc<EnumeratorMetrics>,
}

impl<E: SplitEnumerator> std::fmt::Debug for EnumeratorContext<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnumeratorContext")
            .field("readers", &self.gateways.keys().collect::<Vec<_>>())
            .field("owned_splits", &self.owners.len())
            .field("parallelism", &self.parallelism)
            .field("valve_closed", &self.valve.is_some())
            .finish_non_exhaustive()
    }
}

impl<E: SplitEnumerator> EnumeratorContext<E> {
    pub(crate) fn new(
        mailbox: mpsc::WeakUnboundedSender<CoordinatorMessage<E>>,
        parallelism: usize,
        registered: RegisteredReaders,
        metrics: Arc<EnumeratorMetrics>,
    ) -> Self {
        Self {
            gateways: BTreeMap::new(),
            registered,
            owners: HashMap::new(),
            no_more_splits: BTreeSet::new(),
            tracker: SplitAssignmentTracker::new(),
            valve: None,
            mailbox,
            cancel: CancellationToken::new(),
            parallelism,
            metrics,
        }
    }

    /// Assigns splits to readers.
    ///
    /// The whole assignment is validated first; on any violation nothing is
    /// applied. Each named reader then receives exactly one
    /// [`ReaderEvent::AddSplits`], in reader-id order.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::UnknownReader` for an unregistered reader and
    /// `SourceError::DuplicateAssignment` for a split that is already owned
    /// or listed twice.
    pub fn assign_splits(&mut self, assignment: SplitsAssignment<E::Split>) -> Result<()> {
        let mut seen: HashMap<&SplitId, ReaderId> = HashMap::new();
        for (reader, splits) in &assignment.assignment {
            if !self.gateways.contains_key(reader) {
                tracing::error!(reader = %reader, "Assignment to unregistered reader rejected");
                return Err(SourceError::UnknownReader(*reader));
            }
            for split in splits {
                let id = split.split_id();
                let owner = self.owners.get(id).copied().or_else(|| seen.get(id).copied());
                if let Some(owner) = owner {
                    tracing::warn!(
                        reader = %reader,
                        split = %id,
                        owner = %owner,
                        "Duplicate split assignment rejected"
                    );
                    return Err(SourceError::DuplicateAssignment {
                        split: id.clone(),
                        owner,
                    });
                }
                seen.insert(id, *reader);
            }
        }

        for (reader, splits) in assignment.assignment {
            if splits.is_empty() {
                continue;
            }
            for split in &splits {
                self.owners.insert(split.split_id().clone(), reader);
            }
            self.tracker.record_assignment(reader, &splits);
            self.metrics.add_assigned(splits.len());
            tracing::debug!(reader = %reader, count = splits.len(), "Assigning splits");
            self.deliver(reader, ReaderEvent::AddSplits(splits));
        }
        Ok(())
    }

    /// Assigns a single split.
    ///
    /// # Errors
    ///
    /// See [`EnumeratorContext::assign_splits`].
    pub fn assign_split(&mut self, split: E::Split, reader: ReaderId) -> Result<()> {
        self.assign_splits(SplitsAssignment::new().with(reader, split))
    }

    /// Tells `reader` that no more splits will come. Idempotent per reader
    /// attempt.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::UnknownReader` for an unregistered reader.
    pub fn signal_no_more_splits(&mut self, reader: ReaderId) -> Result<()> {
        if !self.gateways.contains_key(&reader) {
            return Err(SourceError::UnknownReader(reader));
        }
        if self.no_more_splits.insert(reader) {
            tracing::debug!(reader = %reader, "Signalling no more splits");
            self.deliver(reader, ReaderEvent::NoMoreSplits);
        }
        Ok(())
    }

    /// Sends a connector event to one reader.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::UnknownReader` for an unregistered reader.
    pub fn send_event_to_reader(&mut self, reader: ReaderId, event: SourceEvent) -> Result<()> {
        if !self.gateways.contains_key(&reader) {
            return Err(SourceError::UnknownReader(reader));
        }
        self.deliver(reader, ReaderEvent::SourceEvent(event));
        Ok(())
    }

    /// Currently registered readers.
    #[must_use]
    pub fn registered_readers(&self) -> BTreeMap<ReaderId, ReaderInfo> {
        self.registered.read().clone()
    }

    /// Whether `reader` is registered.
    #[must_use]
    pub fn is_registered(&self, reader: ReaderId) -> bool {
        self.gateways.contains_key(&reader)
    }

    /// Current owner of a split, if any.
    #[must_use]
    pub fn owner_of(&self, split: &SplitId) -> Option<ReaderId> {
        self.owners.get(split).copied()
    }

    /// Number of parallel readers of the source.
    #[must_use]
    pub fn current_parallelism(&self) -> usize {
        self.parallelism
    }

    /// Enumerator metrics.
    #[must_use]
    pub fn metrics(&self) -> &Arc<EnumeratorMetrics> {
        &self.metrics
    }

    /// Runs `work` on the blocking pool and `callback` with its result on the
    /// coordinator mailbox. The callback is dropped if the coordinator has
    /// closed in the meantime.
    pub fn call_async<T, W, C>(&self, work: W, callback: C)
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T> + Send + 'static,
        C: FnOnce(&mut E, &mut EnumeratorContext<E>, Result<T>) -> Result<()> + Send + 'static,
    {
        let mailbox = self.mailbox.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let result = run_blocking(work).await;
            if cancel.is_cancelled() {
                return;
            }
            if let Some(mailbox) = mailbox.upgrade() {
                let _ = mailbox.send(CoordinatorMessage::Callback(Box::new(
                    move |e: &mut E, ctx: &mut EnumeratorContext<E>| callback(e, ctx, result),
                )));
            }
        });
    }

    /// Runs `work` every `period` (first after `initial_delay`) and delivers
    /// each result to `callback` on the mailbox, until the coordinator closes.
    pub fn call_async_periodically<T, W, C>(
        &self,
        initial_delay: Duration,
        period: Duration,
        work: W,
        callback: C,
    ) where
        T: Send + 'static,
        W: Fn() -> Result<T> + Send + Sync + 'static,
        C: Fn(&mut E, &mut EnumeratorContext<E>, Result<T>) -> Result<()> + Send + Sync + 'static,
    {
        let mailbox = self.mailbox.clone();
        let cancel = self.cancel.clone();
        let work = Arc::new(work);
        let callback = Arc::new(callback);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(initial_delay) => {}
            }
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let job = Arc::clone(&work);
                let result = run_blocking(move || job()).await;
                if cancel.is_cancelled() {
                    break;
                }
                let Some(sender) = mailbox.upgrade() else {
                    break;
                };
                let handler = Arc::clone(&callback);
                let message = CoordinatorMessage::Callback(Box::new(
                    move |e: &mut E, ctx: &mut EnumeratorContext<E>| handler(e, ctx, result),
                ));
                if sender.send(message).is_err() {
                    break;
                }
            }
        });
    }

    fn deliver(&mut self, reader: ReaderId, event: ReaderEvent<E::Split>) {
        if let Some(valve) = self.valve.as_mut() {
            valve.held.push((reader, event));
            return;
        }
        self.send_now(reader, event);
    }

    fn send_now(&self, reader: ReaderId, event: ReaderEvent<E::Split>) {
        match self.gateways.get(&reader) {
            Some(gateway) => {
                if gateway.send(event).is_err() {
                    tracing::warn!(reader = %reader, "Reader gateway closed, event dropped");
                }
            }
            None => tracing::warn!(reader = %reader, "Reader gone, event dropped"),
        }
    }

    pub(crate) fn register(
        &mut self,
        info: ReaderInfo,
        owned_splits: Vec<SplitId>,
        gateway: Gateway<E::Split>,
    ) -> Result<()> {
        let reader = info.reader_id;
        if self.gateways.contains_key(&reader) {
            return Err(SourceError::ProtocolViolation(format!(
                "reader {reader} registered twice"
            )));
        }
        for split in &owned_splits {
            if let Some(owner) = self.owners.get(split) {
                if *owner != reader {
                    tracing::warn!(reader = %reader, split = %split, owner = %owner, "Restored split already owned");
                    return Err(SourceError::DuplicateAssignment {
                        split: split.clone(),
                        owner: *owner,
                    });
                }
            }
        }
        for split in owned_splits {
            self.owners.insert(split, reader);
        }
        self.gateways.insert(reader, gateway);
        self.no_more_splits.remove(&reader);
        let count = {
            let mut registered = self.registered.write();
            registered.insert(reader, info);
            registered.len()
        };
        self.metrics.set_registered_readers(count);
        Ok(())
    }

    /// Forgets ownership of splits `reader` finished. Splits it no longer
    /// owns are ignored.
    pub(crate) fn release_splits(&mut self, reader: ReaderId, splits: &[SplitId]) {
        for split in splits {
            if self.owners.get(split) == Some(&reader) {
                self.owners.remove(split);
            }
        }
    }

    /// Drops a failed reader: registration, ownership, no-more-splits flag
    /// and events held for it.
    pub(crate) fn unregister(&mut self, reader: ReaderId) {
        self.gateways.remove(&reader);
        self.owners.retain(|_, owner| *owner != reader);
        self.no_more_splits.remove(&reader);
        if let Some(valve) = self.valve.as_mut() {
            valve.held.retain(|(target, _)| *target != reader);
        }
        let count = {
            let mut registered = self.registered.write();
            registered.remove(&reader);
            registered.len()
        };
        self.metrics.set_registered_readers(count);
    }

    pub(crate) fn tracker_mut(&mut self) -> &mut SplitAssignmentTracker<E::Split> {
        &mut self.tracker
    }

    /// Holds reader events until [`EnumeratorContext::open_valve`].
    ///
    /// Events still held for an older checkpoint are released first: they
    /// are missing from this snapshot's pending splits, so the readers'
    /// snapshots of `checkpoint_id` must see them.
    pub(crate) fn close_valve(&mut self, checkpoint_id: u64) {
        if self
            .valve
            .as_ref()
            .is_some_and(|v| v.checkpoint_id >= checkpoint_id)
        {
            return;
        }
        self.open_valve(checkpoint_id);
        self.valve = Some(Valve {
            checkpoint_id,
            held: Vec::new(),
        });
    }

    /// Releases held events if the valve was closed for `checkpoint_id` or an
    /// older checkpoint.
    pub(crate) fn open_valve(&mut self, checkpoint_id: u64) {
        let open = self
            .valve
            .as_ref()
            .is_some_and(|v| v.checkpoint_id <= checkpoint_id);
        if !open {
            return;
        }
        if let Some(valve) = self.valve.take() {
            for (reader, event) in valve.held {
                self.send_now(reader, event);
            }
        }
    }

    pub(crate) fn cancel_background_work(&self) {
        self.cancel.cancel();
    }
}

async fn run_blocking<T, W>(work: W) -> Result<T>
where
    T: Send + 'static,
    W: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(e) => Err(SourceError::Enumerator(format!("background work failed: {e}"))),
    }
}
