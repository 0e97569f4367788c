//! Lock-free reader and enumerator metrics.
//!
//! Readers update their metrics on the owning task; any other task may read
//! a consistent-enough [`ReaderMetricsSnapshot`] at any time.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crate::watermark::Watermark;

const ABSENT: i64 = -1;

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Per-reader metrics using atomics (no locks on the data path).
#[derive(Debug)]
pub struct SourceReaderMetrics {
    records_in: AtomicU64,
    bytes_in: AtomicU64,
    records_in_errors: AtomicU64,
    /// Event time of the last emitted record, `i64::MIN` if none.
    last_event_time: AtomicI64,
    /// Last emitted watermark.
    watermark: AtomicI64,
    pending_records: AtomicI64,
    pending_bytes: AtomicI64,
    /// Start of the current idle period, `ABSENT` while active.
    idle_since: AtomicI64,
    /// Length of all finished idle periods (ms).
    idle_total: AtomicU64,
    holding_splits: AtomicBool,
}

impl Default for SourceReaderMetrics {
    fn default() -> Self {
        Self {
            records_in: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            records_in_errors: AtomicU64::new(0),
            last_event_time: AtomicI64::new(i64::MIN),
            watermark: AtomicI64::new(i64::MIN),
            pending_records: AtomicI64::new(ABSENT),
            pending_bytes: AtomicI64::new(ABSENT),
            idle_since: AtomicI64::new(ABSENT),
            idle_total: AtomicU64::new(0),
            holding_splits: AtomicBool::new(false),
        }
    }
}

impl SourceReaderMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one emitted record and its event time.
    pub fn record_emitted(&self, event_time: Option<i64>) {
        self.records_in.fetch_add(1, Ordering::Relaxed);
        if let Some(ts) = event_time {
            self.last_event_time.store(ts, Ordering::Relaxed);
        }
        if self.idle_since.load(Ordering::Relaxed) != ABSENT {
            self.mark_active_at(now_millis());
        }
    }

    /// Adds to the bytes-in counter.
    pub fn add_bytes_in(&self, bytes: u64) {
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Counts a record that could not be processed.
    pub fn record_error(&self) {
        self.records_in_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Stores the last emitted watermark.
    pub fn set_watermark(&self, watermark: Watermark) {
        self.watermark.store(watermark.timestamp(), Ordering::Relaxed);
    }

    /// Whether the reader currently owns at least one split.
    pub fn set_holding_splits(&self, holding: bool) {
        self.holding_splits.store(holding, Ordering::Relaxed);
    }

    /// Updates the pending gauges.
    ///
    /// `None` means no owned split reports a total. Once a total has been
    /// reported the gauge never goes back to absent; it reads zero instead.
    pub fn update_pending(&self, records: Option<u64>, bytes: Option<u64>) {
        Self::update_gauge(&self.pending_records, records);
        Self::update_gauge(&self.pending_bytes, bytes);
    }

    fn update_gauge(gauge: &AtomicI64, value: Option<u64>) {
        match value {
            Some(v) => gauge.store(i64::try_from(v).unwrap_or(i64::MAX), Ordering::Relaxed),
            None => {
                if gauge.load(Ordering::Relaxed) != ABSENT {
                    gauge.store(0, Ordering::Relaxed);
                }
            }
        }
    }

    /// Marks the start of an idle period (no-op if already idle).
    pub fn mark_idle_at(&self, now_ms: i64) {
        let _ = self.idle_since.compare_exchange(
            ABSENT,
            now_ms,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Ends the current idle period at `now_ms` and adds it to the total.
    pub fn mark_active_at(&self, now_ms: i64) {
        let since = self.idle_since.swap(ABSENT, Ordering::Relaxed);
        if since != ABSENT {
            self.idle_total
                .fetch_add(elapsed_ms(since, now_ms), Ordering::Relaxed);
        }
    }

    /// Total records emitted.
    #[must_use]
    pub fn records_in(&self) -> u64 {
        self.records_in.load(Ordering::Relaxed)
    }

    /// Returns a snapshot evaluated against wall-clock time `now_ms`.
    #[must_use]
    pub fn snapshot_at(&self, now_ms: i64) -> ReaderMetricsSnapshot {
        let holding = self.holding_splits.load(Ordering::Relaxed);
        let event_time = self.last_event_time.load(Ordering::Relaxed);
        let watermark = self.watermark.load(Ordering::Relaxed);
        let idle_since = self.idle_since.load(Ordering::Relaxed);

        let lag = |ts: i64| -> Option<i64> {
            (holding && ts != i64::MIN && ts != i64::MAX).then(|| now_ms.saturating_sub(ts))
        };

        ReaderMetricsSnapshot {
            records_in: self.records_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            records_in_errors: self.records_in_errors.load(Ordering::Relaxed),
            current_emit_event_time_lag: lag(event_time),
            watermark_lag: lag(watermark),
            pending_records: gauge_value(&self.pending_records),
            pending_bytes: gauge_value(&self.pending_bytes),
            source_idle_time: self.idle_total.load(Ordering::Relaxed).saturating_add(
                if idle_since == ABSENT {
                    0
                } else {
                    elapsed_ms(idle_since, now_ms)
                },
            ),
        }
    }

    /// Returns a snapshot evaluated against the current wall-clock time.
    #[must_use]
    pub fn snapshot(&self) -> ReaderMetricsSnapshot {
        self.snapshot_at(now_millis())
    }
}

fn elapsed_ms(since: i64, now_ms: i64) -> u64 {
    u64::try_from(now_ms.saturating_sub(since)).unwrap_or(0)
}

fn gauge_value(gauge: &AtomicI64) -> Option<u64> {
    u64::try_from(gauge.load(Ordering::Relaxed)).ok()
}

/// Point-in-time snapshot of reader metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderMetricsSnapshot {
    /// Records emitted.
    pub records_in: u64,
    /// Bytes read, as reported by the record emitter.
    pub bytes_in: u64,
    /// Records that failed processing.
    pub records_in_errors: u64,
    /// Wall clock minus event time of the last emitted record (ms).
    /// Absent while the reader owns no split.
    pub current_emit_event_time_lag: Option<i64>,
    /// Wall clock minus current watermark (ms).
    /// Absent while the reader owns no split or before the first watermark.
    pub watermark_lag: Option<i64>,
    /// Records still to read over owned splits with a known total.
    pub pending_records: Option<u64>,
    /// Bytes still to read over owned splits with a known size.
    pub pending_bytes: Option<u64>,
    /// Wall-clock time (ms) spent without available data, summed over all
    /// idle periods including the current one.
    pub source_idle_time: u64,
}

/// Enumerator-side metrics.
#[derive(Debug, Default)]
pub struct EnumeratorMetrics {
    registered_readers: AtomicU64,
    assigned_splits: AtomicU64,
    splits_added_back: AtomicU64,
    unassigned_splits: AtomicU64,
}

impl EnumeratorMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_registered_readers(&self, count: usize) {
        self.registered_readers
            .store(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_assigned(&self, count: usize) {
        self.assigned_splits
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_added_back(&self, count: usize) {
        self.splits_added_back
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Reports the enumerator's pending (unassigned) split count.
    pub fn set_unassigned_splits(&self, count: usize) {
        self.unassigned_splits
            .store(count as u64, Ordering::Relaxed);
    }

    /// Returns a snapshot of the current metrics.
    #[must_use]
    pub fn snapshot(&self) -> EnumeratorMetricsSnapshot {
        EnumeratorMetricsSnapshot {
            registered_readers: self.registered_readers.load(Ordering::Relaxed),
            assigned_splits: self.assigned_splits.load(Ordering::Relaxed),
            splits_added_back: self.splits_added_back.load(Ordering::Relaxed),
            unassigned_splits: self.unassigned_splits.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of enumerator metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumeratorMetricsSnapshot {
    /// Currently registered readers.
    pub registered_readers: u64,
    /// Total splits assigned (including re-assignments).
    pub assigned_splits: u64,
    /// Total splits returned by failed readers.
    pub splits_added_back: u64,
    /// Splits the enumerator reports as not yet assigned.
    pub unassigned_splits: u64,
}
