//! Per-split watermark generation merged into one reader watermark.
//!
//! Every split owned by a reader gets its own [`WatermarkGenerator`], fed only
//! with timestamps of records from that split. The reader-level watermark is
//! the minimum over all *active* splits:
//!
//! ```text
//!   split-0 ──gen──► 120 ─┐
//!   split-1 ──gen──► 340 ─┼──► min(active) ──► 120 (only if > last emitted)
//!   split-2 ──gen──► idle ┘
//! ```
//!
//! A split is idle when its watermark has not advanced within the idle
//! timeout. If every split is idle the output is marked idle and no watermark
//! is emitted. Finished splits are removed; the emitted watermark never
//! regresses.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::debug;

use super::{Watermark, WatermarkGenerator, WatermarkOutput};
use crate::split::SplitId;

struct SplitWatermark {
    generator: Box<dyn WatermarkGenerator>,
    watermark: Watermark,
    last_progress: Instant,
    idle: bool,
}

/// Merges per-split watermarks into one monotonic watermark.
pub struct WatermarkOutputMultiplexer {
    splits: BTreeMap<SplitId, SplitWatermark>,
    idle_timeout: Option<Duration>,
    combined: Watermark,
    idle: bool,
}

impl std::fmt::Debug for WatermarkOutputMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatermarkOutputMultiplexer")
            .field("splits", &self.splits.len())
            .field("combined", &self.combined)
            .field("idle", &self.idle)
            .finish_non_exhaustive()
    }
}

impl WatermarkOutputMultiplexer {
    /// Creates an empty multiplexer.
    #[must_use]
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self {
            splits: BTreeMap::new(),
            idle_timeout,
            combined: Watermark::MIN,
            idle: false,
        }
    }

    /// Starts tracking a split. Re-registering a split resets its generator.
    pub fn register_split(
        &mut self,
        split_id: SplitId,
        generator: Box<dyn WatermarkGenerator>,
        now: Instant,
    ) {
        self.splits.insert(
            split_id,
            SplitWatermark {
                generator,
                watermark: Watermark::MIN,
                last_progress: now,
                idle: false,
            },
        );
    }

    /// Feeds a record timestamp of `split_id` into its generator.
    pub fn on_event<O>(&mut self, split_id: &SplitId, timestamp: i64, now: Instant, output: &mut O)
    where
        O: WatermarkOutput + ?Sized,
    {
        let Some(split) = self.splits.get_mut(split_id) else {
            return;
        };
        if let Some(wm) = split.generator.on_event(timestamp) {
            if Self::advance(split, wm, now) {
                self.update_combined(output);
            }
        }
    }

    /// Periodic hook: polls periodic generators and re-evaluates idleness.
    pub fn on_periodic_emit<O>(&mut self, now: Instant, output: &mut O)
    where
        O: WatermarkOutput + ?Sized,
    {
        for (split_id, split) in &mut self.splits {
            if let Some(wm) = split.generator.on_periodic() {
                Self::advance(split, wm, now);
            }
            if let Some(timeout) = self.idle_timeout {
                if !split.idle && now.saturating_duration_since(split.last_progress) >= timeout {
                    debug!(split = %split_id, "split marked idle");
                    split.idle = true;
                }
            }
        }
        self.update_combined(output);
    }

    /// Removes a finished split. Its last contribution stays reflected in the
    /// already emitted watermark, which never regresses.
    pub fn split_finished<O>(&mut self, split_id: &SplitId, output: &mut O)
    where
        O: WatermarkOutput + ?Sized,
    {
        if self.splits.remove(split_id).is_some() {
            self.update_combined(output);
        }
    }

    /// Emits the end-of-input watermark.
    pub fn finish<O>(&mut self, output: &mut O)
    where
        O: WatermarkOutput + ?Sized,
    {
        self.splits.clear();
        if self.idle {
            self.idle = false;
            output.mark_active();
        }
        if self.combined < Watermark::MAX {
            self.combined = Watermark::MAX;
            output.emit_watermark(Watermark::MAX);
        }
    }

    /// Marks the whole output idle, e.g. while the reader holds no splits.
    pub fn mark_idle<O>(&mut self, output: &mut O)
    where
        O: WatermarkOutput + ?Sized,
    {
        if !self.idle {
            self.idle = true;
            output.mark_idle();
        }
    }

    /// Leaves the idle state before a record of `split_id` is emitted. A
    /// timed-out split emitting the record counts as active again.
    pub fn mark_active<O>(&mut self, split_id: &SplitId, now: Instant, output: &mut O)
    where
        O: WatermarkOutput + ?Sized,
    {
        if !self.idle {
            return;
        }
        if let Some(split) = self.splits.get_mut(split_id) {
            if split.idle {
                debug!(split = %split_id, "split active again");
                split.idle = false;
                split.last_progress = now;
            }
        }
        if self.splits.values().any(|s| !s.idle) {
            self.idle = false;
            output.mark_active();
        }
    }

    /// Last emitted merged watermark.
    #[must_use]
    pub fn current_watermark(&self) -> Watermark {
        self.combined
    }

    /// Current watermark of one split.
    #[must_use]
    pub fn split_watermark(&self, split_id: &SplitId) -> Option<Watermark> {
        self.splits.get(split_id).map(|s| s.watermark)
    }

    /// Whether a split is currently idle.
    #[must_use]
    pub fn is_split_idle(&self, split_id: &SplitId) -> bool {
        self.splits.get(split_id).is_some_and(|s| s.idle)
    }

    /// Whether the merged output is currently idle.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Number of tracked splits.
    #[must_use]
    pub fn split_count(&self) -> usize {
        self.splits.len()
    }

    /// Splits whose watermark leads the merged watermark by more than `max_drift`.
    ///
    /// Empty until a merged watermark exists.
    #[must_use]
    pub fn splits_ahead(&self, max_drift: Duration) -> Vec<SplitId> {
        if self.combined == Watermark::MIN {
            return Vec::new();
        }
        let drift = i64::try_from(max_drift.as_millis()).unwrap_or(i64::MAX);
        let limit = self.combined.0.saturating_add(drift);
        self.splits
            .iter()
            .filter(|(_, s)| s.watermark.0 > limit)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn advance(split: &mut SplitWatermark, wm: Watermark, now: Instant) -> bool {
        if wm > split.watermark {
            split.watermark = wm;
            split.last_progress = now;
            split.idle = false;
            true
        } else {
            false
        }
    }

    fn update_combined<O>(&mut self, output: &mut O)
    where
        O: WatermarkOutput + ?Sized,
    {
        if self.splits.is_empty() {
            return;
        }
        let active_min = self
            .splits
            .values()
            .filter(|s| !s.idle)
            .map(|s| s.watermark)
            .min();

        match active_min {
            None => {
                if !self.idle {
                    self.idle = true;
                    output.mark_idle();
                }
            }
            Some(min) => {
                if self.idle {
                    self.idle = false;
                    output.mark_active();
                }
                if min > self.combined {
                    self.combined = min;
                    output.emit_watermark(min);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watermark::BoundedOutOfOrdernessGenerator;

    #[derive(Default)]
    struct Recorded {
        watermarks: Vec<Watermark>,
        idle: u32,
        active: u32,
    }

    impl WatermarkOutput for Recorded {
        fn emit_watermark(&mut self, watermark: Watermark) {
            self.watermarks.push(watermark);
        }
        fn mark_idle(&mut self) {
            self.idle += 1;
        }
        fn mark_active(&mut self) {
            self.active += 1;
        }
    }

    fn gen() -> Box<dyn WatermarkGenerator> {
        Box::new(BoundedOutOfOrdernessGenerator::new(0))
    }

    #[test]
    fn test_min_over_splits() {
        let now = Instant::now();
        let mut mux = WatermarkOutputMultiplexer::new(None);
        let mut out = Recorded::default();
        let (a, b) = (SplitId::new("a"), SplitId::new("b"));
        mux.register_split(a.clone(), gen(), now);
        mux.register_split(b.clone(), gen(), now);

        mux.on_event(&a, 100, now, &mut out);
        // b has no watermark yet, holds the min at -inf
        assert!(out.watermarks.is_empty());

        mux.on_event(&b, 50, now, &mut out);
        assert_eq!(out.watermarks, vec![Watermark::new(50)]);

        mux.on_event(&b, 150, now, &mut out);
        assert_eq!(out.watermarks.last(), Some(&Watermark::new(100)));
        assert_eq!(mux.current_watermark(), Watermark::new(100));
    }

    #[test]
    fn test_idle_split_excluded_from_min() {
        let start = Instant::now();
        let mut mux = WatermarkOutputMultiplexer::new(Some(Duration::from_millis(100)));
        let mut out = Recorded::default();
        let (stalled, busy) = (SplitId::new("stalled"), SplitId::new("busy"));
        mux.register_split(stalled.clone(), gen(), start);
        mux.register_split(busy.clone(), gen(), start);

        mux.on_event(&stalled, 10, start, &mut out);
        mux.on_event(&busy, 20, start, &mut out);
        assert_eq!(mux.current_watermark(), Watermark::new(10));

        // busy keeps advancing, stalled does not
        for step in 1..=5_u32 {
            let now = start + Duration::from_millis(50 * u64::from(step));
            mux.on_event(&busy, 20 + i64::from(step) * 100, now, &mut out);
            mux.on_periodic_emit(now, &mut out);
        }

        assert!(mux.is_split_idle(&stalled));
        assert!(!mux.is_split_idle(&busy));
        assert_eq!(mux.current_watermark(), Watermark::new(520));
        assert_eq!(out.idle, 0);
    }

    #[test]
    fn test_all_idle_marks_output_idle_without_advancing() {
        let start = Instant::now();
        let mut mux = WatermarkOutputMultiplexer::new(Some(Duration::from_millis(10)));
        let mut out = Recorded::default();
        let a = SplitId::new("a");
        mux.register_split(a.clone(), gen(), start);
        mux.on_event(&a, 5, start, &mut out);

        mux.on_periodic_emit(start + Duration::from_millis(20), &mut out);
        assert!(mux.is_idle());
        assert_eq!(out.idle, 1);
        assert_eq!(out.watermarks, vec![Watermark::new(5)]);

        // progress reactivates the split and the output
        mux.on_event(&a, 9, start + Duration::from_millis(25), &mut out);
        assert!(!mux.is_idle());
        assert_eq!(out.active, 1);
        assert_eq!(out.watermarks.last(), Some(&Watermark::new(9)));
    }

    #[test]
    fn test_record_of_idle_split_reactivates_output() {
        let start = Instant::now();
        let mut mux = WatermarkOutputMultiplexer::new(Some(Duration::from_millis(10)));
        let mut out = Recorded::default();
        let (a, b) = (SplitId::new("a"), SplitId::new("b"));
        mux.register_split(a.clone(), gen(), start);
        mux.register_split(b.clone(), gen(), start);
        mux.on_event(&a, 50, start, &mut out);
        mux.on_event(&b, 20, start, &mut out);
        mux.on_periodic_emit(start + Duration::from_millis(20), &mut out);
        assert!(mux.is_idle());

        // A late record carries no watermark progress, yet ends idleness.
        let now = start + Duration::from_millis(30);
        mux.mark_active(&b, now, &mut out);
        assert!(!mux.is_idle());
        assert!(!mux.is_split_idle(&b));
        assert!(mux.is_split_idle(&a));
        assert_eq!(out.active, 1);

        mux.on_periodic_emit(now + Duration::from_millis(5), &mut out);
        assert!(!mux.is_idle());
        mux.on_periodic_emit(now + Duration::from_millis(10), &mut out);
        assert!(mux.is_idle());
        assert_eq!(out.idle, 2);
        assert_eq!(mux.current_watermark(), Watermark::new(20));
    }

    #[test]
    fn test_finished_split_never_regresses() {
        let now = Instant::now();
        let mut mux = WatermarkOutputMultiplexer::new(None);
        let mut out = Recorded::default();
        let (fast, slow) = (SplitId::new("fast"), SplitId::new("slow"));
        mux.register_split(fast.clone(), gen(), now);
        mux.on_event(&fast, 500, now, &mut out);
        assert_eq!(mux.current_watermark(), Watermark::new(500));

        mux.register_split(slow.clone(), gen(), now);
        mux.split_finished(&fast, &mut out);
        mux.on_event(&slow, 100, now, &mut out);

        assert_eq!(mux.current_watermark(), Watermark::new(500));
        let mut sorted = out.watermarks.clone();
        sorted.sort();
        assert_eq!(sorted, out.watermarks, "watermarks must be monotonic");
    }

    #[test]
    fn test_finish_emits_max() {
        let now = Instant::now();
        let mut mux = WatermarkOutputMultiplexer::new(None);
        let mut out = Recorded::default();
        mux.register_split(SplitId::new("a"), gen(), now);
        mux.finish(&mut out);
        mux.finish(&mut out);
        assert_eq!(out.watermarks, vec![Watermark::MAX]);
    }

    #[test]
    fn test_splits_ahead() {
        let now = Instant::now();
        let mut mux = WatermarkOutputMultiplexer::new(None);
        let mut out = Recorded::default();
        let (a, b) = (SplitId::new("a"), SplitId::new("b"));
        mux.register_split(a.clone(), gen(), now);
        mux.register_split(b.clone(), gen(), now);
        assert!(mux.splits_ahead(Duration::from_millis(10)).is_empty());

        mux.on_event(&a, 100, now, &mut out);
        mux.on_event(&b, 500, now, &mut out);
        assert_eq!(mux.splits_ahead(Duration::from_millis(100)), vec![b.clone()]);
        assert!(mux.splits_ahead(Duration::from_millis(400)).is_empty());
    }
}
