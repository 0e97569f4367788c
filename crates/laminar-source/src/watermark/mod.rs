//! # Watermarks
//!
//! Event-time progress tracking for source readers.
//!
//! ## Concepts
//!
//! - **Event Time**: timestamp (epoch millis) assigned to a record
//! - **Watermark**: assertion that no record with a smaller timestamp will follow
//! - **Generator**: per-split state machine turning timestamps into watermarks
//! - **Idleness**: a split without watermark progress stops holding back the
//!   merged watermark

pub mod multiplexer;

use std::fmt;
use std::sync::Arc;

use crate::config::WatermarkSettings;

pub use multiplexer::WatermarkOutputMultiplexer;

/// A watermark indicating event time progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(pub i64);

impl Watermark {
    /// The lowest watermark; nothing has been asserted yet.
    pub const MIN: Self = Self(i64::MIN);
    /// The end-of-input watermark.
    pub const MAX: Self = Self(i64::MAX);

    /// Creates a new watermark
    #[must_use]
    pub const fn new(timestamp: i64) -> Self {
        Self(timestamp)
    }

    /// Gets the watermark timestamp
    #[must_use]
    pub const fn timestamp(&self) -> i64 {
        self.0
    }

    /// Checks if an event is late relative to this watermark
    #[must_use]
    pub const fn is_late(&self, event_time: i64) -> bool {
        event_time < self.0
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MIN => f.write_str("-inf"),
            Self::MAX => f.write_str("+inf"),
            Self(ts) => write!(f, "{ts}"),
        }
    }
}

/// Watermark generator that tracks event time progress
pub trait WatermarkGenerator: Send {
    /// Process an event timestamp and potentially emit a new watermark
    fn on_event(&mut self, timestamp: i64) -> Option<Watermark>;

    /// Called periodically to emit watermarks based on wall clock time
    fn on_periodic(&mut self) -> Option<Watermark>;
}

/// Watermark generator with bounded out-of-orderness.
///
/// Emits `max_timestamp - max_out_of_orderness` as soon as a new maximum
/// timestamp is observed.
pub struct BoundedOutOfOrdernessGenerator {
    max_out_of_orderness: i64,
    current_max_timestamp: i64,
}

impl BoundedOutOfOrdernessGenerator {
    /// Creates a new generator allowing events to be at most `max_out_of_orderness` late
    #[must_use]
    pub fn new(max_out_of_orderness: i64) -> Self {
        Self {
            max_out_of_orderness,
            current_max_timestamp: i64::MIN,
        }
    }
}

impl WatermarkGenerator for BoundedOutOfOrdernessGenerator {
    fn on_event(&mut self, timestamp: i64) -> Option<Watermark> {
        if timestamp > self.current_max_timestamp {
            self.current_max_timestamp = timestamp;
            Some(Watermark::new(
                timestamp.saturating_sub(self.max_out_of_orderness),
            ))
        } else {
            None
        }
    }

    fn on_periodic(&mut self) -> Option<Watermark> {
        // Everything was already emitted eagerly in `on_event`.
        None
    }
}

/// Generator that never produces watermarks.
#[derive(Debug, Default)]
pub struct NoWatermarksGenerator;

impl WatermarkGenerator for NoWatermarksGenerator {
    fn on_event(&mut self, _timestamp: i64) -> Option<Watermark> {
        None
    }

    fn on_periodic(&mut self) -> Option<Watermark> {
        None
    }
}

/// Extracts an event timestamp from a record.
pub trait TimestampAssigner<T>: Send + Sync {
    /// Returns the event time of `record`. `source_timestamp` is the timestamp
    /// the record emitter attached, if any.
    fn extract_timestamp(&self, record: &T, source_timestamp: Option<i64>) -> i64;
}

impl<T, F> TimestampAssigner<T> for F
where
    F: Fn(&T, Option<i64>) -> i64 + Send + Sync,
{
    fn extract_timestamp(&self, record: &T, source_timestamp: Option<i64>) -> i64 {
        self(record, source_timestamp)
    }
}

/// Receiver of watermark and idleness transitions.
pub trait WatermarkOutput {
    /// A new (strictly larger) watermark.
    fn emit_watermark(&mut self, watermark: Watermark);

    /// The output stopped contributing event-time progress.
    fn mark_idle(&mut self);

    /// The output contributes event-time progress again.
    fn mark_active(&mut self);
}

type GeneratorFactory = dyn Fn() -> Box<dyn WatermarkGenerator> + Send + Sync;

/// How a reader assigns timestamps and generates watermarks for its splits.
///
/// Cloned once per reader; every split gets its own generator instance.
pub struct WatermarkStrategy<T> {
    generator: Arc<GeneratorFactory>,
    assigner: Option<Arc<dyn TimestampAssigner<T>>>,
    settings: WatermarkSettings,
}

impl<T> Clone for WatermarkStrategy<T> {
    fn clone(&self) -> Self {
        Self {
            generator: Arc::clone(&self.generator),
            assigner: self.assigner.clone(),
            settings: self.settings,
        }
    }
}

impl<T> fmt::Debug for WatermarkStrategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatermarkStrategy")
            .field("has_assigner", &self.assigner.is_some())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<T> WatermarkStrategy<T> {
    /// No watermarks; records keep the timestamps the emitter attaches.
    #[must_use]
    pub fn no_watermarks() -> Self {
        Self::for_generator(|| Box::new(NoWatermarksGenerator))
    }

    /// Bounded out-of-orderness watermarks lagging `max_out_of_orderness_ms`
    /// behind the largest timestamp seen per split.
    #[must_use]
    pub fn bounded_out_of_orderness(max_out_of_orderness_ms: i64) -> Self {
        Self::for_generator(move || {
            Box::new(BoundedOutOfOrdernessGenerator::new(max_out_of_orderness_ms))
        })
    }

    /// Watermarks equal to the largest timestamp seen per split.
    #[must_use]
    pub fn monotonous_timestamps() -> Self {
        Self::bounded_out_of_orderness(0)
    }

    /// Custom generator factory.
    #[must_use]
    pub fn for_generator<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn WatermarkGenerator> + Send + Sync + 'static,
    {
        Self {
            generator: Arc::new(factory),
            assigner: None,
            settings: WatermarkSettings::default(),
        }
    }

    /// Attaches a timestamp assigner.
    #[must_use]
    pub fn with_timestamp_assigner<A>(mut self, assigner: A) -> Self
    where
        A: TimestampAssigner<T> + 'static,
    {
        self.assigner = Some(Arc::new(assigner));
        self
    }

    /// Enables split idleness detection.
    #[must_use]
    pub fn with_idleness(mut self, idle_timeout: std::time::Duration) -> Self {
        self.settings.idle_timeout = Some(idle_timeout);
        self
    }

    /// Enables split watermark alignment with the given maximum drift.
    #[must_use]
    pub fn with_alignment(mut self, max_drift: std::time::Duration) -> Self {
        self.settings.max_drift = Some(max_drift);
        self
    }

    /// Replaces all emission settings.
    #[must_use]
    pub fn with_settings(mut self, settings: WatermarkSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Emission settings.
    #[must_use]
    pub fn settings(&self) -> &WatermarkSettings {
        &self.settings
    }

    /// The timestamp assigner, if any.
    #[must_use]
    pub fn assigner(&self) -> Option<&Arc<dyn TimestampAssigner<T>>> {
        self.assigner.as_ref()
    }

    /// Creates a fresh generator for one split.
    #[must_use]
    pub fn create_generator(&self) -> Box<dyn WatermarkGenerator> {
        (self.generator)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_late_detection() {
        let watermark = Watermark::new(1000);
        assert!(watermark.is_late(999));
        assert!(!watermark.is_late(1000));
        assert!(!watermark.is_late(1001));
    }

    #[test]
    fn test_bounded_watermark_generator() {
        let mut generator = BoundedOutOfOrdernessGenerator::new(100);

        assert_eq!(generator.on_event(1000), Some(Watermark::new(900)));
        // Out of order event - no new watermark
        assert!(generator.on_event(800).is_none());
        assert_eq!(generator.on_event(1200), Some(Watermark::new(1100)));
        assert!(generator.on_periodic().is_none());
    }

    #[test]
    fn test_bounded_generator_saturates() {
        let mut generator = BoundedOutOfOrdernessGenerator::new(10);
        assert_eq!(generator.on_event(i64::MIN + 5), Some(Watermark::MIN));
    }

    #[test]
    fn test_strategy_creates_independent_generators() {
        let strategy: WatermarkStrategy<i64> = WatermarkStrategy::monotonous_timestamps()
            .with_timestamp_assigner(|v: &i64, _ts: Option<i64>| *v * 10);
        let mut a = strategy.create_generator();
        let mut b = strategy.create_generator();
        assert_eq!(a.on_event(5), Some(Watermark::new(5)));
        assert_eq!(b.on_event(3), Some(Watermark::new(3)));

        let assigner = strategy.assigner().unwrap();
        assert_eq!(assigner.extract_timestamp(&7, None), 70);
    }

    #[test]
    fn test_watermark_display() {
        assert_eq!(Watermark::MIN.to_string(), "-inf");
        assert_eq!(Watermark::MAX.to_string(), "+inf");
        assert_eq!(Watermark::new(42).to_string(), "42");
    }
}
