//! Downstream output of a reader.
//!
//! A [`ReaderOutput`] receives records, watermarks and idleness transitions.
//! Record emitters never see it directly: they write through a
//! [`SplitOutput`], which assigns timestamps, feeds the split's watermark
//! generator and updates metrics.

use std::time::Instant;

use crate::metrics::SourceReaderMetrics;
use crate::split::SplitId;
use crate::watermark::{TimestampAssigner, Watermark, WatermarkOutput, WatermarkOutputMultiplexer};

/// Sink for everything a reader produces.
pub trait ReaderOutput<T>: WatermarkOutput {
    /// Receives one record with its event time, if any.
    fn collect(&mut self, record: T, timestamp: Option<i64>);
}

/// One element of a reader's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamElement<T> {
    /// A record.
    Record {
        /// Payload.
        value: T,
        /// Event time (epoch millis).
        timestamp: Option<i64>,
    },
    /// Event-time progress.
    Watermark(Watermark),
    /// The reader stopped contributing event-time progress.
    Idle,
    /// The reader contributes event-time progress again.
    Active,
    /// The reader reached the end of a bounded input.
    EndOfInput,
    /// Everything before this element is covered by the reader's snapshot for
    /// the checkpoint; nothing after it is.
    CheckpointBarrier(u64),
}

/// Buffering output collecting [`StreamElement`]s.
#[derive(Debug)]
pub struct VecOutput<T> {
    elements: Vec<StreamElement<T>>,
}

impl<T> Default for VecOutput<T> {
    fn default() -> Self {
        Self {
            elements: Vec::new(),
        }
    }
}

impl<T> VecOutput<T> {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffered element count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// `true` if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Appends an element directly.
    pub fn push(&mut self, element: StreamElement<T>) {
        self.elements.push(element);
    }

    /// Takes all buffered elements.
    pub fn drain(&mut self) -> std::vec::Drain<'_, StreamElement<T>> {
        self.elements.drain(..)
    }

    /// Buffered elements.
    #[must_use]
    pub fn elements(&self) -> &[StreamElement<T>] {
        &self.elements
    }
}

impl<T> WatermarkOutput for VecOutput<T> {
    fn emit_watermark(&mut self, watermark: Watermark) {
        self.elements.push(StreamElement::Watermark(watermark));
    }

    fn mark_idle(&mut self) {
        self.elements.push(StreamElement::Idle);
    }

    fn mark_active(&mut self) {
        self.elements.push(StreamElement::Active);
    }
}

impl<T> ReaderOutput<T> for VecOutput<T> {
    fn collect(&mut self, record: T, timestamp: Option<i64>) {
        self.elements.push(StreamElement::Record {
            value: record,
            timestamp,
        });
    }
}

/// Watermark output that also records the emitted watermark in metrics.
pub(crate) struct MeteredOutput<'a, T> {
    pub(crate) inner: &'a mut dyn ReaderOutput<T>,
    pub(crate) metrics: &'a SourceReaderMetrics,
}

impl<T> WatermarkOutput for MeteredOutput<'_, T> {
    fn emit_watermark(&mut self, watermark: Watermark) {
        self.metrics.set_watermark(watermark);
        self.inner.emit_watermark(watermark);
    }

    fn mark_idle(&mut self) {
        self.inner.mark_idle();
    }

    fn mark_active(&mut self) {
        self.inner.mark_active();
    }
}

/// Output handed to a record emitter for records of one split.
pub struct SplitOutput<'a, T> {
    pub(crate) split_id: &'a SplitId,
    pub(crate) inner: &'a mut dyn ReaderOutput<T>,
    pub(crate) multiplexer: &'a mut WatermarkOutputMultiplexer,
    pub(crate) assigner: Option<&'a dyn TimestampAssigner<T>>,
    pub(crate) metrics: &'a SourceReaderMetrics,
    pub(crate) now: Instant,
}

impl<T> SplitOutput<'_, T> {
    /// Split the records belong to.
    #[must_use]
    pub fn split_id(&self) -> &SplitId {
        self.split_id
    }

    /// Emits a record without a source timestamp.
    pub fn collect(&mut self, record: T) {
        self.collect_with_timestamp(record, None);
    }

    /// Emits a record.
    ///
    /// The strategy's timestamp assigner, if any, decides the final event
    /// time; otherwise `source_timestamp` is used. The event time then feeds
    /// this split's watermark generator.
    pub fn collect_with_timestamp(&mut self, record: T, source_timestamp: Option<i64>) {
        let timestamp = match self.assigner {
            Some(assigner) => Some(assigner.extract_timestamp(&record, source_timestamp)),
            None => source_timestamp,
        };
        self.inner.collect(record, timestamp);
        self.metrics.record_emitted(timestamp);

        if let Some(ts) = timestamp {
            let mut out = MeteredOutput {
                inner: &mut *self.inner,
                metrics: self.metrics,
            };
            self.multiplexer.on_event(self.split_id, ts, self.now, &mut out);
        }
    }

    /// Adds to the bytes-in counter.
    pub fn add_bytes_in(&self, bytes: u64) {
        self.metrics.add_bytes_in(bytes);
    }

    /// Counts a record that could not be turned into output.
    pub fn record_error(&self) {
        self.metrics.record_error();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watermark::BoundedOutOfOrdernessGenerator;

    #[test]
    fn test_split_output_assigns_and_feeds_generator() {
        let split = SplitId::new("s");
        let now = Instant::now();
        let metrics = SourceReaderMetrics::new();
        let mut mux = WatermarkOutputMultiplexer::new(None);
        mux.register_split(
            split.clone(),
            Box::new(BoundedOutOfOrdernessGenerator::new(5)),
            now,
        );
        let assigner = |v: &u64, _: Option<i64>| i64::try_from(*v).unwrap_or(0) * 10;
        let mut sink = VecOutput::<u64>::new();

        let mut out = SplitOutput {
            split_id: &split,
            inner: &mut sink,
            multiplexer: &mut mux,
            assigner: Some(&assigner),
            metrics: &metrics,
            now,
        };
        out.collect(3);
        out.add_bytes_in(8);
        out.record_error();

        assert_eq!(
            sink.elements(),
            &[
                StreamElement::Record {
                    value: 3,
                    timestamp: Some(30)
                },
                StreamElement::Watermark(Watermark::new(25)),
            ]
        );
        let snap = metrics.snapshot_at(100);
        assert_eq!(snap.records_in, 1);
        assert_eq!(snap.bytes_in, 8);
        assert_eq!(snap.records_in_errors, 1);
    }

    #[test]
    fn test_split_output_without_timestamp() {
        let split = SplitId::new("s");
        let metrics = SourceReaderMetrics::new();
        let mut mux = WatermarkOutputMultiplexer::new(None);
        let mut sink = VecOutput::<&str>::new();
        let mut out = SplitOutput {
            split_id: &split,
            inner: &mut sink,
            multiplexer: &mut mux,
            assigner: None,
            metrics: &metrics,
            now: Instant::now(),
        };
        out.collect_with_timestamp("x", Some(7));
        out.collect("y");
        let elements: Vec<_> = sink.drain().collect();
        assert_eq!(
            elements,
            vec![
                StreamElement::Record {
                    value: "x",
                    timestamp: Some(7)
                },
                StreamElement::Record {
                    value: "y",
                    timestamp: None
                },
            ]
        );
        assert!(sink.is_empty());
    }
}
