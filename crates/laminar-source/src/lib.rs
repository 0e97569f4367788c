//! # `LaminarDB` Source Framework
//!
//! Split-oriented sources: a single [`SplitEnumerator`] on the coordinator
//! discovers units of work ([`SourceSplit`]s) and assigns them to parallel
//! [`SourceReader`]s, which read them through fetcher tasks.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────── coordinator ─────────────────────────┐
//! │  SourceCoordinator ─ mailbox ─► SplitEnumerator               │
//! └───────────┬───────────────────────────────▲───────────────────┘
//!             │ ReaderEvent                   │ ReaderRequest
//! ┌───────────▼─────────── reader (per subtask) ──────────────────┐
//! │  SourceReader ◄─ bounded queue ◄─ SplitFetcher(s) ─ SplitReader│
//! │      │ RecordEmitter + WatermarkOutputMultiplexer             │
//! └──────┼────────────────────────────────────────────────────────┘
//!        ▼ output
//! ```
//!
//! ## Modules
//!
//! - [`split`]: split identity, split state, reader identity
//! - [`enumerator`]: enumerator trait, its context and assignment tracking
//! - [`coordinator`]: the enumerator's mailbox host
//! - [`reader`]: the per-subtask reader, its context and outputs
//! - [`fetcher`]: split readers, fetcher tasks and their manager
//! - [`watermark`]: generators, strategies and the per-split multiplexer
//! - [`checkpoint`]: versioned serializers and checkpoint payloads
//! - [`task`] and [`runtime`]: in-process execution

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

#[macro_use]
mod macros;

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod enumerator;
pub mod error;
pub mod event;
pub mod fetcher;
pub mod metrics;
pub mod reader;
pub mod runtime;
pub mod source;
pub mod split;
pub mod task;
pub mod watermark;

pub use checkpoint::{
    EnumeratorCheckpoint, JsonSerializer, ReaderCheckpoint, ReaderCheckpointSerializer,
    VersionedSerializer,
};
pub use config::{
    CoordinatorConfig, FetcherMode, RuntimeConfig, SourceConfig, SourceReaderConfig,
    WatermarkSettings,
};
pub use coordinator::{CoordinatorHandle, SourceCoordinator};
pub use enumerator::{EnumeratorContext, SplitEnumerator, SplitsAssignment};
pub use error::{Result, SourceError};
pub use event::{ReaderControl, ReaderEvent, ReaderRequest, SourceEvent};
pub use fetcher::{RecordsBySplits, SplitReader, SplitsChange};
pub use metrics::{EnumeratorMetrics, ReaderMetricsSnapshot, SourceReaderMetrics};
pub use reader::{
    InputStatus, ReaderContext, ReaderOutput, RecordEmitter, SourceReader, SplitOutput,
    StreamElement, VecOutput,
};
pub use runtime::{JobCheckpoint, LocalSourceRuntime};
pub use source::Source;
pub use split::{Boundedness, ReaderId, ReaderInfo, SourceSplit, SplitId, SplitState};
pub use watermark::{Watermark, WatermarkGenerator, WatermarkStrategy};
