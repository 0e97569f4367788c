//! Messages between the coordinator and its readers.
//!
//! Coordinator to reader: [`ReaderEvent`], delivered through a per-reader
//! unbounded channel in send order.
//! Reader to coordinator: [`ReaderRequest`], sent through a
//! [`CoordinatorGateway`] into the coordinator mailbox.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::split::{ReaderId, SplitId};

/// Opaque, connector-defined message between an enumerator and a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEvent(Bytes);

impl SourceEvent {
    /// Wraps a raw payload.
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self(payload.into())
    }

    /// Raw payload.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.0
    }

    /// Encodes a serde value as a JSON event.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Serde` if the value cannot be encoded.
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self(Bytes::from(serde_json::to_vec(value)?)))
    }

    /// Decodes the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Serde` if the payload is not valid JSON for `T`.
    pub fn to_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.0)?)
    }
}

/// Control messages the framework itself understands on the event channel.
///
/// Sent as [`SourceEvent`]s; a reader intercepts them instead of forwarding
/// them to its split readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reader_control", content = "splits", rename_all = "snake_case")]
pub enum ReaderControl {
    /// Stop fetching the given splits.
    PauseSplits(Vec<SplitId>),
    /// Resume fetching the given splits.
    ResumeSplits(Vec<SplitId>),
}

impl ReaderControl {
    /// Encodes the control message as a source event.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Serde` on encoding failure.
    pub fn to_event(&self) -> Result<SourceEvent> {
        SourceEvent::from_json(self)
    }

    /// Recognizes a control message; `None` for connector events.
    #[must_use]
    pub fn from_event(event: &SourceEvent) -> Option<Self> {
        event.to_json().ok()
    }
}

/// Coordinator-to-reader event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent<S> {
    /// New splits to own. One event per assignment call.
    AddSplits(Vec<S>),
    /// No further splits will be assigned to this reader attempt.
    NoMoreSplits,
    /// Connector-defined event from the enumerator.
    SourceEvent(SourceEvent),
}

/// Reader-to-coordinator request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderRequest {
    /// The reader wants (more) work.
    SplitRequest {
        /// Requesting reader.
        reader: ReaderId,
        /// Location hint of the requesting reader.
        location: Option<String>,
    },
    /// Connector-defined event for the enumerator.
    SourceEvent {
        /// Sending reader.
        reader: ReaderId,
        /// The event.
        event: SourceEvent,
    },
    /// The reader read these splits to their end.
    SplitsFinished {
        /// Sending reader.
        reader: ReaderId,
        /// Finished splits.
        splits: Vec<SplitId>,
    },
}

impl ReaderRequest {
    /// The reader that sent this request.
    #[must_use]
    pub fn reader(&self) -> ReaderId {
        match self {
            Self::SplitRequest { reader, .. }
            | Self::SourceEvent { reader, .. }
            | Self::SplitsFinished { reader, .. } => *reader,
        }
    }
}

/// Reader-side handle to the coordinator mailbox.
pub trait CoordinatorGateway: Send + Sync {
    /// Enqueues a request without waiting for it to be processed.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::CoordinatorClosed` once the coordinator is gone.
    fn send(&self, request: ReaderRequest) -> Result<()>;
}
