//! Split model: identities, reader identities, and split progress.
//!
//! A split is an immutable description of one finite slice of a source's
//! input domain (a file, a partition offset range, a snapshot chunk). The
//! reader that owns a split tracks its progress in a separate, mutable
//! [`SplitState`], which is converted back into a split value carrying the
//! current position whenever a checkpoint is taken.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Globally unique, stable identifier of a split.
///
/// Cheap to clone: the identifier is shared, not copied, on the record hot path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SplitId(Arc<str>);

impl SplitId {
    /// Create a new split identifier.
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Return the inner string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SplitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SplitId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SplitId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// Identity of a parallel reader instance (its subtask index).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ReaderId(pub u32);

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registration info of a reader, handed to the enumerator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderInfo {
    /// Subtask index of the reader.
    pub reader_id: ReaderId,
    /// Optional location hint (host name, rack) for locality-aware assignment.
    pub location: Option<String>,
}

impl ReaderInfo {
    /// Creates reader info without a location hint.
    #[must_use]
    pub fn new(reader_id: ReaderId) -> Self {
        Self {
            reader_id,
            location: None,
        }
    }

    /// Sets the location hint.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Whether a source has a definite end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Boundedness {
    /// The source ends once every split has been read.
    Bounded,
    /// The source may discover new splits forever.
    ContinuousUnbounded,
}

str_enum!(Boundedness, lowercase, "invalid boundedness",
    Bounded => "bounded", "batch";
    ContinuousUnbounded => "continuous_unbounded", "unbounded", "continuous", "streaming"
);

impl Boundedness {
    /// Returns `true` for [`Boundedness::Bounded`].
    #[must_use]
    pub fn is_bounded(self) -> bool {
        matches!(self, Self::Bounded)
    }
}

/// An immutable unit of source work.
pub trait SourceSplit: Clone + fmt::Debug + Send + Sync + 'static {
    /// Mutable, reader-private progress for this split type.
    type State: SplitState<Split = Self>;

    /// The split's stable identifier.
    fn split_id(&self) -> &SplitId;

    /// Converts the split into its mutable progress state when a reader
    /// takes ownership. The state starts at the position the split carries.
    fn into_state(self) -> Self::State;
}

/// Mutable progress of one owned split.
///
/// Only the reader's owning task mutates a state; fetchers never see it.
pub trait SplitState: Send + 'static {
    /// The split type this state snapshots into.
    type Split: SourceSplit<State = Self>;

    /// The split's stable identifier.
    fn split_id(&self) -> &SplitId;

    /// Snapshots the current progress as an immutable split value.
    fn to_split(&self) -> Self::Split;

    /// Records still to be read, if the split declares a total.
    fn pending_records(&self) -> Option<u64> {
        None
    }

    /// Bytes still to be read, if the split declares a total size.
    fn pending_bytes(&self) -> Option<u64> {
        None
    }
}
