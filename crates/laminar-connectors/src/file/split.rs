//! File splits: one file, read from a byte offset.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use laminar_source::{SourceSplit, SplitId, SplitState};

/// One file, read from `offset` to its end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSplit {
    id: SplitId,
    /// File path.
    pub path: PathBuf,
    /// Byte offset of the next unread line.
    pub offset: u64,
    /// File length when the file was discovered.
    pub length: u64,
}

impl FileSplit {
    /// Split for `path` of `length` bytes, read from the start. The split id
    /// is the path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, length: u64) -> Self {
        let path = path.into();
        Self {
            id: SplitId::new(path.to_string_lossy()),
            path,
            offset: 0,
            length,
        }
    }

    /// Same split, positioned at `offset`.
    #[must_use]
    pub fn at_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }
}

/// Reader-side progress of a [`FileSplit`].
#[derive(Debug)]
pub struct FileSplitState(pub(crate) FileSplit);

impl SourceSplit for FileSplit {
    type State = FileSplitState;

    fn split_id(&self) -> &SplitId {
        &self.id
    }

    fn into_state(self) -> FileSplitState {
        FileSplitState(self)
    }
}

impl SplitState for FileSplitState {
    type Split = FileSplit;

    fn split_id(&self) -> &SplitId {
        &self.0.id
    }

    fn to_split(&self) -> FileSplit {
        self.0.clone()
    }

    fn pending_bytes(&self) -> Option<u64> {
        Some(self.0.length.saturating_sub(self.0.offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_bytes() {
        let mut state = FileSplit::new("/in/a.txt", 100).into_state();
        assert_eq!(state.pending_bytes(), Some(100));
        assert_eq!(state.pending_records(), None);
        state.0.offset = 40;
        assert_eq!(state.pending_bytes(), Some(60));
        assert_eq!(state.to_split(), FileSplit::new("/in/a.txt", 100).at_offset(40));
        assert_eq!(state.split_id().as_str(), "/in/a.txt");
    }
}
