//! Assignment history used to hand splits back after a reader failure.
//!
//! Assignments are grouped by the checkpoint whose snapshot first covers
//! them. When a reader fails and restarts from checkpoint `c`, every split
//! assigned to it in a group newer than `c` (or not yet covered by any
//! snapshot) is missing from the reader's restored state and must go back to
//! the enumerator.

use std::collections::BTreeMap;

use crate::split::ReaderId;

/// Per-reader assignment history, pruned on checkpoint completion.
#[derive(Debug)]
pub struct SplitAssignmentTracker<S> {
    uncheckpointed: BTreeMap<ReaderId, Vec<S>>,
    by_checkpoint: BTreeMap<u64, BTreeMap<ReaderId, Vec<S>>>,
}

impl<S> Default for SplitAssignmentTracker<S> {
    fn default() -> Self {
        Self {
            uncheckpointed: BTreeMap::new(),
            by_checkpoint: BTreeMap::new(),
        }
    }
}

impl<S: Clone> SplitAssignmentTracker<S> {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records splits just assigned to `reader`.
    pub fn record_assignment(&mut self, reader: ReaderId, splits: &[S]) {
        if splits.is_empty() {
            return;
        }
        self.uncheckpointed
            .entry(reader)
            .or_default()
            .extend_from_slice(splits);
    }

    /// Attributes every assignment since the previous snapshot to `checkpoint_id`.
    pub fn snapshot(&mut self, checkpoint_id: u64) {
        if self.uncheckpointed.is_empty() {
            return;
        }
        let assignments = std::mem::take(&mut self.uncheckpointed);
        let group = self.by_checkpoint.entry(checkpoint_id).or_default();
        for (reader, splits) in assignments {
            group.entry(reader).or_default().extend(splits);
        }
    }

    /// Drops history covered by the completed checkpoint.
    pub fn on_checkpoint_complete(&mut self, checkpoint_id: u64) {
        self.by_checkpoint = self.by_checkpoint.split_off(&checkpoint_id.saturating_add(1));
    }

    /// Removes and returns the splits assigned to `reader` after
    /// `restored_checkpoint` (all tracked splits if `None`).
    pub fn assignments_after(&mut self, reader: ReaderId, restored_checkpoint: Option<u64>) -> Vec<S> {
        let mut splits = Vec::new();
        for (checkpoint_id, group) in &mut self.by_checkpoint {
            if restored_checkpoint.is_some_and(|restored| *checkpoint_id <= restored) {
                continue;
            }
            if let Some(assigned) = group.remove(&reader) {
                splits.extend(assigned);
            }
        }
        self.by_checkpoint.retain(|_, group| !group.is_empty());
        if let Some(assigned) = self.uncheckpointed.remove(&reader) {
            splits.extend(assigned);
        }
        splits
    }

    /// Forgets everything recorded for `reader`.
    pub fn remove_reader(&mut self, reader: ReaderId) {
        self.uncheckpointed.remove(&reader);
        for group in self.by_checkpoint.values_mut() {
            group.remove(&reader);
        }
        self.by_checkpoint.retain(|_, group| !group.is_empty());
    }

    /// Number of checkpoints with retained history.
    #[must_use]
    pub fn pending_checkpoints(&self) -> usize {
        self.by_checkpoint.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignments_after_restored_checkpoint() {
        let mut t = SplitAssignmentTracker::new();
        let r = ReaderId(0);
        t.record_assignment(r, &["a"]);
        t.snapshot(1);
        t.record_assignment(r, &["b"]);
        t.snapshot(2);
        t.record_assignment(r, &["c"]);

        // Restored from 1: "a" is in the reader's state; "b" and "c" are not.
        assert_eq!(t.assignments_after(r, Some(1)), vec!["b", "c"]);
        assert!(t.assignments_after(r, Some(1)).is_empty());
    }

    #[test]
    fn test_no_restored_checkpoint_returns_everything() {
        let mut t = SplitAssignmentTracker::new();
        t.record_assignment(ReaderId(0), &["a"]);
        t.record_assignment(ReaderId(1), &["x"]);
        t.snapshot(5);
        t.record_assignment(ReaderId(0), &["b"]);
        assert_eq!(t.assignments_after(ReaderId(0), None), vec!["a", "b"]);
        assert_eq!(t.assignments_after(ReaderId(1), None), vec!["x"]);
        assert_eq!(t.pending_checkpoints(), 0);
    }

    #[test]
    fn test_completion_prunes() {
        let mut t = SplitAssignmentTracker::new();
        let r = ReaderId(3);
        t.record_assignment(r, &[1]);
        t.snapshot(1);
        t.record_assignment(r, &[2]);
        t.snapshot(2);
        t.on_checkpoint_complete(1);
        assert_eq!(t.pending_checkpoints(), 1);
        assert_eq!(t.assignments_after(r, Some(1)), vec![2]);
    }

    #[test]
    fn test_remove_reader() {
        let mut t = SplitAssignmentTracker::new();
        t.record_assignment(ReaderId(0), &[1]);
        t.snapshot(1);
        t.record_assignment(ReaderId(0), &[2]);
        t.remove_reader(ReaderId(0));
        assert!(t.assignments_after(ReaderId(0), None).is_empty());
    }
}
