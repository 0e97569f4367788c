//! Directory-scanning enumerator.
//!
//! Discovered files become splits in path order. A split request is parked
//! until a split is available; a bounded source answers parked requests with
//! no-more-splits once its single scan has completed and the pool is empty.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use laminar_source::checkpoint::EnumeratorCheckpoint;
use laminar_source::enumerator::{EnumeratorContext, SplitEnumerator};
use laminar_source::{ReaderId, Result, SourceSplit};

use super::config::LineFileConfig;
use super::split::FileSplit;

/// Checkpointed enumerator state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEnumeratorState {
    /// Every path turned into a split so far.
    pub seen: BTreeSet<PathBuf>,
    /// Whether the one-shot scan of a bounded source has completed.
    pub discovery_done: bool,
}

/// Turns files of a directory into splits.
#[derive(Debug)]
pub struct FileEnumerator {
    config: LineFileConfig,
    state: FileEnumeratorState,
    pending: VecDeque<FileSplit>,
    waiting: BTreeSet<ReaderId>,
}

impl FileEnumerator {
    pub(crate) fn new(
        config: LineFileConfig,
        state: FileEnumeratorState,
        pending: Vec<FileSplit>,
    ) -> Self {
        Self {
            config,
            state,
            pending: pending.into(),
            waiting: BTreeSet::new(),
        }
    }

    fn on_discovered(
        &mut self,
        ctx: &mut EnumeratorContext<Self>,
        files: Vec<(PathBuf, u64)>,
    ) -> Result<()> {
        let mut added = 0usize;
        for (path, length) in files {
            if self.state.seen.insert(path.clone()) {
                self.pending.push_back(FileSplit::new(path, length));
                added += 1;
            }
        }
        if self.config.boundedness.is_bounded() {
            self.state.discovery_done = true;
        }
        if added > 0 {
            tracing::info!(
                directory = %self.config.directory.display(),
                files = added,
                "Discovered new files"
            );
        }
        self.serve_waiting(ctx)
    }

    fn serve_waiting(&mut self, ctx: &mut EnumeratorContext<Self>) -> Result<()> {
        let exhausted = self.config.boundedness.is_bounded() && self.state.discovery_done;
        let waiting: Vec<ReaderId> = self.waiting.iter().copied().collect();
        for reader in waiting {
            if !ctx.is_registered(reader) {
                self.waiting.remove(&reader);
                continue;
            }
            if let Some(split) = self.pending.pop_front() {
                tracing::debug!(reader = %reader, split = %split.split_id(), "Assigning file split");
                ctx.assign_split(split, reader)?;
                self.waiting.remove(&reader);
            } else if exhausted {
                ctx.signal_no_more_splits(reader)?;
                self.waiting.remove(&reader);
            } else {
                break;
            }
        }
        ctx.metrics().set_unassigned_splits(self.pending.len());
        Ok(())
    }
}

impl SplitEnumerator for FileEnumerator {
    type Split = FileSplit;
    type State = FileEnumeratorState;

    fn start(&mut self, ctx: &mut EnumeratorContext<Self>) -> Result<()> {
        let directory = self.config.directory.clone();
        let extension = self.config.extension.clone();
        if self.config.boundedness.is_bounded() {
            if !self.state.discovery_done {
                ctx.call_async(
                    move || list_files(&directory, extension.as_deref()),
                    |enumerator: &mut Self, ctx: &mut EnumeratorContext<Self>, files: Result<Vec<(PathBuf, u64)>>| {
                        enumerator.on_discovered(ctx, files?)
                    },
                );
            }
        } else {
            ctx.call_async_periodically(
                Duration::ZERO,
                self.config.discovery_interval,
                move || list_files(&directory, extension.as_deref()),
                |enumerator: &mut Self, ctx: &mut EnumeratorContext<Self>, files: Result<Vec<(PathBuf, u64)>>| {
                    match files {
                        Ok(files) => enumerator.on_discovered(ctx, files),
                        Err(e) => {
                            tracing::warn!(
                                directory = %enumerator.config.directory.display(),
                                error = %e,
                                "Directory scan failed"
                            );
                            Ok(())
                        }
                    }
                },
            );
        }
        ctx.metrics().set_unassigned_splits(self.pending.len());
        Ok(())
    }

    fn handle_split_request(
        &mut self,
        ctx: &mut EnumeratorContext<Self>,
        reader: ReaderId,
        _location: Option<&str>,
    ) -> Result<()> {
        self.waiting.insert(reader);
        self.serve_waiting(ctx)
    }

    fn add_splits_back(
        &mut self,
        ctx: &mut EnumeratorContext<Self>,
        splits: Vec<FileSplit>,
        reader: ReaderId,
    ) -> Result<()> {
        tracing::debug!(reader = %reader, count = splits.len(), "File splits returned");
        self.waiting.remove(&reader);
        for split in splits.into_iter().rev() {
            self.pending.push_front(split);
        }
        self.serve_waiting(ctx)
    }

    fn add_reader(&mut self, _ctx: &mut EnumeratorContext<Self>, _reader: ReaderId) -> Result<()> {
        Ok(())
    }

    fn snapshot_state(
        &mut self,
        _checkpoint_id: u64,
    ) -> Result<EnumeratorCheckpoint<FileEnumeratorState, FileSplit>> {
        Ok(EnumeratorCheckpoint::new(
            self.state.clone(),
            self.pending.iter().cloned().collect(),
        ))
    }
}

/// Lists regular files of `directory` with their lengths, sorted by path.
pub(crate) fn list_files(directory: &Path, extension: Option<&str>) -> Result<Vec<(PathBuf, u64)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let path = entry.path();
        if let Some(ext) = extension {
            if path.extension().and_then(|e| e.to_str()) != Some(ext) {
                continue;
            }
        }
        files.push((path, metadata.len()));
    }
    files.sort();
    Ok(files)
}
