//! Line reading and emitting.

use std::collections::{HashSet, VecDeque};
use std::io::SeekFrom;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

use laminar_source::fetcher::{RecordsBySplits, SplitReader, SplitsChange};
use laminar_source::reader::{RecordEmitter, SplitOutput};
use laminar_source::{Result, SourceSplit, SplitId};

use super::split::{FileSplit, FileSplitState};

/// One raw line, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRecord {
    /// Line bytes.
    pub bytes: Vec<u8>,
    /// Byte offset just past the line terminator.
    pub end_offset: u64,
}

#[derive(Debug)]
struct OpenFile {
    split: FileSplit,
    reader: BufReader<File>,
    /// Offset of the first byte of `partial`.
    position: u64,
    /// Bytes of a line not yet terminated.
    partial: Vec<u8>,
    /// Lines read but not yet returned.
    lines: Vec<LineRecord>,
}

impl OpenFile {
    async fn open(split: &FileSplit) -> Result<Self> {
        let mut file = File::open(&split.path).await?;
        file.seek(SeekFrom::Start(split.offset)).await?;
        Ok(Self {
            split: split.clone(),
            reader: BufReader::new(file),
            position: split.offset,
            partial: Vec::new(),
            lines: Vec::new(),
        })
    }

    fn complete_line(&mut self) {
        let consumed = self.partial.len() as u64;
        let mut bytes = std::mem::take(&mut self.partial);
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
        }
        self.position += consumed;
        self.lines.push(LineRecord {
            bytes,
            end_offset: self.position,
        });
    }

    /// Reads up to `max` lines. Returns `true` at end of file.
    ///
    /// Cancel-safe: partial lines and completed lines stay in `self`.
    async fn read_lines(&mut self, max: usize) -> Result<bool> {
        while self.lines.len() < max {
            let read = self.reader.read_until(b'\n', &mut self.partial).await?;
            if read == 0 {
                if !self.partial.is_empty() {
                    self.complete_line();
                }
                return Ok(true);
            }
            if self.partial.last() == Some(&b'\n') {
                self.complete_line();
            }
        }
        Ok(false)
    }
}

/// Reads the lines of its files, one file at a time in assignment order.
#[derive(Debug)]
pub struct LineSplitReader {
    queue: VecDeque<FileSplit>,
    current: Option<OpenFile>,
    paused: HashSet<SplitId>,
    max_lines: usize,
}

impl LineSplitReader {
    pub(crate) fn new(max_lines: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            current: None,
            paused: HashSet::new(),
            max_lines: max_lines.max(1),
        }
    }

    fn take_lines(open: &mut OpenFile, batch: &mut RecordsBySplits<LineRecord>) {
        if !open.lines.is_empty() {
            batch.add_all(open.split.split_id(), open.lines.drain(..));
        }
    }
}

#[async_trait]
impl SplitReader for LineSplitReader {
    type Split = FileSplit;
    type Record = LineRecord;

    async fn fetch(&mut self) -> Result<RecordsBySplits<LineRecord>> {
        let mut batch = RecordsBySplits::new();

        if self.current.is_none() {
            let Some(index) = self
                .queue
                .iter()
                .position(|s| !self.paused.contains(s.split_id()))
            else {
                return Ok(batch);
            };
            let open = OpenFile::open(&self.queue[index]).await?;
            self.queue.remove(index);
            tracing::debug!(split = %open.split.split_id(), offset = open.position, "Opened file split");
            self.current = Some(open);
        }
        let Some(open) = self.current.as_mut() else {
            return Ok(batch);
        };

        if self.paused.contains(open.split.split_id()) {
            Self::take_lines(open, &mut batch);
            let parked = open.split.clone().at_offset(open.position);
            self.current = None;
            self.queue.push_front(parked);
            return Ok(batch);
        }

        let eof = open.read_lines(self.max_lines).await?;
        Self::take_lines(open, &mut batch);
        if eof {
            let id = open.split.split_id().clone();
            tracing::debug!(split = %id, offset = open.position, "File split finished");
            self.current = None;
            batch.finish(id);
        }
        Ok(batch)
    }

    fn handle_splits_change(&mut self, change: SplitsChange<FileSplit>) -> Result<()> {
        match change {
            SplitsChange::Add(splits) => self.queue.extend(splits),
            SplitsChange::Remove(ids) => {
                self.queue.retain(|s| !ids.contains(s.split_id()));
                if self
                    .current
                    .as_ref()
                    .is_some_and(|open| ids.contains(open.split.split_id()))
                {
                    self.current = None;
                }
                for id in &ids {
                    self.paused.remove(id);
                }
            }
        }
        Ok(())
    }

    fn pause_or_resume_splits(&mut self, pause: &[SplitId], resume: &[SplitId]) {
        self.paused.extend(pause.iter().cloned());
        for id in resume {
            self.paused.remove(id);
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.current = None;
        self.queue.clear();
        Ok(())
    }
}

/// Decodes lines as UTF-8. Invalid lines are counted as errors and skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineEmitter;

impl RecordEmitter<LineRecord, String, FileSplitState> for LineEmitter {
    fn emit_record(
        &mut self,
        record: LineRecord,
        output: &mut SplitOutput<'_, String>,
        state: &mut FileSplitState,
    ) -> Result<()> {
        state.0.offset = record.end_offset;
        output.add_bytes_in(record.bytes.len() as u64);
        match String::from_utf8(record.bytes) {
            Ok(line) => output.collect(line),
            Err(_) => {
                tracing::warn!(
                    split = %output.split_id(),
                    offset = record.end_offset,
                    "Skipping line with invalid UTF-8"
                );
                output.record_error();
            }
        }
        Ok(())
    }
}
