//! Owning execution task of a [`SourceReader`].
//!
//! The task is the reader's single-writer domain. It applies coordinator
//! events, polls the reader, fires periodic watermarks and serves checkpoint
//! commands, buffering output and flushing it into a bounded channel shared
//! with the other reader tasks of the job.
//!
//! Coordinator events are always applied before a checkpoint command, so a
//! reader snapshot covers every assignment the coordinator made before its
//! own snapshot.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::coordinator::ReaderEvents;
use crate::error::{Result, SourceError};
use crate::event::ReaderEvent;
use crate::metrics::SourceReaderMetrics;
use crate::reader::{InputStatus, SourceReader, StreamElement, VecOutput};
use crate::source::Source;
use crate::split::ReaderId;

/// Capacity of a reader task's command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// An output element tagged with the reader that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedElement<T> {
    /// Producing reader.
    pub reader: ReaderId,
    /// The element.
    pub element: StreamElement<T>,
}

/// Commands served by a reader task.
#[derive(Debug)]
pub enum ReaderCommand {
    /// Snapshot the reader.
    Checkpoint {
        /// Checkpoint being taken.
        checkpoint_id: u64,
        /// Receives the encoded reader checkpoint.
        reply: oneshot::Sender<Result<Bytes>>,
    },
    /// Checkpoint `checkpoint_id` is durable.
    CheckpointComplete {
        /// Completed checkpoint.
        checkpoint_id: u64,
    },
}

/// Handle to a running reader task.
#[derive(Debug)]
pub struct ReaderTaskHandle {
    reader: ReaderId,
    commands: mpsc::Sender<ReaderCommand>,
    cancel: CancellationToken,
    metrics: Arc<SourceReaderMetrics>,
    join: JoinHandle<Result<()>>,
}

impl ReaderTaskHandle {
    /// Reader driven by this task.
    #[must_use]
    pub fn reader(&self) -> ReaderId {
        self.reader
    }

    /// Reader metrics.
    #[must_use]
    pub fn metrics(&self) -> &Arc<SourceReaderMetrics> {
        &self.metrics
    }

    /// Snapshots the reader after all pending coordinator events are applied.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::ReaderClosed` if the task has stopped, or the
    /// reader's serialization error.
    pub async fn checkpoint(&self, checkpoint_id: u64) -> Result<Bytes> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ReaderCommand::Checkpoint {
                checkpoint_id,
                reply,
            })
            .await
            .map_err(|_| SourceError::ReaderClosed)?;
        response.await.map_err(|_| SourceError::ReaderClosed)?
    }

    /// Forwards checkpoint completion. Best effort.
    pub async fn notify_checkpoint_complete(&self, checkpoint_id: u64) {
        let _ = self
            .commands
            .send(ReaderCommand::CheckpointComplete { checkpoint_id })
            .await;
    }

    /// Asks the task to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the task has stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the task and returns its result.
    ///
    /// # Errors
    ///
    /// Returns the reader's failure, or `SourceError::ReaderClosed` if the
    /// task panicked.
    pub async fn join(self) -> Result<()> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(reader = %self.reader, error = %e, "Reader task panicked");
                Err(SourceError::ReaderClosed)
            }
        }
    }
}

/// Spawns the owning task of a started reader.
///
/// `flush_batch_size` bounds the records buffered before a flush; output is
/// also flushed whenever the reader has nothing to emit.
pub fn spawn_reader_task<S: Source>(
    reader: SourceReader<S>,
    events: ReaderEvents<S::Split>,
    output: mpsc::Sender<TaggedElement<S::Output>>,
    flush_batch_size: usize,
) -> ReaderTaskHandle {
    let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let id = reader.reader_id();
    let metrics = Arc::clone(reader.metrics());
    let task = ReaderTask {
        reader,
        events,
        events_open: true,
        commands: command_rx,
        output,
        buffer: VecOutput::new(),
        flush_batch_size: flush_batch_size.max(1),
        cancel: cancel.clone(),
    };
    let join = tokio::spawn(task.run());
    ReaderTaskHandle {
        reader: id,
        commands,
        cancel,
        metrics,
        join,
    }
}

struct ReaderTask<S: Source> {
    reader: SourceReader<S>,
    events: ReaderEvents<S::Split>,
    events_open: bool,
    commands: mpsc::Receiver<ReaderCommand>,
    output: mpsc::Sender<TaggedElement<S::Output>>,
    buffer: VecOutput<S::Output>,
    flush_batch_size: usize,
    cancel: CancellationToken,
}

impl<S: Source> ReaderTask<S> {
    async fn run(mut self) -> Result<()> {
        let id = self.reader.reader_id();
        tracing::debug!(reader = %id, "Reader task started");
        let result = self.read().await;
        self.reader.close().await;
        match &result {
            Ok(true) => self.serve_commands().await,
            Ok(false) => {}
            Err(e) => tracing::error!(reader = %id, error = %e, "Reader task failed"),
        }
        tracing::debug!(reader = %id, "Reader task stopped");
        result.map(|_| ())
    }

    /// Reads until end of input (`Ok(true)`) or cancellation (`Ok(false)`).
    async fn read(&mut self) -> Result<bool> {
        let interval = self.reader.watermark_interval();
        let mut next_watermark = Instant::now() + interval;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            self.drain_events()?;
            while let Ok(command) = self.commands.try_recv() {
                if !self.handle_command(command).await? {
                    return Ok(false);
                }
            }

            let now = Instant::now();
            if now >= next_watermark {
                self.reader.emit_periodic_watermark(now, &mut self.buffer);
                next_watermark = now + interval;
            }

            match self.reader.poll_next(&mut self.buffer)? {
                InputStatus::Record => {
                    if self.buffer.len() >= self.flush_batch_size && !self.flush().await {
                        return Ok(false);
                    }
                }
                InputStatus::EndOfInput => {
                    self.buffer.push(StreamElement::EndOfInput);
                    return Ok(self.flush().await);
                }
                InputStatus::NothingAvailable => {
                    if !self.flush().await {
                        return Ok(false);
                    }
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return Ok(false),
                        event = self.events.recv(), if self.events_open => match event {
                            Some(event) => self.apply_event(event)?,
                            None => self.events_closed(),
                        },
                        command = self.commands.recv() => match command {
                            Some(command) => {
                                if !self.handle_command(command).await? {
                                    return Ok(false);
                                }
                            }
                            None => return Ok(false),
                        },
                        () = tokio::time::sleep_until(next_watermark.into()) => {}
                        () = self.reader.is_available() => {}
                    }
                }
            }
        }
    }

    /// After end of input the task stays around to answer checkpoints.
    async fn serve_commands(&mut self) {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                command = self.commands.recv() => match command {
                    Some(command) => match self.handle_command(command).await {
                        Ok(true) => {}
                        Ok(false) => return,
                        Err(e) => {
                            tracing::warn!(reader = %self.reader.reader_id(), error = %e, "Command failed after end of input");
                        }
                    },
                    None => return,
                },
            }
        }
    }

    fn drain_events(&mut self) -> Result<()> {
        while self.events_open {
            match self.events.try_recv() {
                Ok(event) => self.apply_event(event)?,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => self.events_closed(),
            }
        }
        Ok(())
    }

    fn events_closed(&mut self) {
        tracing::debug!(reader = %self.reader.reader_id(), "Coordinator event channel closed");
        self.events_open = false;
    }

    fn apply_event(&mut self, event: ReaderEvent<S::Split>) -> Result<()> {
        match event {
            ReaderEvent::AddSplits(splits) => self.reader.add_splits(splits),
            ReaderEvent::NoMoreSplits => {
                self.reader.notify_no_more_splits();
                Ok(())
            }
            ReaderEvent::SourceEvent(event) => {
                self.reader.handle_source_event(&event);
                Ok(())
            }
        }
    }

    /// Serves one command. `false` if cancelled while flushing.
    ///
    /// A snapshot is taken only after buffered output has been flushed, and is
    /// followed by a [`StreamElement::CheckpointBarrier`] in the output.
    async fn handle_command(&mut self, command: ReaderCommand) -> Result<bool> {
        match command {
            ReaderCommand::Checkpoint {
                checkpoint_id,
                reply,
            } => {
                self.drain_events()?;
                if !self.flush().await {
                    return Ok(false);
                }
                let snapshot = self.reader.snapshot_bytes(checkpoint_id);
                if snapshot.is_ok() {
                    self.buffer.push(StreamElement::CheckpointBarrier(checkpoint_id));
                    if !self.flush().await {
                        return Ok(false);
                    }
                }
                let _ = reply.send(snapshot);
            }
            ReaderCommand::CheckpointComplete { checkpoint_id } => {
                self.reader.notify_checkpoint_complete(checkpoint_id);
            }
        }
        Ok(true)
    }

    /// Sends buffered output downstream. `false` if cancelled or the
    /// receiver is gone.
    async fn flush(&mut self) -> bool {
        let reader = self.reader.reader_id();
        for element in self.buffer.drain() {
            let tagged = TaggedElement { reader, element };
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return false,
                sent = self.output.send(tagged) => {
                    if sent.is_err() {
                        tracing::debug!(reader = %reader, "Output channel closed");
                        return false;
                    }
                }
            }
        }
        true
    }
}
