//! Dedicated writer task per connection.
//!
//! The event loop never writes to a socket itself: it hands frames to the
//! connection's writer task over a bounded mpsc channel and moves on.
//!
//! # Architecture
//!
//! ```text
//! Event loop ─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► SendQueue ─► Socket
//! ```
//!
//! The writer drains whatever is ready into a [`SendQueue`] and flushes it
//! with vectored writes, so several frames usually go out in one syscall.
//! Object bytes are written straight from their shared `Bytes` handle.
//!
//! A write error ends the task with `Err`. The server watches the task's
//! `JoinHandle` and turns that into a close of the connection.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, ShardStoreError};
use crate::protocol::{OutboundFrame, SendQueue, MAX_IO_SLICES};

/// Default channel capacity, in frames.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Maximum frames to batch in a single flush.
const MAX_BATCH_SIZE: usize = 64;

/// Sending side of a connection's outbound channel.
///
/// Cheaply cloneable. Dropping every handle stops the task once the queued
/// frames are written.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
}

impl WriterHandle {
    /// Queue a frame without waiting.
    ///
    /// # Errors
    ///
    /// `Backpressure` if the channel is full, `ConnectionClosed` if the
    /// writer task has exited.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ShardStoreError::Backpressure(self.pending_count()),
            mpsc::error::TrySendError::Closed(_) => ShardStoreError::ConnectionClosed,
        })
    }

    /// Queue a frame, waiting for channel space.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| ShardStoreError::ConnectionClosed)
    }

    /// Frames queued in the channel and not yet picked up by the writer.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Start a writer task owning `writer`.
///
/// The `JoinHandle` resolves when every handle is dropped and the queue is
/// flushed, or on the first write error.
pub fn spawn_writer_task<W>(writer: W, capacity: usize) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

/// Drain the channel into `queue` and flush, one batch at a time.
async fn writer_loop<W>(mut rx: mpsc::Receiver<OutboundFrame>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut queue = SendQueue::new();

    loop {
        let Some(first) = rx.recv().await else {
            // Every handle dropped.
            let _ = writer.shutdown().await;
            return Ok(());
        };
        queue.enqueue(first);

        let mut batch = 1;
        while batch < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => {
                    queue.enqueue(frame);
                    batch += 1;
                }
                Err(_) => break,
            }
        }

        if let Err(e) = write_queue(&mut writer, &mut queue).await {
            tracing::error!(error = %e, "write failed");
            return Err(e);
        }
    }
}

/// Write the whole queue, resuming after partial writes.
pub(crate) async fn write_queue<W>(writer: &mut W, queue: &mut SendQueue) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while !queue.is_empty() {
        let written = {
            let slices = queue.io_slices(MAX_IO_SLICES);
            writer.write_vectored(&slices).await?
        };
        queue.consume(written)?;
    }
    writer.flush().await?;
    Ok(())
}
