//! Per-connection state.
//!
//! Each socket gets a reader task (frames in, [`Event`]s out to the server
//! loop) and a writer task (see [`crate::writer`]). The server loop owns the
//! [`Connection`] value and is the only place its state changes.
//!
//! Replies to forwarded requests can arrive in any order. [`ResponseOrder`]
//! holds them back until every earlier forwarded request of the same
//! connection has been answered, so clients always see replies to their
//! remote requests in issue order.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, ShardStoreError};
use crate::protocol::{FrameBuffer, Message, MessageClass, OutboundFrame, ShardId};
use crate::writer::WriterHandle;

/// Stable handle for a connection; never reused within a server run.
pub type ConnectionId = u64;

/// Position of a forwarded request in its connection's reply order.
pub type Slot = u64;

/// Read buffer size per socket read.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// What is on the other end of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// A client speaking Local-class messages.
    Client,
    /// A peer we dialed; our forwarded requests go out on it.
    PeerDialed(ShardId),
    /// A peer that dialed us; its requests are answered on it.
    PeerAccepted,
}

impl ConnectionKind {
    /// Message class decoded from this connection.
    pub fn class(self) -> MessageClass {
        match self {
            ConnectionKind::Client => MessageClass::Local,
            ConnectionKind::PeerDialed(_) | ConnectionKind::PeerAccepted => MessageClass::Remote,
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Client => f.write_str("client"),
            ConnectionKind::PeerDialed(shard) => write!(f, "peer(shard {})", shard),
            ConnectionKind::PeerAccepted => f.write_str("peer(accepted)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Closing,
    Closed,
}

/// Sent from connection tasks to the server loop.
#[derive(Debug)]
pub enum Event {
    /// One decoded message.
    Message { conn: ConnectionId, msg: Message },
    /// Reader stopped. `error` is `None` on a clean EOF.
    Closed {
        conn: ConnectionId,
        error: Option<ShardStoreError>,
    },
}

/// Reply reassembly for one connection.
///
/// `expect` reserves a slot in issue order, `fill` stores a reply for it, and
/// `take_ready` releases the longest prefix of filled slots.
#[derive(Debug)]
pub struct ResponseOrder<T> {
    next_slot: Slot,
    expected: VecDeque<Slot>,
    buffered: HashMap<Slot, T>,
}

impl<T> Default for ResponseOrder<T> {
    fn default() -> Self {
        Self {
            next_slot: 0,
            expected: VecDeque::new(),
            buffered: HashMap::new(),
        }
    }
}

impl<T> ResponseOrder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next slot.
    pub fn expect(&mut self) -> Slot {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.expected.push_back(slot);
        slot
    }

    /// Store the reply for `slot`. Returns false if the slot is unknown or
    /// already filled.
    pub fn fill(&mut self, slot: Slot, reply: T) -> bool {
        if !self.expected.contains(&slot) || self.buffered.contains_key(&slot) {
            return false;
        }
        self.buffered.insert(slot, reply);
        true
    }

    /// Pop replies whose every predecessor is already released.
    pub fn take_ready(&mut self) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some(front) = self.expected.front() {
            let Some(reply) = self.buffered.remove(front) else {
                break;
            };
            self.expected.pop_front();
            ready.push(reply);
        }
        ready
    }

    /// Slots still waiting to be released.
    pub fn pending(&self) -> usize {
        self.expected.len()
    }
}

/// A live connection as seen by the server loop.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    kind: ConnectionKind,
    state: ConnectionState,
    writer: WriterHandle,
    reader: Option<JoinHandle<()>>,
    order: ResponseOrder<OutboundFrame>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        kind: ConnectionKind,
        writer: WriterHandle,
        reader: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            kind,
            state: ConnectionState::Active,
            writer,
            reader: Some(reader),
            order: ResponseOrder::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Queue a frame for writing now.
    pub fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.state != ConnectionState::Active {
            return Err(ShardStoreError::ConnectionClosed);
        }
        self.writer.try_send(frame)
    }

    /// Reserve a reply slot for a forwarded request.
    pub fn expect_reply(&mut self) -> Slot {
        self.order.expect()
    }

    /// Forwarded requests this connection is still owed a reply for.
    pub fn pending_replies(&self) -> usize {
        self.order.pending()
    }

    /// Buffer the reply for `slot` and send whatever is now in order.
    pub fn deliver(&mut self, slot: Slot, frame: OutboundFrame) -> Result<()> {
        if !self.order.fill(slot, frame) {
            tracing::warn!(conn = self.id, slot, "reply for unknown slot");
            return Ok(());
        }
        for frame in self.order.take_ready() {
            self.send(frame)?;
        }
        Ok(())
    }

    /// Move to `Closing`. Returns false if already past `Active`, so cleanup
    /// runs once.
    pub fn begin_close(&mut self) -> bool {
        if self.state != ConnectionState::Active {
            return false;
        }
        self.state = ConnectionState::Closing;
        true
    }

    /// Stop the reader and release the writer. Frames already handed to the
    /// writer are still flushed.
    pub fn finish_close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.state = ConnectionState::Closed;
    }
}

/// Read frames from `reader`, decode them as `class`, forward to `events`.
///
/// Always ends with one `Event::Closed`.
pub(crate) async fn read_loop<R>(
    conn: ConnectionId,
    class: MessageClass,
    reader: R,
    max_frame_size: u32,
    events: mpsc::Sender<Event>,
) where
    R: AsyncRead + Unpin,
{
    let error = read_messages(conn, class, reader, max_frame_size, &events)
        .await
        .err();
    let _ = events.send(Event::Closed { conn, error }).await;
}

async fn read_messages<R>(
    conn: ConnectionId,
    class: MessageClass,
    mut reader: R,
    max_frame_size: u32,
    events: &mpsc::Sender<Event>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_frame(max_frame_size);
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()), // Connection closed
            Ok(n) => n,
            Err(e) => return Err(ShardStoreError::Io(e)),
        };

        for payload in frame_buffer.push(&buf[..n])? {
            let msg = Message::decode(class, payload)?;
            if events.send(Event::Message { conn, msg }).await.is_err() {
                // Server loop is gone.
                return Ok(());
            }
        }
    }
}
