//! Async client for the Local-class protocol.
//!
//! Requests can be pipelined: `send` any number of messages, then `recv` the
//! replies. Replies to plain local requests come back in issue order, and so
//! do replies to forwarded (remote) requests among themselves.
//!
//! # Example
//!
//! ```no_run
//! use shardstore::client::{Reply, StoreClient};
//!
//! # async fn demo() -> shardstore::error::Result<()> {
//! let mut client = StoreClient::connect("127.0.0.1:8080").await?;
//! client.store("quokka", "1234").await?;
//! if let Reply::Object { object, .. } = client.lookup("quokka").await? {
//!     assert_eq!(&object[..], b"1234");
//! }
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::{Result, ShardStoreError};
use crate::protocol::{FrameBuffer, Message, MessageClass, OutboundFrame, SendQueue, ShardId};
use crate::writer::write_queue;

/// Read buffer size per socket read.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// A server reply, reduced to what callers act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Success(String),
    Error(String),
    Object { name: Bytes, object: Bytes },
}

impl Reply {
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Object bytes, if this is an object reply.
    pub fn object(&self) -> Option<&Bytes> {
        match self {
            Reply::Object { object, .. } => Some(object),
            _ => None,
        }
    }
}

impl TryFrom<Message> for Reply {
    type Error = ShardStoreError;

    fn try_from(msg: Message) -> Result<Self> {
        let text = |b: Bytes| String::from_utf8_lossy(&b).into_owned();
        match msg {
            Message::LocalSuccess { message } => Ok(Reply::Success(text(message))),
            Message::LocalError { message } => Ok(Reply::Error(text(message))),
            Message::LocalStore { name, object } => Ok(Reply::Object { name, object }),
            other => Err(ShardStoreError::Invalid(format!(
                "unexpected reply {}",
                other
            ))),
        }
    }
}

/// Connection to a storage server's client port.
pub struct StoreClient<S = TcpStream> {
    stream: S,
    frames: FrameBuffer,
    queue: SendQueue,
    buf: Vec<u8>,
}

impl StoreClient<TcpStream> {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }
}

impl<S> StoreClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already connected stream.
    pub fn from_stream(stream: S) -> Self {
        Self {
            stream,
            frames: FrameBuffer::new(),
            queue: SendQueue::new(),
            buf: vec![0u8; READ_CHUNK_SIZE],
        }
    }

    /// Write one message.
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        self.queue.enqueue(OutboundFrame::from_message(msg));
        write_queue(&mut self.stream, &mut self.queue).await
    }

    /// Read the next reply.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` if the server closes the stream first.
    pub async fn recv(&mut self) -> Result<Message> {
        loop {
            if let Some(payload) = self.frames.try_extract_frame()? {
                return Ok(Message::decode(MessageClass::Local, payload)?);
            }
            let n = self.stream.read(&mut self.buf).await?;
            if n == 0 {
                return Err(ShardStoreError::ConnectionClosed);
            }
            self.frames.feed(&self.buf[..n]);
        }
    }

    /// Send and wait for the matching reply.
    pub async fn request(&mut self, msg: &Message) -> Result<Reply> {
        self.send(msg).await?;
        Reply::try_from(self.recv().await?)
    }

    pub async fn store(&mut self, key: impl Into<Bytes>, object: impl Into<Bytes>) -> Result<Reply> {
        self.request(&Message::LocalStore {
            name: key.into(),
            object: object.into(),
        })
        .await
    }

    pub async fn lookup(&mut self, key: impl Into<Bytes>) -> Result<Reply> {
        self.request(&Message::LocalLookup { name: key.into() }).await
    }

    pub async fn delete(&mut self, key: impl Into<Bytes>) -> Result<Reply> {
        self.request(&Message::LocalDelete { name: key.into() }).await
    }

    /// Fetch `key` from shard `node` through the connected server.
    pub async fn remote_lookup(&mut self, key: impl Into<Bytes>, node: ShardId) -> Result<Reply> {
        self.request(&Message::LocalRemoteLookup {
            name: key.into(),
            node,
        })
        .await
    }

    pub async fn remote_delete(&mut self, key: impl Into<Bytes>, node: ShardId) -> Result<Reply> {
        self.request(&Message::LocalRemoteDelete {
            name: key.into(),
            node,
        })
        .await
    }

    /// Servers answer this with an error reply.
    pub async fn remote_store(
        &mut self,
        key: impl Into<Bytes>,
        object: impl Into<Bytes>,
        node: ShardId,
    ) -> Result<Reply> {
        self.request(&Message::LocalRemoteStore {
            name: key.into(),
            object: object.into(),
            node,
        })
        .await
    }

    /// Give back the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}
