//! Outbound frames and the send queue.
//!
//! An [`OutboundFrame`] is a frame split in two segments: the length prefix
//! plus every inline field (`head`), and the last field (`tail`). The tail is
//! usually an object handed out by the store, so it is sent straight from the
//! shared `Bytes` without copying, and the handle keeps the bytes alive until
//! fully written even if the object is deleted meanwhile.
//!
//! [`SendQueue`] holds segments in order and absorbs partial writes: after a
//! short write the front segment is advanced in place, nothing is re-copied.
//! [`SendQueue::drain_send`] drives a blocking or non-blocking `std::io::Write`;
//! the connection writer task drives the same queue through `AsyncWrite` (see
//! `writer::write_queue`). Both account for writes with [`SendQueue::consume`].

use std::collections::VecDeque;
use std::io::{self, IoSlice, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::message::Message;
use super::wire_format::LENGTH_FIELD_SIZE;

/// Maximum number of slices handed to one vectored write.
pub const MAX_IO_SLICES: usize = 64;

/// A frame ready to be written.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Length prefix and every byte before the last field.
    pub head: Bytes,
    /// Last field (can be empty).
    pub tail: Bytes,
}

impl OutboundFrame {
    /// Frame a pre-encoded payload.
    pub fn from_payload(payload: Bytes) -> Self {
        let mut head = BytesMut::with_capacity(LENGTH_FIELD_SIZE);
        head.put_u32_le(frame_length(payload.len()));
        Self {
            head: head.freeze(),
            tail: payload,
        }
    }

    /// Frame a message, sharing its last field instead of copying it.
    pub fn from_message(msg: &Message) -> Self {
        let (body, tail) = msg.encode_head();
        let mut head = BytesMut::with_capacity(LENGTH_FIELD_SIZE + body.len());
        head.put_u32_le(frame_length(body.len() + tail.len()));
        head.extend_from_slice(&body);
        Self {
            head: head.freeze(),
            tail,
        }
    }

    /// Total size on the wire, length prefix included.
    #[inline]
    pub fn size(&self) -> usize {
        self.head.len() + self.tail.len()
    }
}

impl From<&Message> for OutboundFrame {
    fn from(msg: &Message) -> Self {
        Self::from_message(msg)
    }
}

/// Value of the length field for a payload of `payload_len` bytes.
#[inline]
fn frame_length(payload_len: usize) -> u32 {
    (LENGTH_FIELD_SIZE + payload_len) as u32
}

/// Build a complete frame (length prefix plus payload) as one buffer.
pub fn build_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_FIELD_SIZE + payload.len());
    buf.put_u32_le(frame_length(payload.len()));
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Ordered queue of outbound bytes. Never blocks.
#[derive(Debug, Default)]
pub struct SendQueue {
    segments: VecDeque<Bytes>,
    pending: usize,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a payload, prefixing its 4-byte length.
    pub fn enqueue_frame(&mut self, payload: Bytes) {
        self.enqueue(OutboundFrame::from_payload(payload));
    }

    /// Queue an already framed message.
    pub fn enqueue(&mut self, frame: OutboundFrame) {
        self.push_segment(frame.head);
        self.push_segment(frame.tail);
    }

    fn push_segment(&mut self, segment: Bytes) {
        if !segment.is_empty() {
            self.pending += segment.len();
            self.segments.push_back(segment);
        }
    }

    /// Slices for a vectored write, front first, at most `max` of them.
    pub fn io_slices(&self, max: usize) -> Vec<IoSlice<'_>> {
        self.segments
            .iter()
            .take(max)
            .map(|s| IoSlice::new(s))
            .collect()
    }

    /// Drop `n` written bytes from the front.
    pub fn advance(&mut self, mut n: usize) {
        debug_assert!(n <= self.pending);
        self.pending -= n.min(self.pending);
        while n > 0 {
            let Some(front) = self.segments.front_mut() else {
                return;
            };
            if n < front.len() {
                front.advance(n);
                return;
            }
            n -= front.len();
            self.segments.pop_front();
        }
    }

    /// Account for a write that accepted `written` bytes.
    ///
    /// # Errors
    ///
    /// `WriteZero` if nothing was accepted; the queue is left unchanged.
    pub fn consume(&mut self, written: usize) -> io::Result<()> {
        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "socket accepted no bytes",
            ));
        }
        self.advance(written);
        Ok(())
    }

    /// Write as much as `writer` accepts without blocking.
    ///
    /// Returns the number of bytes written. Stops early on `WouldBlock`;
    /// whatever was not accepted stays queued for the next call.
    ///
    /// # Errors
    ///
    /// `WriteZero` if the writer accepts nothing, or any other I/O error.
    pub fn drain_send<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while !self.is_empty() {
            let result = {
                let slices = self.io_slices(MAX_IO_SLICES);
                writer.write_vectored(&slices)
            };
            match result {
                Ok(n) => {
                    self.consume(n)?;
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Bytes queued and not yet written.
    #[inline]
    pub fn pending_bytes(&self) -> usize {
        self.pending
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameBuffer, MessageClass};

    /// Accepts at most `limit` bytes per call, then `WouldBlock` once `budget`
    /// is spent.
    struct Trickle {
        out: Vec<u8>,
        limit: usize,
        budget: usize,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.limit).min(self.budget);
            self.out.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_enqueue_frame_prefixes_length() {
        let mut queue = SendQueue::new();
        queue.enqueue_frame(Bytes::from_static(b"1abc"));

        let mut out = Vec::new();
        let n = queue.drain_send(&mut out).unwrap();
        assert_eq!(n, 8);
        assert_eq!(out, b"\x08\x00\x00\x001abc");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_from_message_shares_tail() {
        let object = Bytes::from(vec![7u8; 100]);
        let msg = Message::LocalStore {
            name: Bytes::from_static(b"k"),
            object: object.clone(),
        };
        let frame = OutboundFrame::from_message(&msg);

        assert_eq!(frame.tail.as_ptr(), object.as_ptr());
        assert_eq!(frame.size(), 4 + msg.encoded_len());
        assert_eq!(&frame.head[..4], &(frame.size() as u32).to_le_bytes());
    }

    #[test]
    fn test_partial_writes_resume_without_loss() {
        let mut queue = SendQueue::new();
        let msgs: Vec<Message> = (0..5)
            .map(|i| Message::LocalStore {
                name: Bytes::from(format!("key{}", i)),
                object: Bytes::from(vec![i as u8; 37]),
            })
            .collect();
        for msg in &msgs {
            queue.enqueue(OutboundFrame::from_message(msg));
        }
        let total = queue.pending_bytes();

        let mut sink = Trickle {
            out: Vec::new(),
            limit: 3,
            budget: 10,
        };
        // Budget runs out: returns early with data still queued.
        assert_eq!(queue.drain_send(&mut sink).unwrap(), 10);
        assert_eq!(queue.pending_bytes(), total - 10);

        sink.budget = usize::MAX;
        queue.drain_send(&mut sink).unwrap();
        assert!(queue.is_empty());

        let mut frames = FrameBuffer::new();
        let decoded: Vec<Message> = frames
            .push(&sink.out)
            .unwrap()
            .into_iter()
            .map(|p| Message::decode(MessageClass::Local, p).unwrap())
            .collect();
        assert_eq!(decoded, msgs);
    }

    #[test]
    fn test_advance_across_segments() {
        let mut queue = SendQueue::new();
        queue.enqueue(OutboundFrame {
            head: Bytes::from_static(b"abc"),
            tail: Bytes::from_static(b"defgh"),
        });

        queue.advance(4);
        assert_eq!(queue.pending_bytes(), 4);
        let slices = queue.io_slices(MAX_IO_SLICES);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"efgh");
    }

    #[test]
    fn test_empty_tail_is_skipped() {
        let mut queue = SendQueue::new();
        queue.enqueue(OutboundFrame::from_message(&Message::local_error("")));
        assert_eq!(queue.io_slices(MAX_IO_SLICES).len(), 1);
        assert_eq!(queue.pending_bytes(), 5);
    }

    #[test]
    fn test_write_zero_is_an_error() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut queue = SendQueue::new();
        queue.enqueue_frame(Bytes::from_static(b"x"));
        let err = queue.drain_send(&mut Closed).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert_eq!(queue.pending_bytes(), 5);
    }

    #[test]
    fn test_build_frame() {
        assert_eq!(&build_frame(b"0ok")[..], b"\x07\x00\x00\x000ok");
    }
}
