//! Reassembly of length-prefixed frames from arbitrary read chunks.
//!
//! Reads land in one `BytesMut`. Parsing is an explicit state machine
//! driven by the pure function
//! [`parse_step`]:
//! - `AwaitingLength`: need the 4-byte little-endian length field
//! - `AwaitingPayload { needed }`: length known, need `needed` bytes in total
//!
//! A frame of declared length `L` is complete once `L` bytes (length field
//! included) are buffered. One push may complete any number of frames.
//!
//! # Example
//!
//! ```
//! use shardstore::protocol::FrameBuffer;
//!
//! let mut frames_in = FrameBuffer::new();
//! let wire = [7u8, 0, 0, 0, b'1', b'a', b'b'];
//!
//! assert!(frames_in.push(&wire[..3]).unwrap().is_empty());
//! let frames = frames_in.push(&wire[3..]).unwrap();
//! assert_eq!(&frames[0][..], b"1ab");
//! ```

use bytes::{Buf, Bytes, BytesMut};

use super::wire_format::{read_u32_le, DEFAULT_MAX_FRAME_SIZE, LENGTH_FIELD_SIZE};
use crate::error::ProtocolError;

const INITIAL_CAPACITY: usize = 64 * 1024;

/// Parser state between reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Waiting for the length field.
    AwaitingLength,
    /// Length field read; frame is complete at `needed` buffered bytes.
    AwaitingPayload { needed: usize },
}

/// Outcome of one parser step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Not enough bytes; keep the new state and wait for more.
    Wait(ParseState),
    /// A complete frame of `len` bytes (length field included) is at the
    /// front of the buffer. State returns to `AwaitingLength`.
    Frame { len: usize },
}

/// Advance the parser over `buffered` without consuming anything.
///
/// # Errors
///
/// `InvalidFrameLength` for a length field below 4, `FrameTooLarge` above
/// `max_frame_size`.
pub fn parse_step(
    state: ParseState,
    buffered: &[u8],
    max_frame_size: u32,
) -> Result<Step, ProtocolError> {
    let needed = match state {
        ParseState::AwaitingLength => {
            if buffered.len() < LENGTH_FIELD_SIZE {
                return Ok(Step::Wait(ParseState::AwaitingLength));
            }
            let length = read_u32_le(buffered, 0);
            if (length as usize) < LENGTH_FIELD_SIZE {
                return Err(ProtocolError::InvalidFrameLength(length));
            }
            if length > max_frame_size {
                return Err(ProtocolError::FrameTooLarge {
                    length,
                    max: max_frame_size,
                });
            }
            length as usize
        }
        ParseState::AwaitingPayload { needed } => needed,
    };

    if buffered.len() >= needed {
        Ok(Step::Frame { len: needed })
    } else {
        Ok(Step::Wait(ParseState::AwaitingPayload { needed }))
    }
}

/// Receive side of one framed stream.
///
/// Extracted payloads are frozen slices of the receive buffer, so no copy
/// happens per frame.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: ParseState,
    max_frame_size: u32,
}

impl FrameBuffer {
    /// 64 KiB initial capacity, 64 MiB frame limit.
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Frames with a length field above `max_frame_size` are rejected.
    pub fn with_max_frame(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            state: ParseState::AwaitingLength,
            max_frame_size,
        }
    }

    /// Append raw bytes without extracting.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Append `data` and return every payload it completes.
    ///
    /// # Errors
    ///
    /// A bad length field. The stream position is lost after one, so drop
    /// the buffer along with the stream.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>, ProtocolError> {
        self.feed(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Next payload with its length field stripped, or `None` until more
    /// bytes arrive.
    pub fn try_extract_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        match parse_step(self.state, &self.buffer, self.max_frame_size)? {
            Step::Wait(state) => {
                self.state = state;
                Ok(None)
            }
            Step::Frame { len } => {
                let mut frame = self.buffer.split_to(len);
                frame.advance(LENGTH_FIELD_SIZE);
                self.state = ParseState::AwaitingLength;
                Ok(Some(frame.freeze()))
            }
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Buffered bytes not yet returned as frames.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop buffered bytes and start over at a frame boundary.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = ParseState::AwaitingLength;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::build_frame;

    #[test]
    fn test_several_frames_in_one_read() {
        let mut frames_in = FrameBuffer::new();
        let parts: [&[u8]; 3] = [b"1hello", b"second", b""];
        let wire: Vec<u8> = parts
            .iter()
            .flat_map(|p| build_frame(p).to_vec())
            .collect();

        let frames = frames_in.push(&wire).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], b"1hello");
        assert_eq!(&frames[1][..], b"second");
        assert!(frames[2].is_empty());
        assert!(frames_in.is_empty());
    }

    #[test]
    fn test_split_inside_length_field_and_payload() {
        let mut frames_in = FrameBuffer::new();
        let wire = build_frame(b"0a payload long enough to split twice");

        assert!(frames_in.push(&wire[..3]).unwrap().is_empty());
        assert_eq!(frames_in.state(), ParseState::AwaitingLength);

        assert!(frames_in.push(&wire[3..14]).unwrap().is_empty());
        assert_eq!(
            frames_in.state(),
            ParseState::AwaitingPayload { needed: wire.len() }
        );

        let frames = frames_in.push(&wire[14..]).unwrap();
        assert_eq!(&frames[0][..], &wire[4..]);
        assert_eq!(frames_in.state(), ParseState::AwaitingLength);
    }

    #[test]
    fn test_exact_boundary() {
        // L - 1 bytes is not a frame, L bytes is.
        let wire = build_frame(b"abc");
        let len = wire.len();
        assert_eq!(len, 7);

        let step = parse_step(ParseState::AwaitingLength, &wire[..len - 1], 1024).unwrap();
        assert_eq!(step, Step::Wait(ParseState::AwaitingPayload { needed: 7 }));

        let step = parse_step(ParseState::AwaitingLength, &wire, 1024).unwrap();
        assert_eq!(step, Step::Frame { len: 7 });
    }

    #[test]
    fn test_length_below_field_size_is_invalid() {
        let mut frames_in = FrameBuffer::new();
        let err = frames_in.push(&[3, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidFrameLength(3));
    }

    #[test]
    fn test_oversized_length_rejected_before_payload() {
        let mut frames_in = FrameBuffer::with_max_frame(100);
        let err = frames_in.push(&1000u32.to_le_bytes()).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::FrameTooLarge {
                length: 1000,
                max: 100
            }
        );
    }

    #[test]
    fn test_megabyte_payload() {
        let mut frames_in = FrameBuffer::new();
        let payload = vec![0xAB; 1024 * 1024];
        let frames = frames_in.push(&build_frame(&payload)).unwrap();
        assert_eq!(frames[0].len(), 1024 * 1024);
    }

    #[test]
    fn test_trailing_partial_frame_stays_buffered() {
        let mut frames_in = FrameBuffer::new();
        let tail = build_frame(b"second");
        let mut wire = build_frame(b"first").to_vec();
        wire.extend_from_slice(&tail[..5]);

        assert_eq!(frames_in.push(&wire).unwrap().len(), 1);
        assert_eq!(frames_in.len(), 5);

        let frames = frames_in.push(&tail[5..]).unwrap();
        assert_eq!(&frames[0][..], b"second");
    }

    #[test]
    fn test_one_byte_reads() {
        let mut frames_in = FrameBuffer::new();
        let mut wire = build_frame(b"hi").to_vec();
        wire.extend_from_slice(&build_frame(b"there"));

        let mut all = Vec::new();
        for byte in &wire {
            all.extend(frames_in.push(&[*byte]).unwrap());
        }
        assert_eq!(all.len(), 2);
        assert_eq!(&all[0][..], b"hi");
        assert_eq!(&all[1][..], b"there");
    }

    #[test]
    fn test_arbitrary_chunking_preserves_frames() {
        let payloads: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; i as usize * 7]).collect();
        let mut wire = Vec::new();
        for p in &payloads {
            wire.extend_from_slice(&build_frame(p));
        }

        for chunk in [1usize, 2, 3, 5, 13, 64, 1000] {
            let mut frames_in = FrameBuffer::new();
            let mut out = Vec::new();
            for piece in wire.chunks(chunk) {
                out.extend(frames_in.push(piece).unwrap());
            }
            assert_eq!(out.len(), payloads.len(), "chunk size {}", chunk);
            for (got, want) in out.iter().zip(&payloads) {
                assert_eq!(&got[..], &want[..]);
            }
            assert!(frames_in.is_empty());
        }
    }

    #[test]
    fn test_clear_returns_to_frame_boundary() {
        let mut frames_in = FrameBuffer::new();
        frames_in.push(&build_frame(b"test")[..6]).unwrap();
        assert!(matches!(frames_in.state(), ParseState::AwaitingPayload { .. }));

        frames_in.clear();
        assert_eq!(frames_in.state(), ParseState::AwaitingLength);
        assert!(frames_in.is_empty());
    }
}
