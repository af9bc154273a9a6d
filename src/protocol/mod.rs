//! Protocol module - wire format, framing, and typed messages.
//!
//! This module implements the binary protocol shared by client and peer
//! connections:
//! - Opcode table and byte-level constants
//! - Frame buffer for accumulating partial reads
//! - Send queue for partial writes with zero-copy object segments
//! - `Message` codec, one variant per opcode

mod frame_buffer;
mod message;
mod send_queue;
mod wire_format;

pub use frame_buffer::{parse_step, FrameBuffer, ParseState, Step};
pub use message::Message;
pub use send_queue::{build_frame, OutboundFrame, SendQueue, MAX_IO_SLICES};
pub use wire_format::{
    FieldKind, MessageClass, OpCode, ShardId, Tag, DEFAULT_MAX_FRAME_SIZE, FIELD_LENGTH_SIZE,
    LENGTH_FIELD_SIZE, OPCODE_BYTE_BASE, REMOTE_NODE_SIZE, TAG_SIZE,
};
