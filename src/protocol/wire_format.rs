//! Wire format constants and the opcode table.
//!
//! Frame layout:
//! ```text
//! ┌──────────────┬────────┬──────────────┬──────────────────┬───┬───────────────┐
//! │ Frame length │ Opcode │ Tag          │ Field 1 length   │...│ Last field    │
//! │ u32 LE       │ 1 byte │ u32 LE       │ u32 LE + bytes   │   │ rest of frame │
//! │ incl. itself │        │ Remote only  │                  │   │ no prefix     │
//! └──────────────┴────────┴──────────────┴──────────────────┴───┴───────────────┘
//! ```
//!
//! The opcode byte carries ASCII `'0'` plus the low nibble of the code. The
//! class nibble (`0xF_` for Local) is never transmitted: it is implied by the
//! kind of connection the frame arrives on.

use std::fmt;

use crate::error::ProtocolError;

/// Size of the frame length prefix, which counts itself.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Size of the tag carried by Remote-class messages.
pub const TAG_SIZE: usize = 4;

/// Size of the inline length prefix of every non-last field.
pub const FIELD_LENGTH_SIZE: usize = 4;

/// Size of an encoded RemoteNode field.
pub const REMOTE_NODE_SIZE: usize = 4;

/// Default maximum frame length (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Offset added to the low nibble to form the opcode byte.
pub const OPCODE_BYTE_BASE: u8 = b'0';

/// Class bits of a Local opcode.
const LOCAL_CLASS_BITS: u8 = 0xF0;

/// Correlation id of a Remote-class request.
pub type Tag = u32;

/// Shard (node) identifier used for routing.
pub type ShardId = u32;

/// Who a message is exchanged between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// Client and its directly connected server.
    Local,
    /// Two storage servers, on behalf of a client.
    Remote,
}

impl MessageClass {
    /// Minimum payload length: opcode byte, plus the tag for Remote.
    pub fn header_len(self) -> usize {
        match self {
            MessageClass::Local => 1,
            MessageClass::Remote => 1 + TAG_SIZE,
        }
    }

    /// Largest frame accepted for this class when Local frames are capped at
    /// `local_max`. A Remote frame carries the same fields plus a tag, so an
    /// object stored at the Local limit still fits in its RemoteStore reply.
    pub fn frame_limit(self, local_max: u32) -> u32 {
        match self {
            MessageClass::Local => local_max,
            MessageClass::Remote => local_max.saturating_add(TAG_SIZE as u32),
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageClass::Local => f.write_str("local"),
            MessageClass::Remote => f.write_str("remote"),
        }
    }
}

/// Semantic label of a message field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Name,
    Object,
    Message,
    RemoteNode,
}

/// Closed set of opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    RemoteSuccess = 0x0,
    RemoteLookup = 0x1,
    RemoteStore = 0x2,
    RemoteDelete = 0x3,
    RemoteError = 0x5,

    LocalSuccess = 0xF0,
    LocalLookup = 0xF1,
    LocalStore = 0xF2,
    LocalRemoteLookup = 0xF3,
    LocalRemoteStore = 0xF4,
    LocalError = 0xF5,
    LocalDelete = 0xF6,
    LocalRemoteDelete = 0xF7,
}

impl OpCode {
    /// Full code, class bits included.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Class derived from the reserved high nibble.
    #[inline]
    pub fn class(self) -> MessageClass {
        if self.code() & LOCAL_CLASS_BITS != 0 {
            MessageClass::Local
        } else {
            MessageClass::Remote
        }
    }

    /// Labels of the fields, in wire order.
    pub fn fields(self) -> &'static [FieldKind] {
        use FieldKind::*;
        match self {
            OpCode::RemoteLookup | OpCode::RemoteDelete => &[Name],
            OpCode::RemoteStore => &[Name, Object],
            OpCode::RemoteSuccess | OpCode::RemoteError => &[Message],
            OpCode::LocalLookup | OpCode::LocalDelete => &[Name],
            OpCode::LocalStore => &[Name, Object],
            OpCode::LocalRemoteLookup | OpCode::LocalRemoteDelete => &[Name, RemoteNode],
            OpCode::LocalRemoteStore => &[Name, Object, RemoteNode],
            OpCode::LocalSuccess | OpCode::LocalError => &[Message],
        }
    }

    /// Number of fields for this opcode.
    #[inline]
    pub fn field_count(self) -> usize {
        self.fields().len()
    }

    /// Byte written on the wire.
    #[inline]
    pub fn wire_byte(self) -> u8 {
        OPCODE_BYTE_BASE + (self.code() & 0x0F)
    }

    /// Map a wire byte back to an opcode of the given class.
    pub fn from_wire(byte: u8, class: MessageClass) -> Result<Self, ProtocolError> {
        let unknown = ProtocolError::UnknownOpcode { byte, class };
        let nibble = byte.checked_sub(OPCODE_BYTE_BASE).ok_or(unknown.clone())?;
        if nibble > 0x0F {
            return Err(unknown);
        }
        let code = match class {
            MessageClass::Local => LOCAL_CLASS_BITS | nibble,
            MessageClass::Remote => nibble,
        };
        Self::from_code(code).ok_or(unknown)
    }

    /// Map a full code (class bits included) to an opcode.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x0 => OpCode::RemoteSuccess,
            0x1 => OpCode::RemoteLookup,
            0x2 => OpCode::RemoteStore,
            0x3 => OpCode::RemoteDelete,
            0x5 => OpCode::RemoteError,
            0xF0 => OpCode::LocalSuccess,
            0xF1 => OpCode::LocalLookup,
            0xF2 => OpCode::LocalStore,
            0xF3 => OpCode::LocalRemoteLookup,
            0xF4 => OpCode::LocalRemoteStore,
            0xF5 => OpCode::LocalError,
            0xF6 => OpCode::LocalDelete,
            0xF7 => OpCode::LocalRemoteDelete,
            _ => return None,
        })
    }

    /// Every opcode, for table-driven tests and debugging.
    pub const ALL: [OpCode; 13] = [
        OpCode::RemoteSuccess,
        OpCode::RemoteLookup,
        OpCode::RemoteStore,
        OpCode::RemoteDelete,
        OpCode::RemoteError,
        OpCode::LocalSuccess,
        OpCode::LocalLookup,
        OpCode::LocalStore,
        OpCode::LocalRemoteLookup,
        OpCode::LocalRemoteStore,
        OpCode::LocalError,
        OpCode::LocalDelete,
        OpCode::LocalRemoteDelete,
    ];
}

/// Read a little-endian u32 at `offset`. Caller guarantees the bounds.
#[inline]
pub(crate) fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}
