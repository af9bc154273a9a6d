//! Typed messages and their payload encoding.
//!
//! Each opcode is one [`Message`] variant carrying named fields, so there is
//! no runtime lookup of "field X of opcode Y". Byte fields are `Bytes`
//! slices of the frame payload (decode is zero-copy).
//!
//! Payload layout (the frame length prefix is added by the framing layer):
//! ```text
//! [opcode byte][tag u32 LE, Remote only][len u32 LE][field]...[last field]
//! ```
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use shardstore::protocol::{Message, MessageClass};
//!
//! let msg = Message::LocalStore {
//!     name: Bytes::from_static(b"quokka"),
//!     object: Bytes::from_static(b"1234"),
//! };
//! let payload = msg.encode();
//! let decoded = Message::decode(MessageClass::Local, payload.freeze()).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{
    read_u32_le, FieldKind, MessageClass, OpCode, ShardId, Tag, FIELD_LENGTH_SIZE,
    REMOTE_NODE_SIZE,
};
use crate::error::ProtocolError;

/// A decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RemoteLookup { tag: Tag, name: Bytes },
    /// Also the reply to a RemoteLookup hit.
    RemoteStore { tag: Tag, name: Bytes, object: Bytes },
    RemoteDelete { tag: Tag, name: Bytes },
    RemoteSuccess { tag: Tag, message: Bytes },
    RemoteError { tag: Tag, message: Bytes },

    LocalLookup { name: Bytes },
    /// Also the reply to a LocalLookup hit.
    LocalStore { name: Bytes, object: Bytes },
    LocalRemoteLookup { name: Bytes, node: ShardId },
    LocalRemoteStore { name: Bytes, object: Bytes, node: ShardId },
    LocalSuccess { message: Bytes },
    LocalError { message: Bytes },
    LocalDelete { name: Bytes },
    LocalRemoteDelete { name: Bytes, node: ShardId },
}

impl Message {
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::RemoteLookup { .. } => OpCode::RemoteLookup,
            Message::RemoteStore { .. } => OpCode::RemoteStore,
            Message::RemoteDelete { .. } => OpCode::RemoteDelete,
            Message::RemoteSuccess { .. } => OpCode::RemoteSuccess,
            Message::RemoteError { .. } => OpCode::RemoteError,
            Message::LocalLookup { .. } => OpCode::LocalLookup,
            Message::LocalStore { .. } => OpCode::LocalStore,
            Message::LocalRemoteLookup { .. } => OpCode::LocalRemoteLookup,
            Message::LocalRemoteStore { .. } => OpCode::LocalRemoteStore,
            Message::LocalSuccess { .. } => OpCode::LocalSuccess,
            Message::LocalError { .. } => OpCode::LocalError,
            Message::LocalDelete { .. } => OpCode::LocalDelete,
            Message::LocalRemoteDelete { .. } => OpCode::LocalRemoteDelete,
        }
    }

    #[inline]
    pub fn class(&self) -> MessageClass {
        self.opcode().class()
    }

    /// Correlation tag; `None` for Local-class messages.
    pub fn tag(&self) -> Option<Tag> {
        match self {
            Message::RemoteLookup { tag, .. }
            | Message::RemoteStore { tag, .. }
            | Message::RemoteDelete { tag, .. }
            | Message::RemoteSuccess { tag, .. }
            | Message::RemoteError { tag, .. } => Some(*tag),
            _ => None,
        }
    }

    /// Build a LocalSuccess from any text.
    pub fn local_success(text: impl Into<String>) -> Self {
        Message::LocalSuccess {
            message: Bytes::from(text.into()),
        }
    }

    /// Build a LocalError from any text.
    pub fn local_error(text: impl Into<String>) -> Self {
        Message::LocalError {
            message: Bytes::from(text.into()),
        }
    }

    pub fn remote_success(tag: Tag, text: impl Into<String>) -> Self {
        Message::RemoteSuccess {
            tag,
            message: Bytes::from(text.into()),
        }
    }

    pub fn remote_error(tag: Tag, text: impl Into<String>) -> Self {
        Message::RemoteError {
            tag,
            message: Bytes::from(text.into()),
        }
    }

    /// Fields in wire order. RemoteNode ids are rendered to their 4 LE bytes.
    pub fn fields(&self) -> Vec<Bytes> {
        let node = |n: &ShardId| Bytes::copy_from_slice(&n.to_le_bytes());
        match self {
            Message::RemoteLookup { name, .. }
            | Message::RemoteDelete { name, .. }
            | Message::LocalLookup { name }
            | Message::LocalDelete { name } => vec![name.clone()],
            Message::RemoteStore { name, object, .. } | Message::LocalStore { name, object } => {
                vec![name.clone(), object.clone()]
            }
            Message::RemoteSuccess { message, .. }
            | Message::RemoteError { message, .. }
            | Message::LocalSuccess { message }
            | Message::LocalError { message } => vec![message.clone()],
            Message::LocalRemoteLookup { name, node: n }
            | Message::LocalRemoteDelete { name, node: n } => vec![name.clone(), node(n)],
            Message::LocalRemoteStore {
                name,
                object,
                node: n,
            } => vec![name.clone(), object.clone(), node(n)],
        }
    }

    /// Build a message from an opcode, tag and positional fields.
    ///
    /// The tag is ignored for Local-class opcodes.
    ///
    /// # Errors
    ///
    /// `WrongFieldCount` if `fields` does not match the opcode layout,
    /// `InvalidRemoteNode` if a RemoteNode field is not 4 bytes.
    pub fn from_fields(opcode: OpCode, tag: Tag, fields: Vec<Bytes>) -> Result<Self, ProtocolError> {
        let expected = opcode.field_count();
        if fields.len() != expected {
            return Err(ProtocolError::WrongFieldCount {
                opcode,
                expected,
                actual: fields.len(),
            });
        }
        let mut it = fields.into_iter();
        // Length checked above, so `next` always yields.
        let mut next = || it.next().unwrap_or_default();
        Ok(match opcode {
            OpCode::RemoteLookup => Message::RemoteLookup { tag, name: next() },
            OpCode::RemoteStore => Message::RemoteStore {
                tag,
                name: next(),
                object: next(),
            },
            OpCode::RemoteDelete => Message::RemoteDelete { tag, name: next() },
            OpCode::RemoteSuccess => Message::RemoteSuccess {
                tag,
                message: next(),
            },
            OpCode::RemoteError => Message::RemoteError {
                tag,
                message: next(),
            },
            OpCode::LocalLookup => Message::LocalLookup { name: next() },
            OpCode::LocalStore => Message::LocalStore {
                name: next(),
                object: next(),
            },
            OpCode::LocalRemoteLookup => Message::LocalRemoteLookup {
                name: next(),
                node: parse_node(&next())?,
            },
            OpCode::LocalRemoteStore => Message::LocalRemoteStore {
                name: next(),
                object: next(),
                node: parse_node(&next())?,
            },
            OpCode::LocalSuccess => Message::LocalSuccess { message: next() },
            OpCode::LocalError => Message::LocalError { message: next() },
            OpCode::LocalDelete => Message::LocalDelete { name: next() },
            OpCode::LocalRemoteDelete => Message::LocalRemoteDelete {
                name: next(),
                node: parse_node(&next())?,
            },
        })
    }

    /// Encode everything except the last field, and hand the last field back
    /// by handle so large objects are sent without copying them into the head.
    pub fn encode_head(&self) -> (BytesMut, Bytes) {
        let fields = self.fields();
        let class = self.class();
        let (last, inline) = match fields.split_last() {
            Some((last, inline)) => (last.clone(), inline),
            None => (Bytes::new(), &[][..]),
        };
        let inline_len: usize = inline.iter().map(|f| FIELD_LENGTH_SIZE + f.len()).sum();

        let mut head = BytesMut::with_capacity(class.header_len() + inline_len);
        head.put_u8(self.opcode().wire_byte());
        if let Some(tag) = self.tag() {
            head.put_u32_le(tag);
        }
        for field in inline {
            head.put_u32_le(field.len() as u32);
            head.extend_from_slice(field);
        }
        (head, last)
    }

    /// Encode to a contiguous frame payload.
    pub fn encode(&self) -> BytesMut {
        let (mut head, last) = self.encode_head();
        head.extend_from_slice(&last);
        head
    }

    /// Decode a frame payload of the given class.
    ///
    /// # Errors
    ///
    /// - `Truncated` if the payload is shorter than the header or a declared
    ///   field length runs past the end.
    /// - `UnknownOpcode` if the opcode byte is not known for `class`.
    pub fn decode(class: MessageClass, payload: Bytes) -> Result<Self, ProtocolError> {
        let header_len = class.header_len();
        if payload.len() < header_len {
            return Err(ProtocolError::Truncated {
                needed: header_len,
                available: payload.len(),
            });
        }

        let opcode = OpCode::from_wire(payload[0], class)?;
        let tag = match class {
            MessageClass::Remote => read_u32_le(&payload, 1),
            MessageClass::Local => 0,
        };

        let count = opcode.field_count();
        let mut fields = Vec::with_capacity(count);
        let mut index = header_len;
        for i in 0..count {
            if i + 1 == count {
                fields.push(payload.slice(index..));
                break;
            }
            let needed = index + FIELD_LENGTH_SIZE;
            if needed > payload.len() {
                return Err(ProtocolError::Truncated {
                    needed,
                    available: payload.len(),
                });
            }
            let len = read_u32_le(&payload, index) as usize;
            index += FIELD_LENGTH_SIZE;
            let end = index.checked_add(len).ok_or(ProtocolError::Truncated {
                needed: usize::MAX,
                available: payload.len(),
            })?;
            if end > payload.len() {
                return Err(ProtocolError::Truncated {
                    needed: end,
                    available: payload.len(),
                });
            }
            fields.push(payload.slice(index..end));
            index = end;
        }

        Self::from_fields(opcode, tag, fields)
    }

    /// Payload length once encoded, without encoding.
    pub fn encoded_len(&self) -> usize {
        let fields = self.fields();
        let inline = fields.len().saturating_sub(1) * FIELD_LENGTH_SIZE;
        self.class().header_len() + inline + fields.iter().map(Bytes::len).sum::<usize>()
    }
}

fn parse_node(field: &[u8]) -> Result<ShardId, ProtocolError> {
    if field.len() != REMOTE_NODE_SIZE {
        return Err(ProtocolError::InvalidRemoteNode(field.len()));
    }
    Ok(read_u32_le(field, 0))
}

/// Short rendering for logs: keys as lossy UTF-8, objects by length only.
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(", self.opcode())?;
        if let Some(tag) = self.tag() {
            write!(f, "tag={}, ", tag)?;
        }
        let labels = self.opcode().fields();
        for (i, (kind, value)) in labels.iter().zip(self.fields()).enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match kind {
                FieldKind::Name => write!(f, "key={}", String::from_utf8_lossy(&value))?,
                FieldKind::Object => write!(f, "obj.len={}", value.len())?,
                FieldKind::Message => write!(f, "message={}", String::from_utf8_lossy(&value))?,
                FieldKind::RemoteNode => write!(f, "remote_node={}", read_u32_le(&value, 0))?,
            }
        }
        f.write_str(")")
    }
}
