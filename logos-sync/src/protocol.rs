//! Outer message envelope shared by provider and server.
//!
//! Wire format (lib0 variable-length integers):
//! ```text
//! ┌──────────────┬──────────────────────────────┐
//! │ message_type │ handler-specific payload     │
//! │ varuint      │ variable                     │
//! └──────────────┴──────────────────────────────┘
//! ```
//!
//! Deployments that multiplex several rooms over one connection use the
//! room-prefixed variant, where a length-prefixed room name sits between
//! the type tag and the payload:
//! ```text
//! ┌──────────────┬──────────────┬──────────┐
//! │ message_type │ room (varstr)│ payload  │
//! └──────────────┴──────────────┴──────────┘
//! ```

use yrs::encoding::read::{self, Cursor, Read};
use yrs::encoding::write::Write;

use crate::awareness::AwarenessError;

/// Message types for the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Document state/update exchange
    Sync = 0,
    /// Presence update
    Awareness = 1,
    /// Permission challenge/response
    Auth = 2,
    /// Request for a full presence snapshot
    QueryAwareness = 3,
}

impl MessageType {
    /// Numeric tag written as the first varuint of every frame.
    pub fn tag(self) -> u64 {
        self as u64
    }

    /// Map a decoded tag back to a known message type.
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(MessageType::Sync),
            1 => Some(MessageType::Awareness),
            2 => Some(MessageType::Auth),
            3 => Some(MessageType::QueryAwareness),
            _ => None,
        }
    }
}

/// Errors raised while decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("malformed frame: {0}")]
    Malformed(#[from] read::Error),
    #[error("unknown sync message type: {0}")]
    UnknownSyncMessage(u64),
    #[error("unknown auth message type: {0}")]
    UnknownAuthMessage(u64),
    #[error("invalid document update: {0}")]
    InvalidUpdate(String),
    #[error("awareness: {0}")]
    Awareness(#[from] AwarenessError),
}

/// Split a frame into its message-type tag and a cursor over the payload.
///
/// Fails only when the frame is empty or the tag itself is truncated.
pub fn decode_envelope(frame: &[u8]) -> Result<(u64, Cursor<'_>), ProtocolError> {
    if frame.is_empty() {
        return Err(ProtocolError::EmptyFrame);
    }
    let mut cursor = Cursor::new(frame);
    let tag: u64 = cursor.read_var()?;
    Ok((tag, cursor))
}

/// Build a frame: the tag followed by whatever `write_payload` appends.
pub fn encode_envelope<F>(message_type: MessageType, write_payload: F) -> Vec<u8>
where
    F: FnOnce(&mut Vec<u8>),
{
    let mut buf = Vec::new();
    buf.write_var(message_type.tag());
    write_payload(&mut buf);
    buf
}

/// Room-prefixed variant of [`encode_envelope`].
pub fn encode_room_envelope<F>(message_type: MessageType, room: &str, write_payload: F) -> Vec<u8>
where
    F: FnOnce(&mut Vec<u8>),
{
    encode_envelope(message_type, |buf| {
        buf.write_string(room);
        write_payload(buf);
    })
}

/// Room-prefixed variant of [`decode_envelope`].
pub fn decode_room_envelope(frame: &[u8]) -> Result<(u64, String, Cursor<'_>), ProtocolError> {
    let (tag, mut cursor) = decode_envelope(frame)?;
    let room = cursor.read_string()?.to_owned();
    Ok((tag, room, cursor))
}

/// Whether a frame carries anything beyond its message-type tag.
pub fn has_body(frame: &[u8]) -> bool {
    match decode_envelope(frame) {
        Ok((_, cursor)) => cursor.has_content(),
        Err(_) => false,
    }
}
