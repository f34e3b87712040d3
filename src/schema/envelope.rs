//! Fixed binary envelope header.
//!
//! Layout (big-endian, 38 bytes, followed by the payload):
//!
//! | Offset | Size | Field              |
//! |--------|------|--------------------|
//! | 0      | 8    | sender             |
//! | 8      | 1    | destination tag    |
//! | 9      | 8    | destination id     |
//! | 17     | 1    | priority           |
//! | 18     | 8    | sequence           |
//! | 26     | 4    | kind               |
//! | 30     | 4    | schema version     |
//! | 34     | 4    | payload length     |
//!
//! Destination tags: `0` process, `1` broadcast set, `2` broker.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::SchemaError;
use crate::models::{BroadcastSet, Message, PriorityClass, ProcessId, RouteTarget};

/// Size of the fixed header preceding every payload.
pub const HEADER_LEN: usize = 38;

const TAG_PROCESS: u8 = 0;
const TAG_BROADCAST: u8 = 1;
const TAG_BROKER: u8 = 2;

/// Header fields as read from the wire, before any registry check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    /// Sender identifier.
    pub sender: ProcessId,
    /// Decoded destination.
    pub destination: RouteTarget,
    /// Declared priority.
    pub priority: PriorityClass,
    /// Sequence number.
    pub sequence: u64,
    /// Kind wire code; not yet checked against a registry.
    pub kind_code: u32,
    /// Schema version.
    pub schema_version: u32,
    /// Declared payload length.
    pub payload_len: u32,
}

/// Serialize a message into one frame body.
#[must_use]
pub fn encode(message: &Message) -> Bytes {
    let payload = message.payload();
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u64(message.sender().0);
    let (tag, id) = match message.destination() {
        RouteTarget::Process(id) => (TAG_PROCESS, id.0),
        RouteTarget::Broadcast(set) => (TAG_BROADCAST, set.as_u64()),
        RouteTarget::Broker => (TAG_BROKER, 0),
    };
    out.put_u8(tag);
    out.put_u64(id);
    out.put_u8(message.priority().as_u8());
    out.put_u64(message.sequence());
    out.put_u32(message.kind().code());
    out.put_u32(message.schema_version());
    // Frames are capped far below 4 GiB by the transport.
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    out.freeze()
}

/// Parse and structurally validate the header of `frame`.
///
/// # Errors
///
/// Returns [`SchemaError::Malformed`] for a short frame, an unknown
/// destination tag or broadcast set, an invalid priority byte, or a payload
/// length that disagrees with the frame size.
pub fn decode_header(frame: &[u8]) -> Result<RawHeader, SchemaError> {
    if frame.len() < HEADER_LEN {
        return Err(SchemaError::Malformed(format!(
            "frame of {} bytes is shorter than the {HEADER_LEN}-byte header",
            frame.len()
        )));
    }
    let mut buf = &frame[..HEADER_LEN];
    let sender = ProcessId(buf.get_u64());
    let tag = buf.get_u8();
    let dest_id = buf.get_u64();
    let priority_raw = buf.get_u8();
    let sequence = buf.get_u64();
    let kind_code = buf.get_u32();
    let schema_version = buf.get_u32();
    let payload_len = buf.get_u32();

    let destination = match tag {
        TAG_PROCESS => RouteTarget::Process(ProcessId(dest_id)),
        TAG_BROADCAST => RouteTarget::Broadcast(BroadcastSet::from_u64(dest_id).ok_or_else(
            || SchemaError::Malformed(format!("unknown broadcast set {dest_id}")),
        )?),
        TAG_BROKER => RouteTarget::Broker,
        other => {
            return Err(SchemaError::Malformed(format!(
                "unknown destination tag {other}"
            )))
        }
    };
    let priority = PriorityClass::from_u8(priority_raw)
        .ok_or_else(|| SchemaError::Malformed(format!("invalid priority {priority_raw}")))?;

    let actual = frame.len() - HEADER_LEN;
    if payload_len as usize != actual {
        return Err(SchemaError::Malformed(format!(
            "payload length {payload_len} does not match {actual} bytes after header"
        )));
    }

    Ok(RawHeader {
        sender,
        destination,
        priority,
        sequence,
        kind_code,
        schema_version,
        payload_len,
    })
}
