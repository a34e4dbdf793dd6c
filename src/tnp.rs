//! Wahoo TNP (Trainer Network Protocol) frame codec.
//!
//! TNP carries GATT operations over TCP. Every frame is a 6-byte header
//! followed by a variable body:
//!
//!   offset 0: protocol version (always 1)
//!   offset 1: message identifier (0x01..=0x06)
//!   offset 2: sequence
//!   offset 3: response code (0x00 = success / request)
//!   offset 4: body length, big-endian u16
//!   offset 6: body
//!
//! UUIDs appear on the wire in reversed byte order across all 16 bytes.
//! That reversal is confined to this module; the rest of the daemon only
//! ever sees canonical `uuid::Uuid` values.

use uuid::Uuid;

pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 6;

// Message identifiers.
pub const MSG_DISCOVER_SERVICES: u8 = 0x01;
pub const MSG_DISCOVER_CHARACTERISTICS: u8 = 0x02;
pub const MSG_READ: u8 = 0x03;
pub const MSG_WRITE: u8 = 0x04;
pub const MSG_ENABLE_NOTIFICATIONS: u8 = 0x05;
pub const MSG_NOTIFICATION: u8 = 0x06;

// Response codes.
pub const RC_SUCCESS: u8 = 0x00;
pub const RC_UNKNOWN_MESSAGE_TYPE: u8 = 0x01;
pub const RC_UNEXPECTED_ERROR: u8 = 0x02;
pub const RC_SERVICE_NOT_FOUND: u8 = 0x03;
pub const RC_CHARACTERISTIC_NOT_FOUND: u8 = 0x04;
pub const RC_OPERATION_NOT_SUPPORTED: u8 = 0x05;
pub const RC_WRITE_FAILED: u8 = 0x06;
pub const RC_UNKNOWN_PROTOCOL: u8 = 0x07;

// Characteristic property bits, as carried in discovery responses.
pub const PROP_READ: u8 = 0x01;
pub const PROP_WRITE: u8 = 0x02;
pub const PROP_NOTIFY: u8 = 0x04;
pub const PROP_INDICATE: u8 = 0x08;

/// A parsed TNP frame. The protocol version is implicit: frames that do
/// not carry version 1 never make it out of `decode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u8,
    pub sequence: u8,
    pub response: u8,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn request(id: u8, sequence: u8, body: Vec<u8>) -> Self {
        Frame { id, sequence, response: RC_SUCCESS, body }
    }

    pub fn response(id: u8, sequence: u8, response: u8, body: Vec<u8>) -> Self {
        Frame { id, sequence, response, body }
    }

    /// An unsolicited notification: identifier 0x06, sequence fixed at 0,
    /// body = reversed UUID + value.
    pub fn notification(uuid: &Uuid, value: &[u8]) -> Self {
        let mut body = Vec::with_capacity(16 + value.len());
        body.extend_from_slice(&uuid_to_wire(uuid));
        body.extend_from_slice(value);
        Frame { id: MSG_NOTIFICATION, sequence: 0, response: RC_SUCCESS, body }
    }
}

/// Outcome of one decode attempt against a receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A well-formed frame and the number of buffer bytes it consumed.
    Frame(Frame, usize),
    /// Not enough bytes yet; the caller keeps the buffer as-is.
    Incomplete,
    /// Header is self-consistent but unusable (bad version or unknown
    /// identifier). Carries the offending identifier, the echoed
    /// sequence, the response code the peer should receive, and the
    /// bytes to discard.
    Malformed { id: u8, sequence: u8, response: u8, consumed: usize },
}

/// Decode one frame from the front of `buf`.
pub fn decode(buf: &[u8]) -> Decoded {
    if buf.len() < HEADER_LEN {
        return Decoded::Incomplete;
    }
    let body_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let total = HEADER_LEN + body_len;
    if buf.len() < total {
        return Decoded::Incomplete;
    }

    let id = buf[1];
    let sequence = buf[2];
    if buf[0] != PROTOCOL_VERSION {
        return Decoded::Malformed { id, sequence, response: RC_UNKNOWN_PROTOCOL, consumed: total };
    }
    if !(MSG_DISCOVER_SERVICES..=MSG_NOTIFICATION).contains(&id) {
        return Decoded::Malformed { id, sequence, response: RC_UNKNOWN_MESSAGE_TYPE, consumed: total };
    }

    let frame = Frame {
        id,
        sequence,
        response: buf[3],
        body: buf[HEADER_LEN..total].to_vec(),
    };
    Decoded::Frame(frame, total)
}

/// Encode a frame for the wire.
pub fn encode(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + frame.body.len());
    out.push(PROTOCOL_VERSION);
    out.push(frame.id);
    out.push(frame.sequence);
    out.push(frame.response);
    out.extend_from_slice(&(frame.body.len() as u16).to_be_bytes());
    out.extend_from_slice(&frame.body);
    out
}

/// Canonical UUID -> wire order (all 16 bytes reversed).
pub fn uuid_to_wire(uuid: &Uuid) -> [u8; 16] {
    let mut bytes = *uuid.as_bytes();
    bytes.reverse();
    bytes
}

/// Wire order -> canonical UUID. Inverse of `uuid_to_wire`.
pub fn uuid_from_wire(wire: &[u8; 16]) -> Uuid {
    let mut bytes = *wire;
    bytes.reverse();
    Uuid::from_bytes(bytes)
}

/// Pull the leading reversed UUID out of a message body. Returns the
/// UUID and the remaining value bytes, or `None` if the body is short.
pub fn split_uuid(body: &[u8]) -> Option<(Uuid, &[u8])> {
    if body.len() < 16 {
        return None;
    }
    let mut wire = [0u8; 16];
    wire.copy_from_slice(&body[..16]);
    Some((uuid_from_wire(&wire), &body[16..]))
}
