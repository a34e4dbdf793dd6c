//! Per-client TNP session state and request dispatch.
//!
//! A session owns one TCP connection's protocol state: the receive
//! buffer with its length cursor, the last sequence seen, and the
//! dispatch of parsed requests against the GATT mirror. Socket I/O
//! itself lives in `server`; everything here is synchronous and fully
//! testable without a socket.
//!
//! Every inbound frame with response code 0 is treated as a request;
//! replies the peer sends to our own notifications carry a nonzero code
//! (or arrive as 0x06 frames) and are ignored.

use log::{debug, warn};

use crate::mirror::{GattMirror, MirrorError, SessionId};
use crate::tnp::{
    self, Decoded, Frame, MSG_DISCOVER_CHARACTERISTICS, MSG_DISCOVER_SERVICES,
    MSG_ENABLE_NOTIFICATIONS, MSG_NOTIFICATION, MSG_READ, MSG_WRITE, PROP_INDICATE, PROP_NOTIFY,
    PROP_READ, RC_CHARACTERISTIC_NOT_FOUND, RC_OPERATION_NOT_SUPPORTED, RC_SERVICE_NOT_FOUND,
    RC_SUCCESS, RC_UNEXPECTED_ERROR, RC_UNKNOWN_MESSAGE_TYPE, RC_WRITE_FAILED,
};

/// Fixed receive buffer size per session.
pub const RECV_BUFFER_LEN: usize = 256;

pub struct Session {
    id: SessionId,
    buf: [u8; RECV_BUFFER_LEN],
    len: usize,
    last_sequence: u8,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Session { id, buf: [0; RECV_BUFFER_LEN], len: 0, last_sequence: 0 }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn last_sequence(&self) -> u8 {
        self.last_sequence
    }

    /// Unfilled tail of the receive buffer, for the socket to read into.
    pub fn free_space(&mut self) -> &mut [u8] {
        &mut self.buf[self.len..]
    }

    /// Account for `n` bytes the socket just placed in `free_space`.
    pub fn advance(&mut self, n: usize) {
        self.len = (self.len + n).min(RECV_BUFFER_LEN);
    }

    /// True when the buffer is full but still does not hold a complete
    /// frame. Such a frame can never complete; the session must close.
    pub fn is_stalled(&self) -> bool {
        self.len == RECV_BUFFER_LEN && matches!(tnp::decode(&self.buf), Decoded::Incomplete)
    }

    /// Drain the next frame from the buffer front, if one is complete.
    /// Malformed frames come back as ready-made error replies.
    pub fn next_frame(&mut self) -> Option<Result<Frame, Frame>> {
        match tnp::decode(&self.buf[..self.len]) {
            Decoded::Incomplete => None,
            Decoded::Frame(frame, consumed) => {
                self.consume(consumed);
                Some(Ok(frame))
            }
            Decoded::Malformed { id, sequence, response, consumed } => {
                self.consume(consumed);
                warn!("session {}: malformed frame id 0x{:02x}", self.id, id);
                Some(Err(Frame::response(id, sequence, response, vec![])))
            }
        }
    }

    fn consume(&mut self, n: usize) {
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
    }

    /// Handle one inbound frame. Returns the reply to write, if any.
    pub fn dispatch(&mut self, frame: &Frame, mirror: &GattMirror) -> Option<Frame> {
        if frame.response != RC_SUCCESS {
            debug!("session {}: dropping response frame (code 0x{:02x})", self.id, frame.response);
            return None;
        }
        if frame.id == MSG_NOTIFICATION {
            debug!("session {}: ignoring inbound notification", self.id);
            return None;
        }
        self.last_sequence = frame.sequence;

        let reply = match frame.id {
            MSG_DISCOVER_SERVICES => self.discover_services(frame, mirror),
            MSG_DISCOVER_CHARACTERISTICS => self.discover_characteristics(frame, mirror),
            MSG_READ => self.read(frame, mirror),
            MSG_WRITE => self.write(frame, mirror),
            MSG_ENABLE_NOTIFICATIONS => self.enable_notifications(frame, mirror),
            // The codec admits 0x01..=0x06 only; anything else reaching
            // here came from a caller bypassing it.
            _ => self.error(frame, RC_UNKNOWN_MESSAGE_TYPE),
        };
        Some(reply)
    }

    fn discover_services(&self, frame: &Frame, mirror: &GattMirror) -> Frame {
        let mut body = Vec::new();
        for uuid in mirror.service_uuids() {
            body.extend_from_slice(&tnp::uuid_to_wire(&uuid));
        }
        Frame::response(frame.id, frame.sequence, RC_SUCCESS, body)
    }

    fn discover_characteristics(&self, frame: &Frame, mirror: &GattMirror) -> Frame {
        let Some((service, _)) = tnp::split_uuid(&frame.body) else {
            return self.error(frame, RC_UNEXPECTED_ERROR);
        };
        let characteristics = match mirror.characteristics_of(&service) {
            Ok(list) => list,
            Err(_) => return self.error(frame, RC_SERVICE_NOT_FOUND),
        };

        let mut body = Vec::with_capacity(16 + characteristics.len() * 17);
        body.extend_from_slice(&tnp::uuid_to_wire(&service));
        for (uuid, properties) in characteristics {
            body.extend_from_slice(&tnp::uuid_to_wire(&uuid));
            body.push(properties);
        }
        Frame::response(frame.id, frame.sequence, RC_SUCCESS, body)
    }

    fn read(&self, frame: &Frame, mirror: &GattMirror) -> Frame {
        let Some((uuid, _)) = tnp::split_uuid(&frame.body) else {
            return self.error(frame, RC_UNEXPECTED_ERROR);
        };
        let properties = match mirror.properties(&uuid) {
            Ok(p) => p,
            Err(_) => return self.error(frame, RC_CHARACTERISTIC_NOT_FOUND),
        };
        if properties & PROP_READ == 0 {
            return self.error(frame, RC_OPERATION_NOT_SUPPORTED);
        }
        let value = mirror.value(&uuid).unwrap_or_default();
        let mut body = tnp::uuid_to_wire(&uuid).to_vec();
        body.extend_from_slice(&value);
        Frame::response(frame.id, frame.sequence, RC_SUCCESS, body)
    }

    fn write(&self, frame: &Frame, mirror: &GattMirror) -> Frame {
        let Some((uuid, value)) = tnp::split_uuid(&frame.body) else {
            return self.error(frame, RC_UNEXPECTED_ERROR);
        };
        match mirror.write(&uuid, value) {
            Ok(()) => Frame::response(
                frame.id,
                frame.sequence,
                RC_SUCCESS,
                tnp::uuid_to_wire(&uuid).to_vec(),
            ),
            Err(MirrorError::CharacteristicNotFound) => {
                self.error(frame, RC_CHARACTERISTIC_NOT_FOUND)
            }
            Err(MirrorError::NotSupported) => self.error(frame, RC_OPERATION_NOT_SUPPORTED),
            Err(_) => self.error(frame, RC_WRITE_FAILED),
        }
    }

    fn enable_notifications(&self, frame: &Frame, mirror: &GattMirror) -> Frame {
        // Body: 16-byte UUID + flag. Byte 16 governs; extra bytes are an
        // interoperability quirk and are ignored.
        let Some((uuid, rest)) = tnp::split_uuid(&frame.body) else {
            return self.error(frame, RC_UNEXPECTED_ERROR);
        };
        let Some(&flag) = rest.first() else {
            return self.error(frame, RC_UNEXPECTED_ERROR);
        };

        let properties = match mirror.properties(&uuid) {
            Ok(p) => p,
            Err(_) => return self.error(frame, RC_CHARACTERISTIC_NOT_FOUND),
        };
        if properties & (PROP_NOTIFY | PROP_INDICATE) == 0 {
            return self.error(frame, RC_OPERATION_NOT_SUPPORTED);
        }

        if flag != 0 {
            if mirror.subscribe(self.id, &uuid).is_err() {
                return self.error(frame, RC_OPERATION_NOT_SUPPORTED);
            }
            debug!("session {}: notifications enabled on {}", self.id, uuid);
        } else {
            mirror.unsubscribe(self.id, &uuid);
            debug!("session {}: notifications disabled on {}", self.id, uuid);
        }
        Frame::response(
            frame.id,
            frame.sequence,
            RC_SUCCESS,
            tnp::uuid_to_wire(&uuid).to_vec(),
        )
    }

    fn error(&self, frame: &Frame, response: u8) -> Frame {
        Frame::response(frame.id, frame.sequence, response, vec![])
    }
}
