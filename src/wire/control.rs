//! Control/stream frame header codec (spec.md §3 `ControlMessage`, §6).
//!
//! Wire layout: a 4-byte header (`type:u8, flags:u8, payload_size:u16` big
//! endian) followed by exactly `payload_size` bytes of payload.

use crate::error::Error;

pub const HEADER_LEN: usize = 4;

/// The tagged union of control-plane message kinds.
///
/// Unknown type bytes decode to `MessageType::Unknown(byte)` rather than
/// failing — spec.md §4.A requires codecs to "tolerate and log unknown
/// message types".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Bang,
    VersionReq,
    VersionRsp,
    Input,
    SessionCtrl,
    Error,
    Unknown(u8),
}

impl MessageType {
    pub fn to_byte(self) -> u8 {
        match self {
            MessageType::Bang => 0x01,
            MessageType::VersionReq => 0x02,
            MessageType::VersionRsp => 0x03,
            MessageType::Input => 0x04,
            MessageType::SessionCtrl => 0x05,
            MessageType::Error => 0xFF,
            MessageType::Unknown(b) => b,
        }
    }

    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => MessageType::Bang,
            0x02 => MessageType::VersionReq,
            0x03 => MessageType::VersionRsp,
            0x04 => MessageType::Input,
            0x05 => MessageType::SessionCtrl,
            0xFF => MessageType::Error,
            other => MessageType::Unknown(other),
        }
    }
}

/// One decoded control/stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub message_type: MessageType,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl ControlFrame {
    pub fn new(message_type: MessageType, flags: u8, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            flags,
            payload,
        }
    }

    /// Encodes the frame as header + payload. Returns `Protocol` if the
    /// payload exceeds `max_payload`.
    pub fn encode(&self, max_payload: usize) -> Result<Vec<u8>, Error> {
        if self.payload.len() > max_payload {
            return Err(Error::protocol(format!(
                "payload of {} bytes exceeds cap of {max_payload}",
                self.payload.len()
            )));
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.message_type.to_byte());
        buf.push(self.flags);
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Attempts to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet contain a full frame (the
    /// caller should read more bytes and retry) — this never allocates
    /// beyond the declared payload size, and rejects any declared size above
    /// `max_payload` before looking at the payload bytes at all.
    pub fn try_decode(buf: &[u8], max_payload: usize) -> Result<Option<(Self, usize)>, Error> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let message_type = MessageType::from_byte(buf[0]);
        let flags = buf[1];
        let payload_size = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if payload_size > max_payload {
            return Err(Error::protocol(format!(
                "declared payload_size {payload_size} exceeds cap of {max_payload}"
            )));
        }
        let total_len = HEADER_LEN + payload_size;
        if buf.len() < total_len {
            return Ok(None);
        }
        let payload = buf[HEADER_LEN..total_len].to_vec();
        Ok(Some((
            ControlFrame::new(message_type, flags, payload),
            total_len,
        )))
    }
}
