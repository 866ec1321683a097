//! Stream sample header codec (spec.md §4.A, §4.H).
//!
//! Each UDP stream datagram carries a small fixed header in front of the
//! encrypted payload so the feeder can reassemble fragmented samples without
//! decrypting first.

use crate::error::Error;

pub const STREAM_HEADER_LEN: usize = 8;

/// Header prefixing every stream datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSampleHeader {
    pub sequence: u32,
    pub fragment_index: u16,
    pub fragment_total: u16,
}

impl StreamSampleHeader {
    pub fn encode(&self) -> [u8; STREAM_HEADER_LEN] {
        let mut buf = [0u8; STREAM_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..6].copy_from_slice(&self.fragment_index.to_be_bytes());
        buf[6..8].copy_from_slice(&self.fragment_total.to_be_bytes());
        buf
    }

    /// Splits a raw datagram into its header and the remaining (still
    /// encrypted) payload bytes.
    pub fn decode(datagram: &[u8]) -> Result<(Self, &[u8]), Error> {
        if datagram.len() < STREAM_HEADER_LEN {
            return Err(Error::protocol(format!(
                "stream datagram of {} bytes is shorter than the {STREAM_HEADER_LEN}-byte header",
                datagram.len()
            )));
        }
        let sequence = u32::from_be_bytes(datagram[0..4].try_into().unwrap());
        let fragment_index = u16::from_be_bytes(datagram[4..6].try_into().unwrap());
        let fragment_total = u16::from_be_bytes(datagram[6..8].try_into().unwrap());
        if fragment_total == 0 || fragment_index >= fragment_total {
            return Err(Error::protocol(format!(
                "invalid fragment index/total: {fragment_index}/{fragment_total}"
            )));
        }
        Ok((
            StreamSampleHeader {
                sequence,
                fragment_index,
                fragment_total,
            },
            &datagram[STREAM_HEADER_LEN..],
        ))
    }

    pub fn is_first_fragment(&self) -> bool {
        self.fragment_index == 0
    }

    pub fn is_last_fragment(&self) -> bool {
        self.fragment_index + 1 == self.fragment_total
    }
}
