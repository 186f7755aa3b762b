//! RFC 3550 RTP fixed header codec.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! All ST 2110 streams share this 12-byte prefix; the profile-specific
//! headers (RFC 4175 SRD rows, RFC 8331 ANC counts) follow it. Version is
//! always 2; padding, extension, and CSRC count are always 0 on the wire
//! this library produces.

use crate::error::{Error, IntegrityErrorKind, Result};

/// Fixed header length.
pub const RTP_HDR_LEN: usize = 12;

/// Decoded RTP fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Serialize into a 12-byte buffer.
    pub fn write(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= RTP_HDR_LEN);
        out[0] = 2 << 6;
        out[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7F);
        out[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        out[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        out[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
    }

    /// Parse and validate the version field.
    pub fn parse(buf: &[u8]) -> Result<RtpHeader> {
        if buf.len() < RTP_HDR_LEN || buf[0] >> 6 != 2 {
            return Err(Error::WireIntegrity {
                kind: IntegrityErrorKind::MalformedRtp,
            });
        }
        Ok(RtpHeader {
            marker: buf[1] & 0x80 != 0,
            payload_type: buf[1] & 0x7F,
            sequence: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}
