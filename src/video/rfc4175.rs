//! RFC 4175 payload header codec.
//!
//! After the RTP fixed header, an uncompressed-video packet carries a
//! 16-bit extended sequence number and one or two Sample Row Data headers:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Extended Sequence Number    |            Length             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |F|          Line No            |C|           Offset            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |            Length             |F|          Line No            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |C|           Offset            |                               .
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+                                 .
//! ```
//!
//! - **F**: field identification, 1 for the second field of an interlaced
//!   frame.
//! - **C**: continuation, 1 when another SRD header follows.
//! - **Length** is in bytes; **Offset** is in pixels.

use crate::error::{Error, IntegrityErrorKind, Result};
use crate::rtp::{RTP_HDR_LEN, RtpHeader};

/// Extended sequence number bytes.
pub const EXT_SEQ_LEN: usize = 2;
/// One SRD header.
pub const SRD_LEN: usize = 6;

/// Addressing of one sample row fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Srd {
    /// Payload bytes of this fragment.
    pub length: u16,
    /// Second-field flag for interlaced video.
    pub field: bool,
    /// Raster line, 0-based within the field.
    pub row_number: u16,
    /// First pixel of the fragment within the line.
    pub row_offset: u16,
}

impl Srd {
    fn write(&self, out: &mut [u8], continuation: bool) {
        out[0..2].copy_from_slice(&self.length.to_be_bytes());
        let row = ((self.field as u16) << 15) | (self.row_number & 0x7FFF);
        out[2..4].copy_from_slice(&row.to_be_bytes());
        let off = ((continuation as u16) << 15) | (self.row_offset & 0x7FFF);
        out[4..6].copy_from_slice(&off.to_be_bytes());
    }

    fn parse(buf: &[u8]) -> (Srd, bool) {
        let length = u16::from_be_bytes([buf[0], buf[1]]);
        let row = u16::from_be_bytes([buf[2], buf[3]]);
        let off = u16::from_be_bytes([buf[4], buf[5]]);
        (
            Srd {
                length,
                field: row & 0x8000 != 0,
                row_number: row & 0x7FFF,
                row_offset: off & 0x7FFF,
            },
            off & 0x8000 != 0,
        )
    }
}

/// Complete RFC 4175 packet header: RTP base + extended seq + SRDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoPacketHeader {
    pub rtp: RtpHeader,
    pub ext_seq: u16,
    pub srd: Srd,
    /// Present when the payload continues on another row.
    pub srd2: Option<Srd>,
}

impl VideoPacketHeader {
    /// Header bytes this packet needs in front of the payload.
    pub fn wire_len(&self) -> usize {
        RTP_HDR_LEN
            + EXT_SEQ_LEN
            + SRD_LEN
            + if self.srd2.is_some() { SRD_LEN } else { 0 }
    }

    /// 32-bit sequence from the extension and base fields.
    pub fn full_seq(&self) -> u32 {
        ((self.ext_seq as u32) << 16) | self.rtp.sequence as u32
    }

    pub fn write(&self, out: &mut [u8]) -> usize {
        self.rtp.write(out);
        out[RTP_HDR_LEN..RTP_HDR_LEN + 2].copy_from_slice(&self.ext_seq.to_be_bytes());
        let mut off = RTP_HDR_LEN + EXT_SEQ_LEN;
        self.srd.write(&mut out[off..], self.srd2.is_some());
        off += SRD_LEN;
        if let Some(srd2) = &self.srd2 {
            srd2.write(&mut out[off..], false);
            off += SRD_LEN;
        }
        off
    }

    pub fn parse(buf: &[u8]) -> Result<VideoPacketHeader> {
        let rtp = RtpHeader::parse(buf)?;
        let need = RTP_HDR_LEN + EXT_SEQ_LEN + SRD_LEN;
        if buf.len() < need {
            return Err(Error::WireIntegrity {
                kind: IntegrityErrorKind::MalformedRtp,
            });
        }
        let ext_seq = u16::from_be_bytes([buf[RTP_HDR_LEN], buf[RTP_HDR_LEN + 1]]);
        let (srd, cont) = Srd::parse(&buf[RTP_HDR_LEN + EXT_SEQ_LEN..]);
        let srd2 = if cont {
            if buf.len() < need + SRD_LEN {
                return Err(Error::WireIntegrity {
                    kind: IntegrityErrorKind::MalformedRtp,
                });
            }
            let (s2, cont2) = Srd::parse(&buf[need..]);
            if cont2 {
                // more than two SRDs never occurs in ST 2110-20 packing
                return Err(Error::WireIntegrity {
                    kind: IntegrityErrorKind::MalformedRtp,
                });
            }
            Some(s2)
        } else {
            None
        };
        Ok(VideoPacketHeader {
            rtp,
            ext_seq,
            srd,
            srd2,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header() -> VideoPacketHeader {
        VideoPacketHeader {
            rtp: RtpHeader {
                marker: false,
                payload_type: 112,
                sequence: 0x1234,
                timestamp: 0xAABBCCDD,
                ssrc: 0x01020304,
            },
            ext_seq: 0x0001,
            srd: Srd {
                length: 1200,
                field: false,
                row_number: 540,
                row_offset: 960,
            },
            srd2: None,
        }
    }

    #[test]
    fn single_srd_roundtrip() {
        let hdr = make_header();
        let mut buf = [0u8; 64];
        let n = hdr.write(&mut buf);
        assert_eq!(n, 20);
        assert_eq!(VideoPacketHeader::parse(&buf).unwrap(), hdr);
    }

    #[test]
    fn two_srd_roundtrip() {
        let mut hdr = make_header();
        hdr.srd2 = Some(Srd {
            length: 60,
            field: false,
            row_number: 541,
            row_offset: 0,
        });
        let mut buf = [0u8; 64];
        let n = hdr.write(&mut buf);
        assert_eq!(n, 26);
        let parsed = VideoPacketHeader::parse(&buf).unwrap();
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn continuation_bit_drives_parse() {
        let hdr = make_header();
        let mut buf = [0u8; 64];
        hdr.write(&mut buf);
        // continuation clear: exactly one SRD
        assert!(VideoPacketHeader::parse(&buf).unwrap().srd2.is_none());
    }

    #[test]
    fn field_bit_roundtrip() {
        let mut hdr = make_header();
        hdr.srd.field = true;
        let mut buf = [0u8; 64];
        hdr.write(&mut buf);
        assert!(VideoPacketHeader::parse(&buf).unwrap().srd.field);
    }

    #[test]
    fn full_seq_combines_extension() {
        let hdr = make_header();
        assert_eq!(hdr.full_seq(), 0x00011234);
    }

    #[test]
    fn truncated_rejected() {
        let hdr = make_header();
        let mut buf = [0u8; 64];
        hdr.write(&mut buf);
        assert!(VideoPacketHeader::parse(&buf[..16]).is_err());
    }
}
