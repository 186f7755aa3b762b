//! ST 2110-41 fast metadata.
//!
//! Fast metadata shares the ancillary pipeline's 10-bit encoding — the
//! same parity extension, the same packed word layout, the same 9-bit
//! checksum with inverted top bit. What differs is the framing: each data
//! item is identified by a 22-bit Data Item Type plus the K continuity
//! bit instead of DID/SDID packet info.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |              Data Item Type (22)          |K|R|  Word Count   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               10-bit words ... checksum word                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use crate::ancillary::{add_parity, calc_checksum, check_parity, get_udw, set_udw};
use crate::error::{Error, IntegrityErrorKind, Result};
use crate::rtp::{RTP_HDR_LEN, RtpHeader};

/// One fast-metadata data item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FmdItem {
    /// Data Item Type, 22 bits.
    pub dit: u32,
    /// Continuity flag: set when the item continues in the next packet.
    pub k: bool,
    pub payload: Vec<u8>,
}

/// Wire bytes of one item's 10-bit region, checksum included.
///
/// Same rule as the ANC path: floor then 32-bit align, growing one word
/// when flooring would strand the checksum.
fn item_region_size(words: usize) -> usize {
    let bits = (words + 1) * 10;
    let size = (bits / 8 + 3) & !3;
    if size * 8 < bits { size + 4 } else { size }
}

/// Serialize one RTP packet carrying `items`.
pub fn build_fmd_packet(rtp: RtpHeader, items: &[FmdItem]) -> Result<Vec<u8>> {
    let body: usize = items
        .iter()
        .map(|i| 4 + item_region_size(i.payload.len()))
        .sum();
    let mut out = vec![0u8; RTP_HDR_LEN + 4 + body];
    rtp.write(&mut out);
    out[RTP_HDR_LEN] = items.len() as u8;

    let mut off = RTP_HDR_LEN + 4;
    for item in items {
        if item.dit > 0x3F_FFFF || item.payload.len() > 255 {
            return Err(Error::InvalidArg(format!(
                "dit {:#x} / {} words out of range",
                item.dit,
                item.payload.len()
            )));
        }
        let word = (item.dit << 10)
            | ((item.k as u32) << 9)
            | (item.payload.len() as u32 & 0xFF);
        out[off..off + 4].copy_from_slice(&word.to_be_bytes());
        off += 4;

        let region_len = item_region_size(item.payload.len());
        let region = &mut out[off..off + region_len];
        for (i, &b) in item.payload.iter().enumerate() {
            set_udw(i, add_parity(b), region);
        }
        let checksum = calc_checksum(item.payload.len(), region);
        set_udw(item.payload.len(), checksum, region);
        off += region_len;
    }
    Ok(out)
}

/// Parse a fast-metadata RTP payload back into items.
///
/// A parity or checksum failure drops the offending item and keeps the
/// rest, matching the ancillary pipeline's error policy.
pub fn parse_fmd_packet(payload: &[u8]) -> Result<(RtpHeader, Vec<FmdItem>)> {
    let rtp = RtpHeader::parse(payload)?;
    if payload.len() < RTP_HDR_LEN + 4 {
        return Err(Error::WireIntegrity {
            kind: IntegrityErrorKind::MalformedRtp,
        });
    }
    let count = payload[RTP_HDR_LEN] as usize;
    let body = &payload[RTP_HDR_LEN + 4..];
    let mut items = Vec::with_capacity(count);
    let mut off = 0usize;
    for _ in 0..count {
        if off + 4 > body.len() {
            break;
        }
        let word = u32::from_be_bytes(body[off..off + 4].try_into().unwrap());
        off += 4;
        let words = (word & 0xFF) as usize;
        let region_len = item_region_size(words);
        if off + region_len > body.len() {
            break;
        }
        let region = &body[off..off + region_len];
        off += region_len;

        let mut payload_bytes = Vec::with_capacity(words);
        let mut ok = true;
        for i in 0..words {
            let w = get_udw(i, region);
            if !check_parity(w) {
                tracing::warn!(item = items.len(), word = i, "fmd parity failure");
                ok = false;
                break;
            }
            payload_bytes.push(w as u8);
        }
        if ok && get_udw(words, region) != calc_checksum(words, region) {
            tracing::warn!(item = items.len(), "fmd checksum mismatch");
            ok = false;
        }
        if ok {
            items.push(FmdItem {
                dit: word >> 10,
                k: (word >> 9) & 1 != 0,
                payload: payload_bytes,
            });
        }
    }
    Ok((rtp, items))
}
