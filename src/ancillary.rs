//! ST 2110-40 ancillary data over RFC 8331.
//!
//! An ANC RTP packet carries a count of sub-packets, each one SMPTE 291
//! message: packet info (C, line, horizontal offset, S, stream number),
//! then 10-bit words — DID, SDID, Data Count, the UDW array, and a
//! checksum — packed contiguously across byte boundaries:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |C|   Line Number       |   Horizontal Offset   |S| StreamNum   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         DID       |        SDID       |   Data Count      |   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                   User Data Words...                          |
//! |                            ...            |   Checksum Word   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Each 10-bit word carries parity: bit 8 is the XOR of bits 0-7 and
//! bit 9 its inverse. The checksum is the 9-bit sum of every word from
//! DID through the last UDW, with bit 9 the inverse of bit 8.
//!
//! A sub-packet's byte length is `(3 + udw + 1) * 10 / 8` floored, then
//! rounded up to the next 32-bit boundary; when flooring would leave the
//! checksum tail outside the region the advance grows one more word so
//! the wire never truncates it.
//!
//! The receive pipeline groups packets by RTP timestamp: a frame stays
//! open until the timestamp changes or the marker bit closes it. A bad
//! sub-packet (parity, checksum, UDW overflow) is dropped and its UDW
//! bytes rolled back; the rest of the frame survives.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, IntegrityErrorKind, Result};
use crate::rtp::{RTP_HDR_LEN, RtpHeader};
use crate::stats::Counter;

/// Sub-packets allowed per frame.
pub const ST40_MAX_META: usize = 20;
/// RFC 8331 header bytes after the RTP fixed header.
pub const ANC_HDR_LEN: usize = 8;
/// Packet-info chunk bytes in front of each sub-packet's 10-bit words.
const ANC_INFO_LEN: usize = 4;

// --- 10-bit word packing ---

/// Read the 10-bit word at index `idx` from a packed region.
pub fn get_udw(idx: usize, data: &[u8]) -> u16 {
    let bit = idx * 10;
    let byte = bit / 8;
    let shift = bit % 8;
    let window = ((data[byte] as u32) << 16)
        | ((*data.get(byte + 1).unwrap_or(&0) as u32) << 8)
        | *data.get(byte + 2).unwrap_or(&0) as u32;
    ((window >> (14 - shift)) & 0x3FF) as u16
}

/// Write the 10-bit word at index `idx` into a packed region.
pub fn set_udw(idx: usize, val: u16, data: &mut [u8]) {
    let bit = idx * 10;
    let byte = bit / 8;
    let shift = bit % 8;
    let mask = 0x3FFu32 << (14 - shift);
    let mut window = ((data[byte] as u32) << 16)
        | ((*data.get(byte + 1).unwrap_or(&0) as u32) << 8)
        | *data.get(byte + 2).unwrap_or(&0) as u32;
    window = (window & !mask) | (((val as u32) & 0x3FF) << (14 - shift));
    data[byte] = (window >> 16) as u8;
    if byte + 1 < data.len() {
        data[byte + 1] = (window >> 8) as u8;
    }
    if byte + 2 < data.len() {
        data[byte + 2] = window as u8;
    }
}

/// Extend an 8-bit value with its parity bits: b8 = XOR of bits 0-7,
/// b9 = !b8.
pub fn add_parity(val: u8) -> u16 {
    let ones = val.count_ones();
    if ones % 2 == 1 {
        0x100 | val as u16
    } else {
        0x200 | val as u16
    }
}

/// Verify a 10-bit word's parity bits.
pub fn check_parity(val: u16) -> bool {
    val == add_parity(val as u8)
}

/// Checksum over the first `words` 10-bit words of a packed region:
/// 9-bit sum with bit 9 the inverse of bit 8.
pub fn calc_checksum(words: usize, data: &[u8]) -> u16 {
    let mut sum = 0u16;
    for i in 0..words {
        sum = sum.wrapping_add(get_udw(i, data));
    }
    sum &= 0x1FF;
    (!(sum << 1) & 0x200) | sum
}

/// Wire bytes a sub-packet's 10-bit region occupies, checksum included.
pub fn sub_packet_size(udw_words: usize) -> usize {
    let bits = (3 + udw_words + 1) * 10;
    let size = (bits / 8 + 3) & !3;
    // flooring may strand the checksum tail past the region; grow so the
    // wire always carries all its bits
    if size * 8 < bits { size + 4 } else { size }
}

// --- meta and frames ---

/// One SMPTE 291 message descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AncMeta {
    /// Color-difference channel flag.
    pub c: bool,
    pub line_number: u16,
    pub hori_offset: u16,
    /// Stream-number valid flag.
    pub s: bool,
    pub stream_num: u8,
    pub did: u8,
    pub sdid: u8,
    /// UDW count.
    pub udw_size: u16,
    /// Offset of this message's UDW bytes in the frame's shared buffer.
    pub udw_offset: usize,
}

/// A frame-aligned collection of ANC messages.
#[derive(Debug, Default)]
pub struct AncFrame {
    pub meta: Vec<AncMeta>,
    /// Decoded UDW bytes of every message, back to back.
    pub udw_buf: Vec<u8>,
    pub rtp_timestamp: u32,
    pub pkts_total: u32,
    pub seq_discont: bool,
    pub seq_lost: u32,
    pub rtp_marker: bool,
}

impl AncFrame {
    /// UDW bytes of one message.
    pub fn udw(&self, meta: &AncMeta) -> &[u8] {
        &self.udw_buf[meta.udw_offset..meta.udw_offset + meta.udw_size as usize]
    }
}

// --- TX ---

/// Serialize one RTP packet carrying `items` for a frame.
///
/// Returns the RTP payload (header included); the caller wraps it in
/// UDP/IP. The marker bit is set — one packet carries a whole frame's
/// meta set, bounded by [`ST40_MAX_META`].
pub fn build_anc_packet(
    rtp: RtpHeader,
    items: &[(AncMeta, &[u8])],
) -> Result<Vec<u8>> {
    if items.len() > ST40_MAX_META {
        return Err(Error::InvalidArg(format!(
            "{} anc items exceed the {ST40_MAX_META} per-frame bound",
            items.len()
        )));
    }
    let body: usize = items
        .iter()
        .map(|(_, udw)| ANC_INFO_LEN + sub_packet_size(udw.len()))
        .sum();
    let mut out = vec![0u8; RTP_HDR_LEN + ANC_HDR_LEN + body];
    rtp.write(&mut out);
    // ext seq stays zero: one packet per frame keeps 16 bits plenty
    let length = (ANC_HDR_LEN + body) as u16;
    out[RTP_HDR_LEN + 2..RTP_HDR_LEN + 4].copy_from_slice(&length.to_be_bytes());
    out[RTP_HDR_LEN + 4] = items.len() as u8;

    let mut off = RTP_HDR_LEN + ANC_HDR_LEN;
    for (meta, udw) in items {
        if udw.len() != meta.udw_size as usize {
            return Err(Error::InvalidArg("udw_size mismatch".into()));
        }
        let info = ((meta.c as u32) << 31)
            | ((meta.line_number as u32 & 0x7FF) << 20)
            | ((meta.hori_offset as u32 & 0xFFF) << 8)
            | ((meta.s as u32) << 7)
            | (meta.stream_num as u32 & 0x7F);
        out[off..off + 4].copy_from_slice(&info.to_be_bytes());
        off += ANC_INFO_LEN;

        let region_len = sub_packet_size(udw.len());
        let region = &mut out[off..off + region_len];
        set_udw(0, add_parity(meta.did), region);
        set_udw(1, add_parity(meta.sdid), region);
        set_udw(2, add_parity(udw.len() as u8), region);
        for (i, &b) in udw.iter().enumerate() {
            set_udw(3 + i, add_parity(b), region);
        }
        let checksum = calc_checksum(3 + udw.len(), region);
        set_udw(3 + udw.len(), checksum, region);
        off += region_len;
    }
    Ok(out)
}

/// ANC transmit session: one RTP packet per frame, epoch-aligned.
pub struct AncTxSession {
    payload_type: u8,
    ssrc: u32,
    seq: u16,
    fps: crate::config::Fps,
    clock: crate::time::Clock,
    last_epoch_ns: u64,
    pub stat_frames_sent: Counter,
}

impl AncTxSession {
    pub fn new(
        payload_type: u8,
        fps: crate::config::Fps,
        clock: crate::time::Clock,
    ) -> AncTxSession {
        use rand::RngExt;
        AncTxSession {
            payload_type,
            ssrc: rand::rng().random(),
            seq: 0,
            fps,
            clock,
            last_epoch_ns: 0,
            stat_frames_sent: Counter::new(),
        }
    }

    /// Serialize the frame's meta set into its RTP packet, aligned to the
    /// next frame epoch. Returns the wire payload and the epoch it was
    /// scheduled for.
    pub fn next_frame(&mut self, items: &[(AncMeta, &[u8])]) -> Result<(Vec<u8>, u64)> {
        let now = self.clock.time_ns();
        let epoch = crate::time::next_epoch_ns(now, self.fps)
            .max(self.last_epoch_ns + self.fps.frame_time_ns());
        self.last_epoch_ns = epoch;
        let rtp = RtpHeader {
            marker: true,
            payload_type: self.payload_type,
            sequence: self.seq,
            timestamp: crate::time::tai_to_media_clk(epoch),
            ssrc: self.ssrc,
        };
        self.seq = self.seq.wrapping_add(1);
        let wire = build_anc_packet(rtp, items)?;
        self.stat_frames_sent.inc();
        Ok((wire, epoch))
    }
}

// --- RX ---

struct Ready {
    queue: VecDeque<AncFrame>,
    wake_pending: bool,
}

/// ANC receive pipeline: RTP-timestamp aggregation into frames.
pub struct AncRxSession {
    inflight: Option<AncFrame>,
    last_seq: [Option<u16>; 2],
    udw_capacity: usize,
    ready: Mutex<Ready>,
    wake: Condvar,
    pub stat_pkts_recv: Counter,
    pub stat_bad_subpacket: Counter,
    pub stat_frames_done: Counter,
}

impl AncRxSession {
    pub fn new(udw_capacity: usize) -> AncRxSession {
        AncRxSession {
            inflight: None,
            last_seq: [None; 2],
            udw_capacity: udw_capacity.max(64),
            ready: Mutex::new(Ready {
                queue: VecDeque::new(),
                wake_pending: false,
            }),
            wake: Condvar::new(),
            stat_pkts_recv: Counter::new(),
            stat_bad_subpacket: Counter::new(),
            stat_frames_done: Counter::new(),
        }
    }

    /// Consume one RTP payload (headers included).
    pub fn on_packet(&mut self, payload: &[u8], port_idx: usize) -> Result<()> {
        let rtp = RtpHeader::parse(payload)?;
        if payload.len() < RTP_HDR_LEN + ANC_HDR_LEN {
            return Err(Error::WireIntegrity {
                kind: IntegrityErrorKind::MalformedRtp,
            });
        }
        self.stat_pkts_recv.inc();

        // timestamp change closes the previous frame
        if let Some(inflight) = &self.inflight
            && inflight.rtp_timestamp != rtp.timestamp
        {
            self.finish_frame();
        }
        if self.inflight.is_none() {
            self.inflight = Some(AncFrame {
                rtp_timestamp: rtp.timestamp,
                ..Default::default()
            });
        }
        {
            // per-port sequence bookkeeping
            let frame = self.inflight.as_mut().expect("frame in flight");
            let slot = &mut self.last_seq[port_idx.min(1)];
            if let Some(last) = *slot {
                let expected = last.wrapping_add(1);
                if rtp.sequence != expected {
                    frame.seq_discont = true;
                    if crate::rtcp::seq16_newer(rtp.sequence, expected) {
                        frame.seq_lost += rtp.sequence.wrapping_sub(expected) as u32;
                    }
                }
            }
            *slot = Some(rtp.sequence);
            frame.pkts_total += 1;
        }

        let anc_count = payload[RTP_HDR_LEN + 4] as usize;
        let body = &payload[RTP_HDR_LEN + ANC_HDR_LEN..];
        let mut off = 0usize;
        for _ in 0..anc_count {
            let slots_full = self
                .inflight
                .as_ref()
                .is_some_and(|f| f.meta.len() >= ST40_MAX_META);
            if slots_full {
                tracing::warn!("anc meta slots exhausted, rest of packet dropped");
                break;
            }
            if off + ANC_INFO_LEN > body.len() {
                tracing::warn!(off, room = body.len(), "anc info exceeds payload");
                break;
            }
            let info = u32::from_be_bytes(body[off..off + 4].try_into().unwrap());
            off += ANC_INFO_LEN;

            // did/sdid/data-count live in the 10-bit region
            let Some(head) = body.get(off..) else { break };
            if head.len() < 4 {
                break;
            }
            let udw_words = (get_udw(2, head) & 0xFF) as usize;
            let region_len = sub_packet_size(udw_words);
            if off + region_len > body.len() {
                tracing::warn!(off, region_len, "anc sub-packet exceeds payload");
                break;
            }
            let region = &body[off..off + region_len];
            off += region_len;

            match self.decode_sub_packet(info, udw_words, region) {
                Ok(()) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "anc sub-packet dropped");
                    self.stat_bad_subpacket.inc();
                }
            }
        }

        if rtp.marker {
            if let Some(frame) = &mut self.inflight {
                frame.rtp_marker = true;
            }
            self.finish_frame();
        }
        Ok(())
    }

    fn decode_sub_packet(&mut self, info: u32, udw_words: usize, region: &[u8]) -> Result<()> {
        let frame = self.inflight.as_mut().expect("frame in flight");
        let bad = |kind| Error::WireIntegrity { kind };

        let did_w = get_udw(0, region);
        let sdid_w = get_udw(1, region);
        let dc_w = get_udw(2, region);
        for w in [did_w, sdid_w, dc_w] {
            if !check_parity(w) {
                return Err(bad(IntegrityErrorKind::UdwParity));
            }
        }

        let udw_offset = frame.udw_buf.len();
        for i in 0..udw_words {
            let w = get_udw(3 + i, region);
            if !check_parity(w) {
                frame.udw_buf.truncate(udw_offset);
                return Err(bad(IntegrityErrorKind::UdwParity));
            }
            if frame.udw_buf.len() >= self.udw_capacity {
                frame.udw_buf.truncate(udw_offset);
                return Err(Error::NoBuffer("anc udw buffer"));
            }
            frame.udw_buf.push(w as u8);
        }
        let checksum = get_udw(3 + udw_words, region);
        if checksum != calc_checksum(3 + udw_words, region) {
            frame.udw_buf.truncate(udw_offset);
            return Err(bad(IntegrityErrorKind::AncChecksum));
        }

        frame.meta.push(AncMeta {
            c: info >> 31 != 0,
            line_number: ((info >> 20) & 0x7FF) as u16,
            hori_offset: ((info >> 8) & 0xFFF) as u16,
            s: (info >> 7) & 1 != 0,
            stream_num: (info & 0x7F) as u8,
            did: (did_w & 0xFF) as u8,
            sdid: (sdid_w & 0xFF) as u8,
            udw_size: udw_words as u16,
            udw_offset,
        });
        Ok(())
    }

    fn finish_frame(&mut self) {
        let Some(frame) = self.inflight.take() else {
            return;
        };
        self.stat_frames_done.inc();
        self.ready.lock().queue.push_back(frame);
        self.wake.notify_one();
    }

    /// Non-blocking frame pickup.
    pub fn try_get_frame(&self) -> Option<AncFrame> {
        self.ready.lock().queue.pop_front()
    }

    /// Blocking frame pickup with timeout.
    pub fn get_frame(&self, timeout: Duration) -> Option<AncFrame> {
        let mut ready = self.ready.lock();
        loop {
            if let Some(frame) = ready.queue.pop_front() {
                return Some(frame);
            }
            if ready.wake_pending {
                ready.wake_pending = false;
                return None;
            }
            if self.wake.wait_for(&mut ready, timeout).timed_out() {
                return None;
            }
        }
    }

    /// Unblock a waiting getter, e.g. at shutdown.
    pub fn wake_block(&self) {
        self.ready.lock().wake_pending = true;
        self.wake.notify_all();
    }
}
