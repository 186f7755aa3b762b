//! RTCP NACK / retransmit engine.
//!
//! A bespoke NACK frame rides on RTCP:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|  FMT    |    PT=205     |            length             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          SSRC of sender                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      name "IMTL" (ASCII)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         FCI start seq         |         follow count          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The length field counts 32-bit words minus one, FCIs included. Each FCI
//! names a run of `follow + 1` consecutive missing sequence ids.
//!
//! TX keeps a bounded ring of recently sent packets indexed by sequence
//! number and re-emits matches through the system TX queue. RX detects
//! gaps against `last_seq + 1`, keeps pending items as plain vector
//! entries, splits an item when one of its packets is recovered by
//! retransmit, and packs the pending list into one NACK every 128th
//! sequence id.

use std::collections::VecDeque;

use rand::RngExt;

use crate::error::{Error, IntegrityErrorKind, Result};
use crate::stats::Counter;

/// RTCP packet type for transport-layer feedback (RFC 4585).
pub const RTCP_PTYPE_NACK: u8 = 205;
/// First header byte: version 2, no padding, FMT 0.
pub const RTCP_FLAGS: u8 = 0x80;
/// Name tag identifying our NACK flavor.
pub const RTCP_NAME: &[u8; 4] = b"IMTL";

pub const RTCP_HDR_LEN: usize = 12;
const FCI_LEN: usize = 4;

/// True when `a` is strictly newer than `b` in 16-bit sequence space.
///
/// A distance of exactly 32768 is neither side's future; it compares as
/// older so a wrapped late packet can never trigger a 32767-wide NACK.
pub fn seq16_newer(a: u16, b: u16) -> bool {
    if a == b {
        return false;
    }
    let fwd = a.wrapping_sub(b);
    fwd < 32768 && fwd != 0
}

/// One pending retransmit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackItem {
    pub seq_start: u16,
    /// Additional consecutive ids after `seq_start`.
    pub follow: u16,
    pub retries_remaining: u16,
}

/// Serialize the pending list into one RTCP NACK packet.
pub fn build_nack_packet(ssrc: u32, items: &[NackItem]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RTCP_HDR_LEN + items.len() * FCI_LEN);
    out.push(RTCP_FLAGS);
    out.push(RTCP_PTYPE_NACK);
    let words = (RTCP_HDR_LEN / 4 - 1 + items.len()) as u16;
    out.extend_from_slice(&words.to_be_bytes());
    out.extend_from_slice(&ssrc.to_be_bytes());
    out.extend_from_slice(RTCP_NAME);
    for item in items {
        out.extend_from_slice(&item.seq_start.to_be_bytes());
        out.extend_from_slice(&item.follow.to_be_bytes());
    }
    out
}

/// Parse an RTCP NACK packet into `(ssrc, fci list)`.
pub fn parse_nack_packet(buf: &[u8]) -> Result<(u32, Vec<(u16, u16)>)> {
    let bad = || Error::WireIntegrity {
        kind: IntegrityErrorKind::BadRtcp,
    };
    if buf.len() < RTCP_HDR_LEN || buf[0] != RTCP_FLAGS || buf[1] != RTCP_PTYPE_NACK {
        return Err(bad());
    }
    if &buf[8..12] != RTCP_NAME {
        return Err(bad());
    }
    let words = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let num_fci = (words + 1).saturating_sub(RTCP_HDR_LEN / 4);
    if buf.len() < RTCP_HDR_LEN + num_fci * FCI_LEN {
        return Err(bad());
    }
    let ssrc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let mut fcis = Vec::with_capacity(num_fci);
    for i in 0..num_fci {
        let off = RTCP_HDR_LEN + i * FCI_LEN;
        fcis.push((
            u16::from_be_bytes([buf[off], buf[off + 1]]),
            u16::from_be_bytes([buf[off + 2], buf[off + 3]]),
        ));
    }
    Ok((ssrc, fcis))
}

/// TX-side engine: retransmit buffer plus NACK intake.
pub struct RtcpTx {
    ssrc: u32,
    buffer_size: usize,
    /// Recently sent wire packets in sequence order.
    ring: VecDeque<(u16, Vec<u8>)>,
    pub stat_rtp_sent: Counter,
    pub stat_nack_received: Counter,
    pub stat_retransmit: Counter,
    pub stat_retransmit_miss: Counter,
}

impl RtcpTx {
    pub fn new(ssrc: u32, buffer_size: usize) -> Self {
        Self {
            ssrc,
            buffer_size: buffer_size.max(1),
            ring: VecDeque::new(),
            stat_rtp_sent: Counter::new(),
            stat_nack_received: Counter::new(),
            stat_retransmit: Counter::new(),
            stat_retransmit_miss: Counter::new(),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Remember a sent packet's wire image for possible retransmit.
    /// The oldest entries fall off when the buffer is full.
    pub fn buffer_sent(&mut self, seq: u16, wire: Vec<u8>) {
        while self.ring.len() >= self.buffer_size {
            self.ring.pop_front();
        }
        self.ring.push_back((seq, wire));
        self.stat_rtp_sent.inc();
    }

    /// Handle an inbound RTCP NACK, re-emitting every requested packet
    /// still in the buffer through `emit`.
    pub fn handle_nack(
        &mut self,
        buf: &[u8],
        mut emit: impl FnMut(&[u8]),
    ) -> Result<usize> {
        let (_ssrc, fcis) = parse_nack_packet(buf)?;
        self.stat_nack_received.inc();
        let mut resent = 0;
        for (start, follow) in fcis {
            for n in 0..=follow {
                let seq = start.wrapping_add(n);
                match self.ring.iter().find(|(s, _)| *s == seq) {
                    Some((_, wire)) => {
                        emit(wire);
                        resent += 1;
                        self.stat_retransmit.inc();
                    }
                    None => {
                        // too old or never sent; both are the peer's problem
                        let head = self.ring.front().map(|(s, _)| *s);
                        tracing::warn!(seq, ?head, "nack outside retransmit window");
                        self.stat_retransmit_miss.inc();
                    }
                }
            }
        }
        Ok(resent)
    }
}

/// RX-side engine: loss detection and NACK emission.
pub struct RtcpRx {
    ssrc: u32,
    last_seq: u16,
    seq_valid: bool,
    max_retry: u16,
    nack_list: Vec<NackItem>,
    pub stat_rtp_received: Counter,
    pub stat_lost_detected: Counter,
    pub stat_nack_sent: Counter,
    pub stat_recovered: Counter,
}

impl RtcpRx {
    pub fn new(max_retry: u16) -> Self {
        Self {
            ssrc: 0,
            last_seq: 0,
            seq_valid: false,
            max_retry: max_retry.max(1),
            nack_list: Vec::new(),
            stat_rtp_received: Counter::new(),
            stat_lost_detected: Counter::new(),
            stat_nack_sent: Counter::new(),
            stat_recovered: Counter::new(),
        }
    }

    pub fn pending(&self) -> &[NackItem] {
        &self.nack_list
    }

    /// Track one received RTP packet. When the 128-sequence cadence fires
    /// and items are pending, `emit` sends the packed NACK.
    pub fn on_rtp(&mut self, seq: u16, ssrc: u32, emit: impl FnOnce(&[u8])) {
        self.stat_rtp_received.inc();
        if !self.seq_valid {
            self.ssrc = ssrc;
            self.last_seq = seq;
            self.seq_valid = true;
            return;
        }
        let expected = self.last_seq.wrapping_add(1);
        if seq == expected {
            self.last_seq = seq;
        } else if seq16_newer(seq, expected) {
            let lost = seq.wrapping_sub(expected);
            self.stat_lost_detected.add(lost as u64);
            self.nack_list.push(NackItem {
                seq_start: expected,
                follow: lost - 1,
                retries_remaining: self.max_retry,
            });
            tracing::info!(
                seq,
                last_seq = self.last_seq,
                start = expected,
                follow = lost - 1,
                "packet loss detected, nack queued"
            );
            self.last_seq = seq;
        } else {
            self.recover(seq);
        }

        if seq % 128 == 0 {
            self.send_nack(emit);
        }
    }

    /// A late packet inside a pending range was recovered; split the item
    /// into the (possibly empty) left and right remainders.
    fn recover(&mut self, seq: u16) {
        let Some(pos) = self.nack_list.iter().position(|item| {
            let off = seq.wrapping_sub(item.seq_start);
            off <= item.follow
        }) else {
            return;
        };
        let item = self.nack_list.swap_remove(pos);
        let off = seq.wrapping_sub(item.seq_start);
        if off > 0 {
            self.nack_list.push(NackItem {
                seq_start: item.seq_start,
                follow: off - 1,
                retries_remaining: self.max_retry,
            });
        }
        if off < item.follow {
            self.nack_list.push(NackItem {
                seq_start: seq.wrapping_add(1),
                follow: item.follow - off - 1,
                retries_remaining: self.max_retry,
            });
        }
        self.stat_recovered.inc();
    }

    /// Pack the pending list into one NACK packet and decay retries.
    pub fn send_nack(&mut self, emit: impl FnOnce(&[u8])) {
        if self.nack_list.is_empty() {
            return;
        }
        let wire = build_nack_packet(self.ssrc, &self.nack_list);
        for item in &mut self.nack_list {
            item.retries_remaining -= 1;
        }
        self.nack_list.retain(|item| item.retries_remaining > 0);
        emit(&wire);
        self.stat_nack_sent.inc();
    }
}

/// Deterministic loss injection for recovery tests: Bernoulli per packet,
/// bounded burst length.
pub struct LossSimulator {
    rate: f64,
    max_burst: u32,
    in_burst: u32,
    rng: rand::rngs::StdRng,
}

impl LossSimulator {
    pub fn new(rate: f64, max_burst: u32) -> Self {
        Self::with_seed(rate, max_burst, rand::rng().random())
    }

    /// Seeded variant so a failing run can be replayed.
    pub fn with_seed(rate: f64, max_burst: u32, seed: u64) -> Self {
        use rand::SeedableRng;
        Self {
            rate,
            max_burst: max_burst.max(1),
            in_burst: 0,
            rng: rand::rngs::StdRng::seed_from_u64(seed),
        }
    }

    pub fn should_drop(&mut self) -> bool {
        if self.in_burst > 0 {
            self.in_burst -= 1;
            return true;
        }
        if self.rate > 0.0 && self.rng.random::<f64>() < self.rate {
            self.in_burst = self.rng.random_range(0..self.max_burst);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_compare_window() {
        assert!(seq16_newer(10, 5));
        assert!(!seq16_newer(5, 10));
        assert!(!seq16_newer(7, 7));
        // wrap
        assert!(seq16_newer(2, 65530));
        assert!(!seq16_newer(65530, 2));
        // exactly half the space compares as older in both directions
        assert!(!seq16_newer(32768, 0));
        assert!(!seq16_newer(0, 32768));
    }

    #[test]
    fn nack_wire_roundtrip() {
        let items = [
            NackItem {
                seq_start: 100,
                follow: 3,
                retries_remaining: 2,
            },
            NackItem {
                seq_start: 200,
                follow: 0,
                retries_remaining: 2,
            },
        ];
        let wire = build_nack_packet(0xCAFEBABE, &items);
        let (ssrc, fcis) = parse_nack_packet(&wire).unwrap();
        assert_eq!(ssrc, 0xCAFEBABE);
        assert_eq!(fcis, vec![(100, 3), (200, 0)]);
        // inclusive length field in 32-bit words
        let words = u16::from_be_bytes([wire[2], wire[3]]);
        assert_eq!((words as usize + 1) * 4, wire.len());
    }

    #[test]
    fn bad_rtcp_rejected() {
        let mut wire = build_nack_packet(1, &[]);
        wire[8] = b'X';
        assert!(parse_nack_packet(&wire).is_err());
        assert!(parse_nack_packet(&[0u8; 4]).is_err());
    }

    #[test]
    fn gap_inserts_nack() {
        let mut rx = RtcpRx::new(3);
        rx.on_rtp(10, 0x11, |_| {});
        rx.on_rtp(11, 0x11, |_| {});
        rx.on_rtp(15, 0x11, |_| {});
        assert_eq!(
            rx.pending(),
            &[NackItem {
                seq_start: 12,
                follow: 2,
                retries_remaining: 3,
            }]
        );
        assert_eq!(rx.stat_lost_detected.get(), 3);
    }

    #[test]
    fn recovery_splits_range() {
        let mut rx = RtcpRx::new(3);
        rx.on_rtp(10, 0x11, |_| {});
        rx.on_rtp(20, 0x11, |_| {}); // missing 11..=19
        rx.on_rtp(15, 0x11, |_| {}); // recovered inside the gap
        let mut pending = rx.pending().to_vec();
        pending.sort_by_key(|i| i.seq_start);
        assert_eq!(pending.len(), 2);
        assert_eq!((pending[0].seq_start, pending[0].follow), (11, 3));
        assert_eq!((pending[1].seq_start, pending[1].follow), (16, 3));
    }

    #[test]
    fn recovery_at_range_edge_leaves_one_side() {
        let mut rx = RtcpRx::new(3);
        rx.on_rtp(10, 0x11, |_| {});
        rx.on_rtp(14, 0x11, |_| {}); // missing 11,12,13
        rx.on_rtp(11, 0x11, |_| {}); // left edge recovered
        let pending = rx.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!((pending[0].seq_start, pending[0].follow), (12, 1));
    }

    #[test]
    fn retry_decay_removes_items() {
        let mut rx = RtcpRx::new(2);
        rx.on_rtp(10, 0x11, |_| {});
        rx.on_rtp(13, 0x11, |_| {});
        let mut sent = 0;
        rx.send_nack(|_| sent += 1);
        assert_eq!(rx.pending().len(), 1);
        rx.send_nack(|_| sent += 1);
        assert!(rx.pending().is_empty());
        rx.send_nack(|_| sent += 1);
        assert_eq!(sent, 2);
    }

    #[test]
    fn nack_cadence_every_128() {
        let mut rx = RtcpRx::new(3);
        let mut emitted = Vec::new();
        rx.on_rtp(100, 0x11, |_| {});
        rx.on_rtp(120, 0x11, |_| {}); // gap
        for seq in 121..=128 {
            rx.on_rtp(seq, 0x11, |w: &[u8]| emitted.push(w.to_vec()));
        }
        assert_eq!(emitted.len(), 1);
        let (_, fcis) = parse_nack_packet(&emitted[0]).unwrap();
        assert_eq!(fcis, vec![(101, 18)]);
    }

    #[test]
    fn tx_buffer_retransmits_in_window() {
        let mut tx = RtcpTx::new(0x22, 16);
        for seq in 0..10u16 {
            tx.buffer_sent(seq, vec![seq as u8; 8]);
        }
        let nack = build_nack_packet(
            0x22,
            &[NackItem {
                seq_start: 3,
                follow: 1,
                retries_remaining: 1,
            }],
        );
        let mut resent = Vec::new();
        let n = tx
            .handle_nack(&nack, |wire| resent.push(wire.to_vec()))
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(resent[0], vec![3u8; 8]);
        assert_eq!(resent[1], vec![4u8; 8]);
    }

    #[test]
    fn tx_buffer_bounds_and_misses() {
        let mut tx = RtcpTx::new(0x22, 4);
        for seq in 0..10u16 {
            tx.buffer_sent(seq, vec![seq as u8; 4]);
        }
        // only 6..=9 remain
        let nack = build_nack_packet(
            0x22,
            &[NackItem {
                seq_start: 2,
                follow: 0,
                retries_remaining: 1,
            }],
        );
        let n = tx.handle_nack(&nack, |_| {}).unwrap();
        assert_eq!(n, 0);
        assert_eq!(tx.stat_retransmit_miss.get(), 1);
    }

    #[test]
    fn loss_simulator_bounded_burst() {
        let mut sim = LossSimulator::new(1.0, 3);
        // rate 1.0 always starts a burst; it must terminate
        let mut consecutive = 0;
        let mut max_run = 0;
        for _ in 0..100 {
            if sim.should_drop() {
                consecutive += 1;
                max_run = max_run.max(consecutive);
            } else {
                consecutive = 0;
            }
        }
        assert!(max_run >= 1);
    }
}
