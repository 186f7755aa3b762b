//! ST 2110-20 video receive session.
//!
//! One frame is in flight at a time, keyed by RTP timestamp. A packet with
//! the in-flight timestamp is placed by its SRD addressing; a packet with
//! a newer timestamp closes the in-flight frame (READY, complete or not)
//! and opens the next; a packet older than the last closed frame is a late
//! arrival and is dropped. Closure also fires on the marker bit and on the
//! expected packet count.
//!
//! Placement is bounds-checked against the frame size; an SRD whose end
//! exceeds it is counted and discarded without disturbing the frame. A
//! per-packet bitmap (indexed arithmetically from the SRD, so reordered
//! and duplicated packets are idempotent) decides completeness together
//! with the received byte count.

use std::sync::Arc;

use crate::config::{SessionFlags, VideoSessionConfig};
use crate::error::{Error, IntegrityErrorKind, Result};
use crate::hdr::NET_HDR_LEN;
use crate::rtcp::RtcpRx;
use crate::stats::Counter;
use crate::time::{Clock, TimestampFmt};

use super::detect::{DetectCallback, DetectMeta, Detector};
use super::frame::{FrameRing, FrameStatus, RxFrame, RxFrameMeta};
use super::rfc4175::VideoPacketHeader;
use super::tx::PacketGeometry;

/// Slice progress reported every `slice_lines` completed lines.
#[derive(Debug, Clone, Copy)]
pub struct SliceMeta {
    /// Monotonic within a frame.
    pub lines_ready: u32,
    pub rtp_timestamp: u32,
}

/// Slice-granularity consumer hook.
pub type SliceCallback = Box<dyn FnMut(&SliceMeta) + Send>;
/// Wake hook fired when a frame becomes READY.
pub type FrameNotify = Box<dyn Fn() + Send>;

struct Inflight {
    buf: Vec<u8>,
    rtp_ts: u32,
    recv_size: usize,
    pkts_recv: u32,
    bitmap: Vec<u64>,
    first_pkt_time: u64,
    last_pkt_time: u64,
    seq_discont: u32,
    seq_lost: u32,
    second_field: bool,
    lines_ready: u32,
    line_recv: Vec<u32>,
    marker: bool,
}

impl Inflight {
    fn new(buf: Vec<u8>, rtp_ts: u32, geom: &PacketGeometry) -> Self {
        Self {
            buf,
            rtp_ts,
            recv_size: 0,
            pkts_recv: 0,
            bitmap: vec![0u64; (geom.pkts_per_frame as usize).div_ceil(64)],
            first_pkt_time: 0,
            last_pkt_time: 0,
            seq_discont: 0,
            seq_lost: 0,
            second_field: false,
            lines_ready: 0,
            line_recv: vec![0u32; geom.lines as usize],
            marker: false,
        }
    }

    fn set_bit(&mut self, idx: u32) -> bool {
        let word = &mut self.bitmap[(idx / 64) as usize];
        let mask = 1u64 << (idx % 64);
        let fresh = *word & mask == 0;
        *word |= mask;
        fresh
    }

    fn bitmap_full(&self, total: u32) -> bool {
        let ones: u32 = self.bitmap.iter().map(|w| w.count_ones()).sum();
        ones >= total
    }
}

enum RxState {
    Detecting(Detector),
    Running,
}

/// One receive session.
pub struct VideoRxSession {
    cfg: VideoSessionConfig,
    geom: PacketGeometry,
    ring: Arc<FrameRing>,
    state: RxState,
    detect_cb: Option<DetectCallback>,
    inflight: Option<Inflight>,
    last_closed_ts: Option<u32>,
    /// Full 32-bit sequence last seen, per redundant port.
    last_seq: [Option<u32>; 2],
    rtcp: Option<RtcpRx>,
    pending_nacks: Vec<Vec<u8>>,
    clock: Clock,
    slice_lines: u32,
    slice_cb: Option<SliceCallback>,
    notify: Option<FrameNotify>,
    pub fatal_error: bool,
    pub stat_pkts_recv: Counter,
    pub stat_pkts_late: Counter,
    pub stat_pkts_dup: Counter,
    pub stat_pkts_overrun: Counter,
    pub stat_frames_complete: Counter,
    pub stat_frames_incomplete: Counter,
    pub stat_frames_dropped_busy: Counter,
}

impl VideoRxSession {
    pub fn new(
        cfg: VideoSessionConfig,
        clock: Clock,
        detect_cb: Option<DetectCallback>,
    ) -> Result<VideoRxSession> {
        cfg.validate()?;
        let geom = PacketGeometry::new(&cfg)?;
        let ring = FrameRing::new(cfg.framebuff_cnt, geom.frame_size as usize);
        let state = if cfg.flags.contains(SessionFlags::AUTO_DETECT) {
            RxState::Detecting(Detector::new(cfg.fmt))
        } else {
            RxState::Running
        };
        let rtcp = cfg
            .flags
            .contains(SessionFlags::ENABLE_RTCP)
            .then(|| RtcpRx::new(3));
        let slice_lines = cfg.slice_lines;
        tracing::info!(
            width = cfg.width,
            height = cfg.height,
            pkts_per_frame = geom.pkts_per_frame,
            detect = matches!(state, RxState::Detecting(_)),
            "video rx session created"
        );
        Ok(VideoRxSession {
            cfg,
            geom,
            ring,
            state,
            detect_cb,
            inflight: None,
            last_closed_ts: None,
            last_seq: [None; 2],
            rtcp,
            pending_nacks: Vec::new(),
            clock,
            slice_lines,
            slice_cb: None,
            notify: None,
            fatal_error: false,
            stat_pkts_recv: Counter::new(),
            stat_pkts_late: Counter::new(),
            stat_pkts_dup: Counter::new(),
            stat_pkts_overrun: Counter::new(),
            stat_frames_complete: Counter::new(),
            stat_frames_incomplete: Counter::new(),
            stat_frames_dropped_busy: Counter::new(),
        })
    }

    pub fn set_slice_callback(&mut self, cb: SliceCallback) {
        self.slice_cb = Some(cb);
    }

    pub fn set_frame_notify(&mut self, cb: FrameNotify) {
        self.notify = Some(cb);
    }

    /// Consumer-facing frame ring (blocking get, put, wake).
    pub fn frames(&self) -> Arc<FrameRing> {
        self.ring.clone()
    }

    pub fn geometry(&self) -> &PacketGeometry {
        &self.geom
    }

    /// NACK packets built since the last call; the session driver sends
    /// them through the port's system TX queue.
    pub fn take_pending_nacks(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.pending_nacks)
    }

    /// Ingest one full wire frame (Ethernet headers included).
    pub fn on_packet(&mut self, wire: &[u8], port_idx: usize) -> Result<()> {
        if wire.len() <= NET_HDR_LEN {
            return Err(Error::WireIntegrity {
                kind: IntegrityErrorKind::MalformedRtp,
            });
        }
        let payload = &wire[NET_HDR_LEN..];
        let hdr = VideoPacketHeader::parse(payload)?;
        self.stat_pkts_recv.inc();
        let now = self.clock.time_ns();

        if let RxState::Detecting(detector) = &mut self.state {
            let detected = detector.feed(&hdr);
            if let Some(meta) = detected {
                self.apply_detected(meta);
            }
            return Ok(());
        }

        self.track_seq(&hdr, port_idx);

        // timestamp discipline: same fills, newer closes, older drops
        if let Some(inflight) = &self.inflight {
            let delta = hdr.rtp.timestamp.wrapping_sub(inflight.rtp_ts) as i32;
            if delta < 0 {
                self.stat_pkts_late.inc();
                return Ok(());
            }
            if delta > 0 {
                self.close_inflight();
            }
        } else if let Some(closed) = self.last_closed_ts {
            let delta = hdr.rtp.timestamp.wrapping_sub(closed) as i32;
            if delta <= 0 {
                self.stat_pkts_late.inc();
                return Ok(());
            }
        }

        if self.inflight.is_none() {
            match self.ring.take_free() {
                Ok(buf) => {
                    let mut inflight = Inflight::new(buf, hdr.rtp.timestamp, &self.geom);
                    inflight.first_pkt_time = now;
                    self.inflight = Some(inflight);
                }
                Err(_) => {
                    self.stat_frames_dropped_busy.inc();
                    return Err(Error::Busy("no free framebuffer"));
                }
            }
        }

        self.place(&hdr, payload, now)?;

        let close = {
            let inflight = self.inflight.as_ref().expect("frame in flight");
            inflight.marker || inflight.pkts_recv >= self.geom.pkts_per_frame
        };
        if close {
            self.close_inflight();
        }
        Ok(())
    }

    fn track_seq(&mut self, hdr: &VideoPacketHeader, port_idx: usize) {
        let full = hdr.full_seq();
        let slot = &mut self.last_seq[port_idx.min(1)];
        if let Some(last) = *slot {
            let delta = full.wrapping_sub(last) as i32;
            if delta != 1
                && let Some(inflight) = &mut self.inflight
            {
                inflight.seq_discont += 1;
                if delta > 1 {
                    inflight.seq_lost += (delta - 1) as u32;
                }
            }
        }
        *slot = Some(full);

        if let Some(rtcp) = &mut self.rtcp {
            let pending = &mut self.pending_nacks;
            rtcp.on_rtp(hdr.rtp.sequence, hdr.rtp.ssrc, |wire| {
                pending.push(wire.to_vec());
            });
        }
    }

    fn place(&mut self, hdr: &VideoPacketHeader, payload: &[u8], now: u64) -> Result<()> {
        let data = &payload[hdr.wire_len()..];
        let inflight = self.inflight.as_mut().expect("frame in flight");
        inflight.last_pkt_time = now;
        if inflight.first_pkt_time == 0 {
            inflight.first_pkt_time = now;
        }
        inflight.marker |= hdr.rtp.marker;
        inflight.second_field |= hdr.srd.field;

        let bpl = self.geom.bytes_per_line;
        let mut src_off = 0usize;
        let mut first_frame_offset = None;
        for srd in std::iter::once(&hdr.srd).chain(hdr.srd2.as_ref()) {
            let off_bytes = srd.row_offset as u32 * self.geom.pg_size() / self.geom.pg_coverage();
            let dst = srd.row_number as u32 * bpl + off_bytes;
            let end = dst as usize + srd.length as usize;
            if end > inflight.buf.len() || src_off + srd.length as usize > data.len() {
                self.stat_pkts_overrun.inc();
                return Err(Error::WireIntegrity {
                    kind: IntegrityErrorKind::FrameOverrun,
                });
            }
            inflight.buf[dst as usize..end]
                .copy_from_slice(&data[src_off..src_off + srd.length as usize]);
            src_off += srd.length as usize;
            first_frame_offset.get_or_insert(dst);

            if let Some(line) = inflight.line_recv.get_mut(srd.row_number as usize) {
                *line = (*line + srd.length as u32).min(bpl);
            }
        }

        // packet identity from its placement, immune to reordering
        let pkt_idx = self.geom.packet_index(first_frame_offset.unwrap_or(0));
        if inflight.set_bit(pkt_idx.min(self.geom.pkts_per_frame.saturating_sub(1))) {
            inflight.pkts_recv += 1;
            inflight.recv_size += src_off;
        } else {
            self.stat_pkts_dup.inc();
        }

        self.advance_slices();
        Ok(())
    }

    fn advance_slices(&mut self) {
        if self.slice_lines == 0 {
            return;
        }
        let Some(inflight) = self.inflight.as_mut() else {
            return;
        };
        let bpl = self.geom.bytes_per_line;
        let mut ready = inflight.lines_ready;
        while (ready as usize) < inflight.line_recv.len()
            && inflight.line_recv[ready as usize] >= bpl
        {
            ready += 1;
        }
        if ready / self.slice_lines > inflight.lines_ready / self.slice_lines
            && let Some(cb) = &mut self.slice_cb
        {
            cb(&SliceMeta {
                lines_ready: ready,
                rtp_timestamp: inflight.rtp_ts,
            });
        }
        inflight.lines_ready = ready;
    }

    fn close_inflight(&mut self) {
        let Some(inflight) = self.inflight.take() else {
            return;
        };
        self.last_closed_ts = Some(inflight.rtp_ts);
        let total = self.geom.frame_size as usize;
        let complete = inflight.recv_size >= total
            && inflight.bitmap_full(self.geom.pkts_per_frame);
        let status = if complete {
            FrameStatus::Complete
        } else {
            FrameStatus::Incomplete
        };
        if !complete && !self.cfg.flags.contains(SessionFlags::RECEIVE_INCOMPLETE) {
            self.stat_frames_incomplete.inc();
            self.ring.reclaim(inflight.buf);
            return;
        }
        let frame_time = self.cfg.fps.frame_time_ns();
        let meta = RxFrameMeta {
            width: self.cfg.width,
            height: self.cfg.height,
            fps: self.cfg.fps,
            fmt: self.cfg.fmt,
            frame_total_size: total,
            frame_recv_size: inflight.recv_size,
            rtp_timestamp: inflight.rtp_ts,
            tfmt: TimestampFmt::MediaClk,
            timestamp_first_pkt: inflight.first_pkt_time,
            timestamp_last_pkt: inflight.last_pkt_time,
            fpt: inflight.first_pkt_time % frame_time.max(1),
            seq_discont: inflight.seq_discont,
            seq_lost: inflight.seq_lost,
            second_field: inflight.second_field,
            pkts_recv: inflight.pkts_recv,
            status,
        };
        match status {
            FrameStatus::Complete => self.stat_frames_complete.inc(),
            FrameStatus::Incomplete => self.stat_frames_incomplete.inc(),
        }
        self.ring.push_ready(RxFrame {
            data: inflight.buf,
            meta,
        });
        if let Some(notify) = &self.notify {
            notify();
        }
    }

    fn apply_detected(&mut self, meta: DetectMeta) {
        let reply = self
            .detect_cb
            .as_mut()
            .map(|cb| cb(&meta))
            .unwrap_or_default();
        tracing::info!(
            width = meta.width,
            height = meta.height,
            fps = ?meta.fps,
            interlaced = meta.interlaced,
            "raster detected"
        );
        self.cfg.width = meta.width;
        self.cfg.height = meta.height;
        self.cfg.fps = meta.fps;
        self.cfg.interlaced = meta.interlaced;
        if let Some(slice) = reply.slice_lines {
            self.slice_lines = slice;
        }
        if let Ok(geom) = PacketGeometry::new(&self.cfg) {
            // consumer handles keep pointing at the same ring; only the
            // buffer geometry changes
            self.ring.reinit(geom.frame_size as usize);
            self.geom = geom;
        }
        self.state = RxState::Running;
    }
}
