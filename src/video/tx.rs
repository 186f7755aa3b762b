//! ST 2110-20 video transmit session.
//!
//! Turns raster frames into RFC 4175 packet trains. The three packing
//! modes differ only in geometry:
//!
//! - **BPM**: fixed 1260-byte payload; a packet crossing a line boundary
//!   carries a continuation SRD for the next row.
//! - **GPM**: like BPM but fills to the MTU budget.
//! - **GPM_SL**: packets never cross a line; each line is split into
//!   `ceil(bytes_per_line / budget)` equal packets.
//!
//! All modes address packet `k` arithmetically, so the out-of-order test
//! mode can emit any permutation without a running cursor. Sequence
//! numbers bind to the linear index — permuted emission reorders the wire,
//! not the numbering. The final packet of a frame (marker) is never
//! permuted away from last place, keeping closure semantics intact.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use rand::SeedableRng;

use crate::arp::{self, NeighborResolver};
use crate::backend::{TxMeta, TxPacket};
use crate::config::{Packing, SessionFlags, VideoSessionConfig};
use crate::error::{Error, Result};
use crate::hdr::{HeaderTemplate, MacAddr, NET_HDR_LEN};
use crate::mempool::{ExtSeg, MbufPool};
use crate::pacing::{PacerState, PacingMode, TscPacer};
use crate::rtcp::RtcpTx;
use crate::rtp::RtpHeader;
use crate::stats::Counter;
use crate::time::{self, Clock, TimestampFmt};

use super::rfc4175::{Srd, VideoPacketHeader};

/// BPM fixed payload size.
pub const BPM_PAYLOAD: u32 = 1260;
/// Ethernet MTU the GPM budgets assume.
const MTU: u32 = 1500;
/// Packets handed to the sink per poll iteration.
const TX_BURST: usize = 32;
/// How long a full pacing queue is retried before giving up.
const QUEUE_RETRY_DEADLINE: Duration = Duration::from_millis(10);

/// Producer-supplied metadata for one frame.
#[derive(Debug, Clone, Default)]
pub struct TxFrameMeta {
    /// `Some(Tai)` with `USER_PACING`: absolute departure nanoseconds.
    /// `Some(MediaClk)` with `USER_TIMESTAMP`: raw RTP timestamp.
    pub tfmt: Option<TimestampFmt>,
    pub timestamp: u64,
    /// External frame for zero-copy transmit (`EXT_FRAME`).
    pub ext: Option<Arc<Vec<u8>>>,
}

/// Reported to the producer when a frame has fully left the session.
#[derive(Debug, Clone, Copy)]
pub struct TxDoneMeta {
    pub rtp_timestamp: u32,
    pub epoch_ns: u64,
    pub second_field: bool,
}

/// Frame source driven by the session tasklet.
pub trait FrameProducer: Send {
    /// Fill `frame` (or supply an external buffer in the returned meta)
    /// and return the frame's metadata; `None` means no frame is ready.
    fn next_frame(&mut self, frame: &mut [u8]) -> Option<TxFrameMeta>;

    /// The frame left the wire; its buffer is FREE again.
    fn frame_done(&mut self, _meta: &TxDoneMeta) {}
}

/// Where packets go: a dedicated backend queue or a shared TSQ entry.
pub trait TxSink {
    fn send(&mut self, pkts: &mut Vec<TxPacket>) -> Result<usize>;
}

impl TxSink for crate::backend::TxQueue {
    fn send(&mut self, pkts: &mut Vec<TxPacket>) -> Result<usize> {
        self.tx_burst(pkts)
    }
}

impl TxSink for crate::queue::TsqEntry {
    fn send(&mut self, pkts: &mut Vec<TxPacket>) -> Result<usize> {
        self.burst(pkts)
    }
}

/// Arithmetic addressing of packets within a frame.
#[derive(Debug, Clone)]
pub struct PacketGeometry {
    pub bytes_per_line: u32,
    pub lines: u32,
    pub frame_size: u32,
    /// Max payload bytes per packet, pixel-group aligned.
    pub payload_budget: u32,
    pub single_line: bool,
    pub pkts_per_line: u32,
    pub pkts_per_frame: u32,
    pg_size: u32,
    pg_coverage: u32,
}

/// Placement of one packet's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketPlacement {
    /// Byte offset of the payload in the frame (contiguous raster order).
    pub frame_offset: u32,
    pub payload_len: u32,
    pub srd: Srd,
    pub srd2: Option<Srd>,
}

impl PacketGeometry {
    pub fn new(cfg: &VideoSessionConfig) -> Result<PacketGeometry> {
        let pg_size = cfg.fmt.pg_size();
        let pg_coverage = cfg.fmt.pg_coverage();
        let bytes_per_line = cfg.fmt.bytes_per_line(cfg.width)?;
        let lines = if cfg.interlaced {
            cfg.height / 2
        } else {
            cfg.height
        };
        let frame_size = bytes_per_line * lines;

        let align = |budget: u32| budget / pg_size * pg_size;
        let (payload_budget, single_line, pkts_per_line) = match cfg.packing {
            // a packet spans at most one line boundary (two SRDs), so the
            // budget is capped at one line for narrow rasters
            Packing::Bpm => (align(BPM_PAYLOAD).min(bytes_per_line), false, 0),
            Packing::Gpm => {
                // MTU minus eth/ip/udp, rtp, ext seq, and two SRDs
                let budget = align(MTU - NET_HDR_LEN as u32 - 12 - 2 - 12);
                (budget.min(bytes_per_line), false, 0)
            }
            Packing::GpmSl => {
                let max = align(MTU - NET_HDR_LEN as u32 - 12 - 2 - 6);
                let pkts_per_line = bytes_per_line.div_ceil(max);
                let per_pkt = bytes_per_line.div_ceil(pkts_per_line);
                (
                    per_pkt.div_ceil(pg_size) * pg_size,
                    true,
                    pkts_per_line,
                )
            }
        };
        if payload_budget == 0 {
            return Err(Error::InvalidArg("payload budget underflow".into()));
        }
        let pkts_per_frame = if single_line {
            pkts_per_line * lines
        } else {
            frame_size.div_ceil(payload_budget)
        };
        Ok(PacketGeometry {
            bytes_per_line,
            lines,
            frame_size,
            payload_budget,
            single_line,
            pkts_per_line,
            pkts_per_frame,
            pg_size,
            pg_coverage,
        })
    }

    pub fn pg_size(&self) -> u32 {
        self.pg_size
    }

    pub fn pg_coverage(&self) -> u32 {
        self.pg_coverage
    }

    /// Inverse of [`locate`](Self::locate): which packet starts at this
    /// frame byte offset.
    pub fn packet_index(&self, frame_offset: u32) -> u32 {
        if self.single_line {
            let row = frame_offset / self.bytes_per_line;
            let within = frame_offset % self.bytes_per_line;
            row * self.pkts_per_line + within / self.payload_budget
        } else {
            frame_offset / self.payload_budget
        }
    }

    fn pixels(&self, bytes: u32) -> u16 {
        (bytes / self.pg_size * self.pg_coverage) as u16
    }

    /// Where packet `k` of a frame lives.
    pub fn locate(&self, k: u32, second_field: bool) -> PacketPlacement {
        if self.single_line {
            let row = k / self.pkts_per_line;
            let off = (k % self.pkts_per_line) * self.payload_budget;
            let len = self.payload_budget.min(self.bytes_per_line - off);
            return PacketPlacement {
                frame_offset: row * self.bytes_per_line + off,
                payload_len: len,
                srd: Srd {
                    length: len as u16,
                    field: second_field,
                    row_number: row as u16,
                    row_offset: self.pixels(off),
                },
                srd2: None,
            };
        }
        let frame_offset = k * self.payload_budget;
        let payload_len = self.payload_budget.min(self.frame_size - frame_offset);
        let row = frame_offset / self.bytes_per_line;
        let off = frame_offset % self.bytes_per_line;
        let len1 = payload_len.min(self.bytes_per_line - off);
        let srd = Srd {
            length: len1 as u16,
            field: second_field,
            row_number: row as u16,
            row_offset: self.pixels(off),
        };
        let srd2 = if len1 < payload_len {
            Some(Srd {
                length: (payload_len - len1) as u16,
                field: second_field,
                row_number: (row + 1) as u16,
                row_offset: 0,
            })
        } else {
            None
        };
        PacketPlacement {
            frame_offset,
            payload_len,
            srd,
            srd2,
        }
    }
}

/// Bounded-distance emission permutation for receiver stress tests.
fn ooo_order(n: u32, max_swap: u32, rng: &mut rand::rngs::StdRng) -> Vec<u32> {
    let mut order: Vec<u32> = (0..n).collect();
    if n < 3 || max_swap == 0 {
        return order;
    }
    // the marker packet (last) stays in place
    let swappable = (n - 1) as usize;
    let mut i = 0usize;
    while i + 1 < swappable {
        let d = rng.random_range(1..=max_swap as usize).min(swappable - 1 - i);
        if d > 0 && rng.random::<bool>() {
            order.swap(i, i + d);
        }
        i += d.max(1);
    }
    order
}

enum FrameData {
    Internal(usize),
    Ext(Arc<Vec<u8>>),
}

struct InFlight {
    data: FrameData,
    order: Vec<u32>,
    next: u32,
    epoch_ns: u64,
    rtp_ts: u32,
    second_field: bool,
}

/// One transmit session.
pub struct VideoTxSession {
    cfg: VideoSessionConfig,
    geom: PacketGeometry,
    pool: MbufPool,
    producer: Box<dyn FrameProducer>,
    frames: Vec<Vec<u8>>,
    frame_cursor: usize,
    templates: Vec<HeaderTemplate>,
    unresolved: Vec<bool>,
    ssrc: u32,
    seq: u32,
    pacing: PacingMode,
    pacer: PacerState,
    tsc: TscPacer,
    clock: Clock,
    inflight: Option<InFlight>,
    last_epoch_ns: u64,
    second_field: bool,
    rtcp: Option<RtcpTx>,
    ooo_max_swap: u32,
    rng: rand::rngs::StdRng,
    pending: Vec<TxPacket>,
    pub fatal_error: bool,
    pub stat_frames_sent: Counter,
    pub stat_pkts_sent: Counter,
    pub stat_pkts_dropped_unresolved: Counter,
    pub stat_tx_retry: Counter,
}

impl VideoTxSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: VideoSessionConfig,
        pool: MbufPool,
        producer: Box<dyn FrameProducer>,
        src_mac: MacAddr,
        src_ip: Ipv4Addr,
        resolver: &dyn NeighborResolver,
        clock: Clock,
        pacing: PacingMode,
    ) -> Result<VideoTxSession> {
        cfg.validate()?;
        let geom = PacketGeometry::new(&cfg)?;
        let frame_size = geom.frame_size as usize;
        let frames = (0..cfg.framebuff_cnt)
            .map(|_| vec![0u8; frame_size])
            .collect();

        let mut rng = rand::rngs::StdRng::seed_from_u64(rand::rng().random());
        let src_port = if cfg.udp_src_port_base == 0 {
            cfg.dests[0].udp_port
        } else {
            cfg.udp_src_port_base + rng.random_range(0..1000)
        };

        let arp_timeout = Duration::from_millis(cfg.arp_timeout_ms);
        let mut templates = Vec::new();
        let mut unresolved = Vec::new();
        for dest in &cfg.dests {
            let mac = arp::resolve_dest_mac(resolver, dest.ip, arp_timeout);
            let dst_mac = match mac {
                Some(m) => m,
                None if cfg.arp_timeout_ms == 0 => {
                    // kernel sendto semantics: accept and drop on the wire
                    tracing::warn!(ip = %dest.ip, "neighbor unresolved, packets will drop");
                    MacAddr::BROADCAST
                }
                None => return Err(Error::Unreachable("arp timeout")),
            };
            unresolved.push(mac.is_none());
            templates.push(HeaderTemplate::new(
                src_mac, dst_mac, src_ip, dest.ip, src_port, dest.udp_port,
            ));
        }

        let pacer = PacerState::new(cfg.fps, geom.pkts_per_frame);
        let ssrc = rng.random::<u32>();
        let rtcp = cfg
            .flags
            .contains(SessionFlags::ENABLE_RTCP)
            .then(|| RtcpTx::new(ssrc, 1024));
        tracing::info!(
            width = cfg.width,
            height = cfg.height,
            pkts_per_frame = geom.pkts_per_frame,
            ?pacing,
            "video tx session created"
        );
        Ok(VideoTxSession {
            cfg,
            geom,
            pool,
            producer,
            frames,
            frame_cursor: 0,
            templates,
            unresolved,
            ssrc,
            seq: 0,
            pacing,
            pacer,
            tsc: TscPacer::new(clock.clone()),
            clock,
            inflight: None,
            last_epoch_ns: 0,
            second_field: false,
            rtcp,
            ooo_max_swap: 0,
            rng,
            pending: Vec::new(),
            fatal_error: false,
            stat_frames_sent: Counter::new(),
            stat_pkts_sent: Counter::new(),
            stat_pkts_dropped_unresolved: Counter::new(),
            stat_tx_retry: Counter::new(),
        })
    }

    /// Enable the out-of-order emission test mode.
    pub fn set_out_of_order(&mut self, max_swap: u32) {
        self.ooo_max_swap = max_swap;
    }

    /// Switch the pacing discipline, e.g. after a hardware shaper refused
    /// to install.
    pub fn set_pacing(&mut self, pacing: PacingMode) {
        self.pacing = pacing;
    }

    pub fn geometry(&self) -> &PacketGeometry {
        &self.geom
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn rtcp_mut(&mut self) -> Option<&mut RtcpTx> {
        self.rtcp.as_mut()
    }

    /// Session byte rate on the wire, for the hardware shaper.
    pub fn bytes_per_sec(&self) -> u64 {
        let wire = NET_HDR_LEN as u32 + 12 + 2 + 12 + self.geom.payload_budget;
        self.pacer
            .bytes_per_sec(self.geom.pkts_per_frame, wire, self.cfg.fps)
    }

    fn start_frame(&mut self) -> Result<bool> {
        let buf = &mut self.frames[self.frame_cursor];
        let Some(meta) = self.producer.next_frame(buf) else {
            return Ok(false);
        };
        let data = match &meta.ext {
            Some(ext) if self.cfg.flags.contains(SessionFlags::EXT_FRAME) => {
                if ext.len() < self.geom.frame_size as usize {
                    return Err(Error::InvalidArg(format!(
                        "external frame {} bytes, need {}",
                        ext.len(),
                        self.geom.frame_size
                    )));
                }
                FrameData::Ext(ext.clone())
            }
            _ => FrameData::Internal(self.frame_cursor),
        };

        let now = self.clock.time_ns();
        // never reuse an epoch: back-to-back frames inside one frame period
        // still advance by a full period
        let auto_epoch = time::next_epoch_ns(now, self.cfg.fps)
            .max(self.last_epoch_ns + self.pacer.frame_time_ns());
        let (epoch_ns, rtp_ts) = match meta.tfmt {
            Some(TimestampFmt::Tai) if self.cfg.flags.contains(SessionFlags::USER_PACING) => {
                (meta.timestamp, time::tai_to_media_clk(meta.timestamp))
            }
            Some(TimestampFmt::MediaClk)
                if self.cfg.flags.contains(SessionFlags::USER_TIMESTAMP) =>
            {
                (auto_epoch, meta.timestamp as u32)
            }
            _ => (auto_epoch, time::tai_to_media_clk(auto_epoch)),
        };
        self.last_epoch_ns = epoch_ns;

        let order = if self.ooo_max_swap > 0 {
            ooo_order(self.geom.pkts_per_frame, self.ooo_max_swap, &mut self.rng)
        } else {
            (0..self.geom.pkts_per_frame).collect()
        };
        self.inflight = Some(InFlight {
            data,
            order,
            next: 0,
            epoch_ns,
            rtp_ts,
            second_field: self.second_field,
        });
        Ok(true)
    }

    fn build_packet(&mut self, linear_idx: u32) -> Result<Vec<TxPacket>> {
        let inflight = self.inflight.as_ref().expect("frame in flight");
        let place = self.geom.locate(linear_idx, inflight.second_field);
        let is_last = linear_idx == self.geom.pkts_per_frame - 1;
        let full_seq = self.seq.wrapping_add(linear_idx);

        let hdr = VideoPacketHeader {
            rtp: RtpHeader {
                marker: is_last,
                payload_type: self.cfg.payload_type,
                sequence: full_seq as u16,
                timestamp: inflight.rtp_ts,
                ssrc: self.ssrc,
            },
            ext_seq: (full_seq >> 16) as u16,
            srd: place.srd,
            srd2: place.srd2,
        };

        let launch = match self.pacing {
            PacingMode::LaunchTime => self.pacer.packet_time(inflight.epoch_ns, linear_idx),
            _ => 0,
        };

        let mut out = Vec::with_capacity(self.templates.len());
        for (port, tmpl) in self.templates.iter_mut().enumerate() {
            if self.unresolved[port] {
                self.stat_pkts_dropped_unresolved.inc();
                continue;
            }
            let mut mbuf = self.pool.alloc()?;
            let rtp_len = hdr.wire_len();
            let payload_len = place.payload_len as usize;
            let udp_payload = rtp_len + payload_len;

            match &inflight.data {
                FrameData::Internal(idx) => {
                    let dst = mbuf.append(NET_HDR_LEN + udp_payload)?;
                    tmpl.write(dst, udp_payload);
                    hdr.write(&mut dst[NET_HDR_LEN..]);
                    let src = &self.frames[*idx][place.frame_offset as usize..]
                        [..payload_len];
                    dst[NET_HDR_LEN + rtp_len..].copy_from_slice(src);
                }
                FrameData::Ext(ext) => {
                    // scatter-gather: headers in the mbuf, payload shared
                    let dst = mbuf.append(NET_HDR_LEN + rtp_len)?;
                    tmpl.write(dst, udp_payload);
                    hdr.write(&mut dst[NET_HDR_LEN..]);
                    mbuf.set_ext(ExtSeg {
                        buf: ext.clone(),
                        offset: place.frame_offset as usize,
                        len: payload_len,
                    });
                }
            }
            if let Some(rtcp) = &mut self.rtcp
                && port == 0
            {
                rtcp.buffer_sent(full_seq as u16, mbuf.to_wire());
            }
            out.push(TxPacket {
                mbuf,
                meta: TxMeta {
                    launch_time_ns: launch,
                },
            });
        }
        Ok(out)
    }

    /// Drive the session: pull a frame if idle, emit up to one burst.
    ///
    /// Returns packets handed to the sink. Tasklet handlers call this in
    /// their loop; it never blocks except for TSC pacing.
    pub fn poll(&mut self, sink: &mut dyn TxSink) -> Result<usize> {
        if self.fatal_error {
            return Err(Error::DriverFatal { queue: 0 });
        }
        if !self.flush_pending(sink)? {
            return Ok(0);
        }
        if self.inflight.is_none() && !self.start_frame()? {
            return Ok(0);
        }

        let mut sent_total = 0;
        for _ in 0..TX_BURST {
            let Some(inflight) = self.inflight.as_ref() else {
                break;
            };
            if inflight.next >= self.geom.pkts_per_frame {
                break;
            }
            let emit_idx = inflight.next;
            let linear = inflight.order[emit_idx as usize];

            if self.pacing == PacingMode::Tsc {
                let deadline = self.pacer.packet_time(inflight.epoch_ns, emit_idx);
                self.tsc.pace_until(deadline);
            }

            let mut pkts = self.build_packet(linear)?;
            let n = pkts.len();
            if !self.send_with_retry(sink, &mut pkts)? {
                // queue stayed full; keep the remainder for the next poll
                self.pending = pkts;
                if let Some(inflight) = self.inflight.as_mut() {
                    inflight.next += 1;
                }
                return Ok(sent_total);
            }
            sent_total += n;
            self.stat_pkts_sent.add(n as u64);
            if let Some(inflight) = self.inflight.as_mut() {
                inflight.next += 1;
            }
        }

        let frame_done = self
            .inflight
            .as_ref()
            .is_some_and(|f| f.next >= self.geom.pkts_per_frame);
        if frame_done {
            self.finish_frame();
        }
        Ok(sent_total)
    }

    fn flush_pending(&mut self, sink: &mut dyn TxSink) -> Result<bool> {
        if self.pending.is_empty() {
            return Ok(true);
        }
        let mut pending = std::mem::take(&mut self.pending);
        sink.send(&mut pending)?;
        let done = pending.is_empty();
        self.pending = pending;
        let frame_done = done
            && self
                .inflight
                .as_ref()
                .is_some_and(|f| f.next >= self.geom.pkts_per_frame);
        if frame_done {
            self.finish_frame();
        }
        Ok(done)
    }

    fn send_with_retry(
        &mut self,
        sink: &mut dyn TxSink,
        pkts: &mut Vec<TxPacket>,
    ) -> Result<bool> {
        sink.send(pkts)?;
        if pkts.is_empty() {
            return Ok(true);
        }
        self.stat_tx_retry.inc();
        let deadline = std::time::Instant::now() + QUEUE_RETRY_DEADLINE;
        while !pkts.is_empty() && std::time::Instant::now() < deadline {
            sink.send(pkts)?;
            std::hint::spin_loop();
        }
        Ok(pkts.is_empty())
    }

    fn finish_frame(&mut self) {
        let inflight = self.inflight.take().expect("frame in flight");
        self.seq = self.seq.wrapping_add(self.geom.pkts_per_frame);
        self.frame_cursor = (self.frame_cursor + 1) % self.frames.len();
        if self.cfg.interlaced {
            self.second_field = !self.second_field;
        }
        self.stat_frames_sent.inc();
        self.producer.frame_done(&TxDoneMeta {
            rtp_timestamp: inflight.rtp_ts,
            epoch_ns: inflight.epoch_ns,
            second_field: inflight.second_field,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arp::StaticNeighbors;
    use crate::config::{Fps, SessionDest, VideoFormat};
    use crate::time::SystemClock;

    fn config(w: u32, h: u32, packing: Packing) -> VideoSessionConfig {
        VideoSessionConfig {
            dests: vec![SessionDest {
                ip: Ipv4Addr::new(239, 0, 0, 1),
                udp_port: 20000,
            }],
            payload_type: 112,
            width: w,
            height: h,
            fps: Fps::P50,
            fmt: VideoFormat::Yuv422_10Bit,
            packing,
            interlaced: false,
            framebuff_cnt: 2,
            linesize: None,
            slice_lines: 0,
            flags: SessionFlags::empty(),
            arp_timeout_ms: 0,
            udp_src_port_base: 30000,
        }
    }

    #[test]
    fn bpm_geometry_1080p() {
        let geom = PacketGeometry::new(&config(1920, 1080, Packing::Bpm)).unwrap();
        assert_eq!(geom.bytes_per_line, 4800);
        assert_eq!(geom.frame_size, 5_184_000);
        assert_eq!(geom.payload_budget, 1260);
        assert_eq!(geom.pkts_per_frame, 5_184_000u32.div_ceil(1260));
    }

    #[test]
    fn bpm_crossing_packet_has_two_srds() {
        let geom = PacketGeometry::new(&config(1920, 1080, Packing::Bpm)).unwrap();
        // 4800 / 1260: packet 3 spans the line boundary
        let p = geom.locate(3, false);
        assert_eq!(p.srd.row_number, 0);
        assert_eq!(p.srd.length as u32 + p.srd2.unwrap().length as u32, 1260);
        assert_eq!(p.srd2.unwrap().row_number, 1);
        assert_eq!(p.srd2.unwrap().row_offset, 0);
    }

    #[test]
    fn bpm_last_packet_short() {
        let geom = PacketGeometry::new(&config(1920, 1080, Packing::Bpm)).unwrap();
        let last = geom.locate(geom.pkts_per_frame - 1, false);
        let tail = geom.frame_size - (geom.pkts_per_frame - 1) * 1260;
        assert_eq!(last.payload_len, tail);
        assert!(last.srd2.is_none() || tail > geom.bytes_per_line);
    }

    #[test]
    fn gpm_sl_never_crosses_lines() {
        let geom = PacketGeometry::new(&config(1920, 1080, Packing::GpmSl)).unwrap();
        assert!(geom.single_line);
        assert_eq!(geom.pkts_per_line, 4);
        for k in 0..geom.pkts_per_frame {
            let p = geom.locate(k, false);
            assert!(p.srd2.is_none());
            assert!(
                p.srd.row_offset as u32 * geom.pg_size / geom.pg_coverage
                    + p.payload_len
                    <= geom.bytes_per_line
            );
        }
    }

    #[test]
    fn geometry_covers_every_byte_exactly_once() {
        for packing in [Packing::Bpm, Packing::Gpm, Packing::GpmSl] {
            let geom = PacketGeometry::new(&config(128, 16, packing)).unwrap();
            let mut covered = vec![0u8; geom.frame_size as usize];
            for k in 0..geom.pkts_per_frame {
                let p = geom.locate(k, false);
                if geom.single_line {
                    let row = p.srd.row_number as u32;
                    let off =
                        p.srd.row_offset as u32 * geom.pg_size / geom.pg_coverage;
                    let start = (row * geom.bytes_per_line + off) as usize;
                    for b in &mut covered[start..start + p.payload_len as usize] {
                        *b += 1;
                    }
                } else {
                    let start = p.frame_offset as usize;
                    for b in &mut covered[start..start + p.payload_len as usize] {
                        *b += 1;
                    }
                }
            }
            assert!(
                covered.iter().all(|&c| c == 1),
                "{packing:?} coverage hole or overlap"
            );
        }
    }

    #[test]
    fn ooo_order_is_permutation_with_fixed_tail() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let order = ooo_order(100, 4, &mut rng);
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..100).collect::<Vec<_>>());
        assert_eq!(*order.last().unwrap(), 99);
        for (i, &v) in order.iter().enumerate() {
            assert!((v as i64 - i as i64).unsigned_abs() <= 4);
        }
    }

    struct CountingProducer {
        frames: usize,
        fill: u8,
    }

    impl FrameProducer for CountingProducer {
        fn next_frame(&mut self, frame: &mut [u8]) -> Option<TxFrameMeta> {
            if self.frames == 0 {
                return None;
            }
            self.frames -= 1;
            frame.fill(self.fill);
            Some(TxFrameMeta::default())
        }
    }

    struct VecSink(Vec<Vec<u8>>);

    impl TxSink for VecSink {
        fn send(&mut self, pkts: &mut Vec<TxPacket>) -> Result<usize> {
            let n = pkts.len();
            for p in pkts.drain(..) {
                self.0.push(p.mbuf.to_wire());
            }
            Ok(n)
        }
    }

    fn small_session(cfg: VideoSessionConfig, frames: usize) -> VideoTxSession {
        let pool = MbufPool::new("tx", 256, 2048).unwrap();
        VideoTxSession::new(
            cfg,
            pool,
            Box::new(CountingProducer { frames, fill: 0x5A }),
            MacAddr([2, 0, 0, 0, 0, 1]),
            Ipv4Addr::new(192, 168, 1, 10),
            &StaticNeighbors::new(),
            Arc::new(SystemClock),
            PacingMode::HwRl,
        )
        .unwrap()
    }

    #[test]
    fn frame_emits_expected_packet_train() {
        let cfg = config(64, 8, Packing::Bpm);
        let mut session = small_session(cfg, 1);
        let total = session.geometry().pkts_per_frame;
        let mut sink = VecSink(Vec::new());
        while session.stat_frames_sent.get() == 0 {
            session.poll(&mut sink).unwrap();
        }
        assert_eq!(sink.0.len() as u32, total);

        // last packet carries the marker, others do not
        for (i, wire) in sink.0.iter().enumerate() {
            let hdr = VideoPacketHeader::parse(&wire[NET_HDR_LEN..]).unwrap();
            assert_eq!(hdr.rtp.marker, i as u32 == total - 1);
            assert_eq!(hdr.full_seq(), i as u32);
        }
    }

    #[test]
    fn seq_continues_across_frames() {
        let cfg = config(64, 8, Packing::Bpm);
        let mut session = small_session(cfg, 2);
        let total = session.geometry().pkts_per_frame;
        let mut sink = VecSink(Vec::new());
        while session.stat_frames_sent.get() < 2 {
            session.poll(&mut sink).unwrap();
        }
        let hdr =
            VideoPacketHeader::parse(&sink.0[total as usize][NET_HDR_LEN..]).unwrap();
        assert_eq!(hdr.full_seq(), total);
        // timestamp advanced between frames
        let first = VideoPacketHeader::parse(&sink.0[0][NET_HDR_LEN..]).unwrap();
        assert_ne!(first.rtp.timestamp, hdr.rtp.timestamp);
    }

    #[test]
    fn redundant_ports_mirror_packets() {
        let mut cfg = config(64, 8, Packing::Bpm);
        cfg.dests.push(SessionDest {
            ip: Ipv4Addr::new(239, 0, 0, 2),
            udp_port: 20002,
        });
        let mut session = small_session(cfg, 1);
        let mut sink = VecSink(Vec::new());
        while session.stat_frames_sent.get() == 0 {
            session.poll(&mut sink).unwrap();
        }
        assert_eq!(
            sink.0.len() as u32,
            session.geometry().pkts_per_frame * 2
        );
        // adjacent pair carries identical RTP payload toward different ports
        let a = crate::hdr::PacketHeaders::parse(&sink.0[0]).unwrap();
        let b = crate::hdr::PacketHeaders::parse(&sink.0[1]).unwrap();
        assert_ne!(a.dst_port, b.dst_port);
        assert_eq!(sink.0[0][NET_HDR_LEN..], sink.0[1][NET_HDR_LEN..]);
    }

    #[test]
    fn interlaced_alternates_field_bit() {
        let mut cfg = config(64, 8, Packing::Bpm);
        cfg.interlaced = true;
        let mut session = small_session(cfg, 2);
        let total = session.geometry().pkts_per_frame;
        let mut sink = VecSink(Vec::new());
        while session.stat_frames_sent.get() < 2 {
            session.poll(&mut sink).unwrap();
        }
        let f0 = VideoPacketHeader::parse(&sink.0[0][NET_HDR_LEN..]).unwrap();
        let f1 =
            VideoPacketHeader::parse(&sink.0[total as usize][NET_HDR_LEN..]).unwrap();
        assert!(!f0.srd.field);
        assert!(f1.srd.field);
    }

    #[test]
    fn ext_frame_rides_as_ext_segment() {
        let mut cfg = config(64, 8, Packing::Bpm);
        cfg.flags |= SessionFlags::EXT_FRAME;
        let frame_size = PacketGeometry::new(&cfg).unwrap().frame_size as usize;
        let ext = Arc::new(vec![0xC3u8; frame_size]);

        struct ExtProducer {
            ext: Option<Arc<Vec<u8>>>,
        }
        impl FrameProducer for ExtProducer {
            fn next_frame(&mut self, _frame: &mut [u8]) -> Option<TxFrameMeta> {
                self.ext.take().map(|ext| TxFrameMeta {
                    ext: Some(ext),
                    ..Default::default()
                })
            }
        }

        let pool = MbufPool::new("ext", 256, 2048).unwrap();
        let mut session = VideoTxSession::new(
            cfg,
            pool,
            Box::new(ExtProducer { ext: Some(ext) }),
            MacAddr([2, 0, 0, 0, 0, 1]),
            Ipv4Addr::new(192, 168, 1, 10),
            &StaticNeighbors::new(),
            Arc::new(SystemClock),
            PacingMode::HwRl,
        )
        .unwrap();
        let mut sink = VecSink(Vec::new());
        while session.stat_frames_sent.get() == 0 {
            session.poll(&mut sink).unwrap();
        }
        // every payload byte came from the external buffer
        for wire in &sink.0 {
            let hdr = VideoPacketHeader::parse(&wire[NET_HDR_LEN..]).unwrap();
            let payload = &wire[NET_HDR_LEN + hdr.wire_len()..];
            assert!(payload.iter().all(|&b| b == 0xC3));
        }
    }
}
