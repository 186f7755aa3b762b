//! Port, engine, and session configuration types.
//!
//! Everything here is validated once at creation time; the datapath never
//! re-checks these values. Invalid combinations are rejected with
//! [`Error::InvalidArg`](crate::error::Error::InvalidArg) and the session or
//! port is not created.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Upper raster bound accepted at session creation.
pub const MAX_DIMENSION: u32 = 8192;

/// Frame buffer ring depth bounds.
pub const MAX_FRAMEBUFF_CNT: u16 = 256;

/// Media clock rate shared by all ST 2110 video and ancillary streams.
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Video frame rate (media clock cadence).
///
/// Fractional rates follow the broadcast convention of `rate * 1000/1001`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fps {
    P23_98,
    P24,
    P25,
    P29_97,
    P30,
    P50,
    P59_94,
    P60,
    P100,
    P119_88,
    P120,
}

impl Fps {
    /// Frame rate in frames per second.
    pub fn rate(&self) -> f64 {
        match self {
            Self::P23_98 => 24000.0 / 1001.0,
            Self::P24 => 24.0,
            Self::P25 => 25.0,
            Self::P29_97 => 30000.0 / 1001.0,
            Self::P30 => 30.0,
            Self::P50 => 50.0,
            Self::P59_94 => 60000.0 / 1001.0,
            Self::P60 => 60.0,
            Self::P100 => 100.0,
            Self::P119_88 => 120000.0 / 1001.0,
            Self::P120 => 120.0,
        }
    }

    /// Nominal frame duration in nanoseconds.
    pub fn frame_time_ns(&self) -> u64 {
        (1_000_000_000.0 / self.rate()) as u64
    }

    /// 90 kHz media-clock units per frame.
    pub fn media_clk_per_frame(&self) -> u32 {
        (VIDEO_CLOCK_RATE as f64 / self.rate()).round() as u32
    }

    /// Map a measured 90 kHz timestamp delta back to a rate, within 5%.
    ///
    /// Used by RX auto-detect: the delta between consecutive frame
    /// timestamps identifies the sender's cadence.
    pub fn from_media_clk_delta(delta: u32) -> Option<Fps> {
        const ALL: [Fps; 11] = [
            Fps::P23_98,
            Fps::P24,
            Fps::P25,
            Fps::P29_97,
            Fps::P30,
            Fps::P50,
            Fps::P59_94,
            Fps::P60,
            Fps::P100,
            Fps::P119_88,
            Fps::P120,
        ];
        ALL.iter()
            .find(|fps| {
                let expect = fps.media_clk_per_frame() as f64;
                (delta as f64 - expect).abs() / expect < 0.05
            })
            .copied()
    }
}

/// Uncompressed video pixel format (ST 2110-20 §6).
///
/// Each format defines a pixel group: `pg_size` bytes covering
/// `pg_coverage` pixels. Line and packet byte math derives from the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoFormat {
    /// 4:2:2 10-bit, 5 bytes per 2 pixels.
    Yuv422_10Bit,
    /// 4:2:2 8-bit, 4 bytes per 2 pixels.
    Yuv422_8Bit,
    /// 4:2:2 12-bit, 6 bytes per 2 pixels.
    Yuv422_12Bit,
    /// 4:2:0 8-bit, 6 bytes per 4 pixels.
    Yuv420_8Bit,
    /// 4:2:0 10-bit, 15 bytes per 8 pixels.
    Yuv420_10Bit,
    /// 4:4:4 10-bit, 15 bytes per 4 pixels.
    Yuv444_10Bit,
    /// RGB 8-bit, 3 bytes per pixel.
    Rgb8Bit,
    /// RGB 10-bit, 15 bytes per 4 pixels.
    Rgb10Bit,
}

impl VideoFormat {
    /// Pixel group size in bytes.
    pub fn pg_size(&self) -> u32 {
        match self {
            Self::Yuv422_10Bit => 5,
            Self::Yuv422_8Bit => 4,
            Self::Yuv422_12Bit => 6,
            Self::Yuv420_8Bit => 6,
            Self::Yuv420_10Bit => 15,
            Self::Yuv444_10Bit => 15,
            Self::Rgb8Bit => 3,
            Self::Rgb10Bit => 15,
        }
    }

    /// Pixels covered by one pixel group.
    pub fn pg_coverage(&self) -> u32 {
        match self {
            Self::Yuv422_10Bit => 2,
            Self::Yuv422_8Bit => 2,
            Self::Yuv422_12Bit => 2,
            Self::Yuv420_8Bit => 4,
            Self::Yuv420_10Bit => 8,
            Self::Yuv444_10Bit => 4,
            Self::Rgb8Bit => 1,
            Self::Rgb10Bit => 4,
        }
    }

    /// Bytes per raster line for the given width.
    ///
    /// Fails if the width is not a whole number of pixel groups.
    pub fn bytes_per_line(&self, width: u32) -> Result<u32> {
        if width % self.pg_coverage() != 0 {
            return Err(Error::InvalidArg(format!(
                "width {width} not a multiple of pixel group coverage {}",
                self.pg_coverage()
            )));
        }
        Ok(width / self.pg_coverage() * self.pg_size())
    }

    /// Total frame size in bytes (one field for interlaced sessions).
    pub fn frame_size(&self, width: u32, height: u32, interlaced: bool) -> Result<usize> {
        let lines = if interlaced { height / 2 } else { height };
        Ok(self.bytes_per_line(width)? as usize * lines as usize)
    }
}

/// RFC 4175 packetization strategy (ST 2110-20 §6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packing {
    /// Block packing: fixed payload, SRDs may span lines.
    Bpm,
    /// General packing: one or two SRDs per packet.
    Gpm,
    /// General packing, single line: an SRD never crosses a line boundary.
    GpmSl,
}

/// NIC datapath discipline selected per port at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pmd {
    /// AF_INET SOCK_DGRAM sockets through the kernel stack.
    KernelSocket,
    /// AF_XDP umem rings, zero-copy when permitted.
    NativeAfXdp,
    /// RDMA unreliable-datagram verbs.
    RdmaUd,
    /// Poll-mode driver with hardware flow steering.
    PollMode,
}

bitflags::bitflags! {
    /// Engine-wide behavior switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EngineFlags: u32 {
        /// Multiplex RX sessions onto a shared set of hardware queues.
        const SHARED_RX_QUEUE = 1 << 0;
        /// Multiplex TX sessions onto a shared set of hardware queues.
        const SHARED_TX_QUEUE = 1 << 1;
        /// Skip the tx burst free-count check.
        const TX_NO_BURST_CHK = 1 << 2;
        /// Classify RX flows on destination UDP port only.
        const RX_UDP_PORT_ONLY = 1 << 3;
        /// Put the NIC in promiscuous mode at port init.
        const NIC_RX_PROMISCUOUS = 1 << 4;
        /// All RX queues of a port share one mempool.
        const RX_MONO_POOL = 1 << 5;
        /// All TX queues of a port share one mempool.
        const TX_MONO_POOL = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Per-session behavior switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionFlags: u32 {
        /// Producer supplies frames by address (zero-copy).
        const EXT_FRAME = 1 << 0;
        /// Producer supplies an absolute TAI departure time per frame.
        const USER_PACING = 1 << 1;
        /// Producer supplies the raw RTP timestamp per frame.
        const USER_TIMESTAMP = 1 << 2;
        /// Enable the RTCP NACK/retransmit subsystem for this session.
        const ENABLE_RTCP = 1 << 3;
        /// Skip control-plane helpers; the session only moves packets.
        const DATA_PATH_ONLY = 1 << 4;
        /// Deliver incomplete frames to the consumer instead of reclaiming.
        const RECEIVE_INCOMPLETE = 1 << 5;
        /// Enable auto-detect of raster parameters on RX.
        const AUTO_DETECT = 1 << 6;
        /// Blocking `get_frame` on the consumer side.
        const BLOCK_GET = 1 << 7;
    }
}

/// One logical NIC identity.
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Interface name (used for bind-to-device and XDP attach).
    pub ifname: String,
    pub pmd: Pmd,
    pub sip_addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub tx_queues_cnt: u16,
    pub rx_queues_cnt: u16,
    /// TX descriptor count per queue.
    pub nb_tx_desc: u16,
    /// RX descriptor count per queue.
    pub nb_rx_desc: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            ifname: String::new(),
            pmd: Pmd::KernelSocket,
            sip_addr: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::UNSPECIFIED,
            tx_queues_cnt: 8,
            rx_queues_cnt: 8,
            nb_tx_desc: 512,
            nb_rx_desc: 512,
        }
    }
}

/// Engine-level configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ports: Vec<PortConfig>,
    pub flags: EngineFlags,
    /// Aggregate session bandwidth one scheduler may drive, in Mbps.
    pub data_quota_mbs_per_sch: u32,
    /// Worker threads for shared-RSS classification.
    pub srss_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            flags: EngineFlags::empty(),
            data_quota_mbs_per_sch: 10_000,
            srss_threads: 1,
        }
    }
}

/// Destination of one session leg; up to two for redundant streams.
#[derive(Debug, Clone, Copy)]
pub struct SessionDest {
    pub ip: Ipv4Addr,
    pub udp_port: u16,
}

/// ST 2110-20 video session creation parameters (TX and RX share these).
#[derive(Debug, Clone)]
pub struct VideoSessionConfig {
    /// One destination, or two for ST 2022-7 style redundancy.
    pub dests: Vec<SessionDest>,
    /// RTP payload type, 1..=126.
    pub payload_type: u8,
    pub width: u32,
    pub height: u32,
    pub fps: Fps,
    pub fmt: VideoFormat,
    pub packing: Packing,
    pub interlaced: bool,
    /// Frame ring depth, 1..=256.
    pub framebuff_cnt: u16,
    /// Producer-provided line stride; defaults to `bytes_per_line`.
    pub linesize: Option<u32>,
    /// Emit a slice callback every this many lines (0 disables).
    pub slice_lines: u32,
    pub flags: SessionFlags,
    /// Neighbor resolution timeout; zero follows kernel sendto semantics.
    pub arp_timeout_ms: u64,
    /// Base for randomized UDP source port selection.
    pub udp_src_port_base: u16,
}

impl VideoSessionConfig {
    /// Validate the creation-time invariants from the session contract.
    pub fn validate(&self) -> Result<()> {
        if self.dests.is_empty() || self.dests.len() > 2 {
            return Err(Error::InvalidArg(format!(
                "num_port {} out of range 1..=2",
                self.dests.len()
            )));
        }
        for d in &self.dests {
            if d.udp_port == 0 {
                return Err(Error::InvalidArg("udp_port must be nonzero".into()));
            }
        }
        if self.payload_type == 0 || self.payload_type > 126 {
            return Err(Error::InvalidArg(format!(
                "payload_type {} out of range 1..=126",
                self.payload_type
            )));
        }
        if self.width == 0 || self.width > MAX_DIMENSION {
            return Err(Error::InvalidArg(format!("width {}", self.width)));
        }
        if self.height == 0 || self.height > MAX_DIMENSION {
            return Err(Error::InvalidArg(format!("height {}", self.height)));
        }
        if self.interlaced && self.height % 2 != 0 {
            return Err(Error::InvalidArg("interlaced height must be even".into()));
        }
        if self.framebuff_cnt == 0 || self.framebuff_cnt > MAX_FRAMEBUFF_CNT {
            return Err(Error::InvalidArg(format!(
                "framebuff_cnt {} out of range 1..=256",
                self.framebuff_cnt
            )));
        }
        let bpl = self.fmt.bytes_per_line(self.width)?;
        if let Some(linesize) = self.linesize
            && linesize < bpl
        {
            return Err(Error::InvalidArg(format!(
                "linesize {linesize} smaller than bytes_per_line {bpl}"
            )));
        }
        Ok(())
    }

    /// Raster bytes of one frame (or field, when interlaced).
    pub fn frame_size(&self) -> Result<usize> {
        self.fmt.frame_size(self.width, self.height, self.interlaced)
    }
}
