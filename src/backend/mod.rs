//! NIC backend abstraction.
//!
//! Four queue disciplines hide behind one TX/RX surface: kernel UDP
//! sockets, AF_XDP, RDMA unreliable datagram, and a poll-mode driver. The
//! set is closed — a tagged enum selects the method table at port open, and
//! nothing above this module branches on the backend kind again.
//!
//! Every backend speaks full Ethernet frames at this boundary. Backends
//! whose native unit is a bare datagram (kernel socket, RDMA) synthesize or
//! strip the L2-L4 headers at the copy edge so the classifier and session
//! layers see one wire image.

pub mod af_xdp;
pub mod kernel;
pub mod poll_mode;
pub mod rdma;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use crate::config::{Pmd, PortConfig};
use crate::error::{Error, Result};
use crate::flow::RxFlow;
use crate::hdr::MacAddr;
use crate::mempool::{Mbuf, MbufPool};

pub use af_xdp::ManagerIpc;
pub use poll_mode::{LoopbackDriver, PollDriver};
pub use rdma::{UdProvider, UdQueuePair};

/// RX poll burst size shared by all dispatchers.
pub const RX_BURST_SIZE: usize = 128;

bitflags::bitflags! {
    /// Features a port advertises after open.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortCaps: u32 {
        /// Multi-segment (header + external payload) transmit.
        const MULTI_SEG = 1 << 0;
        /// NIC computes the IPv4 header checksum.
        const IPV4_CKSUM = 1 << 1;
        /// Hardware RX timestamps.
        const HW_TIMESTAMP = 1 << 2;
        /// Per-queue hardware rate limiting (traffic manager or tx_maxrate).
        const HW_RATE_LIMIT = 1 << 3;
        /// Launch-time (send-on-timestamp) transmit offload.
        const LAUNCH_TIME = 1 << 4;
        /// Queues may start after the port is running.
        const RUNTIME_QUEUE_START = 1 << 5;
        /// Hardware flow steering; without it classification is software.
        const HW_FLOW = 1 << 6;
    }
}

/// Identity of an opened port.
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub ifname: String,
    pub pmd: Pmd,
    pub sip: Ipv4Addr,
    pub mac: MacAddr,
    pub caps: PortCaps,
    pub tx_queues: u16,
    pub rx_queues: u16,
}

/// Per-packet transmit metadata consumed by pacing-capable backends.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxMeta {
    /// Absolute TAI departure time; zero means "now". Only honored when
    /// the port advertises [`PortCaps::LAUNCH_TIME`].
    pub launch_time_ns: u64,
}

/// One outbound packet hand-off.
pub struct TxPacket {
    pub mbuf: Mbuf,
    pub meta: TxMeta,
}

impl From<Mbuf> for TxPacket {
    fn from(mbuf: Mbuf) -> Self {
        Self {
            mbuf,
            meta: TxMeta::default(),
        }
    }
}

/// External collaborators a backend may require at open.
#[derive(Default, Clone)]
pub struct BackendResources {
    /// Manager daemon IPC, required by AF_XDP.
    pub manager: Option<Arc<dyn ManagerIpc>>,
    /// Verbs device access, required by RDMA/UD.
    pub ud_provider: Option<Arc<dyn UdProvider>>,
    /// Device driver, required by poll-mode.
    pub poll_driver: Option<Arc<dyn PollDriver>>,
}

/// Transmit queue of any backend.
pub enum TxQueue {
    Kernel(kernel::KernelTxQueue),
    AfXdp(af_xdp::XdpTxQueue),
    Rdma(rdma::RdmaTxQueue),
    Poll(poll_mode::PollTxQueue),
}

impl TxQueue {
    pub fn queue_id(&self) -> u16 {
        match self {
            Self::Kernel(q) => q.queue_id(),
            Self::AfXdp(q) => q.queue_id(),
            Self::Rdma(q) => q.queue_id(),
            Self::Poll(q) => q.queue_id(),
        }
    }

    /// Transmit up to `pkts.len()` packets; sent packets are drained from
    /// the front of `pkts`, and the count sent is returned.
    pub fn tx_burst(&mut self, pkts: &mut Vec<TxPacket>) -> Result<usize> {
        match self {
            Self::Kernel(q) => q.tx_burst(pkts),
            Self::AfXdp(q) => q.tx_burst(pkts),
            Self::Rdma(q) => q.tx_burst(pkts),
            Self::Poll(q) => q.tx_burst(pkts),
        }
    }

    /// Install a bytes-per-second shaper on this queue. May be a no-op for
    /// backends without hardware rate limiting.
    pub fn set_tx_rate(&mut self, bytes_per_sec: u64) -> Result<()> {
        match self {
            Self::Kernel(q) => q.set_tx_rate(bytes_per_sec),
            Self::AfXdp(q) => q.set_tx_rate(bytes_per_sec),
            Self::Rdma(q) => q.set_tx_rate(bytes_per_sec),
            Self::Poll(q) => q.set_tx_rate(bytes_per_sec),
        }
    }

    /// Push padding packets until in-flight completions drain.
    pub fn flush(&mut self, pad: impl Fn() -> Result<Mbuf>) -> Result<()> {
        match self {
            Self::Kernel(_) => Ok(()),
            Self::AfXdp(q) => q.flush(pad),
            Self::Rdma(q) => q.flush(),
            Self::Poll(q) => q.flush(pad),
        }
    }
}

/// Receive queue of any backend.
pub enum RxQueue {
    Kernel(kernel::KernelRxQueue),
    AfXdp(af_xdp::XdpRxQueue),
    Rdma(rdma::RdmaRxQueue),
    Poll(poll_mode::PollRxQueue),
}

impl RxQueue {
    pub fn queue_id(&self) -> u16 {
        match self {
            Self::Kernel(q) => q.queue_id(),
            Self::AfXdp(q) => q.queue_id(),
            Self::Rdma(q) => q.queue_id(),
            Self::Poll(q) => q.queue_id(),
        }
    }

    /// Poll up to `max` packets into `out`; returns the count received.
    pub fn rx_burst(&mut self, out: &mut Vec<Mbuf>, max: usize) -> usize {
        match self {
            Self::Kernel(q) => q.rx_burst(out, max),
            Self::AfXdp(q) => q.rx_burst(out, max),
            Self::Rdma(q) => q.rx_burst(out, max),
            Self::Poll(q) => q.rx_burst(out, max),
        }
    }
}

/// An opened port: the backend instance plus its identity.
pub enum NicBackend {
    Kernel(kernel::KernelSocketBackend),
    AfXdp(af_xdp::AfXdpBackend),
    Rdma(rdma::RdmaUdBackend),
    Poll(poll_mode::PollModeBackend),
}

impl NicBackend {
    /// Open a port with the configured discipline.
    pub fn open(cfg: &PortConfig, res: &BackendResources) -> Result<NicBackend> {
        match cfg.pmd {
            Pmd::KernelSocket => {
                kernel::KernelSocketBackend::open(cfg).map(NicBackend::Kernel)
            }
            Pmd::NativeAfXdp => {
                let manager = res
                    .manager
                    .clone()
                    .ok_or(Error::InvalidArg("af_xdp requires a manager".into()))?;
                af_xdp::AfXdpBackend::open(cfg, manager).map(NicBackend::AfXdp)
            }
            Pmd::RdmaUd => {
                let provider = res
                    .ud_provider
                    .clone()
                    .ok_or(Error::InvalidArg("rdma_ud requires a provider".into()))?;
                rdma::RdmaUdBackend::open(cfg, provider).map(NicBackend::Rdma)
            }
            Pmd::PollMode => {
                let driver = res
                    .poll_driver
                    .clone()
                    .ok_or(Error::InvalidArg("poll mode requires a driver".into()))?;
                poll_mode::PollModeBackend::open(cfg, driver).map(NicBackend::Poll)
            }
        }
    }

    pub fn info(&self) -> &PortInfo {
        match self {
            Self::Kernel(b) => b.info(),
            Self::AfXdp(b) => b.info(),
            Self::Rdma(b) => b.info(),
            Self::Poll(b) => b.info(),
        }
    }

    /// Reserve a TX queue toward `dest`.
    pub fn get_tx_queue(&self, pool: &MbufPool, dest: SocketAddrV4) -> Result<TxQueue> {
        match self {
            Self::Kernel(b) => b.get_tx_queue().map(TxQueue::Kernel),
            Self::AfXdp(b) => b.get_tx_queue(pool).map(TxQueue::AfXdp),
            Self::Rdma(b) => b.get_tx_queue(dest).map(TxQueue::Rdma),
            Self::Poll(b) => b.get_tx_queue().map(TxQueue::Poll),
        }
    }

    /// Reserve an RX queue for `flow`.
    ///
    /// Backends without hardware flow steering ignore the flow here; the
    /// shared classifier enforces it in software.
    pub fn get_rx_queue(&self, pool: &MbufPool, flow: &RxFlow) -> Result<RxQueue> {
        match self {
            Self::Kernel(b) => b.get_rx_queue(pool, flow).map(RxQueue::Kernel),
            Self::AfXdp(b) => b.get_rx_queue(pool, flow).map(RxQueue::AfXdp),
            Self::Rdma(b) => b.get_rx_queue(pool, flow).map(RxQueue::Rdma),
            Self::Poll(b) => b.get_rx_queue(pool).map(RxQueue::Poll),
        }
    }

    /// Install a hardware classifier when the port supports one.
    ///
    /// `Ok(None)` means software classification must handle this flow.
    pub fn install_flow(&self, queue: u16, flow: &RxFlow) -> Result<Option<u64>> {
        match self {
            // kernel and af_xdp steer at socket/BPF level inside the queue
            Self::Kernel(_) | Self::AfXdp(_) => Ok(None),
            // rdma filters by immediate hash inside the queue
            Self::Rdma(_) => Ok(None),
            Self::Poll(b) => b.install_flow(queue, flow),
        }
    }

    pub fn uninstall_flow(&self, id: u64) -> Result<()> {
        match self {
            Self::Kernel(_) | Self::AfXdp(_) | Self::Rdma(_) => Ok(()),
            Self::Poll(b) => b.uninstall_flow(id),
        }
    }
}
