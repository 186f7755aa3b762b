//! RDMA unreliable-datagram backend.
//!
//! One queue pair per session-side queue. The verbs device is an external
//! collaborator behind [`UdProvider`] — the backend owns everything above
//! it: address setup off the datapath, bounded work-request accounting with
//! inline completion polling, and the immediate-data flow hash that lets
//! the receive side discard stray datagrams cheaply.
//!
//! Wire framing is plain UD send-with-immediate. The 32-bit immediate is
//! the softrss of (dst IP, dst UDP port); an RX queue computes the same
//! hash once at setup and drops any completion whose immediate differs.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use parking_lot::Mutex;

use crate::config::PortConfig;
use crate::error::{Error, Result};
use crate::flow::RxFlow;
use crate::hdr::{self, HeaderTemplate, MacAddr, NET_HDR_LEN, PacketHeaders};
use crate::mempool::{Mbuf, MbufPool};
use crate::stats::Counter;

use super::{PortCaps, PortInfo, TxPacket};

/// Packets allowed in flight per queue pair before completions must drain.
pub const RDMA_MAX_WR: usize = 128;

/// One verbs queue pair, already resolved/connected or joined.
pub trait UdQueuePair: Send {
    /// Post one send work request carrying `payload` and the immediate.
    fn post_send(&mut self, payload: &[u8], imm: u32) -> Result<()>;
    /// Reap send completions; returns how many finished.
    fn poll_send_completions(&mut self) -> usize;
    /// Reap receive completions into `(payload, immediate)` pairs.
    fn poll_recv(&mut self, out: &mut Vec<(Vec<u8>, u32)>, max: usize) -> usize;
}

/// Verbs device access consumed by this backend.
pub trait UdProvider: Send + Sync {
    /// Create a TX queue pair toward `dest`. For multicast destinations the
    /// provider joins the group send-only; for unicast it resolves address
    /// and route, then connects.
    fn create_tx_qp(&self, dest: SocketAddrV4, multicast: bool)
    -> Result<Box<dyn UdQueuePair>>;
    /// Create an RX queue pair for `local`, joining the group when the
    /// address is multicast.
    fn create_rx_qp(&self, local: SocketAddrV4, multicast: bool)
    -> Result<Box<dyn UdQueuePair>>;
}

/// RDMA/UD port.
pub struct RdmaUdBackend {
    info: PortInfo,
    provider: Arc<dyn UdProvider>,
    next_qid: AtomicU16,
}

impl RdmaUdBackend {
    pub fn open(cfg: &PortConfig, provider: Arc<dyn UdProvider>) -> Result<RdmaUdBackend> {
        let info = PortInfo {
            ifname: cfg.ifname.clone(),
            pmd: cfg.pmd,
            sip: cfg.sip_addr,
            mac: MacAddr([0x02, 0, 0, 0, 0, 3]),
            caps: PortCaps::empty(),
            tx_queues: cfg.tx_queues_cnt,
            rx_queues: cfg.rx_queues_cnt,
        };
        tracing::info!(ifname = %cfg.ifname, "rdma_ud port opened");
        Ok(RdmaUdBackend {
            info,
            provider,
            next_qid: AtomicU16::new(0),
        })
    }

    pub fn info(&self) -> &PortInfo {
        &self.info
    }

    fn next_qid(&self, limit: u16) -> Result<u16> {
        let qid = self.next_qid.fetch_add(1, Ordering::SeqCst);
        if qid >= limit {
            return Err(Error::NoBuffer("rdma queues exhausted"));
        }
        Ok(qid)
    }

    /// Reserve a TX queue. Address resolution runs on a background thread;
    /// bursts before it completes send nothing.
    pub fn get_tx_queue(&self, dest: SocketAddrV4) -> Result<RdmaTxQueue> {
        let qid = self.next_qid(self.info.tx_queues)?;
        let imm = hdr::softrss_flow(*dest.ip(), self.info.sip, dest.port());
        let slot: Arc<Mutex<Option<Result<Box<dyn UdQueuePair>>>>> =
            Arc::new(Mutex::new(None));
        let provider = self.provider.clone();
        let publish = slot.clone();
        std::thread::spawn(move || {
            let multicast = dest.ip().is_multicast();
            let qp = provider.create_tx_qp(dest, multicast);
            if let Err(e) = &qp {
                tracing::warn!(%dest, error = %e, "rdma tx qp setup failed");
            }
            *publish.lock() = Some(qp);
        });
        Ok(RdmaTxQueue {
            qid,
            imm,
            pending_qp: slot,
            qp: None,
            in_flight: 0,
            stat_tx_pkts: Counter::new(),
            stat_tx_stall: Counter::new(),
        })
    }

    pub fn get_rx_queue(&self, pool: &MbufPool, flow: &RxFlow) -> Result<RdmaRxQueue> {
        let qid = self.next_qid(self.info.rx_queues)?;
        let local = SocketAddrV4::new(flow.dst_ip, flow.dst_port);
        let qp = self
            .provider
            .create_rx_qp(local, flow.dst_ip.is_multicast())?;
        let expect_imm = hdr::softrss_flow(flow.dst_ip, self.info.sip, flow.dst_port);
        Ok(RdmaRxQueue {
            qid,
            qp,
            expect_imm,
            mac: self.info.mac,
            dst_ip: flow.dst_ip,
            dst_port: flow.dst_port,
            pool: pool.clone(),
            stat_rx_pkts: Counter::new(),
            stat_rx_stray: Counter::new(),
        })
    }
}

/// RDMA/UD TX queue.
pub struct RdmaTxQueue {
    qid: u16,
    imm: u32,
    pending_qp: Arc<Mutex<Option<Result<Box<dyn UdQueuePair>>>>>,
    qp: Option<Box<dyn UdQueuePair>>,
    in_flight: usize,
    pub stat_tx_pkts: Counter,
    pub stat_tx_stall: Counter,
}

impl RdmaTxQueue {
    pub fn queue_id(&self) -> u16 {
        self.qid
    }

    fn qp(&mut self) -> Result<Option<&mut Box<dyn UdQueuePair>>> {
        if self.qp.is_none()
            && let Some(result) = self.pending_qp.lock().take()
        {
            self.qp = Some(result?);
        }
        Ok(self.qp.as_mut())
    }

    pub fn tx_burst(&mut self, pkts: &mut Vec<TxPacket>) -> Result<usize> {
        let imm = self.imm;
        let mut in_flight = self.in_flight;
        let mut sent = 0;
        let mut stalled = false;
        {
            let Some(qp) = self.qp()? else {
                return Ok(0); // still connecting
            };
            in_flight -= qp.poll_send_completions().min(in_flight);
            while !pkts.is_empty() {
                if in_flight >= RDMA_MAX_WR {
                    in_flight -= qp.poll_send_completions().min(in_flight);
                    if in_flight >= RDMA_MAX_WR {
                        stalled = true;
                        break;
                    }
                }
                let pkt = pkts.remove(0);
                let wire = pkt.mbuf.to_wire();
                // UD frames the datagram itself; ship the UDP payload only
                qp.post_send(&wire[NET_HDR_LEN..], imm)?;
                in_flight += 1;
                sent += 1;
            }
        }
        self.in_flight = in_flight;
        self.stat_tx_pkts.add(sent as u64);
        if stalled {
            self.stat_tx_stall.inc();
        }
        Ok(sent)
    }

    pub fn set_tx_rate(&mut self, _bytes_per_sec: u64) -> Result<()> {
        // UD has no shaper; pacing stays in software for this backend
        Ok(())
    }

    /// Poll completions until nothing is in flight.
    pub fn flush(&mut self) -> Result<()> {
        let mut in_flight = self.in_flight;
        if let Some(qp) = self.qp()? {
            while in_flight > 0 {
                let done = qp.poll_send_completions().min(in_flight);
                in_flight -= done;
                if done == 0 {
                    std::hint::spin_loop();
                }
            }
        }
        self.in_flight = in_flight;
        Ok(())
    }
}

/// RDMA/UD RX queue.
pub struct RdmaRxQueue {
    qid: u16,
    qp: Box<dyn UdQueuePair>,
    expect_imm: u32,
    mac: MacAddr,
    dst_ip: std::net::Ipv4Addr,
    dst_port: u16,
    pool: MbufPool,
    pub stat_rx_pkts: Counter,
    pub stat_rx_stray: Counter,
}

impl RdmaRxQueue {
    pub fn queue_id(&self) -> u16 {
        self.qid
    }

    pub fn rx_burst(&mut self, out: &mut Vec<Mbuf>, max: usize) -> usize {
        let mut recv = Vec::new();
        self.qp.poll_recv(&mut recv, max);
        let mut n = 0;
        for (payload, imm) in recv {
            if imm != self.expect_imm {
                self.stat_rx_stray.inc();
                continue;
            }
            let Ok(mut mbuf) = self.pool.alloc() else {
                break;
            };
            let mut tmpl = HeaderTemplate::new(
                self.mac,
                self.mac,
                self.dst_ip,
                self.dst_ip,
                self.dst_port,
                self.dst_port,
            );
            let Ok(dst) = mbuf.append(NET_HDR_LEN + payload.len()) else {
                break;
            };
            tmpl.write(dst, payload.len());
            dst[NET_HDR_LEN..].copy_from_slice(&payload);
            debug_assert!(PacketHeaders::parse(mbuf.data()).is_ok());
            out.push(mbuf);
            self.stat_rx_pkts.inc();
            n += 1;
        }
        n
    }
}
