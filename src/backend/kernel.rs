//! Kernel UDP socket backend.
//!
//! The slowest but most portable discipline: one `SOCK_DGRAM` per TX queue,
//! one bound socket per RX queue. The kernel owns L2-L4, so this backend
//! strips headers on the way out and synthesizes them on the way in — the
//! rest of the core always sees full Ethernet frames.
//!
//! A TX queue whose configured rate exceeds one thread's sendto budget
//! spawns additional sender threads fed from a shared queue, preserving the
//! caller's non-blocking burst contract.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::PortConfig;
use crate::error::{Error, Result};
use crate::flow::RxFlow;
use crate::hdr::{HeaderTemplate, MacAddr, NET_HDR_LEN, PacketHeaders};
use crate::mempool::{Mbuf, MbufPool};
use crate::stats::Counter;

use super::{PortCaps, PortInfo, TxPacket};

/// One sender thread sustains roughly this many payload bytes per second;
/// beyond it the queue fans out to more threads.
const TX_THREAD_BYTES_PER_SEC: u64 = 2_000_000_000 / 8;

/// Max sender threads per queue.
const TX_MAX_THREADS: usize = 4;

/// Kernel-socket port.
pub struct KernelSocketBackend {
    info: PortInfo,
    next_tx_qid: AtomicU16,
    next_rx_qid: AtomicU16,
}

impl KernelSocketBackend {
    pub fn open(cfg: &PortConfig) -> Result<KernelSocketBackend> {
        let info = PortInfo {
            ifname: cfg.ifname.clone(),
            pmd: cfg.pmd,
            sip: cfg.sip_addr,
            // the kernel fills real L2; a locally administered placeholder
            // keeps header synthesis uniform
            mac: MacAddr([0x02, 0, 0, 0, 0, 1]),
            caps: PortCaps::IPV4_CKSUM,
            tx_queues: cfg.tx_queues_cnt,
            rx_queues: cfg.rx_queues_cnt,
        };
        tracing::info!(ifname = %cfg.ifname, "kernel socket port opened");
        Ok(KernelSocketBackend {
            info,
            next_tx_qid: AtomicU16::new(0),
            next_rx_qid: AtomicU16::new(0),
        })
    }

    pub fn info(&self) -> &PortInfo {
        &self.info
    }

    pub fn get_tx_queue(&self) -> Result<KernelTxQueue> {
        let qid = self.next_tx_qid.fetch_add(1, Ordering::SeqCst);
        if qid >= self.info.tx_queues {
            return Err(Error::NoBuffer("kernel tx queues exhausted"));
        }
        KernelTxQueue::new(qid)
    }

    pub fn get_rx_queue(&self, pool: &MbufPool, flow: &RxFlow) -> Result<KernelRxQueue> {
        let qid = self.next_rx_qid.fetch_add(1, Ordering::SeqCst);
        if qid >= self.info.rx_queues {
            return Err(Error::NoBuffer("kernel rx queues exhausted"));
        }
        KernelRxQueue::new(qid, &self.info, pool.clone(), flow)
    }
}

fn new_udp_socket() -> Result<Socket> {
    Ok(Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?)
}

struct TxShared {
    queue: Mutex<VecDeque<(SocketAddrV4, Vec<u8>)>>,
    wake: Condvar,
    stop: AtomicBool,
}

/// Kernel-socket TX queue.
pub struct KernelTxQueue {
    qid: u16,
    socket: Socket,
    shared: Option<Arc<TxShared>>,
    workers: Vec<JoinHandle<()>>,
    pub stat_tx_pkts: Counter,
    pub stat_tx_bytes: Counter,
}

impl KernelTxQueue {
    fn new(qid: u16) -> Result<KernelTxQueue> {
        let socket = new_udp_socket()?;
        Ok(KernelTxQueue {
            qid,
            socket,
            shared: None,
            workers: Vec::new(),
            stat_tx_pkts: Counter::new(),
            stat_tx_bytes: Counter::new(),
        })
    }

    pub fn queue_id(&self) -> u16 {
        self.qid
    }

    /// Above one thread's budget, fan out to `ceil(rate / budget)` sender
    /// threads fed from a shared queue.
    pub fn set_tx_rate(&mut self, bytes_per_sec: u64) -> Result<()> {
        let threads =
            (bytes_per_sec.div_ceil(TX_THREAD_BYTES_PER_SEC) as usize).clamp(1, TX_MAX_THREADS);
        if threads <= 1 || self.shared.is_some() {
            return Ok(());
        }
        let shared = Arc::new(TxShared {
            queue: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            stop: AtomicBool::new(false),
        });
        for t in 0..threads {
            let shared = shared.clone();
            let sock = new_udp_socket()?;
            self.workers.push(std::thread::spawn(move || {
                tracing::debug!(worker = t, "kernel tx worker started");
                loop {
                    let item = {
                        let mut q = shared.queue.lock();
                        loop {
                            if shared.stop.load(Ordering::Acquire) {
                                return;
                            }
                            if let Some(item) = q.pop_front() {
                                break item;
                            }
                            shared.wake.wait(&mut q);
                        }
                    };
                    let (addr, payload) = item;
                    let _ = sock.send_to(&payload, &SocketAddr::V4(addr).into());
                }
            }));
        }
        self.shared = Some(shared);
        tracing::info!(qid = self.qid, threads, "kernel tx queue threaded");
        Ok(())
    }

    pub fn tx_burst(&mut self, pkts: &mut Vec<TxPacket>) -> Result<usize> {
        let mut sent = 0;
        while let Some(pkt) = pkts.first() {
            let wire = pkt.mbuf.to_wire();
            let hdrs = PacketHeaders::parse(&wire)?;
            let addr = SocketAddrV4::new(hdrs.dst_ip, hdrs.dst_port);
            let payload = &wire[NET_HDR_LEN..];
            match &self.shared {
                Some(shared) => {
                    shared
                        .queue
                        .lock()
                        .push_back((addr, payload.to_vec()));
                    shared.wake.notify_one();
                }
                None => {
                    if let Err(e) = self.socket.send_to(payload, &SocketAddr::V4(addr).into()) {
                        if e.kind() == std::io::ErrorKind::WouldBlock {
                            break;
                        }
                        return Err(e.into());
                    }
                }
            }
            self.stat_tx_pkts.inc();
            self.stat_tx_bytes.add(payload.len() as u64);
            pkts.remove(0);
            sent += 1;
        }
        Ok(sent)
    }
}

impl Drop for KernelTxQueue {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            shared.stop.store(true, Ordering::Release);
            shared.wake.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Kernel-socket RX queue.
///
/// Binds to the flow's destination UDP port, optionally to the device, and
/// joins the multicast group for group destinations. Received datagrams are
/// copied into mbufs behind synthesized Ethernet/IP/UDP headers.
pub struct KernelRxQueue {
    qid: u16,
    socket: Socket,
    pool: MbufPool,
    hdr_mac: MacAddr,
    dst_ip: Ipv4Addr,
    dst_port: u16,
    pub stat_rx_pkts: Counter,
    pub stat_rx_nobuf: Counter,
}

impl KernelRxQueue {
    fn new(
        qid: u16,
        info: &PortInfo,
        pool: MbufPool,
        flow: &RxFlow,
    ) -> Result<KernelRxQueue> {
        let socket = new_udp_socket()?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        if !info.ifname.is_empty() {
            socket.bind_device(Some(info.ifname.as_bytes()))?;
        }
        let bind_ip = if flow.dst_ip.is_multicast() {
            Ipv4Addr::UNSPECIFIED
        } else {
            flow.dst_ip
        };
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(bind_ip, flow.dst_port)).into())?;
        if flow.dst_ip.is_multicast() {
            socket.join_multicast_v4(&flow.dst_ip, &info.sip)?;
            tracing::info!(group = %flow.dst_ip, "joined multicast group");
        }
        tracing::debug!(qid, port = flow.dst_port, "kernel rx queue bound");
        Ok(KernelRxQueue {
            qid,
            socket,
            pool,
            hdr_mac: info.mac,
            dst_ip: flow.dst_ip,
            dst_port: flow.dst_port,
            stat_rx_pkts: Counter::new(),
            stat_rx_nobuf: Counter::new(),
        })
    }

    pub fn queue_id(&self) -> u16 {
        self.qid
    }

    pub fn rx_burst(&mut self, out: &mut Vec<Mbuf>, max: usize) -> usize {
        let mut n = 0;
        let mut scratch = [std::mem::MaybeUninit::<u8>::uninit(); 9216];
        while n < max {
            let (len, peer) = match self.socket.recv_from(&mut scratch) {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            };
            let Ok(mut mbuf) = self.pool.alloc() else {
                self.stat_rx_nobuf.inc();
                break;
            };
            let peer_v4 = match peer.as_socket_ipv4() {
                Some(a) => a,
                None => continue,
            };
            // synthesize the wire image the upper layers expect
            let mut tmpl = HeaderTemplate::new(
                self.hdr_mac,
                self.hdr_mac,
                *peer_v4.ip(),
                self.dst_ip,
                peer_v4.port(),
                self.dst_port,
            );
            let Ok(dst) = mbuf.append(NET_HDR_LEN + len) else {
                self.stat_rx_nobuf.inc();
                break;
            };
            tmpl.write(dst, len);
            let payload = unsafe {
                std::slice::from_raw_parts(scratch.as_ptr() as *const u8, len)
            };
            dst[NET_HDR_LEN..].copy_from_slice(payload);
            out.push(mbuf);
            self.stat_rx_pkts.inc();
            n += 1;
        }
        n
    }
}
