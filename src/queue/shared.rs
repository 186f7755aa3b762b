//! Shared TX queue (TSQ) and shared RX queue (RSQ).
//!
//! Both sides map a session's flow hash onto a fixed queue set:
//! `(softrss % RETA_GROUP_SIZE) % nb_queues`. Queue zero doubles as the
//! system/CNI queue; the catch-all entry registered there receives every
//! packet no session flow matches.
//!
//! RX dispatch is a linear scan of the per-queue session list with
//! adjacent-match batching: consecutive packets for the same session are
//! enqueued as one bulk to amortize the ring operation. A full session
//! ring drops the whole bulk and counts it — pacing is the producer's
//! contract, the classifier never backpressures.
//!
//! Sessions hold entries as index handles into a per-queue arena; the
//! arena's free list recycles slots after release.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::backend::{RX_BURST_SIZE, RxQueue, TxPacket, TxQueue};
use crate::error::{Error, Result};
use crate::flow::{FlowFlags, RxFlow};
use crate::hdr::{self, PacketHeaders};
use crate::mempool::{Mbuf, MbufPool};
use crate::ring::{self, SpscConsumer, SpscProducer};
use crate::stats::Counter;

/// RSS redirection table group size; flow hashes spread across it.
pub const RETA_GROUP_SIZE: u32 = 64;

/// Session ring depth between classifier and session.
const ENTRY_RING_DEPTH: usize = 512;

/// Map a flow to its shared queue index.
pub fn flow_queue(flow: &RxFlow, src_ip: std::net::Ipv4Addr, nb_queues: u16) -> u16 {
    if flow.flags.contains(FlowFlags::SYS_QUEUE) {
        return 0;
    }
    let hash = hdr::softrss_flow(flow.dst_ip, src_ip, flow.dst_port);
    ((hash % RETA_GROUP_SIZE) % nb_queues as u32) as u16
}

// --- RSQ ---

struct RsqEntrySlot {
    id: u32,
    flow: RxFlow,
    prod: SpscProducer<Mbuf>,
    stat_enqueue: Counter,
    stat_enqueue_fail: Counter,
}

struct RsqQueueInner {
    rxq: RxQueue,
    entries: Vec<RsqEntrySlot>,
    cni: Option<u32>,
}

struct RsqQueue {
    queue_id: u16,
    inner: Mutex<RsqQueueInner>,
    next_entry_id: AtomicU32,
    stat_pkts_recv: Counter,
    stat_pkts_cni: Counter,
}

impl RsqQueue {
    /// Poll the hardware queue once and dispatch to session rings.
    fn rx_dispatch(&self, inner: &mut RsqQueueInner) -> usize {
        let mut pkts = Vec::with_capacity(RX_BURST_SIZE);
        let rx = inner.rxq.rx_burst(&mut pkts, RX_BURST_SIZE);
        if rx == 0 {
            return 0;
        }
        self.stat_pkts_recv.add(rx as u64);

        let mut batch: Vec<Mbuf> = Vec::new();
        let mut batch_entry: Option<usize> = None;
        for pkt in pkts {
            let Ok(hdrs) = PacketHeaders::parse(pkt.data()) else {
                continue;
            };
            let matched = inner
                .entries
                .iter()
                .position(|e| Some(e.id) != inner.cni && e.flow.matches(&hdrs));
            match matched {
                Some(idx) => {
                    if batch_entry != Some(idx) {
                        Self::flush_batch(inner, &mut batch, batch_entry);
                        batch_entry = Some(idx);
                    }
                    batch.push(pkt);
                }
                None => {
                    Self::flush_batch(inner, &mut batch, batch_entry);
                    batch_entry = None;
                    if let Some(cni_id) = inner.cni
                        && let Some(cni) = inner.entries.iter().find(|e| e.id == cni_id)
                    {
                        self.stat_pkts_cni.inc();
                        Self::enqueue(cni, vec![pkt]);
                    }
                }
            }
        }
        Self::flush_batch(inner, &mut batch, batch_entry);
        rx
    }

    fn flush_batch(inner: &RsqQueueInner, batch: &mut Vec<Mbuf>, entry: Option<usize>) {
        if batch.is_empty() {
            return;
        }
        if let Some(idx) = entry {
            let bulk = std::mem::take(batch);
            Self::enqueue(&inner.entries[idx], bulk);
        } else {
            batch.clear();
        }
    }

    fn enqueue(entry: &RsqEntrySlot, bulk: Vec<Mbuf>) {
        let n = bulk.len() as u64;
        match entry.prod.push_bulk(bulk) {
            Ok(()) => entry.stat_enqueue.add(n),
            Err(dropped) => {
                // ring full: the whole bulk is dropped, never split
                entry.stat_enqueue_fail.add(dropped.len() as u64);
            }
        }
    }
}

/// Session-side handle onto a shared RX queue.
pub struct RsqEntry {
    queue: Arc<RsqQueue>,
    id: u32,
    cons: SpscConsumer<Mbuf>,
}

impl RsqEntry {
    pub fn queue_id(&self) -> u16 {
        self.queue.queue_id
    }

    /// Poll the shared queue (if uncontended) and drain this session's ring.
    pub fn burst(&mut self, out: &mut Vec<Mbuf>, max: usize) -> usize {
        if let Some(mut inner) = self.queue.inner.try_lock() {
            self.queue.rx_dispatch(&mut inner);
        }
        self.cons.pop_bulk(out, max)
    }
}

/// Shared RX queues of one port.
pub struct RsqManager {
    queues: Vec<Arc<RsqQueue>>,
    src_ip: std::net::Ipv4Addr,
}

impl RsqManager {
    /// Wrap `nb` hardware RX queues into shared queues.
    pub fn new(rx_queues: Vec<RxQueue>, src_ip: std::net::Ipv4Addr) -> Self {
        let queues = rx_queues
            .into_iter()
            .map(|rxq| {
                Arc::new(RsqQueue {
                    queue_id: rxq.queue_id(),
                    inner: Mutex::new(RsqQueueInner {
                        rxq,
                        entries: Vec::new(),
                        cni: None,
                    }),
                    next_entry_id: AtomicU32::new(0),
                    stat_pkts_recv: Counter::new(),
                    stat_pkts_cni: Counter::new(),
                })
            })
            .collect();
        Self { queues, src_ip }
    }

    pub fn nb_queues(&self) -> u16 {
        self.queues.len() as u16
    }

    /// Register a session flow; returns its dequeue handle.
    pub fn get(&self, flow: RxFlow) -> Result<RsqEntry> {
        if self.queues.is_empty() {
            return Err(Error::NoBuffer("no shared rx queues"));
        }
        let q = flow_queue(&flow, self.src_ip, self.nb_queues());
        let queue = self.queues[q as usize].clone();
        let id = queue.next_entry_id.fetch_add(1, Ordering::SeqCst);
        let (prod, cons) = ring::spsc(ENTRY_RING_DEPTH);
        let is_cni = flow.flags.contains(FlowFlags::SYS_QUEUE);
        {
            let mut inner = queue.inner.lock();
            inner.entries.push(RsqEntrySlot {
                id,
                flow: flow.clone(),
                prod,
                stat_enqueue: Counter::new(),
                stat_enqueue_fail: Counter::new(),
            });
            if is_cni {
                inner.cni = Some(id);
            }
        }
        tracing::info!(
            queue = q,
            ip = %flow.dst_ip,
            port = flow.dst_port,
            cni = is_cni,
            "rsq entry registered"
        );
        Ok(RsqEntry { queue, id, cons })
    }

    /// Unregister a session.
    pub fn put(&self, entry: RsqEntry) {
        let mut inner = entry.queue.inner.lock();
        inner.entries.retain(|e| e.id != entry.id);
        if inner.cni == Some(entry.id) {
            inner.cni = None;
        }
    }
}

// --- TSQ ---

struct TsqQueueState {
    txq: TxQueue,
}

struct TsqQueue {
    queue_id: u16,
    state: Mutex<TsqQueueState>,
    fatal: AtomicBool,
    pool: MbufPool,
    stat_pkts_sent: Counter,
}

/// Session-side handle onto a shared TX queue.
pub struct TsqEntry {
    queue: Arc<TsqQueue>,
}

impl TsqEntry {
    pub fn queue_id(&self) -> u16 {
        self.queue.queue_id
    }

    pub fn pool(&self) -> &MbufPool {
        &self.queue.pool
    }

    /// One locked burst through the backend queue.
    pub fn burst(&self, pkts: &mut Vec<TxPacket>) -> Result<usize> {
        if self.queue.fatal.load(Ordering::Acquire) {
            return Err(Error::DriverFatal {
                queue: self.queue.queue_id,
            });
        }
        let mut state = self.queue.state.lock();
        let sent = state.txq.tx_burst(pkts)?;
        self.queue.stat_pkts_sent.add(sent as u64);
        Ok(sent)
    }

    /// Retry the burst until everything is sent or `deadline` passes;
    /// returns the count sent.
    pub fn burst_busy(&self, pkts: &mut Vec<TxPacket>, deadline: Duration) -> Result<usize> {
        let until = Instant::now() + deadline;
        let mut total = 0;
        loop {
            total += self.burst(pkts)?;
            if pkts.is_empty() || Instant::now() >= until {
                return Ok(total);
            }
            std::hint::spin_loop();
        }
    }

    /// Emit padding then poll completions until the queue drains.
    pub fn flush(&self) -> Result<()> {
        let pool = self.queue.pool.clone();
        let mut state = self.queue.state.lock();
        state.txq.flush(|| {
            let mut m = pool.alloc()?;
            m.append(64).map(|pad| pad.fill(0))?;
            Ok(m)
        })
    }

    /// Mark this queue wedged; subsequent allocation skips it.
    pub fn fatal_error(&self) {
        tracing::error!(queue = self.queue.queue_id, "shared tx queue marked fatal");
        self.queue.fatal.store(true, Ordering::Release);
    }
}

/// Shared TX queues of one port.
pub struct TsqManager {
    queues: Vec<Arc<TsqQueue>>,
}

impl TsqManager {
    pub fn new(tx_queues: Vec<(TxQueue, MbufPool)>) -> Self {
        let queues = tx_queues
            .into_iter()
            .map(|(txq, pool)| {
                Arc::new(TsqQueue {
                    queue_id: txq.queue_id(),
                    state: Mutex::new(TsqQueueState { txq }),
                    fatal: AtomicBool::new(false),
                    pool,
                    stat_pkts_sent: Counter::new(),
                })
            })
            .collect();
        Self { queues }
    }

    pub fn nb_queues(&self) -> u16 {
        self.queues.len() as u16
    }

    /// Pick the queue for a flow hash, skipping fatal queues.
    pub fn get(&self, flow_hash: u32) -> Result<TsqEntry> {
        if self.queues.is_empty() {
            return Err(Error::NoBuffer("no shared tx queues"));
        }
        let start = ((flow_hash % RETA_GROUP_SIZE) % self.queues.len() as u32) as usize;
        for off in 0..self.queues.len() {
            let queue = &self.queues[(start + off) % self.queues.len()];
            if !queue.fatal.load(Ordering::Acquire) {
                if off > 0 {
                    tracing::warn!(
                        preferred = start,
                        used = queue.queue_id,
                        "preferred shared tx queue fatal, rerouted"
                    );
                }
                return Ok(TsqEntry {
                    queue: queue.clone(),
                });
            }
        }
        Err(Error::NoBuffer("all shared tx queues fatal"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LoopbackDriver, PollDriver};
    use crate::backend::poll_mode::PollModeBackend;
    use crate::config::{Pmd, PortConfig};
    use crate::hdr::{HeaderTemplate, MacAddr, NET_HDR_LEN};
    use std::net::Ipv4Addr;

    fn loop_port(nb: u16) -> (PollModeBackend, Arc<LoopbackDriver>) {
        let driver = Arc::new(LoopbackDriver::new(nb as usize));
        let backend = PollModeBackend::open(
            &PortConfig {
                pmd: Pmd::PollMode,
                tx_queues_cnt: nb,
                rx_queues_cnt: nb,
                ..Default::default()
            },
            driver.clone(),
        )
        .unwrap();
        (backend, driver)
    }

    fn packet(pool: &MbufPool, dst_ip: Ipv4Addr, dst_port: u16, body: &[u8]) -> Mbuf {
        let mut m = pool.alloc().unwrap();
        let mut tmpl = HeaderTemplate::new(
            MacAddr::default(),
            MacAddr::default(),
            Ipv4Addr::new(192, 168, 1, 10),
            dst_ip,
            40000,
            dst_port,
        );
        let dst = m.append(NET_HDR_LEN + body.len()).unwrap();
        tmpl.write(dst, body.len());
        dst[NET_HDR_LEN..].copy_from_slice(body);
        m
    }

    fn flow(ip: [u8; 4], port: u16) -> RxFlow {
        RxFlow {
            dst_ip: Ipv4Addr::from(ip),
            src_ip: None,
            dst_port: port,
            flags: FlowFlags::empty(),
        }
    }

    #[test]
    fn rsq_dispatches_by_flow() {
        let (backend, driver) = loop_port(1);
        let pool = MbufPool::new("rsq", 64, 2048).unwrap();
        let rxq = crate::backend::RxQueue::Poll(backend.get_rx_queue(&pool).unwrap());
        let mgr = RsqManager::new(vec![rxq], Ipv4Addr::new(192, 168, 1, 10));

        let mut a = mgr.get(flow([239, 0, 0, 1], 20000)).unwrap();
        let mut b = mgr.get(flow([239, 0, 0, 2], 20002)).unwrap();

        // inject mixed traffic through the loopback wire
        for (ip, port, tag) in [
            ([239u8, 0, 0, 1], 20000u16, b'a'),
            ([239, 0, 0, 2], 20002, b'b'),
            ([239, 0, 0, 1], 20000, b'a'),
        ] {
            let m = packet(&pool, Ipv4Addr::from(ip), port, &[tag; 4]);
            driver.tx_burst(0, vec![crate::backend::poll_mode::TxFrame {
                bytes: m.to_wire(),
                launch_time_ns: 0,
            }]);
        }

        let mut out_a = Vec::new();
        let mut out_b = Vec::new();
        a.burst(&mut out_a, 16);
        b.burst(&mut out_b, 16);
        assert_eq!(out_a.len(), 2);
        assert_eq!(out_b.len(), 1);
        assert_eq!(&out_a[0].data()[NET_HDR_LEN..], &[b'a'; 4]);
        assert_eq!(&out_b[0].data()[NET_HDR_LEN..], &[b'b'; 4]);
    }

    #[test]
    fn rsq_unmatched_goes_to_cni() {
        let (backend, driver) = loop_port(1);
        let pool = MbufPool::new("cni", 64, 2048).unwrap();
        let rxq = crate::backend::RxQueue::Poll(backend.get_rx_queue(&pool).unwrap());
        let mgr = RsqManager::new(vec![rxq], Ipv4Addr::new(192, 168, 1, 10));

        let mut cni = mgr
            .get(RxFlow {
                dst_ip: Ipv4Addr::UNSPECIFIED,
                src_ip: None,
                dst_port: 0,
                flags: FlowFlags::SYS_QUEUE | FlowFlags::NO_IP | FlowFlags::NO_PORT,
            })
            .unwrap();
        let mut session = mgr.get(flow([239, 0, 0, 1], 20000)).unwrap();

        let stray = packet(&pool, Ipv4Addr::new(10, 0, 0, 9), 9999, b"stray");
        driver.tx_burst(0, vec![crate::backend::poll_mode::TxFrame {
            bytes: stray.to_wire(),
            launch_time_ns: 0,
        }]);

        let mut out = Vec::new();
        session.burst(&mut out, 16);
        assert!(out.is_empty());
        let mut cni_out = Vec::new();
        cni.burst(&mut cni_out, 16);
        assert_eq!(cni_out.len(), 1);
    }

    #[test]
    fn tsq_fatal_reroutes() {
        let (backend, _driver) = loop_port(2);
        let pool = MbufPool::new("tsq", 64, 2048).unwrap();
        let queues = (0..2)
            .map(|_| {
                (
                    crate::backend::TxQueue::Poll(backend.get_tx_queue().unwrap()),
                    pool.clone(),
                )
            })
            .collect();
        let mgr = TsqManager::new(queues);

        let first = mgr.get(0).unwrap();
        let first_qid = first.queue_id();
        first.fatal_error();
        let rerouted = mgr.get(0).unwrap();
        assert_ne!(rerouted.queue_id(), first_qid);
        assert!(matches!(
            first.burst(&mut Vec::new()),
            Err(Error::DriverFatal { .. })
        ));
    }

    #[test]
    fn tsq_burst_sends() {
        let (backend, driver) = loop_port(1);
        let pool = MbufPool::new("tsq2", 64, 2048).unwrap();
        let mgr = TsqManager::new(vec![(
            crate::backend::TxQueue::Poll(backend.get_tx_queue().unwrap()),
            pool.clone(),
        )]);
        let entry = mgr.get(7).unwrap();
        let m = packet(&pool, Ipv4Addr::new(239, 0, 0, 1), 20000, b"x");
        let mut pkts = vec![TxPacket::from(m)];
        assert_eq!(entry.burst(&mut pkts).unwrap(), 1);
        let mut out = Vec::new();
        driver.rx_burst(0, &mut out, 8);
        assert_eq!(out.len(), 1);
    }
}
