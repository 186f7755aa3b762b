//! Shared receive-side scaling.
//!
//! All RX queues of the port are RSS-bucketed by hardware; a configurable
//! number of classifier workers each own a contiguous range of queue ids
//! and run the same software match as the RSQ dispatcher. Session entries
//! are partitioned into an odd-sized bucket array keyed by destination UDP
//! port — odd so consecutive even-numbered RTP ports do not pile into the
//! same bucket.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::backend::{RX_BURST_SIZE, RxQueue};
use crate::error::{Error, Result};
use crate::flow::{FlowFlags, RxFlow};
use crate::hdr::PacketHeaders;
use crate::mempool::Mbuf;
use crate::ring::{self, SpscConsumer, SpscProducer};
use crate::stats::Counter;

const ENTRY_RING_DEPTH: usize = 512;

struct SrssEntrySlot {
    id: u32,
    flow: RxFlow,
    prod: SpscProducer<Mbuf>,
    stat_enqueue: Counter,
    stat_enqueue_fail: Counter,
}

struct SrssList {
    entries: Mutex<Vec<SrssEntrySlot>>,
}

struct SrssShared {
    queues: Vec<Mutex<RxQueue>>,
    lists: Vec<SrssList>,
    cni: Mutex<Option<SrssEntrySlot>>,
    next_entry_id: AtomicU32,
    workers: usize,
    stat_pkts_recv: Counter,
    stat_pkts_cni: Counter,
}

impl SrssShared {
    fn list_for_port(&self, dst_port: u16) -> &SrssList {
        &self.lists[dst_port as usize % self.lists.len()]
    }
}

/// Session-side handle onto the SRSS classifier.
pub struct SrssEntry {
    shared: Arc<SrssShared>,
    list: usize,
    id: u32,
    is_cni: bool,
    cons: SpscConsumer<Mbuf>,
}

impl SrssEntry {
    /// Drain this session's ring. Classification happens on the worker
    /// tasklets, not here.
    pub fn burst(&mut self, out: &mut Vec<Mbuf>, max: usize) -> usize {
        self.cons.pop_bulk(out, max)
    }
}

impl Drop for SrssEntry {
    fn drop(&mut self) {
        if self.is_cni {
            *self.shared.cni.lock() = None;
        } else {
            let mut entries = self.shared.lists[self.list].entries.lock();
            entries.retain(|e| e.id != self.id);
        }
    }
}

/// SRSS classifier over all RX queues of a port.
pub struct SrssManager {
    shared: Arc<SrssShared>,
}

impl SrssManager {
    /// `workers` classifier tasklets share `rx_queues`; `nb_buckets` is
    /// rounded up to the next odd number.
    pub fn new(rx_queues: Vec<RxQueue>, workers: usize, nb_buckets: usize) -> Self {
        let nb_buckets = nb_buckets.max(1) | 1;
        let shared = Arc::new(SrssShared {
            queues: rx_queues.into_iter().map(Mutex::new).collect(),
            lists: (0..nb_buckets)
                .map(|_| SrssList {
                    entries: Mutex::new(Vec::new()),
                })
                .collect(),
            cni: Mutex::new(None),
            next_entry_id: AtomicU32::new(0),
            workers: workers.max(1),
            stat_pkts_recv: Counter::new(),
            stat_pkts_cni: Counter::new(),
        });
        Self { shared }
    }

    pub fn workers(&self) -> usize {
        self.shared.workers
    }

    /// Register a session flow into its port bucket.
    pub fn get(&self, flow: RxFlow) -> Result<SrssEntry> {
        let id = self.shared.next_entry_id.fetch_add(1, Ordering::SeqCst);
        let (prod, cons) = ring::spsc(ENTRY_RING_DEPTH);
        let slot = SrssEntrySlot {
            id,
            flow: flow.clone(),
            prod,
            stat_enqueue: Counter::new(),
            stat_enqueue_fail: Counter::new(),
        };
        if flow.flags.contains(FlowFlags::SYS_QUEUE) {
            let mut cni = self.shared.cni.lock();
            if cni.is_some() {
                return Err(Error::Busy("cni entry already registered"));
            }
            *cni = Some(slot);
            return Ok(SrssEntry {
                shared: self.shared.clone(),
                list: 0,
                id,
                is_cni: true,
                cons,
            });
        }
        let list = flow.dst_port as usize % self.shared.lists.len();
        self.shared.lists[list].entries.lock().push(slot);
        tracing::info!(list, port = flow.dst_port, "srss entry registered");
        Ok(SrssEntry {
            shared: self.shared.clone(),
            list,
            id,
            is_cni: false,
            cons,
        })
    }

    /// One classification pass over this worker's queue range.
    ///
    /// Worker `w` of `N` owns the contiguous range `[w*Q/N, (w+1)*Q/N)`.
    /// Returns packets processed; a tasklet handler calls this in its loop.
    pub fn poll_worker(&self, worker: usize) -> usize {
        let shared = &self.shared;
        let nq = shared.queues.len();
        let per = nq.div_ceil(shared.workers);
        let start = worker * per;
        let end = ((worker + 1) * per).min(nq);
        let mut total = 0;
        for qidx in start..end {
            let Some(mut rxq) = shared.queues[qidx].try_lock() else {
                continue;
            };
            let mut pkts = Vec::with_capacity(RX_BURST_SIZE);
            let rx = rxq.rx_burst(&mut pkts, RX_BURST_SIZE);
            drop(rxq);
            if rx == 0 {
                continue;
            }
            shared.stat_pkts_recv.add(rx as u64);
            total += rx;
            for pkt in pkts {
                let Ok(hdrs) = PacketHeaders::parse(pkt.data()) else {
                    continue;
                };
                let list = shared.list_for_port(hdrs.dst_port);
                let entries = list.entries.lock();
                let matched = entries.iter().find(|e| e.flow.matches(&hdrs));
                match matched {
                    Some(entry) => {
                        if entry.prod.push(pkt).is_ok() {
                            entry.stat_enqueue.inc();
                        } else {
                            entry.stat_enqueue_fail.inc();
                        }
                    }
                    None => {
                        drop(entries);
                        shared.stat_pkts_cni.inc();
                        if let Some(cni) = shared.cni.lock().as_ref() {
                            if cni.prod.push(pkt).is_ok() {
                                cni.stat_enqueue.inc();
                            } else {
                                cni.stat_enqueue_fail.inc();
                            }
                        }
                    }
                }
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::poll_mode::{PollModeBackend, TxFrame};
    use crate::backend::{LoopbackDriver, PollDriver};
    use crate::config::{Pmd, PortConfig};
    use crate::hdr::{HeaderTemplate, MacAddr, NET_HDR_LEN};
    use crate::mempool::MbufPool;
    use std::net::Ipv4Addr;

    fn wire_pkt(dst_ip: Ipv4Addr, dst_port: u16, body: &[u8]) -> Vec<u8> {
        let mut tmpl = HeaderTemplate::new(
            MacAddr::default(),
            MacAddr::default(),
            Ipv4Addr::new(192, 168, 1, 10),
            dst_ip,
            40000,
            dst_port,
        );
        let mut buf = vec![0u8; NET_HDR_LEN + body.len()];
        tmpl.write(&mut buf, body.len());
        buf[NET_HDR_LEN..].copy_from_slice(body);
        buf
    }

    #[test]
    fn srss_partitions_by_port() {
        let driver = Arc::new(LoopbackDriver::new(4));
        let backend = PollModeBackend::open(
            &PortConfig {
                pmd: Pmd::PollMode,
                rx_queues_cnt: 4,
                tx_queues_cnt: 4,
                ..Default::default()
            },
            driver.clone(),
        )
        .unwrap();
        let pool = MbufPool::new("srss", 64, 2048).unwrap();
        let queues: Vec<RxQueue> = (0..4)
            .map(|_| RxQueue::Poll(backend.get_rx_queue(&pool).unwrap()))
            .collect();
        let mgr = SrssManager::new(queues, 2, 8);
        // bucket count rounded to odd
        assert_eq!(mgr.shared.lists.len(), 9);

        let mut a = mgr
            .get(RxFlow {
                dst_ip: Ipv4Addr::new(239, 0, 0, 1),
                src_ip: None,
                dst_port: 20000,
                flags: FlowFlags::empty(),
            })
            .unwrap();
        let mut b = mgr
            .get(RxFlow {
                dst_ip: Ipv4Addr::new(239, 0, 0, 2),
                src_ip: None,
                dst_port: 20002,
                flags: FlowFlags::empty(),
            })
            .unwrap();

        // spread traffic over the RSS queues
        driver.tx_burst(1, vec![TxFrame {
            bytes: wire_pkt(Ipv4Addr::new(239, 0, 0, 1), 20000, b"aa"),
            launch_time_ns: 0,
        }]);
        driver.tx_burst(3, vec![TxFrame {
            bytes: wire_pkt(Ipv4Addr::new(239, 0, 0, 2), 20002, b"bb"),
            launch_time_ns: 0,
        }]);

        for w in 0..mgr.workers() {
            mgr.poll_worker(w);
        }

        let mut out = Vec::new();
        assert_eq!(a.burst(&mut out, 8), 1);
        assert_eq!(&out[0].data()[NET_HDR_LEN..], b"aa");
        out.clear();
        assert_eq!(b.burst(&mut out, 8), 1);
        assert_eq!(&out[0].data()[NET_HDR_LEN..], b"bb");
    }

    #[test]
    fn srss_worker_ranges_are_disjoint() {
        let driver = Arc::new(LoopbackDriver::new(6));
        let backend = PollModeBackend::open(
            &PortConfig {
                pmd: Pmd::PollMode,
                rx_queues_cnt: 6,
                tx_queues_cnt: 6,
                ..Default::default()
            },
            driver.clone(),
        )
        .unwrap();
        let pool = MbufPool::new("srss2", 64, 2048).unwrap();
        let queues: Vec<RxQueue> = (0..6)
            .map(|_| RxQueue::Poll(backend.get_rx_queue(&pool).unwrap()))
            .collect();
        let mgr = SrssManager::new(queues, 3, 1);

        let mut s = mgr
            .get(RxFlow {
                dst_ip: Ipv4Addr::new(239, 1, 1, 1),
                src_ip: None,
                dst_port: 30000,
                flags: FlowFlags::empty(),
            })
            .unwrap();
        // one packet on every queue; each worker only drains its own range
        for q in 0..6 {
            driver.tx_burst(q, vec![TxFrame {
                bytes: wire_pkt(Ipv4Addr::new(239, 1, 1, 1), 30000, &[q as u8]),
                launch_time_ns: 0,
            }]);
        }
        assert_eq!(mgr.poll_worker(0), 2);
        assert_eq!(mgr.poll_worker(1), 2);
        assert_eq!(mgr.poll_worker(2), 2);
        let mut out = Vec::new();
        assert_eq!(s.burst(&mut out, 16), 6);
    }
}
