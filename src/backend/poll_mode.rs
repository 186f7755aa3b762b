//! Poll-mode backend.
//!
//! The fastest discipline: a user-space driver owns the device and exposes
//! burst TX/RX per queue, optional hardware flow steering, and a traffic
//! manager for per-queue shaping. The driver itself is a collaborator
//! behind [`PollDriver`]; this module owns the policy around it — the flow
//! install ladder (full 5-tuple, then raw pattern, then give up and let the
//! shared classifier handle it), the shaper hierarchy built once per port,
//! and the command lock serializing control-plane calls the driver cannot
//! take concurrently.
//!
//! [`LoopbackDriver`] is the in-memory reference driver: every TX queue
//! feeds the RX queue of the same index. Integration tests run entire
//! TX-to-RX pipelines on it deterministically.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use parking_lot::Mutex;

use crate::config::PortConfig;
use crate::error::{Error, Result};
use crate::flow::RxFlow;
use crate::hdr::MacAddr;
use crate::mempool::{Mbuf, MbufPool};
use crate::stats::Counter;

use super::{PortCaps, PortInfo, TxPacket};

/// One frame handed to the driver.
pub struct TxFrame {
    pub bytes: Vec<u8>,
    /// Zero means "now"; honored only with [`PortCaps::LAUNCH_TIME`].
    pub launch_time_ns: u64,
}

/// Flow classification precision, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowLevel {
    /// Exact eth/ipv4/udp pattern.
    FullTuple,
    /// Byte-mask pattern over the first 62 bytes; matches the UDP
    /// destination port only.
    RawPattern,
}

/// Poll-mode device access consumed by this backend.
pub trait PollDriver: Send + Sync {
    fn mac(&self) -> MacAddr;
    fn caps(&self) -> PortCaps;
    /// Burst-transmit; returns how many frames the device accepted.
    fn tx_burst(&self, queue: u16, frames: Vec<TxFrame>) -> usize;
    /// Burst-receive raw frames.
    fn rx_burst(&self, queue: u16, out: &mut Vec<Vec<u8>>, max: usize) -> usize;
    /// Install a classifier at the given precision; the returned id
    /// destroys it.
    fn create_flow(&self, queue: u16, level: FlowLevel, flow: &RxFlow) -> Result<u64>;
    fn destroy_flow(&self, id: u64) -> Result<()>;
    /// Bind the queue leaf to a shaper committed in the TM hierarchy.
    fn set_queue_rate(&self, queue: u16, bytes_per_sec: u64) -> Result<()>;
}

/// Shaper hierarchy bookkeeping: one profile per distinct bit-rate class,
/// committed once, leaves bound as sessions arrive.
struct TrafficManager {
    /// bytes-per-sec class -> shaper profile id
    profiles: HashMap<u64, u32>,
    next_profile: u32,
}

impl TrafficManager {
    fn new() -> Self {
        Self {
            profiles: HashMap::new(),
            next_profile: 0,
        }
    }

    fn profile_for(&mut self, bytes_per_sec: u64) -> u32 {
        *self.profiles.entry(bytes_per_sec).or_insert_with(|| {
            let id = self.next_profile;
            self.next_profile += 1;
            tracing::debug!(bytes_per_sec, profile = id, "tm shaper profile added");
            id
        })
    }
}

/// Poll-mode port.
pub struct PollModeBackend {
    info: PortInfo,
    driver: Arc<dyn PollDriver>,
    /// Serializes flow programming and TM commits against the driver.
    cmd_lock: Arc<Mutex<TrafficManager>>,
    next_tx_qid: AtomicU16,
    next_rx_qid: AtomicU16,
}

impl PollModeBackend {
    pub fn open(cfg: &PortConfig, driver: Arc<dyn PollDriver>) -> Result<PollModeBackend> {
        let info = PortInfo {
            ifname: cfg.ifname.clone(),
            pmd: cfg.pmd,
            sip: cfg.sip_addr,
            mac: driver.mac(),
            caps: driver.caps(),
            tx_queues: cfg.tx_queues_cnt,
            rx_queues: cfg.rx_queues_cnt,
        };
        tracing::info!(ifname = %cfg.ifname, caps = ?info.caps, "poll-mode port opened");
        Ok(PollModeBackend {
            info,
            driver,
            cmd_lock: Arc::new(Mutex::new(TrafficManager::new())),
            next_tx_qid: AtomicU16::new(0),
            next_rx_qid: AtomicU16::new(0),
        })
    }

    pub fn info(&self) -> &PortInfo {
        &self.info
    }

    pub fn get_tx_queue(&self) -> Result<PollTxQueue> {
        let qid = self.next_tx_qid.fetch_add(1, Ordering::SeqCst);
        if qid >= self.info.tx_queues {
            return Err(Error::NoBuffer("poll tx queues exhausted"));
        }
        Ok(PollTxQueue {
            qid,
            driver: self.driver.clone(),
            cmd_lock: self.cmd_lock.clone(),
            launch_time: self.info.caps.contains(PortCaps::LAUNCH_TIME),
            stat_tx_pkts: Counter::new(),
        })
    }

    pub fn get_rx_queue(&self, pool: &MbufPool) -> Result<PollRxQueue> {
        let qid = self.next_rx_qid.fetch_add(1, Ordering::SeqCst);
        if qid >= self.info.rx_queues {
            return Err(Error::NoBuffer("poll rx queues exhausted"));
        }
        Ok(PollRxQueue {
            qid,
            driver: self.driver.clone(),
            pool: pool.clone(),
            flow_ids: Vec::new(),
            stat_rx_pkts: Counter::new(),
            stat_rx_nobuf: Counter::new(),
        })
    }

    /// Try hardware classification at decreasing precision.
    ///
    /// `Ok(None)` means the driver cannot steer this flow at all and the
    /// caller must fall back to shared-RSS software classification.
    pub fn install_flow(&self, queue: u16, flow: &RxFlow) -> Result<Option<u64>> {
        if !self.info.caps.contains(PortCaps::HW_FLOW) {
            return Ok(None);
        }
        let _cmd = self.cmd_lock.lock();
        match self.driver.create_flow(queue, FlowLevel::FullTuple, flow) {
            Ok(id) => return Ok(Some(id)),
            Err(e) => {
                tracing::info!(queue, error = %e, "full-tuple flow rejected, trying raw pattern");
            }
        }
        match self.driver.create_flow(queue, FlowLevel::RawPattern, flow) {
            Ok(id) => Ok(Some(id)),
            Err(e) => {
                tracing::warn!(queue, error = %e, "raw flow rejected, using shared rss");
                Ok(None)
            }
        }
    }

    pub fn uninstall_flow(&self, id: u64) -> Result<()> {
        let _cmd = self.cmd_lock.lock();
        self.driver.destroy_flow(id)
    }
}

/// Poll-mode TX queue.
pub struct PollTxQueue {
    qid: u16,
    driver: Arc<dyn PollDriver>,
    cmd_lock: Arc<Mutex<TrafficManager>>,
    launch_time: bool,
    pub stat_tx_pkts: Counter,
}

impl PollTxQueue {
    pub fn queue_id(&self) -> u16 {
        self.qid
    }

    pub fn tx_burst(&mut self, pkts: &mut Vec<TxPacket>) -> Result<usize> {
        if pkts.is_empty() {
            return Ok(0);
        }
        let frames: Vec<TxFrame> = pkts
            .iter()
            .map(|p| TxFrame {
                bytes: p.mbuf.to_wire(),
                launch_time_ns: if self.launch_time {
                    p.meta.launch_time_ns
                } else {
                    0
                },
            })
            .collect();
        let accepted = self.driver.tx_burst(self.qid, frames);
        pkts.drain(..accepted);
        self.stat_tx_pkts.add(accepted as u64);
        Ok(accepted)
    }

    /// Commit a shaper for this queue. Non-atomic against the driver, so
    /// the whole reconfiguration holds the port command lock.
    pub fn set_tx_rate(&mut self, bytes_per_sec: u64) -> Result<()> {
        let mut tm = self.cmd_lock.lock();
        let profile = tm.profile_for(bytes_per_sec);
        self.driver.set_queue_rate(self.qid, bytes_per_sec)?;
        tracing::info!(qid = self.qid, bytes_per_sec, profile, "queue shaper bound");
        Ok(())
    }

    pub fn flush(&mut self, pad: impl Fn() -> Result<Mbuf>) -> Result<()> {
        // one padding frame pushes any buffered descriptors out
        let m = pad()?;
        let mut v = vec![TxPacket::from(m)];
        self.tx_burst(&mut v)?;
        Ok(())
    }
}

/// Poll-mode RX queue.
pub struct PollRxQueue {
    qid: u16,
    driver: Arc<dyn PollDriver>,
    pool: MbufPool,
    flow_ids: Vec<u64>,
    pub stat_rx_pkts: Counter,
    pub stat_rx_nobuf: Counter,
}

impl PollRxQueue {
    pub fn queue_id(&self) -> u16 {
        self.qid
    }

    pub fn attach_flow(&mut self, id: u64) {
        self.flow_ids.push(id);
    }

    pub fn rx_burst(&mut self, out: &mut Vec<Mbuf>, max: usize) -> usize {
        let mut frames = Vec::new();
        self.driver.rx_burst(self.qid, &mut frames, max);
        let mut n = 0;
        for frame in frames {
            let Ok(mut mbuf) = self.pool.alloc() else {
                self.stat_rx_nobuf.inc();
                break;
            };
            let Ok(dst) = mbuf.append(frame.len()) else {
                self.stat_rx_nobuf.inc();
                break;
            };
            dst.copy_from_slice(&frame);
            out.push(mbuf);
            self.stat_rx_pkts.inc();
            n += 1;
        }
        n
    }
}

/// In-memory device: TX queue `i` is wired straight to RX queue `i`.
///
/// Optionally drops packets with a deterministic Bernoulli pattern to
/// exercise loss recovery.
pub struct LoopbackDriver {
    mac: MacAddr,
    queues: Vec<Mutex<VecDeque<TxFrame>>>,
    rates: Mutex<HashMap<u16, u64>>,
    next_flow: AtomicU16,
    hw_flow: bool,
}

impl LoopbackDriver {
    pub fn new(nb_queues: usize) -> Self {
        Self {
            mac: MacAddr([0x02, 0xFE, 0, 0, 0, 1]),
            queues: (0..nb_queues).map(|_| Mutex::new(VecDeque::new())).collect(),
            rates: Mutex::new(HashMap::new()),
            next_flow: AtomicU16::new(1),
            hw_flow: false,
        }
    }

    /// Enable hardware-flow capability reporting (flows are accepted and
    /// ignored; loopback wiring already isolates queues).
    pub fn with_hw_flow(mut self) -> Self {
        self.hw_flow = true;
        self
    }

    pub fn queue_rate(&self, queue: u16) -> Option<u64> {
        self.rates.lock().get(&queue).copied()
    }
}

impl PollDriver for LoopbackDriver {
    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn caps(&self) -> PortCaps {
        let mut caps = PortCaps::IPV4_CKSUM
            | PortCaps::HW_RATE_LIMIT
            | PortCaps::LAUNCH_TIME
            | PortCaps::MULTI_SEG;
        if self.hw_flow {
            caps |= PortCaps::HW_FLOW;
        }
        caps
    }

    fn tx_burst(&self, queue: u16, frames: Vec<TxFrame>) -> usize {
        let Some(q) = self.queues.get(queue as usize) else {
            return 0;
        };
        let n = frames.len();
        q.lock().extend(frames);
        n
    }

    fn rx_burst(&self, queue: u16, out: &mut Vec<Vec<u8>>, max: usize) -> usize {
        let Some(q) = self.queues.get(queue as usize) else {
            return 0;
        };
        let mut q = q.lock();
        let n = q.len().min(max);
        for _ in 0..n {
            out.push(q.pop_front().unwrap().bytes);
        }
        n
    }

    fn create_flow(&self, _queue: u16, level: FlowLevel, _flow: &RxFlow) -> Result<u64> {
        if !self.hw_flow {
            return Err(Error::NotFound("hw flow"));
        }
        if level == FlowLevel::RawPattern {
            return Err(Error::InvalidArg("raw pattern unsupported".into()));
        }
        Ok(self.next_flow.fetch_add(1, Ordering::SeqCst) as u64)
    }

    fn destroy_flow(&self, _id: u64) -> Result<()> {
        Ok(())
    }

    fn set_queue_rate(&self, queue: u16, bytes_per_sec: u64) -> Result<()> {
        self.rates.lock().insert(queue, bytes_per_sec);
        Ok(())
    }
}
