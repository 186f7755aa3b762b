//! Engine: the single owner of ports, sessions, and schedulers.
//!
//! There is no process-wide state anywhere in this crate — everything
//! hangs off an `Engine` value, and sessions are addressed by arena-index
//! handles ([`SessionId`]), not pointers. Dropping the engine stops the
//! schedulers, which stop every session tasklet cooperatively.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::arp::{NeighborResolver, StaticNeighbors};
use crate::backend::{BackendResources, NicBackend, RX_BURST_SIZE};
use crate::config::{EngineConfig, EngineFlags, SessionFlags, VideoSessionConfig};
use crate::error::{Error, Result};
use crate::flow::{FlowFlags, FlowTable, RxFlow};
use crate::mempool::MbufPool;
use crate::pacing::{self, PacingMode};
use crate::pcap::PcapDumper;
use crate::queue::{RsqEntry, RsqManager, TsqManager};
use crate::sched::{SchedulerPool, Tasklet, TaskletTick};
use crate::stats::StatCollector;
use crate::time::{Clock, SystemClock};
use crate::video::frame::FrameRing;
use crate::video::{DetectCallback, VideoRxSession, VideoTxSession};

/// Session handle: index plus generation, so a recycled slot cannot be
/// addressed through a stale id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId {
    index: u32,
    generation: u32,
}

/// pcapng dump result.
#[derive(Debug, Clone)]
pub struct PcapDumpMeta {
    pub file_name: String,
}

enum SessionKind {
    VideoTx,
    VideoRx {
        frames: Arc<FrameRing>,
        dumper: Arc<Mutex<Option<PcapDumper>>>,
    },
}

struct SessionSlot {
    generation: u32,
    kind: Option<SessionKind>,
}

struct Port {
    backend: NicBackend,
    flow_table: FlowTable,
    tx_pool: MbufPool,
    rx_pool: MbufPool,
    tsq: Option<TsqManager>,
    rsq: Option<RsqManager>,
}

/// The datapath root object.
pub struct Engine {
    cfg: EngineConfig,
    ports: Vec<Port>,
    stats: Arc<StatCollector>,
    sched: SchedulerPool,
    clock: Clock,
    resolver: Arc<dyn NeighborResolver>,
    sessions: Mutex<Vec<SessionSlot>>,
    free_slots: Mutex<Vec<u32>>,
}

impl Engine {
    /// Open every configured port and stand the schedulers up.
    pub fn new(cfg: EngineConfig, resources: BackendResources) -> Result<Engine> {
        Self::with_collaborators(
            cfg,
            resources,
            Arc::new(SystemClock),
            Arc::new(StaticNeighbors::new()),
        )
    }

    pub fn with_collaborators(
        cfg: EngineConfig,
        resources: BackendResources,
        clock: Clock,
        resolver: Arc<dyn NeighborResolver>,
    ) -> Result<Engine> {
        if cfg.ports.is_empty() {
            return Err(Error::InvalidArg("no ports configured".into()));
        }
        let mut ports = Vec::with_capacity(cfg.ports.len());
        for port_cfg in &cfg.ports {
            let backend = NicBackend::open(port_cfg, &resources)?;
            let tx_pool = MbufPool::new(
                &format!("{}-tx", port_cfg.ifname),
                (port_cfg.nb_tx_desc as u32 + 128) * port_cfg.tx_queues_cnt as u32,
                2048,
            )?;
            let rx_pool = MbufPool::new(
                &format!("{}-rx", port_cfg.ifname),
                (port_cfg.nb_rx_desc as u32 + 128) * port_cfg.rx_queues_cnt as u32,
                2048,
            )?;

            let tsq = if cfg.flags.contains(EngineFlags::SHARED_TX_QUEUE) {
                let queues = (0..port_cfg.tx_queues_cnt)
                    .map(|_| {
                        // shared queues have no single destination
                        let dest = std::net::SocketAddrV4::new(
                            std::net::Ipv4Addr::UNSPECIFIED,
                            0,
                        );
                        backend
                            .get_tx_queue(&tx_pool, dest)
                            .map(|q| (q, tx_pool.clone()))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Some(TsqManager::new(queues))
            } else {
                None
            };
            let rsq = if cfg.flags.contains(EngineFlags::SHARED_RX_QUEUE) {
                let catch_all = RxFlow {
                    dst_ip: std::net::Ipv4Addr::UNSPECIFIED,
                    src_ip: None,
                    dst_port: 0,
                    flags: FlowFlags::NO_IP | FlowFlags::NO_PORT,
                };
                let queues = (0..port_cfg.rx_queues_cnt)
                    .map(|_| backend.get_rx_queue(&rx_pool, &catch_all))
                    .collect::<Result<Vec<_>>>()?;
                Some(RsqManager::new(queues, port_cfg.sip_addr))
            } else {
                None
            };

            ports.push(Port {
                backend,
                flow_table: FlowTable::new(),
                tx_pool,
                rx_pool,
                tsq,
                rsq,
            });
        }
        tracing::info!(ports = ports.len(), "engine initialized");
        Ok(Engine {
            sched: SchedulerPool::new(cfg.data_quota_mbs_per_sch),
            cfg,
            ports,
            stats: Arc::new(StatCollector::new()),
            clock,
            resolver,
            sessions: Mutex::new(Vec::new()),
            free_slots: Mutex::new(Vec::new()),
        })
    }

    pub fn stats(&self) -> &StatCollector {
        &self.stats
    }

    /// Run one stat dump cycle.
    pub fn dump_stats(&self) -> Result<()> {
        self.stats.dump()
    }

    fn alloc_slot(&self, kind: SessionKind) -> SessionId {
        let mut sessions = self.sessions.lock();
        if let Some(index) = self.free_slots.lock().pop() {
            let slot = &mut sessions[index as usize];
            slot.generation += 1;
            slot.kind = Some(kind);
            return SessionId {
                index,
                generation: slot.generation,
            };
        }
        let index = sessions.len() as u32;
        sessions.push(SessionSlot {
            generation: 0,
            kind: Some(kind),
        });
        SessionId {
            index,
            generation: 0,
        }
    }

    fn port(&self, port: usize) -> Result<&Port> {
        self.ports.get(port).ok_or(Error::NotFound("port"))
    }

    /// Create a video TX session and schedule its tasklet.
    pub fn create_video_tx(
        &self,
        port_idx: usize,
        cfg: VideoSessionConfig,
        producer: Box<dyn crate::video::FrameProducer>,
    ) -> Result<SessionId> {
        let port = self.port(port_idx)?;
        let info = port.backend.info().clone();
        let pacing = pacing::select_pacing(info.caps, None);
        // backends that hand datagrams to the kernel or to verbs do their
        // own L2; only frame-level backends consult the neighbor table
        let kernel_l2 = crate::arp::AlwaysResolved(info.mac);
        let resolver: &dyn NeighborResolver = match &port.backend {
            NicBackend::Kernel(_) | NicBackend::Rdma(_) => &kernel_l2,
            NicBackend::AfXdp(_) | NicBackend::Poll(_) => self.resolver.as_ref(),
        };
        let mut session = VideoTxSession::new(
            cfg.clone(),
            port.tx_pool.clone(),
            producer,
            info.mac,
            info.sip,
            resolver,
            self.clock.clone(),
            pacing,
        )?;
        let rate = session.bytes_per_sec();
        let mbps = (rate * 8 / 1_000_000) as u32;

        let sink: Box<dyn crate::video::tx::TxSink + Send> = match &port.tsq {
            Some(tsq) => {
                let hash = crate::hdr::softrss_flow(
                    cfg.dests[0].ip,
                    info.sip,
                    cfg.dests[0].udp_port,
                );
                Box::new(tsq.get(hash)?)
            }
            None => {
                let dest = std::net::SocketAddrV4::new(
                    cfg.dests[0].ip,
                    cfg.dests[0].udp_port,
                );
                let mut queue = port.backend.get_tx_queue(&port.tx_pool, dest)?;
                if pacing == PacingMode::HwRl
                    && let Err(e) = queue.set_tx_rate(rate)
                {
                    tracing::warn!(error = %e, "hw shaper install failed, tsc pacing");
                    session.set_pacing(PacingMode::Tsc);
                }
                Box::new(queue)
            }
        };

        let id = self.alloc_slot(SessionKind::VideoTx);
        self.sched.register(
            Box::new(VideoTxTasklet {
                name: format!("st20-tx-{}", id.index),
                session,
                sink,
            }),
            mbps.max(1),
        );
        Ok(id)
    }

    /// Create a video RX session: flow install, queue reservation, tasklet.
    pub fn create_video_rx(
        &self,
        port_idx: usize,
        cfg: VideoSessionConfig,
        detect_cb: Option<DetectCallback>,
    ) -> Result<SessionId> {
        let port = self.port(port_idx)?;
        let mut flow_flags = FlowFlags::empty();
        if self.cfg.flags.contains(EngineFlags::RX_UDP_PORT_ONLY) {
            flow_flags |= FlowFlags::NO_IP;
        }
        let flow = RxFlow {
            dst_ip: cfg.dests[0].ip,
            src_ip: None,
            dst_port: cfg.dests[0].udp_port,
            flags: flow_flags,
        };

        let session = VideoRxSession::new(cfg.clone(), self.clock.clone(), detect_cb)?;
        let frames = session.frames();
        let dumper = Arc::new(Mutex::new(None));

        let source: RxSource = match &port.rsq {
            Some(rsq) => RxSource::Shared(rsq.get(flow.clone())?),
            None => {
                let queue = port.backend.get_rx_queue(&port.rx_pool, &flow)?;
                let hw_flow = port.backend.install_flow(queue.queue_id(), &flow)?;
                port.flow_table.install(queue.queue_id(), flow.clone());
                RxSource::Dedicated {
                    queue,
                    _hw_flow: hw_flow,
                }
            }
        };

        let id = self.alloc_slot(SessionKind::VideoRx {
            frames,
            dumper: dumper.clone(),
        });
        let mbps =
            (cfg.fmt.frame_size(cfg.width, cfg.height, cfg.interlaced)? as u64
                * cfg.fps.rate() as u64
                * 8
                / 1_000_000) as u32;
        self.sched.register(
            Box::new(VideoRxTasklet {
                name: format!("st20-rx-{}", id.index),
                session,
                source,
                dumper,
                clock: self.clock.clone(),
            }),
            mbps.max(1),
        );
        Ok(id)
    }

    fn session_kind<T>(
        &self,
        id: SessionId,
        f: impl FnOnce(&SessionKind) -> Option<T>,
    ) -> Result<T> {
        let sessions = self.sessions.lock();
        let slot = sessions
            .get(id.index as usize)
            .ok_or(Error::NotFound("session"))?;
        if slot.generation != id.generation {
            return Err(Error::NotFound("session"));
        }
        slot.kind
            .as_ref()
            .and_then(f)
            .ok_or(Error::NotFound("session"))
    }

    /// Consumer access to an RX session's frame ring.
    pub fn video_rx_frames(&self, id: SessionId) -> Result<Arc<FrameRing>> {
        self.session_kind(id, |kind| match kind {
            SessionKind::VideoRx { frames, .. } => Some(frames.clone()),
            _ => None,
        })
    }

    /// Start a pcapng dump of an RX session's next `max_packets` packets.
    pub fn rx_pcapng_dump(
        &self,
        id: SessionId,
        dir: PathBuf,
        max_packets: u32,
    ) -> Result<PcapDumpMeta> {
        let dumper_slot = self.session_kind(id, |kind| match kind {
            SessionKind::VideoRx { dumper, .. } => Some(dumper.clone()),
            _ => None,
        })?;
        let dumper = PcapDumper::create(
            &dir,
            &format!("st20-rx-{}-{}", id.index, max_packets),
            max_packets,
        )?;
        let meta = PcapDumpMeta {
            file_name: dumper.file_name().to_string(),
        };
        *dumper_slot.lock() = Some(dumper);
        Ok(meta)
    }

    /// Release a session slot.
    pub fn destroy_session(&self, id: SessionId) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let slot = sessions
            .get_mut(id.index as usize)
            .ok_or(Error::NotFound("session"))?;
        if slot.generation != id.generation || slot.kind.is_none() {
            return Err(Error::NotFound("session"));
        }
        slot.kind = None;
        self.free_slots.lock().push(id.index);
        Ok(())
    }

    /// Cooperative shutdown: stop schedulers, drain the stat registry.
    pub fn shutdown(&self) {
        self.sched.shutdown();
        self.stats.drain();
        tracing::info!("engine shut down");
    }
}

// --- tasklets ---

struct VideoTxTasklet {
    name: String,
    session: VideoTxSession,
    sink: Box<dyn crate::video::tx::TxSink + Send>,
}

impl Tasklet for VideoTxTasklet {
    fn name(&self) -> &str {
        &self.name
    }

    fn handler(&mut self) -> TaskletTick {
        match self.session.poll(self.sink.as_mut()) {
            Ok(0) => TaskletTick::Idle,
            Ok(_) => TaskletTick::Busy,
            Err(e) => {
                tracing::error!(tasklet = %self.name, error = %e, "tx poll failed");
                self.session.fatal_error = true;
                TaskletTick::Done
            }
        }
    }
}

enum RxSource {
    Dedicated {
        queue: crate::backend::RxQueue,
        _hw_flow: Option<u64>,
    },
    Shared(RsqEntry),
}

struct VideoRxTasklet {
    name: String,
    session: VideoRxSession,
    source: RxSource,
    dumper: Arc<Mutex<Option<PcapDumper>>>,
    clock: Clock,
}

impl Tasklet for VideoRxTasklet {
    fn name(&self) -> &str {
        &self.name
    }

    fn handler(&mut self) -> TaskletTick {
        let mut pkts = Vec::with_capacity(RX_BURST_SIZE);
        let n = match &mut self.source {
            RxSource::Dedicated { queue, .. } => queue.rx_burst(&mut pkts, RX_BURST_SIZE),
            RxSource::Shared(entry) => entry.burst(&mut pkts, RX_BURST_SIZE),
        };
        if n == 0 {
            return TaskletTick::Idle;
        }
        let mut dumper = self.dumper.lock();
        for pkt in &pkts {
            if let Some(d) = dumper.as_mut() {
                let more = d
                    .dump_packet(pkt.data(), self.clock.time_ns())
                    .unwrap_or(false);
                if !more {
                    *dumper = None;
                }
            }
            if let Err(e) = self.session.on_packet(pkt.data(), 0) {
                tracing::debug!(tasklet = %self.name, error = %e, "rx packet dropped");
            }
        }
        TaskletTick::Busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LoopbackDriver;
    use crate::config::{Fps, Packing, Pmd, PortConfig, SessionDest, VideoFormat};
    use std::net::Ipv4Addr;

    fn loop_engine() -> Engine {
        let driver = Arc::new(LoopbackDriver::new(8));
        Engine::new(
            EngineConfig {
                ports: vec![PortConfig {
                    ifname: "lo-test".into(),
                    pmd: Pmd::PollMode,
                    sip_addr: Ipv4Addr::new(192, 168, 1, 10),
                    tx_queues_cnt: 8,
                    rx_queues_cnt: 8,
                    ..Default::default()
                }],
                ..Default::default()
            },
            BackendResources {
                poll_driver: Some(driver),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn session_cfg() -> VideoSessionConfig {
        VideoSessionConfig {
            dests: vec![SessionDest {
                ip: Ipv4Addr::new(239, 0, 0, 1),
                udp_port: 20000,
            }],
            payload_type: 112,
            width: 64,
            height: 8,
            fps: Fps::P100,
            fmt: VideoFormat::Yuv422_10Bit,
            packing: Packing::Bpm,
            interlaced: false,
            framebuff_cnt: 4,
            linesize: None,
            slice_lines: 0,
            flags: SessionFlags::empty(),
            arp_timeout_ms: 0,
            udp_src_port_base: 30000,
        }
    }

    struct OneShotProducer {
        remaining: u32,
    }

    impl crate::video::FrameProducer for OneShotProducer {
        fn next_frame(&mut self, frame: &mut [u8]) -> Option<crate::video::TxFrameMeta> {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            frame.fill(0x77);
            Some(crate::video::TxFrameMeta::default())
        }
    }

    #[test]
    fn end_to_end_over_loopback_port() {
        let engine = loop_engine();
        // rx first so its queue index matches the tx queue wiring
        let rx = engine
            .create_video_rx(0, session_cfg(), None)
            .unwrap();
        let tx = engine
            .create_video_tx(0, session_cfg(), Box::new(OneShotProducer { remaining: 2 }))
            .unwrap();
        let frames = engine.video_rx_frames(rx).unwrap();
        let frame = frames
            .get_frame(Duration::from_secs(5))
            .expect("frame delivered end to end");
        assert_eq!(
            frame.meta.status,
            crate::video::FrameStatus::Complete
        );
        assert!(frame.data.iter().all(|&b| b == 0x77));
        frames.put_frame(frame);
        let _ = tx;
        engine.shutdown();
    }

    #[test]
    fn stale_session_id_rejected() {
        let engine = loop_engine();
        let rx = engine.create_video_rx(0, session_cfg(), None).unwrap();
        engine.destroy_session(rx).unwrap();
        assert!(engine.video_rx_frames(rx).is_err());
        assert!(engine.destroy_session(rx).is_err());
        engine.shutdown();
    }

    #[test]
    fn no_ports_is_invalid() {
        assert!(matches!(
            Engine::new(EngineConfig::default(), BackendResources::default()),
            Err(Error::InvalidArg(_))
        ));
    }
}
