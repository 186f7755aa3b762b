//! Integration tests: full TX-to-RX pipelines.
//!
//! The poll-mode loopback driver wires every TX queue straight to the RX
//! queue of the same index, so whole engine pipelines run deterministically
//! with no privileges. One test additionally crosses the real kernel stack
//! over localhost UDP. Frame integrity is checked by SHA-256 digest against
//! what the producer transmitted.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use st2110::arp::StaticNeighbors;
use st2110::backend::{BackendResources, LoopbackDriver, TxPacket};
use st2110::config::{
    EngineConfig, Fps, Packing, Pmd, PortConfig, SessionDest, SessionFlags, VideoFormat,
    VideoSessionConfig,
};
use st2110::engine::Engine;
use st2110::hdr::{MacAddr, PacketHeaders};
use st2110::mempool::MbufPool;
use st2110::pacing::PacingMode;
use st2110::time::SystemClock;
use st2110::video::tx::TxSink;
use st2110::video::{FrameProducer, FrameStatus, TxFrameMeta, VideoRxSession, VideoTxSession};

fn digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn pattern_frame(size: usize, seed: u8) -> Vec<u8> {
    (0..size)
        .map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed))
        .collect()
}

fn video_cfg(width: u32, height: u32, fps: Fps, port: u16) -> VideoSessionConfig {
    VideoSessionConfig {
        dests: vec![SessionDest {
            ip: Ipv4Addr::new(239, 10, 0, 1),
            udp_port: port,
        }],
        payload_type: 112,
        width,
        height,
        fps,
        fmt: VideoFormat::Yuv422_10Bit,
        packing: Packing::Bpm,
        interlaced: false,
        framebuff_cnt: 6,
        linesize: None,
        slice_lines: 0,
        flags: SessionFlags::empty(),
        arp_timeout_ms: 0,
        udp_src_port_base: 30000,
    }
}

struct ListProducer {
    frames: Vec<Vec<u8>>,
    next: usize,
}

impl FrameProducer for ListProducer {
    fn next_frame(&mut self, frame: &mut [u8]) -> Option<TxFrameMeta> {
        let src = self.frames.get(self.next)?;
        frame.copy_from_slice(src);
        self.next += 1;
        Some(TxFrameMeta::default())
    }
}

struct VecSink(Vec<Vec<u8>>);

impl TxSink for VecSink {
    fn send(&mut self, pkts: &mut Vec<TxPacket>) -> st2110::Result<usize> {
        let n = pkts.len();
        for p in pkts.drain(..) {
            self.0.push(p.mbuf.to_wire());
        }
        Ok(n)
    }
}

/// Run a TX session to completion against a collecting sink.
fn transmit_all(cfg: &VideoSessionConfig, frames: Vec<Vec<u8>>, ooo: u32) -> Vec<Vec<u8>> {
    let pool = MbufPool::new("it-tx", 1024, 2048).unwrap();
    let count = frames.len() as u64;
    let mut tx = VideoTxSession::new(
        cfg.clone(),
        pool,
        Box::new(ListProducer { frames, next: 0 }),
        MacAddr([2, 0, 0, 0, 0, 1]),
        Ipv4Addr::new(192, 168, 1, 10),
        &StaticNeighbors::new(),
        Arc::new(SystemClock),
        PacingMode::HwRl,
    )
    .expect("tx session");
    if ooo > 0 {
        tx.set_out_of_order(ooo);
    }
    let mut sink = VecSink(Vec::new());
    while tx.stat_frames_sent.get() < count {
        tx.poll(&mut sink).expect("tx poll");
    }
    sink.0
}

fn rx_all(cfg: &VideoSessionConfig, wires: &[Vec<u8>]) -> Vec<(Vec<u8>, FrameStatus)> {
    let mut rx = VideoRxSession::new(cfg.clone(), Arc::new(SystemClock), None).unwrap();
    for wire in wires {
        let _ = rx.on_packet(wire, 0);
    }
    let ring = rx.frames();
    let mut out = Vec::new();
    while let Some(frame) = ring.try_get_frame() {
        out.push((frame.data.clone(), frame.meta.status));
        ring.put_frame(frame);
    }
    out
}

#[test]
fn engine_pipeline_digest_over_loopback() {
    let driver = Arc::new(LoopbackDriver::new(8));
    let engine = Engine::new(
        EngineConfig {
            ports: vec![PortConfig {
                ifname: "it-loop".into(),
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
    .expect("engine");

    let cfg = video_cfg(64, 16, Fps::P100, 20000);
    let size = cfg.frame_size().unwrap();
    let frames: Vec<Vec<u8>> = (0..4).map(|s| pattern_frame(size, s)).collect();
    let tx_digests: Vec<[u8; 32]> = frames.iter().map(|f| digest(f)).collect();

    let rx = engine.create_video_rx(0, cfg.clone(), None).expect("rx session");
    let _tx = engine
        .create_video_tx(
            0,
            cfg,
            Box::new(ListProducer {
                frames,
                next: 0,
            }),
        )
        .expect("tx session");

    let ring = engine.video_rx_frames(rx).unwrap();
    let mut sha_fail = 0;
    for want in &tx_digests {
        let frame = ring
            .get_frame(Duration::from_secs(5))
            .expect("frame within deadline");
        assert_eq!(frame.meta.status, FrameStatus::Complete);
        if digest(&frame.data) != *want {
            sha_fail += 1;
        }
        ring.put_frame(frame);
    }
    assert_eq!(sha_fail, 0, "pixel digests must match the producer");
    engine.shutdown();
}

#[test]
fn kernel_socket_pipeline_over_localhost() {
    let engine = Engine::new(
        EngineConfig {
            ports: vec![PortConfig {
                ifname: String::new(), // no device bind: plain localhost
                pmd: Pmd::KernelSocket,
                sip_addr: Ipv4Addr::new(127, 0, 0, 1),
                tx_queues_cnt: 4,
                rx_queues_cnt: 4,
                ..Default::default()
            }],
            ..Default::default()
        },
        BackendResources::default(),
    )
    .expect("engine");

    let mut cfg = video_cfg(64, 8, Fps::P100, 42870);
    cfg.dests[0].ip = Ipv4Addr::new(127, 0, 0, 1);
    let size = cfg.frame_size().unwrap();
    let frames: Vec<Vec<u8>> = (0..2).map(|s| pattern_frame(size, s + 40)).collect();
    let tx_digests: Vec<[u8; 32]> = frames.iter().map(|f| digest(f)).collect();

    let rx = engine.create_video_rx(0, cfg.clone(), None).expect("rx session");
    let _tx = engine
        .create_video_tx(0, cfg, Box::new(ListProducer { frames, next: 0 }))
        .expect("tx session");

    let ring = engine.video_rx_frames(rx).unwrap();
    for want in &tx_digests {
        let frame = ring
            .get_frame(Duration::from_secs(5))
            .expect("frame crossed the kernel stack");
        assert_eq!(frame.meta.status, FrameStatus::Complete);
        assert_eq!(digest(&frame.data), *want);
        ring.put_frame(frame);
    }
    engine.shutdown();
}

#[test]
fn out_of_order_emission_still_digests_clean() {
    // S5 shape: permuted emission with bounded swap distance
    let cfg = video_cfg(128, 16, Fps::P50, 20010);
    let size = cfg.frame_size().unwrap();
    let frames: Vec<Vec<u8>> = (0..3).map(|s| pattern_frame(size, s + 90)).collect();
    let wires = transmit_all(&cfg, frames.clone(), 4);

    let delivered = rx_all(&cfg, &wires);
    assert_eq!(delivered.len(), frames.len());
    for ((data, status), want) in delivered.iter().zip(&frames) {
        assert_eq!(*status, FrameStatus::Complete);
        assert_eq!(digest(data), digest(want), "ooo delivery corrupted a frame");
    }
}

#[test]
fn redundant_ports_carry_identical_frames() {
    // S3 shape: one session, two mirrored destinations
    let mut cfg = video_cfg(64, 8, Fps::P50, 20020);
    cfg.dests.push(SessionDest {
        ip: Ipv4Addr::new(239, 10, 0, 2),
        udp_port: 20022,
    });
    let size = cfg.frame_size().unwrap();
    let frames = vec![pattern_frame(size, 11), pattern_frame(size, 12)];
    let wires = transmit_all(&cfg, frames.clone(), 0);

    let mut primary = Vec::new();
    let mut redundant = Vec::new();
    for wire in &wires {
        let hdrs = PacketHeaders::parse(wire).unwrap();
        match hdrs.dst_port {
            20020 => primary.push(wire.clone()),
            20022 => redundant.push(wire.clone()),
            other => panic!("unexpected dst port {other}"),
        }
    }
    assert_eq!(primary.len(), redundant.len());

    let mut cfg_r = cfg.clone();
    cfg_r.dests = vec![cfg.dests[1]];
    let frames_p = rx_all(&cfg, &primary);
    let frames_r = rx_all(&cfg_r, &redundant);
    assert_eq!(frames_p.len(), 2);
    assert_eq!(frames_r.len(), 2);
    for ((a, sa), (b, sb)) in frames_p.iter().zip(&frames_r) {
        assert_eq!(*sa, FrameStatus::Complete);
        assert_eq!(*sb, FrameStatus::Complete);
        assert_eq!(digest(a), digest(b), "ports must carry identical frames");
    }
}

#[test]
fn rtcp_retransmit_recovers_a_lost_packet() {
    // large frame so the NACK cadence (every 128 sequence ids) fires while
    // the damaged frame is still in flight
    let mut cfg = video_cfg(1920, 64, Fps::P50, 20030);
    cfg.flags |= SessionFlags::ENABLE_RTCP;
    let size = cfg.frame_size().unwrap();
    let frames = vec![pattern_frame(size, 77)];

    let pool = MbufPool::new("rtcp-tx", 2048, 2048).unwrap();
    let mut tx = VideoTxSession::new(
        cfg.clone(),
        pool,
        Box::new(ListProducer {
            frames: frames.clone(),
            next: 0,
        }),
        MacAddr([2, 0, 0, 0, 0, 1]),
        Ipv4Addr::new(192, 168, 1, 10),
        &StaticNeighbors::new(),
        Arc::new(SystemClock),
        PacingMode::HwRl,
    )
    .unwrap();
    let mut sink = VecSink(Vec::new());
    while tx.stat_frames_sent.get() < 1 {
        tx.poll(&mut sink).unwrap();
    }
    let wires = sink.0;
    assert!(wires.len() > 130, "need seq 128 inside the frame");

    let mut rx = VideoRxSession::new(cfg, Arc::new(SystemClock), None).unwrap();
    const LOST: usize = 100;
    for (i, wire) in wires.iter().enumerate() {
        if i == LOST {
            continue; // the wire ate this one
        }
        let _ = rx.on_packet(wire, 0);
        // the gap is announced at the seq-128 cadence; route the NACK to
        // the TX engine and the retransmit back into the receiver
        for nack in rx.take_pending_nacks() {
            let mut resent = Vec::new();
            tx.rtcp_mut()
                .unwrap()
                .handle_nack(&nack, |wire| resent.push(wire.to_vec()))
                .expect("nack handled");
            for wire in resent {
                let _ = rx.on_packet(&wire, 0);
            }
        }
    }
    assert_eq!(rx.stat_frames_complete.get(), 1, "retransmit must heal the frame");
    let frame = rx.frames().try_get_frame().unwrap();
    assert_eq!(frame.meta.status, FrameStatus::Complete);
    assert_eq!(digest(&frame.data), digest(&frames[0]));
}

#[test]
fn autodetect_behaves_like_preconfigured_after_convergence() {
    // law: detect converges, then behaves identically to a configured rx
    let cfg = video_cfg(64, 16, Fps::P50, 20040);
    let size = cfg.frame_size().unwrap();
    let frames: Vec<Vec<u8>> = (0..6).map(|s| pattern_frame(size, s + 1)).collect();
    let wires = transmit_all(&cfg, frames.clone(), 0);

    let configured = rx_all(&cfg, &wires);

    let mut detect_cfg = cfg.clone();
    detect_cfg.flags |= SessionFlags::AUTO_DETECT;
    detect_cfg.width = 1920; // wrong on purpose
    detect_cfg.height = 1080;
    detect_cfg.fps = Fps::P59_94;
    let mut rx = VideoRxSession::new(detect_cfg, Arc::new(SystemClock), None).unwrap();
    for wire in &wires {
        let _ = rx.on_packet(wire, 0);
    }
    let ring = rx.frames();
    let mut detected = Vec::new();
    while let Some(frame) = ring.try_get_frame() {
        detected.push((frame.data.clone(), frame.meta.status));
        ring.put_frame(frame);
    }

    // detection consumes the leading frames; everything after matches the
    // preconfigured session frame for frame
    assert!(configured.len() - detected.len() <= 3, "convergence within 3 frames");
    let offset = configured.len() - detected.len();
    for (got, want) in detected.iter().zip(&configured[offset..]) {
        assert_eq!(got.1, FrameStatus::Complete);
        assert_eq!(digest(&got.0), digest(&want.0));
    }
}
