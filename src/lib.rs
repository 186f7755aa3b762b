//! # st2110 — SMPTE ST 2110 media-over-IP transport datapath
//!
//! A Rust library for sending and receiving professional media essence
//! over IP networks: uncompressed video (ST 2110-20), ancillary data
//! (ST 2110-40), and fast metadata (ST 2110-41), with NIC-paced,
//! PTP-aligned packet emission and out-of-order-tolerant reassembly.
//!
//! ## Protocol references
//!
//! | RFC / standard | Topic | How this crate uses it |
//! |----------------|-------|------------------------|
//! | [RFC 3550](https://tools.ietf.org/html/rfc3550) | RTP | Fixed header for every stream, SSRC and sequence semantics |
//! | [RFC 4175](https://tools.ietf.org/html/rfc4175) | Uncompressed video RTP payload | SRD packetization and reassembly |
//! | [RFC 8331](https://tools.ietf.org/html/rfc8331) | SMPTE ST 291 ancillary RTP payload | 10-bit UDW packing, parity, checksums |
//! | [RFC 4585](https://tools.ietf.org/html/rfc4585) | RTCP feedback | NACK packet type for the retransmit engine |
//! | SMPTE ST 2110-20/-21/-40/-41 | Media transport | Packing modes, pacing models, essence mapping |
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  Application (producers / consumers)          │
//! ├───────────────────────────────────────────────┤
//! │  Engine      — ports, sessions, schedulers    │
//! │  Sessions    — st20 tx/rx, anc, fast metadata │
//! ├───────────────────────────────────────────────┤
//! │  Shared queues — TSQ/RSQ fan-in/out, SRSS     │
//! │  Pacing / RTCP — departure control, recovery  │
//! ├───────────────────────────────────────────────┤
//! │  Backends   — kernel socket, AF_XDP, RDMA,    │
//! │               poll-mode driver                │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use st2110::backend::{BackendResources, LoopbackDriver};
//! use st2110::config::{EngineConfig, Pmd, PortConfig};
//! use st2110::engine::Engine;
//!
//! let engine = Engine::new(
//!     EngineConfig {
//!         ports: vec![PortConfig {
//!             ifname: "enp1s0".into(),
//!             pmd: Pmd::PollMode,
//!             ..Default::default()
//!         }],
//!         ..Default::default()
//!     },
//!     BackendResources {
//!         poll_driver: Some(Arc::new(LoopbackDriver::new(8))),
//!         ..Default::default()
//!     },
//! )
//! .unwrap();
//! // engine.create_video_tx(...) / engine.create_video_rx(...)
//! ```
//!
//! ## Crate layout
//!
//! - [`engine`] — the [`Engine`](engine::Engine) root object and session
//!   handles.
//! - [`config`] — port, engine, and session configuration.
//! - [`backend`] — the four NIC queue disciplines behind one burst API.
//! - [`queue`] — shared TX/RX queue multiplexers and shared-RSS workers.
//! - [`video`] — ST 2110-20 packetizer, reassembler, and frame rings.
//! - [`ancillary`] / [`fastmetadata`] — ST 2110-40/-41 pipelines.
//! - [`rtcp`] — NACK detection, emission, and retransmit buffering.
//! - [`pacing`] — TSC, hardware-shaper, and launch-time departure control.
//! - [`sched`] — cooperative tasklet schedulers with bandwidth quotas.
//! - [`mempool`] / [`ring`] — packet buffers and SPSC hand-off rings.
//! - [`flow`] — RX classification, [`hdr`] — wire headers and RSS hashing.
//! - [`stats`] — counters and the periodic dump registry.
//! - [`time`] / [`arp`] — PTP clock and neighbor-resolution boundaries.
//! - [`pcap`] — operator-requested pcapng dumps.
//! - [`error`] — the [`Error`](error::Error) enum and `Result` alias.

pub mod ancillary;
pub mod arp;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod fastmetadata;
pub mod flow;
pub mod hdr;
pub mod mempool;
pub mod pacing;
pub mod pcap;
pub mod queue;
pub mod ring;
pub mod rtcp;
pub mod rtp;
pub mod sched;
pub mod stats;
pub mod time;
pub mod video;

pub use config::{EngineConfig, Fps, Packing, SessionFlags, VideoFormat, VideoSessionConfig};
pub use engine::{Engine, SessionId};
pub use error::{Error, Result};
pub use video::{FrameProducer, FrameRing, FrameStatus, RxFrame, VideoRxSession, VideoTxSession};
