//! ST 2110-20 uncompressed video sessions.
//!
//! - [`rfc4175`] — the RFC 4175 packet header codec.
//! - [`tx`] — frame-to-packet serializer with BPM/GPM/GPM_SL packing and
//!   narrow pacing.
//! - [`rx`] — packet-to-frame reassembler with out-of-order tolerance.
//! - [`frame`] — the FREE/IN_USER/READY frame buffer ring.
//! - [`detect`] — raster auto-detection for unconfigured receivers.

pub mod detect;
pub mod frame;
pub mod rfc4175;
pub mod rx;
pub mod tx;

pub use detect::{DetectCallback, DetectMeta, DetectReply};
pub use frame::{FrameRing, FrameStatus, RxFrame, RxFrameMeta};
pub use rx::{SliceCallback, SliceMeta, VideoRxSession};
pub use tx::{FrameProducer, PacketGeometry, TxDoneMeta, TxFrameMeta, VideoTxSession};
