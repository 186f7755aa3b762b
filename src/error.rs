//! Error types for the ST 2110 transport library.

use std::fmt;

/// Errors that can occur in the transport datapath.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Resource exhaustion**: [`NoBuffer`](Self::NoBuffer),
///   [`Busy`](Self::Busy) — never fatal, the caller retries or drops.
/// - **Session creation**: [`InvalidArg`](Self::InvalidArg) — the session
///   is not created.
/// - **Backend**: [`Permission`](Self::Permission),
///   [`DriverFatal`](Self::DriverFatal).
/// - **Peer**: [`Unreachable`](Self::Unreachable) — neighbor resolution
///   did not complete within the configured timeout.
/// - **Wire**: [`WireIntegrity`](Self::WireIntegrity) — the offending
///   packet is dropped and counted, the frame kept where possible.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No free mbuf, queue, or session slot.
    #[error("out of buffers: {0}")]
    NoBuffer(&'static str),

    /// A ring is full or a lock is contended; retry later.
    #[error("busy: {0}")]
    Busy(&'static str),

    /// Rejected at creation time; the session/queue was not created.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// The privileged path was refused and no degraded path remains.
    #[error("permission denied: {0}")]
    Permission(&'static str),

    /// Destination could not be resolved to a MAC within the timeout.
    #[error("peer unreachable: {0}")]
    Unreachable(&'static str),

    /// Malformed or corrupt packet content.
    #[error("wire integrity: {kind}")]
    WireIntegrity { kind: IntegrityErrorKind },

    /// The NIC queue is wedged; routed around by the shared-queue allocator.
    #[error("driver fatal on queue {queue}")]
    DriverFatal { queue: u16 },

    /// Lookup against a flow, session, or queue that does not exist.
    #[error("not found: {0}")]
    NotFound(&'static str),
}

/// Specific kind of wire-integrity failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityErrorKind {
    /// RTP header shorter than 12 bytes or wrong version.
    MalformedRtp,
    /// 10-bit user data word failed its parity check.
    UdwParity,
    /// ANC sub-packet checksum mismatch.
    AncChecksum,
    /// An SRD's computed end exceeds the frame size.
    FrameOverrun,
    /// RTP sequence id outside the retransmit window.
    SeqOutOfWindow,
    /// RTCP packet without the expected flags or name tag.
    BadRtcp,
}

impl fmt::Display for IntegrityErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedRtp => write!(f, "malformed RTP"),
            Self::UdwParity => write!(f, "UDW parity failure"),
            Self::AncChecksum => write!(f, "ANC checksum mismatch"),
            Self::FrameOverrun => write!(f, "SRD exceeds frame size"),
            Self::SeqOutOfWindow => write!(f, "sequence id out of window"),
            Self::BadRtcp => write!(f, "bad RTCP packet"),
        }
    }
}

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
