//! PTP time source boundary and media-clock conversions.
//!
//! The PTP engine itself is an external collaborator; the datapath only
//! consumes "read time" through [`PtpSource`]. Frame departure is aligned to
//! epochs: integer multiples of the frame period since the PTP origin
//! (ST 2059-1 alignment).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{Fps, VIDEO_CLOCK_RATE};

/// Timestamp format carried in frame metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampFmt {
    /// Absolute TAI nanoseconds.
    Tai,
    /// Raw 90 kHz media-clock ticks.
    MediaClk,
}

/// Read-only PTP time access consumed by the datapath.
///
/// Implementations must be cheap and callable from hot loops.
pub trait PtpSource: Send + Sync {
    /// Current TAI time in nanoseconds.
    fn time_ns(&self) -> u64;
}

/// Shared handle to a time source.
pub type Clock = Arc<dyn PtpSource>;

/// System realtime clock fallback; used when no PTP engine is attached.
#[derive(Debug, Default)]
pub struct SystemClock;

impl PtpSource for SystemClock {
    fn time_ns(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// Truncate absolute TAI nanoseconds to a 32-bit 90 kHz media timestamp.
pub fn tai_to_media_clk(tai_ns: u64) -> u32 {
    let ticks = (tai_ns as u128) * (VIDEO_CLOCK_RATE as u128) / 1_000_000_000u128;
    ticks as u32
}

/// Epoch index containing `tai_ns` for the given cadence.
pub fn epoch_of(tai_ns: u64, fps: Fps) -> u64 {
    tai_ns / fps.frame_time_ns()
}

/// TAI nanoseconds at which the given epoch begins.
pub fn epoch_time_ns(epoch: u64, fps: Fps) -> u64 {
    epoch * fps.frame_time_ns()
}

/// Next epoch boundary at or after `tai_ns`.
///
/// TX sessions schedule the first packet of a frame at this boundary so
/// that receivers observe narrow-pacing alignment.
pub fn next_epoch_ns(tai_ns: u64, fps: Fps) -> u64 {
    let frame = fps.frame_time_ns();
    tai_ns.div_ceil(frame) * frame
}
