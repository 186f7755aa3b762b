//! Transmit pacing.
//!
//! Three ways to keep packets on their narrow-pacing schedule:
//!
//! - **TSC**: software. The session computes each packet's departure time
//!   from the frame epoch and busy-waits (sleeping for the coarse part)
//!   until the deadline before handing the burst to the backend.
//! - **Hardware rate limit**: the backend installs a per-queue shaper at
//!   the session's byte rate; bursts leave as fast as the session produces
//!   and the NIC spreads them.
//! - **Launch time**: each packet carries an absolute departure timestamp
//!   the NIC honors.
//!
//! Auto-selection prefers the hardware shaper when the port advertises
//! one, otherwise TSC. Launch time is only used on explicit request since
//! few drivers report the offload.

use std::time::Duration;

use crate::backend::PortCaps;
use crate::config::Fps;
use crate::time::Clock;

/// Pacing discipline of one TX session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingMode {
    Tsc,
    HwRl,
    LaunchTime,
}

/// Pick the pacing mode for a port.
pub fn select_pacing(caps: PortCaps, requested: Option<PacingMode>) -> PacingMode {
    match requested {
        Some(PacingMode::LaunchTime) if caps.contains(PortCaps::LAUNCH_TIME) => {
            PacingMode::LaunchTime
        }
        Some(PacingMode::HwRl) if caps.contains(PortCaps::HW_RATE_LIMIT) => PacingMode::HwRl,
        Some(PacingMode::Tsc) => PacingMode::Tsc,
        Some(other) => {
            tracing::warn!(?other, "requested pacing unsupported, falling back to tsc");
            PacingMode::Tsc
        }
        None => {
            if caps.contains(PortCaps::HW_RATE_LIMIT) {
                PacingMode::HwRl
            } else {
                PacingMode::Tsc
            }
        }
    }
}

/// Departure schedule of one video frame.
///
/// `trs` (time between packets) spreads the frame's packets evenly across
/// the frame period, the ST 2110-21 narrow-gapped model.
#[derive(Debug, Clone)]
pub struct PacerState {
    frame_time_ns: u64,
    trs_ns: f64,
}

impl PacerState {
    pub fn new(fps: Fps, pkts_per_frame: u32) -> Self {
        let frame_time_ns = fps.frame_time_ns();
        Self {
            frame_time_ns,
            trs_ns: frame_time_ns as f64 / pkts_per_frame.max(1) as f64,
        }
    }

    pub fn frame_time_ns(&self) -> u64 {
        self.frame_time_ns
    }

    /// Absolute departure time of packet `idx` in the frame starting at
    /// `epoch_ns`.
    pub fn packet_time(&self, epoch_ns: u64, idx: u32) -> u64 {
        epoch_ns + (self.trs_ns * idx as f64) as u64
    }

    /// Session byte rate for the hardware shaper, headers included.
    pub fn bytes_per_sec(&self, pkts_per_frame: u32, pkt_wire_bytes: u32, fps: Fps) -> u64 {
        (pkts_per_frame as f64 * pkt_wire_bytes as f64 * fps.rate()) as u64
    }
}

/// Software pacer: sleep for the coarse part, spin out the rest.
pub struct TscPacer {
    clock: Clock,
}

/// Below this distance the pacer spins instead of sleeping.
const SPIN_THRESHOLD_NS: u64 = 100_000;

impl TscPacer {
    pub fn new(clock: Clock) -> Self {
        Self { clock }
    }

    pub fn now_ns(&self) -> u64 {
        self.clock.time_ns()
    }

    /// Block until `deadline_ns`; returns immediately when already past.
    pub fn pace_until(&self, deadline_ns: u64) {
        loop {
            let now = self.clock.time_ns();
            if now >= deadline_ns {
                return;
            }
            let remain = deadline_ns - now;
            if remain > SPIN_THRESHOLD_NS {
                std::thread::sleep(Duration::from_nanos(remain - SPIN_THRESHOLD_NS / 2));
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemClock;
    use std::sync::Arc;

    #[test]
    fn auto_select_prefers_hw_rl() {
        assert_eq!(
            select_pacing(PortCaps::HW_RATE_LIMIT, None),
            PacingMode::HwRl
        );
        assert_eq!(select_pacing(PortCaps::empty(), None), PacingMode::Tsc);
    }

    #[test]
    fn launch_time_requires_capability() {
        assert_eq!(
            select_pacing(PortCaps::LAUNCH_TIME, Some(PacingMode::LaunchTime)),
            PacingMode::LaunchTime
        );
        assert_eq!(
            select_pacing(PortCaps::empty(), Some(PacingMode::LaunchTime)),
            PacingMode::Tsc
        );
    }

    #[test]
    fn packet_times_span_the_frame() {
        let pacer = PacerState::new(Fps::P50, 2000);
        let epoch = 1_000_000_000;
        assert_eq!(pacer.packet_time(epoch, 0), epoch);
        let last = pacer.packet_time(epoch, 1999);
        let frame_end = epoch + pacer.frame_time_ns();
        assert!(last < frame_end);
        assert!(last > frame_end - 2 * (pacer.frame_time_ns() / 2000));
    }

    #[test]
    fn packet_times_monotonic() {
        let pacer = PacerState::new(Fps::P59_94, 4320);
        let epoch = 5_000_000;
        let mut prev = 0;
        for idx in 0..4320 {
            let t = pacer.packet_time(epoch, idx);
            assert!(t >= prev);
            prev = t;
        }
    }

    #[test]
    fn shaper_rate_matches_wire_load() {
        let pacer = PacerState::new(Fps::P50, 2000);
        // 2000 pkts x 1302 bytes x 50 fps
        let rate = pacer.bytes_per_sec(2000, 1302, Fps::P50);
        assert_eq!(rate, 2000 * 1302 * 50);
    }

    #[test]
    fn pace_until_blocks_to_deadline() {
        let pacer = TscPacer::new(Arc::new(SystemClock));
        let start = pacer.now_ns();
        pacer.pace_until(start + 2_000_000);
        assert!(pacer.now_ns() >= start + 2_000_000);
    }
}
