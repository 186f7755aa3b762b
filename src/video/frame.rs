//! Frame buffer ring shared between a session and its producer/consumer.
//!
//! Every buffer is in exactly one of three states — FREE (ownable by the
//! session), IN_USER (held by the application), READY (assembled, waiting
//! for pickup). Ownership transfers move the `Vec<u8>` itself, so there is
//! never a moment with two writers. The consumer side supports blocking
//! pickup with a timeout plus an explicit wake, for shutdown.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::Fps;
use crate::config::VideoFormat;
use crate::error::{Error, Result};
use crate::time::TimestampFmt;

/// Completion status a frame is delivered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Every byte arrived and the packet bitmap has no gap.
    Complete,
    /// Delivered with missing regions (opt-in).
    Incomplete,
}

/// Metadata record accompanying every delivered frame.
#[derive(Debug, Clone)]
pub struct RxFrameMeta {
    pub width: u32,
    pub height: u32,
    pub fps: Fps,
    pub fmt: VideoFormat,
    pub frame_total_size: usize,
    pub frame_recv_size: usize,
    /// RTP timestamp of the frame.
    pub rtp_timestamp: u32,
    pub tfmt: TimestampFmt,
    /// Receive time of the first packet (TAI ns).
    pub timestamp_first_pkt: u64,
    /// Receive time of the last packet (TAI ns).
    pub timestamp_last_pkt: u64,
    /// First-packet time offset into the frame epoch.
    pub fpt: u64,
    pub seq_discont: u32,
    pub seq_lost: u32,
    pub second_field: bool,
    pub pkts_recv: u32,
    pub status: FrameStatus,
}

/// A delivered frame; return it with [`FrameRing::put_frame`].
#[derive(Debug)]
pub struct RxFrame {
    pub data: Vec<u8>,
    pub meta: RxFrameMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    InUser,
    Ready,
}

struct RingState {
    free: Vec<Vec<u8>>,
    ready: VecDeque<RxFrame>,
    /// State ledger, one per allocated buffer, for FSM enforcement.
    states: Vec<SlotState>,
    wake_pending: bool,
}

/// Ring of `cnt` frame buffers of `frame_size` bytes.
pub struct FrameRing {
    state: Mutex<RingState>,
    wake: Condvar,
    frame_size: std::sync::atomic::AtomicUsize,
    cnt: u16,
}

impl FrameRing {
    pub fn new(cnt: u16, frame_size: usize) -> Arc<FrameRing> {
        let free = (0..cnt).map(|_| vec![0u8; frame_size]).collect();
        Arc::new(FrameRing {
            state: Mutex::new(RingState {
                free,
                ready: VecDeque::new(),
                states: vec![SlotState::Free; cnt as usize],
                wake_pending: false,
            }),
            wake: Condvar::new(),
            frame_size: std::sync::atomic::AtomicUsize::new(frame_size),
            cnt,
        })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Rebuild every buffer for a new raster geometry, e.g. after
    /// auto-detect corrected the configured size. Consumer handles stay
    /// valid; any frames awaiting pickup are discarded.
    pub fn reinit(&self, frame_size: usize) {
        let mut state = self.state.lock();
        state.free = (0..self.cnt).map(|_| vec![0u8; frame_size]).collect();
        state.ready.clear();
        state.states = vec![SlotState::Free; self.cnt as usize];
        self.frame_size
            .store(frame_size, std::sync::atomic::Ordering::Release);
    }

    pub fn count(&self) -> u16 {
        self.cnt
    }

    /// Session side: take a FREE buffer for assembly.
    pub fn take_free(&self) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        let buf = state.free.pop().ok_or(Error::Busy("no free framebuffer"))?;
        if let Some(s) = state.states.iter_mut().find(|s| **s == SlotState::Free) {
            *s = SlotState::InUser;
        }
        Ok(buf)
    }

    /// Session side: return a taken buffer without delivering it
    /// (incomplete frame with delivery disabled).
    pub fn reclaim(&self, mut buf: Vec<u8>) {
        buf.fill(0);
        let mut state = self.state.lock();
        if let Some(s) = state.states.iter_mut().find(|s| **s == SlotState::InUser) {
            *s = SlotState::Free;
        }
        state.free.push(buf);
    }

    /// Session side: publish an assembled frame and wake a blocked getter.
    pub fn push_ready(&self, frame: RxFrame) {
        let mut state = self.state.lock();
        if let Some(s) = state.states.iter_mut().find(|s| **s == SlotState::InUser) {
            *s = SlotState::Ready;
        }
        state.ready.push_back(frame);
        drop(state);
        self.wake.notify_one();
    }

    /// Consumer side: non-blocking pickup.
    pub fn try_get_frame(&self) -> Option<RxFrame> {
        let mut state = self.state.lock();
        let frame = state.ready.pop_front();
        if frame.is_some()
            && let Some(s) = state.states.iter_mut().find(|s| **s == SlotState::Ready)
        {
            *s = SlotState::InUser;
        }
        frame
    }

    /// Consumer side: blocking pickup with timeout.
    ///
    /// Returns `None` on timeout or when [`wake_block`](Self::wake_block)
    /// fired with nothing ready.
    pub fn get_frame(&self, timeout: Duration) -> Option<RxFrame> {
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = state.ready.pop_front() {
                if let Some(s) = state.states.iter_mut().find(|s| **s == SlotState::Ready)
                {
                    *s = SlotState::InUser;
                }
                return Some(frame);
            }
            if state.wake_pending {
                state.wake_pending = false;
                return None;
            }
            if self.wake.wait_for(&mut state, timeout).timed_out() {
                return None;
            }
        }
    }

    /// Unblock a waiting [`get_frame`](Self::get_frame), e.g. at shutdown.
    pub fn wake_block(&self) {
        self.state.lock().wake_pending = true;
        self.wake.notify_all();
    }

    /// Consumer side: hand the buffer back after use.
    pub fn put_frame(&self, frame: RxFrame) {
        self.reclaim(frame.data);
    }

    /// Buffers currently FREE.
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Frames waiting for pickup.
    pub fn ready_count(&self) -> usize {
        self.state.lock().ready.len()
    }
}
