//! Raster auto-detection.
//!
//! An RX session created with `AUTO_DETECT` inspects arriving packets
//! instead of trusting its configured geometry: SRD extents give the
//! raster width and height, and the timestamp delta between frame markers
//! identifies the cadence. The pixel format stays configured — the wire
//! carries bytes, not group shapes. Packets consumed during detection are
//! discarded; convergence takes two frame boundaries, after which the
//! session behaves exactly like one configured up front.

use crate::config::{Fps, VideoFormat};

use super::rfc4175::VideoPacketHeader;

/// What detection concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectMeta {
    pub width: u32,
    pub height: u32,
    pub fps: Fps,
    pub fmt: VideoFormat,
    pub interlaced: bool,
}

/// Consumer overrides returned from the detect callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectReply {
    /// Override the slice callback granularity.
    pub slice_lines: Option<u32>,
    /// User frame size for downstream conversion layers.
    pub uframe_size: Option<usize>,
}

/// Callback invoked once detection converges; the reply tunes the session.
pub type DetectCallback = Box<dyn FnMut(&DetectMeta) -> DetectReply + Send>;

pub(crate) struct Detector {
    fmt: VideoFormat,
    max_row: u16,
    /// Largest pixel offset seen at the start of an SRD.
    max_offset_px: u32,
    /// Byte length of the SRD observed at that largest offset.
    tail_bytes: u32,
    interlaced: bool,
    last_marker_ts: Option<u32>,
    ts_delta: Option<u32>,
    markers_seen: u32,
}

impl Detector {
    pub fn new(fmt: VideoFormat) -> Self {
        Self {
            fmt,
            max_row: 0,
            max_offset_px: 0,
            tail_bytes: 0,
            interlaced: false,
            last_marker_ts: None,
            ts_delta: None,
            markers_seen: 0,
        }
    }

    /// Feed one packet; returns the conclusion once stable.
    pub fn feed(&mut self, hdr: &VideoPacketHeader) -> Option<DetectMeta> {
        for srd in std::iter::once(&hdr.srd).chain(hdr.srd2.as_ref()) {
            self.max_row = self.max_row.max(srd.row_number);
            if srd.field {
                self.interlaced = true;
            }
            let off = srd.row_offset as u32;
            if off > self.max_offset_px {
                self.max_offset_px = off;
                self.tail_bytes = srd.length as u32;
            } else if off == self.max_offset_px {
                self.tail_bytes = self.tail_bytes.max(srd.length as u32);
            }
        }
        if hdr.rtp.marker {
            if let Some(last) = self.last_marker_ts {
                self.ts_delta = Some(hdr.rtp.timestamp.wrapping_sub(last));
            }
            self.last_marker_ts = Some(hdr.rtp.timestamp);
            self.markers_seen += 1;
        }
        self.conclude()
    }

    fn conclude(&self) -> Option<DetectMeta> {
        // need two frame boundaries for a trustworthy cadence
        if self.markers_seen < 2 {
            return None;
        }
        let fps = Fps::from_media_clk_delta(self.ts_delta?)?;
        let lines = self.max_row as u32 + 1;
        let height = if self.interlaced { lines * 2 } else { lines };
        let width = self.max_offset_px
            + self.tail_bytes * self.fmt.pg_coverage() / self.fmt.pg_size();
        if width == 0 || height == 0 {
            return None;
        }
        Some(DetectMeta {
            width,
            height,
            fps,
            fmt: self.fmt,
            interlaced: self.interlaced,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::RtpHeader;
    use crate::video::rfc4175::Srd;

    fn pkt(row: u16, off_px: u16, len: u16, marker: bool, ts: u32) -> VideoPacketHeader {
        VideoPacketHeader {
            rtp: RtpHeader {
                marker,
                payload_type: 112,
                sequence: 0,
                timestamp: ts,
                ssrc: 1,
            },
            ext_seq: 0,
            srd: Srd {
                length: len,
                field: false,
                row_number: row,
                row_offset: off_px,
            },
            srd2: None,
        }
    }

    #[test]
    fn detects_single_srd_raster() {
        let mut det = Detector::new(VideoFormat::Yuv422_10Bit);
        // 64px yuv422-10: 160-byte lines, one packet per line
        let ts0 = 90_000;
        let ts1 = ts0 + Fps::P50.media_clk_per_frame();
        for frame_ts in [ts0, ts1] {
            for row in 0..8u16 {
                let meta = det.feed(&pkt(row, 0, 160, row == 7, frame_ts));
                if frame_ts == ts1 && row == 7 {
                    let meta = meta.expect("converged after second marker");
                    assert_eq!(meta.width, 64);
                    assert_eq!(meta.height, 8);
                    assert_eq!(meta.fps, Fps::P50);
                    assert!(!meta.interlaced);
                    return;
                }
                assert!(meta.is_none());
            }
        }
        panic!("never converged");
    }

    #[test]
    fn detects_multi_packet_lines() {
        let mut det = Detector::new(VideoFormat::Yuv422_10Bit);
        // 1920px lines split in 4: offsets 0/480/960/1440 px, 1200 bytes each
        let deltas = Fps::P59_94.media_clk_per_frame();
        for f in 0..2u32 {
            let ts = 1000 + f * deltas;
            for row in 0..4u16 {
                for part in 0..4u16 {
                    let marker = row == 3 && part == 3;
                    assert!(
                        det.feed(&pkt(row, part * 480, 1200, marker, ts)).is_none()
                            || (f == 1 && marker)
                    );
                }
            }
        }
        let meta = det
            .feed(&pkt(0, 0, 1200, false, 2000 + 2 * deltas))
            .expect("already converged, any packet reports");
        assert_eq!(meta.width, 1920);
        assert_eq!(meta.height, 4);
        assert_eq!(meta.fps, Fps::P59_94);
    }

    #[test]
    fn no_conclusion_from_one_frame() {
        let mut det = Detector::new(VideoFormat::Yuv422_10Bit);
        for row in 0..8u16 {
            assert!(det.feed(&pkt(row, 0, 160, row == 7, 1000)).is_none());
        }
    }
}
