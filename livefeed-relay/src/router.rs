//! Routing point between the ingest and fallback sources

use bytes::Bytes;
use livefeed_core::SourceBranch;

use crate::rtp::RtpHeader;

/// RTP video clock
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// SSRC of the outgoing stream; peers rewrite it per binding
pub const OUTPUT_SSRC: u32 = 0x4C46_4544;

const DEFAULT_FRAME_TICKS: u32 = VIDEO_CLOCK_RATE / 25;

/// Selects which source reaches the fan-out and keeps the outgoing RTP
/// stream continuous across switches.
///
/// After a switch or a resync the active source is held back until its next
/// keyframe; the first forwarded packet then continues the previous sequence
/// numbering and lands one frame after the last forwarded timestamp.
#[derive(Debug)]
pub struct Router {
    active: SourceBranch,
    awaiting_keyframe: bool,
    rebase: bool,
    seq_offset: u16,
    ts_offset: u32,
    next_seq: u16,
    last_ts: Option<u32>,
    frame_ticks: u32,
}

impl Router {
    pub fn new(initial: SourceBranch) -> Self {
        Self {
            active: initial,
            awaiting_keyframe: true,
            rebase: true,
            seq_offset: 0,
            ts_offset: 0,
            next_seq: 0,
            last_ts: None,
            frame_ticks: DEFAULT_FRAME_TICKS,
        }
    }

    #[must_use]
    pub const fn active(&self) -> SourceBranch {
        self.active
    }

    #[must_use]
    pub const fn is_awaiting_keyframe(&self) -> bool {
        self.awaiting_keyframe
    }

    /// Frame interval used when rebasing timestamps
    pub fn set_framerate(&mut self, framerate: u32) {
        if framerate > 0 {
            self.frame_ticks = VIDEO_CLOCK_RATE / framerate;
        }
    }

    /// Returns true if the active source changed
    pub fn select(&mut self, branch: SourceBranch) -> bool {
        if branch == self.active {
            return false;
        }
        self.active = branch;
        self.resync();
        true
    }

    /// Hold the active source until its next keyframe
    pub fn resync(&mut self) {
        self.awaiting_keyframe = true;
        self.rebase = true;
    }

    /// Rewritten packet to forward, or `None` if it must be dropped
    pub fn route(
        &mut self,
        source: SourceBranch,
        packet: &[u8],
        header: &RtpHeader,
        keyframe_start: bool,
    ) -> Option<Bytes> {
        if source != self.active {
            return None;
        }
        if self.awaiting_keyframe {
            if !keyframe_start {
                return None;
            }
            self.awaiting_keyframe = false;
        }

        if self.rebase {
            let base_ts = self
                .last_ts
                .map_or(header.timestamp, |ts| ts.wrapping_add(self.frame_ticks));
            self.seq_offset = self.next_seq.wrapping_sub(header.sequence);
            self.ts_offset = base_ts.wrapping_sub(header.timestamp);
            self.rebase = false;
        }

        let sequence = header.sequence.wrapping_add(self.seq_offset);
        let timestamp = header.timestamp.wrapping_add(self.ts_offset);
        self.next_seq = sequence.wrapping_add(1);
        self.last_ts = Some(timestamp);

        Some(header.rewrite(packet, sequence, timestamp, OUTPUT_SSRC))
    }
}
