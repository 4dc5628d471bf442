//! Per-request screencopy event record.

use std::time::Duration;

/// Terminal state of one frame request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameOutcome {
    #[default]
    Pending,
    Ready {
        presented_at: Duration,
    },
    Failed,
}

/// `linux_dmabuf` event: the compositor's preferred dmabuf layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmabufOffer {
    pub format: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Everything observed for the frame request currently in flight.
///
/// Reset on every `capture_output`; a request never sees events from the
/// previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameEvents {
    pub dmabuf: Option<DmabufOffer>,
    /// `buffer` event (shm layout): width, height, stride.
    pub shm: Option<(u32, u32, u32)>,
    pub y_inverted: bool,
    pub damage: Vec<DamageRect>,
    pub buffer_done: bool,
    pub outcome: FrameOutcome,
}

impl FrameEvents {
    pub fn is_terminal(&self) -> bool {
        self.outcome != FrameOutcome::Pending
    }

    /// Enough is known to stop probing: a dmabuf format, the end of the
    /// buffer announcements, or a terminal event.
    pub fn probe_settled(&self) -> bool {
        self.dmabuf.is_some() || self.buffer_done || self.is_terminal()
    }
}

/// Presentation time from the `ready` event's split seconds.
pub fn ready_timestamp(tv_sec_hi: u32, tv_sec_lo: u32, tv_nsec: u32) -> Duration {
    let secs = (u64::from(tv_sec_hi) << 32) | u64::from(tv_sec_lo);
    Duration::new(secs, tv_nsec)
}
