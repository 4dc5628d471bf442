//! Compositor session.
//!
//! Owns the compositor connection and runs the screencopy state machine:
//!
//! ```text
//! Disconnected --connect--> Discovering --probe--> Probing
//!                                                    |
//!                                      complete_probe v
//!        ShutDown <--shutdown-- Steady <--capture--> Steady
//!                                 |
//!                          failed v
//!                               Failed
//! ```
//!
//! The only blocking points are the `drive_until` calls while probing and
//! while waiting for a frame's terminal event.

pub mod drive;
pub mod frame;
pub mod wayland;

pub use drive::{BlockingDrive, Drive, EventPump};
pub use frame::{DamageRect, DmabufOffer, FrameEvents, FrameOutcome};
pub use wayland::{WaylandBuffer, WaylandCompositor};

use std::fmt;
use std::time::Duration;

use wl_targets::OutputInfo;

use crate::bridge::PlaneExport;
use crate::error::{CaptureError, CaptureResult};
use crate::format::{resolve_reported_format, FrameFormat, MOD_INVALID, XRGB8888};

pub const WL_OUTPUT_VERSION: u32 = 2;
pub const SCREENCOPY_VERSION: u32 = 3;
pub const LINUX_DMABUF_VERSION: u32 = 4;
pub const XDG_OUTPUT_VERSION: u32 = 2;

/// Check an offered global version against the minimum we bind.
pub fn require_version(
    interface: &'static str,
    offered: Option<u32>,
    required: u32,
) -> CaptureResult<u32> {
    match offered {
        Some(version) if version >= required => {
            log::debug!("[SESSION] Binding {} v{} (offered v{})", interface, required, version);
            Ok(required)
        }
        Some(version) => {
            log::warn!(
                "[SESSION] {} offered at v{}, v{} required",
                interface,
                version,
                required
            );
            Err(CaptureError::MissingProtocol {
                interface,
                required,
                offered: format!("v{}", version),
            })
        }
        None => Err(CaptureError::MissingProtocol {
            interface,
            required,
            offered: "none".to_string(),
        }),
    }
}

/// Compositor-side protocol operations the session drives.
pub trait Compositor: EventPump {
    /// Compositor-side handle wrapping the shared buffer.
    type Buffer;

    fn connect(&mut self) -> CaptureResult<()>;

    /// Bind every output and report its metadata.
    fn list_outputs(&mut self) -> CaptureResult<Vec<OutputInfo>>;

    /// Bind the capture managers and one output.
    fn discover(&mut self, output: Option<&str>) -> CaptureResult<OutputInfo>;

    /// Start a new frame request; resets the event record.
    fn capture_output(&mut self, overlay_cursor: bool) -> CaptureResult<()>;

    fn frame_events(&self) -> &FrameEvents;

    /// Ask the compositor to copy the pending frame into `buffer`.
    fn copy(&mut self, buffer: &Self::Buffer) -> CaptureResult<()>;

    /// Destroy the current frame request, if any.
    fn finish_frame(&mut self);

    /// Wrap exported planes as a compositor buffer.
    fn create_buffer(
        &mut self,
        planes: &[PlaneExport],
        width: u32,
        height: u32,
        format: FrameFormat,
    ) -> CaptureResult<Self::Buffer>;

    /// Release every protocol object and the connection. Idempotent.
    fn disconnect(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Discovering,
    Probing,
    Steady,
    Failed,
    ShutDown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Discovering => "discovering",
            SessionState::Probing => "probing",
            SessionState::Steady => "steady",
            SessionState::Failed => "failed",
            SessionState::ShutDown => "shut down",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub overlay_cursor: bool,
    /// Substituted when the compositor reports format 0.
    pub fallback_fourcc: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            overlay_cursor: false,
            fallback_fourcc: XRGB8888,
        }
    }
}

/// Geometry and format fixed by the probe for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
}

/// Metadata of one completed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub y_inverted: bool,
    pub presented_at: Duration,
    /// Blocking dispatch iterations spent waiting for the terminal event.
    pub dispatches: usize,
}

/// Screencopy state machine over a [`Compositor`].
pub struct CompositorSession<C: Compositor, D: Drive = BlockingDrive> {
    compositor: C,
    drive: D,
    options: SessionOptions,
    state: SessionState,
    output: Option<OutputInfo>,
    negotiated: Option<Negotiated>,
}

impl<C: Compositor> CompositorSession<C, BlockingDrive> {
    pub fn new(compositor: C, options: SessionOptions) -> Self {
        Self::with_drive(compositor, BlockingDrive, options)
    }
}

impl<C: Compositor, D: Drive> CompositorSession<C, D> {
    pub fn with_drive(compositor: C, drive: D, options: SessionOptions) -> Self {
        Self {
            compositor,
            drive,
            options,
            state: SessionState::Disconnected,
            output: None,
            negotiated: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn output(&self) -> Option<&OutputInfo> {
        self.output.as_ref()
    }

    pub fn negotiated(&self) -> Option<Negotiated> {
        self.negotiated
    }

    pub fn compositor(&self) -> &C {
        &self.compositor
    }

    pub fn compositor_mut(&mut self) -> &mut C {
        &mut self.compositor
    }

    fn expect_state(&self, expected: SessionState) -> CaptureResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            log::debug!("[SESSION] Expected state {}, in {}", expected, self.state);
            Err(CaptureError::NotInitialized)
        }
    }

    /// Drop any pending request and move to `Failed`.
    fn fail(&mut self, err: CaptureError) -> CaptureError {
        self.compositor.finish_frame();
        self.state = SessionState::Failed;
        err
    }

    /// [`Self::fail`] for errors raised before `Steady`.
    fn fail_setup(&mut self, err: CaptureError) -> CaptureError {
        self.fail(err.during_setup())
    }

    pub fn connect(&mut self) -> CaptureResult<()> {
        self.expect_state(SessionState::Disconnected)?;
        match self.compositor.connect() {
            Ok(()) => {
                self.state = SessionState::Discovering;
                Ok(())
            }
            Err(e) => Err(self.fail_setup(e)),
        }
    }

    /// Connect if needed and enumerate outputs.
    pub fn list_outputs(&mut self) -> CaptureResult<Vec<OutputInfo>> {
        if self.state == SessionState::Disconnected {
            self.connect()?;
        }
        self.expect_state(SessionState::Discovering)?;
        self.compositor
            .list_outputs()
            .map_err(CaptureError::during_setup)
    }

    /// Connect if needed, then bind the managers and the target output.
    pub fn discover(&mut self, output: Option<&str>) -> CaptureResult<OutputInfo> {
        if self.state == SessionState::Disconnected {
            self.connect()?;
        }
        self.expect_state(SessionState::Discovering)?;

        match self.compositor.discover(output) {
            Ok(info) => {
                log::info!(
                    "[SESSION] Capturing output {} ({}x{})",
                    info.display_name(),
                    info.mode.width,
                    info.mode.height
                );
                self.output = Some(info.clone());
                Ok(info)
            }
            Err(e) => Err(self.fail_setup(e)),
        }
    }

    /// First frame request, without a buffer, to learn geometry and format.
    ///
    /// The request stays pending; follow with [`Self::complete_probe`] or
    /// [`Self::abandon_probe`].
    pub fn probe(&mut self) -> CaptureResult<Negotiated> {
        self.expect_state(SessionState::Discovering)?;
        if self.output.is_none() {
            return Err(CaptureError::NotInitialized);
        }
        self.state = SessionState::Probing;

        if let Err(e) = self.compositor.capture_output(self.options.overlay_cursor) {
            return Err(self.fail_setup(e));
        }
        let dispatches = match self
            .drive
            .drive_until(&mut self.compositor, |c| c.frame_events().probe_settled())
        {
            Ok(n) => n,
            Err(e) => return Err(self.fail_setup(e)),
        };

        let events = self.compositor.frame_events();
        if events.outcome == FrameOutcome::Failed {
            log::error!("[SESSION] Compositor failed the probe frame");
            return Err(self.fail(CaptureError::CaptureFailed(
                "compositor failed the probe frame".to_string(),
            )));
        }
        let offer = match events.dmabuf {
            Some(offer) => offer,
            None => return Err(self.fail(CaptureError::DmabufUnavailable)),
        };
        if let Some((w, h, stride)) = events.shm {
            log::debug!("[SESSION] shm layout offered: {}x{} stride={}", w, h, stride);
        }
        if offer.width == 0 || offer.height == 0 {
            return Err(self.fail(CaptureError::InvalidGeometry {
                width: offer.width as i64,
                height: offer.height as i64,
            }));
        }

        let fourcc = resolve_reported_format(offer.format, self.options.fallback_fourcc);
        if fourcc != offer.format {
            log::warn!("[SESSION] Compositor reported format 0, using fallback");
        }
        let negotiated = Negotiated {
            width: offer.width,
            height: offer.height,
            format: FrameFormat::new(fourcc, MOD_INVALID),
        };
        log::info!(
            "[SESSION] Negotiated {}x{} {} after {} dispatch(es)",
            negotiated.width,
            negotiated.height,
            negotiated.format,
            dispatches
        );
        self.negotiated = Some(negotiated);
        Ok(negotiated)
    }

    /// Copy the pending probe frame into `buffer` and enter `Steady`.
    pub fn complete_probe(&mut self, buffer: &C::Buffer) -> CaptureResult<FrameInfo> {
        self.expect_state(SessionState::Probing)?;
        if self.negotiated.is_none() {
            return Err(self.fail(CaptureError::NotInitialized));
        }
        if let Err(e) = self.compositor.copy(buffer) {
            return Err(self.fail_setup(e));
        }
        let info = self.wait_for_frame().map_err(CaptureError::during_setup)?;
        self.state = SessionState::Steady;
        Ok(info)
    }

    /// Drop the pending probe request without copying.
    pub fn abandon_probe(&mut self) {
        if self.state == SessionState::Probing {
            self.compositor.finish_frame();
            self.state = SessionState::Discovering;
        }
    }

    /// One steady-state request: capture, copy into `buffer`, wait.
    pub fn capture(&mut self, buffer: &C::Buffer) -> CaptureResult<FrameInfo> {
        self.expect_state(SessionState::Steady)?;

        if let Err(e) = self.compositor.capture_output(self.options.overlay_cursor) {
            return Err(self.fail(e));
        }
        if let Err(e) = self.compositor.copy(buffer) {
            return Err(self.fail(e));
        }
        self.wait_for_frame()
    }

    fn wait_for_frame(&mut self) -> CaptureResult<FrameInfo> {
        let dispatches = match self
            .drive
            .drive_until(&mut self.compositor, |c| c.frame_events().is_terminal())
        {
            Ok(n) => n,
            Err(e) => return Err(self.fail(e)),
        };

        let events = self.compositor.frame_events();
        let outcome = events.outcome;
        let y_inverted = events.y_inverted;
        for rect in &events.damage {
            log::trace!(
                "[SESSION] Damage {},{} {}x{}",
                rect.x,
                rect.y,
                rect.width,
                rect.height
            );
        }
        if let (Some(offer), Some(fixed)) = (events.dmabuf, self.negotiated) {
            if (offer.width, offer.height) != (fixed.width, fixed.height) {
                log::warn!(
                    "[SESSION] Output is now {}x{}, capture stays {}x{}",
                    offer.width,
                    offer.height,
                    fixed.width,
                    fixed.height
                );
            }
        }
        self.compositor.finish_frame();

        match outcome {
            FrameOutcome::Ready { presented_at } => Ok(FrameInfo {
                y_inverted,
                presented_at,
                dispatches,
            }),
            FrameOutcome::Failed => {
                log::error!("[SESSION] Compositor reported capture failure");
                Err(self.fail(CaptureError::CaptureFailed(
                    "compositor sent failed for the frame request".to_string(),
                )))
            }
            FrameOutcome::Pending => Err(self.fail(CaptureError::Dispatch(
                "frame wait ended without a terminal event".to_string(),
            ))),
        }
    }

    /// Wrap the shared buffer's planes on the compositor side.
    pub fn create_buffer(
        &mut self,
        planes: &[PlaneExport],
        width: u32,
        height: u32,
        format: FrameFormat,
    ) -> CaptureResult<C::Buffer> {
        self.compositor.create_buffer(planes, width, height, format)
    }

    /// Release every protocol object and the connection. Idempotent.
    pub fn shutdown(&mut self) {
        if self.state == SessionState::ShutDown {
            return;
        }
        self.compositor.finish_frame();
        self.compositor.disconnect();
        self.state = SessionState::ShutDown;
        log::debug!("[SESSION] Session shut down");
    }
}
