//! Zero-copy Wayland output mirroring.
//!
//! Captures one compositor output into a GPU buffer shared with the
//! renderer's EGL context via dmabuf. The renderer drives
//! [`pipeline::CapturePipeline`] and samples the returned texture.

pub mod allocator;
pub mod bridge;
pub mod config;
pub mod error;
pub mod format;
pub mod logging;
pub mod pipeline;
pub mod session;

pub use config::CaptureConfig;
pub use error::{CaptureError, CaptureResult, ErrorClass};
pub use pipeline::{CapturePipeline, CapturedFrame, WaylandPipeline};
pub use wl_targets::{OutputId, OutputInfo};

use session::{CompositorSession, Negotiated, SessionOptions, WaylandCompositor};

/// Enumerate the compositor's outputs. Needs no GPU or GL context.
pub fn list_outputs() -> CaptureResult<Vec<OutputInfo>> {
    let mut session = CompositorSession::new(WaylandCompositor::new(), SessionOptions::default());
    let outputs = session.list_outputs();
    session.shutdown();
    outputs
}

/// Negotiate geometry and format for the configured output without
/// allocating anything.
pub fn probe(config: &CaptureConfig) -> CaptureResult<(OutputInfo, Negotiated)> {
    let options = SessionOptions {
        overlay_cursor: config.overlay_cursor,
        fallback_fourcc: config.fallback_fourcc(),
    };
    let mut session = CompositorSession::new(WaylandCompositor::new(), options);

    let result = session
        .discover(config.output_name.as_deref())
        .and_then(|output| session.probe().map(|negotiated| (output, negotiated)));
    session.abandon_probe();
    session.shutdown();
    result
}
