//! Frame cycle controller.
//!
//! Three calls for the render loop: [`CapturePipeline::init`] once,
//! [`CapturePipeline::next_frame`] per rendered frame, and
//! [`CapturePipeline::shutdown`]. One buffer is allocated and imported at
//! init; every later frame is the compositor overwriting that same buffer,
//! so the texture id never changes.
//!
//! Frames are strictly sequential: `next_frame` returns only after the
//! request's terminal event, and there is no pipelining.
//!
//! ## Setup order
//!
//! ```text
//! discover -> probe -> open device -> GBM context -> allocate (ladder)
//!          -> export planes -> wl_buffer -> EGL image + texture
//!          -> copy probe frame -> Steady
//! ```
//!
//! Any failure tears down whatever was acquired so far before the error is
//! returned.

#[cfg(test)]
pub mod mock;

use std::time::Duration;

use wl_targets::OutputInfo;

use crate::allocator::{
    allocate_with_ladder, AllocationFailure, AllocationStrategy, AllocatorFactory, BufferSpec,
    FactoryBuffer, GbmAllocatorFactory, ALLOCATION_LADDER,
};
use crate::bridge::{
    import_as_image, into_allocated, AllocatedBuffer, EglImporter, ImageImporter, ImportedImage,
    PlaneSource,
};
use crate::config::CaptureConfig;
use crate::error::{CaptureError, CaptureResult};
use crate::format::{FrameFormat, MOD_INVALID};
use crate::session::{
    Compositor, CompositorSession, SessionOptions, SessionState, WaylandCompositor,
};

/// What the renderer gets for each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedFrame {
    /// Sampling handle. Owned by the pipeline; never delete it.
    pub texture: u32,
    pub width: u32,
    pub height: u32,
    /// Rows arrive bottom-up; flip when sampling.
    pub y_inverted: bool,
    pub presented_at: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineOptions {
    pub session: SessionOptions,
    /// Advertise the buffer's real modifier instead of the implicit one.
    pub explicit_modifier: bool,
}

impl From<&CaptureConfig> for PipelineOptions {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            session: SessionOptions {
                overlay_cursor: config.overlay_cursor,
                fallback_fourcc: config.fallback_fourcc(),
            },
            explicit_modifier: config.explicit_modifier,
        }
    }
}

/// How the shared buffer was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationSummary {
    pub strategy: AllocationStrategy,
    pub failures: Vec<AllocationFailure>,
}

/// Owns every capture resource. Field order is teardown order.
pub struct CapturePipeline<C, F, I>
where
    C: Compositor,
    F: AllocatorFactory,
    I: ImageImporter,
{
    imported: Option<ImportedImage<I>>,
    wl_buffer: Option<C::Buffer>,
    buffer: Option<AllocatedBuffer<FactoryBuffer<F>>>,
    allocator: Option<F::Allocator>,
    session: CompositorSession<C>,
    device: Option<F::Device>,
    factory: F,
    importer: I,
    options: PipelineOptions,
    allocation: Option<AllocationSummary>,
    geometry: Option<(u32, u32)>,
}

/// The production stack: Wayland screencopy, GBM, EGL.
pub type WaylandPipeline = CapturePipeline<WaylandCompositor, GbmAllocatorFactory, EglImporter>;

impl WaylandPipeline {
    /// Build from configuration. The renderer's EGL context must be current.
    pub fn wayland(config: &CaptureConfig) -> CaptureResult<Self> {
        let importer = EglImporter::new()?;
        Ok(Self::new(
            WaylandCompositor::new(),
            GbmAllocatorFactory::new(config.render_nodes.clone()),
            importer,
            PipelineOptions::from(config),
        ))
    }
}

impl<C, F, I> CapturePipeline<C, F, I>
where
    C: Compositor,
    F: AllocatorFactory,
    I: ImageImporter,
    FactoryBuffer<F>: PlaneSource,
{
    pub fn new(compositor: C, factory: F, importer: I, options: PipelineOptions) -> Self {
        Self {
            imported: None,
            wl_buffer: None,
            buffer: None,
            allocator: None,
            session: CompositorSession::new(compositor, options.session),
            device: None,
            factory,
            importer,
            options,
            allocation: None,
            geometry: None,
        }
    }

    /// Bring capture up and return the fixed geometry.
    ///
    /// Blocks until the first frame is copied into the imported buffer.
    pub fn init(&mut self, output: Option<&str>) -> CaptureResult<(u32, u32)> {
        if let (Some(geometry), SessionState::Steady) = (self.geometry, self.session.state()) {
            return Ok(geometry);
        }
        if self.session.state() != SessionState::Disconnected {
            return Err(CaptureError::NotInitialized);
        }

        match self.setup(output) {
            Ok(geometry) => Ok(geometry),
            Err(e) => {
                log::error!("[PIPELINE] Capture setup failed: {}", e);
                self.shutdown();
                Err(e)
            }
        }
    }

    fn setup(&mut self, output: Option<&str>) -> CaptureResult<(u32, u32)> {
        self.session.discover(output)?;
        let negotiated = self.session.probe()?;
        let (width, height) = (negotiated.width, negotiated.height);

        let device = self.device.insert(self.factory.open_device()?);
        let allocator = self.allocator.insert(self.factory.create_context(device)?);

        let spec = BufferSpec {
            width,
            height,
            fourcc: negotiated.format.fourcc,
        };
        let allocation = allocate_with_ladder(&*allocator, &spec, &ALLOCATION_LADDER)?;
        self.allocation = Some(AllocationSummary {
            strategy: allocation.strategy,
            failures: allocation.failures,
        });

        let modifier = if self.options.explicit_modifier {
            allocation.buffer.modifier()
        } else {
            MOD_INVALID
        };
        let format = FrameFormat::new(spec.fourcc, modifier);
        let buffer = self
            .buffer
            .insert(into_allocated(allocation.buffer, width, height, format)?);

        let wl_buffer = self
            .wl_buffer
            .insert(self.session.create_buffer(&buffer.planes, width, height, format)?);
        let imported = import_as_image(&self.importer, &buffer.planes, width, height, format, None)?;
        self.imported = Some(imported);

        let frame = self.session.complete_probe(wl_buffer)?;
        log::info!(
            "[PIPELINE] Capture ready: {}x{} {}, {} plane(s), first frame after {} dispatch(es)",
            width,
            height,
            format,
            buffer.plane_count(),
            frame.dispatches
        );

        self.geometry = Some((width, height));
        Ok((width, height))
    }

    /// Capture one frame into the shared buffer.
    ///
    /// After a `CaptureFailed` the session is over; further calls return
    /// `NotInitialized`.
    pub fn next_frame(&mut self) -> CaptureResult<CapturedFrame> {
        let (Some(wl_buffer), Some(imported), Some((width, height))) =
            (&self.wl_buffer, &self.imported, self.geometry)
        else {
            return Err(CaptureError::NotInitialized);
        };

        let info = self.session.capture(wl_buffer)?;
        Ok(CapturedFrame {
            texture: imported.texture_id(),
            width,
            height,
            y_inverted: info.y_inverted,
            presented_at: info.presented_at,
        })
    }

    /// Release everything in reverse acquisition order. Safe to call at any
    /// point, any number of times.
    pub fn shutdown(&mut self) {
        let was_live = self.device.is_some() || self.session.state() != SessionState::ShutDown;

        self.imported = None;
        self.wl_buffer = None;
        self.buffer = None;
        self.allocator = None;
        self.session.shutdown();
        self.device = None;
        self.geometry = None;

        if was_live {
            log::debug!("[PIPELINE] Capture resources released");
        }
    }

    pub fn geometry(&self) -> Option<(u32, u32)> {
        self.geometry
    }

    pub fn format(&self) -> Option<FrameFormat> {
        self.buffer.as_ref().map(|b| b.format)
    }

    pub fn plane_count(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.plane_count())
    }

    pub fn allocation(&self) -> Option<&AllocationSummary> {
        self.allocation.as_ref()
    }

    pub fn output(&self) -> Option<&OutputInfo> {
        self.session.output()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &CompositorSession<C> {
        &self.session
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn importer(&self) -> &I {
        &self.importer
    }
}

impl<C, F, I> Drop for CapturePipeline<C, F, I>
where
    C: Compositor,
    F: AllocatorFactory,
    I: ImageImporter,
{
    fn drop(&mut self) {
        self.imported = None;
        self.wl_buffer = None;
        self.buffer = None;
        self.allocator = None;
        self.session.shutdown();
        self.device = None;
    }
}
