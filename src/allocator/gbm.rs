//! GBM-backed allocation context.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;

use drm_fourcc::DrmFourcc;
use gbm::{BufferObject, BufferObjectFlags, Device};

use super::device::{open_device, RenderDevice};
use super::{AllocatorFactory, BufferAllocator, BufferSpec, BufferUsage};
use crate::bridge::PlaneSource;
use crate::error::{CaptureError, CaptureResult};
use crate::format::fourcc_name;

fn usage_flags(usage: BufferUsage) -> BufferObjectFlags {
    match usage {
        BufferUsage::Rendering => BufferObjectFlags::RENDERING,
        BufferUsage::Default => BufferObjectFlags::empty(),
        BufferUsage::Linear => BufferObjectFlags::LINEAR,
    }
}

/// `gbm_device` on top of a shared render node handle.
pub struct GbmAllocator {
    device: Device<Arc<RenderDevice>>,
}

impl GbmAllocator {
    pub fn new(node: Arc<RenderDevice>) -> CaptureResult<Self> {
        let path = node.path().display().to_string();
        let device = Device::new(node)
            .map_err(|e| CaptureError::AllocatorInitFailed(format!("{}: {}", path, e)))?;
        log::debug!("[ALLOC] GBM backend: {}", device.backend_name());
        Ok(Self { device })
    }
}

impl BufferAllocator for GbmAllocator {
    type Buffer = GbmBuffer;

    fn allocate(&self, spec: &BufferSpec, usage: BufferUsage) -> Result<GbmBuffer, String> {
        let format = DrmFourcc::try_from(spec.fourcc)
            .map_err(|_| format!("unknown fourcc {}", fourcc_name(spec.fourcc)))?;
        self.device
            .create_buffer_object::<()>(spec.width, spec.height, format, usage_flags(usage))
            .map(|bo| GbmBuffer { bo })
            .map_err(|e| e.to_string())
    }
}

/// One `gbm_bo`, destroyed on drop.
pub struct GbmBuffer {
    bo: BufferObject<()>,
}

impl PlaneSource for GbmBuffer {
    fn plane_count(&self) -> usize {
        self.bo.plane_count() as usize
    }

    fn plane_fd(&self, plane: usize) -> Result<OwnedFd, String> {
        self.bo
            .fd_for_plane(plane as i32)
            .map_err(|e| e.to_string())
    }

    fn plane_stride(&self, plane: usize) -> u32 {
        self.bo.stride_for_plane(plane as i32)
    }

    fn plane_offset(&self, plane: usize) -> u32 {
        self.bo.offset(plane as i32)
    }

    fn modifier(&self) -> u64 {
        self.bo.modifier().into()
    }
}

/// Opens the first usable render node and builds a GBM context on it.
#[derive(Debug, Clone)]
pub struct GbmAllocatorFactory {
    render_nodes: Vec<PathBuf>,
}

impl GbmAllocatorFactory {
    pub fn new(render_nodes: Vec<PathBuf>) -> Self {
        Self { render_nodes }
    }
}

impl AllocatorFactory for GbmAllocatorFactory {
    type Device = Arc<RenderDevice>;
    type Allocator = GbmAllocator;

    fn open_device(&self) -> CaptureResult<Arc<RenderDevice>> {
        open_device(&self.render_nodes).map(Arc::new)
    }

    fn create_context(&self, device: &Arc<RenderDevice>) -> CaptureResult<GbmAllocator> {
        GbmAllocator::new(Arc::clone(device))
    }
}
