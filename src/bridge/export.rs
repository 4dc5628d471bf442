//! Plane export: buffer object -> dmabuf fds with layout metadata.

use std::fmt;
use std::os::fd::OwnedFd;

use crate::error::{CaptureError, CaptureResult};
use crate::format::FrameFormat;

/// Anything that can hand out its memory planes as dmabuf fds.
pub trait PlaneSource {
    fn plane_count(&self) -> usize;

    /// A fresh fd for `plane`. The caller owns it.
    fn plane_fd(&self, plane: usize) -> Result<OwnedFd, String>;

    fn plane_stride(&self, plane: usize) -> u32;

    fn plane_offset(&self, plane: usize) -> u32;

    /// Layout modifier the driver picked for this buffer.
    fn modifier(&self) -> u64;
}

/// One exported plane. The fd closes exactly once, on drop.
#[derive(Debug)]
pub struct PlaneExport {
    pub fd: OwnedFd,
    pub stride: u32,
    pub offset: u32,
}

/// A buffer object together with its exported planes.
///
/// Field order is drop order: the buffer object goes first, then the plane
/// fds.
pub struct AllocatedBuffer<B> {
    pub buffer: B,
    pub planes: Vec<PlaneExport>,
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
}

impl<B> AllocatedBuffer<B> {
    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }
}

impl<B> fmt::Debug for AllocatedBuffer<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatedBuffer")
            .field("planes", &self.planes)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// Export every plane of `source`. Fds already exported are closed again if
/// a later plane fails.
pub fn export_planes<S: PlaneSource + ?Sized>(source: &S) -> CaptureResult<Vec<PlaneExport>> {
    let count = source.plane_count();
    if count == 0 {
        return Err(CaptureError::ExportFailed(
            "buffer object reports zero planes".to_string(),
        ));
    }

    let mut planes = Vec::with_capacity(count);
    for plane in 0..count {
        let fd = source
            .plane_fd(plane)
            .map_err(|e| CaptureError::ExportFailed(format!("plane {}: {}", plane, e)))?;
        planes.push(PlaneExport {
            fd,
            stride: source.plane_stride(plane),
            offset: source.plane_offset(plane),
        });
    }

    log::debug!(
        "[IMPORT] Exported {} plane(s), plane 0 stride={} offset={}",
        planes.len(),
        planes[0].stride,
        planes[0].offset
    );
    Ok(planes)
}

/// Export `buffer` and wrap it with its geometry and format.
pub fn into_allocated<B: PlaneSource>(
    buffer: B,
    width: u32,
    height: u32,
    format: FrameFormat,
) -> CaptureResult<AllocatedBuffer<B>> {
    let planes = export_planes(&buffer)?;
    Ok(AllocatedBuffer {
        buffer,
        planes,
        width,
        height,
        format,
    })
}
