//! `EGL_EXT_image_dma_buf_import` attribute lists.

use std::os::fd::{AsRawFd, RawFd};

use super::export::PlaneExport;
use crate::error::{CaptureError, CaptureResult};
use crate::format::FrameFormat;

pub const EGL_NONE: isize = 0x3038;
pub const EGL_WIDTH: isize = 0x3057;
pub const EGL_HEIGHT: isize = 0x3056;
pub const EGL_LINUX_DMA_BUF_EXT: u32 = 0x3270;
pub const EGL_LINUX_DRM_FOURCC_EXT: isize = 0x3271;

/// Most planes a dmabuf import can carry.
pub const MAX_PLANES: usize = 4;

/// Per-plane attribute names: fd, offset, pitch, modifier lo, modifier hi.
const PLANE_ATTRIBS: [[isize; 5]; MAX_PLANES] = [
    [0x3272, 0x3273, 0x3274, 0x3443, 0x3444],
    [0x3275, 0x3276, 0x3277, 0x3445, 0x3446],
    [0x3278, 0x3279, 0x327A, 0x3447, 0x3448],
    [0x3440, 0x3441, 0x3442, 0x3449, 0x344A],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorPlane {
    pub fd: RawFd,
    pub offset: u32,
    pub stride: u32,
}

/// Everything EGL needs to wrap exported planes as an image.
///
/// Fds are borrowed: the descriptor must not outlive the planes it was built
/// from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmabufDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub planes: Vec<DescriptorPlane>,
}

impl DmabufDescriptor {
    pub fn new(
        planes: &[PlaneExport],
        width: u32,
        height: u32,
        format: FrameFormat,
    ) -> CaptureResult<Self> {
        if planes.is_empty() || planes.len() > MAX_PLANES {
            return Err(CaptureError::ImportFailed(format!(
                "{} planes, expected 1..={}",
                planes.len(),
                MAX_PLANES
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            planes: planes
                .iter()
                .map(|p| DescriptorPlane {
                    fd: p.fd.as_raw_fd(),
                    offset: p.offset,
                    stride: p.stride,
                })
                .collect(),
        })
    }

    /// `EGL_NONE`-terminated attribute list for `eglCreateImage`.
    ///
    /// Modifier attributes are only emitted for an explicit modifier.
    pub fn attributes(&self) -> Vec<isize> {
        let mut attribs = vec![
            EGL_WIDTH,
            self.width as isize,
            EGL_HEIGHT,
            self.height as isize,
            EGL_LINUX_DRM_FOURCC_EXT,
            self.format.fourcc as isize,
        ];

        let (hi, lo) = self.format.modifier_halves();
        for (plane, names) in self.planes.iter().zip(PLANE_ATTRIBS.iter()) {
            attribs.extend_from_slice(&[
                names[0],
                plane.fd as isize,
                names[1],
                plane.offset as isize,
                names[2],
                plane.stride as isize,
            ]);
            if self.format.has_explicit_modifier() {
                attribs.extend_from_slice(&[names[3], lo as isize, names[4], hi as isize]);
            }
        }

        attribs.push(EGL_NONE);
        attribs
    }
}
