//! Buffer export/import bridge.
//!
//! Turns an allocated buffer object into dmabuf plane fds, then into an
//! image in the current graphics context bound to a persistent texture.
//! The texture samples the buffer's memory directly, so refreshing the
//! picture only needs the compositor to overwrite the buffer.
//!
//! # Modules
//!
//! - `export` - plane fd export and the owning `AllocatedBuffer`
//! - `descriptor` - dmabuf attribute list construction
//! - `egl` - EGL image + GL texture importer

pub mod descriptor;
pub mod egl;
pub mod export;

pub use descriptor::DmabufDescriptor;
pub use egl::{EglImporter, GlTexture};
pub use export::{export_planes, into_allocated, AllocatedBuffer, PlaneExport, PlaneSource};

use crate::error::CaptureResult;
use crate::format::FrameFormat;

/// A texture the renderer can sample.
pub trait TextureHandle {
    fn id(&self) -> u32;
}

/// Graphics-context side of the import.
pub trait ImageImporter {
    type Image;
    type Texture: TextureHandle;

    /// Allocate a texture name set up for single-level linear sampling.
    fn create_texture(&self) -> CaptureResult<Self::Texture>;

    /// Wrap the described dmabuf as an image.
    fn import(&self, descriptor: &DmabufDescriptor) -> CaptureResult<Self::Image>;

    /// Bind `image` as the storage of `texture`.
    fn attach(&self, image: &Self::Image, texture: &Self::Texture) -> CaptureResult<()>;
}

/// An imported image plus the texture it backs.
///
/// Field order is drop order: image before texture.
pub struct ImportedImage<I: ImageImporter> {
    pub image: I::Image,
    pub texture: I::Texture,
}

impl<I: ImageImporter> ImportedImage<I> {
    pub fn texture_id(&self) -> u32 {
        self.texture.id()
    }
}

/// Import `planes` as an image bound to `texture`, or to a fresh texture when
/// none is passed in.
pub fn import_as_image<I: ImageImporter>(
    importer: &I,
    planes: &[PlaneExport],
    width: u32,
    height: u32,
    format: FrameFormat,
    texture: Option<I::Texture>,
) -> CaptureResult<ImportedImage<I>> {
    let descriptor = DmabufDescriptor::new(planes, width, height, format)?;
    let texture = match texture {
        Some(texture) => texture,
        None => importer.create_texture()?,
    };
    let image = importer.import(&descriptor)?;
    importer.attach(&image, &texture)?;

    log::info!(
        "[IMPORT] Imported {}x{} {} as texture {}",
        width,
        height,
        format,
        texture.id()
    );
    Ok(ImportedImage { image, texture })
}
