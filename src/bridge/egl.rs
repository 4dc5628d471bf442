//! EGL dmabuf import and GL texture binding.
//!
//! Runs on the thread that owns the renderer's EGL context. `libEGL` is
//! opened at runtime and GL entry points come from libepoxy, loaded once per
//! process. `glEGLImageTargetTexture2DOES` is an extension entry point and is
//! resolved through `eglGetProcAddress` the first time an image is attached.

use std::cell::OnceCell;
use std::ffi::{c_char, c_void};
use std::ptr;
use std::sync::Arc;

use epoxy::types::{GLenum, GLint, GLuint};
use lazy_static::lazy_static;
use libloading::Library;
use parking_lot::Mutex;

use super::descriptor::{DmabufDescriptor, EGL_LINUX_DMA_BUF_EXT};
use super::{ImageImporter, TextureHandle};
use crate::error::{CaptureError, CaptureResult};

const EGL_LIBRARY: &str = "libEGL.so.1";
const EPOXY_LIBRARY: &str = "libepoxy.so.0";
const IMAGE_TARGET_FN: &[u8] = b"glEGLImageTargetTexture2DOES\0";

type EglDisplay = *mut c_void;
type EglImageHandle = *mut c_void;

type GetCurrentDisplayFn = unsafe extern "C" fn() -> EglDisplay;
type CreateImageFn = unsafe extern "C" fn(
    EglDisplay,
    *mut c_void,
    u32,
    *mut c_void,
    *const isize,
) -> EglImageHandle;
type DestroyImageFn = unsafe extern "C" fn(EglDisplay, EglImageHandle) -> u32;
type GetProcAddressFn = unsafe extern "C" fn(*const c_char) -> *mut c_void;
type GetErrorFn = unsafe extern "C" fn() -> i32;
type ImageTargetTextureFn = unsafe extern "C" fn(GLenum, EglImageHandle);

lazy_static! {
    static ref EPOXY: Mutex<Option<Library>> = Mutex::new(None);
}

/// Point epoxy at libepoxy's symbols. No-op after the first success.
/// Upper bound on queued GL error flags; a lost context reports forever.
const MAX_PENDING_GL_ERRORS: usize = 16;

/// Pop GL error flags until `GL_NO_ERROR`. Returns how many were pending.
fn drain_gl_errors(mut get_error: impl FnMut() -> GLenum) -> usize {
    (0..MAX_PENDING_GL_ERRORS)
        .take_while(|_| get_error() != epoxy::NO_ERROR)
        .count()
}

fn ensure_gl_loaded() -> CaptureResult<()> {
    let mut slot = EPOXY.lock();
    if slot.is_some() {
        return Ok(());
    }

    let library = unsafe { Library::new(EPOXY_LIBRARY) }
        .map_err(|e| CaptureError::ExtensionMissing(format!("{}: {}", EPOXY_LIBRARY, e)))?;
    epoxy::load_with(|name| {
        unsafe { library.get::<_>(name.as_bytes()) }
            .map(|symbol| *symbol)
            .unwrap_or(ptr::null())
    });
    *slot = Some(library);
    log::debug!("[IMPORT] Loaded GL entry points from {}", EPOXY_LIBRARY);
    Ok(())
}

/// Copy a function pointer out of `library`.
///
/// # Safety
/// `T` must match the symbol's real signature.
unsafe fn symbol<T: Copy>(library: &Library, name: &[u8]) -> CaptureResult<T> {
    library.get::<T>(name).map(|s| *s).map_err(|e| {
        let name = String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name));
        CaptureError::ExtensionMissing(format!("{}: {}", name, e))
    })
}

struct EglApi {
    get_current_display: GetCurrentDisplayFn,
    create_image: CreateImageFn,
    destroy_image: DestroyImageFn,
    get_proc_address: GetProcAddressFn,
    get_error: GetErrorFn,
    // Keeps the fn pointers above valid.
    _library: Library,
}

impl EglApi {
    fn load() -> CaptureResult<Self> {
        let library = unsafe { Library::new(EGL_LIBRARY) }
            .map_err(|e| CaptureError::ExtensionMissing(format!("{}: {}", EGL_LIBRARY, e)))?;
        unsafe {
            Ok(Self {
                get_current_display: symbol(&library, b"eglGetCurrentDisplay\0")?,
                create_image: symbol(&library, b"eglCreateImage\0")?,
                destroy_image: symbol(&library, b"eglDestroyImage\0")?,
                get_proc_address: symbol(&library, b"eglGetProcAddress\0")?,
                get_error: symbol(&library, b"eglGetError\0")?,
                _library: library,
            })
        }
    }

    fn last_error(&self) -> i32 {
        unsafe { (self.get_error)() }
    }
}

/// An `EGLImage`, destroyed on drop.
pub struct EglImage {
    api: Arc<EglApi>,
    display: EglDisplay,
    handle: EglImageHandle,
}

impl Drop for EglImage {
    fn drop(&mut self) {
        unsafe {
            (self.api.destroy_image)(self.display, self.handle);
        }
        log::debug!("[IMPORT] Destroyed EGL image");
    }
}

/// A GL texture name, deleted on drop. The owning context must be current.
#[derive(Debug)]
pub struct GlTexture {
    id: GLuint,
}

impl TextureHandle for GlTexture {
    fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for GlTexture {
    fn drop(&mut self) {
        unsafe {
            epoxy::DeleteTextures(1, &self.id);
        }
        log::debug!("[IMPORT] Deleted texture {}", self.id);
    }
}

/// Imports dmabufs into the EGL display current on this thread.
pub struct EglImporter {
    api: Arc<EglApi>,
    display: EglDisplay,
    image_target: OnceCell<ImageTargetTextureFn>,
}

impl EglImporter {
    /// Bind to the current EGL display. Fails when no context is current.
    pub fn new() -> CaptureResult<Self> {
        let api = EglApi::load()?;
        let display = unsafe { (api.get_current_display)() };
        if display.is_null() {
            return Err(CaptureError::NoCurrentContext);
        }
        ensure_gl_loaded()?;

        Ok(Self {
            api: Arc::new(api),
            display,
            image_target: OnceCell::new(),
        })
    }

    fn image_target_fn(&self) -> CaptureResult<ImageTargetTextureFn> {
        if let Some(f) = self.image_target.get() {
            return Ok(*f);
        }

        let raw = unsafe { (self.api.get_proc_address)(IMAGE_TARGET_FN.as_ptr().cast()) };
        if raw.is_null() {
            return Err(CaptureError::ExtensionMissing(
                "glEGLImageTargetTexture2DOES".to_string(),
            ));
        }
        let f = unsafe { std::mem::transmute::<*mut c_void, ImageTargetTextureFn>(raw) };
        let _ = self.image_target.set(f);
        Ok(f)
    }
}

impl ImageImporter for EglImporter {
    type Image = EglImage;
    type Texture = GlTexture;

    fn create_texture(&self) -> CaptureResult<GlTexture> {
        let mut id: GLuint = 0;
        unsafe {
            epoxy::GenTextures(1, &mut id);
        }
        if id == 0 {
            return Err(CaptureError::ImportFailed(
                "glGenTextures returned 0".to_string(),
            ));
        }

        unsafe {
            epoxy::BindTexture(epoxy::TEXTURE_2D, id);
            epoxy::TexParameteri(epoxy::TEXTURE_2D, epoxy::TEXTURE_MIN_FILTER, epoxy::LINEAR as GLint);
            epoxy::TexParameteri(epoxy::TEXTURE_2D, epoxy::TEXTURE_MAG_FILTER, epoxy::LINEAR as GLint);
            epoxy::TexParameteri(epoxy::TEXTURE_2D, epoxy::TEXTURE_MAX_LEVEL, 0);
        }
        Ok(GlTexture { id })
    }

    fn import(&self, descriptor: &DmabufDescriptor) -> CaptureResult<EglImage> {
        let attribs = descriptor.attributes();
        let handle = unsafe {
            (self.api.create_image)(
                self.display,
                ptr::null_mut(),
                EGL_LINUX_DMA_BUF_EXT,
                ptr::null_mut(),
                attribs.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(CaptureError::ImportFailed(format!(
                "eglCreateImage rejected {} (EGL error 0x{:x})",
                descriptor.format,
                self.api.last_error()
            )));
        }

        Ok(EglImage {
            api: Arc::clone(&self.api),
            display: self.display,
            handle,
        })
    }

    fn attach(&self, image: &EglImage, texture: &GlTexture) -> CaptureResult<()> {
        let image_target = self.image_target_fn()?;
        let stale = drain_gl_errors(|| unsafe { epoxy::GetError() });
        if stale > 0 {
            log::debug!("[IMPORT] Discarded {} pending GL error(s) before bind", stale);
        }
        let error = unsafe {
            epoxy::BindTexture(epoxy::TEXTURE_2D, texture.id);
            image_target(epoxy::TEXTURE_2D, image.handle);
            epoxy::GetError()
        };
        if error != epoxy::NO_ERROR {
            return Err(CaptureError::ImportFailed(format!(
                "glEGLImageTargetTexture2DOES failed (GL error 0x{:x})",
                error
            )));
        }
        Ok(())
    }
}
