//! Scripted compositor, allocator and importer for pipeline tests.
//!
//! Every handle the mocks hand out is tied to a shared [`Ledger`] that
//! counts acquisitions and releases per resource kind and records the
//! release order. Plane fds are real fds on a per-ledger temp file, so leaks
//! show up in `/proc/self/fd`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs::{self, File};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use wl_targets::bounds::PhysicalSize;
use wl_targets::{select_output, OutputId, OutputInfo};

use crate::allocator::{AllocatorFactory, BufferAllocator, BufferSpec, BufferUsage};
use crate::bridge::{DmabufDescriptor, ImageImporter, PlaneExport, PlaneSource, TextureHandle};
use crate::error::{CaptureError, CaptureResult};
use crate::format::{FrameFormat, MOD_INVALID, XRGB8888};
use crate::session::{
    require_version, Compositor, DmabufOffer, EventPump, FrameEvents, FrameOutcome,
    LINUX_DMABUF_VERSION, SCREENCOPY_VERSION,
};

static LEDGER_SEQ: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Connection,
    Frame,
    Device,
    Allocator,
    BufferObject,
    WlBuffer,
    Image,
    Texture,
}

struct LedgerInner {
    acquired: HashMap<Resource, usize>,
    released: HashMap<Resource, usize>,
    releases: Vec<Resource>,
    fd_path: PathBuf,
}

impl Drop for LedgerInner {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.fd_path);
    }
}

/// Shared acquisition/release accounting.
#[derive(Clone)]
pub struct Ledger(Rc<RefCell<LedgerInner>>);

impl Ledger {
    pub fn new() -> Self {
        let seq = LEDGER_SEQ.fetch_add(1, Ordering::SeqCst);
        let fd_path = std::env::temp_dir().join(format!(
            "wlmirror-ledger-{}-{}",
            std::process::id(),
            seq
        ));
        File::create(&fd_path).expect("create ledger fd target");
        Self(Rc::new(RefCell::new(LedgerInner {
            acquired: HashMap::new(),
            released: HashMap::new(),
            releases: Vec::new(),
            fd_path,
        })))
    }

    pub fn acquire(&self, kind: Resource) -> Tracked {
        *self.0.borrow_mut().acquired.entry(kind).or_default() += 1;
        Tracked {
            ledger: self.clone(),
            kind,
        }
    }

    fn release(&self, kind: Resource) {
        let mut inner = self.0.borrow_mut();
        *inner.released.entry(kind).or_default() += 1;
        inner.releases.push(kind);
    }

    pub fn acquired(&self, kind: Resource) -> usize {
        self.0.borrow().acquired.get(&kind).copied().unwrap_or(0)
    }

    pub fn released(&self, kind: Resource) -> usize {
        self.0.borrow().released.get(&kind).copied().unwrap_or(0)
    }

    /// Kinds whose acquisitions and releases disagree.
    pub fn leaks(&self) -> Vec<(Resource, usize, usize)> {
        let inner = self.0.borrow();
        let mut leaks: Vec<_> = inner
            .acquired
            .iter()
            .map(|(kind, &n)| (*kind, n, inner.released.get(kind).copied().unwrap_or(0)))
            .filter(|(_, acquired, released)| acquired != released)
            .collect();
        leaks.sort_by_key(|(kind, _, _)| format!("{:?}", kind));
        leaks
    }

    /// Release order, excluding per-frame request objects.
    pub fn teardown_order(&self) -> Vec<Resource> {
        self.0
            .borrow()
            .releases
            .iter()
            .copied()
            .filter(|kind| *kind != Resource::Frame)
            .collect()
    }

    pub fn open_plane_fd(&self) -> std::io::Result<OwnedFd> {
        File::open(&self.0.borrow().fd_path).map(OwnedFd::from)
    }

    /// Fds of this process currently pointing at the ledger's file.
    pub fn open_plane_fds(&self) -> usize {
        let target = self.0.borrow().fd_path.clone();
        fs::read_dir("/proc/self/fd")
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|e| fs::read_link(e.path()).map(|p| p == target).unwrap_or(false))
                    .count()
            })
            .unwrap_or(0)
    }
}

/// A ledger entry released on drop.
pub struct Tracked {
    ledger: Ledger,
    kind: Resource,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.ledger.release(self.kind);
    }
}

pub fn output(id: u32, name: &str, width: u32, height: u32) -> OutputInfo {
    OutputInfo {
        name: Some(name.to_string()),
        make: "Dell".to_string(),
        model: format!("U27{}", id),
        mode: PhysicalSize::new(width, height),
        refresh_mhz: 60000,
        ..OutputInfo::new(OutputId::new(id))
    }
}

/// Compositor behavior for one test.
#[derive(Debug, Clone)]
pub struct CompositorScript {
    pub screencopy_version: Option<u32>,
    pub dmabuf_version: Option<u32>,
    pub outputs: Vec<OutputInfo>,
    /// Answer to every frame request; `None` sends only `buffer_done`.
    pub offer: Option<DmabufOffer>,
    /// Dispatches before the buffer announcements arrive.
    pub offer_delay: usize,
    /// Dispatches between `copy` and the terminal event.
    pub ready_delay: usize,
    /// Copy indices (0 = probe frame) answered with `failed`.
    pub fail_copies: Vec<usize>,
    pub fail_probe: bool,
    pub reject_params: bool,
    pub y_inverted: bool,
    /// Dispatch count after which the socket is gone.
    pub hang_up_after: Option<usize>,
}

impl CompositorScript {
    pub fn with_size(width: u32, height: u32) -> Self {
        Self {
            screencopy_version: Some(SCREENCOPY_VERSION),
            dmabuf_version: Some(LINUX_DMABUF_VERSION),
            outputs: vec![output(40, "DP-1", width, height), output(41, "HDMI-A-1", 1920, 1080)],
            offer: Some(DmabufOffer {
                format: XRGB8888,
                width,
                height,
            }),
            offer_delay: 1,
            ready_delay: 1,
            fail_copies: Vec::new(),
            fail_probe: false,
            reject_params: false,
            y_inverted: false,
            hang_up_after: None,
        }
    }
}

impl Default for CompositorScript {
    fn default() -> Self {
        Self::with_size(3840, 2160)
    }
}

pub struct MockWlBuffer {
    pub planes: usize,
    pub format: FrameFormat,
    _token: Tracked,
}

pub struct MockCompositor {
    pub script: CompositorScript,
    ledger: Ledger,
    connection: Option<Tracked>,
    frame: Option<Tracked>,
    events: FrameEvents,
    offer_countdown: Option<usize>,
    ready_countdown: Option<usize>,
    copies: usize,
    pub dispatches: usize,
    pub frames_requested: usize,
    pub last_buffer_format: Option<FrameFormat>,
}

impl MockCompositor {
    pub fn new(script: CompositorScript, ledger: &Ledger) -> Self {
        Self {
            script,
            ledger: ledger.clone(),
            connection: None,
            frame: None,
            events: FrameEvents::default(),
            offer_countdown: None,
            ready_countdown: None,
            copies: 0,
            dispatches: 0,
            frames_requested: 0,
            last_buffer_format: None,
        }
    }

    fn connected(&self) -> CaptureResult<()> {
        if self.connection.is_some() {
            Ok(())
        } else {
            Err(CaptureError::NotInitialized)
        }
    }
}

impl EventPump for MockCompositor {
    fn dispatch_blocking(&mut self) -> CaptureResult<usize> {
        self.connected()?;
        if self.script.hang_up_after.is_some_and(|n| self.dispatches >= n) {
            return Err(CaptureError::Dispatch("Broken pipe (os error 32)".to_string()));
        }
        if self.offer_countdown.is_none() && self.ready_countdown.is_none() {
            return Err(CaptureError::Dispatch(
                "nothing scheduled, would block forever".to_string(),
            ));
        }
        self.dispatches += 1;

        if let Some(left) = self.offer_countdown.as_mut() {
            *left -= 1;
            if *left == 0 {
                self.offer_countdown = None;
                if self.script.fail_probe && self.copies == 0 {
                    self.events.outcome = FrameOutcome::Failed;
                } else {
                    self.events.dmabuf = self.script.offer;
                    self.events.buffer_done = true;
                }
            }
        }

        if let Some(left) = self.ready_countdown.as_mut() {
            *left -= 1;
            if *left == 0 {
                self.ready_countdown = None;
                let index = self.copies - 1;
                self.events.y_inverted = self.script.y_inverted;
                self.events.outcome = if self.script.fail_copies.contains(&index) {
                    FrameOutcome::Failed
                } else {
                    FrameOutcome::Ready {
                        presented_at: Duration::from_millis(16 * index as u64),
                    }
                };
            }
        }
        Ok(1)
    }
}

impl Compositor for MockCompositor {
    type Buffer = MockWlBuffer;

    fn connect(&mut self) -> CaptureResult<()> {
        if self.connection.is_none() {
            self.connection = Some(self.ledger.acquire(Resource::Connection));
        }
        Ok(())
    }

    fn list_outputs(&mut self) -> CaptureResult<Vec<OutputInfo>> {
        self.connected()?;
        Ok(self.script.outputs.clone())
    }

    fn discover(&mut self, output: Option<&str>) -> CaptureResult<OutputInfo> {
        self.connected()?;
        require_version(
            "zwlr_screencopy_manager_v1",
            self.script.screencopy_version,
            SCREENCOPY_VERSION,
        )?;
        require_version(
            "zwp_linux_dmabuf_v1",
            self.script.dmabuf_version,
            LINUX_DMABUF_VERSION,
        )?;
        select_output(&self.script.outputs, output)
            .cloned()
            .ok_or_else(|| CaptureError::OutputNotFound(output.unwrap_or_default().to_string()))
    }

    fn capture_output(&mut self, _overlay_cursor: bool) -> CaptureResult<()> {
        self.connected()?;
        self.frame = Some(self.ledger.acquire(Resource::Frame));
        self.frames_requested += 1;
        self.events = FrameEvents::default();
        self.offer_countdown = Some(self.script.offer_delay.max(1));
        self.ready_countdown = None;
        Ok(())
    }

    fn frame_events(&self) -> &FrameEvents {
        &self.events
    }

    fn copy(&mut self, _buffer: &MockWlBuffer) -> CaptureResult<()> {
        if self.frame.is_none() {
            return Err(CaptureError::NotInitialized);
        }
        self.copies += 1;
        self.ready_countdown = Some(self.script.ready_delay.max(1));
        Ok(())
    }

    fn finish_frame(&mut self) {
        self.frame = None;
        self.offer_countdown = None;
        self.ready_countdown = None;
    }

    fn create_buffer(
        &mut self,
        planes: &[PlaneExport],
        _width: u32,
        _height: u32,
        format: FrameFormat,
    ) -> CaptureResult<MockWlBuffer> {
        self.connected()?;
        if self.script.reject_params {
            return Err(CaptureError::ImportFailed(
                "compositor failed buffer params".to_string(),
            ));
        }
        self.last_buffer_format = Some(format);
        Ok(MockWlBuffer {
            planes: planes.len(),
            format,
            _token: self.ledger.acquire(Resource::WlBuffer),
        })
    }

    fn disconnect(&mut self) {
        self.finish_frame();
        self.connection = None;
    }
}

pub struct MockDevice {
    _token: Tracked,
}

pub struct MockBuffer {
    pub usage: BufferUsage,
    planes: usize,
    modifier: u64,
    ledger: Ledger,
    _token: Tracked,
}

impl PlaneSource for MockBuffer {
    fn plane_count(&self) -> usize {
        self.planes
    }

    fn plane_fd(&self, _plane: usize) -> Result<OwnedFd, String> {
        self.ledger.open_plane_fd().map_err(|e| e.to_string())
    }

    fn plane_stride(&self, _plane: usize) -> u32 {
        15360
    }

    fn plane_offset(&self, _plane: usize) -> u32 {
        0
    }

    fn modifier(&self) -> u64 {
        self.modifier
    }
}

pub struct MockAllocator {
    accepts: Vec<BufferUsage>,
    attempts: Rc<RefCell<Vec<(BufferSpec, BufferUsage)>>>,
    planes: usize,
    modifier: u64,
    ledger: Ledger,
    _token: Tracked,
}

impl BufferAllocator for MockAllocator {
    type Buffer = MockBuffer;

    fn allocate(&self, spec: &BufferSpec, usage: BufferUsage) -> Result<MockBuffer, String> {
        self.attempts.borrow_mut().push((*spec, usage));
        if !self.accepts.contains(&usage) {
            return Err(format!("driver rejects {:?}", usage));
        }
        Ok(MockBuffer {
            usage,
            planes: self.planes,
            modifier: self.modifier,
            ledger: self.ledger.clone(),
            _token: self.ledger.acquire(Resource::BufferObject),
        })
    }
}

pub struct MockAllocatorFactory {
    pub accepts: Vec<BufferUsage>,
    pub attempts: Rc<RefCell<Vec<(BufferSpec, BufferUsage)>>>,
    pub planes: usize,
    pub modifier: u64,
    pub no_device: bool,
    pub context_fails: bool,
    ledger: Ledger,
}

impl MockAllocatorFactory {
    pub fn new(ledger: &Ledger) -> Self {
        Self {
            accepts: vec![BufferUsage::Rendering, BufferUsage::Default, BufferUsage::Linear],
            attempts: Rc::new(RefCell::new(Vec::new())),
            planes: 1,
            modifier: MOD_INVALID,
            no_device: false,
            context_fails: false,
            ledger: ledger.clone(),
        }
    }

    pub fn accepting(mut self, accepts: &[BufferUsage]) -> Self {
        self.accepts = accepts.to_vec();
        self
    }

    pub fn usages_tried(&self) -> Vec<BufferUsage> {
        self.attempts.borrow().iter().map(|(_, usage)| *usage).collect()
    }
}

impl AllocatorFactory for MockAllocatorFactory {
    type Device = MockDevice;
    type Allocator = MockAllocator;

    fn open_device(&self) -> CaptureResult<MockDevice> {
        if self.no_device {
            return Err(CaptureError::NoDeviceAvailable {
                tried: "/dev/dri/renderD128".to_string(),
            });
        }
        Ok(MockDevice {
            _token: self.ledger.acquire(Resource::Device),
        })
    }

    fn create_context(&self, _device: &MockDevice) -> CaptureResult<MockAllocator> {
        if self.context_fails {
            return Err(CaptureError::AllocatorInitFailed(
                "gbm_create_device failed".to_string(),
            ));
        }
        Ok(MockAllocator {
            accepts: self.accepts.clone(),
            attempts: Rc::clone(&self.attempts),
            planes: self.planes,
            modifier: self.modifier,
            ledger: self.ledger.clone(),
            _token: self.ledger.acquire(Resource::Allocator),
        })
    }
}

pub struct MockImage {
    pub descriptor: DmabufDescriptor,
    _token: Tracked,
}

pub struct MockTexture {
    id: u32,
    _token: Tracked,
}

impl TextureHandle for MockTexture {
    fn id(&self) -> u32 {
        self.id
    }
}

pub struct MockImporter {
    pub reject_import: bool,
    pub missing_extension: bool,
    next_texture: Cell<u32>,
    ledger: Ledger,
}

impl MockImporter {
    pub fn new(ledger: &Ledger) -> Self {
        Self {
            reject_import: false,
            missing_extension: false,
            next_texture: Cell::new(1),
            ledger: ledger.clone(),
        }
    }
}

impl ImageImporter for MockImporter {
    type Image = MockImage;
    type Texture = MockTexture;

    fn create_texture(&self) -> CaptureResult<MockTexture> {
        let id = self.next_texture.get();
        self.next_texture.set(id + 1);
        Ok(MockTexture {
            id,
            _token: self.ledger.acquire(Resource::Texture),
        })
    }

    fn import(&self, descriptor: &DmabufDescriptor) -> CaptureResult<MockImage> {
        if self.reject_import {
            return Err(CaptureError::ImportFailed(
                "eglCreateImage rejected the descriptor".to_string(),
            ));
        }
        Ok(MockImage {
            descriptor: descriptor.clone(),
            _token: self.ledger.acquire(Resource::Image),
        })
    }

    fn attach(&self, _image: &MockImage, _texture: &MockTexture) -> CaptureResult<()> {
        if self.missing_extension {
            return Err(CaptureError::ExtensionMissing(
                "glEGLImageTargetTexture2DOES".to_string(),
            ));
        }
        Ok(())
    }
}
