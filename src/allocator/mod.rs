//! Allocator bridge.
//!
//! Opens a GPU render node, wraps it in an allocation context and allocates
//! the single shared capture buffer.
//!
//! # Architecture
//!
//! ```text
//! AllocatorFactory::open_device()      -> render node fd (dropped last)
//!     |
//!     +-- create_context(&device)      -> BufferAllocator (GBM device)
//!             |
//!             +-- allocate_with_ladder -> buffer object
//!                   RENDERING -> DEFAULT -> LINEAR
//! ```
//!
//! # Modules
//!
//! - `device` - render node discovery
//! - `gbm` - GBM-backed allocator
//! - `ladder` - ordered usage strategies with first-success semantics

pub mod device;
pub mod gbm;
pub mod ladder;

pub use device::{open_device, RenderDevice};
pub use gbm::{GbmAllocator, GbmAllocatorFactory, GbmBuffer};
pub use ladder::{
    allocate_with_ladder, Allocation, AllocationFailure, AllocationStrategy, ALLOCATION_LADDER,
};

use std::fmt;

use crate::error::CaptureResult;
use crate::format::fourcc_name;

/// Size and pixel format of a buffer to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    pub width: u32,
    pub height: u32,
    pub fourcc: u32,
}

impl fmt::Display for BufferSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "w={} h={} fmt={}(0x{:x})",
            self.width,
            self.height,
            fourcc_name(self.fourcc),
            self.fourcc
        )
    }
}

/// Usage hint for one allocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// Render-target friendly layout chosen by the driver.
    Rendering,
    /// No usage flags at all.
    Default,
    /// Plain linear layout. Always importable, slowest to sample.
    Linear,
}

/// Allocation context that hands out GPU buffers.
pub trait BufferAllocator {
    type Buffer;

    /// One attempt with one usage; `Err` carries the driver's reason.
    fn allocate(&self, spec: &BufferSpec, usage: BufferUsage) -> Result<Self::Buffer, String>;
}

/// Opens the device and builds the allocation context on top of it.
///
/// Split in two so the raw device handle can be owned separately and
/// released after everything that was created from it.
pub trait AllocatorFactory {
    type Device;
    type Allocator: BufferAllocator;

    fn open_device(&self) -> CaptureResult<Self::Device>;

    fn create_context(&self, device: &Self::Device) -> CaptureResult<Self::Allocator>;
}

/// Buffer type produced by a factory's allocator.
pub type FactoryBuffer<F> = <<F as AllocatorFactory>::Allocator as BufferAllocator>::Buffer;
