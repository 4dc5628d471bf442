//! Allocation fallback ladder.
//!
//! Drivers disagree on which usage combinations they accept for a given
//! format and size, so allocation walks an ordered list of strategies and
//! keeps the first buffer that comes back. Linear is universally importable
//! but the slowest to sample, so it goes last.

use super::{BufferAllocator, BufferSpec, BufferUsage};
use crate::error::{CaptureError, CaptureResult, ErrorClass};
use crate::format::fourcc_name;

/// One named rung of the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationStrategy {
    pub name: &'static str,
    pub usage: BufferUsage,
}

/// Default order: rendering-optimized, no flags, explicit linear.
pub const ALLOCATION_LADDER: [AllocationStrategy; 3] = [
    AllocationStrategy {
        name: "rendering",
        usage: BufferUsage::Rendering,
    },
    AllocationStrategy {
        name: "default",
        usage: BufferUsage::Default,
    },
    AllocationStrategy {
        name: "linear",
        usage: BufferUsage::Linear,
    },
];

/// A rejected attempt, kept for diagnosis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationFailure {
    pub strategy: AllocationStrategy,
    pub spec: BufferSpec,
    pub reason: String,
}

impl AllocationFailure {
    /// Single attempts are worked around by the next rung.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Recoverable
    }
}

/// The accepted buffer plus how it was obtained.
#[derive(Debug)]
pub struct Allocation<B> {
    pub buffer: B,
    pub strategy: AllocationStrategy,
    pub failures: Vec<AllocationFailure>,
}

/// Try each strategy in order and stop at the first success.
pub fn allocate_with_ladder<A>(
    allocator: &A,
    spec: &BufferSpec,
    ladder: &[AllocationStrategy],
) -> CaptureResult<Allocation<A::Buffer>>
where
    A: BufferAllocator + ?Sized,
{
    if spec.width == 0 || spec.height == 0 {
        return Err(CaptureError::InvalidGeometry {
            width: spec.width as i64,
            height: spec.height as i64,
        });
    }

    let mut failures = Vec::new();
    for strategy in ladder {
        match allocator.allocate(spec, strategy.usage) {
            Ok(buffer) => {
                log::info!(
                    "[ALLOC] Allocated {} with '{}' usage after {} failed attempt(s)",
                    spec,
                    strategy.name,
                    failures.len()
                );
                return Ok(Allocation {
                    buffer,
                    strategy: *strategy,
                    failures,
                });
            }
            Err(reason) => {
                log::warn!(
                    "[ALLOC] Buffer allocation failed ({} use={:?}): {}; trying fallback",
                    spec,
                    strategy.usage,
                    reason
                );
                failures.push(AllocationFailure {
                    strategy: *strategy,
                    spec: *spec,
                    reason,
                });
            }
        }
    }

    Err(CaptureError::AllocationExhausted {
        width: spec.width,
        height: spec.height,
        format: fourcc_name(spec.fourcc),
        attempts: failures.len(),
    })
}
