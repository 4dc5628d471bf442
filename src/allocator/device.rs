//! Render node discovery.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};

use crate::error::{CaptureError, CaptureResult};

/// An opened `/dev/dri/renderD*` node. Closing happens on drop.
#[derive(Debug)]
pub struct RenderDevice {
    file: File,
    path: PathBuf,
}

impl RenderDevice {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsFd for RenderDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// Open the first candidate that opens read/write, in order.
pub fn open_device(candidates: &[PathBuf]) -> CaptureResult<RenderDevice> {
    for path in candidates {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => {
                log::info!("[ALLOC] Using render node {}", path.display());
                return Ok(RenderDevice {
                    file,
                    path: path.clone(),
                });
            }
            Err(e) => {
                log::debug!("[ALLOC] Cannot open {}: {}", path.display(), e);
            }
        }
    }

    let tried = candidates
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(CaptureError::NoDeviceAvailable { tried })
}
