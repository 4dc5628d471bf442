//! Central error types for wlmirror.
//!
//! Every failure the capture pipeline can report lives in [`CaptureError`].
//! [`CaptureError::class`] sorts them into setup-time, per-frame and
//! recoverable failures so callers can decide whether to abort startup.

use thiserror::Error;

/// How a failure should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Capture cannot be brought up; abort startup.
    SetupFatal,
    /// The running session is over; do not call `next_frame` again.
    PerFrameFatal,
    /// Logged and worked around at a lower layer.
    Recoverable,
}

/// Main error type for capture operations.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// None of the candidate render nodes could be opened
    #[error("No render device available (tried {tried})")]
    NoDeviceAvailable { tried: String },

    /// GBM device creation failed on an opened render node
    #[error("Allocator init failed: {0}")]
    AllocatorInitFailed(String),

    /// Every allocation strategy was rejected by the driver
    #[error("Allocation exhausted: {width}x{height} {format} rejected by all {attempts} strategies")]
    AllocationExhausted {
        width: u32,
        height: u32,
        format: String,
        attempts: usize,
    },

    /// A plane could not be exported as a dmabuf fd
    #[error("Export failed: {0}")]
    ExportFailed(String),

    /// The graphics context or the compositor rejected the dmabuf
    #[error("Import failed: {0}")]
    ImportFailed(String),

    /// A required GL/EGL entry point is missing
    #[error("Extension missing: {0}")]
    ExtensionMissing(String),

    /// Compositor global absent or offered below the required version
    #[error("Missing protocol: {interface} v{required} (offered: {offered})")]
    MissingProtocol {
        interface: &'static str,
        required: u32,
        offered: String,
    },

    /// Compositor reported a non-positive frame size
    #[error("Invalid geometry from compositor: {width}x{height}")]
    InvalidGeometry { width: i64, height: i64 },

    /// Compositor reported the screencopy as failed
    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    /// Requested output name was not discovered
    #[error("Output not found: {0}")]
    OutputNotFound(String),

    /// Compositor never advertised a dmabuf format for the frame
    #[error("Compositor offers no dmabuf format for this output")]
    DmabufUnavailable,

    /// No EGL display is current on this thread
    #[error("No current EGL display (the window must use an EGL context)")]
    NoCurrentContext,

    /// Could not connect to the compositor socket
    #[error("Compositor connection failed: {0}")]
    Connect(String),

    /// Event queue failed while a frame was in flight
    #[error("Compositor dispatch failed: {0}")]
    Dispatch(String),

    /// Event queue failed before the session reached steady state
    #[error("Compositor handshake failed: {0}")]
    Handshake(String),

    /// Operation requires a live session
    #[error("Capture session not initialized")]
    NotInitialized,

    /// Configuration could not be read or parsed
    #[error("Config error: {0}")]
    Config(String),

    /// Filesystem / device I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Taxonomy bucket for this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            CaptureError::CaptureFailed(_) | CaptureError::Dispatch(_) => ErrorClass::PerFrameFatal,
            CaptureError::NotInitialized => ErrorClass::PerFrameFatal,
            _ => ErrorClass::SetupFatal,
        }
    }

    pub fn is_setup_fatal(&self) -> bool {
        self.class() == ErrorClass::SetupFatal
    }

    /// Re-tag an event-queue failure seen while bringing the session up.
    pub fn during_setup(self) -> Self {
        match self {
            CaptureError::Dispatch(msg) => CaptureError::Handshake(msg),
            other => other,
        }
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::Config(err.to_string())
    }
}

/// Type alias for Results using CaptureError.
pub type CaptureResult<T> = Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CaptureError::CaptureFailed("screencopy failed".to_string());
        assert_eq!(err.to_string(), "Capture failed: screencopy failed");

        let err = CaptureError::MissingProtocol {
            interface: "zwlr_screencopy_manager_v1",
            required: 3,
            offered: "v2".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Missing protocol: zwlr_screencopy_manager_v1 v3 (offered: v2)"
        );
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            CaptureError::NoDeviceAvailable { tried: String::new() }.class(),
            ErrorClass::SetupFatal
        );
        assert_eq!(
            CaptureError::ExtensionMissing("glEGLImageTargetTexture2DOES".into()).class(),
            ErrorClass::SetupFatal
        );
        assert_eq!(
            CaptureError::CaptureFailed("x".into()).class(),
            ErrorClass::PerFrameFatal
        );
        assert!(CaptureError::OutputNotFound("DP-9".into()).is_setup_fatal());
        assert!(!CaptureError::NotInitialized.is_setup_fatal());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: CaptureError = io_err.into();
        assert!(matches!(err, CaptureError::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: CaptureError = json_err.into();
        assert!(matches!(err, CaptureError::Config(_)));
    }

    #[test]
    fn test_dispatch_during_setup_is_setup_fatal() {
        let err = CaptureError::Dispatch("Broken pipe".into());
        assert_eq!(err.class(), ErrorClass::PerFrameFatal);

        let err = err.during_setup();
        assert!(matches!(err, CaptureError::Handshake(_)));
        assert!(err.is_setup_fatal());
        assert_eq!(err.to_string(), "Compositor handshake failed: Broken pipe");

        assert!(matches!(
            CaptureError::CaptureFailed("x".into()).during_setup(),
            CaptureError::CaptureFailed(_)
        ));
    }
}
