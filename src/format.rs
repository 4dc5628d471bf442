//! DRM fourcc and format-modifier helpers.

use drm_fourcc::{DrmFourcc, DrmModifier};
use std::fmt;

/// `DRM_FORMAT_MOD_INVALID`: no explicit modifier, the driver picks the layout.
pub const MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

/// `DRM_FORMAT_MOD_LINEAR`.
pub const MOD_LINEAR: u64 = 0;

/// `DRM_FORMAT_XRGB8888` ("XR24").
pub const XRGB8888: u32 = DrmFourcc::Xrgb8888 as u32;

/// Pixel format negotiated with the compositor for the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub fourcc: u32,
    pub modifier: u64,
}

impl FrameFormat {
    pub fn new(fourcc: u32, modifier: u64) -> Self {
        Self { fourcc, modifier }
    }

    pub fn has_explicit_modifier(&self) -> bool {
        self.modifier != MOD_INVALID
    }

    /// Modifier as (hi, lo) halves for wire/attribute transport.
    pub fn modifier_halves(&self) -> (u32, u32) {
        split_modifier(self.modifier)
    }

    pub fn drm_fourcc(&self) -> Option<DrmFourcc> {
        DrmFourcc::try_from(self.fourcc).ok()
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(0x{:08x}) mod={}",
            fourcc_name(self.fourcc),
            self.fourcc,
            modifier_name(self.modifier)
        )
    }
}

/// Split a 64-bit modifier into (hi, lo) 32-bit halves.
pub fn split_modifier(modifier: u64) -> (u32, u32) {
    ((modifier >> 32) as u32, (modifier & 0xffff_ffff) as u32)
}

/// Render a fourcc as its four ASCII characters, `????` for unprintable codes.
pub fn fourcc_name(fourcc: u32) -> String {
    let bytes = fourcc.to_le_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        bytes.iter().map(|&b| b as char).collect()
    } else {
        "????".to_string()
    }
}

/// Parse a four-character code such as `XR24`. Short codes are space-padded.
pub fn parse_fourcc(code: &str) -> Option<u32> {
    if code.is_empty() || code.len() > 4 || !code.is_ascii() {
        return None;
    }
    let mut bytes = [b' '; 4];
    bytes[..code.len()].copy_from_slice(code.as_bytes());
    let value = u32::from_le_bytes(bytes);
    DrmFourcc::try_from(value).ok().map(|f| f as u32)
}

/// Compositors may report format 0 on the dmabuf event; fall back in that case.
pub fn resolve_reported_format(reported: u32, fallback: u32) -> u32 {
    if reported == 0 {
        fallback
    } else {
        reported
    }
}

fn modifier_name(modifier: u64) -> String {
    match DrmModifier::from(modifier) {
        DrmModifier::Invalid => "invalid".to_string(),
        DrmModifier::Linear => "linear".to_string(),
        _ => format!("0x{:016x}", modifier),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_modifier() {
        assert_eq!(split_modifier(MOD_INVALID), (0x00ff_ffff, 0xffff_ffff));
        assert_eq!(split_modifier(MOD_LINEAR), (0, 0));
        assert_eq!(split_modifier(0x0100_0000_0000_0002), (0x0100_0000, 2));
    }

    #[test]
    fn test_modifier_constants_match_drm() {
        assert_eq!(u64::from(DrmModifier::Invalid), MOD_INVALID);
        assert_eq!(u64::from(DrmModifier::Linear), MOD_LINEAR);
    }

    #[test]
    fn test_fourcc_name() {
        assert_eq!(fourcc_name(XRGB8888), "XR24");
        assert_eq!(fourcc_name(DrmFourcc::Argb8888 as u32), "AR24");
        assert_eq!(fourcc_name(0), "????");
    }

    #[test]
    fn test_parse_fourcc() {
        assert_eq!(parse_fourcc("XR24"), Some(XRGB8888));
        assert_eq!(parse_fourcc("AB24"), Some(DrmFourcc::Abgr8888 as u32));
        assert_eq!(parse_fourcc(""), None);
        assert_eq!(parse_fourcc("XRGB8888"), None);
        assert_eq!(parse_fourcc("ZZZZ"), None);
    }

    #[test]
    fn test_resolve_reported_format() {
        assert_eq!(resolve_reported_format(0, XRGB8888), XRGB8888);
        let argb = DrmFourcc::Argb8888 as u32;
        assert_eq!(resolve_reported_format(argb, XRGB8888), argb);
    }

    #[test]
    fn test_frame_format_display() {
        let format = FrameFormat::new(XRGB8888, MOD_INVALID);
        assert!(!format.has_explicit_modifier());
        assert_eq!(format.to_string(), "XR24(0x34325258) mod=invalid");
        assert_eq!(format.drm_fourcc(), Some(DrmFourcc::Xrgb8888));
    }
}
