//! Capture configuration.
//!
//! All knobs for one capture session in a single typed struct. Loaded from
//! `$XDG_CONFIG_HOME/wlmirror/config.json` when present, otherwise defaults.
//! The struct is passed explicitly to the pipeline; there is no global copy.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CaptureError, CaptureResult};
use crate::format::{parse_fourcc, XRGB8888};
use crate::logging::LogSettings;

/// Render nodes tried in order when opening the allocation device.
pub const DEFAULT_RENDER_NODES: [&str; 3] = [
    "/dev/dri/renderD128",
    "/dev/dri/renderD129",
    "/dev/dri/renderD130",
];

const DEFAULT_FALLBACK_FORMAT: &str = "XR24";
const CONFIG_DIR: &str = "wlmirror";
const CONFIG_FILE: &str = "config.json";

/// Centralized capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureConfig {
    /// Output to mirror. None = first output the compositor announces.
    pub output_name: Option<String>,

    /// Render-node candidates, tried in order.
    pub render_nodes: Vec<PathBuf>,

    /// Fourcc used when the compositor reports format 0.
    pub fallback_format: String,

    /// Composite the cursor into captured frames.
    pub overlay_cursor: bool,

    /// Send the allocated buffer's real modifier instead of the implicit one.
    pub explicit_modifier: bool,

    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,

    /// Append logs to this file instead of stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            output_name: None,
            render_nodes: DEFAULT_RENDER_NODES.iter().map(PathBuf::from).collect(),
            fallback_format: DEFAULT_FALLBACK_FORMAT.to_string(),
            overlay_cursor: false,
            explicit_modifier: false,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl CaptureConfig {
    /// Normalize settings to usable values.
    pub fn validate(&mut self) {
        if self.render_nodes.is_empty() {
            self.render_nodes = DEFAULT_RENDER_NODES.iter().map(PathBuf::from).collect();
        }
        if parse_fourcc(&self.fallback_format).is_none() {
            log::warn!(
                "[CONFIG] Unknown fallback format '{}', using {}",
                self.fallback_format,
                DEFAULT_FALLBACK_FORMAT
            );
            self.fallback_format = DEFAULT_FALLBACK_FORMAT.to_string();
        }
        if self.output_name.as_deref().map(str::trim) == Some("") {
            self.output_name = None;
        }
        if self.log_level.trim().is_empty() {
            self.log_level = "info".to_string();
        }
    }

    /// Fallback format as a fourcc code.
    pub fn fallback_fourcc(&self) -> u32 {
        parse_fourcc(&self.fallback_format).unwrap_or(XRGB8888)
    }

    /// Usable before [`Self::validate`], so validation warnings reach the log.
    pub fn log_settings(&self) -> LogSettings {
        let level = match self.log_level.trim() {
            "" => LogSettings::default().level,
            level => level.to_string(),
        };
        LogSettings {
            level,
            file: self.log_file.clone(),
        }
    }

    /// Default config location, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Parse a config file as written. Call [`Self::validate`] before use.
    pub fn read(path: &Path) -> CaptureResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CaptureError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| CaptureError::Config(format!("{}: {}", path.display(), e)))
    }

    /// [`Self::read`] from the default location; a missing file yields defaults.
    pub fn read_or_default() -> CaptureResult<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::read(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> CaptureResult<Self> {
        let mut config = Self::read(path)?;
        config.validate();
        Ok(config)
    }

    pub fn load_or_default() -> CaptureResult<Self> {
        let mut config = Self::read_or_default()?;
        config.validate();
        Ok(config)
    }
}
