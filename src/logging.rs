//! Logger setup.
//!
//! Everything logs through the `log` facade with a bracketed component tag
//! (`[ALLOC]`, `[SESSION]`, ...). This module installs `env_logger` with the
//! same line layout the rest of the tooling expects:
//! `[timestamp] [LEVEL] [target] message`.

use chrono::Local;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use crate::error::{CaptureError, CaptureResult};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Where and how verbosely to log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    /// Filter used when `RUST_LOG` is not set (e.g. `info`, `wlmirror_lib=debug`).
    pub level: String,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Install the global logger. Fails if a logger is already installed.
pub fn init_logging(settings: &LogSettings) -> CaptureResult<()> {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&settings.level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    builder.format(|buf, record| {
        let line = format_line(
            &Local::now().format(TIMESTAMP_FORMAT).to_string(),
            record.level(),
            record.target(),
            &record.args().to_string(),
        );
        writeln!(buf, "{}", line)
    });

    if let Some(path) = &settings.file {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder
        .try_init()
        .map_err(|e| CaptureError::Config(format!("Failed to install logger: {}", e)))?;

    log::debug!("[LOG] Logging initialized (filter: {})", settings.level);
    Ok(())
}

fn format_line(timestamp: &str, level: log::Level, target: &str, message: &str) -> String {
    format!("[{}] [{}] [{}] {}", timestamp, level, target, message)
}
