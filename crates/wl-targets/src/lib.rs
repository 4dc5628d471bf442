pub mod bounds;

use bounds::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Registry name of a `wl_output` global.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct OutputId(u32);

impl OutputId {
    pub fn new(global_name: u32) -> Self {
        Self(global_name)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for OutputId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OutputId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>()
            .map(Self)
            .map_err(|_| "Invalid output ID".to_string())
    }
}

/// Everything the compositor told us about one output.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct OutputInfo {
    pub id: Option<OutputId>,
    /// Connector name from xdg-output (e.g. `DP-1`), when the compositor offers it.
    pub name: Option<String>,
    pub description: Option<String>,
    pub make: String,
    pub model: String,
    /// Current mode in pixels.
    pub mode: PhysicalSize,
    /// Refresh rate in mHz.
    pub refresh_mhz: i32,
    pub scale: i32,
    pub logical: Option<LogicalBounds>,
}

impl OutputInfo {
    pub fn new(id: OutputId) -> Self {
        Self {
            id: Some(id),
            scale: 1,
            ..Default::default()
        }
    }

    /// Best human-readable label for logs and listings.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let make_model = self.make_model();
        if !make_model.is_empty() {
            return make_model;
        }
        match self.id {
            Some(id) => format!("wl-output-{}", id),
            None => "wl-output".to_string(),
        }
    }

    pub fn make_model(&self) -> String {
        format!("{} {}", self.make, self.model).trim().to_string()
    }

    pub fn refresh_hz(&self) -> f64 {
        self.refresh_mhz as f64 / 1000.0
    }

    /// Exact connector-name match.
    pub fn has_name(&self, requested: &str) -> bool {
        self.name.as_deref() == Some(requested)
    }

    /// Whole-string match against the description or `make model`,
    /// ignoring case. Substrings never match.
    pub fn matches_description(&self, requested: &str) -> bool {
        let requested = requested.trim();
        if requested.is_empty() {
            return false;
        }
        let same = |label: &str| label.trim().eq_ignore_ascii_case(requested);
        self.description.as_deref().is_some_and(|d| same(d)) || same(&self.make_model())
    }
}

/// Pick the capture target.
///
/// No request selects the first output seen. A request matches connector names
/// first, then whole descriptions; `None` means nothing matched.
pub fn select_output<'a>(outputs: &'a [OutputInfo], requested: Option<&str>) -> Option<&'a OutputInfo> {
    let Some(requested) = requested else {
        return outputs.first();
    };

    if let Some(exact) = outputs.iter().find(|o| o.has_name(requested)) {
        return Some(exact);
    }

    let loose = outputs.iter().find(|o| o.matches_description(requested));
    if let Some(output) = loose {
        tracing::debug!(
            "output '{}' matched by description: {}",
            requested,
            output.display_name()
        );
    }
    loose
}
