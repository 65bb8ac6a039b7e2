//! Display geometry: logical vs. physical resolution of the primary display.
//!
//! Queried fresh on every capture or stream start since displays may be
//! hot-plugged. Never fails: any query or parse problem degrades to identity
//! scaling with a warning.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::external::ExternalCommand;

/// Ratio of physical to logical pixels per axis. Both values are > 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayScaling {
    pub scale_x: f64,
    pub scale_y: f64,
}

impl DisplayScaling {
    pub const IDENTITY: DisplayScaling = DisplayScaling {
        scale_x: 1.0,
        scale_y: 1.0,
    };

    /// Logical size of a physical extent: `floor(physical / scale)`, at least 1.
    pub fn to_logical(&self, physical_width: u32, physical_height: u32) -> (u32, u32) {
        let w = (physical_width as f64 / self.scale_x).floor() as u32;
        let h = (physical_height as f64 / self.scale_y).floor() as u32;
        (w.max(1), h.max(1))
    }
}

impl Default for DisplayScaling {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrimaryDisplay {
    pub name: Option<String>,
    pub logical: Size,
    pub physical: Size,
}

impl PrimaryDisplay {
    pub fn scaling(&self) -> DisplayScaling {
        DisplayScaling {
            scale_x: self.physical.width as f64 / self.logical.width as f64,
            scale_y: self.physical.height as f64 / self.logical.height as f64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayInfo {
    pub scaling: DisplayScaling,
    pub primary: Option<PrimaryDisplay>,
}

impl DisplayInfo {
    fn unknown() -> Self {
        Self {
            scaling: DisplayScaling::IDENTITY,
            primary: None,
        }
    }
}

// system_profiler SPDisplaysDataType -json
#[derive(Deserialize)]
struct DisplaysReport {
    #[serde(rename = "SPDisplaysDataType", default)]
    adapters: Vec<Adapter>,
}

#[derive(Deserialize)]
struct Adapter {
    #[serde(rename = "spdisplays_ndrvs", default)]
    displays: Vec<ReportedDisplay>,
}

#[derive(Deserialize)]
struct ReportedDisplay {
    #[serde(rename = "_name")]
    name: Option<String>,
    #[serde(rename = "spdisplays_main")]
    main: Option<String>,
    #[serde(rename = "_spdisplays_resolution")]
    resolution: Option<String>,
    #[serde(rename = "_spdisplays_pixels")]
    pixels: Option<String>,
}

/// Parse a display metadata report into the primary display's geometry.
pub fn parse_display_report(report: &str) -> Result<PrimaryDisplay, String> {
    let parsed: DisplaysReport =
        serde_json::from_str(report).map_err(|e| format!("malformed display report: {}", e))?;

    let main = parsed
        .adapters
        .iter()
        .flat_map(|a| a.displays.iter())
        .find(|d| d.main.as_deref() == Some("spdisplays_yes"))
        .ok_or_else(|| "no primary display in report".to_string())?;

    let logical = main
        .resolution
        .as_deref()
        .and_then(parse_dimensions)
        .ok_or_else(|| "cannot parse logical resolution".to_string())?;
    let physical = main
        .pixels
        .as_deref()
        .and_then(parse_dimensions)
        .ok_or_else(|| "cannot parse physical resolution".to_string())?;

    Ok(PrimaryDisplay {
        name: main.name.clone(),
        logical,
        physical,
    })
}

/// Finds the first `W x H` in strings like `"1440 x 900 @ 60.00Hz"`.
fn parse_dimensions(text: &str) -> Option<Size> {
    static DIMS: OnceLock<Regex> = OnceLock::new();
    let re = DIMS.get_or_init(|| Regex::new(r"(\d+) x (\d+)").expect("valid regex"));
    let caps = re.captures(text)?;
    let width: u32 = caps[1].parse().ok()?;
    let height: u32 = caps[2].parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some(Size { width, height })
}

/// Queries the OS display metadata tool.
#[derive(Debug, Clone)]
pub struct DisplayResolver {
    query: ExternalCommand,
}

impl Default for DisplayResolver {
    fn default() -> Self {
        Self::new(ExternalCommand::new("system_profiler").with_args(["SPDisplaysDataType", "-json"]))
    }
}

impl DisplayResolver {
    pub fn new(query: ExternalCommand) -> Self {
        Self { query }
    }

    pub async fn resolve(&self) -> DisplayInfo {
        let report = match self.query.run_stdout(&[]).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Display metadata query failed, assuming 1x scaling: {}", e);
                return DisplayInfo::unknown();
            }
        };

        match parse_display_report(&report) {
            Ok(primary) => {
                let scaling = primary.scaling();
                debug!(
                    "Primary display {}x{} logical, {}x{} physical",
                    primary.logical.width,
                    primary.logical.height,
                    primary.physical.width,
                    primary.physical.height
                );
                DisplayInfo {
                    scaling,
                    primary: Some(primary),
                }
            }
            Err(reason) => {
                warn!("Display scaling unavailable, assuming 1x: {}", reason);
                DisplayInfo::unknown()
            }
        }
    }

    pub async fn resolve_scaling(&self) -> DisplayScaling {
        self.resolve().await.scaling
    }
}
