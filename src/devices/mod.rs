//! Capture device discovery through the encoder's AVFoundation device listing.
//!
//! The report is free text on stderr:
//!
//! ```text
//! [AVFoundation indev @ 0x7f8] AVFoundation video devices:
//! [AVFoundation indev @ 0x7f8] [0] FaceTime HD Camera
//! [AVFoundation indev @ 0x7f8] [1] Capture screen 0
//! [AVFoundation indev @ 0x7f8] AVFoundation audio devices:
//! [AVFoundation indev @ 0x7f8] [0] MacBook Pro Microphone
//! ```

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::external::ExternalCommand;

const VIDEO_HEADER: &str = "AVFoundation video devices:";
const AUDIO_HEADER: &str = "AVFoundation audio devices:";

/// Appended to the encoder command to produce the device report.
pub const LIST_DEVICES_ARGS: &[&str] = &[
    "-hide_banner",
    "-f",
    "avfoundation",
    "-list_devices",
    "true",
    "-i",
    "",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Video,
    Audio,
}

/// Snapshot of one OS capture input at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureDevice {
    pub index: u32,
    pub name: String,
    pub kind: DeviceKind,
}

impl std::fmt::Display for CaptureDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.index, self.name)
    }
}

/// Parse the two-section device report. Lines before the first section
/// header or not shaped like a device line are ignored.
pub fn parse_device_report(report: &str) -> Vec<CaptureDevice> {
    static DEVICE_LINE: OnceLock<Regex> = OnceLock::new();
    let re = DEVICE_LINE
        .get_or_init(|| Regex::new(r"^\[[^\]]*\] \[(\d+)\] (.*)$").expect("valid regex"));

    let mut devices = Vec::new();
    let mut section = None;

    for line in report.lines() {
        let line = line.trim_end();
        if line.contains(VIDEO_HEADER) {
            section = Some(DeviceKind::Video);
            continue;
        }
        if line.contains(AUDIO_HEADER) {
            section = Some(DeviceKind::Audio);
            continue;
        }
        let Some(kind) = section else { continue };
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let Ok(index) = caps[1].parse() else { continue };
        devices.push(CaptureDevice {
            index,
            name: caps[2].trim().to_string(),
            kind,
        });
    }

    devices
}

/// Run the device listing through `encoder` and parse it.
pub async fn list_devices(encoder: &ExternalCommand) -> Result<Vec<CaptureDevice>> {
    let report = encoder.run_combined(LIST_DEVICES_ARGS).await.map_err(|e| {
        Error::DeviceListUnavailable(format!("{}: {}", encoder.program().to_string_lossy(), e))
    })?;
    let devices = parse_device_report(&report);
    debug!("Enumerated {} capture devices", devices.len());
    Ok(devices)
}

pub fn video_devices(devices: &[CaptureDevice]) -> Vec<CaptureDevice> {
    devices
        .iter()
        .filter(|d| d.kind == DeviceKind::Video)
        .cloned()
        .collect()
}

/// The platform's first video device is frequently a non-capturable
/// placeholder, so streaming wants at least two.
pub const MIN_VIDEO_DEVICES: usize = 2;

/// Pick the streaming input from the enumerated devices.
///
/// With `configured` set, that index must be present; otherwise the second
/// enumerated video device is used.
pub fn select_video_device(
    devices: &[CaptureDevice],
    configured: Option<u32>,
) -> Result<CaptureDevice> {
    let video = video_devices(devices);
    if video.is_empty() {
        return Err(Error::NoCaptureDevice);
    }
    if video.len() < MIN_VIDEO_DEVICES {
        return Err(Error::InsufficientDevices {
            found: video.len(),
            required: MIN_VIDEO_DEVICES,
        });
    }

    match configured {
        Some(index) => video
            .into_iter()
            .find(|d| d.index == index)
            .ok_or(Error::UnknownDevice(index)),
        None => Ok(video[1].clone()),
    }
}
