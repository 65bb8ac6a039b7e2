use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::devices::CaptureDevice;
use crate::error::{Error, Result};
use crate::screen::{EncodedImage, Region, ScreenshotResult};
use crate::stream::{StreamState, StreamStatus};

/// Requests a subscriber may send as JSON text frames.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    StartStream,
    StopStream,
    StreamStatus,
    Screenshot {
        #[serde(default)]
        region: Option<RegionRequest>,
    },
    ListDevices,
}

/// Region as it arrives on the wire; every field is checked by
/// [`Region::from_parts`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct RegionRequest {
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub width: Option<i32>,
    pub height: Option<i32>,
}

impl RegionRequest {
    pub fn to_region(self) -> Result<Region> {
        Region::from_parts(self.x, self.y, self.width, self.height)
    }
}

/// Messages pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    VideoChunk {
        seq: u64,
        /// Base64 of the encoder output bytes.
        data: String,
    },
    StreamStatus {
        state: StreamState,
        device: Option<CaptureDevice>,
        retries: u32,
        error: Option<ErrorReport>,
    },
    Screenshot {
        data: String,
        mime: &'static str,
        logical_width: u32,
        logical_height: u32,
        physical_width: u32,
        physical_height: u32,
        scale_x: f64,
        scale_y: f64,
    },
    Devices {
        devices: Vec<CaptureDevice>,
    },
    Error(ErrorReport),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub kind: String,
    pub message: String,
}

impl From<&Error> for ErrorReport {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

impl ServerEvent {
    pub fn video_chunk(seq: u64, data: &[u8]) -> Self {
        ServerEvent::VideoChunk {
            seq,
            data: STANDARD.encode(data),
        }
    }

    pub fn status(status: &StreamStatus) -> Self {
        ServerEvent::StreamStatus {
            state: status.state,
            device: status.device.clone(),
            retries: status.retries,
            error: status.last_error.as_ref().map(ErrorReport::from),
        }
    }

    /// Only in-memory results can be sent; file output is a local concern.
    pub fn screenshot(shot: &ScreenshotResult) -> Option<Self> {
        let EncodedImage::Bytes(bytes) = &shot.image else {
            return None;
        };
        Some(ServerEvent::Screenshot {
            data: STANDARD.encode(bytes),
            mime: "image/jpeg",
            logical_width: shot.logical_width,
            logical_height: shot.logical_height,
            physical_width: shot.physical_width,
            physical_height: shot.physical_height,
            scale_x: shot.scaling.scale_x,
            scale_y: shot.scaling.scale_y,
        })
    }

    pub fn error(e: &Error) -> Self {
        ServerEvent::Error(e.into())
    }

    /// Error not tied to a core operation, e.g. an unparseable request.
    pub fn bad_request(message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorReport {
            kind: "BadRequest".into(),
            message: message.into(),
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| internal_error_json(&e.to_string()))
    }
}

fn internal_error_json(message: &str) -> String {
    serde_json::json!({
        "type": "error",
        "kind": "Internal",
        "message": message,
    })
    .to_string()
}
