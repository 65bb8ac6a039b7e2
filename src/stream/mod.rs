pub mod ffmpeg;
pub mod manager;

use serde::Serialize;

use crate::devices::CaptureDevice;
use crate::error::Error;

pub use manager::StreamManager;

/// Default encoder frame rate.
pub const DEFAULT_FPS: u32 = 30;
/// Default x264 CRF (0-51, lower = higher quality).
pub const DEFAULT_CRF: u8 = 23;

/// `Idle -> Starting -> Streaming -> {Stopped, Failed}`; `Failed` goes back to
/// `Starting` at most once per session for the reduced-options retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Starting,
    Streaming,
    Stopped,
    Failed,
}

/// Output size policy for the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamResolution {
    /// Physical size divided by the display scale factor.
    #[default]
    Logical,
    /// Whatever the device delivers.
    Native,
    Fixed { width: u32, height: u32 },
}

impl std::str::FromStr for StreamResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "logical" => Ok(StreamResolution::Logical),
            "native" => Ok(StreamResolution::Native),
            other => {
                let (w, h) = other
                    .split_once('x')
                    .ok_or_else(|| format!("Unknown resolution '{}'. Use: logical, native, WxH", s))?;
                let width: u32 = w.trim().parse().map_err(|_| format!("bad width in '{}'", s))?;
                let height: u32 = h.trim().parse().map_err(|_| format!("bad height in '{}'", s))?;
                if width == 0 || height == 0 {
                    return Err(format!("resolution must be non-zero, got '{}'", s));
                }
                Ok(StreamResolution::Fixed { width, height })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOptions {
    pub fps: u32,
    pub crf: u8,
    pub resolution: StreamResolution,
    /// Device index; `None` selects the second enumerated video device.
    pub device_index: Option<u32>,
    pub capture_cursor: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            crf: DEFAULT_CRF,
            resolution: StreamResolution::Logical,
            device_index: None,
            capture_cursor: true,
        }
    }
}

/// Observable snapshot of the current (or last) session.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStatus {
    pub state: StreamState,
    pub device: Option<CaptureDevice>,
    pub retries: u32,
    pub last_error: Option<Error>,
}

impl StreamStatus {
    pub fn idle() -> Self {
        Self {
            state: StreamState::Idle,
            device: None,
            retries: 0,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolution() {
        assert_eq!("logical".parse(), Ok(StreamResolution::Logical));
        assert_eq!("Native".parse(), Ok(StreamResolution::Native));
        assert_eq!(
            "1280x720".parse(),
            Ok(StreamResolution::Fixed {
                width: 1280,
                height: 720
            })
        );
        assert!("0x720".parse::<StreamResolution>().is_err());
        assert!("huge".parse::<StreamResolution>().is_err());
    }
}
