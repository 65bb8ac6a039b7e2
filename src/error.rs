use thiserror::Error;

/// Failures surfaced by the capture and streaming core.
///
/// Messages are kept as strings so the last session error can be cloned into
/// the observable stream status.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("invalid region: {0}")]
    InvalidRegion(String),

    #[error("screen capture failed: {0}")]
    CaptureFailed(String),

    #[error("image encoding failed: {0}")]
    EncodeFailed(String),

    #[error("capture device listing unavailable: {0}")]
    DeviceListUnavailable(String),

    #[error("no video capture device found")]
    NoCaptureDevice,

    #[error("at least {required} video devices are required, found {found}")]
    InsufficientDevices { found: usize, required: usize },

    #[error("video device [{0}] is not in the enumerated device list")]
    UnknownDevice(u32),

    #[error("{0}")]
    DeviceBusy(String),

    #[error("{0}")]
    StreamError(String),
}

impl Error {
    /// Stable machine-readable name, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidRegion(_) => "InvalidRegion",
            Error::CaptureFailed(_) => "CaptureFailed",
            Error::EncodeFailed(_) => "EncodeFailed",
            Error::DeviceListUnavailable(_) => "DeviceListUnavailable",
            Error::NoCaptureDevice => "NoCaptureDevice",
            Error::InsufficientDevices { .. } => "InsufficientDevices",
            Error::UnknownDevice(_) => "UnknownDevice",
            Error::DeviceBusy(_) => "DeviceBusy",
            Error::StreamError(_) => "StreamError",
        }
    }

    /// True for errors caused by the caller's input rather than the environment.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::InvalidRegion(_) | Error::UnknownDevice(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(Error::InvalidRegion("x".into()).kind(), "InvalidRegion");
        assert_eq!(
            Error::InsufficientDevices { found: 1, required: 2 }.kind(),
            "InsufficientDevices"
        );
        assert!(Error::InvalidRegion("x".into()).is_client_error());
        assert!(!Error::StreamError("boom".into()).is_client_error());
    }

    #[test]
    fn test_stream_error_is_verbatim() {
        let text = "[avfoundation @ 0x1] Configuration of video device failed";
        assert_eq!(Error::StreamError(text.into()).to_string(), text);
    }
}
