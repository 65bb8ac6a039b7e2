//! Encoder command line and failure classification.

use crate::display::Size;

/// Input pixel format requested from the capture device.
const CAPTURE_PIX_FMT: &str = "uyvy422";

/// Everything that varies between encoder launches.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderArgs {
    pub device_index: u32,
    pub fps: u32,
    /// x264 CRF, 0-51, lower = higher quality.
    pub crf: u8,
    /// Output size; `None` keeps the device's native size.
    pub size: Option<Size>,
    pub capture_cursor: bool,
}

impl EncoderArgs {
    /// The fallback set used after a device configuration failure: no
    /// output size and no cursor/click capture.
    pub fn reduced(&self) -> Self {
        Self {
            size: None,
            capture_cursor: false,
            ..self.clone()
        }
    }
}

/// Build the argument list for a low-latency H.264 encode of an AVFoundation
/// device into fragmented MP4 on stdout.
pub fn build_encoder_args(args: &EncoderArgs) -> Vec<String> {
    let fps = args.fps.max(1).to_string();
    let crf = args.crf.min(51).to_string();

    let mut out: Vec<String> = ["-hide_banner", "-nostats", "-f", "avfoundation"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if args.capture_cursor {
        out.extend(
            ["-capture_cursor", "1", "-capture_mouse_clicks", "1"]
                .iter()
                .map(|s| s.to_string()),
        );
    }
    out.extend([
        "-pix_fmt".to_string(),
        CAPTURE_PIX_FMT.to_string(),
        "-framerate".to_string(),
        fps.clone(),
        "-probesize".to_string(),
        "32".to_string(),
        "-analyzeduration".to_string(),
        "0".to_string(),
        "-i".to_string(),
        format!("{}:none", args.device_index),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "ultrafast".to_string(),
        "-tune".to_string(),
        "zerolatency".to_string(),
        "-crf".to_string(),
        crf,
        "-g".to_string(),
        (args.fps.max(1) * 2).to_string(),
        "-bufsize".to_string(),
        "1000k".to_string(),
        "-maxrate".to_string(),
        "1500k".to_string(),
        "-r".to_string(),
        fps,
    ]);
    if let Some(size) = args.size {
        out.push("-s".into());
        out.push(format!("{}x{}", size.width, size.height));
    }
    out.extend(
        [
            "-an",
            "-movflags",
            "frag_keyframe+empty_moov+default_base_moof",
            "-f",
            "mp4",
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    out
}

/// What an encoder failure means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Another process holds the device. Not retried.
    DeviceBusy,
    /// The device rejected the requested options. Retried once, reduced.
    DeviceConfiguration,
    Other,
}

const BUSY_SIGNATURES: &[&str] = &[
    "device or resource busy",
    "device busy",
    "device unavailable",
    "device is not available",
];

const CONFIGURATION_SIGNATURES: &[&str] = &["configuration of video device failed"];

/// Classify encoder diagnostic text.
pub fn classify_failure(diagnostics: &str) -> FailureKind {
    let text = diagnostics.to_lowercase();
    if BUSY_SIGNATURES.iter().any(|s| text.contains(s)) {
        FailureKind::DeviceBusy
    } else if CONFIGURATION_SIGNATURES.iter().any(|s| text.contains(s)) {
        FailureKind::DeviceConfiguration
    } else {
        FailureKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full() -> EncoderArgs {
        EncoderArgs {
            device_index: 1,
            fps: 15,
            crf: 23,
            size: Some(Size {
                width: 1440,
                height: 900,
            }),
            capture_cursor: true,
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        let pos = args.iter().position(|a| a == flag)?;
        args.get(pos + 1).map(String::as_str)
    }

    #[test]
    fn test_full_args() {
        let args = build_encoder_args(&full());
        assert_eq!(value_after(&args, "-i"), Some("1:none"));
        assert_eq!(value_after(&args, "-framerate"), Some("15"));
        assert_eq!(value_after(&args, "-crf"), Some("23"));
        assert_eq!(value_after(&args, "-s"), Some("1440x900"));
        assert_eq!(value_after(&args, "-capture_cursor"), Some("1"));
        assert_eq!(value_after(&args, "-tune"), Some("zerolatency"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));

        // input options precede the input
        let input = args.iter().position(|a| a == "-i").unwrap();
        let cursor = args.iter().position(|a| a == "-capture_cursor").unwrap();
        assert!(cursor < input);
    }

    #[test]
    fn test_reduced_args_drop_size_and_cursor() {
        let args = build_encoder_args(&full().reduced());
        assert!(!args.iter().any(|a| a == "-s"));
        assert!(!args.iter().any(|a| a == "-capture_cursor"));
        assert!(!args.iter().any(|a| a == "-capture_mouse_clicks"));
        assert_eq!(value_after(&args, "-i"), Some("1:none"));
    }

    #[test]
    fn test_crf_is_clamped() {
        let mut opts = full();
        opts.crf = 99;
        assert_eq!(value_after(&build_encoder_args(&opts), "-crf"), Some("51"));
    }

    #[test]
    fn test_classify_failure() {
        assert_eq!(
            classify_failure("[avfoundation @ 0x1] Configuration of video device failed, falling back to default."),
            FailureKind::DeviceConfiguration
        );
        assert_eq!(
            classify_failure("0:none: Device or resource busy"),
            FailureKind::DeviceBusy
        );
        assert_eq!(
            classify_failure("Unknown encoder 'libx264'"),
            FailureKind::Other
        );
        assert_eq!(classify_failure(""), FailureKind::Other);
    }
}
