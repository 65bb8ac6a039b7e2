//! One-shot still capture.
//!
//! raw frame (full screen or region) → strip padding / RGBA → scale-correct →
//! nearest-neighbor resize to logical size → JPEG → memory or file.
//! Single shot, no retries.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbaImage};
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, info};

use super::normalize::normalize;
use super::source::FrameSource;
use super::{
    EncodedImage, NormalizedFrame, Region, ScreenshotOutput, ScreenshotResult, JPEG_QUALITY,
};
use crate::display::DisplayResolver;
use crate::error::{Error, Result};

pub struct ScreenCapturer {
    source: Arc<dyn FrameSource>,
    display: DisplayResolver,
    quality: u8,
}

impl ScreenCapturer {
    pub fn new(source: Arc<dyn FrameSource>, display: DisplayResolver) -> Self {
        Self {
            source,
            display,
            quality: JPEG_QUALITY,
        }
    }

    /// JPEG quality, clamped to 1-100.
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self
    }

    pub async fn capture_screenshot(
        &self,
        region: Option<Region>,
        output: &ScreenshotOutput,
    ) -> Result<ScreenshotResult> {
        let region = region
            .map(|r| Region::new(r.x, r.y, r.width, r.height))
            .transpose()?;

        let source = self.source.clone();
        let mut raw = tokio::task::spawn_blocking(move || source.grab())
            .await
            .map_err(|e| Error::CaptureFailed(format!("capture task failed: {}", e)))??;
        if raw.buffer.is_empty() {
            return Err(Error::CaptureFailed("capture returned no data".into()));
        }
        if let Some(region) = region {
            raw = raw.crop(&region)?;
        }

        let scaling = self.display.resolve_scaling().await;
        let (physical_width, physical_height) = (raw.width, raw.height);
        let (logical_width, logical_height) = scaling.to_logical(physical_width, physical_height);

        let quality = self.quality;
        let jpeg = tokio::task::spawn_blocking(move || {
            let frame = normalize(raw)?;
            encode_jpeg(frame, logical_width, logical_height, quality)
        })
        .await
        .map_err(|e| Error::EncodeFailed(format!("encode task failed: {}", e)))??;

        let image = match output {
            ScreenshotOutput::Memory => EncodedImage::Bytes(jpeg),
            ScreenshotOutput::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| Error::EncodeFailed(format!("{}: {}", parent.display(), e)))?;
                }
                tokio::fs::write(path, &jpeg)
                    .await
                    .map_err(|e| Error::EncodeFailed(format!("{}: {}", path.display(), e)))?;
                info!("Screenshot written to {}", path.display());
                EncodedImage::File(path.clone())
            }
        };

        Ok(ScreenshotResult {
            image,
            logical_width,
            logical_height,
            physical_width,
            physical_height,
            scaling,
        })
    }
}

/// Resize to the logical size (nearest neighbor keeps UI text crisp), drop
/// alpha into plain sRGB and JPEG-compress.
fn encode_jpeg(frame: NormalizedFrame, width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let (src_w, src_h) = (frame.width, frame.height);
    let rgba = RgbaImage::from_raw(src_w, src_h, frame.buffer)
        .ok_or_else(|| Error::EncodeFailed("pixel buffer does not match dimensions".into()))?;

    let resized = if (src_w, src_h) == (width, height) {
        rgba
    } else {
        debug!("Resizing {}x{} -> {}x{}", src_w, src_h, width, height);
        imageops::resize(&rgba, width, height, FilterType::Nearest)
    };
    let rgb = DynamicImage::ImageRgba8(resized).to_rgb8();

    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    rgb.write_with_encoder(encoder)
        .map_err(|e| Error::EncodeFailed(e.to_string()))?;

    Ok(buf.into_inner())
}
