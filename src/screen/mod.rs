pub mod capture;
pub mod normalize;
pub mod source;

use serde::Serialize;
use std::path::PathBuf;

use crate::display::DisplayScaling;
use crate::error::{Error, Result};

/// Default JPEG quality (1-100) for still captures.
pub const JPEG_QUALITY: u8 = 80;

/// Channel layout of a 4-byte pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgba,
    Bgra,
}

/// One captured frame as handed over by the OS, rows possibly padded.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub buffer: Vec<u8>,
    pub stride_bytes: usize,
    pub channels: usize,
    pub order: ChannelOrder,
}

impl RawFrame {
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.channels
    }

    /// Bytes of alignment padding at the end of each row.
    pub fn padding_bytes(&self) -> usize {
        self.stride_bytes.saturating_sub(self.row_bytes())
    }

    /// Cut `region` out of the frame. The result has no row padding.
    pub fn crop(&self, region: &Region) -> Result<RawFrame> {
        let (x, y) = (region.x as u32, region.y as u32);
        let (w, h) = (region.width as u32, region.height as u32);
        if x + w > self.width || y + h > self.height {
            return Err(Error::InvalidRegion(format!(
                "{}x{}+{}+{} exceeds the {}x{} screen",
                w, h, x, y, self.width, self.height
            )));
        }

        let row = w as usize * self.channels;
        let mut out = Vec::with_capacity(row * h as usize);
        for line in 0..h as usize {
            let start = (y as usize + line) * self.stride_bytes + x as usize * self.channels;
            let src = self.buffer.get(start..start + row).ok_or_else(|| {
                Error::CaptureFailed("frame buffer shorter than reported".into())
            })?;
            out.extend_from_slice(src);
        }

        Ok(RawFrame {
            width: w,
            height: h,
            buffer: out,
            stride_bytes: row,
            channels: self.channels,
            order: self.order,
        })
    }
}

/// Padding removed, channels in RGBA order: `buffer.len() == width * height * 4`.
#[derive(Debug, Clone)]
pub struct NormalizedFrame {
    pub width: u32,
    pub height: u32,
    pub buffer: Vec<u8>,
}

/// Rectangle in physical pixels of the captured screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Result<Self> {
        if width <= 0 || height <= 0 {
            return Err(Error::InvalidRegion(format!(
                "width and height must be positive, got {}x{}",
                width, height
            )));
        }
        if x < 0 || y < 0 {
            return Err(Error::InvalidRegion(format!(
                "origin must not be negative, got ({}, {})",
                x, y
            )));
        }
        Ok(Self {
            x,
            y,
            width,
            height,
        })
    }

    /// Build from a request where any field may be absent.
    pub fn from_parts(
        x: Option<i32>,
        y: Option<i32>,
        width: Option<i32>,
        height: Option<i32>,
    ) -> Result<Self> {
        match (x, y, width, height) {
            (Some(x), Some(y), Some(w), Some(h)) => Self::new(x, y, w, h),
            _ => Err(Error::InvalidRegion(
                "x, y, width and height are all required".into(),
            )),
        }
    }
}

impl std::str::FromStr for Region {
    type Err = String;

    /// `x,y,width,height`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(format!("expected x,y,width,height, got '{}'", s));
        }
        let mut nums = [0i32; 4];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| format!("'{}' is not an integer", part))?;
        }
        Region::new(nums[0], nums[1], nums[2], nums[3]).map_err(|e| e.to_string())
    }
}

/// Where an encoded still goes.
#[derive(Debug, Clone, PartialEq)]
pub enum ScreenshotOutput {
    Memory,
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub enum EncodedImage {
    Bytes(Vec<u8>),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ScreenshotResult {
    pub image: EncodedImage,
    pub logical_width: u32,
    pub logical_height: u32,
    pub physical_width: u32,
    pub physical_height: u32,
    pub scaling: DisplayScaling,
}
