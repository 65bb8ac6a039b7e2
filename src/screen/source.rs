//! Raw frame acquisition from the OS.

use scrap::{Capturer, Display};
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{ChannelOrder, RawFrame};
use crate::error::{Error, Result};

/// Something that can grab one full-screen frame. Blocking; callers run it
/// on a blocking thread.
pub trait FrameSource: Send + Sync + 'static {
    fn grab(&self) -> Result<RawFrame>;
}

/// Primary display via `scrap` (BGRA, stride may include padding).
pub struct ScrapSource {
    timeout: Duration,
}

impl ScrapSource {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ScrapSource {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl FrameSource for ScrapSource {
    fn grab(&self) -> Result<RawFrame> {
        // Capturer is !Send on X11, so it lives and dies on this thread.
        let display =
            Display::primary().map_err(|e| Error::CaptureFailed(format!("no display: {}", e)))?;
        let mut capturer = Capturer::new(display)
            .map_err(|e| Error::CaptureFailed(format!("failed to start capturer: {}", e)))?;
        let width = capturer.width();
        let height = capturer.height();
        let deadline = Instant::now() + self.timeout;

        loop {
            match capturer.frame() {
                Ok(frame) => {
                    if frame.is_empty() || height == 0 {
                        return Err(Error::CaptureFailed("capture returned no data".into()));
                    }
                    let stride_bytes = frame.len() / height;
                    debug!("Captured {}x{} frame, stride {}", width, height, stride_bytes);
                    return Ok(RawFrame {
                        width: width as u32,
                        height: height as u32,
                        buffer: frame.to_vec(),
                        stride_bytes,
                        channels: 4,
                        order: ChannelOrder::Bgra,
                    });
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::CaptureFailed("timed out waiting for a frame".into()));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(Error::CaptureFailed(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::FrameSource;
    use crate::error::Result;
    use crate::screen::{ChannelOrder, RawFrame};

    /// Hands out the same frame on every grab.
    pub struct StaticSource(pub RawFrame);

    impl FrameSource for StaticSource {
        fn grab(&self) -> Result<RawFrame> {
            Ok(self.0.clone())
        }
    }

    /// Unpadded mid-grey RGBA frame.
    pub fn rgba_frame(width: u32, height: u32) -> RawFrame {
        RawFrame {
            width,
            height,
            buffer: vec![128; (width * height * 4) as usize],
            stride_bytes: (width * 4) as usize,
            channels: 4,
            order: ChannelOrder::Rgba,
        }
    }
}
