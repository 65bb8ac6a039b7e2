//! Frame normalization.
//!
//! Two separate steps: strip per-row stride padding, then (only when the
//! source and encoder disagree) reorder color channels.

use super::{ChannelOrder, NormalizedFrame, RawFrame};
use crate::error::{Error, Result};

/// Copy `width * bytes_per_pixel` bytes of every row into a tightly packed
/// buffer of `width * height * bytes_per_pixel` bytes.
///
/// Rows in `buffer` are `width * bytes_per_pixel + padding_bytes` apart. Rows
/// the source is too short for are left zeroed.
pub fn strip_padding(
    buffer: &[u8],
    width: usize,
    height: usize,
    bytes_per_pixel: usize,
    padding_bytes: usize,
) -> Vec<u8> {
    let row = width * bytes_per_pixel;
    let stride = row + padding_bytes;

    if padding_bytes == 0 && buffer.len() >= row * height {
        return buffer[..row * height].to_vec();
    }

    let mut out = vec![0u8; row * height];
    for y in 0..height {
        let src = y * stride;
        let Some(line) = buffer.get(src..src + row) else {
            break;
        };
        out[y * row..(y + 1) * row].copy_from_slice(line);
    }
    out
}

/// Swap the red and blue channels of every 4-byte pixel in place.
pub fn swap_red_blue(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(4) {
        px.swap(0, 2);
    }
}

/// Convert pixels from `from` channel order to `to`.
pub fn reorder_channels(pixels: &mut [u8], from: ChannelOrder, to: ChannelOrder) {
    if from != to {
        // Both supported orders differ only in the R/B positions.
        swap_red_blue(pixels);
    }
}

/// Strip padding and bring the frame into RGBA order.
pub fn normalize(frame: RawFrame) -> Result<NormalizedFrame> {
    if frame.channels != 4 {
        return Err(Error::CaptureFailed(format!(
            "expected 4 bytes per pixel, got {}",
            frame.channels
        )));
    }
    if frame.stride_bytes < frame.row_bytes() {
        return Err(Error::CaptureFailed(format!(
            "row stride {} smaller than row bytes {}",
            frame.stride_bytes,
            frame.row_bytes()
        )));
    }

    let (row, height) = (frame.row_bytes(), frame.height as usize);
    let needed = match height {
        0 => 0,
        h => frame.stride_bytes * (h - 1) + row,
    };
    if frame.buffer.len() < needed {
        return Err(Error::CaptureFailed(format!(
            "frame buffer holds {} bytes, {}x{} with stride {} needs {}",
            frame.buffer.len(),
            frame.width,
            frame.height,
            frame.stride_bytes,
            needed
        )));
    }

    let mut buffer = strip_padding(
        &frame.buffer,
        frame.width as usize,
        frame.height as usize,
        frame.channels,
        frame.padding_bytes(),
    );
    reorder_channels(&mut buffer, frame.order, ChannelOrder::Rgba);

    Ok(NormalizedFrame {
        width: frame.width,
        height: frame.height,
        buffer,
    })
}
