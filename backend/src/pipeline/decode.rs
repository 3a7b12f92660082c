//! JPEG bytes to a packed RGB pixel buffer.
//!
//! This is a pure format transcode: no resizing and no normalization happen
//! here. Any alpha or extra channel of the decoded image is dropped.

use std::io::Cursor;

use image::{ImageFormat, ImageReader};

use super::error::DecodeError;

/// Maximum compressed payload accepted by default (20 MiB).
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

/// Maximum decoded pixel count (100 megapixels).
pub const MAX_PIXELS: u64 = 100_000_000;

const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;

#[derive(Debug, Clone, Copy)]
pub struct DecodeLimits {
    pub max_image_bytes: usize,
    pub max_pixels: u64,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            max_pixels: MAX_PIXELS,
        }
    }
}

/// Row-major R,G,B bytes. `data.len() == width * height * 3` always holds.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, DecodeError> {
        if width == 0 || height == 0 {
            return Err(DecodeError::InvalidDimensions { width, height });
        }
        if data.len() != width as usize * height as usize * 3 {
            return Err(DecodeError::BufferLength {
                width,
                height,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    /// Channel value at (`x`, `y`, `c`); caller guarantees bounds.
    #[inline]
    pub fn sample(&self, x: usize, y: usize, c: usize) -> u8 {
        self.data[(y * self.width as usize + x) * 3 + c]
    }
}

/// Decode a JPEG payload into an RGB [`PixelBuffer`].
pub fn decode_jpeg(bytes: &[u8], limits: &DecodeLimits) -> Result<PixelBuffer, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() > limits.max_image_bytes {
        return Err(DecodeError::TooLarge(bytes.len(), limits.max_image_bytes));
    }

    let format = image::guess_format(bytes)
        .map_err(|_| DecodeError::UnsupportedFormat("unrecognized".to_string()))?;
    if format != ImageFormat::Jpeg {
        return Err(DecodeError::UnsupportedFormat(format!("{:?}", format)));
    }

    // The decoder backfills missing scan data instead of failing, so a cut-off
    // upload would otherwise decode into a partially blank image.
    if !has_complete_scan(bytes) {
        return Err(DecodeError::Truncated);
    }

    let (width, height) =
        ImageReader::with_format(Cursor::new(bytes), ImageFormat::Jpeg).into_dimensions()?;
    if width == 0 || height == 0 {
        return Err(DecodeError::InvalidDimensions { width, height });
    }
    if (width as u64).saturating_mul(height as u64) > limits.max_pixels {
        return Err(DecodeError::PixelCountTooLarge { width, height });
    }

    let decoded = ImageReader::with_format(Cursor::new(bytes), ImageFormat::Jpeg).decode()?;
    let rgb = decoded.to_rgb8();
    log::debug!("Decoded {}x{} JPEG ({} bytes)", width, height, bytes.len());

    PixelBuffer::new(rgb.width(), rgb.height(), rgb.into_raw())
}

/// Walks the marker segments and reports whether an EOI follows scan data.
///
/// Segment payloads are skipped by their declared length, so an EOI inside an
/// EXIF thumbnail or a table does not count.
fn has_complete_scan(bytes: &[u8]) -> bool {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] != SOI {
        return false;
    }
    let len = bytes.len();
    let mut pos = 2;
    let mut seen_scan = false;

    loop {
        while pos < len && bytes[pos] != 0xFF {
            pos += 1;
        }
        while pos < len && bytes[pos] == 0xFF {
            pos += 1;
        }
        if pos >= len {
            return false;
        }
        let marker = bytes[pos];
        pos += 1;

        match marker {
            EOI => return seen_scan,
            0x01 | 0xD0..=0xD7 => continue,
            _ => {}
        }

        if pos + 2 > len {
            return false;
        }
        let segment = u16::from_be_bytes([bytes[pos], bytes[pos + 1]]) as usize;
        if segment < 2 || pos + segment > len {
            return false;
        }
        pos += segment;

        if marker == SOS {
            seen_scan = true;
            // entropy-coded data runs until a marker other than stuffing or RSTn
            loop {
                if pos + 1 >= len {
                    return false;
                }
                if bytes[pos] != 0xFF {
                    pos += 1;
                    continue;
                }
                match bytes[pos + 1] {
                    0x00 | 0xD0..=0xD7 => pos += 2,
                    0xFF => pos += 1,
                    _ => break,
                }
            }
        }
    }
}
