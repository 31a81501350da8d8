// THEORY:
// A `PageImage` is the "dumb" data container at the bottom of the engine: one
// rasterized blueprint sheet reduced to a single intensity channel, plus the sheet
// name every downstream record will carry as `source_sheet`.
//
// Rasterization itself belongs to an outside collaborator. This module only accepts
// what a rasterizer hands over (encoded image bytes, an already decoded grayscale
// buffer, or a raw RGBA frame buffer) and turns unreadable input into a
// `PageDecodeFailure` that is fatal to this page alone.

use std::io::Cursor;
use std::path::Path;

use image::{GrayImage, ImageFormat, Luma, RgbaImage};

use crate::error::{VisionError, VisionResult};

const RGBA_CHANNELS: usize = 4;

/// One rasterized page, stored as 8-bit intensity.
#[derive(Debug, Clone)]
pub struct PageImage {
    sheet: String,
    gray: GrayImage,
}

impl PageImage {
    /// Wraps an already decoded grayscale buffer.
    pub fn from_gray(sheet: impl Into<String>, gray: GrayImage) -> VisionResult<Self> {
        let sheet = sheet.into();
        if gray.width() == 0 || gray.height() == 0 {
            return Err(VisionError::PageDecodeFailure {
                sheet,
                reason: "page has zero width or height".to_string(),
            });
        }
        Ok(Self { sheet, gray })
    }

    /// Decodes any format the `image` crate understands (PNG, JPEG, TIFF, ...).
    pub fn decode(sheet: impl Into<String>, bytes: &[u8]) -> VisionResult<Self> {
        let sheet = sheet.into();
        match image::load_from_memory(bytes) {
            Ok(decoded) => Self::from_gray(sheet, reduce_to_luma(&decoded.to_rgba8())),
            Err(e) => Err(VisionError::PageDecodeFailure {
                sheet,
                reason: e.to_string(),
            }),
        }
    }

    /// Reads and decodes an image file from disk.
    pub fn open(sheet: impl Into<String>, path: impl AsRef<Path>) -> VisionResult<Self> {
        let sheet = sheet.into();
        match image::open(path.as_ref()) {
            Ok(decoded) => Self::from_gray(sheet, reduce_to_luma(&decoded.to_rgba8())),
            Err(e) => Err(VisionError::PageDecodeFailure {
                sheet,
                reason: format!("{}: {e}", path.as_ref().display()),
            }),
        }
    }

    /// Builds a page from a raw, tightly packed RGBA buffer.
    pub fn from_rgba(
        sheet: impl Into<String>,
        width: u32,
        height: u32,
        buffer: &[u8],
    ) -> VisionResult<Self> {
        let sheet = sheet.into();
        let expected = width as usize * height as usize * RGBA_CHANNELS;
        if buffer.len() != expected {
            return Err(VisionError::PageDecodeFailure {
                sheet,
                reason: format!(
                    "RGBA buffer holds {} bytes, expected {expected} for {width}x{height}",
                    buffer.len()
                ),
            });
        }

        let rgba = RgbaImage::from_raw(width, height, buffer.to_vec()).ok_or_else(|| {
            VisionError::PageDecodeFailure {
                sheet: sheet.clone(),
                reason: format!("{width}x{height} does not fit an RGBA buffer"),
            }
        })?;
        let gray = reduce_to_luma(&rgba);
        Self::from_gray(sheet, gray)
    }

    pub fn sheet(&self) -> &str {
        &self.sheet
    }

    pub fn width(&self) -> u32 {
        self.gray.width()
    }

    pub fn height(&self) -> u32 {
        self.gray.height()
    }

    pub fn gray(&self) -> &GrayImage {
        &self.gray
    }

    pub fn intensity(&self, x: u32, y: u32) -> u8 {
        self.gray.get_pixel(x, y).0[0]
    }

    /// Re-encodes the page as PNG, the format handed to external OCR engines.
    pub fn to_png_bytes(&self) -> VisionResult<Vec<u8>> {
        let mut bytes = Vec::new();
        self.gray
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|e| VisionError::PageDecodeFailure {
                sheet: self.sheet.clone(),
                reason: format!("PNG encoding failed: {e}"),
            })?;
        Ok(bytes)
    }
}

/// Every input path goes through here so a page has the same intensities however it
/// arrived.
fn reduce_to_luma(rgba: &RgbaImage) -> GrayImage {
    GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [red, green, blue, _] = rgba.get_pixel(x, y).0;
        Luma([luminance(red, green, blue)])
    })
}

/// Rec. 601 luma of an sRGB pixel, rounded to the nearest byte.
fn luminance(red: u8, green: u8, blue: u8) -> u8 {
    let y = 0.299 * red as f64 + 0.587 * green as f64 + 0.114 * blue as f64;
    y.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_buffer_is_reduced_to_luminance() {
        // 2x1 page: one black pixel, one white pixel.
        let buffer = [0, 0, 0, 255, 255, 255, 255, 255];
        let page = PageImage::from_rgba("E-101", 2, 1, &buffer).expect("valid buffer");
        assert_eq!(page.sheet(), "E-101");
        assert_eq!(page.intensity(0, 0), 0);
        assert_eq!(page.intensity(1, 0), 255);
    }

    #[test]
    fn rgba_buffer_of_wrong_length_is_a_decode_failure() {
        let err = PageImage::from_rgba("E-101", 4, 4, &[0u8; 10]).unwrap_err();
        assert!(matches!(err, VisionError::PageDecodeFailure { ref sheet, .. } if sheet == "E-101"));
    }

    #[test]
    fn garbage_bytes_are_a_decode_failure() {
        let err = PageImage::decode("Page 3", b"definitely not an image").unwrap_err();
        assert!(matches!(err, VisionError::PageDecodeFailure { .. }));
    }

    #[test]
    fn png_round_trip_preserves_dimensions() {
        let page = PageImage::from_gray("Page 1", GrayImage::from_pixel(12, 7, Luma([200]))).expect("page");
        let png = page.to_png_bytes().expect("encode");
        let decoded = PageImage::decode("Page 1", &png).expect("decode");
        assert_eq!((decoded.width(), decoded.height()), (12, 7));
        assert_eq!(decoded.intensity(5, 5), 200);
    }

    #[test]
    fn encoded_and_raw_colour_pages_agree() {
        let pixels = vec![255, 0, 0, 255, 20, 160, 90, 255, 250, 250, 240, 255];
        let rgba = RgbaImage::from_raw(3, 1, pixels.clone()).expect("3x1 buffer");
        let mut png = Vec::new();
        rgba.write_to(&mut Cursor::new(&mut png), ImageFormat::Png).expect("encode");

        let raw = PageImage::from_rgba("E-101", 3, 1, &pixels).expect("raw page");
        let decoded = PageImage::decode("E-101", &png).expect("decoded page");
        assert_eq!(raw.intensity(0, 0), 76);
        assert_eq!(decoded.gray(), raw.gray());
    }

    #[test]
    fn empty_page_is_rejected() {
        assert!(PageImage::from_gray("blank", GrayImage::new(0, 0)).is_err());
    }
}
