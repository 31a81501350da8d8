use egress_vision::core_modules::geometry::BoundingBox;
use egress_vision::core_modules::page::PageImage;
use egress_vision::core_modules::token::Token;
use image::{GrayImage, ImageFormat, Luma};

/// A shaded fixture symbol drawn on the synthetic sheet.
#[derive(Debug, Clone, Copy)]
pub struct Symbol {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
    pub shade: u8,
}

impl Symbol {
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self { x0, y0, x1, y1, shade: 40 }
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.x0 + self.x1) as f64 / 2.0, (self.y0 + self.y1) as f64 / 2.0)
    }
}

/// Generates a white sheet with solid symbols on it.
pub fn sheet_with(width: u32, height: u32, symbols: &[Symbol]) -> GrayImage {
    assert!(width > 0 && height > 0, "image dimensions must be positive");
    let mut gray = GrayImage::from_pixel(width, height, Luma([255]));
    for s in symbols {
        for y in s.y0..s.y1.min(height) {
            for x in s.x0..s.x1.min(width) {
                gray.put_pixel(x, y, Luma([s.shade]));
            }
        }
    }
    gray
}

pub fn page(sheet: &str, width: u32, height: u32, symbols: &[Symbol]) -> PageImage {
    PageImage::from_gray(sheet, sheet_with(width, height, symbols)).expect("synthetic page")
}

pub fn png_bytes(width: u32, height: u32, symbols: &[Symbol]) -> Vec<u8> {
    let mut bytes = Vec::new();
    sheet_with(width, height, symbols)
        .write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("png encoding");
    bytes
}

/// A token whose box is `[x0, y0, x1, y1]`.
pub fn token(text: &str, bbox: [f64; 4], confidence: f64) -> Token {
    Token::new(text, BoundingBox::try_from(bbox).expect("token box"), confidence)
}

/// A 40x20 label placed `gap` pixels to the right of a symbol, vertically centered.
pub fn label_right_of(symbol: &Symbol, text: &str, gap: f64, confidence: f64) -> Token {
    let (_, cy) = symbol.center();
    let x0 = symbol.x1 as f64 + gap;
    token(text, [x0, cy - 10.0, x0 + 40.0, cy + 10.0], confidence)
}
