// THEORY:
// The overlay is the tester's visual check: every fixture record is drawn back onto
// its page so a person can see at a glance which symbols were found, which label each
// one took, and which were left unclassified. Colour encodes the fixture type.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use egress_vision::core_modules::classifier::{FixtureRow, FixtureType};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

const OUTLINE_THICKNESS: i32 = 3;
const LABEL_MARKER: u32 = 8;

fn colour_for(fixture_type: FixtureType) -> Rgb<u8> {
    match fixture_type {
        FixtureType::EmergencyLight => Rgb([220, 30, 30]),
        FixtureType::EmergencyExit => Rgb([30, 160, 30]),
        FixtureType::Wallpack => Rgb([30, 90, 220]),
        FixtureType::RecessedLed => Rgb([200, 140, 0]),
        FixtureType::Other => Rgb([128, 128, 128]),
    }
}

/// Draws the rows belonging to one page onto a copy of `page`.
pub fn draw_fixtures(page: &RgbImage, rows: &[&FixtureRow]) -> RgbImage {
    let mut canvas = page.clone();
    for row in rows {
        let [x_min, y_min, x_max, y_max] = row.bounding_box;
        let colour = colour_for(row.fixture_type);

        // Nested rectangles give a visible outline on large scans.
        for inset in 0..OUTLINE_THICKNESS {
            let width = (x_max - x_min) as i32 + 2 * inset;
            let height = (y_max - y_min) as i32 + 2 * inset;
            if width <= 0 || height <= 0 {
                continue;
            }
            let rect = Rect::at(x_min as i32 - inset, y_min as i32 - inset).of_size(width as u32, height as u32);
            draw_hollow_rect_mut(&mut canvas, rect, colour);
        }

        // A solid corner marker means a symbol label was attached.
        if row.symbol.is_some() {
            let marker = Rect::at(x_min as i32, y_min as i32).of_size(LABEL_MARKER, LABEL_MARKER);
            draw_filled_rect_mut(&mut canvas, marker, colour);
        }
    }
    canvas
}

/// Loads the page image at `source`, draws `rows` on it and writes `<sheet>.overlay.png`.
pub fn write_overlay(source: &Path, sheet: &str, rows: &[&FixtureRow], dir: &Path) -> Result<PathBuf> {
    let page = image::open(source)
        .with_context(|| format!("reopening {} for the overlay", source.display()))?
        .to_rgb8();
    let canvas = draw_fixtures(&page, rows);
    let target = dir.join(format!("{sheet}.overlay.png"));
    canvas
        .save(&target)
        .with_context(|| format!("writing overlay {}", target.display()))?;
    Ok(target)
}
