// THEORY:
// The `RegionDetector` is the engine of the detection layer. No single heuristic is
// trustworthy on scanned blueprints: local thresholds fire on hatching, global
// thresholds miss faint fills on uneven scans, and edge maps break on smudged
// outlines. So the detector runs three independent passes over the same page and
// lets the merge step reward agreement between them.
//
// Key architectural principles & algorithm steps:
// 1.  **Adaptive Threshold Pass**: An integral image gives the mean of a square window
//     around every pixel in O(1). Pixels darker than that local mean by more than a
//     fixed offset become ink. Components are scored by how much darker their box is
//     than a surrounding ring, combined with the mean per-pixel darkness margin.
// 2.  **Otsu Pass**: A single global split that best separates two intensity
//     populations. Components are scored by the gap between their mean intensity and
//     the page background, scaled by how solidly they fill their box. This is a second
//     opinion that always runs, not a fallback.
// 3.  **Edge Pass**: Canny edges, closed outer contours, Douglas-Peucker
//     simplification. Contours that reduce to four corners close to 90 degrees are
//     kept and scored by how close to square their corners are.
// 4.  **Shared Plausibility Filter**: Every pass applies the same area and aspect
//     window, which discards specks, letters and whole-drawing borders alike.
// 5.  **Stateless Passes**: Each pass is a pure function of the page, so the pipeline
//     is free to run them on separate blocking threads.

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::contours::{BorderType, find_contours};
use imageproc::contrast::otsu_level;
use imageproc::edges::canny;
use imageproc::geometry::{approximate_polygon_dp, arc_length};
use imageproc::integral_image::{integral_image, sum_image_pixels};
use imageproc::point::Point as ContourPoint;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core_modules::blob_detector::blob_detector::{Component, find_components};
use crate::core_modules::geometry::BoundingBox;
use crate::core_modules::merge::{MergeConfig, merge_regions};
use crate::core_modules::page::PageImage;
use crate::core_modules::region::{DetectionMethod, MergedRegion, Region};

/// Size and shape window a candidate must fall in to plausibly be one fixture symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeFilter {
    /// Minimum bounding-box area in square pixels.
    pub min_area: f64,
    /// Maximum bounding-box area in square pixels.
    pub max_area: f64,
    /// Minimum width / height.
    pub min_aspect: f64,
    /// Maximum width / height.
    pub max_aspect: f64,
}

impl Default for SizeFilter {
    fn default() -> Self {
        Self {
            min_area: 500.0,
            max_area: 50_000.0,
            min_aspect: 0.3,
            max_aspect: 3.0,
        }
    }
}

impl SizeFilter {
    pub fn accepts(&self, bbox: &BoundingBox) -> bool {
        let area = bbox.area();
        let aspect = bbox.aspect_ratio();
        area >= self.min_area && area <= self.max_area && aspect >= self.min_aspect && aspect <= self.max_aspect
    }
}

/// Tunables for the three detection passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub size_filter: SizeFilter,
    /// Half-size of the adaptive threshold window; the window is `2r + 1` pixels wide.
    pub adaptive_block_radius: u32,
    /// How much darker than the local mean a pixel must be to count as ink.
    pub adaptive_offset: f64,
    /// Intensity contrast (0..1 of full scale) at which a threshold score reaches
    /// about 63%. Scores approach 1 without reaching it, so darker always ranks higher.
    pub contrast_scale: f64,
    /// Components filling less of their box than this are ignored by the threshold passes.
    pub min_fill_ratio: f64,
    pub canny_low: f32,
    pub canny_high: f32,
    /// Douglas-Peucker tolerance as a fraction of contour perimeter.
    pub polygon_epsilon_ratio: f64,
    /// Largest average corner deviation from 90 degrees an edge contour may show.
    pub corner_tolerance_degrees: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            size_filter: SizeFilter::default(),
            adaptive_block_radius: 7,
            adaptive_offset: 10.0,
            contrast_scale: 0.5,
            min_fill_ratio: 0.2,
            canny_low: 50.0,
            canny_high: 150.0,
            polygon_epsilon_ratio: 0.02,
            corner_tolerance_degrees: 15.0,
        }
    }
}

/// Runs the detection passes over one page and merges their output.
#[derive(Debug, Clone, Default)]
pub struct RegionDetector {
    config: DetectorConfig,
    merge: MergeConfig,
}

impl RegionDetector {
    pub fn new(config: DetectorConfig, merge: MergeConfig) -> Self {
        Self { config, merge }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn merge_config(&self) -> &MergeConfig {
        &self.merge
    }

    /// Runs all three passes one after another and merges the result.
    ///
    /// An empty vector is a valid outcome: the page simply shows no fixtures.
    pub fn detect(&self, page: &PageImage) -> Vec<MergedRegion> {
        let mut regions = Vec::new();
        for method in DetectionMethod::ALL {
            regions.extend(self.run_pass(method, page));
        }
        merge_regions(regions, &self.merge)
    }

    /// Runs a single pass. Exposed so callers can schedule passes in parallel.
    pub fn run_pass(&self, method: DetectionMethod, page: &PageImage) -> Vec<Region> {
        let regions = match method {
            DetectionMethod::AdaptiveThreshold => self.adaptive_pass(page),
            DetectionMethod::OtsuThreshold => self.otsu_pass(page),
            DetectionMethod::EdgeBased => self.edge_pass(page),
        };
        debug!(
            sheet = page.sheet(),
            method = method.as_str(),
            regions = regions.len(),
            "detection pass finished"
        );
        regions
    }

    fn adaptive_pass(&self, page: &PageImage) -> Vec<Region> {
        let gray = page.gray();
        let (width, height) = gray.dimensions();
        let integral = IntegralImage::new(gray);
        let r = self.config.adaptive_block_radius;

        // Per-pixel margin below the local mean; positive means darker.
        let mut margin = vec![0.0f64; (width * height) as usize];
        let mut mask = vec![false; margin.len()];
        for y in 0..height {
            for x in 0..width {
                let x0 = x.saturating_sub(r);
                let y0 = y.saturating_sub(r);
                let x1 = (x + r + 1).min(width);
                let y1 = (y + r + 1).min(height);
                let local_mean = integral.mean(x0, y0, x1, y1);
                let index = (y * width + x) as usize;
                let m = local_mean - gray.get_pixel(x, y).0[0] as f64;
                margin[index] = m;
                mask[index] = m > self.config.adaptive_offset;
            }
        }

        let components = find_components(&mask, width, height, |i| margin[i]);
        self.components_to_regions(components, page, DetectionMethod::AdaptiveThreshold, |c, bbox| {
            let ring = ring_contrast(&integral, bbox, width, height);
            let box_strength = contrast_strength(ring / 255.0, self.config.contrast_scale);
            let pixel_strength = contrast_strength(c.mean_weight / 255.0, self.config.contrast_scale);
            (box_strength * pixel_strength).sqrt()
        })
    }

    fn otsu_pass(&self, page: &PageImage) -> Vec<Region> {
        let gray = page.gray();
        let (width, height) = gray.dimensions();
        let level = otsu_level(gray);

        let mut mask = Vec::with_capacity((width * height) as usize);
        let mut background_sum = 0.0;
        let mut background_count = 0usize;
        for p in gray.pixels() {
            let v = p.0[0];
            let ink = v <= level;
            mask.push(ink);
            if !ink {
                background_sum += v as f64;
                background_count += 1;
            }
        }

        // A page with a single intensity population has nothing to separate.
        if background_count == 0 || background_count == mask.len() {
            return Vec::new();
        }
        let background_mean = background_sum / background_count as f64;

        let components = find_components(&mask, width, height, |i| gray.as_raw()[i] as f64);
        self.components_to_regions(components, page, DetectionMethod::OtsuThreshold, |c, _| {
            let separation = (background_mean - c.mean_weight) / 255.0;
            contrast_strength(separation, self.config.contrast_scale) * c.fill_ratio()
        })
    }

    fn edge_pass(&self, page: &PageImage) -> Vec<Region> {
        let edges = canny(page.gray(), self.config.canny_low, self.config.canny_high);
        let contours = find_contours::<i32>(&edges);
        let tolerance = self.config.corner_tolerance_degrees;

        let mut regions = Vec::new();
        for contour in contours.iter().filter(|c| matches!(c.border_type, BorderType::Outer)) {
            if contour.points.len() < 4 {
                continue;
            }
            let Some(bbox) = bounding_box_of(&contour.points) else {
                continue;
            };
            if !self.config.size_filter.accepts(&bbox) {
                continue;
            }

            let epsilon = self.config.polygon_epsilon_ratio * arc_length(&contour.points, true);
            let polygon = dedup_closed(approximate_polygon_dp(&contour.points, epsilon, true));
            if polygon.len() != 4 {
                continue;
            }

            let deviation = mean_corner_deviation(&polygon);
            if deviation > tolerance {
                continue;
            }
            let confidence = 1.0 - deviation / tolerance.max(f64::EPSILON);
            regions.push(Region::new(bbox, DetectionMethod::EdgeBased, confidence, page.sheet()));
        }
        regions
    }

    fn components_to_regions<F>(
        &self,
        components: Vec<Component>,
        page: &PageImage,
        method: DetectionMethod,
        score: F,
    ) -> Vec<Region>
    where
        F: Fn(&Component, &BoundingBox) -> f64,
    {
        components
            .into_iter()
            .filter(|c| c.fill_ratio() >= self.config.min_fill_ratio)
            .filter_map(|c| {
                let [x0, y0, x1, y1] = c.page_box();
                let bbox = BoundingBox::new(x0, y0, x1, y1).ok()?;
                if !self.config.size_filter.accepts(&bbox) {
                    return None;
                }
                let confidence = score(&c, &bbox);
                Some(Region::new(bbox, method, confidence, page.sheet()))
            })
            .collect()
    }
}

/// Saturating map from a contrast (fraction of full scale) to a score in `[0, 1)`.
fn contrast_strength(contrast: f64, scale: f64) -> f64 {
    if contrast <= 0.0 {
        return 0.0;
    }
    1.0 - (-contrast / scale.max(f64::EPSILON)).exp()
}

/// Summed-area table over page intensities, with half-open lookups.
struct IntegralImage {
    table: ImageBuffer<Luma<u64>, Vec<u64>>,
}

impl IntegralImage {
    fn new(gray: &GrayImage) -> Self {
        Self {
            table: integral_image::<_, u64>(gray),
        }
    }

    /// Sum over the half-open rectangle `[x0, x1) x [y0, y1)`.
    fn sum(&self, x0: u32, y0: u32, x1: u32, y1: u32) -> u64 {
        if x1 <= x0 || y1 <= y0 {
            return 0;
        }
        sum_image_pixels(&self.table, x0, y0, x1 - 1, y1 - 1)[0]
    }

    fn mean(&self, x0: u32, y0: u32, x1: u32, y1: u32) -> f64 {
        let count = (x1 - x0) as u64 * (y1 - y0) as u64;
        if count == 0 {
            return 0.0;
        }
        self.sum(x0, y0, x1, y1) as f64 / count as f64
    }
}

/// Mean intensity of a ring around `bbox` minus the mean intensity inside it.
fn ring_contrast(integral: &IntegralImage, bbox: &BoundingBox, width: u32, height: u32) -> f64 {
    let ring = (bbox.width().min(bbox.height()) * 0.25).max(4.0) as u32;
    let (x0, y0, x1, y1) = (
        bbox.x_min() as u32,
        bbox.y_min() as u32,
        bbox.x_max() as u32,
        bbox.y_max() as u32,
    );
    let (ox0, oy0) = (x0.saturating_sub(ring), y0.saturating_sub(ring));
    let (ox1, oy1) = ((x1 + ring).min(width), (y1 + ring).min(height));

    let inner_sum = integral.sum(x0, y0, x1, y1);
    let inner_count = (x1 - x0) as u64 * (y1 - y0) as u64;
    let outer_sum = integral.sum(ox0, oy0, ox1, oy1);
    let outer_count = (ox1 - ox0) as u64 * (oy1 - oy0) as u64;

    let ring_count = outer_count - inner_count;
    if ring_count == 0 || inner_count == 0 {
        return 0.0;
    }
    let ring_mean = (outer_sum - inner_sum) as f64 / ring_count as f64;
    let inner_mean = inner_sum as f64 / inner_count as f64;
    ring_mean - inner_mean
}

fn bounding_box_of(points: &[ContourPoint<i32>]) -> Option<BoundingBox> {
    let min_x = points.iter().map(|p| p.x).min()?;
    let min_y = points.iter().map(|p| p.y).min()?;
    let max_x = points.iter().map(|p| p.x).max()?;
    let max_y = points.iter().map(|p| p.y).max()?;
    BoundingBox::new(min_x as f64, min_y as f64, (max_x + 1) as f64, (max_y + 1) as f64).ok()
}

/// Drops consecutive duplicates and a repeated closing vertex.
fn dedup_closed(mut polygon: Vec<ContourPoint<i32>>) -> Vec<ContourPoint<i32>> {
    polygon.dedup();
    while polygon.len() > 1 && polygon.first() == polygon.last() {
        polygon.pop();
    }
    polygon
}

/// Average absolute deviation of the polygon's interior angles from 90 degrees.
fn mean_corner_deviation(polygon: &[ContourPoint<i32>]) -> f64 {
    let n = polygon.len();
    let mut total = 0.0;
    for i in 0..n {
        let prev = polygon[(i + n - 1) % n];
        let cur = polygon[i];
        let next = polygon[(i + 1) % n];
        let (ax, ay) = ((prev.x - cur.x) as f64, (prev.y - cur.y) as f64);
        let (bx, by) = ((next.x - cur.x) as f64, (next.y - cur.y) as f64);
        let norm = (ax.hypot(ay) * bx.hypot(by)).max(f64::EPSILON);
        let cos = ((ax * bx + ay * by) / norm).clamp(-1.0, 1.0);
        total += (cos.acos().to_degrees() - 90.0).abs();
    }
    total / n as f64
}
