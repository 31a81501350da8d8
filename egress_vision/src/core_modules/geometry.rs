// THEORY:
// The `geometry` module holds the handful of pure, side-effect-free primitives that
// every other stage of the engine speaks in. Detection passes emit boxes, OCR tokens
// carry boxes, and association is nothing more than measuring boxes against boxes.
//
// Key architectural principles:
// 1.  **Validated at Birth**: A `BoundingBox` can only be created through a checked
//     constructor. Degenerate (zero or negative area) and non-finite boxes are turned
//     away with `InvalidGeometry`, so downstream code never divides by a zero area.
// 2.  **Page-Pixel Space**: All coordinates are page pixels, stored as `f64` so that
//     OCR engines reporting sub-pixel positions and detectors reporting integer
//     positions share one type.
// 3.  **Two Notions of Distance**: `distance` compares centers, which is what merging
//     and diagnostics need. `distance_to_point` measures from a point to the nearest
//     edge of a box, which is what label association needs: a large region must not
//     push away a small label that sits right against its border.

use serde::{Deserialize, Serialize};

use crate::error::{VisionError, VisionResult};

/// A 2D point in page-pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// An axis-aligned rectangle `(x_min, y_min, x_max, y_max)`.
///
/// Serialized as a four element array, and re-validated when deserialized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; 4]", into = "[f64; 4]")]
pub struct BoundingBox {
    x_min: f64,
    y_min: f64,
    x_max: f64,
    y_max: f64,
}

impl BoundingBox {
    /// Creates a box, rejecting anything without a strictly positive area.
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> VisionResult<Self> {
        let coords = [x_min, y_min, x_max, y_max];
        if coords.iter().any(|c| !c.is_finite()) {
            return Err(VisionError::InvalidGeometry(format!(
                "non-finite coordinate in {coords:?}"
            )));
        }
        if x_min >= x_max || y_min >= y_max {
            return Err(VisionError::InvalidGeometry(format!(
                "degenerate box [{x_min}, {y_min}, {x_max}, {y_max}]"
            )));
        }
        Ok(Self {
            x_min,
            y_min,
            x_max,
            y_max,
        })
    }

    /// Creates a box from a top-left corner and a size, the layout most OCR engines report.
    pub fn from_xywh(x: f64, y: f64, width: f64, height: f64) -> VisionResult<Self> {
        Self::new(x, y, x + width, y + height)
    }

    pub fn x_min(&self) -> f64 {
        self.x_min
    }

    pub fn y_min(&self) -> f64 {
        self.y_min
    }

    pub fn x_max(&self) -> f64 {
        self.x_max
    }

    pub fn y_max(&self) -> f64 {
        self.y_max
    }

    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// Width divided by height.
    pub fn aspect_ratio(&self) -> f64 {
        self.width() / self.height()
    }

    pub fn center(&self) -> Point {
        Point::new(
            (self.x_min + self.x_max) / 2.0,
            (self.y_min + self.y_max) / 2.0,
        )
    }

    /// Inclusive on all four edges.
    pub fn contains_point(&self, point: &Point) -> bool {
        point.x >= self.x_min && point.x <= self.x_max && point.y >= self.y_min && point.y <= self.y_max
    }

    /// Grows (or, with a negative margin, shrinks) the box on every side.
    pub fn expand(&self, margin: f64) -> VisionResult<Self> {
        Self::new(
            self.x_min - margin,
            self.y_min - margin,
            self.x_max + margin,
            self.y_max + margin,
        )
    }

    /// The smallest box enclosing both inputs. Always valid.
    pub fn union(&self, other: &BoundingBox) -> Self {
        Self {
            x_min: self.x_min.min(other.x_min),
            y_min: self.y_min.min(other.y_min),
            x_max: self.x_max.max(other.x_max),
            y_max: self.y_max.max(other.y_max),
        }
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> f64 {
        let w = self.x_max.min(other.x_max) - self.x_min.max(other.x_min);
        let h = self.y_max.min(other.y_max) - self.y_min.max(other.y_min);
        if w <= 0.0 || h <= 0.0 { 0.0 } else { w * h }
    }

    /// Distance from a point to the nearest edge of this box; zero when inside.
    pub fn distance_to_point(&self, point: &Point) -> f64 {
        let dx = (self.x_min - point.x).max(0.0).max(point.x - self.x_max);
        let dy = (self.y_min - point.y).max(0.0).max(point.y - self.y_max);
        (dx * dx + dy * dy).sqrt()
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.x_min, self.y_min, self.x_max, self.y_max]
    }

    /// Lexicographic ordering on `(y_min, x_min, y_max, x_max)`, used to give
    /// merged regions a canonical order.
    pub fn canonical_cmp(&self, other: &BoundingBox) -> std::cmp::Ordering {
        self.y_min
            .total_cmp(&other.y_min)
            .then(self.x_min.total_cmp(&other.x_min))
            .then(self.y_max.total_cmp(&other.y_max))
            .then(self.x_max.total_cmp(&other.x_max))
    }
}

impl TryFrom<[f64; 4]> for BoundingBox {
    type Error = VisionError;

    fn try_from(value: [f64; 4]) -> Result<Self, Self::Error> {
        Self::new(value[0], value[1], value[2], value[3])
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(value: BoundingBox) -> Self {
        value.to_array()
    }
}

/// Intersection area divided by the smaller of the two areas, in `[0, 1]`.
///
/// Using the smaller area (rather than the union) means a small box fully inside
/// a large one scores 1.0, which is what cross-method merging wants.
pub fn overlap_ratio(a: &BoundingBox, b: &BoundingBox) -> f64 {
    let smaller = a.area().min(b.area());
    (a.intersection_area(b) / smaller).clamp(0.0, 1.0)
}

/// Euclidean distance between box centers.
pub fn distance(a: &BoundingBox, b: &BoundingBox) -> f64 {
    a.center().distance_to(&b.center())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x0: f64, y0: f64, x1: f64, y1: f64) -> BoundingBox {
        BoundingBox::new(x0, y0, x1, y1).expect("valid box")
    }

    #[test]
    fn rejects_zero_area_boxes() {
        assert!(matches!(
            BoundingBox::new(10.0, 10.0, 10.0, 20.0),
            Err(VisionError::InvalidGeometry(_))
        ));
        assert!(matches!(
            BoundingBox::new(10.0, 20.0, 30.0, 20.0),
            Err(VisionError::InvalidGeometry(_))
        ));
        assert!(BoundingBox::new(f64::NAN, 0.0, 1.0, 1.0).is_err());
    }

    #[test]
    fn derived_measurements() {
        let b = bbox(100.0, 150.0, 200.0, 200.0);
        assert_eq!(b.width(), 100.0);
        assert_eq!(b.height(), 50.0);
        assert_eq!(b.area(), 5000.0);
        assert_eq!(b.center(), Point::new(150.0, 175.0));
        assert_eq!(b.aspect_ratio(), 2.0);
    }

    #[test]
    fn overlap_ratio_of_self_is_one() {
        let b = bbox(3.0, 4.0, 50.0, 80.0);
        assert_eq!(overlap_ratio(&b, &b), 1.0);
    }

    #[test]
    fn overlap_ratio_is_symmetric() {
        let a = bbox(100.0, 150.0, 200.0, 200.0);
        let b = bbox(105.0, 155.0, 198.0, 202.0);
        assert_eq!(overlap_ratio(&a, &b), overlap_ratio(&b, &a));
        assert!(overlap_ratio(&a, &b) > 0.9);
    }

    #[test]
    fn disjoint_boxes_do_not_overlap() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(20.0, 20.0, 30.0, 30.0);
        assert_eq!(overlap_ratio(&a, &b), 0.0);
        // Touching edges share no area either.
        let c = bbox(10.0, 0.0, 20.0, 10.0);
        assert_eq!(overlap_ratio(&a, &c), 0.0);
    }

    #[test]
    fn nested_box_overlaps_fully() {
        let outer = bbox(0.0, 0.0, 100.0, 100.0);
        let inner = bbox(10.0, 10.0, 20.0, 20.0);
        assert_eq!(overlap_ratio(&outer, &inner), 1.0);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(30.0, 40.0, 40.0, 50.0);
        assert_eq!(distance(&a, &b), distance(&b, &a));
        assert!((distance(&a, &b) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn nearest_edge_distance() {
        let b = bbox(100.0, 100.0, 120.0, 110.0);
        assert_eq!(b.distance_to_point(&Point::new(110.0, 105.0)), 0.0);
        assert_eq!(b.distance_to_point(&Point::new(60.0, 105.0)), 40.0);
        assert!((b.distance_to_point(&Point::new(97.0, 96.0)) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn contains_and_expand() {
        let b = bbox(10.0, 10.0, 20.0, 20.0);
        assert!(b.contains_point(&Point::new(10.0, 20.0)));
        assert!(!b.contains_point(&Point::new(9.9, 15.0)));
        let grown = b.expand(5.0).expect("grows");
        assert_eq!(grown.to_array(), [5.0, 5.0, 25.0, 25.0]);
        assert!(b.expand(-5.0).is_err());
    }

    #[test]
    fn serializes_as_array_and_validates_on_read() {
        let b = bbox(1.0, 2.0, 3.0, 4.0);
        let json = serde_json::to_string(&b).expect("serialize");
        assert_eq!(json, "[1.0,2.0,3.0,4.0]");
        let back: BoundingBox = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, b);
        assert!(serde_json::from_str::<BoundingBox>("[5.0,5.0,1.0,1.0]").is_err());
    }
}
