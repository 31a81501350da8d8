// THEORY:
// A `Region` is a snapshot produced by exactly one detection pass: "method X thinks
// there is a shaded symbol here, this strongly." It is a "dumb", immutable data
// container, like the blobs it descends from.
//
// Several passes routinely describe the same physical fixture. The merge step folds
// those into a `MergedRegion`, which owns the union box, the set of methods that
// agreed, and a combined confidence. `MergedRegion` is the only detection type
// handed downstream to association.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core_modules::geometry::BoundingBox;

/// The independent heuristics that vote on where fixtures are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// Locally varying threshold: darker than the surrounding window.
    AdaptiveThreshold,
    /// Single global split point chosen by Otsu's criterion.
    OtsuThreshold,
    /// Near-rectangular closed contours in an edge map.
    EdgeBased,
}

impl DetectionMethod {
    pub const ALL: [DetectionMethod; 3] = [
        DetectionMethod::AdaptiveThreshold,
        DetectionMethod::OtsuThreshold,
        DetectionMethod::EdgeBased,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::AdaptiveThreshold => "adaptive_threshold",
            DetectionMethod::OtsuThreshold => "otsu_threshold",
            DetectionMethod::EdgeBased => "edge_based",
        }
    }
}

/// One candidate fixture box from a single detection pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub bounding_box: BoundingBox,
    pub detection_method: DetectionMethod,
    /// How strongly the region satisfied its method's criterion, in `[0, 1]`.
    pub raw_confidence: f64,
    pub source_page: String,
}

impl Region {
    pub fn new(
        bounding_box: BoundingBox,
        detection_method: DetectionMethod,
        raw_confidence: f64,
        source_page: impl Into<String>,
    ) -> Self {
        Self {
            bounding_box,
            detection_method,
            raw_confidence: raw_confidence.clamp(0.0, 1.0),
            source_page: source_page.into(),
        }
    }
}

/// The deduplicated union of overlapping `Region`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRegion {
    /// Union of all member boxes.
    pub bounding_box: BoundingBox,
    /// Combined confidence after the cross-method corroboration bonus.
    pub confidence: f64,
    /// Distinct methods that contributed at least one member.
    pub methods: BTreeSet<DetectionMethod>,
    /// The raw regions folded into this one, in canonical order.
    pub members: Vec<Region>,
    pub source_page: String,
}

impl MergedRegion {
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }
}
