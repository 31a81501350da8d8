// THEORY:
// The merge step is the synchronization point of the detection layer: it must see the
// output of every pass before it can say anything. It builds an overlap graph over all
// raw `Region`s (an edge wherever `overlap_ratio >= merge_threshold`) and takes its
// connected components with a union-find, so the grouping is a transitive closure and
// does not depend on the order in which passes or regions arrive.
//
// Confidence is where corroboration pays off. A merged region starts from the best
// member score. If only one method saw it, that score is capped below the "high"
// band no matter how confident the method was. Each additional independent method
// multiplies the score by a bonus.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core_modules::geometry::overlap_ratio;
use crate::core_modules::region::{DetectionMethod, MergedRegion, Region};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Minimum `overlap_ratio` for two regions to be joined.
    pub merge_threshold: f64,
    /// Multiplicative bonus per additional distinct method that agreed.
    pub corroboration_bonus: f64,
    /// Ceiling for regions seen by a single method. Must stay below `high_confidence`.
    pub single_method_cap: f64,
    /// Scores at or above this are considered high confidence.
    pub high_confidence: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            merge_threshold: 0.5,
            corroboration_bonus: 0.1,
            single_method_cap: 0.7,
            high_confidence: 0.75,
        }
    }
}

/// Disjoint-set forest with path compression and union by rank.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<usize>,
}

impl UnionFind {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
            rank: vec![0; size],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        // Path compression.
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, x: usize, y: usize) {
        let root_x = self.find(x);
        let root_y = self.find(y);
        if root_x == root_y {
            return;
        }
        match self.rank[root_x].cmp(&self.rank[root_y]) {
            Ordering::Greater => self.parent[root_y] = root_x,
            Ordering::Less => self.parent[root_x] = root_y,
            Ordering::Equal => {
                self.parent[root_y] = root_x;
                self.rank[root_x] += 1;
            }
        }
    }
}

/// Total order on raw regions so member lists come out identical for any input order.
fn region_cmp(a: &Region, b: &Region) -> Ordering {
    a.detection_method
        .cmp(&b.detection_method)
        .then_with(|| a.bounding_box.canonical_cmp(&b.bounding_box))
        .then_with(|| a.raw_confidence.total_cmp(&b.raw_confidence))
}

/// Combined confidence for a group, given its best raw score and number of distinct methods.
pub fn combined_confidence(best_raw: f64, method_count: usize, config: &MergeConfig) -> f64 {
    let bonus = 1.0 + config.corroboration_bonus * method_count.saturating_sub(1) as f64;
    let combined = (best_raw * bonus).min(1.0);
    if method_count <= 1 {
        combined.min(config.single_method_cap)
    } else {
        combined
    }
}

/// Folds overlapping regions from every pass into `MergedRegion`s.
///
/// The result is sorted by box (top to bottom, then left to right) and is the same
/// for every permutation of `regions`.
pub fn merge_regions(mut regions: Vec<Region>, config: &MergeConfig) -> Vec<MergedRegion> {
    if regions.is_empty() {
        return Vec::new();
    }
    regions.sort_by(region_cmp);

    let mut forest = UnionFind::new(regions.len());
    for i in 0..regions.len() {
        for j in (i + 1)..regions.len() {
            if overlap_ratio(&regions[i].bounding_box, &regions[j].bounding_box) >= config.merge_threshold {
                forest.union(i, j);
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<Region>> = BTreeMap::new();
    let roots: Vec<usize> = (0..regions.len()).map(|i| forest.find(i)).collect();
    for (region, root) in regions.into_iter().zip(roots) {
        groups.entry(root).or_default().push(region);
    }

    let mut merged: Vec<MergedRegion> = groups
        .into_values()
        .map(|mut members| {
            members.sort_by(region_cmp);
            let bounding_box = members
                .iter()
                .skip(1)
                .fold(members[0].bounding_box, |acc, r| acc.union(&r.bounding_box));
            let methods: BTreeSet<DetectionMethod> = members.iter().map(|r| r.detection_method).collect();
            let best_raw = members.iter().map(|r| r.raw_confidence).fold(0.0, f64::max);
            MergedRegion {
                bounding_box,
                confidence: combined_confidence(best_raw, methods.len(), config),
                source_page: members[0].source_page.clone(),
                methods,
                members,
            }
        })
        .collect();

    merged.sort_by(|a, b| {
        a.bounding_box
            .canonical_cmp(&b.bounding_box)
            .then_with(|| a.confidence.total_cmp(&b.confidence))
    });
    merged
}
