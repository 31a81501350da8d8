// THEORY:
// The association engine pairs every merged region with its label. Plans put the
// fixture code (`EL501`) next to the symbol and sometimes a few words of free text
// (`EMERGENCY`, `WALL PACK`). Position is all we have to go on.
//
// Key architectural principles & algorithm steps:
// 1.  **Nearest Edge**: Distance runs from the region center to the nearest edge of
//     the token box. A long label whose first letter touches the symbol is close even
//     if its center is far away.
// 2.  **Global Greedy Exclusivity**: All (region, symbol) pairs inside the radius are
//     sorted once by distance and accepted in that order, skipping any pair whose
//     region already has a label or whose label is already taken. Each label is
//     claimed at most once per page, and the globally closest pairing wins instead
//     of whichever region happened to be visited first.
// 3.  **Deterministic Ties**: Equal distances fall back to higher OCR confidence, then
//     smaller token area, then input order. Ties that decided a claim are logged and
//     counted, never raised.
// 4.  **One In, One Out**: Every region produces exactly one `MatchedFixture`, with or
//     without a symbol, in the order the regions arrived.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core_modules::region::MergedRegion;
use crate::core_modules::token::Token;
use crate::error::{VisionError, VisionResult};

/// Distances closer than this are treated as equal when resolving ties.
const DISTANCE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationConfig {
    /// Tokens farther than this from a region center are ignored, in pixels.
    pub max_radius: f64,
    pub region_weight: f64,
    pub symbol_weight: f64,
    pub proximity_weight: f64,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            max_radius: 150.0,
            region_weight: 0.5,
            symbol_weight: 0.3,
            proximity_weight: 0.2,
        }
    }
}

impl AssociationConfig {
    pub fn validate(&self) -> VisionResult<()> {
        if !(self.max_radius.is_finite() && self.max_radius > 0.0) {
            return Err(VisionError::Config(format!(
                "association.max_radius must be positive, got {}",
                self.max_radius
            )));
        }
        let weights = [self.region_weight, self.symbol_weight, self.proximity_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            return Err(VisionError::Config(format!(
                "association weights must be non-negative with a positive sum, got {weights:?}"
            )));
        }
        Ok(())
    }

    /// Proximity contribution: 1 at distance zero, falling linearly to 0 at the radius.
    pub fn proximity(&self, distance: f64) -> f64 {
        (1.0 - distance / self.max_radius).clamp(0.0, 1.0)
    }

    fn weight_sum(&self) -> f64 {
        self.region_weight + self.symbol_weight + self.proximity_weight
    }
}

/// A merged region with its claimed symbol and the free text around it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedFixture {
    pub region: MergedRegion,
    pub symbol: Option<Token>,
    /// Nearest-edge distance to the symbol, when there is one.
    pub symbol_distance: Option<f64>,
    /// Free-text tokens within the radius, nearest first, one per normalized string.
    pub text_nearby: Vec<Token>,
    pub confidence: f64,
    pub source_sheet: String,
}

impl MatchedFixture {
    pub fn symbol_text(&self) -> Option<&str> {
        self.symbol.as_ref().map(|t| t.text.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssociationStats {
    pub total_fixtures: usize,
    pub with_text: usize,
    pub with_symbols: usize,
    pub avg_text_per_fixture: f64,
    /// Share of fixtures that received a symbol.
    pub symbol_coverage: f64,
    /// Claims that were decided by the tie-break rather than by distance.
    pub ambiguous_ties: usize,
}

impl AssociationStats {
    fn from_fixtures(fixtures: &[MatchedFixture], ambiguous_ties: usize) -> Self {
        let total = fixtures.len();
        let with_text = fixtures.iter().filter(|f| !f.text_nearby.is_empty()).count();
        let with_symbols = fixtures.iter().filter(|f| f.symbol.is_some()).count();
        let text_total: usize = fixtures.iter().map(|f| f.text_nearby.len()).sum();
        let ratio = |n: usize| if total == 0 { 0.0 } else { n as f64 / total as f64 };
        Self {
            total_fixtures: total,
            with_text,
            with_symbols,
            avg_text_per_fixture: ratio(text_total),
            symbol_coverage: ratio(with_symbols),
            ambiguous_ties,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Association {
    pub fixtures: Vec<MatchedFixture>,
    pub stats: AssociationStats,
}

/// A (region, symbol) pair inside the radius.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    region: usize,
    token: usize,
    distance: f64,
}

fn candidate_cmp(a: &Candidate, b: &Candidate, tokens: &[Token]) -> Ordering {
    let (ta, tb) = (&tokens[a.token], &tokens[b.token]);
    distance_bucket(a.distance)
        .cmp(&distance_bucket(b.distance))
        .then_with(|| tb.confidence.total_cmp(&ta.confidence))
        .then_with(|| ta.bounding_box.area().total_cmp(&tb.bounding_box.area()))
        .then_with(|| a.region.cmp(&b.region))
        .then_with(|| a.token.cmp(&b.token))
}

/// Distances are compared on a grid of `DISTANCE_EPSILON` so float noise never
/// outranks the tie-break.
fn distance_bucket(distance: f64) -> i64 {
    (distance / DISTANCE_EPSILON).round() as i64
}

/// Pairs each region with at most one symbol token and its nearby free text.
///
/// `tokens` should already be filtered by the confidence floor.
pub fn associate(
    regions: Vec<MergedRegion>,
    tokens: &[Token],
    sheet: &str,
    config: &AssociationConfig,
) -> Association {
    // --- Candidate Collection ---
    let mut candidates = Vec::new();
    for (r, region) in regions.iter().enumerate() {
        let center = region.bounding_box.center();
        for (t, token) in tokens.iter().enumerate().filter(|(_, t)| t.is_symbol()) {
            let distance = token.bounding_box.distance_to_point(&center);
            if distance <= config.max_radius {
                candidates.push(Candidate {
                    region: r,
                    token: t,
                    distance,
                });
            }
        }
    }
    candidates.sort_by(|a, b| candidate_cmp(a, b, tokens));

    // --- Global Greedy Assignment ---
    let mut assigned: Vec<Option<Candidate>> = vec![None; regions.len()];
    let mut claimed = vec![false; tokens.len()];
    let mut ambiguous_ties = 0;
    for (i, c) in candidates.iter().enumerate() {
        if assigned[c.region].is_some() || claimed[c.token] {
            continue;
        }
        assigned[c.region] = Some(*c);
        claimed[c.token] = true;

        let rival = candidates[i + 1..]
            .iter()
            .take_while(|o| distance_bucket(o.distance) == distance_bucket(c.distance))
            .find(|o| {
                (o.region == c.region && !claimed[o.token])
                    || (o.token == c.token && assigned[o.region].is_none())
            });
        if let Some(rival) = rival {
            ambiguous_ties += 1;
            debug!(
                sheet,
                symbol = %tokens[c.token].text,
                rival = %tokens[rival.token].text,
                distance = c.distance,
                "equal-distance symbol claim resolved by tie-break"
            );
        }
    }

    // --- Fixture Assembly ---
    let weight_sum = config.weight_sum();
    let fixtures: Vec<MatchedFixture> = regions
        .into_iter()
        .zip(assigned)
        .map(|(region, claim)| {
            let text_nearby = nearby_text(&region, tokens, config);
            let (symbol, symbol_distance, score) = match claim {
                Some(c) => {
                    let token = &tokens[c.token];
                    let score = config.region_weight * region.confidence
                        + config.symbol_weight * token.confidence
                        + config.proximity_weight * config.proximity(c.distance);
                    (Some(token.clone()), Some(c.distance), score)
                }
                None => (None, None, config.region_weight * region.confidence),
            };
            MatchedFixture {
                confidence: (score / weight_sum).clamp(0.0, 1.0),
                source_sheet: sheet.to_string(),
                region,
                symbol,
                symbol_distance,
                text_nearby,
            }
        })
        .collect();

    let stats = AssociationStats::from_fixtures(&fixtures, ambiguous_ties);
    debug!(
        sheet,
        fixtures = stats.total_fixtures,
        with_symbols = stats.with_symbols,
        ties = stats.ambiguous_ties,
        "association finished"
    );
    Association { fixtures, stats }
}

fn nearby_text(region: &MergedRegion, tokens: &[Token], config: &AssociationConfig) -> Vec<Token> {
    let center = region.bounding_box.center();
    let mut near: Vec<(f64, &Token)> = tokens
        .iter()
        .filter(|t| !t.is_symbol())
        .map(|t| (t.bounding_box.distance_to_point(&center), t))
        .filter(|(d, _)| *d <= config.max_radius)
        .collect();
    near.sort_by(|(da, ta), (db, tb)| {
        da.total_cmp(db)
            .then_with(|| tb.confidence.total_cmp(&ta.confidence))
            .then_with(|| ta.text.cmp(&tb.text))
    });

    let mut seen = HashSet::new();
    near.into_iter()
        .filter(|(_, t)| seen.insert(t.normalized()))
        .map(|(_, t)| t.clone())
        .collect()
}
