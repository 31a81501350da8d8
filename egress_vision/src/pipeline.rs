// THEORY:
// The `pipeline` module is the single-page core of the engine. It takes one page image
// and the tokens OCR found on it, and walks them through the stack:
//
// 1.  **Detection**: three passes over the page, merged into corroborated regions.
// 2.  **Token Hygiene**: low-confidence OCR noise is dropped before it can be matched.
// 3.  **Association**: every merged region is paired with its label and nearby text.
// 4.  **Static Content**: notes and schedule rows are read off the same tokens.
//
// Classification and grouping happen once per document, not per page, so that an
// external refiner sees the whole fixture list at once. The rule table is still
// available here for callers that want records for a single page.
//
// Everything here is synchronous and free of shared state. Per-page working data is
// created inside `process_page` and dropped when it returns.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core_modules::association::{AssociationConfig, AssociationStats, MatchedFixture, associate};
use crate::core_modules::classifier::{ClassifierConfig, FixtureRecord, RuleTable};
use crate::core_modules::merge::{MergeConfig, merge_regions};
use crate::core_modules::page::PageImage;
use crate::core_modules::region::{MergedRegion, Region};
use crate::core_modules::region_detector::{DetectorConfig, RegionDetector};
use crate::core_modules::rulebook::{RulebookEntry, extract_rulebook};
use crate::core_modules::token::{Token, TokenConfig, filter_tokens};
use crate::error::{VisionError, VisionResult};

/// Configuration for the whole engine, allowing for tunable behavior.
///
/// Every section has defaults, so a JSON file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detector: DetectorConfig,
    pub merge: MergeConfig,
    pub tokens: TokenConfig,
    pub association: AssociationConfig,
    pub classifier: ClassifierConfig,
    /// Pages processed at once. Defaults to the number of CPUs.
    pub page_concurrency: Option<usize>,
    /// Upper bound on a single OCR call.
    pub ocr_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            merge: MergeConfig::default(),
            tokens: TokenConfig::default(),
            association: AssociationConfig::default(),
            classifier: ClassifierConfig::default(),
            page_concurrency: None,
            ocr_timeout_ms: 60_000,
        }
    }
}

fn check(condition: bool, message: impl FnOnce() -> String) -> VisionResult<()> {
    if condition { Ok(()) } else { Err(VisionError::Config(message())) }
}

fn unit(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

impl PipelineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> VisionResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values no page could be processed with.
    pub fn validate(&self) -> VisionResult<()> {
        let size = &self.detector.size_filter;
        check(size.min_area > 0.0 && size.min_area < size.max_area, || {
            format!("detector.size_filter area range {}..{} is empty", size.min_area, size.max_area)
        })?;
        check(size.min_aspect > 0.0 && size.min_aspect < size.max_aspect, || {
            format!(
                "detector.size_filter aspect range {}..{} is empty",
                size.min_aspect, size.max_aspect
            )
        })?;
        check(self.detector.adaptive_block_radius > 0, || {
            "detector.adaptive_block_radius must be at least 1".to_string()
        })?;
        check(self.detector.contrast_scale > 0.0, || {
            "detector.contrast_scale must be positive".to_string()
        })?;
        check(unit(self.detector.min_fill_ratio), || {
            "detector.min_fill_ratio must be within [0, 1]".to_string()
        })?;
        check(
            self.detector.canny_low > 0.0 && self.detector.canny_low <= self.detector.canny_high,
            || "detector.canny_low must be positive and not above canny_high".to_string(),
        )?;
        check(self.detector.corner_tolerance_degrees > 0.0, || {
            "detector.corner_tolerance_degrees must be positive".to_string()
        })?;

        let merge = &self.merge;
        check(merge.merge_threshold > 0.0 && merge.merge_threshold <= 1.0, || {
            "merge.merge_threshold must be within (0, 1]".to_string()
        })?;
        check(merge.corroboration_bonus >= 0.0, || {
            "merge.corroboration_bonus must not be negative".to_string()
        })?;
        check(unit(merge.high_confidence) && merge.single_method_cap < merge.high_confidence, || {
            format!(
                "merge.single_method_cap ({}) must stay below merge.high_confidence ({})",
                merge.single_method_cap, merge.high_confidence
            )
        })?;

        check(unit(self.tokens.confidence_floor), || {
            "tokens.confidence_floor must be within [0, 1]".to_string()
        })?;
        self.association.validate()?;

        check(self.page_concurrency != Some(0), || {
            "page_concurrency must be at least 1".to_string()
        })?;
        check(self.ocr_timeout_ms > 0, || "ocr_timeout_ms must be positive".to_string())?;
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.page_concurrency.unwrap_or_else(num_cpus::get).max(1)
    }
}

/// Everything one page contributed, before classification.
#[derive(Debug, Clone, PartialEq)]
pub struct PageAnalysis {
    pub sheet: String,
    /// One per merged region, in region order.
    pub fixtures: Vec<MatchedFixture>,
    pub stats: AssociationStats,
    pub rulebook: Vec<RulebookEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PageStatus {
    Complete,
    Failed { reason: String },
    Cancelled,
}

/// Per-page outcome as it appears in the document report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageReport {
    pub sheet: String,
    pub status: PageStatus,
    /// OCR failed or timed out; fixtures on this page carry no symbols.
    pub ocr_degraded: bool,
    pub fixture_count: usize,
    pub stats: Option<AssociationStats>,
}

impl PageReport {
    pub fn complete(analysis: &PageAnalysis, ocr_degraded: bool) -> Self {
        Self {
            sheet: analysis.sheet.clone(),
            status: PageStatus::Complete,
            ocr_degraded,
            fixture_count: analysis.fixtures.len(),
            stats: Some(analysis.stats.clone()),
        }
    }

    pub fn failed(sheet: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            sheet: sheet.into(),
            status: PageStatus::Failed { reason: reason.into() },
            ocr_degraded: false,
            fixture_count: 0,
            stats: None,
        }
    }

    pub fn cancelled(sheet: impl Into<String>) -> Self {
        Self {
            sheet: sheet.into(),
            status: PageStatus::Cancelled,
            ocr_degraded: false,
            fixture_count: 0,
            stats: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == PageStatus::Complete
    }
}

/// The synchronous single-page engine.
#[derive(Debug, Clone)]
pub struct FixturePipeline {
    detector: RegionDetector,
    rules: Arc<RuleTable>,
    config: PipelineConfig,
}

impl FixturePipeline {
    pub fn new(config: PipelineConfig) -> VisionResult<Self> {
        config.validate()?;
        let rules = Arc::new(config.classifier.rule_table()?);
        Ok(Self {
            detector: RegionDetector::new(config.detector.clone(), config.merge.clone()),
            rules,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn detector(&self) -> &RegionDetector {
        &self.detector
    }

    pub fn rules(&self) -> Arc<RuleTable> {
        Arc::clone(&self.rules)
    }

    /// Detects, associates and reads static content for one page.
    pub fn process_page(&self, page: &PageImage, tokens: Vec<Token>) -> PageAnalysis {
        let regions = self.detector.detect(page);
        self.analyze(page.sheet(), regions, tokens)
    }

    /// Merges raw regions from independently scheduled passes.
    pub fn merge(&self, regions: Vec<Region>) -> Vec<MergedRegion> {
        merge_regions(regions, &self.config.merge)
    }

    /// The stages after detection. `regions` must be the merged output for `sheet`.
    pub fn analyze(&self, sheet: &str, regions: Vec<MergedRegion>, tokens: Vec<Token>) -> PageAnalysis {
        let raw_tokens = tokens.len();
        let tokens = filter_tokens(tokens, &self.config.tokens);
        let region_count = regions.len();

        let association = associate(regions, &tokens, sheet, &self.config.association);
        let rulebook = extract_rulebook(&tokens, sheet);

        info!(
            sheet,
            regions = region_count,
            tokens = tokens.len(),
            dropped_tokens = raw_tokens - tokens.len(),
            with_symbols = association.stats.with_symbols,
            rulebook_entries = rulebook.len(),
            "page analyzed"
        );

        PageAnalysis {
            sheet: sheet.to_string(),
            fixtures: association.fixtures,
            stats: association.stats,
            rulebook,
        }
    }

    /// Rule-table records for one page's fixtures.
    pub fn classify(&self, analysis: &PageAnalysis) -> Vec<FixtureRecord> {
        self.rules.classify_all(analysis.fixtures.clone())
    }
}
