// THEORY:
// Classification turns a `MatchedFixture` into a `FixtureRecord` by resolving its
// symbol to a fixture type and a human description. The deterministic path is a
// prioritized rule table; an optional external refiner (an LLM answer, a reviewer's
// corrections) may then rewrite types and descriptions.
//
// Key architectural principles:
// 1.  **Tiered Rule Table**: Rules are tried exact match first, then prefix, then
//     regular expression. Within a tier the configured order wins. No match is not an
//     error: the fixture becomes `other` / "Unclassified fixture" with its raw symbol
//     kept, so a detected region is never dropped.
// 2.  **Strategy, Not Branches**: `FixtureClassifier` has two implementations chosen
//     by configuration. The pipeline calls one method and never asks which it got.
// 3.  **Refinement Is Narrow**: A refiner can only revise `type` and `description` of
//     records it addresses by index. Boxes, tokens and confidences are never touched,
//     and a refiner that fails or times out leaves the rule-table answer in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core_modules::association::MatchedFixture;
use crate::core_modules::rulebook::RulebookEntry;
use crate::core_modules::token::normalize;
use crate::error::{VisionError, VisionResult};

pub const UNCLASSIFIED_DESCRIPTION: &str = "Unclassified fixture";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureType {
    RecessedLed,
    Wallpack,
    EmergencyExit,
    EmergencyLight,
    Other,
}

impl FixtureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixtureType::RecessedLed => "recessed_led",
            FixtureType::Wallpack => "wallpack",
            FixtureType::EmergencyExit => "emergency_exit",
            FixtureType::EmergencyLight => "emergency_light",
            FixtureType::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolPattern {
    Exact(String),
    Prefix(String),
    Regex(String),
}

impl SymbolPattern {
    fn tier(&self) -> u8 {
        match self {
            SymbolPattern::Exact(_) => 0,
            SymbolPattern::Prefix(_) => 1,
            SymbolPattern::Regex(_) => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub pattern: SymbolPattern,
    #[serde(rename = "type")]
    pub fixture_type: FixtureType,
    pub description: String,
}

impl ClassificationRule {
    pub fn new(pattern: SymbolPattern, fixture_type: FixtureType, description: &str) -> Self {
        Self {
            pattern,
            fixture_type,
            description: description.to_string(),
        }
    }
}

/// Rules for the fixture codes that appear on typical emergency lighting plans.
pub fn default_rules() -> Vec<ClassificationRule> {
    use FixtureType as T;
    use SymbolPattern as P;
    vec![
        ClassificationRule::new(P::Exact("A1E".into()), T::EmergencyExit, "Exit/Emergency Combo Unit"),
        ClassificationRule::new(P::Prefix("EL".into()), T::EmergencyLight, "Emergency Lighting Fixture"),
        ClassificationRule::new(P::Regex(r"^A\d+E$".into()), T::EmergencyExit, "Exit/Emergency Combo Unit"),
        ClassificationRule::new(P::Regex(r"^E\d+$".into()), T::EmergencyLight, "Emergency Lighting Fixture"),
        ClassificationRule::new(P::Regex(r"^W\d*$".into()), T::Wallpack, "Wallpack with Built-in Photocell"),
        ClassificationRule::new(P::Regex(r"^A\d+$".into()), T::RecessedLed, "2' x 4' Recessed LED Luminaire"),
    ]
}

enum Matcher {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

impl Matcher {
    fn matches(&self, symbol: &str) -> bool {
        match self {
            Matcher::Exact(s) => symbol == s.as_str(),
            Matcher::Prefix(p) => symbol.starts_with(p.as_str()),
            Matcher::Regex(r) => r.is_match(symbol),
        }
    }
}

struct CompiledRule {
    matcher: Matcher,
    fixture_type: FixtureType,
    description: String,
}

/// A `MatchedFixture` with its resolved type and description.
#[derive(Debug, Clone, PartialEq)]
pub struct FixtureRecord {
    pub fixture: MatchedFixture,
    pub fixture_type: FixtureType,
    pub description: String,
}

impl FixtureRecord {
    pub fn symbol(&self) -> Option<&str> {
        self.fixture.symbol_text()
    }

    /// The flat, serializable shape handed to persistence layers.
    pub fn to_row(&self) -> FixtureRow {
        FixtureRow {
            symbol: self.symbol().map(str::to_string),
            bounding_box: self.fixture.region.bounding_box.to_array(),
            text_nearby: self.fixture.text_nearby.iter().map(|t| t.text.clone()).collect(),
            source_sheet: self.fixture.source_sheet.clone(),
            confidence: self.fixture.confidence,
            fixture_type: self.fixture_type,
            description: self.description.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureRow {
    pub symbol: Option<String>,
    pub bounding_box: [f64; 4],
    pub text_nearby: Vec<String>,
    pub source_sheet: String,
    pub confidence: f64,
    #[serde(rename = "type")]
    pub fixture_type: FixtureType,
    pub description: String,
}

/// The prioritized, compiled rule list.
pub struct RuleTable {
    rules: Vec<CompiledRule>,
}

impl std::fmt::Debug for RuleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleTable").field("rules", &self.rules.len()).finish()
    }
}

impl RuleTable {
    /// Compiles the rules. Patterns are compared against the normalized symbol.
    pub fn new(mut rules: Vec<ClassificationRule>) -> VisionResult<Self> {
        rules.sort_by_key(|r| r.pattern.tier());
        let rules = rules
            .into_iter()
            .map(|rule| {
                let matcher = match rule.pattern {
                    SymbolPattern::Exact(s) => Matcher::Exact(normalize(&s)),
                    SymbolPattern::Prefix(p) => Matcher::Prefix(normalize(&p)),
                    SymbolPattern::Regex(pattern) => {
                        Matcher::Regex(Regex::new(&pattern).map_err(|e| VisionError::InvalidRule {
                            pattern: pattern.clone(),
                            reason: e.to_string(),
                        })?)
                    }
                };
                Ok(CompiledRule {
                    matcher,
                    fixture_type: rule.fixture_type,
                    description: rule.description,
                })
            })
            .collect::<VisionResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn with_default_rules() -> VisionResult<Self> {
        Self::new(default_rules())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Type and description for a symbol, or `None` when no rule applies.
    pub fn lookup(&self, symbol: &str) -> Option<(FixtureType, &str)> {
        let symbol = normalize(symbol);
        self.rules
            .iter()
            .find(|r| r.matcher.matches(&symbol))
            .map(|r| (r.fixture_type, r.description.as_str()))
    }

    pub fn classify(&self, fixture: MatchedFixture) -> FixtureRecord {
        let (fixture_type, description) = fixture
            .symbol_text()
            .and_then(|s| self.lookup(s))
            .map(|(t, d)| (t, d.to_string()))
            .unwrap_or((FixtureType::Other, UNCLASSIFIED_DESCRIPTION.to_string()));
        FixtureRecord {
            fixture,
            fixture_type,
            description,
        }
    }

    pub fn classify_all(&self, fixtures: Vec<MatchedFixture>) -> Vec<FixtureRecord> {
        fixtures.into_iter().map(|f| self.classify(f)).collect()
    }
}

/// Turns matched fixtures into records. Output has one record per input, in order.
#[async_trait]
pub trait FixtureClassifier: Send + Sync {
    async fn classify(&self, fixtures: Vec<MatchedFixture>, rulebook: &[RulebookEntry]) -> Vec<FixtureRecord>;

    fn name(&self) -> &str;
}

pub struct RuleTableClassifier {
    table: Arc<RuleTable>,
}

impl RuleTableClassifier {
    pub fn new(table: Arc<RuleTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl FixtureClassifier for RuleTableClassifier {
    async fn classify(&self, fixtures: Vec<MatchedFixture>, _rulebook: &[RulebookEntry]) -> Vec<FixtureRecord> {
        self.table.classify_all(fixtures)
    }

    fn name(&self) -> &str {
        "rule_table"
    }
}

/// A revised type and description for the record at `index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRevision {
    pub index: usize,
    #[serde(rename = "type")]
    pub fixture_type: FixtureType,
    pub description: String,
}

/// External collaborator that may revise rule-table classifications.
#[async_trait]
pub trait ClassificationRefiner: Send + Sync {
    async fn refine(&self, rows: &[FixtureRow], rulebook: &[RulebookEntry]) -> VisionResult<Vec<RecordRevision>>;
}

/// Replays revisions stored in a JSON file, typically a saved answer from an
/// offline language model run.
#[derive(Debug, Clone)]
pub struct JsonFileRefiner {
    path: PathBuf,
}

impl JsonFileRefiner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ClassificationRefiner for JsonFileRefiner {
    async fn refine(&self, _rows: &[FixtureRow], _rulebook: &[RulebookEntry]) -> VisionResult<Vec<RecordRevision>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Rule table first, then the refiner's revisions on top.
pub struct RefinedClassifier {
    table: Arc<RuleTable>,
    refiner: Arc<dyn ClassificationRefiner>,
    timeout: Duration,
}

impl RefinedClassifier {
    pub fn new(table: Arc<RuleTable>, refiner: Arc<dyn ClassificationRefiner>, timeout: Duration) -> Self {
        Self {
            table,
            refiner,
            timeout,
        }
    }
}

#[async_trait]
impl FixtureClassifier for RefinedClassifier {
    async fn classify(&self, fixtures: Vec<MatchedFixture>, rulebook: &[RulebookEntry]) -> Vec<FixtureRecord> {
        let mut records = self.table.classify_all(fixtures);
        let rows: Vec<FixtureRow> = records.iter().map(FixtureRecord::to_row).collect();

        let revisions = match tokio::time::timeout(self.timeout, self.refiner.refine(&rows, rulebook)).await {
            Ok(Ok(revisions)) => revisions,
            Ok(Err(e)) => {
                warn!(error = %e, "refiner failed, keeping rule-table classification");
                return records;
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "refiner timed out, keeping rule-table classification"
                );
                return records;
            }
        };

        let mut applied = 0;
        for revision in revisions {
            match records.get_mut(revision.index) {
                Some(record) => {
                    record.fixture_type = revision.fixture_type;
                    record.description = revision.description;
                    applied += 1;
                }
                None => debug!(index = revision.index, "ignoring revision for unknown record"),
            }
        }
        info!(applied, records = records.len(), "refined classifications");
        records
    }

    fn name(&self) -> &str {
        "external_refiner"
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    #[default]
    RuleTable,
    ExternalRefiner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub kind: ClassifierKind,
    /// Replaces the built-in rules when present.
    pub rules: Option<Vec<ClassificationRule>>,
    /// Revisions file for `JsonFileRefiner` when no refiner is supplied in code.
    pub refinement_file: Option<PathBuf>,
    pub refiner_timeout_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            kind: ClassifierKind::RuleTable,
            rules: None,
            refinement_file: None,
            refiner_timeout_ms: 30_000,
        }
    }
}

impl ClassifierConfig {
    pub fn rule_table(&self) -> VisionResult<RuleTable> {
        match &self.rules {
            Some(rules) => RuleTable::new(rules.clone()),
            None => RuleTable::with_default_rules(),
        }
    }

    /// Builds the configured strategy. `refiner` takes precedence over `refinement_file`.
    pub fn build(&self, refiner: Option<Arc<dyn ClassificationRefiner>>) -> VisionResult<Arc<dyn FixtureClassifier>> {
        let table = Arc::new(self.rule_table()?);
        match self.kind {
            ClassifierKind::RuleTable => Ok(Arc::new(RuleTableClassifier::new(table))),
            ClassifierKind::ExternalRefiner => {
                let refiner = match (refiner, &self.refinement_file) {
                    (Some(r), _) => r,
                    (None, Some(path)) => Arc::new(JsonFileRefiner::new(path.clone())),
                    (None, None) => {
                        return Err(VisionError::Config(
                            "classifier.kind is external_refiner but no refiner or refinement_file was given"
                                .to_string(),
                        ));
                    }
                };
                Ok(Arc::new(RefinedClassifier::new(
                    table,
                    refiner,
                    Duration::from_millis(self.refiner_timeout_ms),
                )))
            }
        }
    }
}
