//! Document-level grouping of fixture records by description.
//!
//! Groups keep the order in which their description first appeared, so the same
//! record list always produces the same summary, key order included.

use std::collections::{BTreeSet, HashMap};

use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};

use crate::core_modules::classifier::{FixtureRecord, FixtureType};

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryEntry {
    pub description: String,
    /// Type of the first record in the group.
    pub fixture_type: FixtureType,
    pub count: usize,
    /// Distinct symbol strings seen in the group. Fixtures without a symbol add none.
    pub symbols: BTreeSet<String>,
}

impl Serialize for SummaryEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("SummaryEntry", 4)?;
        state.serialize_field("count", &self.count)?;
        state.serialize_field("description", &self.description)?;
        state.serialize_field("type", &self.fixture_type)?;
        state.serialize_field("symbols", &self.symbols)?;
        state.end()
    }
}

/// Ordered mapping from description to its group. Serializes as a JSON object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    entries: Vec<SummaryEntry>,
}

impl Summary {
    pub fn entries(&self) -> &[SummaryEntry] {
        &self.entries
    }

    pub fn get(&self, description: &str) -> Option<&SummaryEntry> {
        self.entries.iter().find(|e| e.description == description)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_count(&self) -> usize {
        self.entries.iter().map(|e| e.count).sum()
    }
}

impl Serialize for Summary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(&entry.description, entry)?;
        }
        map.end()
    }
}

pub fn build_summary(records: &[FixtureRecord]) -> Summary {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut entries: Vec<SummaryEntry> = Vec::new();

    for record in records {
        let slot = *index.entry(record.description.as_str()).or_insert_with(|| {
            entries.push(SummaryEntry {
                description: record.description.clone(),
                fixture_type: record.fixture_type,
                count: 0,
                symbols: BTreeSet::new(),
            });
            entries.len() - 1
        });
        let entry = &mut entries[slot];
        entry.count += 1;
        if let Some(symbol) = record.symbol() {
            entry.symbols.insert(symbol.to_string());
        }
    }

    Summary { entries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::association::MatchedFixture;
    use crate::core_modules::classifier::RuleTable;
    use crate::core_modules::geometry::BoundingBox;
    use crate::core_modules::region::{DetectionMethod, MergedRegion, Region};
    use crate::core_modules::token::Token;

    fn records(symbols: &[Option<&str>]) -> Vec<FixtureRecord> {
        let table = RuleTable::with_default_rules().unwrap();
        symbols
            .iter()
            .enumerate()
            .map(|(i, symbol)| {
                let x = i as f64 * 200.0;
                let bbox = BoundingBox::new(x, 0.0, x + 60.0, 40.0).unwrap();
                table.classify(MatchedFixture {
                    region: MergedRegion {
                        bounding_box: bbox,
                        confidence: 0.8,
                        methods: [DetectionMethod::OtsuThreshold].into_iter().collect(),
                        members: vec![Region::new(bbox, DetectionMethod::OtsuThreshold, 0.8, "E-101")],
                        source_page: "E-101".to_string(),
                    },
                    symbol: symbol.map(|s| Token::new(s, BoundingBox::new(x + 70.0, 0.0, x + 110.0, 20.0).unwrap(), 0.9)),
                    symbol_distance: symbol.map(|_| 40.0),
                    text_nearby: Vec::new(),
                    confidence: 0.7,
                    source_sheet: "E-101".to_string(),
                })
            })
            .collect()
    }

    #[test]
    fn same_description_aggregates_symbols() {
        let summary = build_summary(&records(&[Some("EL501"), Some("EL502")]));
        assert_eq!(summary.len(), 1);
        let entry = summary.get("Emergency Lighting Fixture").unwrap();
        assert_eq!(entry.count, 2);
        assert_eq!(
            entry.symbols,
            ["EL501", "EL502"].into_iter().map(String::from).collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn groups_follow_first_occurrence() {
        let summary = build_summary(&records(&[Some("W"), Some("EL1"), None, Some("W2")]));
        let keys: Vec<&str> = summary.entries().iter().map(|e| e.description.as_str()).collect();
        assert_eq!(
            keys,
            ["Wallpack with Built-in Photocell", "Emergency Lighting Fixture", "Unclassified fixture"]
        );
        assert_eq!(summary.total_count(), 4);
        assert!(summary.get("Unclassified fixture").unwrap().symbols.is_empty());

        let json = serde_json::to_string(&summary).unwrap();
        let wallpack = json.find("Wallpack").unwrap();
        let emergency = json.find("Emergency Lighting").unwrap();
        assert!(wallpack < emergency);
    }

    #[test]
    fn entry_json_carries_count_description_and_symbols() {
        let summary = build_summary(&records(&[Some("EL501"), Some("EL502")]));
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(
            json["Emergency Lighting Fixture"],
            serde_json::json!({
                "count": 2,
                "description": "Emergency Lighting Fixture",
                "type": "emergency_light",
                "symbols": ["EL501", "EL502"],
            })
        );
    }

    #[test]
    fn rerunning_is_stable() {
        let input = records(&[Some("A1"), Some("EL501"), Some("A2"), None, Some("A1E")]);
        assert_eq!(build_summary(&input), build_summary(&input));
    }

    #[test]
    fn empty_input_is_empty_summary() {
        let summary = build_summary(&[]);
        assert!(summary.is_empty());
        assert_eq!(serde_json::to_string(&summary).unwrap(), "{}");
    }
}
