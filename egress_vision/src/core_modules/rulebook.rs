//! Static sheet content: general notes and lighting-schedule rows.
//!
//! Plans carry a legend that says what each fixture code means. Reading it does not
//! change detection, but it is reported alongside the fixtures and handed to the
//! classification refiner as context.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core_modules::token::Token;

/// Tokens whose top edges are within this many pixels of a row's first token share the row.
pub const ROW_TOLERANCE: f64 = 20.0;

const NOTE_KEYWORDS: [&str; 4] = ["NOTE:", "GENERAL", "SPECIFICATION", "REQUIREMENT"];
const SCHEDULE_KEYWORDS: [&str; 4] = ["LUMINAIRE", "MOUNT", "VOLTAGE", "LUMENS"];
const DESCRIPTION_KEYWORDS: [&str; 4] = ["LUMINAIRE", "FIXTURE", "LIGHT", "EMERGENCY"];
const MOUNT_KEYWORDS: [&str; 4] = ["CEILING", "WALL", "RECESSED", "SURFACE"];

/// Long lines are treated as notes when recognized at least this confidently.
const LONG_NOTE_LEN: usize = 50;
const LONG_NOTE_CONFIDENCE: f64 = 0.7;

static VOLTAGE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d+V\b").expect("static pattern"));
static LUMENS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b\d+\s?lm\b").expect("static pattern"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RulebookEntry {
    Note {
        sheet: String,
        text: String,
    },
    ScheduleRow {
        sheet: String,
        symbol: String,
        description: Option<String>,
        mount: Option<String>,
        voltage: Option<String>,
        lumens: Option<String>,
        raw_text: String,
    },
}

/// Groups tokens into text rows, top to bottom, each sorted left to right.
fn group_rows(tokens: &[Token]) -> Vec<Vec<&Token>> {
    let mut sorted: Vec<&Token> = tokens.iter().collect();
    sorted.sort_by(|a, b| {
        a.bounding_box
            .y_min()
            .total_cmp(&b.bounding_box.y_min())
            .then(a.bounding_box.x_min().total_cmp(&b.bounding_box.x_min()))
    });

    let mut rows: Vec<Vec<&Token>> = Vec::new();
    for token in sorted {
        match rows.last_mut() {
            Some(row) if (token.bounding_box.y_min() - row[0].bounding_box.y_min()).abs() <= ROW_TOLERANCE => {
                row.push(token)
            }
            _ => rows.push(vec![token]),
        }
    }
    for row in &mut rows {
        row.sort_by(|a, b| a.bounding_box.x_min().total_cmp(&b.bounding_box.x_min()));
    }
    rows
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    let upper = text.to_uppercase();
    keywords.iter().any(|k| upper.contains(k))
}

fn first_cell_with(row: &[&Token], keywords: &[&str]) -> Option<String> {
    row.iter()
        .find(|t| contains_any(&t.text, keywords))
        .map(|t| t.text.clone())
}

fn parse_schedule_row(sheet: &str, row: &[&Token], raw_text: String) -> RulebookEntry {
    RulebookEntry::ScheduleRow {
        sheet: sheet.to_string(),
        symbol: row[0].text.clone(),
        description: first_cell_with(row, &DESCRIPTION_KEYWORDS),
        mount: first_cell_with(row, &MOUNT_KEYWORDS),
        voltage: VOLTAGE.find(&raw_text).map(|m| m.as_str().to_string()),
        lumens: LUMENS.find(&raw_text).map(|m| m.as_str().to_string()),
        raw_text,
    }
}

/// Extracts notes and schedule rows from one sheet's tokens.
pub fn extract_rulebook(tokens: &[Token], sheet: &str) -> Vec<RulebookEntry> {
    let mut entries = Vec::new();
    for row in group_rows(tokens) {
        let text = row.iter().map(|t| t.text.trim()).collect::<Vec<_>>().join(" ");
        if row.len() >= 2 && contains_any(&text, &SCHEDULE_KEYWORDS) {
            entries.push(parse_schedule_row(sheet, &row, text));
            continue;
        }
        let mean_confidence = row.iter().map(|t| t.confidence).sum::<f64>() / row.len() as f64;
        let long_and_clear = text.chars().count() > LONG_NOTE_LEN && mean_confidence > LONG_NOTE_CONFIDENCE;
        if contains_any(&text, &NOTE_KEYWORDS) || long_and_clear {
            entries.push(RulebookEntry::Note {
                sheet: sheet.to_string(),
                text,
            });
        }
    }
    entries
}
