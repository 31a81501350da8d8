//! Positioned OCR tokens and the lexical rule that splits them into fixture
//! symbols and free text.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core_modules::geometry::BoundingBox;

/// Fixture codes on lighting plans: one to three letters, digits, an optional
/// suffix letter (`EL501`, `A1E`, `W2`), or a lone capital (`W`).
static SYMBOL_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[A-Z]{1,3}\d{1,4}[A-Z]?|[A-Z])$").expect("static pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    SymbolLike,
    FreeText,
}

/// A recognized string with its position and OCR confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub text: String,
    pub bounding_box: BoundingBox,
    /// OCR engine confidence in `[0, 1]`.
    pub confidence: f64,
    pub kind: TokenKind,
}

impl Token {
    /// Builds a token and assigns its kind with the lexical rule.
    pub fn new(text: impl Into<String>, bounding_box: BoundingBox, confidence: f64) -> Self {
        let text = text.into();
        let kind = classify_token_kind(&text);
        Self {
            text,
            bounding_box,
            confidence: confidence.clamp(0.0, 1.0),
            kind,
        }
    }

    pub fn is_symbol(&self) -> bool {
        self.kind == TokenKind::SymbolLike
    }

    /// Upper-cased, trimmed, whitespace-collapsed text used for comparisons.
    pub fn normalized(&self) -> String {
        normalize(&self.text)
    }
}

pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Short alphanumeric fixture codes are symbol-like; everything else is free text.
pub fn classify_token_kind(text: &str) -> TokenKind {
    if SYMBOL_CODE.is_match(&normalize(text)) {
        TokenKind::SymbolLike
    } else {
        TokenKind::FreeText
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Tokens with OCR confidence below this are dropped before association.
    pub confidence_floor: f64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.3,
        }
    }
}

/// Drops low-confidence and blank tokens.
pub fn filter_tokens(tokens: Vec<Token>, config: &TokenConfig) -> Vec<Token> {
    tokens
        .into_iter()
        .filter(|t| t.confidence >= config.confidence_floor && !t.text.trim().is_empty())
        .collect()
}
