//! Error types for the fixture extraction engine.
//!
//! Only genuine failures live here. An empty page, an unclassified fixture and
//! an ambiguous symbol assignment are valid outcomes and never surface as errors.

use thiserror::Error;

use crate::core_modules::ocr::OcrError;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("page '{sheet}' could not be decoded: {reason}")]
    PageDecodeFailure { sheet: String, reason: String },

    #[error("token extraction failed: {0}")]
    TokenExtractionFailure(#[from] OcrError),

    #[error("invalid classification rule '{pattern}': {reason}")]
    InvalidRule { pattern: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("classification refinement failed: {0}")]
    Refinement(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type VisionResult<T> = Result<T, VisionError>;
