// THEORY:
// OCR is a boundary collaborator. The engine never recognizes text itself; it asks an
// `OcrProvider` for the tokens on a page and treats the answer as a pure function of
// the page image. Providers are swapped freely behind the trait:
//
// 1.  **StaticOcr**: Tokens recorded ahead of time, keyed by sheet name. Used for
//     replaying an earlier OCR run and for tests.
// 2.  **TesseractOcr**: Pipes the page as PNG into the `tesseract` executable and
//     parses its word-level TSV output.
// 3.  **NoOcr**: Detection-only runs. Every fixture comes out without a symbol.
//
// A provider failure is never fatal to a page. The pipeline downgrades it to an
// empty token set and keeps going.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::core_modules::geometry::BoundingBox;
use crate::core_modules::page::PageImage;
use crate::core_modules::token::Token;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("unsupported operation")]
    Unsupported,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("engine error: {0}")]
    EngineError(String),
    #[error("ocr timed out after {0} ms")]
    Timeout(u64),
}

#[async_trait]
pub trait OcrProvider: Send + Sync {
    async fn recognize(&self, page: &PageImage) -> Result<Vec<Token>, OcrError>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}

/// Returns no tokens for any page.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOcr;

#[async_trait]
impl OcrProvider for NoOcr {
    async fn recognize(&self, _page: &PageImage) -> Result<Vec<Token>, OcrError> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "none"
    }
}

/// A token as written in a token file. The kind is derived on load.
#[derive(Debug, Deserialize)]
struct TokenRecord {
    text: String,
    bounding_box: BoundingBox,
    confidence: f64,
}

/// Pre-recorded tokens, keyed by sheet name.
#[derive(Debug, Clone, Default)]
pub struct StaticOcr {
    sheets: HashMap<String, Vec<Token>>,
}

impl StaticOcr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, sheet: impl Into<String>, tokens: Vec<Token>) {
        self.sheets.insert(sheet.into(), tokens);
    }

    /// Adds a sheet from a JSON array of `{text, bounding_box, confidence}` objects.
    pub fn insert_json(&mut self, sheet: impl Into<String>, json: &str) -> Result<(), OcrError> {
        let records: Vec<TokenRecord> =
            serde_json::from_str(json).map_err(|e| OcrError::InvalidInput(e.to_string()))?;
        let tokens = records
            .into_iter()
            .map(|r| Token::new(r.text, r.bounding_box, r.confidence))
            .collect();
        self.insert(sheet, tokens);
        Ok(())
    }

    /// Adds a sheet from Tesseract TSV output.
    pub fn insert_tsv(&mut self, sheet: impl Into<String>, tsv: &str) {
        self.insert(sheet, parse_tesseract_tsv(tsv));
    }

    /// Loads a token file, picking the format from its extension (`.tsv` or JSON).
    pub fn insert_file(&mut self, sheet: impl Into<String>, path: &Path) -> Result<(), OcrError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OcrError::InvalidInput(format!("{}: {e}", path.display())))?;
        let is_tsv = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("tsv"));
        if is_tsv {
            self.insert_tsv(sheet, &content);
            Ok(())
        } else {
            self.insert_json(sheet, &content)
        }
    }

    pub fn sheet_count(&self) -> usize {
        self.sheets.len()
    }
}

#[async_trait]
impl OcrProvider for StaticOcr {
    async fn recognize(&self, page: &PageImage) -> Result<Vec<Token>, OcrError> {
        Ok(self.sheets.get(page.sheet()).cloned().unwrap_or_default())
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Runs the `tesseract` command line tool on each page.
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    executable: PathBuf,
    language: String,
    page_segmentation_mode: u8,
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("tesseract"),
            language: "eng".to_string(),
            page_segmentation_mode: 11,
        }
    }
}

impl TesseractOcr {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Tesseract `--psm` value. Sparse text (11) suits scattered plan labels.
    pub fn with_page_segmentation_mode(mut self, psm: u8) -> Self {
        self.page_segmentation_mode = psm;
        self
    }
}

#[async_trait]
impl OcrProvider for TesseractOcr {
    async fn recognize(&self, page: &PageImage) -> Result<Vec<Token>, OcrError> {
        let png = page
            .to_png_bytes()
            .map_err(|e| OcrError::InvalidInput(e.to_string()))?;

        let mut child = Command::new(&self.executable)
            .args(["stdin", "stdout", "-l", &self.language, "--psm"])
            .arg(self.page_segmentation_mode.to_string())
            .arg("tsv")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OcrError::EngineError(format!("failed to start {}: {e}", self.executable.display())))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| OcrError::EngineError("tesseract stdin unavailable".to_string()))?;
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&png).await;
            drop(stdin);
            result
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| OcrError::EngineError(e.to_string()))?;
        writer
            .await
            .map_err(|e| OcrError::EngineError(e.to_string()))?
            .map_err(|e| OcrError::EngineError(format!("writing page to tesseract: {e}")))?;

        if !output.status.success() {
            return Err(OcrError::EngineError(format!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let tokens = parse_tesseract_tsv(&String::from_utf8_lossy(&output.stdout));
        debug!(sheet = page.sheet(), tokens = tokens.len(), "tesseract finished");
        Ok(tokens)
    }

    fn name(&self) -> &str {
        "tesseract"
    }
}

/// Parses Tesseract's `tsv` output into word tokens.
///
/// Only word rows (level 5) are kept. Rows with empty text or a confidence at or
/// below zero are skipped, and confidence is rescaled from percent to `[0, 1]`.
pub fn parse_tesseract_tsv(tsv: &str) -> Vec<Token> {
    const LEVEL: usize = 0;
    const LEFT: usize = 6;
    const CONF: usize = 10;
    const TEXT: usize = 11;

    tsv.lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() <= TEXT || cols[LEVEL].trim() != "5" {
                return None;
            }
            let text = cols[TEXT].trim();
            let conf: f64 = cols[CONF].trim().parse().ok()?;
            if text.is_empty() || conf <= 0.0 {
                return None;
            }
            let mut geometry = [0.0f64; 4];
            for (slot, col) in geometry.iter_mut().zip(&cols[LEFT..LEFT + 4]) {
                *slot = col.trim().parse().ok()?;
            }
            let [left, top, width, height] = geometry;
            let bbox = BoundingBox::from_xywh(left, top, width, height).ok()?;
            Some(Token::new(text, bbox, conf / 100.0))
        })
        .collect()
}
