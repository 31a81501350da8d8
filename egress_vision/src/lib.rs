// THEORY:
// This file is the main entry point for the `egress_vision` library crate. It exposes
// an engine that reads rasterized construction drawings and reports the emergency
// lighting fixtures drawn on them: where each one is, which label belongs to it,
// what kind of fixture that label denotes, and how many of each kind the document has.
//
// The public face is deliberately small. `FixturePipeline` is the synchronous,
// single-page core; `DocumentPipeline` runs it across many pages on the tokio
// runtime, next to an OCR collaborator, and folds the pages into one report. The
// building blocks (`core_modules`) stay public so callers can run a single stage in
// isolation, but most consumers only need the two pipelines and their configuration.

pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use error::{VisionError, VisionResult};
pub use parallel_pipeline::{DocumentPipeline, DocumentReport, DocumentStatus, PageInput, PageSource};
pub use pipeline::{FixturePipeline, PageAnalysis, PageReport, PageStatus, PipelineConfig};
