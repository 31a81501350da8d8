// THEORY:
// `egress_tester` is the hands-on harness for the engine. It takes page images from
// disk, feeds them through the document pipeline, and writes the fixture report as
// JSON. Optionally it draws every detected fixture back onto its page so the result
// can be checked by eye.
//
// Each page's sheet name is its file stem (`E-101.png` becomes `E-101`). Tokens can
// come from a directory of pre-recorded OCR files named after the sheets, from the
// `tesseract` executable, or not at all.

mod overlay;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use egress_vision::core_modules::classifier::{ClassifierKind, FixtureRow};
use egress_vision::core_modules::ocr::{NoOcr, OcrProvider, StaticOcr, TesseractOcr};
use egress_vision::{DocumentPipeline, DocumentStatus, PageInput, PageSource, PipelineConfig};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Detect emergency lighting fixtures on rasterized blueprint pages.
///
/// Exits with status 2 when at least one page could not be processed.
#[derive(Parser, Debug)]
#[command(name = "egress_tester", version, about, long_about = None)]
struct Cli {
    /// Page images (PNG, JPEG, TIFF, ...). The file stem is used as the sheet name.
    #[arg(required = true)]
    pages: Vec<PathBuf>,

    /// Directory of recorded OCR tokens, one `<sheet>.json` or `<sheet>.tsv` per page.
    #[arg(long, conflicts_with = "tesseract")]
    tokens: Option<PathBuf>,

    /// Run the `tesseract` executable on every page.
    #[arg(long)]
    tesseract: bool,

    /// Path to the tesseract executable.
    #[arg(long, default_value = "tesseract")]
    tesseract_bin: PathBuf,

    /// JSON configuration; any omitted value keeps its default.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Saved classification revisions to apply on top of the rule table.
    #[arg(long)]
    refinements: Option<PathBuf>,

    /// Number of pages processed at once.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Write the JSON report here instead of stdout.
    #[arg(long, short)]
    out: Option<PathBuf>,

    /// Write `<sheet>.overlay.png` images into this directory.
    #[arg(long)]
    overlay: Option<PathBuf>,
}

fn sheet_name(path: &Path) -> Result<String> {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))
}

/// Looks for `<sheet>.json` or `<sheet>.tsv` for every sheet in `dir`.
fn load_recorded_tokens(dir: &Path, sheets: &[String]) -> Result<StaticOcr> {
    if !dir.is_dir() {
        bail!("token directory {} does not exist", dir.display());
    }
    let mut ocr = StaticOcr::new();
    for sheet in sheets {
        let candidates = [dir.join(format!("{sheet}.json")), dir.join(format!("{sheet}.tsv"))];
        match candidates.iter().find(|p| p.is_file()) {
            Some(path) => ocr
                .insert_file(sheet.clone(), path)
                .with_context(|| format!("loading tokens from {}", path.display()))?,
            None => warn!(sheet = %sheet, "no recorded tokens for sheet"),
        }
    }
    info!(sheets = ocr.sheet_count(), "loaded recorded tokens");
    Ok(ocr)
}

fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("reading configuration {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(concurrency) = cli.concurrency {
        config.page_concurrency = Some(concurrency);
    }
    if let Some(path) = &cli.refinements {
        config.classifier.kind = ClassifierKind::ExternalRefiner;
        config.classifier.refinement_file = Some(path.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = build_config(&cli)?;

    let mut sheets = Vec::with_capacity(cli.pages.len());
    for path in &cli.pages {
        sheets.push(sheet_name(path)?);
    }

    let ocr: Arc<dyn OcrProvider> = if cli.tesseract {
        Arc::new(TesseractOcr::new(&cli.tesseract_bin))
    } else if let Some(dir) = &cli.tokens {
        Arc::new(load_recorded_tokens(dir, &sheets)?)
    } else {
        Arc::new(NoOcr)
    };
    let pipeline = DocumentPipeline::from_config(config, ocr, None)?;

    // Ctrl-C cancels pages still in flight; finished pages are still reported.
    let (cancel_sender, cancel) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling remaining pages");
            let _ = cancel_sender.send(true);
        }
    });

    let inputs: Vec<PageInput> = cli
        .pages
        .iter()
        .zip(&sheets)
        .map(|(path, sheet)| PageInput::new(sheet.clone(), PageSource::Path(path.clone())))
        .collect();
    let report = pipeline.process_document_with_cancel(inputs, cancel).await;

    let json = serde_json::to_string_pretty(&report)?;
    match &cli.out {
        Some(path) => {
            std::fs::write(path, &json).with_context(|| format!("writing report {}", path.display()))?;
            info!(path = %path.display(), "report written");
        }
        None => println!("{json}"),
    }

    if let Some(dir) = &cli.overlay {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let mut by_sheet: HashMap<&str, Vec<&FixtureRow>> = HashMap::new();
        for row in &report.fixtures {
            by_sheet.entry(row.source_sheet.as_str()).or_default().push(row);
        }
        for (path, page) in cli.pages.iter().zip(&report.pages) {
            if !page.is_complete() {
                continue;
            }
            let rows = by_sheet.get(page.sheet.as_str()).map(Vec::as_slice).unwrap_or_default();
            let target = overlay::write_overlay(path, &page.sheet, rows, dir)?;
            info!(sheet = %page.sheet, path = %target.display(), "overlay written");
        }
    }

    eprintln!(
        "{} fixtures in {} groups across {} pages ({:?})",
        report.fixtures.len(),
        report.summary.len(),
        report.pages.len(),
        report.status
    );
    Ok(match report.status {
        DocumentStatus::Complete => ExitCode::SUCCESS,
        DocumentStatus::Partial => ExitCode::from(2),
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    run(cli).await
}
