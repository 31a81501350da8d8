// THEORY:
// The `parallel_pipeline` runs the single-page core over a whole document on the tokio
// runtime. Pages share nothing, so they are farmed out to a pool of workers and their
// results are only brought together once every page has finished.
//
// Key architectural principles:
// 1.  **Worker Pool**: A fixed number of workers pull page tasks from one shared queue,
//     so a free worker always takes the next page. Each task carries a `oneshot` sender for its result, and results are
//     awaited in submission order, so the report lists pages in input order no matter
//     which finished first.
// 2.  **Concurrency Inside a Page**: The three detection passes are CPU-bound and run
//     on blocking threads; OCR is I/O-bound and runs next to them. Merging waits for
//     all three passes, association waits for merging and OCR.
// 3.  **Failure Stays Local**: An unreadable page is reported as failed and the rest
//     carry on. An OCR failure or timeout is not even a page failure: the page is
//     analyzed with no tokens and flagged as degraded.
// 4.  **Cooperative Cancellation**: A `watch` channel flips every in-flight page to
//     cancelled. Its partial work is dropped and finished pages are unaffected.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::core_modules::classifier::{ClassificationRefiner, FixtureClassifier, FixtureRecord, FixtureRow};
use crate::core_modules::ocr::{OcrError, OcrProvider};
use crate::core_modules::page::PageImage;
use crate::core_modules::region::{DetectionMethod, Region};
use crate::core_modules::rulebook::RulebookEntry;
use crate::core_modules::summary::{Summary, build_summary};
use crate::core_modules::token::Token;
use crate::error::VisionResult;
use crate::pipeline::{FixturePipeline, PageAnalysis, PageReport, PipelineConfig};

/// Where a page's pixels come from.
#[derive(Debug, Clone)]
pub enum PageSource {
    /// Encoded image bytes (PNG, JPEG, TIFF, ...).
    Encoded(Vec<u8>),
    /// An image file on disk.
    Path(PathBuf),
    Decoded(PageImage),
}

#[derive(Debug, Clone)]
pub struct PageInput {
    pub sheet: String,
    pub source: PageSource,
}

impl PageInput {
    pub fn new(sheet: impl Into<String>, source: PageSource) -> Self {
        Self {
            sheet: sheet.into(),
            source,
        }
    }

    pub fn decoded(page: PageImage) -> Self {
        Self {
            sheet: page.sheet().to_string(),
            source: PageSource::Decoded(page),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Every page completed.
    Complete,
    /// At least one page failed or was cancelled.
    Partial,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentReport {
    pub status: DocumentStatus,
    pub pages: Vec<PageReport>,
    pub fixtures: Vec<FixtureRow>,
    pub summary: Summary,
    pub rulebook: Vec<RulebookEntry>,
    /// Full records behind `fixtures`, including regions and tokens.
    #[serde(skip)]
    pub records: Vec<FixtureRecord>,
}

struct PageOutcome {
    report: PageReport,
    analysis: Option<PageAnalysis>,
}

/// Shared, read-only state every worker needs.
struct PageContext {
    pipeline: FixturePipeline,
    ocr: Arc<dyn OcrProvider>,
    ocr_timeout: Duration,
}

struct PageTask {
    input: PageInput,
    cancel: watch::Receiver<bool>,
    result_sender: oneshot::Sender<PageOutcome>,
}

struct PageWorkerPool {
    task_sender: mpsc::UnboundedSender<PageTask>,
    workers: Vec<JoinHandle<()>>,
}

impl PageWorkerPool {
    fn new(context: Arc<PageContext>, size: usize) -> Self {
        let (task_sender, task_receiver) = mpsc::unbounded_channel::<PageTask>();
        // One queue for all workers; a slow page never holds up the pages behind it.
        let task_receiver = Arc::new(Mutex::new(task_receiver));

        let workers = (0..size)
            .map(|_| {
                let context = Arc::clone(&context);
                let task_receiver = Arc::clone(&task_receiver);
                tokio::spawn(async move {
                    loop {
                        let next = task_receiver.lock().await.recv().await;
                        let Some(task) = next else {
                            break;
                        };
                        let span = info_span!("page", sheet = %task.input.sheet);
                        let outcome = run_page(&context, task.input, task.cancel).instrument(span).await;
                        let _ = task.result_sender.send(outcome);
                    }
                })
            })
            .collect();

        Self { task_sender, workers }
    }

    fn submit(&self, input: PageInput, cancel: watch::Receiver<bool>) -> oneshot::Receiver<PageOutcome> {
        let (result_sender, result_receiver) = oneshot::channel();
        let sheet = input.sheet.clone();
        let task = PageTask {
            input,
            cancel,
            result_sender,
        };
        if self.task_sender.send(task).is_err() {
            warn!(sheet = %sheet, "worker pool closed before page was submitted");
        }
        result_receiver
    }

    /// Closes the task channel and waits for the workers to drain.
    async fn shutdown(self) {
        drop(self.task_sender);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

/// Resolves once cancellation is requested. Never resolves if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn load_page(input: PageInput) -> VisionResult<PageImage> {
    let PageInput { sheet, source } = input;
    let task_sheet = sheet.clone();
    let decoded = match source {
        PageSource::Decoded(page) => return Ok(page),
        PageSource::Encoded(bytes) => tokio::task::spawn_blocking(move || PageImage::decode(task_sheet, &bytes)).await,
        PageSource::Path(path) => tokio::task::spawn_blocking(move || PageImage::open(task_sheet, path)).await,
    };
    decoded.map_err(|e| crate::error::VisionError::PageDecodeFailure {
        sheet,
        reason: format!("decoder task failed: {e}"),
    })?
}

/// Runs the three detection passes on blocking threads. Merging is left to the caller.
async fn detect(context: &Arc<PageContext>, page: &Arc<PageImage>) -> Result<Vec<Region>, String> {
    let passes = DetectionMethod::ALL.map(|method| {
        let context = Arc::clone(context);
        let page = Arc::clone(page);
        tokio::task::spawn_blocking(move || context.pipeline.detector().run_pass(method, &page))
    });

    let mut regions = Vec::new();
    for (method, result) in DetectionMethod::ALL.iter().zip(join_all(passes).await) {
        let found = result.map_err(|e| format!("{} pass failed: {e}", method.as_str()))?;
        regions.extend(found);
    }
    Ok(regions)
}

async fn recognize(context: &PageContext, page: &PageImage) -> Result<Vec<Token>, OcrError> {
    let timeout_ms = context.ocr_timeout.as_millis() as u64;
    match tokio::time::timeout(context.ocr_timeout, context.ocr.recognize(page)).await {
        Ok(result) => result,
        Err(_) => Err(OcrError::Timeout(timeout_ms)),
    }
}

async fn run_page(context: &Arc<PageContext>, input: PageInput, mut cancel: watch::Receiver<bool>) -> PageOutcome {
    let sheet = input.sheet.clone();
    let cancelled_outcome = |sheet: &str| {
        info!(sheet, "page cancelled");
        PageOutcome {
            report: PageReport::cancelled(sheet),
            analysis: None,
        }
    };
    if *cancel.borrow() {
        return cancelled_outcome(&sheet);
    }

    let work = async {
        let page = Arc::new(load_page(input).await?);
        let (regions, tokens) = tokio::join!(detect(context, &page), recognize(context, &page));
        Ok::<_, crate::error::VisionError>((page, regions, tokens))
    };

    let (page, regions, tokens) = tokio::select! {
        result = work => match result {
            Ok(parts) => parts,
            Err(e) => {
                warn!(sheet = %sheet, error = %e, "page failed");
                return PageOutcome { report: PageReport::failed(&sheet, e.to_string()), analysis: None };
            }
        },
        _ = cancelled(&mut cancel) => return cancelled_outcome(&sheet),
    };

    let regions = match regions {
        Ok(regions) => regions,
        Err(reason) => {
            warn!(sheet = %sheet, reason = %reason, "detection failed");
            return PageOutcome {
                report: PageReport::failed(&sheet, reason),
                analysis: None,
            };
        }
    };

    let (tokens, ocr_degraded) = match tokens {
        Ok(tokens) => (tokens, false),
        Err(e) => {
            warn!(
                sheet = %sheet,
                provider = context.ocr.name(),
                error = %e,
                "token extraction failed, continuing without tokens"
            );
            (Vec::new(), true)
        }
    };

    let merged = context.pipeline.merge(regions);
    let analysis = context.pipeline.analyze(page.sheet(), merged, tokens);
    debug!(sheet = %sheet, fixtures = analysis.fixtures.len(), "page finished");
    PageOutcome {
        report: PageReport::complete(&analysis, ocr_degraded),
        analysis: Some(analysis),
    }
}

/// Processes whole documents: pages in parallel, then classification and grouping.
pub struct DocumentPipeline {
    context: Arc<PageContext>,
    classifier: Arc<dyn FixtureClassifier>,
}

impl DocumentPipeline {
    pub fn new(
        config: PipelineConfig,
        ocr: Arc<dyn OcrProvider>,
        classifier: Arc<dyn FixtureClassifier>,
    ) -> VisionResult<Self> {
        let ocr_timeout = Duration::from_millis(config.ocr_timeout_ms);
        let pipeline = FixturePipeline::new(config)?;
        Ok(Self {
            context: Arc::new(PageContext {
                pipeline,
                ocr,
                ocr_timeout,
            }),
            classifier,
        })
    }

    /// Builds the classifier named in `config.classifier`.
    pub fn from_config(
        config: PipelineConfig,
        ocr: Arc<dyn OcrProvider>,
        refiner: Option<Arc<dyn ClassificationRefiner>>,
    ) -> VisionResult<Self> {
        let classifier = config.classifier.build(refiner)?;
        Self::new(config, ocr, classifier)
    }

    pub fn config(&self) -> &PipelineConfig {
        self.context.pipeline.config()
    }

    pub async fn process_document(&self, pages: Vec<PageInput>) -> DocumentReport {
        let (_cancel_sender, cancel) = watch::channel(false);
        self.process_document_with_cancel(pages, cancel).await
    }

    /// Like `process_document`, but pages still running when `cancel` turns `true`
    /// are reported as cancelled.
    pub async fn process_document_with_cancel(
        &self,
        pages: Vec<PageInput>,
        cancel: watch::Receiver<bool>,
    ) -> DocumentReport {
        let page_count = pages.len();
        let workers = self.config().worker_count().min(page_count.max(1));
        info!(
            pages = page_count,
            workers,
            classifier = self.classifier.name(),
            ocr = self.context.ocr.name(),
            "processing document"
        );

        let pool = PageWorkerPool::new(Arc::clone(&self.context), workers);
        let receivers: Vec<(String, oneshot::Receiver<PageOutcome>)> = pages
            .into_iter()
            .map(|input| (input.sheet.clone(), pool.submit(input, cancel.clone())))
            .collect();

        let mut outcomes = Vec::with_capacity(page_count);
        for (sheet, receiver) in receivers {
            let outcome = receiver.await.unwrap_or_else(|_| PageOutcome {
                report: PageReport::failed(&sheet, "page worker stopped before reporting"),
                analysis: None,
            });
            outcomes.push(outcome);
        }
        pool.shutdown().await;

        // --- Document Assembly ---
        let mut reports = Vec::with_capacity(outcomes.len());
        let mut fixtures = Vec::new();
        let mut rulebook = Vec::new();
        for outcome in outcomes {
            reports.push(outcome.report);
            if let Some(analysis) = outcome.analysis {
                fixtures.extend(analysis.fixtures);
                rulebook.extend(analysis.rulebook);
            }
        }

        let records = self.classifier.classify(fixtures, &rulebook).await;
        let summary = build_summary(&records);
        let status = if reports.iter().all(PageReport::is_complete) {
            DocumentStatus::Complete
        } else {
            DocumentStatus::Partial
        };
        info!(
            status = ?status,
            fixtures = records.len(),
            groups = summary.len(),
            "document finished"
        );

        DocumentReport {
            status,
            pages: reports,
            fixtures: records.iter().map(FixtureRecord::to_row).collect(),
            summary,
            rulebook,
            records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::classifier::{RuleTable, RuleTableClassifier};
    use crate::core_modules::ocr::{NoOcr, StaticOcr};
    use async_trait::async_trait;
    use image::{GrayImage, Luma};

    fn page(sheet: &str, rect: Option<(u32, u32, u32, u32)>) -> PageImage {
        let mut gray = GrayImage::from_pixel(400, 300, Luma([255]));
        if let Some((x0, y0, x1, y1)) = rect {
            for y in y0..y1 {
                for x in x0..x1 {
                    gray.put_pixel(x, y, Luma([50]));
                }
            }
        }
        PageImage::from_gray(sheet, gray).unwrap()
    }

    fn pipeline(ocr: Arc<dyn OcrProvider>) -> DocumentPipeline {
        let classifier = Arc::new(RuleTableClassifier::new(Arc::new(RuleTable::with_default_rules().unwrap())));
        let config = PipelineConfig {
            page_concurrency: Some(2),
            ocr_timeout_ms: 200,
            ..PipelineConfig::default()
        };
        DocumentPipeline::new(config, ocr, classifier).unwrap()
    }

    struct StuckOcr;

    #[async_trait]
    impl OcrProvider for StuckOcr {
        async fn recognize(&self, _page: &PageImage) -> Result<Vec<Token>, OcrError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }

        fn name(&self) -> &str {
            "stuck"
        }
    }

    /// Holds the first sheet's OCR until the last sheet's OCR has started.
    struct GatedOcr {
        held: &'static str,
        release_on: &'static str,
        gate: tokio::sync::Notify,
    }

    #[async_trait]
    impl OcrProvider for GatedOcr {
        async fn recognize(&self, page: &PageImage) -> Result<Vec<Token>, OcrError> {
            if page.sheet() == self.held {
                self.gate.notified().await;
            } else if page.sheet() == self.release_on {
                self.gate.notify_one();
            }
            Ok(Vec::new())
        }

        fn name(&self) -> &str {
            "gated"
        }
    }

    #[tokio::test]
    async fn idle_worker_takes_the_next_page() {
        let ocr = Arc::new(GatedOcr {
            held: "E-101",
            release_on: "E-103",
            gate: tokio::sync::Notify::new(),
        });
        let classifier = Arc::new(RuleTableClassifier::new(Arc::new(RuleTable::with_default_rules().unwrap())));
        let config = PipelineConfig {
            page_concurrency: Some(2),
            ocr_timeout_ms: 5_000,
            ..PipelineConfig::default()
        };
        let pipeline = DocumentPipeline::new(config, ocr, classifier).unwrap();
        let pages = ["E-101", "E-102", "E-103"]
            .into_iter()
            .map(|sheet| PageInput::decoded(page(sheet, None)))
            .collect();

        let report = pipeline.process_document(pages).await;
        assert_eq!(report.status, DocumentStatus::Complete);
        // E-103 ran while E-101 was still waiting, so E-101 never hit the timeout.
        assert!(report.pages.iter().all(|p| !p.ocr_degraded));
    }

    #[tokio::test]
    async fn pages_keep_input_order() {
        let pages = vec![
            PageInput::decoded(page("E-103", Some((50, 50, 150, 110)))),
            PageInput::decoded(page("E-101", None)),
            PageInput::decoded(page("E-102", Some((200, 100, 280, 160)))),
        ];
        let report = pipeline(Arc::new(NoOcr)).process_document(pages).await;
        let sheets: Vec<&str> = report.pages.iter().map(|p| p.sheet.as_str()).collect();
        assert_eq!(sheets, ["E-103", "E-101", "E-102"]);
        assert_eq!(report.status, DocumentStatus::Complete);
        assert_eq!(report.fixtures.len(), report.records.len());
        assert_eq!(report.pages[1].fixture_count, 0);
    }

    #[tokio::test]
    async fn undecodable_page_makes_document_partial() {
        let pages = vec![
            PageInput::new("E-101", PageSource::Encoded(b"definitely not an image".to_vec())),
            PageInput::decoded(page("E-102", Some((50, 50, 150, 110)))),
        ];
        let report = pipeline(Arc::new(NoOcr)).process_document(pages).await;
        assert_eq!(report.status, DocumentStatus::Partial);
        assert!(matches!(report.pages[0].status, crate::pipeline::PageStatus::Failed { .. }));
        assert!(report.pages[1].is_complete());
        assert!(report.pages[1].fixture_count > 0);
    }

    #[tokio::test]
    async fn ocr_timeout_degrades_to_symbol_less_fixtures() {
        let pages = vec![PageInput::decoded(page("E-101", Some((50, 50, 150, 110))))];
        let report = pipeline(Arc::new(StuckOcr)).process_document(pages).await;
        assert_eq!(report.status, DocumentStatus::Complete);
        assert!(report.pages[0].ocr_degraded);
        assert!(!report.fixtures.is_empty());
        assert!(report.fixtures.iter().all(|f| f.symbol.is_none()));
    }

    #[tokio::test]
    async fn cancellation_marks_pages_cancelled() {
        let (sender, cancel) = watch::channel(false);
        sender.send(true).unwrap();
        let pages = vec![PageInput::decoded(page("E-101", Some((50, 50, 150, 110))))];
        let report = pipeline(Arc::new(StaticOcr::new()))
            .process_document_with_cancel(pages, cancel)
            .await;
        assert_eq!(report.status, DocumentStatus::Partial);
        assert_eq!(report.pages[0].status, crate::pipeline::PageStatus::Cancelled);
        assert!(report.fixtures.is_empty());
    }

    #[tokio::test]
    async fn empty_document_is_complete() {
        let report = pipeline(Arc::new(NoOcr)).process_document(Vec::new()).await;
        assert_eq!(report.status, DocumentStatus::Complete);
        assert!(report.summary.is_empty());
    }
}
