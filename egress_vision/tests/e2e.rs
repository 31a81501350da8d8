mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::synthetic_page::{Symbol, label_right_of, page, png_bytes, token};
use egress_vision::core_modules::classifier::{ClassifierConfig, FixtureType};
use egress_vision::core_modules::geometry::Point;
use egress_vision::core_modules::merge::merge_regions;
use egress_vision::core_modules::ocr::{NoOcr, OcrError, OcrProvider, StaticOcr};
use egress_vision::core_modules::page::PageImage;
use egress_vision::core_modules::region::DetectionMethod;
use egress_vision::core_modules::rulebook::RulebookEntry;
use egress_vision::core_modules::token::Token;
use egress_vision::{DocumentPipeline, DocumentStatus, FixturePipeline, PageInput, PageSource, PageStatus, PipelineConfig};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

fn layout() -> [Symbol; 3] {
    [
        Symbol::new(100, 100, 180, 150),
        Symbol::new(400, 100, 480, 150),
        Symbol::new(100, 330, 180, 380),
    ]
}

fn labelled_tokens(symbols: &[Symbol; 3]) -> Vec<Token> {
    vec![
        label_right_of(&symbols[0], "EL501", 15.0, 0.94),
        label_right_of(&symbols[1], "EL502", 15.0, 0.91),
        label_right_of(&symbols[2], "W2", 15.0, 0.88),
        token("EMERGENCY", [100.0, 160.0, 190.0, 176.0], 0.9),
        token("GENERAL", [420.0, 420.0, 500.0, 436.0], 0.9),
        token("NOTES", [510.0, 421.0, 570.0, 437.0], 0.9),
    ]
}

fn document_pipeline(ocr: Arc<dyn OcrProvider>) -> DocumentPipeline {
    let config = PipelineConfig {
        page_concurrency: Some(2),
        ocr_timeout_ms: 2_000,
        ..PipelineConfig::default()
    };
    DocumentPipeline::from_config(config, ocr, None).unwrap()
}

fn contains(bbox: [f64; 4], (x, y): (f64, f64)) -> bool {
    x >= bbox[0] && x <= bbox[2] && y >= bbox[1] && y <= bbox[3]
}

struct FailingOcr;

#[async_trait]
impl OcrProvider for FailingOcr {
    async fn recognize(&self, _page: &PageImage) -> Result<Vec<Token>, OcrError> {
        Err(OcrError::EngineError("engine crashed".to_string()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

#[tokio::test]
async fn every_region_yields_exactly_one_record() {
    let symbols = layout();
    let sheet = page("E-101", WIDTH, HEIGHT, &symbols);
    let regions = FixturePipeline::new(PipelineConfig::default())
        .unwrap()
        .detector()
        .detect(&sheet);
    assert!(regions.len() >= symbols.len());

    let mut ocr = StaticOcr::new();
    ocr.insert("E-101", labelled_tokens(&symbols));
    let report = document_pipeline(Arc::new(ocr))
        .process_document(vec![PageInput::decoded(sheet)])
        .await;

    assert_eq!(report.status, DocumentStatus::Complete);
    assert_eq!(report.records.len(), regions.len());
    assert_eq!(report.fixtures.len(), regions.len());
    for region in &regions {
        let matching = report
            .records
            .iter()
            .filter(|r| r.fixture.region.bounding_box == region.bounding_box)
            .count();
        assert_eq!(matching, 1, "region {:?}", region.bounding_box);
    }
}

#[tokio::test]
async fn labels_land_on_their_symbols() {
    let symbols = layout();
    let mut ocr = StaticOcr::new();
    ocr.insert("E-101", labelled_tokens(&symbols));
    let report = document_pipeline(Arc::new(ocr))
        .process_document(vec![PageInput::decoded(page("E-101", WIDTH, HEIGHT, &symbols))])
        .await;

    for (symbol, text) in symbols.iter().zip(["EL501", "EL502", "W2"]) {
        let row = report
            .fixtures
            .iter()
            .find(|f| f.symbol.as_deref() == Some(text))
            .unwrap_or_else(|| panic!("{text} was not matched"));
        assert!(contains(row.bounding_box, symbol.center()), "{text} matched the wrong region");
    }

    let el501 = report.fixtures.iter().find(|f| f.symbol.as_deref() == Some("EL501")).unwrap();
    assert_eq!(el501.fixture_type, FixtureType::EmergencyLight);
    assert_eq!(el501.description, "Emergency Lighting Fixture");
    assert_eq!(el501.text_nearby, ["EMERGENCY"]);

    let emergency = report.summary.get("Emergency Lighting Fixture").unwrap();
    assert_eq!(emergency.count, 2);
    assert_eq!(emergency.symbols.iter().map(String::as_str).collect::<Vec<_>>(), ["EL501", "EL502"]);
    assert_eq!(report.summary.get("Wallpack with Built-in Photocell").unwrap().count, 1);

    assert!(report.rulebook.iter().any(|e| matches!(e, RulebookEntry::Note { text, .. } if text == "GENERAL NOTES")));
}

#[tokio::test]
async fn a_label_between_two_symbols_is_claimed_once() {
    let symbols = [Symbol::new(100, 100, 180, 150), Symbol::new(260, 100, 340, 150)];
    // Roughly equidistant from both centers.
    let shared = token("EL7", [200.0, 115.0, 240.0, 135.0], 0.9);
    let mut ocr = StaticOcr::new();
    ocr.insert("E-101", vec![shared]);

    let report = document_pipeline(Arc::new(ocr))
        .process_document(vec![PageInput::decoded(page("E-101", WIDTH, HEIGHT, &symbols))])
        .await;

    let claims = report.fixtures.iter().filter(|f| f.symbol.as_deref() == Some("EL7")).count();
    assert_eq!(claims, 1);
    let stats = report.pages[0].stats.as_ref().unwrap();
    assert_eq!(stats.with_symbols, 1);
}

#[test]
fn merging_ignores_pass_order() {
    let symbols = layout();
    let sheet = page("E-101", WIDTH, HEIGHT, &symbols);
    let pipeline = FixturePipeline::new(PipelineConfig::default()).unwrap();
    let passes: Vec<_> = DetectionMethod::ALL
        .iter()
        .map(|m| pipeline.detector().run_pass(*m, &sheet))
        .collect();

    let forward: Vec<_> = passes.iter().flatten().cloned().collect();
    let backward: Vec<_> = passes.iter().rev().flatten().cloned().collect();
    let mut shuffled = forward.clone();
    shuffled.rotate_left(forward.len() / 2);

    let merge = &pipeline.config().merge;
    let expected = merge_regions(forward, merge);
    assert_eq!(merge_regions(backward, merge), expected);
    assert_eq!(merge_regions(shuffled, merge), expected);
}

#[tokio::test]
async fn unreadable_page_leaves_the_rest_intact() {
    let symbols = layout();
    let pages = vec![
        PageInput::new("E-101", PageSource::Encoded(png_bytes(WIDTH, HEIGHT, &symbols))),
        PageInput::new("E-102", PageSource::Encoded(vec![0x89, 0x50, 0x4e, 0x47, 0x00])),
    ];
    let report = document_pipeline(Arc::new(NoOcr)).process_document(pages).await;

    assert_eq!(report.status, DocumentStatus::Partial);
    assert!(report.pages[0].is_complete());
    assert!(matches!(report.pages[1].status, PageStatus::Failed { .. }));
    assert!(report.fixtures.iter().all(|f| f.source_sheet == "E-101"));
    assert!(report.fixtures.len() >= symbols.len());
}

#[tokio::test]
async fn ocr_failure_keeps_every_fixture_without_symbols() {
    let symbols = layout();
    let report = document_pipeline(Arc::new(FailingOcr))
        .process_document(vec![PageInput::decoded(page("E-101", WIDTH, HEIGHT, &symbols))])
        .await;

    assert_eq!(report.status, DocumentStatus::Complete);
    assert!(report.pages[0].ocr_degraded);
    assert!(report.fixtures.len() >= symbols.len());
    for row in &report.fixtures {
        assert_eq!(row.symbol, None);
        assert_eq!(row.fixture_type, FixtureType::Other);
    }
    for symbol in &symbols {
        let (x, y) = symbol.center();
        assert!(
            report
                .records
                .iter()
                .any(|r| r.fixture.region.bounding_box.contains_point(&Point::new(x, y)))
        );
    }
}

#[tokio::test]
async fn rerunning_a_document_is_reproducible() {
    let symbols = layout();
    let mut ocr = StaticOcr::new();
    ocr.insert("E-101", labelled_tokens(&symbols));
    ocr.insert("E-102", vec![label_right_of(&symbols[0], "A1", 10.0, 0.8)]);
    let pipeline = document_pipeline(Arc::new(ocr));
    let pages = || {
        vec![
            PageInput::decoded(page("E-101", WIDTH, HEIGHT, &symbols)),
            PageInput::decoded(page("E-102", WIDTH, HEIGHT, &symbols[..1])),
        ]
    };

    let first = serde_json::to_string(&pipeline.process_document(pages()).await).unwrap();
    let second = serde_json::to_string(&pipeline.process_document(pages()).await).unwrap();
    assert_eq!(first, second);
}

#[test]
fn external_refiner_without_source_is_a_config_error() {
    let config = PipelineConfig {
        classifier: ClassifierConfig {
            kind: egress_vision::core_modules::classifier::ClassifierKind::ExternalRefiner,
            ..ClassifierConfig::default()
        },
        ..PipelineConfig::default()
    };
    assert!(DocumentPipeline::from_config(config, Arc::new(NoOcr), None).is_err());
}
