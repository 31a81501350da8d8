pub mod association;
pub mod blob_detector;
pub mod classifier;
pub mod geometry;
pub mod merge;
pub mod ocr;
pub mod page;
pub mod region;
pub mod region_detector;
pub mod rulebook;
pub mod summary;
pub mod token;
