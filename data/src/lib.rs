//! Wire and catalog structures shared between the runner and the ingest server.

pub mod catalog;
pub mod job;
pub mod message;

pub use catalog::{apply_overlays, Catalog, OverlayError};
pub use job::{Job, JobArgs, MIN_WEIGHT};
pub use message::{ResultMessage, ScoreSummary, TRIVIAL_SCORE};
