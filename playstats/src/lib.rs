//! Incremental sync of recently played tracks into an analytical store, and
//! a published stats snapshot computed from it.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod models;
pub mod publish;
pub mod spotify;
pub mod store;
pub mod summary;
pub mod watermark;

pub use config::Config;
pub use context::RunContext;
pub use error::JobError;
pub use jobs::{run_ingest, run_summary, IngestReport, SummaryReport};
pub use summary::{MonthlyCount, Snapshot, TopArtist, TopTrack};
