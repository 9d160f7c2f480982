// src/lib.rs
//
// Streaming extraction and ancestry filtering of wide UK Biobank tables.

pub mod config;
pub mod error;
pub mod output;
pub mod process;
pub mod report;
pub mod schema;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result, RowError, RowErrorKind};
pub use process::{run_pipeline, Pipeline, RunOutcome};
pub use report::{PipelineReport, Summary};
