// src/process/pipeline.rs

use std::fs;
use tracing::{info, instrument, warn};

use super::accumulate::{OutputDataset, OutputPaths, StreamAccumulator};
use super::filter::CategoricalFilter;
use super::reader::{ChunkedTableReader, ReaderOptions};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::output::file_size_mb;
use crate::report::{to_mb, CategoryDistribution, MemoryProbe, PipelineReport, Summary};
use crate::schema::{ColumnResolver, ColumnSelectionPlan, SourceSchema};

/// Log progress every this many chunks.
const PROGRESS_EVERY: usize = 10;

/// What a finished run leaves behind.
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: Summary,
    pub dataset: OutputDataset,
    pub outputs: OutputPaths,
}

/// One extraction (and optional filtering) run over one input file.
///
/// All state lives in the run itself, so several pipelines can run side by
/// side in one process.
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Resolve the column plan from the input header alone.
    pub fn plan(&self) -> Result<ColumnSelectionPlan> {
        let cfg = &self.config;
        let schema = SourceSchema::read_header(&cfg.input)?;
        let first: Vec<&str> = schema.columns().iter().take(10).map(String::as_str).collect();
        info!(columns = schema.len(), first = ?first, "header read");

        if cfg.fields.is_empty() {
            return ColumnSelectionPlan::passthrough(&schema, &cfg.id_column);
        }

        let plan = ColumnResolver::new(&cfg.id_column)
            .with_id_label(&cfg.id_label)
            .resolve(&schema, &cfg.fields)?;
        if plan.columns().len() <= 1 {
            return Err(PipelineError::Configuration(
                "none of the configured fields is present in the input".into(),
            ));
        }
        info!(selected = plan.columns().len(), "columns to extract");
        Ok(plan)
    }

    #[instrument(level = "info", skip(self), fields(input = %self.config.input.display()))]
    pub fn run(&self) -> Result<RunOutcome> {
        let cfg = &self.config;

        // 1) input must exist before anything else happens
        let meta = fs::metadata(&cfg.input).map_err(|e| PipelineError::file_access(&cfg.input, e))?;
        info!(size_mb = format!("{:.1}", to_mb(meta.len())), "input file");

        // 2) header → plan, filter, report; no rows read yet
        let plan = self.plan()?;
        let names = plan.output_names();
        let filter = cfg
            .filter
            .as_ref()
            .map(|f| CategoricalFilter::new(&names, &f.criteria, cfg.missing.clone()))
            .transpose()?;

        let unmatched = plan.unmatched().into_iter().map(str::to_string).collect();
        let mut report = PipelineReport::new(
            filter
                .as_ref()
                .map(|f| f.fields().into_iter().map(str::to_string).collect())
                .unwrap_or_default(),
        )
        .with_unmatched_fields(unmatched);
        if let Some(f) = &filter {
            let dist = CategoryDistribution::new(&names, &f.watched_columns(), &cfg.missing);
            report = report.with_categories(dist, cfg.code_book.clone());
        }

        // 3) stream
        let mut accumulator = StreamAccumulator::new(names, cfg.output_mode, &cfg.output)?;
        let reader = ChunkedTableReader::open(
            &cfg.input,
            &plan,
            ReaderOptions {
                chunk_rows: cfg.chunk_rows,
                policy: cfg.error_policy,
            },
        )?;
        let mut probe = MemoryProbe::new();
        info!(initial_mb = format!("{:.1}", to_mb(probe.sample())), "streaming");

        for (i, batch) in reader.enumerate() {
            let batch = batch?;
            let outcome = match report.categories_mut() {
                Some(dist) => accumulator.accept_observed(batch, filter.as_ref(), dist)?,
                None => accumulator.accept(batch, filter.as_ref())?,
            };
            report.record_chunk(&outcome, probe.sample());

            if (i + 1) % PROGRESS_EVERY == 0 {
                info!(
                    chunks = i + 1,
                    rows = report.rows_seen(),
                    kept = report.rows_kept(),
                    memory_mb = format!("{:.1}", to_mb(report.peak_memory_bytes())),
                    "progress"
                );
            }
        }

        // 4) finalize and persist
        let dataset = accumulator.finalize()?;
        let outputs = match &dataset.persisted {
            Some(paths) => paths.clone(),
            None => dataset.write_to(&cfg.output)?,
        };
        info!(
            data = %outputs.data.display(),
            data_mb = format!("{:.1}", file_size_mb(&outputs.data)),
            ids = %outputs.ids.display(),
            "outputs written"
        );

        report.finish();
        let summary = report.summarize();
        if summary.rows_skipped > 0 {
            warn!(skipped = summary.rows_skipped, "malformed rows were skipped");
        }
        if let Some(path) = &cfg.summary_json {
            summary.write_json(path)?;
        }
        info!(
            seen = summary.rows_seen,
            kept = summary.rows_kept,
            pct = format!("{:.1}", summary.kept_pct),
            "run complete"
        );

        Ok(RunOutcome {
            summary,
            dataset,
            outputs,
        })
    }
}

/// Validate `config` and run it.
pub fn run_pipeline(config: PipelineConfig) -> Result<RunOutcome> {
    Pipeline::new(config)?.run()
}
