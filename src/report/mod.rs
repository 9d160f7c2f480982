// src/report/mod.rs

pub mod distribution;
pub mod memory;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::BTreeMap, fmt, fs, io::Write, path::Path};

use crate::config::codes::CodeBook;
use crate::error::{PipelineError, Result};
use crate::process::accumulate::BatchOutcome;

pub use distribution::{CategoryDistribution, ColumnDistribution};
pub use memory::{to_mb, MemoryProbe};

/// Offending line numbers kept for the summary.
const SKIPPED_LINES_KEPT: usize = 20;

/// Run-lifetime counters, updated once per chunk.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    chunks: u64,
    rows_seen: u64,
    rows_kept: u64,
    criteria: Vec<String>,
    criterion_hits: Vec<u64>,
    skipped: BTreeMap<&'static str, u64>,
    skipped_lines: Vec<u64>,
    peak_memory_bytes: u64,
    peak_batch_rows: u64,
    peak_batch_bytes: usize,
    unmatched_fields: Vec<String>,
    categories: Option<CategoryDistribution>,
    code_book: CodeBook,
}

impl PipelineReport {
    /// `criteria` names the filter criteria in order; empty in extraction mode.
    pub fn new(criteria: Vec<String>) -> Self {
        let hits = vec![0; criteria.len()];
        Self {
            started_at: Utc::now(),
            finished_at: None,
            chunks: 0,
            rows_seen: 0,
            rows_kept: 0,
            criteria,
            criterion_hits: hits,
            skipped: BTreeMap::new(),
            skipped_lines: Vec::new(),
            peak_memory_bytes: 0,
            peak_batch_rows: 0,
            peak_batch_bytes: 0,
            unmatched_fields: Vec::new(),
            categories: None,
            code_book: CodeBook::default(),
        }
    }

    pub fn with_unmatched_fields(mut self, fields: Vec<String>) -> Self {
        self.unmatched_fields = fields;
        self
    }

    pub fn with_categories(mut self, categories: CategoryDistribution, book: CodeBook) -> Self {
        self.categories = Some(categories);
        self.code_book = book;
        self
    }

    /// Where per-record category counting happens, if enabled.
    pub fn categories_mut(&mut self) -> Option<&mut CategoryDistribution> {
        self.categories.as_mut()
    }

    pub fn record_chunk(&mut self, outcome: &BatchOutcome, mem_sample: u64) {
        self.chunks += 1;
        self.rows_seen += outcome.seen;
        self.rows_kept += outcome.kept;
        for (total, hit) in self.criterion_hits.iter_mut().zip(&outcome.criterion_hits) {
            *total += hit;
        }
        for err in &outcome.skipped {
            *self.skipped.entry(err.kind.label()).or_default() += 1;
            if self.skipped_lines.len() < SKIPPED_LINES_KEPT {
                self.skipped_lines.push(err.line);
            }
        }
        self.peak_memory_bytes = self.peak_memory_bytes.max(mem_sample);
        self.peak_batch_rows = self.peak_batch_rows.max(outcome.seen);
        self.peak_batch_bytes = self.peak_batch_bytes.max(outcome.batch_bytes);
    }

    /// Stamp the end of the run. Later calls keep the first stamp.
    pub fn finish(&mut self) {
        self.finished_at.get_or_insert_with(Utc::now);
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    pub fn rows_seen(&self) -> u64 {
        self.rows_seen
    }

    pub fn rows_kept(&self) -> u64 {
        self.rows_kept
    }

    pub fn rows_skipped(&self) -> u64 {
        self.skipped.values().sum()
    }

    pub fn peak_memory_bytes(&self) -> u64 {
        self.peak_memory_bytes
    }

    pub fn summarize(&self) -> Summary {
        let rows_skipped = self.rows_skipped();
        Summary {
            started_at: self.started_at,
            finished_at: self.finished_at,
            chunks: self.chunks,
            rows_read: self.rows_seen + rows_skipped,
            rows_seen: self.rows_seen,
            rows_kept: self.rows_kept,
            kept_pct: if self.rows_seen == 0 {
                0.0
            } else {
                self.rows_kept as f64 * 100.0 / self.rows_seen as f64
            },
            criterion_hits: self
                .criteria
                .iter()
                .cloned()
                .zip(self.criterion_hits.iter().copied())
                .collect(),
            rows_skipped,
            skipped_by_kind: self
                .skipped
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            first_skipped_lines: self.skipped_lines.clone(),
            peak_memory_bytes: self.peak_memory_bytes,
            peak_batch_rows: self.peak_batch_rows,
            peak_batch_bytes: self.peak_batch_bytes,
            unmatched_fields: self.unmatched_fields.clone(),
            distribution: self
                .categories
                .as_ref()
                .map(|c| c.columns(&self.code_book))
                .unwrap_or_default(),
        }
    }
}

/// Immutable end-of-run view of the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub chunks: u64,
    /// Data rows read from the file, malformed ones included.
    pub rows_read: u64,
    /// Well-formed rows handed to the accumulator.
    pub rows_seen: u64,
    pub rows_kept: u64,
    pub kept_pct: f64,
    pub criterion_hits: Vec<(String, u64)>,
    pub rows_skipped: u64,
    pub skipped_by_kind: BTreeMap<String, u64>,
    pub first_skipped_lines: Vec<u64>,
    pub peak_memory_bytes: u64,
    pub peak_batch_rows: u64,
    pub peak_batch_bytes: usize,
    pub unmatched_fields: Vec<String>,
    pub distribution: Vec<ColumnDistribution>,
}

impl Summary {
    /// Write as pretty JSON, replacing `path` atomically.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(|e| PipelineError::output(path, e))?;
        let mut tmp =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| PipelineError::output(path, e))?;
        serde_json::to_writer_pretty(&mut tmp, self).map_err(|e| PipelineError::output(path, e))?;
        tmp.write_all(b"\n").map_err(|e| PipelineError::output(path, e))?;
        tmp.persist(path)
            .map_err(|e| PipelineError::output(path, e.error))?;
        Ok(())
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== SUMMARY ===")?;
        writeln!(f, "chunks processed : {}", self.chunks)?;
        writeln!(f, "rows read        : {}", self.rows_read)?;
        writeln!(f, "rows skipped     : {}", self.rows_skipped)?;
        for (kind, n) in &self.skipped_by_kind {
            writeln!(f, "  {:<14} : {}", kind, n)?;
        }
        if !self.first_skipped_lines.is_empty() {
            writeln!(f, "  first lines    : {:?}", self.first_skipped_lines)?;
        }
        writeln!(f, "rows kept        : {} ({:.1}%)", self.rows_kept, self.kept_pct)?;
        for (criterion, hits) in &self.criterion_hits {
            writeln!(f, "  matched {:<8} : {}", criterion, hits)?;
        }
        if !self.unmatched_fields.is_empty() {
            writeln!(f, "fields not found : {}", self.unmatched_fields.join(", "))?;
        }
        writeln!(f, "peak memory      : {:.1} MB", to_mb(self.peak_memory_bytes))?;
        writeln!(
            f,
            "largest batch    : {} rows, ~{:.2} MB",
            self.peak_batch_rows,
            to_mb(self.peak_batch_bytes as u64)
        )?;
        for col in &self.distribution {
            writeln!(f, "--- {} ---", col.column)?;
            for cat in &col.categories {
                let pct = if self.rows_seen == 0 {
                    0.0
                } else {
                    cat.seen as f64 * 100.0 / self.rows_seen as f64
                };
                writeln!(
                    f,
                    "  {:>8}: {:<28} seen {} ({:.1}%), kept {}",
                    cat.code,
                    cat.description.as_deref().unwrap_or("-"),
                    cat.seen,
                    pct,
                    cat.kept
                )?;
            }
        }
        Ok(())
    }
}
