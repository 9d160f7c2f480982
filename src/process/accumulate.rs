// src/process/accumulate.rs

use serde::{Deserialize, Serialize};
use std::{
    mem,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info};

use super::filter::CategoricalFilter;
use super::reader::{Record, RowBatch};
use crate::error::{PipelineError, Result, RowError};
use crate::output::{AtomicLineWriter, AtomicTsvWriter};

/// Where kept records live until the run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Hold kept records in memory; write once after finalize.
    Buffered,
    /// Append kept records to temporary files per batch; rename on finalize.
    #[default]
    Streaming,
}

/// Destinations of the two output artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPaths {
    /// Tab-separated kept records, header first.
    pub data: PathBuf,
    /// Kept identifiers, one per line, no header.
    pub ids: PathBuf,
}

impl OutputPaths {
    pub fn new(data: impl AsRef<Path>, ids: impl AsRef<Path>) -> Self {
        Self {
            data: data.as_ref().to_path_buf(),
            ids: ids.as_ref().to_path_buf(),
        }
    }
}

/// Gets a look at every record the accumulator sees, with its verdict.
pub trait RecordObserver {
    fn observe(&mut self, record: &Record, kept: bool);
}

impl RecordObserver for () {
    fn observe(&mut self, _record: &Record, _kept: bool) {}
}

/// What one `accept` call did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub batch: usize,
    pub seen: u64,
    pub kept: u64,
    /// Per-criterion matches in this batch; empty in extraction mode.
    pub criterion_hits: Vec<u64>,
    /// Rows the reader dropped while filling this batch.
    pub skipped: Vec<RowError>,
    /// Estimated heap held by the batch when it arrived.
    pub batch_bytes: usize,
}

/// The run's result once the accumulator is finalized.
#[derive(Debug, Clone)]
pub struct OutputDataset {
    pub columns: Vec<String>,
    /// Kept records in arrival order. Empty when they were streamed to disk.
    pub records: Vec<Record>,
    /// Identifier of every kept record, in arrival order.
    pub ids: Vec<String>,
    pub rows_kept: u64,
    /// Set when the artifacts were already persisted while streaming.
    pub persisted: Option<OutputPaths>,
}

impl OutputDataset {
    /// Write both artifacts from buffered records.
    pub fn write_to(&self, paths: &OutputPaths) -> Result<OutputPaths> {
        if self.records.len() as u64 != self.rows_kept {
            return Err(PipelineError::Lifecycle(
                "records were streamed to disk and are no longer buffered",
            ));
        }

        let mut data = AtomicTsvWriter::new(&paths.data)?;
        data.write_header(&self.columns)?;
        for record in &self.records {
            data.write_record(record)?;
        }
        let mut ids = AtomicLineWriter::new(&paths.ids)?;
        for id in &self.ids {
            ids.write_line(id)?;
        }

        Ok(OutputPaths {
            data: data.finish()?,
            ids: ids.finish()?,
        })
    }
}

enum Sink {
    Buffered(Vec<Record>),
    Streaming {
        data: AtomicTsvWriter,
        ids: AtomicLineWriter,
        paths: OutputPaths,
    },
    Closed,
}

/// Folds batches into the output dataset, one record at a time, without ever
/// looking back at earlier batches.
pub struct StreamAccumulator {
    columns: Arc<[String]>,
    sink: Sink,
    ids: Vec<String>,
    seen: u64,
    kept: u64,
}

impl StreamAccumulator {
    /// Keep records in memory.
    pub fn buffered(columns: Vec<String>) -> Self {
        Self {
            columns: columns.into(),
            sink: Sink::Buffered(Vec::new()),
            ids: Vec::new(),
            seen: 0,
            kept: 0,
        }
    }

    /// Write records to temporary files as they arrive.
    pub fn streaming(columns: Vec<String>, paths: &OutputPaths) -> Result<Self> {
        let mut data = AtomicTsvWriter::new(&paths.data)?;
        data.write_header(&columns)?;
        let ids = AtomicLineWriter::new(&paths.ids)?;
        Ok(Self {
            columns: columns.into(),
            sink: Sink::Streaming {
                data,
                ids,
                paths: paths.clone(),
            },
            ids: Vec::new(),
            seen: 0,
            kept: 0,
        })
    }

    pub fn new(columns: Vec<String>, mode: OutputMode, paths: &OutputPaths) -> Result<Self> {
        match mode {
            OutputMode::Buffered => Ok(Self::buffered(columns)),
            OutputMode::Streaming => Self::streaming(columns, paths),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows_seen(&self) -> u64 {
        self.seen
    }

    pub fn rows_kept(&self) -> u64 {
        self.kept
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self.sink, Sink::Closed)
    }

    /// Take in a batch. Without a filter every record is kept.
    pub fn accept(
        &mut self,
        batch: RowBatch,
        filter: Option<&CategoricalFilter>,
    ) -> Result<BatchOutcome> {
        self.accept_observed(batch, filter, &mut ())
    }

    /// `accept`, reporting each record and its verdict to `observer`.
    pub fn accept_observed(
        &mut self,
        batch: RowBatch,
        filter: Option<&CategoricalFilter>,
        observer: &mut dyn RecordObserver,
    ) -> Result<BatchOutcome> {
        if self.is_finalized() {
            return Err(PipelineError::Lifecycle("accept called after finalize"));
        }
        if batch.columns() != &*self.columns {
            return Err(PipelineError::Configuration(format!(
                "batch {} has columns {:?}, accumulator expects {:?}",
                batch.index(),
                batch.columns(),
                self.columns
            )));
        }

        let index = batch.index();
        let batch_bytes = batch.resident_bytes();

        let mut hits = vec![0u64; filter.map_or(0, CategoricalFilter::len)];
        let mut seen = 0u64;
        let mut kept = 0u64;

        let (records, skipped) = batch.into_parts();
        for record in records {
            seen += 1;
            let keep = match filter {
                Some(f) => f.tally(&record, &mut hits),
                None => true,
            };
            observer.observe(&record, keep);
            if !keep {
                continue;
            }
            kept += 1;
            let id = record.id().to_string();
            match &mut self.sink {
                Sink::Buffered(records) => records.push(record),
                Sink::Streaming { data, ids, .. } => {
                    data.write_record(&record)?;
                    ids.write_line(&id)?;
                }
                Sink::Closed => unreachable!("checked above"),
            }
            self.ids.push(id);
        }

        self.seen += seen;
        self.kept += kept;
        debug!(batch = index, seen, kept, "batch accepted");

        Ok(BatchOutcome {
            batch: index,
            seen,
            kept,
            criterion_hits: hits,
            skipped,
            batch_bytes,
        })
    }

    /// Close the accumulator and hand over the dataset. Callable once.
    pub fn finalize(&mut self) -> Result<OutputDataset> {
        let sink = mem::replace(&mut self.sink, Sink::Closed);
        let (records, persisted) = match sink {
            Sink::Closed => return Err(PipelineError::Lifecycle("finalize called twice")),
            Sink::Buffered(records) => (records, None),
            Sink::Streaming { data, ids, paths } => {
                data.finish()?;
                ids.finish()?;
                info!(data = %paths.data.display(), ids = %paths.ids.display(), "outputs persisted");
                (Vec::new(), Some(paths))
            }
        };

        Ok(OutputDataset {
            columns: self.columns.to_vec(),
            records,
            ids: mem::take(&mut self.ids),
            rows_kept: self.kept,
            persisted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::filter::AncestryCriterion;
    use crate::process::value::{MissingMarkers, Value};
    use std::fs;
    use tempfile::tempdir;

    fn cols() -> Vec<String> {
        vec!["ID".into(), "Gen_ethnic_grp".into()]
    }

    fn batch(index: usize, rows: &[(i64, i64)]) -> RowBatch {
        let records = rows
            .iter()
            .map(|&(id, g)| Record::new(vec![Value::from(id.to_string()), Value::from(g.to_string())]))
            .collect();
        RowBatch::new(index, cols().into(), records)
    }

    fn caucasian() -> CategoricalFilter {
        CategoricalFilter::new(
            &cols(),
            &[AncestryCriterion::new("Gen_ethnic_grp", [1i64])],
            MissingMarkers::default(),
        )
        .unwrap()
    }

    #[test]
    fn extraction_mode_keeps_everything() {
        let mut acc = StreamAccumulator::buffered(cols());
        let out = acc.accept(batch(0, &[(1, 1), (2, 2)]), None).unwrap();
        assert_eq!((out.seen, out.kept), (2, 2));
        assert!(out.criterion_hits.is_empty());

        let ds = acc.finalize().unwrap();
        assert_eq!(ds.ids, vec!["1", "2"]);
        assert_eq!(ds.records.len(), 2);
        assert!(ds.persisted.is_none());
    }

    #[test]
    fn filter_mode_keeps_matches_in_arrival_order() {
        let f = caucasian();
        let mut acc = StreamAccumulator::buffered(cols());
        let a = acc.accept(batch(0, &[(5, 1), (6, 2)]), Some(&f)).unwrap();
        let b = acc.accept(batch(1, &[(3, 1), (4, 1)]), Some(&f)).unwrap();
        assert_eq!((a.kept, b.kept), (1, 2));
        assert_eq!(b.criterion_hits, vec![2]);
        assert_eq!(acc.rows_seen(), 4);

        let ds = acc.finalize().unwrap();
        assert_eq!(ds.ids, vec!["5", "3", "4"]);
        assert_eq!(ds.rows_kept, 3);
    }

    #[test]
    fn finalize_twice_is_a_lifecycle_error() {
        let mut acc = StreamAccumulator::buffered(cols());
        acc.finalize().unwrap();
        assert!(matches!(
            acc.finalize().unwrap_err(),
            PipelineError::Lifecycle(_)
        ));
    }

    #[test]
    fn accept_after_finalize_is_a_lifecycle_error() {
        let mut acc = StreamAccumulator::buffered(cols());
        acc.finalize().unwrap();
        let err = acc.accept(batch(0, &[(1, 1)]), None).unwrap_err();
        assert!(matches!(err, PipelineError::Lifecycle(_)));
    }

    #[test]
    fn mismatched_batch_columns_are_rejected() {
        let mut acc = StreamAccumulator::buffered(vec!["ID".into()]);
        assert!(acc.accept(batch(0, &[(1, 1)]), None).is_err());
    }

    #[test]
    fn streaming_and_buffered_write_identical_bytes() {
        let dir = tempdir().unwrap();
        let f = caucasian();
        let streamed = OutputPaths::new(dir.path().join("s.tsv"), dir.path().join("s.txt"));
        let buffered = OutputPaths::new(dir.path().join("b.tsv"), dir.path().join("b.txt"));

        let mut s = StreamAccumulator::streaming(cols(), &streamed).unwrap();
        let mut b = StreamAccumulator::buffered(cols());
        for acc in [&mut s, &mut b] {
            acc.accept(batch(0, &[(1, 1), (2, 2)]), Some(&f)).unwrap();
            acc.accept(batch(1, &[(3, 1)]), Some(&f)).unwrap();
        }
        let sd = s.finalize().unwrap();
        assert_eq!(sd.persisted.as_ref(), Some(&streamed));
        assert!(sd.records.is_empty());
        assert!(sd.write_to(&buffered).is_err());

        b.finalize().unwrap().write_to(&buffered).unwrap();

        assert_eq!(
            fs::read_to_string(&streamed.data).unwrap(),
            "ID\tGen_ethnic_grp\n1\t1\n3\t1\n"
        );
        assert_eq!(
            fs::read(&streamed.data).unwrap(),
            fs::read(&buffered.data).unwrap()
        );
        assert_eq!(fs::read_to_string(&streamed.ids).unwrap(), "1\n3\n");
        assert_eq!(
            fs::read(&streamed.ids).unwrap(),
            fs::read(&buffered.ids).unwrap()
        );
    }

    #[test]
    fn unfinalized_stream_leaves_no_output() {
        let dir = tempdir().unwrap();
        let paths = OutputPaths::new(dir.path().join("s.tsv"), dir.path().join("s.txt"));
        {
            let mut s = StreamAccumulator::streaming(cols(), &paths).unwrap();
            s.accept(batch(0, &[(1, 1)]), None).unwrap();
        }
        assert!(!paths.data.exists());
        assert!(!paths.ids.exists());
    }

    #[test]
    fn observer_sees_every_verdict() {
        struct Count(u64, u64);
        impl RecordObserver for Count {
            fn observe(&mut self, _record: &Record, kept: bool) {
                if kept {
                    self.0 += 1
                } else {
                    self.1 += 1
                }
            }
        }
        let f = caucasian();
        let mut acc = StreamAccumulator::buffered(cols());
        let mut count = Count(0, 0);
        acc.accept_observed(batch(0, &[(1, 1), (2, 2), (3, 9)]), Some(&f), &mut count)
            .unwrap();
        assert_eq!((count.0, count.1), (1, 2));
    }
}
