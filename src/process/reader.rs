// src/process/reader.rs

use csv::{ByteRecord, ReaderBuilder, Terminator};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    iter::FusedIterator,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, warn};

use super::value::Value;
use crate::error::{PipelineError, Result, RowError, RowErrorKind};
use crate::schema::{ColumnSelectionPlan, SourceSchema};

/// Rows per batch when nothing else is configured.
pub const DEFAULT_CHUNK_ROWS: usize = 3_000;

/// Individual skipped rows are logged at `warn` up to this many times.
const WARN_LIMIT: u64 = 10;

/// What the reader does with a malformed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Drop the row, keep a `RowError` for the report, carry on.
    #[default]
    Skip,
    /// Stop the stream at the first malformed row.
    Abort,
}

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Upper bound on rows per batch, rejected rows included.
    pub chunk_rows: usize,
    pub policy: ErrorPolicy,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            chunk_rows: DEFAULT_CHUNK_ROWS,
            policy: ErrorPolicy::default(),
        }
    }
}

/// One row restricted to the planned columns, in plan order.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    values: Vec<Value>,
}

impl Record {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// The identifier is always the first planned column.
    pub fn id(&self) -> &Value {
        &self.values[0]
    }

    pub fn resident_bytes(&self) -> usize {
        std::mem::size_of::<Record>()
            + self.values.iter().map(Value::resident_bytes).sum::<usize>()
            + (self.values.capacity() - self.values.len()) * std::mem::size_of::<Value>()
    }
}

/// A bounded run of consecutive rows. Dropped once the accumulator is done
/// with it.
#[derive(Debug)]
pub struct RowBatch {
    index: usize,
    columns: Arc<[String]>,
    records: Vec<Record>,
    skipped: Vec<RowError>,
}

impl RowBatch {
    pub fn new(index: usize, columns: Arc<[String]>, records: Vec<Record>) -> Self {
        Self {
            index,
            columns,
            records,
            skipped: Vec::new(),
        }
    }

    /// 0-based position of this batch in the stream.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn shared_columns(&self) -> Arc<[String]> {
        Arc::clone(&self.columns)
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Rows dropped while this batch was filled (skip policy only).
    pub fn skipped(&self) -> &[RowError] {
        &self.skipped
    }

    pub fn into_parts(self) -> (Vec<Record>, Vec<RowError>) {
        (self.records, self.skipped)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn resident_bytes(&self) -> usize {
        self.records.iter().map(Record::resident_bytes).sum()
    }
}

/// Streams a tab-separated file as `RowBatch`es holding only planned columns.
///
/// Each physical line is tokenised into one reusable buffer; only the planned
/// fields are copied out, so a batch costs `chunk_rows × selected columns`
/// regardless of how wide or tall the file is. The stream is consumed once;
/// to read again, open a new reader.
pub struct ChunkedTableReader {
    path: PathBuf,
    reader: csv::Reader<File>,
    selection: Vec<usize>,
    columns: Arc<[String]>,
    expected_fields: usize,
    options: ReaderOptions,
    buffer: ByteRecord,
    /// Line of the record sitting undecoded in `buffer`.
    pending: Option<u64>,
    /// First line not yet accounted for.
    next_line: u64,
    /// Lines from `next_line` up to here are known to be blank.
    blank_end: u64,
    eof: bool,
    file_len: u64,
    ends_with_newline: bool,
    batch_index: usize,
    rows_read: u64,
    rows_skipped: u64,
    done: bool,
}

impl ChunkedTableReader {
    /// Open `path`, check its header against `plan`, and position the reader
    /// on the first data row.
    pub fn open<P: AsRef<Path>>(
        path: P,
        plan: &ColumnSelectionPlan,
        options: ReaderOptions,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if options.chunk_rows == 0 {
            return Err(PipelineError::Configuration(
                "chunk_rows must be at least 1".into(),
            ));
        }

        let mut file = File::open(&path).map_err(|e| PipelineError::file_access(&path, e))?;
        let (file_len, ends_with_newline) =
            tail_info(&mut file).map_err(|e| PipelineError::file_access(&path, e))?;
        // one physical line per record; `\r` of CRLF files is stripped per field
        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .terminator(Terminator::Any(b'\n'))
            .has_headers(true)
            .flexible(true)
            .quoting(false)
            .from_reader(file);

        let header = match reader.headers() {
            Ok(h) => h
                .iter()
                .map(|c| c.trim_end_matches('\r').to_string())
                .collect::<Vec<_>>(),
            Err(e) => {
                return Err(match e.into_kind() {
                    csv::ErrorKind::Io(io) => PipelineError::file_access(&path, io),
                    other => PipelineError::SchemaMismatch(format!("unreadable header: {:?}", other)),
                })
            }
        };
        let schema = SourceSchema::from_columns(header)?;
        let selection = locate_planned(&schema, plan)?;

        let columns: Arc<[String]> = plan.output_names().into();
        debug!(
            path = %path.display(),
            selected = selection.len(),
            total = schema.len(),
            chunk_rows = options.chunk_rows,
            "opened chunked reader"
        );

        Ok(Self {
            path,
            reader,
            selection,
            columns,
            expected_fields: schema.len(),
            options,
            buffer: ByteRecord::new(),
            pending: None,
            next_line: 2,
            blank_end: 2,
            eof: false,
            file_len,
            ends_with_newline,
            batch_index: 0,
            rows_read: 0,
            rows_skipped: 0,
            done: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Data rows encountered so far, skipped ones included.
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    pub fn rows_skipped(&self) -> u64 {
        self.rows_skipped
    }

    fn decode(&self, line: u64) -> std::result::Result<Record, RowError> {
        let last = self.buffer.len().saturating_sub(1);
        let field = |idx: usize| {
            let raw = &self.buffer[idx];
            match raw.last() {
                Some(&b'\r') if idx == last => &raw[..raw.len() - 1],
                _ => raw,
            }
        };

        if self.buffer.len() == 1 && field(0).is_empty() {
            return Err(RowError {
                line,
                kind: RowErrorKind::EmptyLine,
            });
        }
        if self.buffer.len() != self.expected_fields {
            return Err(RowError {
                line,
                kind: RowErrorKind::FieldCount {
                    expected: self.expected_fields,
                    found: self.buffer.len(),
                },
            });
        }

        let mut values = Vec::with_capacity(self.selection.len());
        for &idx in &self.selection {
            let raw = std::str::from_utf8(field(idx)).map_err(|_| RowError {
                line,
                kind: RowErrorKind::Encoding,
            })?;
            values.push(Value::from_raw(raw));
        }
        Ok(Record::new(values))
    }

    /// `(first line consumed, record line)` for the record just read into
    /// `buffer`. Blank lines in front of a record are swallowed by the same
    /// read, so every line between the two was empty.
    fn locate_read(&self) -> (u64, u64) {
        let start = self.buffer.position().map_or(self.next_line, |p| p.line());
        let end = self.reader.position();
        let unterminated = end.byte() >= self.file_len && !self.ends_with_newline;
        let newlines = end.line().saturating_sub(start);
        let blanks = if unterminated {
            newlines
        } else {
            newlines.saturating_sub(1)
        };
        (start, start + blanks)
    }

    /// Last physical line of the file, once the reader hit the end.
    fn last_line(&self) -> u64 {
        let end = self.reader.position().line();
        if self.ends_with_newline {
            end.saturating_sub(1)
        } else {
            end
        }
    }

    /// Apply the error policy: `Some(err)` means the stream must stop.
    fn reject(&mut self, err: RowError, skipped: &mut Vec<RowError>) -> Option<PipelineError> {
        match self.options.policy {
            ErrorPolicy::Abort => Some(PipelineError::Row(err)),
            ErrorPolicy::Skip => {
                self.rows_skipped += 1;
                if self.rows_skipped <= WARN_LIMIT {
                    warn!(path = %self.path.display(), "skipping {}", err);
                } else {
                    debug!(path = %self.path.display(), "skipping {}", err);
                }
                skipped.push(err);
                None
            }
        }
    }

    fn next_batch(&mut self) -> Option<Result<RowBatch>> {
        let mut records = Vec::with_capacity(self.options.chunk_rows);
        let mut skipped = Vec::new();

        while records.len() + skipped.len() < self.options.chunk_rows {
            let err = if self.next_line < self.blank_end {
                let line = self.next_line;
                self.next_line += 1;
                Some(RowError {
                    line,
                    kind: RowErrorKind::EmptyLine,
                })
            } else if let Some(line) = self.pending.take() {
                self.next_line = line + 1;
                match self.decode(line) {
                    Ok(record) => {
                        records.push(record);
                        None
                    }
                    Err(row_err) => Some(row_err),
                }
            } else if self.eof {
                self.done = true;
                break;
            } else {
                match self.reader.read_byte_record(&mut self.buffer) {
                    Ok(false) => {
                        self.eof = true;
                        self.blank_end = self.last_line() + 1;
                        continue;
                    }
                    Ok(true) => {
                        let (start, line) = self.locate_read();
                        self.next_line = start;
                        self.blank_end = line;
                        self.pending = Some(line);
                        continue;
                    }
                    Err(err) => match err.into_kind() {
                        csv::ErrorKind::Io(io) => {
                            self.done = true;
                            return Some(Err(PipelineError::file_access(&self.path, io)));
                        }
                        _ => {
                            let line = self.next_line;
                            self.next_line = self.reader.position().line().max(line + 1);
                            self.blank_end = self.next_line;
                            Some(RowError {
                                line,
                                kind: RowErrorKind::Parse,
                            })
                        }
                    },
                }
            };

            self.rows_read += 1;
            if let Some(row_err) = err {
                if let Some(fatal) = self.reject(row_err, &mut skipped) {
                    self.done = true;
                    return Some(Err(fatal));
                }
            }
        }

        if records.is_empty() && skipped.is_empty() {
            return None;
        }

        let mut batch = RowBatch::new(self.batch_index, Arc::clone(&self.columns), records);
        batch.skipped = skipped;
        self.batch_index += 1;
        Some(Ok(batch))
    }
}

/// File length and whether the last byte is a newline.
fn tail_info(file: &mut File) -> io::Result<(u64, bool)> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok((0, false));
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    file.seek(SeekFrom::Start(0))?;
    Ok((len, last[0] == b'\n'))
}

impl Iterator for ChunkedTableReader {
    type Item = Result<RowBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        self.next_batch()
    }
}

impl FusedIterator for ChunkedTableReader {}

/// Open a reader with default options and the given batch size.
pub fn stream<P: AsRef<Path>>(
    path: P,
    plan: &ColumnSelectionPlan,
    chunk_rows: usize,
) -> Result<ChunkedTableReader> {
    ChunkedTableReader::open(
        path,
        plan,
        ReaderOptions {
            chunk_rows,
            ..ReaderOptions::default()
        },
    )
}

/// Map every planned column onto its index in `schema`.
///
/// Positions are trusted when the name still matches; otherwise the column is
/// looked up by name, so a plan stays valid if the file gained columns.
fn locate_planned(schema: &SourceSchema, plan: &ColumnSelectionPlan) -> Result<Vec<usize>> {
    plan.columns()
        .iter()
        .map(|c| {
            if schema.columns().get(c.source_index) == Some(&c.physical) {
                Ok(c.source_index)
            } else {
                schema.index_of(&c.physical).ok_or_else(|| {
                    PipelineError::SchemaMismatch(format!("column `{}` not in header", c.physical))
                })
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{resolve, FieldSpec};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_tsv(lines: &[&str]) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        for l in lines {
            writeln!(tmp, "{}", l).unwrap();
        }
        tmp.flush().unwrap();
        tmp
    }

    fn sex_plan(path: &Path) -> ColumnSelectionPlan {
        let schema = SourceSchema::read_header(path).unwrap();
        resolve(&schema, &[FieldSpec::new("f.31", 1, 1, "Sex")], "f.eid").unwrap()
    }

    #[test]
    fn batches_are_bounded_and_ordered() {
        let mut lines = vec!["f.eid\tf.99.0.0\tf.31.0.0".to_string()];
        for i in 1..=7 {
            lines.push(format!("{}\tjunk\t{}", i, i % 2));
        }
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let tmp = write_tsv(&refs);

        let plan = sex_plan(tmp.path());
        let batches: Vec<RowBatch> = stream(tmp.path(), &plan, 3)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(batches.iter().map(RowBatch::len).collect::<Vec<_>>(), vec![3, 3, 1]);
        assert_eq!(batches[0].columns(), ["ID", "Sex"]);
        assert_eq!(batches[2].index(), 2);
        assert_eq!(batches[2].records()[0].id(), &Value::from("7"));
        // unselected column never reaches the record
        assert_eq!(batches[0].records()[0].values().len(), 2);
    }

    #[test]
    fn skip_policy_counts_and_locates_bad_rows() {
        let tmp = write_tsv(&["f.eid\tf.31.0.0", "1\t0", "2", "3\t1\textra", "4\t1"]);
        let plan = sex_plan(tmp.path());
        let mut reader = stream(tmp.path(), &plan, 10).unwrap();
        let batch = reader.next().unwrap().unwrap();
        assert!(reader.next().is_none());

        assert_eq!(batch.len(), 2);
        assert_eq!(
            batch.skipped(),
            [
                RowError {
                    line: 3,
                    kind: RowErrorKind::FieldCount {
                        expected: 2,
                        found: 1
                    }
                },
                RowError {
                    line: 4,
                    kind: RowErrorKind::FieldCount {
                        expected: 2,
                        found: 3
                    }
                },
            ]
        );
        assert_eq!(reader.rows_read(), 4);
        assert_eq!(reader.rows_skipped(), 2);
    }

    #[test]
    fn abort_policy_stops_at_first_bad_row() {
        let tmp = write_tsv(&["f.eid\tf.31.0.0", "1\t0", "2"]);
        let plan = sex_plan(tmp.path());
        let options = ReaderOptions {
            chunk_rows: 10,
            policy: ErrorPolicy::Abort,
            ..ReaderOptions::default()
        };
        let mut reader = ChunkedTableReader::open(tmp.path(), &plan, options).unwrap();
        match reader.next() {
            Some(Err(PipelineError::Row(e))) => assert_eq!(e.line, 3),
            other => panic!("expected row error, got {:?}", other.map(|r| r.map(|b| b.len()))),
        }
        assert!(reader.next().is_none());
    }

    #[test]
    fn invalid_utf8_is_an_encoding_error() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"f.eid\tf.31.0.0\n1\t\xff\xfe\n2\t1\n").unwrap();
        tmp.flush().unwrap();
        let plan = sex_plan(tmp.path());
        let batch = stream(tmp.path(), &plan, 10).unwrap().next().unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.skipped()[0].kind, RowErrorKind::Encoding);
        assert_eq!(batch.skipped()[0].line, 2);
    }

    #[test]
    fn header_without_planned_column_is_schema_mismatch() {
        let original = write_tsv(&["f.eid\tf.31.0.0", "1\t0"]);
        let plan = sex_plan(original.path());
        let changed = write_tsv(&["f.eid\tf.32.0.0", "1\t0"]);
        let err = stream(changed.path(), &plan, 10).err().unwrap();
        assert!(matches!(err, PipelineError::SchemaMismatch(_)));
    }

    #[test]
    fn empty_file_is_schema_mismatch() {
        let original = write_tsv(&["f.eid\tf.31.0.0"]);
        let plan = sex_plan(original.path());
        let empty = NamedTempFile::new().unwrap();
        let err = stream(empty.path(), &plan, 10).err().unwrap();
        assert!(matches!(err, PipelineError::SchemaMismatch(_)));
    }

    #[test]
    fn missing_file_is_file_access() {
        let original = write_tsv(&["f.eid\tf.31.0.0"]);
        let plan = sex_plan(original.path());
        let err = stream("/no/such/file.tab", &plan, 10).err().unwrap();
        assert!(matches!(err, PipelineError::FileAccess { .. }));
    }

    #[test]
    fn zero_chunk_rows_is_configuration_error() {
        let tmp = write_tsv(&["f.eid\tf.31.0.0"]);
        let plan = sex_plan(tmp.path());
        assert!(matches!(
            stream(tmp.path(), &plan, 0).err().unwrap(),
            PipelineError::Configuration(_)
        ));
    }

    #[test]
    fn header_only_file_yields_nothing() {
        let tmp = write_tsv(&["f.eid\tf.31.0.0"]);
        let plan = sex_plan(tmp.path());
        assert_eq!(stream(tmp.path(), &plan, 10).unwrap().count(), 0);
    }

    #[test]
    fn blank_lines_are_counted_with_their_line_numbers() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"f.eid\tf.31.0.0\n1\t0\n\n3\t1\n\n\n").unwrap();
        tmp.flush().unwrap();
        let plan = sex_plan(tmp.path());
        let mut reader = stream(tmp.path(), &plan, 10).unwrap();
        let batch = reader.next().unwrap().unwrap();
        assert!(reader.next().is_none());

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records()[1].id(), &Value::from("3"));
        let lines: Vec<u64> = batch.skipped().iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![3, 5, 6]);
        assert!(batch
            .skipped()
            .iter()
            .all(|e| e.kind == RowErrorKind::EmptyLine));
        assert_eq!(reader.rows_read(), 5);
        assert_eq!(reader.rows_skipped(), 3);
    }

    #[test]
    fn later_rows_keep_true_line_numbers_after_blanks() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"f.eid\tf.31.0.0\n\n\n4\n5\t1").unwrap();
        tmp.flush().unwrap();
        let plan = sex_plan(tmp.path());
        let batch = stream(tmp.path(), &plan, 10).unwrap().next().unwrap().unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.records()[0].id(), &Value::from("5"));
        let located: Vec<(u64, &str)> = batch
            .skipped()
            .iter()
            .map(|e| (e.line, e.kind.label()))
            .collect();
        assert_eq!(
            located,
            vec![(2, "empty_line"), (3, "empty_line"), (4, "field_count")]
        );
    }

    #[test]
    fn abort_policy_stops_at_blank_line() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"f.eid\tf.31.0.0\n1\t0\n\n2\t1\n").unwrap();
        tmp.flush().unwrap();
        let plan = sex_plan(tmp.path());
        let options = ReaderOptions {
            chunk_rows: 10,
            policy: ErrorPolicy::Abort,
        };
        let mut reader = ChunkedTableReader::open(tmp.path(), &plan, options).unwrap();
        match reader.next() {
            Some(Err(PipelineError::Row(e))) => {
                assert_eq!(e.line, 3);
                assert_eq!(e.kind, RowErrorKind::EmptyLine);
            }
            other => panic!("expected row error, got {:?}", other.map(|r| r.map(|b| b.len()))),
        }
    }

    #[test]
    fn crlf_files_read_like_lf_files() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"f.eid\tf.31.0.0\r\n1\t0\r\n\r\n2\t1\r\n").unwrap();
        tmp.flush().unwrap();
        let plan = sex_plan(tmp.path());
        assert_eq!(plan.columns()[1].physical, "f.31.0.0");
        let batch = stream(tmp.path(), &plan, 10).unwrap().next().unwrap().unwrap();

        let sexes: Vec<String> = batch.records().iter().map(|r| r.values()[1].to_string()).collect();
        assert_eq!(sexes, vec!["0", "1"]);
        assert_eq!(batch.skipped().len(), 1);
        assert_eq!(batch.skipped()[0].line, 3);
        assert_eq!(batch.skipped()[0].kind, RowErrorKind::EmptyLine);
    }

    #[test]
    fn runs_of_bad_rows_do_not_grow_a_batch() {
        let mut lines = vec!["f.eid\tf.31.0.0".to_string()];
        for i in 0..25 {
            lines.push(format!("{} 0", i));
        }
        lines.push("99\t1".to_string());
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let tmp = write_tsv(&refs);

        let plan = sex_plan(tmp.path());
        let batches: Vec<RowBatch> = stream(tmp.path(), &plan, 4)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert!(batches.iter().all(|b| b.len() + b.skipped().len() <= 4));
        let skipped: usize = batches.iter().map(|b| b.skipped().len()).sum();
        assert_eq!(skipped, 25);
        assert_eq!(batches.last().unwrap().records()[0].id(), &Value::from("99"));
    }

    #[test]
    fn identifiers_pass_through_verbatim() {
        let tmp = write_tsv(&["f.eid\tf.31.0.0", "0042\t1.50", "12345678901234567890\t1e3"]);
        let plan = sex_plan(tmp.path());
        let batch = stream(tmp.path(), &plan, 10).unwrap().next().unwrap().unwrap();
        let cells: Vec<Vec<String>> = batch
            .records()
            .iter()
            .map(|r| r.values().iter().map(Value::to_string).collect())
            .collect();
        assert_eq!(
            cells,
            vec![vec!["0042", "1.50"], vec!["12345678901234567890", "1e3"]]
        );
    }
}
