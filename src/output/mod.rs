//! Atomic artifact writers.
//!
//! Every artifact is written into a temporary file next to its destination and
//! renamed over it on `finish()`. A writer dropped before `finish()` removes
//! its temporary file, so an interrupted run never leaves a truncated output
//! under the final name.

use csv::{QuoteStyle, WriterBuilder};
use std::{
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::process::reader::Record;

/// Create the temporary sibling of `final_path`.
fn temp_beside(final_path: &Path) -> Result<NamedTempFile> {
    let parent = match final_path.parent() {
        Some(p) if p.as_os_str().is_empty() => Path::new("."),
        Some(p) => p,
        None => {
            return Err(PipelineError::output(
                final_path,
                "cannot determine parent directory",
            ))
        }
    };
    fs::create_dir_all(parent).map_err(|e| PipelineError::output(final_path, e))?;
    NamedTempFile::new_in(parent)
        .map_err(|e| PipelineError::output(final_path, format!("creating temporary file: {}", e)))
}

fn persist(temp: NamedTempFile, final_path: &Path) -> Result<()> {
    temp.persist(final_path)
        .map_err(|e| PipelineError::output(final_path, format!("persisting: {}", e.error)))?;
    Ok(())
}

/// Tab-separated writer for the kept-record dataset.
pub struct AtomicTsvWriter {
    writer: csv::Writer<BufWriter<NamedTempFile>>,
    final_path: PathBuf,
    rows: u64,
}

impl AtomicTsvWriter {
    pub fn new(final_path: impl AsRef<Path>) -> Result<Self> {
        let final_path = final_path.as_ref().to_path_buf();
        let temp = temp_beside(&final_path)?;
        let writer = WriterBuilder::new()
            .delimiter(b'\t')
            .quote_style(QuoteStyle::Never)
            .from_writer(BufWriter::new(temp));
        Ok(Self {
            writer,
            final_path,
            rows: 0,
        })
    }

    pub fn write_header(&mut self, columns: &[String]) -> Result<()> {
        self.writer
            .write_record(columns)
            .map_err(|e| PipelineError::output(&self.final_path, e))
    }

    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        self.writer
            .write_record(record.values().iter().map(|v| v.to_string()))
            .map_err(|e| PipelineError::output(&self.final_path, e))?;
        self.rows += 1;
        Ok(())
    }

    /// Data rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Flush and move the file into place.
    pub fn finish(self) -> Result<PathBuf> {
        let buf = self
            .writer
            .into_inner()
            .map_err(|e| PipelineError::output(&self.final_path, e.error()))?;
        let temp = buf
            .into_inner()
            .map_err(|e| PipelineError::output(&self.final_path, e.error()))?;
        persist(temp, &self.final_path)?;
        debug!(path = %self.final_path.display(), rows = self.rows, "persisted tsv");
        Ok(self.final_path)
    }
}

/// Newline-delimited writer, used for the identifier list.
pub struct AtomicLineWriter {
    writer: BufWriter<NamedTempFile>,
    final_path: PathBuf,
    lines: u64,
}

impl AtomicLineWriter {
    pub fn new(final_path: impl AsRef<Path>) -> Result<Self> {
        let final_path = final_path.as_ref().to_path_buf();
        let temp = temp_beside(&final_path)?;
        Ok(Self {
            writer: BufWriter::new(temp),
            final_path,
            lines: 0,
        })
    }

    pub fn write_line(&mut self, line: &str) -> Result<()> {
        writeln!(self.writer, "{}", line).map_err(|e| PipelineError::output(&self.final_path, e))?;
        self.lines += 1;
        Ok(())
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn finish(self) -> Result<PathBuf> {
        let temp = self
            .writer
            .into_inner()
            .map_err(|e| PipelineError::output(&self.final_path, e.error()))?;
        persist(temp, &self.final_path)?;
        debug!(path = %self.final_path.display(), lines = self.lines, "persisted line file");
        Ok(self.final_path)
    }
}

/// Size of `path` in MB, or 0.0 when it cannot be stat'ed.
pub fn file_size_mb(path: &Path) -> f64 {
    fs::metadata(path)
        .map(|m| m.len() as f64 / (1024.0 * 1024.0))
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::value::Value;
    use tempfile::TempDir;

    #[test]
    fn tsv_is_persisted_on_finish() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tsv");
        let mut w = AtomicTsvWriter::new(&path).unwrap();
        w.write_header(&["ID".to_string(), "Sex".to_string()]).unwrap();
        w.write_record(&Record::new(vec![Value::from("1"), Value::Missing]))
            .unwrap();
        w.write_record(&Record::new(vec![Value::from("0002"), Value::from("0.50")]))
            .unwrap();
        assert_eq!(w.rows(), 2);
        w.finish().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "ID\tSex\n1\t\n0002\t0.50\n");
    }

    #[test]
    fn dropped_writer_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ids.txt");
        {
            let mut w = AtomicLineWriter::new(&path).unwrap();
            w.write_line("1").unwrap();
        }
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn finish_replaces_previous_output() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ids.txt");
        fs::write(&path, "stale\n").unwrap();
        let mut w = AtomicLineWriter::new(&path).unwrap();
        w.write_line("1").unwrap();
        w.write_line("3").unwrap();
        w.finish().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1\n3\n");
    }

    #[test]
    fn missing_parent_directories_are_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/ids.txt");
        let w = AtomicLineWriter::new(&path).unwrap();
        w.finish().unwrap();
        assert!(path.exists());
        assert_eq!(file_size_mb(&path), 0.0);
    }
}
