// src/schema/types.rs

use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use crate::error::{PipelineError, Result};

/// The physical column names of a source file, in header order.
///
/// Only the header line is ever read to build this; row data stays on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSchema {
    columns: Vec<String>,
}

impl SourceSchema {
    /// Build a schema from already-split header names.
    ///
    /// Fails with `SchemaMismatch` when there are no columns at all.
    pub fn from_columns(columns: Vec<String>) -> Result<Self> {
        if columns.is_empty() || columns.iter().all(|c| c.is_empty()) {
            return Err(PipelineError::SchemaMismatch("header is empty".into()));
        }
        Ok(Self { columns })
    }

    /// Parse a tab-separated header line (trailing `\r\n` tolerated).
    pub fn parse_header(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            return Err(PipelineError::SchemaMismatch("header is empty".into()));
        }
        Self::from_columns(line.split('\t').map(str::to_string).collect())
    }

    /// Read just the first line of `path`.
    pub fn read_header<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| PipelineError::file_access(path, e))?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .map_err(|e| PipelineError::file_access(path, e))?;
        Self::parse_header(&line)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// One field to extract: a field-code prefix and the shape of its
/// instance/array repetitions in the source file.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Eq, Hash)]
pub struct FieldSpec {
    /// Field code prefix, e.g. `f.21000`. A trailing `.` is ignored.
    pub prefix: String,
    /// Number of array entries per instance.
    pub array_length: u32,
    /// Number of instances (visits).
    pub instances: u32,
    /// Output label.
    pub label: String,
    /// First instance index as written in physical column names.
    #[serde(default)]
    pub instance_base: u32,
    /// First array index as written in physical column names.
    #[serde(default)]
    pub array_base: u32,
}

impl FieldSpec {
    pub fn new(prefix: &str, array_length: u32, instances: u32, label: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            array_length,
            instances,
            label: label.to_string(),
            instance_base: 0,
            array_base: 0,
        }
    }

    pub fn with_array_base(mut self, base: u32) -> Self {
        self.array_base = base;
        self
    }

    pub fn with_instance_base(mut self, base: u32) -> Self {
        self.instance_base = base;
        self
    }

    /// The prefix without any trailing separator.
    pub fn field_code(&self) -> &str {
        self.prefix.trim_end_matches('.')
    }

    pub fn validate(&self) -> Result<()> {
        if self.field_code().is_empty() {
            return Err(PipelineError::Configuration(format!(
                "field spec `{}` has an empty prefix",
                self.label
            )));
        }
        if self.label.trim().is_empty() {
            return Err(PipelineError::Configuration(format!(
                "field spec `{}` has an empty label",
                self.prefix
            )));
        }
        if self.array_length == 0 || self.instances == 0 {
            return Err(PipelineError::Configuration(format!(
                "field spec `{}` must declare at least one instance and one array entry \
                 (instances={}, array_length={})",
                self.prefix, self.instances, self.array_length
            )));
        }
        Ok(())
    }
}
