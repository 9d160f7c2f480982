// src/config/mod.rs

pub mod codes;

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::error::{PipelineError, Result};
use crate::process::accumulate::{OutputMode, OutputPaths};
use crate::process::filter::AncestryCriterion;
use crate::process::reader::{ErrorPolicy, DEFAULT_CHUNK_ROWS};
use crate::process::value::MissingMarkers;
use crate::schema::resolve::DEFAULT_ID_LABEL;
use crate::schema::FieldSpec;

pub use codes::{european_criteria, CodeBook, UKB_CODE_BOOK, UKB_DEMOGRAPHIC_FIELDS};

/// Rows are kept when they match at least one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub criteria: Vec<AncestryCriterion>,
}

impl FilterConfig {
    pub fn european() -> Self {
        Self {
            criteria: european_criteria(),
        }
    }
}

/// Everything one run needs. Loadable from YAML; unspecified keys keep the
/// values of the preset the file is applied over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub input: PathBuf,
    /// Physical name of the participant identifier column.
    pub id_column: String,
    /// Output name of the identifier column.
    pub id_label: String,
    pub chunk_rows: usize,
    pub error_policy: ErrorPolicy,
    pub output_mode: OutputMode,
    /// Fields to extract. Empty keeps every column under its own name.
    pub fields: Vec<FieldSpec>,
    pub filter: Option<FilterConfig>,
    pub output: OutputPaths,
    pub summary_json: Option<PathBuf>,
    pub missing: MissingMarkers,
    pub code_book: CodeBook,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::extract_defaults()
    }
}

impl PipelineConfig {
    /// Pull the demographic fields out of the full showcase table.
    pub fn extract_defaults() -> Self {
        Self {
            input: PathBuf::from("ukb8045.r.tab"),
            id_column: "f.eid".into(),
            id_label: DEFAULT_ID_LABEL.into(),
            chunk_rows: DEFAULT_CHUNK_ROWS,
            error_policy: ErrorPolicy::Skip,
            output_mode: OutputMode::Streaming,
            fields: UKB_DEMOGRAPHIC_FIELDS.clone(),
            filter: None,
            output: OutputPaths::new("demographic_data.tsv", "demographic_ids.txt"),
            summary_json: None,
            missing: MissingMarkers::default(),
            code_book: UKB_CODE_BOOK.clone(),
        }
    }

    /// Keep the European participants of an already-extracted table.
    pub fn filter_defaults() -> Self {
        Self {
            input: PathBuf::from("demographic_data.tsv"),
            id_column: DEFAULT_ID_LABEL.into(),
            fields: Vec::new(),
            filter: Some(FilterConfig::european()),
            output: OutputPaths::new("european_participants.tsv", "european_participant_ids.txt"),
            ..Self::extract_defaults()
        }
    }

    /// Extract and filter in a single pass over the showcase table.
    pub fn run_defaults() -> Self {
        Self {
            filter: Some(FilterConfig::european()),
            output: OutputPaths::new("european_participants.tsv", "european_participant_ids.txt"),
            ..Self::extract_defaults()
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Self::from_yaml_over(Self::extract_defaults(), text)
    }

    /// Apply the keys present in `text` on top of `base`. Nested mappings
    /// merge key by key; everything else is replaced.
    pub fn from_yaml_over(base: Self, text: &str) -> Result<Self> {
        let invalid = |e: serde_yaml::Error| PipelineError::Configuration(format!("invalid config: {}", e));
        let mut merged = serde_yaml::to_value(&base).map_err(invalid)?;
        let overlay: serde_yaml::Value = serde_yaml::from_str(text).map_err(invalid)?;
        match overlay {
            serde_yaml::Value::Mapping(_) => merge_yaml(&mut merged, overlay),
            // an empty document keeps the base
            serde_yaml::Value::Null => {}
            _ => {
                return Err(PipelineError::Configuration(
                    "invalid config: expected a mapping at the top level".into(),
                ))
            }
        }
        let config: Self = serde_yaml::from_value(merged).map_err(invalid)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_over(Self::extract_defaults(), path)
    }

    pub fn load_over<P: AsRef<Path>>(base: Self, path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| PipelineError::file_access(path, e))?;
        Self::from_yaml_over(base, &text)
    }

    /// Reject configurations that cannot run, before any data is read.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_rows == 0 {
            return Err(PipelineError::Configuration(
                "chunk_rows must be at least 1".into(),
            ));
        }
        if self.id_column.is_empty() || self.id_label.is_empty() {
            return Err(PipelineError::Configuration(
                "identifier column and label must be set".into(),
            ));
        }
        for field in &self.fields {
            field.validate()?;
        }
        if let Some(filter) = &self.filter {
            if filter.criteria.is_empty() {
                return Err(PipelineError::Configuration(
                    "filter needs at least one criterion".into(),
                ));
            }
        }
        if self.output.data == self.output.ids {
            return Err(PipelineError::Configuration(format!(
                "data and id outputs both point at {}",
                self.output.data.display()
            )));
        }
        let outputs = [Some(&self.output.data), Some(&self.output.ids), self.summary_json.as_ref()];
        if outputs.iter().flatten().any(|p| **p == self.input) {
            return Err(PipelineError::Configuration(format!(
                "an output would overwrite the input {}",
                self.input.display()
            )));
        }
        Ok(())
    }
}

fn merge_yaml(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base), serde_yaml::Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_yaml(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
