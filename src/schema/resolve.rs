// src/schema/resolve.rs

use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use super::{FieldSpec, SourceSchema};
use crate::error::{PipelineError, Result};

/// Output label given to the identifier column unless overridden.
pub const DEFAULT_ID_LABEL: &str = "ID";

/// One selected physical column and the name it takes in the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedColumn {
    /// Position of the column in the source header.
    pub source_index: usize,
    pub physical: String,
    pub output: String,
}

/// How many physical columns each field spec picked up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpecMatch {
    pub label: String,
    pub columns: usize,
    /// Columns of the field beyond its declared instances or array length.
    pub ignored: usize,
}

/// Which physical columns to read and what to call them.
///
/// The identifier column is always first; the rest follow the field specs in
/// configuration order, then increasing instance, then increasing array index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSelectionPlan {
    columns: Vec<PlannedColumn>,
    source_width: usize,
    matches: Vec<SpecMatch>,
}

impl ColumnSelectionPlan {
    pub fn columns(&self) -> &[PlannedColumn] {
        &self.columns
    }

    pub fn id_column(&self) -> &PlannedColumn {
        &self.columns[0]
    }

    pub fn output_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.output.clone()).collect()
    }

    /// Number of columns in the header the plan was resolved against.
    pub fn source_width(&self) -> usize {
        self.source_width
    }

    pub fn spec_matches(&self) -> &[SpecMatch] {
        &self.matches
    }

    /// Labels of field specs that matched no physical column.
    pub fn unmatched(&self) -> Vec<&str> {
        self.matches
            .iter()
            .filter(|m| m.columns == 0)
            .map(|m| m.label.as_str())
            .collect()
    }

    /// Keep every column under its own name, moving `id_column` to the front.
    ///
    /// Used to re-read a file this crate already extracted.
    pub fn passthrough(schema: &SourceSchema, id_column: &str) -> Result<Self> {
        let id_index = schema.index_of(id_column).ok_or_else(|| {
            PipelineError::SchemaMismatch(format!("identifier column `{}` not in header", id_column))
        })?;

        let mut seen = HashSet::with_capacity(schema.len());
        for name in schema.columns() {
            if !seen.insert(name.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "duplicate column name `{}` in header",
                    name
                )));
            }
        }

        let mut columns = Vec::with_capacity(schema.len());
        let ordered = std::iter::once(id_index).chain((0..schema.len()).filter(|&i| i != id_index));
        for idx in ordered {
            let name = schema.columns()[idx].clone();
            columns.push(PlannedColumn {
                source_index: idx,
                physical: name.clone(),
                output: name,
            });
        }

        Ok(Self {
            columns,
            source_width: schema.len(),
            matches: Vec::new(),
        })
    }
}

/// Resolves field specs against a header with no row I/O.
#[derive(Debug, Clone)]
pub struct ColumnResolver {
    id_column: String,
    id_label: String,
}

impl ColumnResolver {
    pub fn new(id_column: &str) -> Self {
        Self {
            id_column: id_column.to_string(),
            id_label: DEFAULT_ID_LABEL.to_string(),
        }
    }

    pub fn with_id_label(mut self, label: &str) -> Self {
        self.id_label = label.to_string();
        self
    }

    pub fn resolve(&self, schema: &SourceSchema, specs: &[FieldSpec]) -> Result<ColumnSelectionPlan> {
        let id_index = schema.index_of(&self.id_column).ok_or_else(|| {
            PipelineError::SchemaMismatch(format!(
                "identifier column `{}` not in header",
                self.id_column
            ))
        })?;

        let mut columns = vec![PlannedColumn {
            source_index: id_index,
            physical: self.id_column.clone(),
            output: self.id_label.clone(),
        }];
        let mut claimed: HashMap<usize, String> = HashMap::new();
        claimed.insert(id_index, self.id_label.clone());
        let mut outputs: HashSet<String> = HashSet::new();
        outputs.insert(self.id_label.clone());
        let mut matches = Vec::with_capacity(specs.len());

        for spec in specs {
            spec.validate()?;
            let (found, ignored) = match_spec(schema, spec)?;

            if found.is_empty() {
                warn!(field = %spec.field_code(), label = %spec.label, "no columns found");
            } else {
                info!(field = %spec.field_code(), columns = found.len(), "columns found");
            }
            if ignored > 0 {
                warn!(
                    field = %spec.field_code(),
                    ignored,
                    "columns beyond the declared instances/array length ignored"
                );
            }
            matches.push(SpecMatch {
                label: spec.label.clone(),
                columns: found.len(),
                ignored,
            });

            for m in found {
                if let Some(owner) = claimed.get(&m.source_index) {
                    return Err(PipelineError::Configuration(format!(
                        "column `{}` claimed by both `{}` and `{}`",
                        schema.columns()[m.source_index],
                        owner,
                        spec.label
                    )));
                }
                let output = output_name(spec, m.instance, m.array);
                if !outputs.insert(output.clone()) {
                    return Err(PipelineError::Configuration(format!(
                        "duplicate output column `{}`",
                        output
                    )));
                }
                claimed.insert(m.source_index, spec.label.clone());
                columns.push(PlannedColumn {
                    source_index: m.source_index,
                    physical: schema.columns()[m.source_index].clone(),
                    output,
                });
            }
        }

        debug!(selected = columns.len(), total = schema.len(), "column plan resolved");
        Ok(ColumnSelectionPlan {
            columns,
            source_width: schema.len(),
            matches,
        })
    }
}

/// Resolve with the default identifier label.
pub fn resolve(
    schema: &SourceSchema,
    specs: &[FieldSpec],
    id_column: &str,
) -> Result<ColumnSelectionPlan> {
    ColumnResolver::new(id_column).resolve(schema, specs)
}

/// A physical column matched to a spec, with 0-based instance/array offsets.
#[derive(Debug)]
struct SpecColumn {
    source_index: usize,
    instance: u32,
    array: u32,
}

/// Find every `<code>.<instance>.<array>` column for `spec` within its
/// declared shape, ordered by instance then array index. Also returns how
/// many of the field's columns fell outside that shape.
fn match_spec(schema: &SourceSchema, spec: &FieldSpec) -> Result<(Vec<SpecColumn>, usize)> {
    let code = spec.field_code();
    let pattern = format!(r"^{}\.(\d+)\.(\d+)$", regex::escape(code));
    let re = Regex::new(&pattern)
        .map_err(|e| PipelineError::Configuration(format!("bad prefix `{}`: {}", code, e)))?;
    let family = format!("{}.", code);

    let mut found = Vec::new();
    let mut ignored = 0;
    for (idx, name) in schema.columns().iter().enumerate() {
        let caps = match re.captures(name) {
            Some(c) => c,
            None => {
                if name.starts_with(&family) {
                    debug!(column = %name, field = %code, "suffix is not <instance>.<array>, ignored");
                }
                continue;
            }
        };
        let (instance, array) = match (caps[1].parse::<u32>(), caps[2].parse::<u32>()) {
            (Ok(i), Ok(a)) => (i, a),
            _ => {
                return Err(PipelineError::Configuration(format!(
                    "column `{}` has an index too large to resolve",
                    name
                )))
            }
        };

        let inst_range = spec.instance_base..spec.instance_base + spec.instances;
        let arr_range = spec.array_base..spec.array_base + spec.array_length;
        if !inst_range.contains(&instance) || !arr_range.contains(&array) {
            debug!(column = %name, label = %spec.label, "outside declared shape, ignored");
            ignored += 1;
            continue;
        }

        found.push(SpecColumn {
            source_index: idx,
            instance: instance - spec.instance_base,
            array: array - spec.array_base,
        });
    }

    found.sort_by_key(|c| (c.instance, c.array));
    Ok((found, ignored))
}

/// `<label>[<array+1>][_inst<instance+1>]`, with suffixes only for repeated
/// dimensions.
fn output_name(spec: &FieldSpec, instance: u32, array: u32) -> String {
    let mut name = spec.label.clone();
    if spec.array_length > 1 {
        name.push_str(&(array + 1).to_string());
    }
    if spec.instances > 1 {
        name.push_str(&format!("_inst{}", instance + 1));
    }
    name
}
