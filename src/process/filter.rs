// src/process/filter.rs

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

use super::reader::Record;
use super::value::{normalize_code, Code, CodeLiteral, MissingMarkers};
use crate::error::{PipelineError, Result};

/// A field plus the codes that put a row in the population.
///
/// `field` is an output label; it covers the bare column and every
/// `<field>_inst<k>` column, and matches if any of them holds an allowed code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AncestryCriterion {
    pub field: String,
    pub codes: Vec<CodeLiteral>,
}

impl AncestryCriterion {
    pub fn new<I, C>(field: &str, codes: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<CodeLiteral>,
    {
        Self {
            field: field.to_string(),
            codes: codes.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledCriterion {
    field: String,
    columns: Vec<usize>,
    codes: HashSet<Code>,
}

impl CompiledCriterion {
    fn matches(&self, record: &Record, markers: &MissingMarkers) -> bool {
        self.columns.iter().any(|&idx| {
            record
                .get(idx)
                .and_then(|v| normalize_code(v, markers))
                .map_or(false, |code| self.codes.contains(&code))
        })
    }
}

/// OR over a list of criteria, bound to the column layout of one stream.
#[derive(Debug, Clone)]
pub struct CategoricalFilter {
    criteria: Vec<CompiledCriterion>,
    markers: MissingMarkers,
}

impl CategoricalFilter {
    /// Bind `criteria` to `columns` (output names, as produced by the plan).
    ///
    /// A criterion whose field has no column is kept but can never match.
    pub fn new(
        columns: &[String],
        criteria: &[AncestryCriterion],
        markers: MissingMarkers,
    ) -> Result<Self> {
        if criteria.is_empty() {
            return Err(PipelineError::Configuration(
                "filter needs at least one criterion".into(),
            ));
        }

        let mut compiled = Vec::with_capacity(criteria.len());
        for criterion in criteria {
            let codes: HashSet<Code> = criterion
                .codes
                .iter()
                .filter_map(|c| c.to_code(&markers))
                .collect();
            if codes.is_empty() {
                return Err(PipelineError::Configuration(format!(
                    "criterion on `{}` has no usable codes",
                    criterion.field
                )));
            }

            let cols = field_columns(columns, &criterion.field);
            if cols.is_empty() {
                warn!(field = %criterion.field, "no column for criterion, it will never match");
            } else {
                debug!(field = %criterion.field, columns = cols.len(), "criterion bound");
            }
            compiled.push(CompiledCriterion {
                field: criterion.field.clone(),
                columns: cols,
                codes,
            });
        }

        Ok(Self {
            criteria: compiled,
            markers,
        })
    }

    /// True as soon as one criterion matches.
    pub fn matches(&self, record: &Record) -> bool {
        self.criteria
            .iter()
            .any(|c| c.matches(record, &self.markers))
    }

    /// Evaluate every criterion, bumping `hits[i]` for each one that matches.
    /// Returns the same answer as `matches`.
    pub fn tally(&self, record: &Record, hits: &mut [u64]) -> bool {
        let mut any = false;
        for (criterion, hit) in self.criteria.iter().zip(hits.iter_mut()) {
            if criterion.matches(record, &self.markers) {
                *hit += 1;
                any = true;
            }
        }
        any
    }

    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn fields(&self) -> Vec<&str> {
        self.criteria.iter().map(|c| c.field.as_str()).collect()
    }

    /// Every column index a criterion reads, in criterion order.
    pub fn watched_columns(&self) -> Vec<usize> {
        let mut out = Vec::new();
        for c in &self.criteria {
            for &idx in &c.columns {
                if !out.contains(&idx) {
                    out.push(idx);
                }
            }
        }
        out
    }

    pub fn markers(&self) -> &MissingMarkers {
        &self.markers
    }
}

/// Columns named `field` or `field_inst<k>`.
fn field_columns(columns: &[String], field: &str) -> Vec<usize> {
    let inst_prefix = format!("{}_inst", field);
    columns
        .iter()
        .enumerate()
        .filter(|(_, name)| {
            name.as_str() == field
                || name
                    .strip_prefix(&inst_prefix)
                    .map_or(false, |k| !k.is_empty() && k.chars().all(|c| c.is_ascii_digit()))
        })
        .map(|(idx, _)| idx)
        .collect()
}
