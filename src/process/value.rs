// src/process/value.rs

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tokens and codes that mean "no answer" in the source data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MissingMarkers {
    /// Cell contents (after trimming) read as missing. Empty cells always are.
    pub tokens: Vec<String>,
    /// Negative integer codes (-1 "do not know", -3 "prefer not to answer", ...)
    /// are sentinels and never match a category.
    pub negative_codes: bool,
}

impl Default for MissingMarkers {
    fn default() -> Self {
        Self {
            tokens: vec!["NA".into(), "NaN".into(), "nan".into()],
            negative_codes: true,
        }
    }
}

impl MissingMarkers {
    pub fn is_missing_token(&self, trimmed: &str) -> bool {
        trimmed.is_empty() || self.tokens.iter().any(|t| t == trimmed)
    }
}

/// A single cell, kept exactly as it appears in the source file.
///
/// Cells are never rewritten on the way through: `0042` stays `0042` and
/// `1001.0` stays `1001.0`. Numeric reading happens in `normalize_code`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// Empty cell.
    Missing,
    Text(String),
}

impl Value {
    pub fn from_raw(raw: &str) -> Value {
        if raw.is_empty() {
            Value::Missing
        } else {
            Value::Text(raw.to_string())
        }
    }

    /// Source text of the cell; empty for `Missing`.
    pub fn as_str(&self) -> &str {
        match self {
            Value::Missing => "",
            Value::Text(s) => s,
        }
    }

    /// Empty, or one of the missing `markers` once trimmed.
    pub fn is_missing(&self, markers: &MissingMarkers) -> bool {
        markers.is_missing_token(self.as_str().trim())
    }

    /// Approximate bytes this cell keeps alive, inline part included.
    pub fn resident_bytes(&self) -> usize {
        let inline = std::mem::size_of::<Value>();
        match self {
            Value::Text(s) => inline + s.capacity(),
            Value::Missing => inline,
        }
    }
}

impl From<&str> for Value {
    fn from(raw: &str) -> Self {
        Value::from_raw(raw)
    }
}

impl From<String> for Value {
    fn from(raw: String) -> Self {
        if raw.is_empty() {
            Value::Missing
        } else {
            Value::Text(raw)
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical form of a categorical value, used for set membership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum Code {
    Int(i64),
    Text(String),
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Int(i) => write!(f, "{}", i),
            Code::Text(s) => f.write_str(s),
        }
    }
}

/// Largest magnitude at which every integer is exactly representable in f64.
const F64_EXACT_INT: f64 = 9_007_199_254_740_992.0;

/// Reduce a cell to the code it represents, or `None` for missing/sentinel.
///
/// Integral numbers collapse to integers, so `1001`, ` 1001 `, `1001.0` and
/// `1e3`-style spellings of the same integer all compare equal. Other finite
/// floats use their shortest decimal form.
pub fn normalize_code(value: &Value, markers: &MissingMarkers) -> Option<Code> {
    let trimmed = value.as_str().trim();
    if markers.is_missing_token(trimmed) {
        return None;
    }
    let int = |i: i64| {
        if markers.negative_codes && i < 0 {
            None
        } else {
            Some(Code::Int(i))
        }
    };
    if let Ok(i) = trimmed.parse::<i64>() {
        return int(i);
    }
    match trimmed.parse::<f64>() {
        Ok(x) if x.is_finite() && x.fract() == 0.0 && x.abs() < F64_EXACT_INT => int(x as i64),
        Ok(x) if x.is_finite() => Some(Code::Text(x.to_string())),
        _ => Some(Code::Text(trimmed.to_string())),
    }
}

/// A code as written in configuration: `1001`, `1001.0` or `"1001"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CodeLiteral {
    Int(i64),
    Float(f64),
    Text(String),
}

impl CodeLiteral {
    /// Normalize the literal exactly as a cell holding it would be.
    ///
    /// Negative literals are kept so they can be reported, but they never
    /// match while `negative_codes` is set.
    pub fn to_code(&self, markers: &MissingMarkers) -> Option<Code> {
        let value = match self {
            CodeLiteral::Int(i) => Value::from(i.to_string()),
            CodeLiteral::Float(x) => Value::from(x.to_string()),
            CodeLiteral::Text(s) => Value::from_raw(s),
        };
        let lenient = MissingMarkers {
            negative_codes: false,
            ..markers.clone()
        };
        normalize_code(&value, &lenient)
    }
}

impl From<i64> for CodeLiteral {
    fn from(i: i64) -> Self {
        CodeLiteral::Int(i)
    }
}
