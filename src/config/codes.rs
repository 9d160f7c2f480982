// src/config/codes.rs
//
// UK Biobank field table and data-coding descriptions used by default.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::process::filter::AncestryCriterion;
use crate::process::value::{normalize_code, Code, CodeLiteral, MissingMarkers, Value};
use crate::schema::FieldSpec;

/// Demographic and genetic QC fields extracted by default.
pub static UKB_DEMOGRAPHIC_FIELDS: Lazy<Vec<FieldSpec>> = Lazy::new(|| {
    vec![
        FieldSpec::new("f.31.", 1, 1, "Sex"),
        FieldSpec::new("f.21000.", 1, 3, "Ethnic_backgr"),
        FieldSpec::new("f.21003.", 1, 3, "Age_at_Visit"),
        FieldSpec::new("f.22001.", 1, 1, "Genetic_sex"),
        FieldSpec::new("f.22006.", 1, 1, "Gen_ethnic_grp"),
        // principal components are numbered from 1 in the source columns
        FieldSpec::new("f.22009.", 40, 1, "PC").with_array_base(1),
        FieldSpec::new("f.22010.", 1, 1, "Geno_analys_exclns"),
        FieldSpec::new("f.22018.", 1, 1, "Relat_exclns"),
    ]
});

/// White British, Irish or other white background (field 21000), or
/// Caucasian genetic grouping (field 22006).
pub fn european_criteria() -> Vec<AncestryCriterion> {
    vec![
        AncestryCriterion::new("Ethnic_backgr", [1001i64, 1002, 1003]),
        AncestryCriterion::new("Gen_ethnic_grp", [1i64]),
    ]
}

/// Human-readable meanings of codes, per output field label.
///
/// A label also covers its `_inst<k>` columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeBook {
    fields: BTreeMap<String, Vec<(CodeLiteral, String)>>,
}

impl CodeBook {
    pub fn insert(&mut self, field: &str, code: impl Into<CodeLiteral>, meaning: &str) {
        self.fields
            .entry(field.to_string())
            .or_default()
            .push((code.into(), meaning.to_string()));
    }

    /// Meaning of `code` in `column`, if the book has one.
    pub fn describe(&self, column: &str, code: &Code) -> Option<&str> {
        let lenient = MissingMarkers {
            negative_codes: false,
            ..MissingMarkers::default()
        };
        let field = self.field_for(column)?;
        field
            .iter()
            .find(|(lit, _)| lit.to_code(&lenient).as_ref() == Some(code))
            .map(|(_, meaning)| meaning.as_str())
    }

    fn field_for(&self, column: &str) -> Option<&Vec<(CodeLiteral, String)>> {
        if let Some(f) = self.fields.get(column) {
            return Some(f);
        }
        let (base, _) = column.rsplit_once("_inst")?;
        self.fields.get(base)
    }

    /// Describe a raw cell, mostly for log output.
    pub fn describe_value(&self, column: &str, value: &Value) -> Option<&str> {
        let lenient = MissingMarkers {
            negative_codes: false,
            ..MissingMarkers::default()
        };
        normalize_code(value, &lenient).and_then(|c| self.describe(column, &c))
    }
}

/// Data-codings 1001 (ethnic background) and 1002 (genetic grouping).
pub static UKB_CODE_BOOK: Lazy<CodeBook> = Lazy::new(|| {
    let mut book = CodeBook::default();
    for (code, meaning) in [
        (1, "White"),
        (1001, "British"),
        (1002, "Irish"),
        (1003, "Any other white background"),
        (2, "Mixed"),
        (2001, "White and Black Caribbean"),
        (2002, "White and Black African"),
        (2003, "White and Asian"),
        (2004, "Any other mixed background"),
        (3, "Asian or Asian British"),
        (3001, "Indian"),
        (3002, "Pakistani"),
        (3003, "Bangladeshi"),
        (3004, "Any other Asian background"),
        (4, "Black or Black British"),
        (4001, "Caribbean"),
        (4002, "African"),
        (4003, "Any other Black background"),
        (5, "Chinese"),
        (6, "Other ethnic group"),
        (-1, "Do not know"),
        (-3, "Prefer not to answer"),
    ] {
        book.insert("Ethnic_backgr", code as i64, meaning);
    }
    book.insert("Gen_ethnic_grp", 1i64, "Caucasian");
    book
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_fields_match_the_demographic_table() {
        let labels: Vec<&str> = UKB_DEMOGRAPHIC_FIELDS.iter().map(|f| f.label.as_str()).collect();
        assert_eq!(
            labels,
            [
                "Sex",
                "Ethnic_backgr",
                "Age_at_Visit",
                "Genetic_sex",
                "Gen_ethnic_grp",
                "PC",
                "Geno_analys_exclns",
                "Relat_exclns"
            ]
        );
        assert!(UKB_DEMOGRAPHIC_FIELDS.iter().all(|f| f.validate().is_ok()));
    }

    #[test]
    fn instance_columns_share_their_field_codes() {
        let book = &*UKB_CODE_BOOK;
        assert_eq!(book.describe("Ethnic_backgr_inst2", &Code::Int(1002)), Some("Irish"));
        assert_eq!(book.describe("Ethnic_backgr", &Code::Int(-3)), Some("Prefer not to answer"));
        assert_eq!(book.describe("Gen_ethnic_grp", &Code::Int(1)), Some("Caucasian"));
        assert_eq!(book.describe("Sex", &Code::Int(1)), None);
        assert_eq!(book.describe("Ethnic_backgr", &Code::Int(9999)), None);
    }

    #[test]
    fn float_cells_are_described() {
        assert_eq!(
            UKB_CODE_BOOK.describe_value("Ethnic_backgr_inst1", &Value::from("1001.0")),
            Some("British")
        );
    }
}
