// src/report/distribution.rs

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::config::codes::CodeBook;
use crate::process::accumulate::RecordObserver;
use crate::process::reader::Record;
use crate::process::value::{normalize_code, Code, MissingMarkers};

/// Distinct codes tracked per column; anything beyond lands in `Other`.
pub const MAX_CATEGORIES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Missing,
    Code(Code),
    Other,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Missing => f.write_str("missing"),
            Category::Code(c) => write!(f, "{}", c),
            Category::Other => f.write_str("other"),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Tally {
    seen: u64,
    kept: u64,
}

/// Value counts of the filter's columns, before and after filtering.
#[derive(Debug, Clone)]
pub struct CategoryDistribution {
    columns: Vec<(usize, String)>,
    counts: Vec<BTreeMap<Category, Tally>>,
    markers: MissingMarkers,
}

impl CategoryDistribution {
    /// Track the columns at `indices` of `names`. Sentinel codes are counted
    /// as themselves so they show up in the breakdown.
    pub fn new(names: &[String], indices: &[usize], markers: &MissingMarkers) -> Self {
        let columns: Vec<(usize, String)> = indices
            .iter()
            .filter_map(|&i| names.get(i).map(|n| (i, n.clone())))
            .collect();
        let counts = vec![BTreeMap::new(); columns.len()];
        Self {
            columns,
            counts,
            markers: MissingMarkers {
                negative_codes: false,
                ..markers.clone()
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Render as serializable rows, attaching descriptions from `book`.
    pub fn columns(&self, book: &CodeBook) -> Vec<ColumnDistribution> {
        self.columns
            .iter()
            .zip(&self.counts)
            .map(|((_, name), counts)| ColumnDistribution {
                column: name.clone(),
                categories: counts
                    .iter()
                    .map(|(cat, t)| CategoryCount {
                        code: cat.to_string(),
                        description: match cat {
                            Category::Code(c) => book.describe(name, c).map(str::to_string),
                            _ => None,
                        },
                        seen: t.seen,
                        kept: t.kept,
                    })
                    .collect(),
            })
            .collect()
    }
}

impl RecordObserver for CategoryDistribution {
    fn observe(&mut self, record: &Record, kept: bool) {
        for ((idx, _), counts) in self.columns.iter().zip(self.counts.iter_mut()) {
            let mut cat = record
                .get(*idx)
                .and_then(|v| normalize_code(v, &self.markers))
                .map_or(Category::Missing, Category::Code);
            if !counts.contains_key(&cat) && counts.len() >= MAX_CATEGORIES {
                cat = Category::Other;
            }
            let tally = counts.entry(cat).or_default();
            tally.seen += 1;
            if kept {
                tally.kept += 1;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryCount {
    pub code: String,
    pub description: Option<String>,
    pub seen: u64,
    pub kept: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDistribution {
    pub column: String,
    pub categories: Vec<CategoryCount>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::codes::UKB_CODE_BOOK;
    use crate::process::value::Value;

    fn names() -> Vec<String> {
        vec!["ID".into(), "Ethnic_backgr_inst1".into()]
    }

    fn rec(v: Value) -> Record {
        Record::new(vec![Value::from("1"), v])
    }

    #[test]
    fn counts_seen_and_kept_per_code() {
        let mut d = CategoryDistribution::new(&names(), &[1], &MissingMarkers::default());
        d.observe(&rec(Value::from("1001")), true);
        d.observe(&rec(Value::from("1001.0")), true);
        d.observe(&rec(Value::from("-3")), false);
        d.observe(&rec(Value::Missing), false);

        let cols = d.columns(&UKB_CODE_BOOK);
        assert_eq!(cols.len(), 1);
        let cats = &cols[0].categories;
        // Missing sorts first, then codes ascending
        assert_eq!(cats[0].code, "missing");
        assert_eq!(cats[1].code, "-3");
        assert_eq!(cats[1].description.as_deref(), Some("Prefer not to answer"));
        assert_eq!((cats[1].seen, cats[1].kept), (1, 0));
        assert_eq!(cats[2].code, "1001");
        assert_eq!((cats[2].seen, cats[2].kept), (2, 2));
    }

    #[test]
    fn distinct_codes_are_capped() {
        let mut d = CategoryDistribution::new(&names(), &[1], &MissingMarkers::default());
        for code in 0..(MAX_CATEGORIES as i64 + 10) {
            d.observe(&rec(Value::from(code.to_string())), false);
        }
        let cats = &d.columns(&CodeBook::default())[0].categories;
        assert_eq!(cats.len(), MAX_CATEGORIES + 1);
        let other = cats.iter().find(|c| c.code == "other").unwrap();
        assert_eq!(other.seen, 10);
    }
}
