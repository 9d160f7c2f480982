pub mod resolve;
pub mod types;

pub use resolve::{resolve, ColumnResolver, ColumnSelectionPlan, PlannedColumn, SpecMatch};
pub use types::{FieldSpec, SourceSchema};
