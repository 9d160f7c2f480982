// src/process/mod.rs

pub mod accumulate;
pub mod filter;
pub mod pipeline;
pub mod reader;
pub mod value;

pub use accumulate::{
    BatchOutcome, OutputDataset, OutputMode, OutputPaths, RecordObserver, StreamAccumulator,
};
pub use filter::{AncestryCriterion, CategoricalFilter};
pub use pipeline::{run_pipeline, Pipeline, RunOutcome};
pub use reader::{stream, ChunkedTableReader, ErrorPolicy, Record, ReaderOptions, RowBatch};
pub use value::{normalize_code, Code, CodeLiteral, MissingMarkers, Value};
