// src/bin/inspect_header.rs
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use ukb_extract::{
    schema::{ColumnResolver, SourceSchema},
    PipelineConfig,
};

#[derive(Parser)]
#[command(name = "inspect-header")]
#[command(about = "Show a table's header and which configured fields it carries")]
struct Args {
    /// Input table (tab-separated, header first)
    input: PathBuf,

    /// Identifier column
    #[arg(long, default_value = "f.eid")]
    id_column: String,

    /// YAML config to take the field list from
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How many leading columns to print
    #[arg(short = 'n', long, default_value_t = 10)]
    first: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter("info,ukb_extract=info,inspect_header=info")
        .init();

    let cfg = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::extract_defaults(),
    };

    let schema = SourceSchema::read_header(&args.input)
        .with_context(|| format!("reading header of {}", args.input.display()))?;
    info!("{} has {} columns", args.input.display(), schema.len());
    for (i, col) in schema.columns().iter().take(args.first).enumerate() {
        info!("  [{:>3}] {}", i, col);
    }

    let plan = ColumnResolver::new(&args.id_column)
        .with_id_label(&cfg.id_label)
        .resolve(&schema, &cfg.fields)
        .context("resolving configured fields")?;
    for m in plan.spec_matches() {
        if m.columns == 0 {
            warn!("{:<20} not found", m.label);
        } else {
            info!("{:<20} {} column(s)", m.label, m.columns);
        }
        if m.ignored > 0 {
            warn!("{:<20} {} column(s) beyond the declared shape ignored", m.label, m.ignored);
        }
    }
    info!(
        "{} of {} columns would be extracted",
        plan.columns().len(),
        schema.len()
    );
    Ok(())
}
