// src/main.rs
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};
use ukb_extract::{
    config::FilterConfig,
    process::{ErrorPolicy, OutputMode},
    run_pipeline, PipelineConfig,
};

#[derive(Parser)]
#[command(name = "ukb-extract")]
#[command(about = "Extract demographic fields from a UK Biobank table and filter by ancestry")]
struct Cli {
    /// YAML config; its keys are applied over the command's defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull the configured fields out of the full table, keeping every row
    Extract(Overrides),
    /// Keep the European participants of an extracted table
    Filter(Overrides),
    /// Extract and filter in one pass
    Run(Overrides),
}

#[derive(Args)]
struct Overrides {
    /// Input table (tab-separated, header first)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output table path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output identifier list path
    #[arg(long)]
    ids: Option<PathBuf>,

    /// Rows per chunk
    #[arg(long)]
    chunk_rows: Option<usize>,

    /// Abort on the first malformed row instead of skipping it
    #[arg(long)]
    strict: bool,

    /// Hold kept rows in memory and write once at the end
    #[arg(long)]
    buffered: bool,

    /// Also write the run summary as JSON
    #[arg(long)]
    summary_json: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, mut cfg: PipelineConfig) -> PipelineConfig {
        if let Some(input) = self.input {
            cfg.input = input;
        }
        if let Some(data) = self.output {
            cfg.output.data = data;
        }
        if let Some(ids) = self.ids {
            cfg.output.ids = ids;
        }
        if let Some(n) = self.chunk_rows {
            cfg.chunk_rows = n;
        }
        if self.strict {
            cfg.error_policy = ErrorPolicy::Abort;
        }
        if self.buffered {
            cfg.output_mode = OutputMode::Buffered;
        }
        if self.summary_json.is_some() {
            cfg.summary_json = self.summary_json;
        }
        cfg
    }
}

fn preset_with_file(preset: PipelineConfig, file: Option<&PathBuf>) -> Result<PipelineConfig> {
    match file {
        Some(path) => PipelineConfig::load_over(preset, path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(preset),
    }
}

fn build_config(cli: Cli) -> Result<PipelineConfig> {
    let file = cli.config.as_ref();
    let cfg = match cli.command {
        Command::Extract(o) => {
            let mut cfg = preset_with_file(PipelineConfig::extract_defaults(), file)?;
            cfg.filter = None;
            o.apply(cfg)
        }
        Command::Filter(o) => {
            let mut cfg = preset_with_file(PipelineConfig::filter_defaults(), file)?;
            // the extracted table already carries output names
            cfg.fields.clear();
            cfg.id_column = cfg.id_label.clone();
            cfg.filter.get_or_insert_with(FilterConfig::european);
            o.apply(cfg)
        }
        Command::Run(o) => {
            let mut cfg = preset_with_file(PipelineConfig::run_defaults(), file)?;
            cfg.filter.get_or_insert_with(FilterConfig::european);
            o.apply(cfg)
        }
    };
    cfg.validate().context("invalid configuration")?;
    Ok(cfg)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // ─── 1) init logging ─────────────────────────────────────────────
    let default_level = if cli.verbose {
        "debug,ukb_extract=debug"
    } else {
        "info,ukb_extract=info"
    };
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();
    info!("startup");

    // ─── 2) resolve config ───────────────────────────────────────────
    let cfg = build_config(cli)?;
    info!(
        input = %cfg.input.display(),
        chunk_rows = cfg.chunk_rows,
        filter = cfg.filter.is_some(),
        "configured"
    );

    // ─── 3) run ──────────────────────────────────────────────────────
    let outcome = match run_pipeline(cfg) {
        Ok(o) => o,
        Err(e) => {
            error!("run failed: {}", e);
            return Err(e).context("pipeline failed");
        }
    };

    println!("{}", outcome.summary);
    println!("data → {}", outcome.outputs.data.display());
    println!("ids  → {}", outcome.outputs.ids.display());
    Ok(())
}
