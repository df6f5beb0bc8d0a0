use anyhow::Result;
use clap::Parser;
use logstat::jobs::session_length::session_length_pipeline;
use logstat::{JobArgs, JobConfig};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Histogram of session lengths per appkey, via per-session durations.
#[derive(Parser, Debug)]
struct Args {
    /// Run mode: hour, day, week or month
    #[arg(long, default_value = "day")]
    mode: String,
    /// Period to report on, in the mode's format; defaults to the previous period
    #[arg(long)]
    target_date: Option<String>,
    /// Input file or directory (repeatable)
    #[arg(long, required = true)]
    input: Vec<PathBuf>,
    /// Directory for the per-session durations read by the second stage
    #[arg(long)]
    tmp: PathBuf,
    /// Output directory
    #[arg(long)]
    output: PathBuf,
    /// Reduce tasks; 0 uses one per CPU
    #[arg(long, default_value_t = 0)]
    num_reducers: usize,
    /// Log every skipped input line
    #[arg(long)]
    verbose: bool,
    /// Count input lines per validation level
    #[arg(long)]
    counter: bool,
    /// Separator between fields of the key and value columns
    #[arg(long)]
    separator: Option<String>,
    /// Place keys with the historical partition hash
    #[arg(long)]
    legacy_partitioner: bool,
    /// Keep spill and sort files after the run
    #[arg(long)]
    keep_intermediates: bool,
    /// Write the run report as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,
}

fn run(args: Args) -> Result<()> {
    let report_path = args.report.clone();
    let intermediate = args.tmp.clone();
    let config = JobConfig::from_cli(JobArgs {
        mode: args.mode,
        target_date: args.target_date,
        inputs: args.input,
        output: args.output,
        num_reducers: args.num_reducers,
        verbose: args.verbose,
        counter: args.counter,
        separator: args.separator,
        legacy_partitioner: args.legacy_partitioner,
        keep_intermediates: args.keep_intermediates,
    })?;
    info!(
        mode = %config.mode,
        period = %config.target.label,
        num_reducers = config.runtime.num_reducers,
        intermediate = %intermediate.display(),
        "Session length statistic starting"
    );

    let pipeline = session_length_pipeline(config.input(), intermediate, &config.output, config.stage_env());
    info!(pipeline = pipeline.name(), stages = ?pipeline.stage_names(), "Pipeline planned");
    let report = pipeline.run()?;
    if let Some(path) = report_path {
        report.write_json(&path)?;
    }
    info!(period = %config.target.label, wall_ms = report.wall_ms, "Session length statistic complete");
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();
    if let Err(e) = run(args) {
        error!("session length statistic failed: {:#}", e);
        std::process::exit(1);
    }
}
