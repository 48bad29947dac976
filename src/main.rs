//! Avani CLI - tiled raster stack processing.
//!
//! Each pipeline stage is a subcommand, so a run can be driven end to end
//! with `workflow` or stage by stage across separate invocations.

use anyhow::{Context, Result};
use avani::config::PipelineConfig;
use avani::pipeline::Pipeline;
use avani::stages::StageId;
use clap::{Args, Parser, Subcommand};
use env_logger::{Builder, Env};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "avani")]
#[command(about = "Displacement rate estimation over tiled interferogram stacks", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert the input stack into per-tile artifacts
    Conv2tif(StageArgs),
    /// Scale converted tiles to displacement and smooth them
    Prepifg(StageArgs),
    /// Estimate per-pixel displacement rates
    Process(StageArgs),
    /// Assemble full-extent rate products from tile artifacts
    Merge(StageArgs),
    /// Run every stage in order
    Workflow(StageArgs),
}

impl Command {
    fn stage(&self) -> Option<StageId> {
        match self {
            Command::Conv2tif(_) => Some(StageId::Convert),
            Command::Prepifg(_) => Some(StageId::Prepare),
            Command::Process(_) => Some(StageId::Process),
            Command::Merge(_) => Some(StageId::Merge),
            Command::Workflow(_) => None,
        }
    }

    fn args(&self) -> &StageArgs {
        match self {
            Command::Conv2tif(args)
            | Command::Prepifg(args)
            | Command::Process(args)
            | Command::Merge(args)
            | Command::Workflow(args) => args,
        }
    }
}

#[derive(Args)]
struct StageArgs {
    /// Pipeline configuration file
    #[arg(short = 'f', long = "config")]
    config: PathBuf,

    /// Override the number of tile rows
    #[arg(short = 'r', long)]
    rows: Option<usize>,

    /// Override the number of tile columns
    #[arg(short = 'c', long)]
    cols: Option<usize>,

    /// Override the worker thread count (0 = one per core)
    #[arg(long)]
    workers: Option<usize>,
}

fn main() {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    builder.init();

    let cli = Cli::parse();
    if let Err(error) = run(cli) {
        log::error!("{error:#}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let args = cli.command.args();
    let mut config = PipelineConfig::load(&args.config)?;
    config.apply_grid_override(args.rows, args.cols);
    if let Some(workers) = args.workers {
        config.execution.workers = workers;
    }

    // One flag serves the signal handler and every stage run.
    let cancel = Arc::new(AtomicBool::new(false));
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || {
        log::warn!("interrupt received, finishing tiles in flight");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("install interrupt handler")?;

    let pipeline = Pipeline::new(config)?.with_cancel_flag(cancel);
    match cli.command.stage() {
        Some(id) => pipeline.run_stage(id)?,
        None => pipeline.run_all()?,
    }
    Ok(())
}
