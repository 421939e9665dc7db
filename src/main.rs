//! PUMA-Z command line: aligns the PET/CT pairs of several tracers of one subject onto a
//! reference tracer, and optionally multiplexes them into an RGB composite.
//!
//! Input data is standardized to NIfTI, filtered for compliant tracers, staged into a timestamped
//! workspace and registered with greedy. Per-tracer outcomes are written as CSV/JSON reports.
mod classifier;
mod command;
mod compliance;
mod config;
mod converter;
mod dicom_lookup;
mod download;
mod error;
mod export;
mod modality;
mod multiplex;
mod pipeline;
mod registration;
mod report;
mod resources;
mod segmentation;
mod standardize;
mod volume;
mod workspace;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use colored::*;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use crate::compliance::select_compliant;
use crate::config::{load_runtime_config, EffectiveConfig, RuntimeConfigFile, DEFAULT_CONFIG_PATH};
use crate::converter::ConversionEngine;
use crate::multiplex::{parse_channel_map, ChannelSelection};
use crate::pipeline::{RunOptions, RunStatus};
use crate::resources::{Platform, ResourceResolver};
use crate::segmentation::parse_regions;
use crate::standardize::standardize;
use crate::workspace::{discover_tracer_dirs, file_name};

#[derive(Parser)]
#[command(name = "pumaz")]
#[command(about = "PET Universal Multi-tracer Aligner (PUMA-Z)", long_about = None)]
/// Entry CLI that dispatches to subcommands.
struct Cli {
    /// Optional runtime config in TOML that supplies defaults for the CLI.
    #[arg(short, long, help = "TOML config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Standardize, filter, preprocess and align every tracer of a subject
    Run(RunArgs),
    /// Convert the non-NIfTI entries of every tracer directory to NIfTI
    Standardize(SubjectArgs),
    /// Report which tracer directories hold exactly one image per required modality
    Check(SubjectArgs),
    /// Download the greedy registration binaries for this machine
    Fetch(SharedArgs),
}

#[derive(Args, Clone)]
struct SharedArgs {
    /// Directory holding the platform binaries (defaults to `bin/` next to the executable).
    #[arg(long, value_name = "DIR")]
    binary_dir: Option<PathBuf>,

    /// Directory that receives the run log.
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct SubjectArgs {
    /// Subject directory with one sub-directory per tracer.
    #[arg(short = 'd', long = "subject-directory", value_name = "DIR")]
    subject: PathBuf,

    #[command(flatten)]
    shared: SharedArgs,
}

#[derive(Args, Clone)]
struct RunArgs {
    #[command(flatten)]
    subject: SubjectArgs,

    /// Body regions left out of the registration mask: legs, head, arms (comma separated) or none.
    #[arg(short = 'r', long = "ignore-regions", default_value = "none")]
    regions: String,

    /// Build an RGB composite of the aligned PET images.
    #[arg(short, long)]
    multiplex: bool,

    /// Explicit channel map, e.g. `FDG:R,PSMA:G`.
    #[arg(long, requires = "multiplex", conflicts_with = "interactive")]
    channels: Option<String>,

    /// Ask for the tracer of each channel on the terminal.
    #[arg(long, requires = "multiplex")]
    interactive: bool,

    /// Export aligned PET images (and the composite) as DICOM series.
    #[arg(long)]
    export_dicom: bool,

    /// Reference tracer; overrides the configured one.
    #[arg(long)]
    reference: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let cfg_path = args.config.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    match args.command {
        Commands::Run(cmd) => run_pipeline(cmd, &cfg_path).await,
        Commands::Standardize(cmd) => run_standardize(cmd, &cfg_path).await,
        Commands::Check(cmd) => run_check(cmd, &cfg_path),
        Commands::Fetch(cmd) => run_fetch(cmd, &cfg_path).await,
    }
}

/// Merge CLI overrides with a parsed runtime config, falling back to crate defaults.
///
/// CLI flags take precedence, followed by the runtime file, and finally `EffectiveConfig::defaults()`.
fn merge_config(cli: &SharedArgs, file: Option<RuntimeConfigFile>) -> Result<EffectiveConfig> {
    let mut cfg = EffectiveConfig::from_runtime(file)?;

    cfg.binary_dir = cli.binary_dir.clone().unwrap_or(cfg.binary_dir);
    cfg.log_dir = cli.log_dir.clone().unwrap_or(cfg.log_dir);

    Ok(cfg)
}

fn load_config(cli: &SharedArgs, cfg_path: &Path) -> Result<EffectiveConfig> {
    let runtime_file = load_runtime_config(Some(&cfg_path.to_path_buf()))?;
    merge_config(cli, runtime_file)
}

/// Sends `tracing` records to `{log_dir}/pumaz-{HH-MM-dd-mm-YYYY}.log`. `RUST_LOG` overrides
/// the default `info` level.
fn init_logging(log_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let path = log_dir.join(format!("pumaz-{}.log", Local::now().format("%H-%M-%d-%m-%Y")));
    let file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(path)
}

fn banner(log_path: &Path) {
    println!("{}", "PUMA-Z | PET Universal Multi-tracer Aligner".cyan().bold());
    println!("  Log: {}", log_path.display());
    tracing::info!("PUMA-Z started; log at {}", log_path.display());
}

fn conversion_engine(cfg: &EffectiveConfig) -> ConversionEngine {
    let engine = ConversionEngine::new(cfg.converter.clone());
    if !engine.is_available() {
        println!(
            "{} Conversion engine '{}' not found; DICOM directories will fail to convert",
            "!".yellow(),
            engine.name()
        );
        tracing::warn!("Conversion engine {} is not available", engine.name());
    }
    engine
}

async fn run_pipeline(args: RunArgs, cfg_path: &Path) -> Result<()> {
    let effective = load_config(&args.subject.shared, cfg_path)?;
    let log_path = init_logging(&effective.log_dir)?;
    banner(&log_path);

    let ignored_regions = parse_regions(&args.regions)?;
    let multiplex = if !args.multiplex {
        None
    } else if let Some(map) = &args.channels {
        Some(ChannelSelection::Explicit(parse_channel_map(map)?))
    } else if args.interactive {
        Some(ChannelSelection::Interactive)
    } else {
        Some(ChannelSelection::OrderBased)
    };

    conversion_engine(&effective);
    let options = RunOptions {
        subject_dir: args.subject.subject.clone(),
        ignored_regions,
        multiplex,
        export_dicom: args.export_dicom,
        reference: args.reference.clone(),
    };

    let outcome = match pipeline::run(&effective, &options).await {
        Ok(outcome) => outcome,
        Err(e) => {
            println!("{} {:#}", "✗".red(), e);
            tracing::error!("Run failed: {:#}", e);
            return Err(e);
        }
    };

    match outcome.status {
        RunStatus::Complete => println!("{} All tracers aligned", "✓".green()),
        RunStatus::Partial => println!("{} Some tracers failed; see the run report", "!".yellow()),
        RunStatus::Empty => println!("{} Nothing to align", "!".yellow()),
    }
    if let Some(ws) = &outcome.workspace {
        println!("  Outputs: {}", ws.display());
    }
    if let Some(composite) = &outcome.composite {
        println!("  Composite: {}", composite.display());
    }
    tracing::info!("Run finished as {:?} after stages {:?}", outcome.status, outcome.stages);

    Ok(())
}

async fn run_standardize(args: SubjectArgs, cfg_path: &Path) -> Result<()> {
    let effective = load_config(&args.shared, cfg_path)?;
    let log_path = init_logging(&effective.log_dir)?;
    banner(&log_path);

    let engine = conversion_engine(&effective);
    let report = standardize(&args.subject, &engine).await?;

    for failure in &report.failures {
        println!("  {} {}: {}", "✗".red(), failure.path.display(), failure.reason);
    }
    println!(
        "Summary: {} tracer(s), {} produced, {} skipped, {} failed.",
        report.tracers_visited,
        report.produced.len(),
        report.skipped.len(),
        report.failures.len()
    );
    Ok(())
}

fn run_check(args: SubjectArgs, cfg_path: &Path) -> Result<()> {
    let effective = load_config(&args.shared, cfg_path)?;
    let log_path = init_logging(&effective.log_dir)?;
    banner(&log_path);

    let tracer_dirs = discover_tracer_dirs(&args.subject)?;
    let report = select_compliant(&tracer_dirs, &effective.modalities);

    for dir in &report.admitted {
        println!("  {} {}", "✓".green(), file_name(dir));
    }
    for excluded in &report.excluded {
        println!("  {} {}: {}", "✗".red(), file_name(&excluded.path), excluded.reason);
    }
    println!("Summary: {} of {} tracer(s) compliant.", report.admitted.len(), report.total());
    Ok(())
}

async fn run_fetch(args: SharedArgs, cfg_path: &Path) -> Result<()> {
    let effective = load_config(&args, cfg_path)?;
    let log_path = init_logging(&effective.log_dir)?;
    banner(&log_path);

    let platform = Platform::current()?;
    println!(
        "  {} registry entries; this machine is {}-{}",
        effective.registry.len(),
        platform.os,
        platform.arch
    );
    let bundle = ResourceResolver::new(&effective.registry, &effective.binary_dir)
        .resolve_current()
        .await?;
    println!("{} Binaries ready in {}", "✓".green(), bundle.display());
    Ok(())
}
