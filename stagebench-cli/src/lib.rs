#![warn(missing_docs)]
//! Stagebench CLI Library
//!
//! The orchestrator side of stagebench:
//! - `StagebenchConfig`: `stagebench.toml` discovery and defaults
//! - `ChildLauncher`: one supervised child per case, with an optional
//!   diagnostic session on fds 3/4
//! - `Pipeline`/`Orchestrator`: generate, build, launch and collect, per
//!   partition and across partitions
//!
//! # Example
//!
//! ```ignore
//! fn main() -> anyhow::Result<()> {
//!     stagebench_cli::run()
//! }
//! ```

mod config;
mod pipeline;
mod supervisor;

pub use config::*;
pub use pipeline::{MeasurementRecord, Orchestrator, PartitionReport, PartitionRun, Pipeline, PipelineError};
pub use supervisor::{ChildLauncher, ChildRun, PipeChannel, SupervisorError};

use clap::{Parser, Subcommand};
use stagebench_diag::ProfileProviderCatalog;
use stagebench_toolchain::{ArtifactGenerator, BuildCommand, ProcessExecutor};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

/// Stagebench CLI arguments
#[derive(Parser, Debug)]
#[command(name = "stagebench")]
#[command(author, version, about = "Stagebench - staged out-of-process benchmarking")]
pub struct Cli {
    /// Optional subcommand; defaults to Run
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file (discovered from the current directory if not set)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Only partitions whose id contains this text
    #[arg(long, global = true)]
    pub partition: Option<String>,

    /// Diagnostic profile: CpuSampling, GcVerbose, GcCollect, Threading
    #[arg(long, global = true)]
    pub profile: Option<String>,

    /// Output file (stdout if not specified)
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    /// Number of partitions processed concurrently
    #[arg(long, global = true)]
    pub jobs: Option<usize>,

    /// Keep generated artifacts
    #[arg(long, global = true)]
    pub keep_files: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build and measure every partition (default)
    Run,
    /// Print the restore/build/publish command lines without running them
    Plan,
    /// List diagnostic profiles and their providers
    Profiles,
    /// Print a default stagebench.toml
    Init,
}

/// Run the Stagebench CLI with the process arguments.
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_with_cli(cli)
}

/// Install the stderr log subscriber.
pub fn init_logging(verbose: bool) {
    let filter = if verbose { "stagebench=debug" } else { "stagebench=info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Run the Stagebench CLI with pre-parsed arguments.
pub fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => StagebenchConfig::load(path)?,
        None => StagebenchConfig::discover().unwrap_or_default(),
    };

    match cli.command.as_ref().unwrap_or(&Commands::Run) {
        Commands::Init => {
            print!("{}", StagebenchConfig::default_toml());
            Ok(())
        }
        Commands::Profiles => {
            let mut out = std::io::stdout().lock();
            for descriptor in ProfileProviderCatalog::global().profiles() {
                writeln!(out, "{}", descriptor.profile)?;
                for (provider, level, keywords) in descriptor.triples() {
                    writeln!(out, "  {provider} level={level:?} keywords={keywords:#x}")?;
                }
            }
            Ok(())
        }
        Commands::Plan => plan(&cli, &config),
        Commands::Run => run_partitions(&cli, &config),
    }
}

fn selected_partitions(cli: &Cli, config: &StagebenchConfig) -> anyhow::Result<Vec<stagebench_toolchain::Partition>> {
    let mut partitions = config.partitions()?;
    if let Some(filter) = &cli.partition {
        partitions.retain(|p| p.id().contains(filter.as_str()));
    }
    Ok(partitions)
}

fn plan(cli: &Cli, config: &StagebenchConfig) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    for partition in selected_partitions(cli, config)? {
        let root = PathBuf::from(&config.toolchain.artifacts_dir).join(partition.id());
        let mut command = BuildCommand::new(&config.toolchain.tool, root.join("src"), Arc::new(partition))
            .extend_arguments(config.toolchain.extra_arguments.iter().cloned());
        if config.toolchain.isolated_packages {
            command = command.with_packages_dir(root.join("packages"));
        }
        writeln!(out, "[{}]", command.partition().id())?;
        writeln!(out, "  {} {}", config.toolchain.tool, command.restore_arguments())?;
        writeln!(out, "  {} {}", config.toolchain.tool, command.build_arguments())?;
        writeln!(out, "  {} {}", config.toolchain.tool, command.publish_arguments())?;
    }
    Ok(())
}

fn run_partitions(cli: &Cli, config: &StagebenchConfig) -> anyhow::Result<()> {
    let engine = config.engine.to_engine_config()?;
    let profile_name = cli.profile.as_ref().or(config.diagnostics.profile.as_ref());
    let profile = match profile_name {
        Some(name) => Some(ProfileProviderCatalog::global().lookup(name)?.clone()),
        None => None,
    };

    let partitions = selected_partitions(cli, config)?;
    if partitions.is_empty() {
        tracing::warn!("no partitions configured; add [[partition]] tables to stagebench.toml");
        return Ok(());
    }

    let generator = ArtifactGenerator::new(&config.toolchain.artifacts_dir, &config.toolchain.binary_name)
        .keep_files(cli.keep_files || config.toolchain.keep_files)
        .isolated_packages(config.toolchain.isolated_packages);
    let pipeline = Pipeline::new(
        &config.toolchain.tool,
        generator,
        Arc::new(ProcessExecutor),
        engine,
    )
    .with_extra_arguments(config.toolchain.extra_arguments.clone())
    .with_build_timeout(StagebenchConfig::parse_duration(&config.toolchain.build_timeout)?)
    .with_profile(profile)
    .with_timeouts(
        StagebenchConfig::parse_duration(&config.diagnostics.attach_timeout)?,
        StagebenchConfig::parse_duration(&config.runner.timeout)?,
    );

    let jobs = cli.jobs.or(config.runner.jobs).unwrap_or(1);
    let reports = Orchestrator::new(pipeline, jobs).run_all(&partitions);

    let mut records = Vec::new();
    let mut failed = 0usize;
    let mut failed_cases = 0usize;
    for report in reports {
        match report.outcome {
            Ok(mut run) => {
                failed_cases += run.failures.len();
                records.append(&mut run.records);
            }
            Err(e) => {
                failed += 1;
                tracing::error!("partition {} failed during {}: {}", report.partition, e.stage(), e);
            }
        }
    }

    let json = serde_json::to_string_pretty(&records)?;
    let output = cli
        .output
        .clone()
        .or_else(|| config.runner.output.as_ref().map(PathBuf::from));
    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, json)?;
            tracing::info!("wrote {} record(s) to {}", records.len(), path.display());
        }
        None => println!("{}", json),
    }

    if failed > 0 {
        anyhow::bail!("{} of {} partition(s) failed", failed, partitions.len());
    }
    if failed_cases > 0 {
        anyhow::bail!("{} case(s) failed to run", failed_cases);
    }
    Ok(())
}
