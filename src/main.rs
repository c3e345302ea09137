//! CLI Entry Point for mf-rig
//!
//! Provides command-line interface for:
//! - Running an experiment (full, dispense-only or measure-only)
//! - Printing the stage tables
//! - Checking that every device initializes
//! - Priming the pumps with the recipe volumes
//!
//! # Usage
//!
//! Run the configured experiment:
//! ```bash
//! mf-rig run --config config/rig.toml
//! ```
//!
//! Walk the measure-only stages with three bottles and no devices:
//! ```bash
//! mf-rig run --variant "Measure Only" --bottles 3 --dry-run --tick-ms 10
//! ```
//!
//! Print a stage table:
//! ```bash
//! mf-rig tables --variant "Dispense Only"
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mf_rig::config::Settings;
use mf_rig::experiment::{Experiment, RunOutcome, Variant};
use mf_rig::hardware::build_manager;
use mf_rig::logging::{self, OutputFormat, TracingConfig};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mf-rig")]
#[command(about = "Microfluidic rig experiment sequencer", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/rig.toml")]
    config: PathBuf,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true)]
    log_format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment
    Run {
        /// Variant ("Full", "Dispense Only", "Measure Only")
        #[arg(long)]
        variant: Option<String>,

        /// Number of bottles
        #[arg(long)]
        bottles: Option<usize>,

        /// Walk the stages without touching any device
        #[arg(long)]
        dry_run: bool,

        /// Delay between stages in milliseconds
        #[arg(long)]
        tick_ms: Option<u64>,
    },

    /// Print a stage table as YAML
    Tables {
        /// Variant to print; all three when absent
        #[arg(long)]
        variant: Option<String>,
    },

    /// Initialize all hardware, print the report and shut down
    Check,

    /// Aspirate the recipe volumes into the pumps
    Prime,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let mut tracing_config = TracingConfig::from_settings(&settings).map_err(anyhow::Error::msg)?;
    if let Some(format) = cli.log_format {
        tracing_config = tracing_config.with_format(format);
    }
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Run {
            variant,
            bottles,
            dry_run,
            tick_ms,
        } => {
            if let Some(variant) = variant {
                settings.sequencer.variant = variant;
            }
            if bottles.is_some() {
                settings.sequencer.bottles = bottles;
            }
            if let Some(tick_ms) = tick_ms {
                settings.sequencer.tick_ms = tick_ms;
            }
            settings.sequencer.dry_run |= dry_run;
            run(settings).await
        }
        Commands::Tables { variant } => print_tables(variant),
        Commands::Check => check(settings).await,
        Commands::Prime => prime(settings).await,
    }
}

async fn run(settings: Settings) -> Result<()> {
    let mut experiment = Experiment::from_settings(settings)?;

    let stop = experiment.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; stopping after the current stage");
            stop.stop();
        }
    });

    println!(
        "Run {} ({}, {} bottles)",
        experiment.run_id(),
        experiment.variant(),
        experiment.sequencer().state().bottle_capacity
    );

    let record = experiment.run().await?;
    println!("Stages visited: {}", record.visited_stages.len());
    println!("Measurements:   {}", record.measurements.len());
    println!("Outcome:        {}", record.outcome);
    if record.outcome != RunOutcome::Completed {
        info!("Run did not reach a terminal stage");
    }
    Ok(())
}

fn print_tables(variant: Option<String>) -> Result<()> {
    let variants = match variant {
        Some(choice) => vec![Variant::from_choice(&choice)],
        None => Variant::ALL.to_vec(),
    };
    for variant in variants {
        println!("# {variant} (pipeline depth {})", variant.pipeline_depth());
        println!("{}", variant.table().to_yaml()?);
    }
    Ok(())
}

async fn check(settings: Settings) -> Result<()> {
    settings.validate()?;
    println!("{}", settings.to_toml()?);

    let hardware = build_manager(&settings.hardware)?;
    let report = hardware.initialize_all().await;
    print!("{report}");
    hardware.shutdown_all().await?;

    if report.all_ok() {
        println!("All devices ready");
        Ok(())
    } else {
        anyhow::bail!("devices failed to initialize: {}", report.failed().join(", "))
    }
}

async fn prime(settings: Settings) -> Result<()> {
    let experiment = Experiment::from_settings(settings)?;
    let volumes = experiment.prime().await?;
    for (pump, volume) in volumes {
        println!("{pump:<8} {volume:.3} ml");
    }
    Ok(())
}
