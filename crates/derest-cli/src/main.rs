//! `derest` command-line front end.
//!
//! Loads a JSON network description, propagates an input box through it and
//! either reports the bounds, prints per-weight indicators, or prunes the
//! network and writes the result back out.

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use derest_core::{DerestConfig, ScoreKind};
use derest_propagate::{
    compute_indicators, derest_with_config, load_network, save_network, BoundsReport,
    PropagationEngine,
};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "derest")]
#[command(about = "Derivative-range sensitivity bounds and global weight pruning")]
#[command(version)]
struct Cli {
    /// JSON run configuration; command-line flags take precedence
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG wins if set
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Disable rayon parallelism
    #[arg(long, global = true)]
    sequential: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Input box shared by every subcommand.
#[derive(Args, Debug, Clone, Copy)]
struct RangeArgs {
    /// Smallest value of any input element
    #[arg(long, allow_negative_numbers = true)]
    input_min: Option<f32>,

    /// Largest value of any input element
    #[arg(long, allow_negative_numbers = true)]
    input_max: Option<f32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Propagate the input box and report per-layer bound widths
    Inspect {
        /// Network description (JSON)
        network: PathBuf,
        #[command(flatten)]
        range: RangeArgs,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Compute per-weight importance indicators
    Indicators {
        /// Network description (JSON)
        network: PathBuf,
        #[command(flatten)]
        range: RangeArgs,
        /// Score reduction: max-abs, upper or width
        #[arg(long)]
        score: Option<ScoreKind>,
        /// Print every indicator value as JSON
        #[arg(long)]
        json: bool,
    },
    /// Zero the globally least important fraction of weights
    Prune {
        /// Network description (JSON)
        network: PathBuf,
        #[command(flatten)]
        range: RangeArgs,
        /// Fraction of all weights to zero, in [0, 1]
        #[arg(short, long)]
        fraction: Option<f32>,
        /// Score reduction: max-abs, upper or width
        #[arg(long)]
        score: Option<ScoreKind>,
        /// Where to write the pruned network
        #[arg(short, long)]
        output: PathBuf,
        /// Print the pruning report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<DerestConfig> {
    let Some(path) = path else {
        return Ok(DerestConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Layer command-line overrides on top of the file configuration.
fn resolve_config(
    cli: &Cli,
    range: RangeArgs,
    fraction: Option<f32>,
    score: Option<ScoreKind>,
) -> Result<DerestConfig> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(min) = range.input_min {
        config.input_min = min;
    }
    if let Some(max) = range.input_max {
        config.input_max = max;
    }
    if let Some(fraction) = fraction {
        config.fraction = fraction;
    }
    if let Some(score) = score {
        config.score = score;
    }
    if cli.sequential {
        config.propagation.parallel = false;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn inspect(network: &Path, config: &DerestConfig, json: bool) -> Result<()> {
    let network = load_network(network)
        .with_context(|| format!("Failed to load network {}", network.display()))?;
    let engine = PropagationEngine::with_config(&network, config.propagation.clone())?;
    let state = engine.propagate_range(config.input_min, config.input_max)?;
    let report = BoundsReport::from_state(&engine, &state);
    if let Some(node) = report.first_degraded() {
        warn!("Bounds degraded at {} ({})", node.path, node.status());
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.summary());
    }
    Ok(())
}

fn indicators(network: &Path, config: &DerestConfig, json: bool) -> Result<()> {
    let network = load_network(network)
        .with_context(|| format!("Failed to load network {}", network.display()))?;
    let indicators = compute_indicators(
        &network,
        (config.input_min, config.input_max),
        config.score,
        config,
    )?;
    if json {
        println!("{}", serde_json::to_string_pretty(&indicators)?);
    } else {
        println!("{}", indicators.summary());
    }
    Ok(())
}

fn prune(network_path: &Path, output: &Path, config: &DerestConfig, json: bool) -> Result<()> {
    let mut network = load_network(network_path)
        .with_context(|| format!("Failed to load network {}", network_path.display()))?;
    let report = derest_with_config(&mut network, config)?;
    save_network(&network, output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!("Wrote pruned network to {}", output.display());
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.summary());
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let start = Instant::now();

    match &cli.command {
        Commands::Inspect {
            network,
            range,
            json,
        } => {
            let config = resolve_config(&cli, *range, None, None)?;
            inspect(network, &config, *json)?;
        }
        Commands::Indicators {
            network,
            range,
            score,
            json,
        } => {
            let config = resolve_config(&cli, *range, None, *score)?;
            indicators(network, &config, *json)?;
        }
        Commands::Prune {
            network,
            range,
            fraction,
            score,
            output,
            json,
        } => {
            let config = resolve_config(&cli, *range, *fraction, *score)?;
            prune(network, output, &config, *json)?;
        }
    }

    info!("Done in {:.2?}", start.elapsed());
    Ok(())
}
