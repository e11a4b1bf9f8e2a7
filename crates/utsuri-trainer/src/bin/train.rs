//! Utsuri training CLI
//!
//! Trains a source-domain tagger, adapts it to a target domain, and runs
//! evaluation or inference with a persisted model.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use utsuri_core::vocab::build_vocabs;
use utsuri_trainer::{Config, ModelLifecycle, run_adaptation};

/// CLI arguments
#[derive(Parser)]
#[command(name = "utsuri-train")]
#[command(about = "Train and adapt BiLSTM-CRF taggers across domains")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log debug output (per-batch loss, parameter partitions)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model, optionally starting from a source checkpoint
    Train {
        /// JSON configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Source checkpoint file or model directory
        #[arg(short, long)]
        source: Option<PathBuf>,

        /// Scope re-initialized after transfer
        #[arg(long, default_value = "proj")]
        reinit_scope: String,
    },

    /// Adapt a source model to the dataset under `datasets/<name>/`
    Transfer {
        /// JSON configuration file of the source run
        #[arg(short, long)]
        config: PathBuf,

        /// Target dataset name
        #[arg(short, long)]
        dataset: String,

        /// Source checkpoint file or model directory
        #[arg(short, long)]
        source: PathBuf,
    },

    /// Score the persisted model on the test split
    Evaluate {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Tag an unlabeled file with the persisted model
    Predict {
        #[arg(short, long)]
        config: PathBuf,

        /// One token per line, blank line between sentences
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory (defaults to `dir_output`)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Collect word and tag vocabularies from the configured splits
    BuildVocab {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("failed to load config {}", path.display()))
}

fn init_logging(path_log: &Path, verbose: bool) -> Result<()> {
    if let Some(parent) = path_log.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path_log)
        .with_context(|| format!("failed to open log file {}", path_log.display()))?;

    tracing_subscriber::fmt()
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .with_ansi(false)
        .with_writer(std::io::stdout.and(Arc::new(file)))
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Transfer { config, dataset, .. } => load_config(config)?.for_target_domain(dataset),
        Commands::Train { config, .. }
        | Commands::Evaluate { config }
        | Commands::Predict { config, .. }
        | Commands::BuildVocab { config } => load_config(config)?,
    };
    config.validate().context("invalid configuration")?;
    init_logging(&config.path_log, cli.verbose)?;

    match cli.command {
        Commands::Train {
            source,
            reinit_scope,
            ..
        } => {
            let run = run_adaptation(config, source.as_deref(), Some(reinit_scope.as_str()))
                .context("training failed")?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Commands::Transfer { source, .. } => {
            info!(source = %source.display(), "adapting to target domain");
            let run = run_adaptation(config, Some(source.as_path()), None).context("transfer failed")?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Commands::Evaluate { .. } => {
            let mut lifecycle = ModelLifecycle::build(config)?;
            let (_, _, test) = lifecycle.datasets();
            let metrics = lifecycle.evaluate(&test).context("evaluation failed")?;
            println!("{}", serde_json::to_string_pretty(&metrics.to_map())?);
        }
        Commands::Predict { input, output, .. } => {
            let output = output.unwrap_or_else(|| config.dir_output.clone());
            let mut lifecycle = ModelLifecycle::build(config)?;
            lifecycle.restore_latest().context("no trained model to predict with")?;
            let path = lifecycle.predict_file(&input, &output)?;
            println!("{}", path.display());
        }
        Commands::BuildVocab { .. } => {
            let splits = [&config.filename_train, &config.filename_dev, &config.filename_test];
            let (words, tags) = build_vocabs(&splits, config.lowercase)?;
            words.save(&config.filename_words)?;
            tags.save(&config.filename_tags)?;
            info!(words = words.len(), tags = tags.len(), "vocabularies written");
        }
    }

    Ok(())
}
