use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use alignreid::metrics::{JsonlSink, MetricsSink, TracingSink};
use alignreid::TrainConfig;

#[derive(Parser)]
#[command(name = "alignreid")]
#[command(about = "Mutual-learning trainer for person re-identification embeddings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train an ensemble on the synthetic identity source
    Train {
        /// Configuration file path; built-in defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write per-epoch metrics to this JSONL file instead of the log
        #[arg(short, long)]
        metrics: Option<PathBuf>,
    },

    /// Validate a configuration file, or print the default configuration
    Config {
        /// Configuration file to validate; prints defaults when omitted
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Show system information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train { config, metrics } => {
            run_training(config, metrics).await?;
        }

        Commands::Config { file } => {
            handle_config(file)?;
        }

        Commands::Info => {
            show_system_info();
        }
    }

    Ok(())
}

async fn run_training(config_path: Option<PathBuf>, metrics_path: Option<PathBuf>) -> Result<()> {
    let config = match &config_path {
        Some(path) => {
            TrainConfig::from_file(path).context("Failed to load configuration file")?
        }
        None => TrainConfig::default(),
    };

    info!(
        "Training {} model(s) for {} epoch(s), {} steps per epoch",
        config.ensemble.num_models, config.training.total_epochs, config.data.batches_per_epoch
    );

    let sink: Box<dyn MetricsSink> = match &metrics_path {
        Some(path) => {
            info!("Recording metrics to {}", path.display());
            Box::new(JsonlSink::create(path).context("Failed to create metrics file")?)
        }
        None => Box::new(TracingSink),
    };

    let mut trainer =
        alignreid::build_trainer(config, sink).context("Failed to initialize trainer")?;
    let report = trainer.train().await.context("Training failed")?;

    info!(
        "Training complete: {} epoch(s), {} step(s), final avg loss {:.4}, {:.1}s",
        report.epochs_run,
        report.total_steps,
        report.final_avg_loss,
        report.elapsed.as_secs_f64()
    );

    Ok(())
}

fn handle_config(file: Option<PathBuf>) -> Result<()> {
    let Some(path) = file else {
        // No file: print the defaults as a starting point.
        let json = serde_json::to_string_pretty(&TrainConfig::default())
            .context("Failed to serialize default configuration")?;
        println!("{json}");
        return Ok(());
    };

    info!("Validating configuration file: {}", path.display());

    let config = TrainConfig::from_file(&path).context("Failed to load configuration file")?;

    // TrainConfig::from_file already calls validate() internally
    info!("✅ Configuration is valid!");
    info!("Configuration summary:");
    info!(
        "  - Ensemble: {} model(s) on {} device entry(ies)",
        config.ensemble.num_models,
        config.ensemble.devices.len()
    );
    info!(
        "  - Batches: {} ids x {} images, {} per epoch",
        config.data.ids_per_batch, config.data.ims_per_id, config.data.batches_per_epoch
    );
    info!(
        "  - Margins: global {:?}, local {:?}",
        config.loss.global_margin, config.loss.local_margin
    );
    info!(
        "  - Optimizer: {:?} at base lr {}",
        config.optimizer.kind, config.optimizer.base_lr
    );
    info!("  - Schedule: {:?}", config.schedule);

    Ok(())
}

fn show_system_info() {
    println!("🦀 AlignReID - Mutual-Learning Re-Identification Trainer");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Features:");
    println!("  ✅ Hard-mined global and local triplet losses");
    println!("  ✅ Shortest-path alignment over local feature stacks");
    println!("  ✅ Cross-model probability and distance mutual learning");
    println!("  ✅ Exponential and staircase learning-rate schedules");
    println!("  ✅ Safetensors checkpoints with resume");
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  ✅ NVIDIA CUDA GPU acceleration");
    #[cfg(not(feature = "cuda"))]
    println!("  ❌ CUDA support (not compiled)");

    #[cfg(feature = "metal")]
    println!("  ✅ Apple Metal GPU acceleration");
    #[cfg(not(feature = "metal"))]
    println!("  ❌ Metal support (not compiled)");

    #[cfg(feature = "accelerate")]
    println!("  ✅ Apple Accelerate framework");
    #[cfg(not(feature = "accelerate"))]
    println!("  ❌ Accelerate support (not compiled)");

    println!("  ✅ CPU training");
    println!();
    println!("Usage:");
    println!("  alignreid train -c config.json -m metrics.jsonl");
    println!("  alignreid config -f config.json  # Validate configuration");
    println!("  alignreid config                 # Print default configuration");
    println!("  alignreid info                   # Show this information");
}
