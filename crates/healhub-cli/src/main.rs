//! HealHub CLI
//!
//! Operations front end for the skin-condition detection core: single
//! image detection, full ensemble breakdowns, registry status, held-out
//! evaluation and gated retraining.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use healhub_core::RegistryStatus;
use healhub_vision::preprocess::decode_base64;
use healhub_vision::{AsyncDetector, DetectionService, ImageClassifier, RetrainMode, RetrainOutcome, Retrainer};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

mod config;
mod evaluate;

#[derive(Parser, Debug)]
#[command(name = "healhub")]
#[command(about = "HealHub skin-condition detection", long_about = None)]
struct Cli {
    /// Configuration file path (default: ./healhub.yaml, then the user config dir)
    #[arg(short, long, env = "HEALHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Models directory, overrides the configuration file
    #[arg(short, long, env = "HEALHUB_MODELS_DIR")]
    models_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Print Prometheus metrics to stderr before exiting
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the models directory and report what loaded
    Status,

    /// Best single label from the primary model, with guidance
    Detect(ImageArgs),

    /// Run every model and resolve the ensemble label
    DetectAll {
        #[command(flatten)]
        image: ImageArgs,

        /// Binary override threshold (default from configuration)
        #[arg(short, long)]
        threshold: Option<f32>,
    },

    /// Class probabilities of the primary model
    PredictProba(ImageArgs),

    /// Ensemble accuracy on the last images of each class directory
    Evaluate {
        /// Dataset root with one sub-directory per class
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Share of each class held out for validation
        #[arg(long, default_value = "0.2")]
        val_split: f64,

        /// Binary override threshold (default from configuration)
        #[arg(short, long)]
        threshold: Option<f32>,

        /// Print the report as JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Run training and evaluation, reloading models if accuracy passes
    Retrain {
        #[arg(long)]
        epochs: Option<u32>,

        #[arg(long)]
        batch_size: Option<u32>,

        #[arg(long)]
        img_size: Option<u32>,

        /// Required overall accuracy (0.0-1.0)
        #[arg(long)]
        min_accuracy: Option<f32>,

        /// Report a rejected model as an outcome rather than an error
        #[arg(long)]
        background: bool,
    },
}

#[derive(Args, Debug)]
struct ImageArgs {
    /// Image file
    path: PathBuf,

    /// The file holds base64 text (optionally a data: URL)
    #[arg(long)]
    base64: bool,
}

impl ImageArgs {
    fn read(&self) -> Result<Vec<u8>> {
        let content = std::fs::read(&self.path)
            .with_context(|| format!("failed to read image {}", self.path.display()))?;
        if !self.base64 {
            return Ok(content);
        }

        let text = String::from_utf8(content).context("base64 image is not valid UTF-8")?;
        Ok(decode_base64(&text)?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.log_format);
    let metrics_handle = if cli.metrics { Some(init_metrics()?) } else { None };

    let (config, source) = config::load(cli.config.as_deref(), cli.models_dir.as_deref())?;
    info!("Configuration: {:?}", source);
    info!("Models directory: {}", config.models_dir.display());

    let service = Arc::new(DetectionService::new(config));
    let detector = AsyncDetector::new(Arc::clone(&service));

    let outcome = run(cli.command, &service, &detector).await;

    if let Some(handle) = metrics_handle {
        eprintln!("{}", handle.render());
    }

    outcome
}

async fn run(command: Command, service: &Arc<DetectionService>, detector: &AsyncDetector) -> Result<()> {
    match command {
        Command::Status => {
            let status = detector.warm_up().await?;
            log_status(&status);
            print_json(&status)
        }

        Command::Detect(image) => {
            let result = detector.detect(image.read()?).await?;
            print_json(&result)
        }

        Command::DetectAll { image, threshold } => {
            let result = detector.detect_all(image.read()?, threshold).await?;
            print_json(&result)
        }

        Command::PredictProba(image) => {
            let dist = detector.predict_proba(image.read()?).await?;
            print_json(&dist)
        }

        Command::Evaluate {
            data_dir,
            val_split,
            threshold,
            json,
        } => {
            let (classes, samples) = evaluate::gather_validation_files(&data_dir, val_split)
                .with_context(|| format!("failed to read dataset {}", data_dir.display()))?;
            info!("Evaluating {} images over {} classes", samples.len(), classes.len());

            detector.warm_up().await?;
            let report = evaluate::evaluate(detector, classes, samples, threshold, num_cpus::get()).await;

            if json {
                print_json(&report)
            } else {
                print!("{}", report.render());
                Ok(())
            }
        }

        Command::Retrain {
            epochs,
            batch_size,
            img_size,
            min_accuracy,
            background,
        } => {
            let mut retrain = service.config().retrain.clone();
            if let Some(epochs) = epochs {
                retrain.epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                retrain.batch_size = batch_size;
            }
            if let Some(img_size) = img_size {
                retrain.img_size = img_size;
            }
            if let Some(min_accuracy) = min_accuracy {
                retrain.min_accuracy = min_accuracy;
            }

            let retrainer = Retrainer::new(Arc::clone(service)).with_config(retrain);
            let outcome = if background {
                retrainer.spawn().await.context("retraining task panicked")??
            } else {
                retrainer.run(RetrainMode::Blocking).await?
            };

            print_json(&RetrainReport::from(outcome))
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum RetrainReport {
    Promoted { accuracy: f32, status: RegistryStatus },
    Rejected { accuracy: f32, required: f32 },
}

impl From<RetrainOutcome> for RetrainReport {
    fn from(outcome: RetrainOutcome) -> Self {
        match outcome {
            RetrainOutcome::Promoted { accuracy, status } => Self::Promoted { accuracy, status },
            RetrainOutcome::Rejected { accuracy, required } => Self::Rejected { accuracy, required },
        }
    }
}

fn log_status(status: &RegistryStatus) {
    if status.has_model {
        info!("✓ Primary model loaded, {} models total", status.models.len());
    } else {
        warn!("✗ No primary model, running in stub mode");
    }
    for failure in &status.failures {
        warn!("✗ {}", failure);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool, format: LogFormat) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("healhub=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("healhub=info"))
    };

    // Logs go to stderr so stdout stays machine-readable
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

/// Install the Prometheus recorder and describe HealHub metrics
fn init_metrics() -> Result<PrometheusHandle> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics: {}", e))?;

    healhub_vision::telemetry::describe_metrics();

    Ok(handle)
}
