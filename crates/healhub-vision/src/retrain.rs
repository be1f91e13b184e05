//! Retraining orchestration: run external training and evaluation
//! commands, gate on accuracy, and hot-reload the registry on success

use crate::config::RetrainConfig;
use crate::service::DetectionService;
use healhub_core::{Error, RegistryStatus, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const ACCURACY_MARKER: &str = "Overall accuracy";

/// How the caller waits for a retraining run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrainMode {
    /// Below-threshold accuracy is returned as an error
    Blocking,
    /// Below-threshold accuracy is logged and reported as `Rejected`
    Background,
}

/// Result of a completed retraining run
#[derive(Debug, Clone, PartialEq)]
pub enum RetrainOutcome {
    /// New model met the gate and was loaded
    Promoted { accuracy: f32, status: RegistryStatus },
    /// New model was evaluated but not loaded
    Rejected { accuracy: f32, required: f32 },
}

/// Drives one training + evaluation cycle for a [`DetectionService`]
#[derive(Debug, Clone)]
pub struct Retrainer {
    service: Arc<DetectionService>,
    config: RetrainConfig,
}

impl Retrainer {
    /// Retrainer using the service's own retrain configuration
    pub fn new(service: Arc<DetectionService>) -> Self {
        let config = service.config().retrain.clone();
        Self { service, config }
    }

    pub fn with_config(mut self, config: RetrainConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RetrainConfig {
        &self.config
    }

    /// Train, evaluate and promote
    pub async fn run(&self, mode: RetrainMode) -> Result<RetrainOutcome> {
        info!(
            "Starting retraining: epochs={}, batch_size={}, img_size={}",
            self.config.epochs, self.config.batch_size, self.config.img_size
        );

        self.run_command("train", &self.config.train_command).await?;

        let checkpoint = self.checkpoint();
        if !checkpoint.is_file() {
            return Err(Error::retrain(format!(
                "training produced no checkpoint at {}",
                checkpoint.display()
            )));
        }

        let stdout = self.run_command("evaluate", &self.config.eval_command).await?;
        let accuracy = parse_overall_accuracy(&stdout)
            .ok_or_else(|| Error::retrain("evaluation printed no overall accuracy"))?;
        let required = self.config.min_accuracy;

        info!("Model overall accuracy: {:.4}", accuracy);

        if accuracy < required {
            warn!("Model accuracy {:.2} below threshold {:.2}", accuracy, required);
            return match mode {
                RetrainMode::Blocking => Err(Error::AccuracyBelowThreshold { accuracy, required }),
                RetrainMode::Background => Ok(RetrainOutcome::Rejected { accuracy, required }),
            };
        }

        let service = Arc::clone(&self.service);
        let status = tokio::task::spawn_blocking(move || service.reload())
            .await
            .map_err(|e| Error::internal(format!("reload task failed: {}", e)))?;

        info!(
            "✓ Promoted retrained model (generation {}, accuracy {:.4})",
            status.generation, accuracy
        );
        Ok(RetrainOutcome::Promoted { accuracy, status })
    }

    /// Run in the background; failures and rejections are logged
    pub fn spawn(self) -> JoinHandle<Result<RetrainOutcome>> {
        tokio::spawn(async move {
            let result = self.run(RetrainMode::Background).await;
            match &result {
                Ok(RetrainOutcome::Promoted { accuracy, .. }) => {
                    info!("Background retraining promoted model at {:.4}", accuracy)
                }
                Ok(RetrainOutcome::Rejected { accuracy, required }) => warn!(
                    "Background retraining rejected model: {:.2} < {:.2}",
                    accuracy, required
                ),
                Err(e) => error!("Background retraining failed: {}", e),
            }
            result
        })
    }

    fn checkpoint(&self) -> PathBuf {
        self.service.config().checkpoint_path(&self.config)
    }

    fn render(&self, arg: &str) -> String {
        arg.replace("{epochs}", &self.config.epochs.to_string())
            .replace("{batch_size}", &self.config.batch_size.to_string())
            .replace("{img_size}", &self.config.img_size.to_string())
            .replace("{models_dir}", &self.service.config().models_dir.display().to_string())
            .replace("{checkpoint}", &self.checkpoint().display().to_string())
    }

    async fn run_command(&self, stage: &str, template: &[String]) -> Result<String> {
        let args: Vec<String> = template.iter().map(|a| self.render(a)).collect();
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| Error::retrain(format!("{} command is empty", stage)))?;

        let mut command = Command::new(program);
        command
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        debug!("Running {} command: {:?}", stage, args);
        let output = command
            .output()
            .await
            .map_err(|e| Error::retrain(format!("failed to start {} command '{}': {}", stage, program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!("{} stdout: {}", stage, stdout.trim_end());
        if !stderr.trim().is_empty() {
            debug!("{} stderr: {}", stage, stderr.trim_end());
        }

        if !output.status.success() {
            return Err(Error::retrain(format!(
                "{} command exited with {}: {}",
                stage,
                output.status,
                stderr.trim()
            )));
        }

        Ok(stdout)
    }
}

/// Parse the last `Overall accuracy: NN.NN%` line into a fraction.
///
/// Returns `None` when no such line exists and `Some(0.0)` when the value
/// cannot be parsed.
pub fn parse_overall_accuracy(output: &str) -> Option<f32> {
    output
        .lines()
        .filter(|line| line.contains(ACCURACY_MARKER))
        .last()
        .map(|line| {
            line.rsplit(':')
                .next()
                .map(|v| v.trim().trim_end_matches('%').trim())
                .and_then(|v| v.parse::<f32>().ok())
                .map(|v| v / 100.0)
                .unwrap_or(0.0)
        })
}
