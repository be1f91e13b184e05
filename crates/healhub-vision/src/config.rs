//! Configuration for model discovery, inference, and retraining

use crate::architecture::{default_families, FamilyTemplate};
use crate::preprocess::{InputSize, AUXILIARY_INPUT_SIZE, PRIMARY_INPUT_SIZE};
use candle_core::Device;
use healhub_core::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Configuration for the detection service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    /// Directory holding model artifacts
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// File name of the designated multiclass model
    #[serde(default = "default_primary_model")]
    pub primary_model: String,

    /// Model manifest, relative to `models_dir`
    #[serde(default = "default_manifest_file")]
    pub manifest_file: PathBuf,

    /// JSON class list, relative to `models_dir`
    #[serde(default = "default_classes_file")]
    pub classes_file: PathBuf,

    /// Training-data root; its sub-directories name the classes
    #[serde(default)]
    pub dataset_dir: Option<PathBuf>,

    /// Artifact file extensions to consider
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Input size for a primary model that declares none
    #[serde(default = "default_primary_input_size")]
    pub primary_input_size: InputSize,

    /// Input size for binary/auxiliary models that declare none
    #[serde(default = "default_auxiliary_input_size")]
    pub auxiliary_input_size: InputSize,

    /// Minimum binary probability that overrides the multiclass answer
    #[serde(default = "default_binary_threshold")]
    pub binary_threshold: f32,

    /// Device to run inference on
    #[serde(default)]
    pub device: DeviceSpec,

    /// Recovery templates for weights-only artifacts, tried in order
    #[serde(default = "default_families")]
    pub families: Vec<FamilyTemplate>,

    /// Retraining orchestration
    #[serde(default)]
    pub retrain: RetrainConfig,
}

/// Device specification (for config files)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSpec {
    #[default]
    Cpu,
    Cuda { index: Option<usize> },
    Metal { index: Option<usize> },
}

impl DeviceSpec {
    /// Create the Candle device, falling back to CPU if unavailable
    pub fn to_device(&self) -> Device {
        let result = match self {
            DeviceSpec::Cpu => return Device::Cpu,
            DeviceSpec::Cuda { index } => Device::new_cuda(index.unwrap_or(0)),
            DeviceSpec::Metal { index } => Device::new_metal(index.unwrap_or(0)),
        };

        result.unwrap_or_else(|e| {
            warn!("Failed to create {:?} device, using CPU: {}", self, e);
            Device::Cpu
        })
    }
}

/// External training/evaluation commands and the promotion gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainConfig {
    /// Training command; arguments may use `{epochs}`, `{batch_size}`,
    /// `{img_size}`, `{models_dir}` and `{checkpoint}`
    #[serde(default = "default_train_command")]
    pub train_command: Vec<String>,

    /// Evaluation command; must print an `Overall accuracy: NN.NN%` line
    #[serde(default = "default_eval_command")]
    pub eval_command: Vec<String>,

    /// Working directory for both commands
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Checkpoint the training run must produce; defaults to the primary
    /// model inside `models_dir`
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,

    /// Minimum overall accuracy (0.0-1.0) required to promote the model
    #[serde(default = "default_min_accuracy")]
    pub min_accuracy: f32,

    #[serde(default = "default_epochs")]
    pub epochs: u32,

    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    #[serde(default = "default_img_size")]
    pub img_size: u32,
}

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            train_command: default_train_command(),
            eval_command: default_eval_command(),
            working_dir: None,
            checkpoint: None,
            min_accuracy: default_min_accuracy(),
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            img_size: default_img_size(),
        }
    }
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            primary_model: default_primary_model(),
            manifest_file: default_manifest_file(),
            classes_file: default_classes_file(),
            dataset_dir: None,
            extensions: default_extensions(),
            primary_input_size: default_primary_input_size(),
            auxiliary_input_size: default_auxiliary_input_size(),
            binary_threshold: default_binary_threshold(),
            device: DeviceSpec::Cpu,
            families: default_families(),
            retrain: RetrainConfig::default(),
        }
    }
}

impl VisionConfig {
    /// Configuration rooted at a models directory, defaults elsewhere
    pub fn with_models_dir(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            ..Default::default()
        }
    }

    /// Load from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load from file if it exists, otherwise use defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.models_dir.join(&self.manifest_file)
    }

    pub fn classes_path(&self) -> PathBuf {
        self.models_dir.join(&self.classes_file)
    }

    pub fn primary_path(&self) -> PathBuf {
        self.models_dir.join(&self.primary_model)
    }

    /// Where `retrain` writes its checkpoint, relative to the models directory
    pub fn checkpoint_path(&self, retrain: &RetrainConfig) -> PathBuf {
        match &retrain.checkpoint {
            Some(path) => self.models_dir.join(path),
            None => self.primary_path(),
        }
    }

    /// Whether a file has one of the configured artifact extensions
    pub fn is_artifact(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }

    /// Look up a recovery family by name
    pub fn family(&self, name: &str) -> Option<&FamilyTemplate> {
        self.families.iter().find(|f| f.name == name)
    }
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("./models")
}

fn default_primary_model() -> String {
    "skin_classifier.safetensors".to_string()
}

fn default_manifest_file() -> PathBuf {
    PathBuf::from("manifest.yaml")
}

fn default_classes_file() -> PathBuf {
    PathBuf::from("classes.json")
}

fn default_extensions() -> Vec<String> {
    ["safetensors", "pt", "pth", "bin"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_primary_input_size() -> InputSize {
    InputSize::square(PRIMARY_INPUT_SIZE)
}

fn default_auxiliary_input_size() -> InputSize {
    InputSize::square(AUXILIARY_INPUT_SIZE)
}

fn default_binary_threshold() -> f32 {
    0.5
}

fn default_train_command() -> Vec<String> {
    [
        "python", "train.py", "--data-dir", "dataset/train", "--epochs", "{epochs}",
        "--batch-size", "{batch_size}", "--img-size", "{img_size}", "--out", "{models_dir}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_eval_command() -> Vec<String> {
    [
        "python", "evaluate.py", "--checkpoint", "{checkpoint}", "--data-dir", "dataset/train",
        "--img-size", "{img_size}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_min_accuracy() -> f32 {
    0.9
}

fn default_epochs() -> u32 {
    10
}

fn default_batch_size() -> u32 {
    32
}

fn default_img_size() -> u32 {
    224
}
