//! Model manifest written alongside trained artifacts
//!
//! The manifest is the authoritative description of a models directory:
//! which file is the multiclass model, which are one-vs-rest binaries and
//! for which class, the input size and normalization each was trained
//! with. Artifacts it does not mention fall back to the legacy filename
//! convention in [`crate::legacy`].

use crate::architecture::ArchitectureSpec;
use crate::preprocess::{InputSize, Normalization};
use healhub_core::{ModelKind, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Manifest of all artifacts in a models directory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelManifest {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub models: Vec<ManifestEntry>,
}

/// Description of one artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Artifact path, relative to the models directory
    pub path: PathBuf,

    #[serde(default)]
    pub kind: Option<ModelKind>,

    /// Class a binary model detects
    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub input_size: Option<InputSize>,

    #[serde(default)]
    pub normalization: Option<Normalization>,

    /// Recovery family to use when the artifact holds weights only
    #[serde(default)]
    pub family: Option<String>,

    /// Ordered class list for multiclass artifacts
    #[serde(default)]
    pub classes: Vec<String>,

    /// Inline architecture; makes the artifact self-describing
    #[serde(default)]
    pub architecture: Option<ArchitectureSpec>,
}

impl ManifestEntry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: None,
            label: None,
            input_size: None,
            normalization: None,
            family: None,
            classes: Vec::new(),
            architecture: None,
        }
    }
}

impl ModelManifest {
    /// Load from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load if the file exists; a missing manifest is not an error
    pub fn load_optional(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.is_file() {
            return Ok(None);
        }
        Self::from_file(path).map(Some)
    }

    /// Entry describing `artifact`, matched on the path relative to
    /// `models_dir` or on the bare file name
    pub fn entry_for(&self, models_dir: &Path, artifact: &Path) -> Option<&ManifestEntry> {
        self.models.iter().find(|entry| {
            let resolved = models_dir.join(&entry.path);
            resolved == artifact
                || (entry.path.components().count() == 1
                    && artifact.file_name() == entry.path.file_name())
        })
    }

    /// Entry declared as the multiclass model
    pub fn primary(&self) -> Option<&ManifestEntry> {
        self.models
            .iter()
            .find(|entry| entry.kind == Some(ModelKind::Multiclass))
    }
}

fn default_version() -> String {
    "1".to_string()
}
