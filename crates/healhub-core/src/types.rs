//! Core types for HealHub

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Single best-guess detection with the guidance attached to its label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Resolved class label
    pub label: String,

    /// Confidence score (0.0-1.0)
    pub confidence: f32,

    /// Suggested treatments for the label
    pub treatments: Vec<String>,

    /// Recommended doctor specialization
    pub specialization: String,

    /// False when the label came from the heuristic fallback or a failed
    /// inference rather than a trained model
    pub model_used: bool,
}

/// Probability distribution over an ordered class list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub classes: Vec<String>,
    pub probs: Vec<f32>,
}

impl Distribution {
    /// Create a distribution; `classes` and `probs` must have equal length
    pub fn new(classes: Vec<String>, probs: Vec<f32>) -> Self {
        debug_assert_eq!(classes.len(), probs.len());
        Self { classes, probs }
    }

    /// An empty distribution (no multiclass model available)
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.probs.is_empty()
    }

    /// Index and probability of the most likely class.
    ///
    /// Ties resolve to the lowest index.
    pub fn argmax(&self) -> Option<(usize, f32)> {
        let mut best: Option<(usize, f32)> = None;
        for (idx, &p) in self.probs.iter().enumerate() {
            match best {
                Some((_, best_p)) if p <= best_p => {}
                _ => best = Some((idx, p)),
            }
        }
        best
    }

    /// Label and probability of the most likely class
    pub fn top(&self) -> Option<(&str, f32)> {
        let (idx, p) = self.argmax()?;
        self.classes.get(idx).map(|c| (c.as_str(), p))
    }

    /// Sum of all probabilities
    pub fn total(&self) -> f32 {
        self.probs.iter().sum()
    }
}

/// Kind of a loaded model artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// One score per class of the catalog
    Multiclass,
    /// One-vs-rest, single probability for one class
    Binary,
    /// Any other non-binary model; reported but never used for decisions
    Auxiliary,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Multiclass => "multiclass",
            Self::Binary => "binary",
            Self::Auxiliary => "auxiliary",
        };
        f.write_str(name)
    }
}

/// Output of an auxiliary model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxiliaryOutput {
    /// `binary` for single-output models, `multiclass` otherwise
    #[serde(rename = "type")]
    pub kind: ModelKind,

    pub probs: Vec<f32>,

    /// Class names, when the artifact declares them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classes: Vec<String>,
}

/// Full multi-model breakdown for one image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnsembleResult {
    /// Primary multiclass distribution, if a primary model is loaded
    pub multiclass: Option<Distribution>,

    /// Class name -> probability for every binary model that answered
    pub binaries: BTreeMap<String, f32>,

    /// Auxiliary model name -> output
    pub others: BTreeMap<String, AuxiliaryOutput>,

    pub ensemble_label: Option<String>,

    pub ensemble_confidence: f32,

    /// Models whose inference failed for this image
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub abstained: Vec<String>,
}

/// Summary of one loaded artifact for health reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub name: String,
    pub path: String,
    pub kind: ModelKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub input_size: (u32, u32),
    pub normalization: String,
    /// Load strategy that succeeded
    pub strategy: String,
}

/// Health/readiness report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStatus {
    /// A load attempt has completed (successfully or in stub mode)
    pub ready: bool,

    /// The primary multiclass model is loaded
    pub has_model: bool,

    pub classes: Vec<String>,

    pub models: Vec<ModelSummary>,

    /// Artifacts that failed every load strategy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,

    /// Number of completed load passes
    pub generation: u64,
}
