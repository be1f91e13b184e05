//! HealHub Vision
//!
//! Skin-condition image classification over an ensemble of Candle models.
//!
//! A models directory holds one multiclass classifier, any number of
//! one-vs-rest binary classifiers and optional auxiliary models:
//! - The registry loads them lazily, once, tolerating individual failures
//! - Each image is decoded once and prepared once per input shape
//! - A binary model at or above the threshold overrides the multiclass
//!   answer; auxiliary outputs are reported but never decide
//!
//! Without a usable primary model the service runs in stub mode and
//! answers `detect` from a byte-length heuristic.

pub mod architecture;
pub mod catalog;
pub mod classifier;
pub mod config;
pub mod ensemble;
pub mod guidance;
pub mod legacy;
pub mod manifest;
pub mod model_loader;
pub mod predictor;
pub mod preprocess;
pub mod registry;
pub mod retrain;
pub mod service;
pub mod telemetry;

pub use architecture::{
    default_families, ArchitectureSpec, BackboneArch, FamilyTemplate, LayerDef, LayerSpec, Network,
    OutputActivation,
};
pub use catalog::{CatalogSource, ClassCatalog};
pub use classifier::{AsyncDetector, ImageClassifier};
pub use config::{DeviceSpec, RetrainConfig, VisionConfig};
pub use ensemble::{resolve, Resolution, ResolutionSource};
pub use guidance::{guidance_for, Guidance};
pub use manifest::{ManifestEntry, ModelManifest};
pub use model_loader::{ArtifactLoader, ArtifactRole, LoadStrategy, ModelArtifact};
pub use predictor::{heuristic_label, Prediction, HEURISTIC_CONFIDENCE};
pub use preprocess::{DecodedImage, InputCache, InputSize, Normalization};
pub use registry::{LoadedModels, ModelRegistry, RegistryState};
pub use retrain::{RetrainMode, RetrainOutcome, Retrainer};
pub use service::{DetectionService, SharedService};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::classifier::{AsyncDetector, ImageClassifier};
    pub use crate::config::VisionConfig;
    pub use crate::registry::ModelRegistry;
    pub use crate::retrain::{RetrainMode, Retrainer};
    pub use crate::service::DetectionService;
    pub use healhub_core::{DetectionResult, Distribution, EnsembleResult, RegistryStatus};
}
