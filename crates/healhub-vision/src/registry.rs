//! Model registry: lazy, single-flight loading of a models directory
//!
//! The registry is an explicit state machine. The first caller of
//! [`ModelRegistry::ensure_loaded`] scans the directory and loads every
//! artifact while holding the load lock; concurrent callers block on the
//! same lock and then observe the finished state. Loaded models are shared
//! as an immutable `Arc<LoadedModels>` until [`ModelRegistry::invalidate`].

use crate::catalog::ClassCatalog;
use crate::config::VisionConfig;
use crate::legacy;
use crate::manifest::ModelManifest;
use crate::model_loader::{discover_models, ArtifactLoader, ArtifactRole, ModelArtifact};
use crate::telemetry;
use candle_core::Device;
use healhub_core::{ModelKind, ModelSummary, RegistryStatus};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything one load pass produced
#[derive(Debug)]
pub struct LoadedModels {
    /// Multiclass model, absent in stub mode
    pub primary: Option<ModelArtifact>,
    pub binaries: Vec<ModelArtifact>,
    pub others: Vec<ModelArtifact>,
    pub catalog: ClassCatalog,
    /// One message per artifact (or source) that failed to load
    pub failures: Vec<String>,
    /// Number of this load pass, starting at 1
    pub generation: u64,
}

impl LoadedModels {
    fn empty(catalog: ClassCatalog, failures: Vec<String>, generation: u64) -> Self {
        Self {
            primary: None,
            binaries: Vec::new(),
            others: Vec::new(),
            catalog,
            failures,
            generation,
        }
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// Class names for the primary model's output, padded with
    /// `class_<i>` where the catalog is short
    pub fn primary_classes(&self) -> Vec<String> {
        match &self.primary {
            Some(primary) => self.catalog.labels_for(primary.output_dim),
            None => self.catalog.classes().to_vec(),
        }
    }

    /// All loaded artifacts, primary first
    pub fn artifacts(&self) -> impl Iterator<Item = &ModelArtifact> {
        self.primary
            .iter()
            .chain(self.binaries.iter())
            .chain(self.others.iter())
    }

    pub fn summaries(&self) -> Vec<ModelSummary> {
        self.artifacts().map(ModelArtifact::summary).collect()
    }
}

/// Observable registry state
#[derive(Debug, Clone)]
pub enum RegistryState {
    Unloaded,
    Loading,
    /// Primary model loaded
    Ready(Arc<LoadedModels>),
    /// Stub mode: no usable primary; any binaries that loaded still serve
    LoadFailed(Arc<LoadedModels>),
}

impl RegistryState {
    /// Loaded models, once a load has finished
    pub fn models(&self) -> Option<&Arc<LoadedModels>> {
        match self {
            Self::Ready(models) | Self::LoadFailed(models) => Some(models),
            Self::Unloaded | Self::Loading => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// Registry for the artifacts of one models directory
pub struct ModelRegistry {
    config: VisionConfig,
    device: Device,
    state: RwLock<RegistryState>,
    load_lock: Mutex<()>,
    loads: AtomicU64,
}

impl ModelRegistry {
    /// Create an unloaded registry; nothing is read until first use
    pub fn new(config: VisionConfig) -> Self {
        let device = config.device.to_device();
        Self::with_device(config, device)
    }

    pub fn with_device(config: VisionConfig, device: Device) -> Self {
        Self {
            config,
            device,
            state: RwLock::new(RegistryState::Unloaded),
            load_lock: Mutex::new(()),
            loads: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &VisionConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Snapshot of the current state
    pub fn state(&self) -> RegistryState {
        self.state.read().clone()
    }

    /// Loaded models if a load has finished, without triggering one
    pub fn current(&self) -> Option<Arc<LoadedModels>> {
        self.state.read().models().cloned()
    }

    /// Number of load passes performed so far
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Load the models directory once and return the result.
    ///
    /// Never fails: a missing or broken primary model leaves the registry
    /// in stub mode.
    pub fn ensure_loaded(&self) -> Arc<LoadedModels> {
        if let Some(models) = self.current() {
            return models;
        }

        let _guard = self.load_lock.lock();
        if let Some(models) = self.current() {
            return models;
        }

        *self.state.write() = RegistryState::Loading;
        let generation = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
        let models = Arc::new(self.load_all(generation));

        *self.state.write() = if models.has_primary() {
            telemetry::record_load("ready");
            RegistryState::Ready(Arc::clone(&models))
        } else {
            telemetry::record_load("stub");
            RegistryState::LoadFailed(Arc::clone(&models))
        };

        models
    }

    /// Drop the loaded models; the next use loads again.
    ///
    /// Waits for an in-flight load to finish first.
    pub fn invalidate(&self) {
        let _guard = self.load_lock.lock();
        *self.state.write() = RegistryState::Unloaded;
        debug!("Model registry invalidated");
    }

    /// Invalidate and load again
    pub fn reload(&self) -> Arc<LoadedModels> {
        self.invalidate();
        self.ensure_loaded()
    }

    /// Health report; does not trigger a load
    pub fn status(&self) -> RegistryStatus {
        match self.current() {
            Some(models) => RegistryStatus {
                ready: true,
                has_model: models.has_primary(),
                classes: models.primary_classes(),
                models: models.summaries(),
                failures: models.failures.clone(),
                generation: models.generation,
            },
            None => RegistryStatus::default(),
        }
    }

    fn load_all(&self, generation: u64) -> LoadedModels {
        let config = &self.config;
        let mut failures = Vec::new();

        let manifest = match ModelManifest::load_optional(config.manifest_path()) {
            Ok(manifest) => manifest.unwrap_or_default(),
            Err(e) => {
                warn!("Ignoring model manifest {}: {}", config.manifest_path().display(), e);
                failures.push(format!("{}: {}", config.manifest_path().display(), e));
                ModelManifest::default()
            }
        };

        let mut paths = match discover_models(config) {
            Ok(paths) => paths,
            Err(e) => {
                warn!("{}", e);
                failures.push(e.to_string());
                let catalog = self.resolve_catalog(&manifest, None);
                return LoadedModels::empty(catalog, failures, generation);
            }
        };

        // Manifest entries may live in sub-directories
        for entry in &manifest.models {
            let path = config.models_dir.join(&entry.path);
            if path.is_file() && !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        info!(
            "Loading model registry from {} ({} artifacts)",
            config.models_dir.display(),
            paths.len()
        );

        let loader = ArtifactLoader::new(config, &self.device);
        let primary_path = self.select_primary(&manifest, &paths);

        let mut primary = None;
        let mut binaries = Vec::new();
        let mut others = Vec::new();

        match &primary_path {
            Some(path) if path.is_file() => {
                let entry = manifest.entry_for(&config.models_dir, path);
                match loader.load(path, ArtifactRole::Primary, entry) {
                    Ok(artifact) if artifact.kind == ModelKind::Binary => {
                        warn!(
                            "Primary candidate {} has a single output; using it as a binary model",
                            path.display()
                        );
                        info!("✓ Loaded binary model: {}", artifact.name);
                        binaries.push(artifact);
                    }
                    Ok(artifact) => {
                        info!("✓ Loaded primary model: {} ({})", artifact.name, artifact.strategy);
                        primary = Some(artifact);
                    }
                    Err(e) => {
                        warn!("✗ Failed to load primary model {}: {}", path.display(), e);
                        failures.push(e.to_string());
                    }
                }
            }
            Some(path) => {
                warn!("✗ Primary model {} not found", path.display());
                failures.push(format!("primary model {} not found", path.display()));
            }
            None => warn!("No primary model found in {}", config.models_dir.display()),
        }

        for path in paths.iter().filter(|p| Some(*p) != primary_path.as_ref()) {
            let entry = manifest.entry_for(&config.models_dir, path);
            match loader.load(path, ArtifactRole::Secondary, entry) {
                Ok(artifact) => {
                    info!("✓ Loaded {} model: {}", artifact.kind, artifact.name);
                    match artifact.kind {
                        ModelKind::Binary => binaries.push(artifact),
                        _ => others.push(artifact),
                    }
                }
                Err(e) => {
                    warn!("✗ Failed to load model {}: {}", path.display(), e);
                    failures.push(e.to_string());
                }
            }
        }

        let catalog = self.resolve_catalog(&manifest, primary.as_ref());
        if let Some(primary) = &primary {
            if !catalog.is_empty() && catalog.len() != primary.output_dim {
                warn!(
                    "Primary model {} has {} outputs but the class catalog has {} entries",
                    primary.name,
                    primary.output_dim,
                    catalog.len()
                );
            }
        }

        let loaded = primary.iter().count() + binaries.len() + others.len();
        info!(
            "Model registry generation {} loaded {}/{} models",
            generation,
            loaded,
            paths.len()
        );

        LoadedModels {
            primary,
            binaries,
            others,
            catalog,
            failures,
            generation,
        }
    }

    /// Manifest multiclass entry, else the configured primary file, else
    /// the first artifact not marked as a binary or auxiliary model
    fn select_primary(&self, manifest: &ModelManifest, paths: &[PathBuf]) -> Option<PathBuf> {
        let models_dir = &self.config.models_dir;

        if let Some(entry) = manifest.primary() {
            return Some(models_dir.join(&entry.path));
        }

        let configured = self.config.primary_path();
        if configured.is_file() {
            return Some(configured);
        }

        paths
            .iter()
            .find(|path| {
                let declared = manifest.entry_for(models_dir, path).and_then(|e| e.kind);
                !matches!(declared, Some(ModelKind::Binary) | Some(ModelKind::Auxiliary))
                    && !legacy::is_binary_filename(path)
            })
            .cloned()
    }

    fn resolve_catalog(&self, manifest: &ModelManifest, primary: Option<&ModelArtifact>) -> ClassCatalog {
        let declared: &[String] = match primary {
            Some(artifact) if !artifact.classes.is_empty() => &artifact.classes,
            _ => manifest.primary().map(|e| e.classes.as_slice()).unwrap_or(&[]),
        };
        let checkpoint: &[String] = primary.map(|a| a.checkpoint_classes.as_slice()).unwrap_or(&[]);

        ClassCatalog::resolve(
            declared,
            checkpoint,
            &self.config.classes_path(),
            self.config.dataset_dir.as_deref(),
        )
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models_dir", &self.config.models_dir)
            .field("loads", &self.load_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_dir_is_stub_mode() {
        let dir = TempDir::new().unwrap();
        let registry = ModelRegistry::with_device(VisionConfig::with_models_dir(dir.path()), Device::Cpu);

        assert!(matches!(registry.state(), RegistryState::Unloaded));
        let models = registry.ensure_loaded();
        assert!(!models.has_primary());
        assert!(matches!(registry.state(), RegistryState::LoadFailed(_)));
        assert_eq!(models.generation, 1);
    }

    #[test]
    fn test_missing_dir_records_failure() {
        let config = VisionConfig::with_models_dir("/nonexistent/healhub/models");
        let registry = ModelRegistry::with_device(config, Device::Cpu);

        let models = registry.ensure_loaded();
        assert!(!models.has_primary());
        assert_eq!(models.failures.len(), 1);
        assert!(registry.status().ready);
        assert!(!registry.status().has_model);
    }

    #[test]
    fn test_status_before_load() {
        let dir = TempDir::new().unwrap();
        let registry = ModelRegistry::with_device(VisionConfig::with_models_dir(dir.path()), Device::Cpu);

        let status = registry.status();
        assert!(!status.ready);
        assert_eq!(status.generation, 0);
        assert_eq!(registry.load_count(), 0);
    }

    #[test]
    fn test_invalidate_starts_new_generation() {
        let dir = TempDir::new().unwrap();
        let registry = ModelRegistry::with_device(VisionConfig::with_models_dir(dir.path()), Device::Cpu);

        registry.ensure_loaded();
        registry.ensure_loaded();
        assert_eq!(registry.load_count(), 1);

        registry.invalidate();
        assert!(matches!(registry.state(), RegistryState::Unloaded));
        assert_eq!(registry.ensure_loaded().generation, 2);
    }

    #[test]
    fn test_select_primary_skips_legacy_binaries() {
        let dir = TempDir::new().unwrap();
        let registry = ModelRegistry::with_device(VisionConfig::with_models_dir(dir.path()), Device::Cpu);

        let paths = vec![
            dir.path().join("Detector_binary_Acne.safetensors"),
            dir.path().join("resnet18_best.pth"),
        ];
        let primary = registry.select_primary(&ModelManifest::default(), &paths);
        assert_eq!(primary, Some(dir.path().join("resnet18_best.pth")));
    }
}
