//! Model artifact loading for Candle-based image classifiers
//!
//! Each artifact is read once into a tensor map, then rebuilt by trying its
//! load strategies in order: the architecture it declares, then every
//! configured recovery family. The first network that builds and survives
//! a probe forward pass wins; its output width decides the model kind.

use crate::architecture::{ArchitectureSpec, FamilyTemplate, Network, OutputActivation};
use crate::config::VisionConfig;
use crate::legacy;
use crate::manifest::ManifestEntry;
use crate::preprocess::{InputSize, Normalization};
use candle_core::pickle::{Object, Stack};
use candle_core::{DType, Device, Module, Tensor};
use healhub_core::{Error, ModelKind, ModelSummary, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Role an artifact plays in the ensemble, which picks its defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactRole {
    /// The designated multiclass model
    Primary,
    /// Binary or auxiliary model
    Secondary,
}

/// A loaded, immutable model artifact
pub struct ModelArtifact {
    /// File stem, used as the auxiliary model name
    pub name: String,
    pub path: PathBuf,
    pub kind: ModelKind,
    /// Class detected by a binary model
    pub label: Option<String>,
    /// Class list declared for this artifact (may be empty)
    pub classes: Vec<String>,
    /// Class list saved inside a PyTorch checkpoint next to its weights
    pub checkpoint_classes: Vec<String>,
    pub input_size: InputSize,
    pub normalization: Normalization,
    pub output_dim: usize,
    /// Load strategy that succeeded
    pub strategy: String,
    network: Network,
}

impl ModelArtifact {
    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn output_activation(&self) -> OutputActivation {
        self.network.output_activation()
    }

    pub fn summary(&self) -> ModelSummary {
        ModelSummary {
            name: self.name.clone(),
            path: self.path.display().to_string(),
            kind: self.kind,
            label: self.label.clone(),
            input_size: self.input_size.as_tuple(),
            normalization: self.normalization.to_string(),
            strategy: self.strategy.clone(),
        }
    }
}

impl std::fmt::Debug for ModelArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelArtifact")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("input_size", &self.input_size)
            .field("normalization", &self.normalization)
            .field("output_dim", &self.output_dim)
            .field("strategy", &self.strategy)
            .finish()
    }
}

/// One way of turning a tensor map back into a network
#[derive(Debug, Clone)]
pub enum LoadStrategy {
    /// Architecture shipped with the artifact
    Declared(ArchitectureSpec),
    /// Fixed template rebuilt around weights-only files
    Family(FamilyTemplate),
}

impl LoadStrategy {
    pub fn name(&self) -> String {
        match self {
            Self::Declared(_) => "declared".to_string(),
            Self::Family(family) => format!("family:{}", family.name),
        }
    }

    pub fn spec(&self) -> &ArchitectureSpec {
        match self {
            Self::Declared(spec) => spec,
            Self::Family(family) => &family.spec,
        }
    }
}

/// Loads individual artifacts according to a [`VisionConfig`]
pub struct ArtifactLoader<'a> {
    config: &'a VisionConfig,
    device: &'a Device,
}

impl<'a> ArtifactLoader<'a> {
    pub fn new(config: &'a VisionConfig, device: &'a Device) -> Self {
        Self { config, device }
    }

    /// Strategies for `path`, in the order they are tried
    pub fn strategies(&self, path: &Path, entry: Option<&ManifestEntry>) -> Result<Vec<LoadStrategy>> {
        let mut strategies = Vec::new();

        if let Some(spec) = entry.and_then(|e| e.architecture.clone()) {
            strategies.push(LoadStrategy::Declared(spec));
        } else {
            let sidecar = sidecar_path(path);
            if sidecar.is_file() {
                let content = std::fs::read_to_string(&sidecar)?;
                let spec = ArchitectureSpec::from_yaml(&content)
                    .map_err(|e| Error::load(&sidecar, format!("invalid architecture: {}", e)))?;
                strategies.push(LoadStrategy::Declared(spec));
            }
        }

        match entry.and_then(|e| e.family.as_deref()) {
            Some(name) => match self.config.family(name) {
                Some(family) => strategies.push(LoadStrategy::Family(family.clone())),
                None => warn!("Unknown model family '{}' for {}", name, path.display()),
            },
            None => strategies.extend(self.config.families.iter().cloned().map(LoadStrategy::Family)),
        }

        Ok(strategies)
    }

    /// Load one artifact, trying every strategy before giving up
    pub fn load(&self, path: &Path, role: ArtifactRole, entry: Option<&ManifestEntry>) -> Result<ModelArtifact> {
        let tensors = read_weights(path, self.device)?;
        let strategies = self.strategies(path, entry)?;

        let checkpoint_classes = if is_safetensors(path) {
            Vec::new()
        } else {
            read_checkpoint_classes(path).unwrap_or_else(|e| {
                debug!("No class list in {}: {}", path.display(), e);
                Vec::new()
            })
        };

        if strategies.is_empty() {
            return Err(Error::load(path, "no declared architecture and no recovery family"));
        }

        let mut attempts = Vec::with_capacity(strategies.len());
        for strategy in &strategies {
            match self.try_strategy(&tensors, strategy, role, entry) {
                Ok((network, input_size, normalization, output_dim)) => {
                    debug!(
                        "Loaded {} with strategy {} (output width {})",
                        path.display(),
                        strategy.name(),
                        output_dim
                    );
                    let mut artifact = self.finish(
                        path,
                        role,
                        entry,
                        network,
                        input_size,
                        normalization,
                        output_dim,
                        strategy.name(),
                    );
                    artifact.checkpoint_classes = checkpoint_classes;
                    return Ok(artifact);
                }
                Err(e) => {
                    debug!("Strategy {} failed for {}: {}", strategy.name(), path.display(), e);
                    attempts.push(format!("{}: {}", strategy.name(), e));
                }
            }
        }

        Err(Error::load(path, attempts.join("; ")))
    }

    fn try_strategy(
        &self,
        tensors: &HashMap<String, Tensor>,
        strategy: &LoadStrategy,
        role: ArtifactRole,
        entry: Option<&ManifestEntry>,
    ) -> candle_core::Result<(Network, InputSize, Normalization, usize)> {
        let spec = strategy.spec();
        let network = spec.build(tensors, self.device)?;

        let declared_size = entry.and_then(|e| e.input_size).or(spec.input_size);
        let declared_norm = entry.and_then(|e| e.normalization).or(spec.normalization);

        let (probe_size, _) = self.role_defaults(role);
        let output_dim = probe(&network, declared_size.unwrap_or(probe_size), self.device)?;

        // Defaults follow the observed kind, not the role it was loaded for
        let observed = if output_dim == 1 { ArtifactRole::Secondary } else { role };
        let (default_size, default_norm) = self.role_defaults(observed);
        let input_size = declared_size.unwrap_or(default_size);
        let normalization = declared_norm.unwrap_or(default_norm);

        if input_size != declared_size.unwrap_or(probe_size) {
            probe(&network, input_size, self.device)?;
        }

        Ok((network, input_size, normalization, output_dim))
    }

    fn role_defaults(&self, role: ArtifactRole) -> (InputSize, Normalization) {
        match role {
            ArtifactRole::Primary => (self.config.primary_input_size, Normalization::UnitScale),
            ArtifactRole::Secondary => (self.config.auxiliary_input_size, Normalization::Symmetric),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        path: &Path,
        role: ArtifactRole,
        entry: Option<&ManifestEntry>,
        network: Network,
        input_size: InputSize,
        normalization: Normalization,
        output_dim: usize,
        strategy: String,
    ) -> ModelArtifact {
        let kind = match (output_dim, role) {
            (1, _) => ModelKind::Binary,
            (_, ArtifactRole::Primary) => ModelKind::Multiclass,
            (_, ArtifactRole::Secondary) => ModelKind::Auxiliary,
        };

        if let Some(declared) = entry.and_then(|e| e.kind) {
            if declared != kind && !(declared == ModelKind::Multiclass && kind == ModelKind::Auxiliary) {
                warn!(
                    "{} declared as {} but output width {} makes it {}",
                    path.display(),
                    declared,
                    output_dim,
                    kind
                );
            }
        }

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let label = match kind {
            ModelKind::Binary => Some(
                entry
                    .and_then(|e| e.label.clone())
                    .or_else(|| legacy::binary_label_from_filename(path))
                    .unwrap_or_else(|| name.clone()),
            ),
            _ => None,
        };

        ModelArtifact {
            name,
            path: path.to_path_buf(),
            kind,
            label,
            classes: entry.map(|e| e.classes.clone()).unwrap_or_default(),
            checkpoint_classes: Vec::new(),
            input_size,
            normalization,
            output_dim,
            strategy,
            network,
        }
    }
}

/// Output width of a forward pass over a zero image of `size`
fn probe(network: &Network, size: InputSize, device: &Device) -> candle_core::Result<usize> {
    let input = Tensor::zeros((1, 3, size.height as usize, size.width as usize), DType::F32, device)?;
    let output_dim = network.forward(&input)?.elem_count();
    if output_dim == 0 {
        candle_core::bail!("network produced an empty output");
    }
    Ok(output_dim)
}

/// Read every tensor of an artifact.
///
/// SafeTensors files are read directly; PyTorch pickles are read from a
/// nested `model_state` dict when present, else from the top level.
pub fn read_weights(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let tensors = match ext.as_str() {
        "safetensors" => candle_core::safetensors::load(path, device)
            .map_err(|e| Error::load(path, format!("failed to read SafeTensors: {}", e)))?,
        _ => {
            let pairs = match candle_core::pickle::read_all_with_key(path, Some("model_state")) {
                Ok(pairs) if !pairs.is_empty() => pairs,
                _ => candle_core::pickle::read_all(path)
                    .map_err(|e| Error::load(path, format!("failed to read PyTorch weights: {}", e)))?,
            };

            let mut tensors = HashMap::with_capacity(pairs.len());
            for (name, tensor) in pairs {
                let tensor = tensor
                    .to_device(device)
                    .map_err(|e| Error::load(path, e.to_string()))?;
                tensors.insert(name, tensor);
            }
            tensors
        }
    };

    if tensors.is_empty() {
        return Err(Error::load(path, "artifact contains no tensors"));
    }

    Ok(tensors)
}

/// Class names saved with a PyTorch checkpoint.
///
/// Training scripts save `{"model_state": ..., "classes": [...]}`; a
/// checkpoint without a `classes` list yields an empty vector.
pub fn read_checkpoint_classes(path: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(std::io::BufReader::new(file))
        .map_err(|e| Error::load(path, format!("not a PyTorch archive: {}", e)))?;

    let pickles: Vec<String> = archive
        .file_names()
        .filter(|name| name.ends_with("data.pkl"))
        .map(str::to_string)
        .collect();

    for name in pickles {
        let reader = archive
            .by_name(&name)
            .map_err(|e| Error::load(path, e.to_string()))?;
        let mut stack = Stack::empty();
        stack
            .read_loop(&mut std::io::BufReader::new(reader))
            .map_err(|e| Error::load(path, e.to_string()))?;
        let object = stack.finalize().map_err(|e| Error::load(path, e.to_string()))?;

        if let Some(classes) = classes_entry(object) {
            return Ok(classes);
        }
    }

    Ok(Vec::new())
}

fn classes_entry(object: Object) -> Option<Vec<String>> {
    let Object::Dict(entries) = object else {
        return None;
    };

    let key = Object::Unicode("classes".to_string());
    let (_, value) = entries.into_iter().find(|(k, _)| *k == key)?;
    match value {
        Object::List(items) | Object::Tuple(items) => items.into_iter().map(|o| o.unicode().ok()).collect(),
        _ => None,
    }
}

fn is_safetensors(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("safetensors"))
        .unwrap_or(false)
}

/// `<stem>.arch.yaml` next to an artifact
pub fn sidecar_path(path: &Path) -> PathBuf {
    path.with_extension("arch.yaml")
}

/// Artifact files in a models directory, sorted by path
pub fn discover_models(config: &VisionConfig) -> Result<Vec<PathBuf>> {
    let mut model_paths = Vec::new();

    let entries = std::fs::read_dir(&config.models_dir).map_err(|e| {
        Error::config(format!(
            "Failed to read models directory {}: {}",
            config.models_dir.display(),
            e
        ))
    })?;

    for entry in entries {
        let path = entry?.path();
        if path.is_file() && config.is_artifact(&path) {
            model_paths.push(path);
        }
    }

    model_paths.sort();
    Ok(model_paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::{LayerDef, LayerSpec};
    use tempfile::TempDir;

    fn save_dense(path: &Path, prefix: &str, out: usize, bias: f32) {
        let mut tensors = HashMap::new();
        tensors.insert(
            format!("{}.weight", prefix),
            Tensor::zeros((out, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        tensors.insert(
            format!("{}.bias", prefix),
            Tensor::full(bias, out, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, path).unwrap();
    }

    fn tiny_family(name: &str, head: &str) -> FamilyTemplate {
        FamilyTemplate {
            name: name.to_string(),
            spec: ArchitectureSpec::new(vec![
                LayerSpec::GlobalAvgPool.into(),
                LayerDef::named(
                    head,
                    LayerSpec::Linear {
                        in_features: None,
                        out_features: None,
                        bias: true,
                    },
                ),
            ]),
        }
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            sidecar_path(Path::new("/m/skin_classifier.safetensors")),
            PathBuf::from("/m/skin_classifier.arch.yaml")
        );
    }

    #[test]
    fn test_recovery_family_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("weights_only.safetensors");
        save_dense(&path, "head", 3, 0.0);

        let mut config = VisionConfig::with_models_dir(dir.path());
        config.families = vec![tiny_family("wrong", "fc"), tiny_family("right", "head")];

        let device = Device::Cpu;
        let loader = ArtifactLoader::new(&config, &device);
        let artifact = loader.load(&path, ArtifactRole::Primary, None).unwrap();

        assert_eq!(artifact.strategy, "family:right");
        assert_eq!(artifact.kind, ModelKind::Multiclass);
        assert_eq!(artifact.output_dim, 3);
        assert_eq!(artifact.input_size, InputSize::square(224));
        assert_eq!(artifact.normalization, Normalization::UnitScale);
    }

    #[test]
    fn test_binary_label_from_legacy_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Detector_binary_Fungal_Infection.safetensors");
        save_dense(&path, "head", 1, 1.0);

        let mut config = VisionConfig::with_models_dir(dir.path());
        config.families = vec![tiny_family("tiny", "head")];

        let device = Device::Cpu;
        let artifact = ArtifactLoader::new(&config, &device)
            .load(&path, ArtifactRole::Secondary, None)
            .unwrap();

        assert_eq!(artifact.kind, ModelKind::Binary);
        assert_eq!(artifact.label.as_deref(), Some("Fungal Infection"));
        assert_eq!(artifact.input_size, InputSize::square(180));
        assert_eq!(artifact.normalization, Normalization::Symmetric);
    }

    #[test]
    fn test_single_output_primary_takes_binary_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("acne_detector.safetensors");
        save_dense(&path, "head", 1, 0.5);

        let mut config = VisionConfig::with_models_dir(dir.path());
        config.families = vec![tiny_family("tiny", "head")];

        let device = Device::Cpu;
        let artifact = ArtifactLoader::new(&config, &device)
            .load(&path, ArtifactRole::Primary, None)
            .unwrap();

        assert_eq!(artifact.kind, ModelKind::Binary);
        assert_eq!(artifact.input_size, InputSize::square(180));
        assert_eq!(artifact.normalization, Normalization::Symmetric);
    }

    #[test]
    fn test_declared_size_survives_kind_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("acne_detector.safetensors");
        save_dense(&path, "head", 1, 0.5);

        let mut family = tiny_family("tiny", "head");
        family.spec = family
            .spec
            .with_input_size(InputSize::square(64))
            .with_normalization(Normalization::ImageNet);
        let mut config = VisionConfig::with_models_dir(dir.path());
        config.families = vec![family];

        let device = Device::Cpu;
        let artifact = ArtifactLoader::new(&config, &device)
            .load(&path, ArtifactRole::Primary, None)
            .unwrap();

        assert_eq!(artifact.input_size, InputSize::square(64));
        assert_eq!(artifact.normalization, Normalization::ImageNet);
    }

    /// `{"classes": [...], "epoch": 3}` as PyTorch's zip layout stores it
    fn write_checkpoint(path: &Path, classes: &[&str]) {
        use std::io::Write;

        fn unicode(out: &mut Vec<u8>, s: &str) {
            out.push(b'X');
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }

        let mut pkl = vec![0x80, 0x02, b'}'];
        unicode(&mut pkl, "epoch");
        pkl.extend_from_slice(&[b'K', 3, b's']);
        unicode(&mut pkl, "classes");
        pkl.extend_from_slice(&[b']', b'(']);
        for class in classes {
            unicode(&mut pkl, class);
        }
        pkl.extend_from_slice(&[b'e', b's', b'.']);

        let mut zip = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
        let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        zip.start_file("resnet18_best/data.pkl", options).unwrap();
        zip.write_all(&pkl).unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn test_read_checkpoint_classes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resnet18_best.pth");
        write_checkpoint(&path, &["Eczema", "Acne", "Fungal Infection"]);

        let classes = read_checkpoint_classes(&path).unwrap();
        assert_eq!(classes, vec!["Eczema", "Acne", "Fungal Infection"]);
    }

    #[test]
    fn test_checkpoint_without_classes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resnet18_best.pth");
        write_checkpoint(&path, &[]);
        assert!(read_checkpoint_classes(&path).unwrap().is_empty());

        let not_zip = dir.path().join("legacy.pth");
        std::fs::write(&not_zip, b"\x80\x02}.").unwrap();
        assert!(read_checkpoint_classes(&not_zip).is_err());
    }

    #[test]
    fn test_all_strategies_fail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mismatch.safetensors");
        save_dense(&path, "other", 2, 0.0);

        let mut config = VisionConfig::with_models_dir(dir.path());
        config.families = vec![tiny_family("tiny", "head")];

        let device = Device::Cpu;
        let err = ArtifactLoader::new(&config, &device)
            .load(&path, ArtifactRole::Secondary, None)
            .unwrap_err();

        match err {
            Error::Load { reason, .. } => assert!(reason.contains("family:tiny")),
            other => panic!("expected load error, got {:?}", other),
        }
    }

    #[test]
    fn test_discover_models_sorted() {
        let dir = TempDir::new().unwrap();
        for name in ["b.safetensors", "a.pth", "notes.txt", "classes.json"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let config = VisionConfig::with_models_dir(dir.path());
        let found = discover_models(&config).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.pth", "b.safetensors"]);
    }

    #[test]
    fn test_discover_missing_dir_is_config_error() {
        let config = VisionConfig::with_models_dir("/nonexistent/healhub/models");
        assert!(matches!(discover_models(&config), Err(Error::Config(_))));
    }
}
