//! Detection service: the composition of registry, preprocessing,
//! predictor, ensemble resolver and guidance table

use crate::config::VisionConfig;
use crate::ensemble;
use crate::guidance::guidance_for;
use crate::model_loader::ModelArtifact;
use crate::predictor::{self, Prediction, HEURISTIC_CONFIDENCE};
use crate::preprocess::{self, InputCache};
use crate::registry::{LoadedModels, ModelRegistry};
use crate::telemetry;
use candle_core::Device;
use healhub_core::{
    AuxiliaryOutput, DetectionResult, Distribution, EnsembleResult, Error, ModelKind, RegistryStatus,
    Result,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Label reported when the primary model fails on an image
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Skin-condition detection over a lazily loaded model ensemble.
///
/// Construct once and share by `Arc`; all methods take `&self` and are
/// safe to call from many threads.
#[derive(Debug)]
pub struct DetectionService {
    registry: ModelRegistry,
}

impl DetectionService {
    pub fn new(config: VisionConfig) -> Self {
        Self {
            registry: ModelRegistry::new(config),
        }
    }

    pub fn with_registry(registry: ModelRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &VisionConfig {
        self.registry.config()
    }

    /// Best single label for an image, from the primary model.
    ///
    /// Without a primary model the label comes from a byte-length
    /// heuristic with `model_used = false`.
    pub fn detect(&self, bytes: &[u8]) -> Result<DetectionResult> {
        if bytes.is_empty() {
            return Err(Error::EmptyInput);
        }

        let start = Instant::now();
        let models = self.registry.ensure_loaded();

        let result = match &models.primary {
            None => {
                debug!("No primary model loaded, using heuristic label");
                detection(predictor::heuristic_label(bytes), HEURISTIC_CONFIDENCE, false)
            }
            Some(primary) => {
                let image = preprocess::decode(bytes)?;
                let mut cache = InputCache::new(&image, self.registry.device());
                match self.primary_distribution(&models, primary, &mut cache) {
                    Ok(dist) => match dist.top() {
                        Some((label, confidence)) => detection(label, confidence, true),
                        None => detection(UNKNOWN_LABEL, 0.0, false),
                    },
                    Err(e) => {
                        warn!("Primary model inference failed: {}", e);
                        telemetry::record_abstention("multiclass");
                        detection(UNKNOWN_LABEL, 0.0, false)
                    }
                }
            }
        };

        telemetry::record_inference("detect", start.elapsed());
        Ok(result)
    }

    /// Class probabilities of the primary model; empty in stub mode or
    /// when inference fails
    pub fn predict_proba(&self, bytes: &[u8]) -> Result<Distribution> {
        if bytes.is_empty() {
            return Err(Error::EmptyInput);
        }

        let start = Instant::now();
        let models = self.registry.ensure_loaded();

        let Some(primary) = &models.primary else {
            return Ok(Distribution::empty());
        };

        let image = preprocess::decode(bytes)?;
        let mut cache = InputCache::new(&image, self.registry.device());
        let dist = match self.primary_distribution(&models, primary, &mut cache) {
            Ok(dist) => dist,
            Err(e) => {
                warn!("Primary model inference failed: {}", e);
                telemetry::record_abstention("multiclass");
                Distribution::empty()
            }
        };

        telemetry::record_inference("predict_proba", start.elapsed());
        Ok(dist)
    }

    /// Run every loaded model and resolve one ensemble label.
    ///
    /// `threshold` overrides the configured binary threshold. Models whose
    /// inference fails are listed in `abstained` and otherwise ignored.
    pub fn detect_all(&self, bytes: &[u8], threshold: Option<f32>) -> Result<EnsembleResult> {
        if bytes.is_empty() {
            return Err(Error::EmptyInput);
        }

        let start = Instant::now();
        let threshold = threshold.unwrap_or(self.config().binary_threshold);
        let models = self.registry.ensure_loaded();

        let mut result = EnsembleResult::default();
        if models.artifacts().next().is_none() {
            debug!("No models loaded, nothing to ensemble");
            return Ok(result);
        }

        let image = preprocess::decode(bytes)?;
        let mut cache = InputCache::new(&image, self.registry.device());

        if let Some(primary) = &models.primary {
            match self.primary_distribution(&models, primary, &mut cache) {
                Ok(dist) => result.multiclass = Some(dist),
                Err(e) => abstain(&mut result, primary, e),
            }
        }

        for artifact in &models.binaries {
            match run(artifact, &mut cache) {
                Ok(Prediction::Probability(p)) => {
                    let label = artifact.label.clone().unwrap_or_else(|| artifact.name.clone());
                    insert_binary(&mut result.binaries, label, p);
                }
                Ok(Prediction::Distribution(_)) => {
                    abstain(&mut result, artifact, Error::inference(&artifact.name, "unexpected output shape"))
                }
                Err(e) => abstain(&mut result, artifact, e),
            }
        }

        for artifact in &models.others {
            match run(artifact, &mut cache) {
                Ok(prediction) => {
                    let kind = match prediction {
                        Prediction::Probability(_) => ModelKind::Binary,
                        Prediction::Distribution(_) => ModelKind::Multiclass,
                    };
                    result.others.insert(
                        artifact.name.clone(),
                        AuxiliaryOutput {
                            kind,
                            probs: prediction.probs(),
                            classes: artifact.classes.clone(),
                        },
                    );
                }
                Err(e) => abstain(&mut result, artifact, e),
            }
        }

        let resolution = ensemble::resolve(result.multiclass.as_ref(), &result.binaries, threshold);
        debug!(
            "Ensemble resolved {:?} ({:.3}) from {:?}, {} tensors prepared",
            resolution.label,
            resolution.confidence,
            resolution.source,
            cache.len()
        );
        result.ensemble_label = resolution.label;
        result.ensemble_confidence = resolution.confidence;

        telemetry::record_inference("detect_all", start.elapsed());
        Ok(result)
    }

    /// Health report; does not trigger a load
    pub fn status(&self) -> RegistryStatus {
        self.registry.status()
    }

    /// Load models now if not yet loaded
    pub fn warm_up(&self) -> RegistryStatus {
        self.registry.ensure_loaded();
        self.status()
    }

    /// Drop every loaded model and load the directory again
    pub fn reload(&self) -> RegistryStatus {
        self.registry.reload();
        self.status()
    }

    pub fn device(&self) -> &Device {
        self.registry.device()
    }

    fn primary_distribution(
        &self,
        models: &LoadedModels,
        primary: &ModelArtifact,
        cache: &mut InputCache<'_>,
    ) -> Result<Distribution> {
        let probs = run(primary, cache)?.probs();
        let classes = models.catalog.labels_for(probs.len());
        Ok(Distribution::new(classes, probs))
    }
}

fn run(artifact: &ModelArtifact, cache: &mut InputCache<'_>) -> Result<Prediction> {
    let input = cache.get(artifact.input_size, artifact.normalization)?;
    predictor::predict(artifact, &input)
}

/// Duplicate binary labels keep the higher probability
fn insert_binary(binaries: &mut BTreeMap<String, f32>, label: String, p: f32) {
    binaries
        .entry(label)
        .and_modify(|existing| *existing = existing.max(p))
        .or_insert(p);
}

fn abstain(result: &mut EnsembleResult, artifact: &ModelArtifact, error: Error) {
    warn!("Model {} abstained: {}", artifact.name, error);
    telemetry::record_abstention(match artifact.kind {
        ModelKind::Multiclass => "multiclass",
        ModelKind::Binary => "binary",
        ModelKind::Auxiliary => "auxiliary",
    });
    result.abstained.push(artifact.name.clone());
}

fn detection(label: &str, confidence: f32, model_used: bool) -> DetectionResult {
    let guidance = guidance_for(label);
    DetectionResult {
        label: label.to_string(),
        confidence,
        treatments: guidance.treatments,
        specialization: guidance.specialization,
        model_used,
    }
}

/// Shared handle type used by the async facade and the retrainer
pub type SharedService = Arc<DetectionService>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stub_service() -> (TempDir, DetectionService) {
        let dir = TempDir::new().unwrap();
        let service = DetectionService::new(VisionConfig::with_models_dir(dir.path()));
        (dir, service)
    }

    #[test]
    fn test_empty_input_rejected() {
        let (_dir, service) = stub_service();
        assert!(matches!(service.detect(b""), Err(Error::EmptyInput)));
        assert!(matches!(service.predict_proba(b""), Err(Error::EmptyInput)));
        assert!(matches!(service.detect_all(b"", None), Err(Error::EmptyInput)));
    }

    #[test]
    fn test_stub_detect_uses_heuristic() {
        let (_dir, service) = stub_service();

        let result = service.detect(b"four").unwrap();
        assert_eq!(result.label, "Acne");
        assert_eq!(result.confidence, 0.6);
        assert!(!result.model_used);
        assert_eq!(result.specialization, "Dermatology");

        let result = service.detect(b"three").unwrap();
        assert_eq!(result.label, "Eczema");
    }

    #[test]
    fn test_stub_predict_proba_is_empty() {
        let (_dir, service) = stub_service();
        assert!(service.predict_proba(b"anything").unwrap().is_empty());
    }

    #[test]
    fn test_insert_binary_keeps_max() {
        let mut map = BTreeMap::new();
        insert_binary(&mut map, "Acne".into(), 0.4);
        insert_binary(&mut map, "Acne".into(), 0.7);
        insert_binary(&mut map, "Acne".into(), 0.2);
        assert_eq!(map["Acne"], 0.7);
    }

    #[test]
    fn test_unknown_detection_guidance() {
        let result = detection(UNKNOWN_LABEL, 0.0, false);
        assert_eq!(result.specialization, "General");
        assert_eq!(result.treatments, vec!["Visit a clinician for diagnosis".to_string()]);
    }
}
