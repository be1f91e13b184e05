//! Async classifier trait and the blocking-pool adapter over
//! [`DetectionService`]

use crate::service::DetectionService;
use async_trait::async_trait;
use healhub_core::{DetectionResult, Distribution, EnsembleResult, Error, RegistryStatus, Result};
use std::sync::Arc;

/// Trait for image classifiers used from async code
#[async_trait]
pub trait ImageClassifier: Send + Sync {
    /// Best single label for an image
    async fn detect(&self, bytes: Vec<u8>) -> Result<DetectionResult>;

    /// Primary model class probabilities
    async fn predict_proba(&self, bytes: Vec<u8>) -> Result<Distribution>;

    /// Full multi-model breakdown
    async fn detect_all(&self, bytes: Vec<u8>, threshold: Option<f32>) -> Result<EnsembleResult>;

    /// Get the classifier name
    fn name(&self) -> &str;
}

/// Runs a shared [`DetectionService`] on tokio's blocking pool.
///
/// Inference is CPU-bound; running it inline would stall the runtime.
/// Calls are never cancelled once started.
#[derive(Debug, Clone)]
pub struct AsyncDetector {
    service: Arc<DetectionService>,
}

impl AsyncDetector {
    pub fn new(service: Arc<DetectionService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<DetectionService> {
        &self.service
    }

    /// Load models on the blocking pool
    pub async fn warm_up(&self) -> Result<RegistryStatus> {
        let service = Arc::clone(&self.service);
        blocking(move || Ok(service.warm_up())).await
    }

    /// Forced reload on the blocking pool
    pub async fn reload(&self) -> Result<RegistryStatus> {
        let service = Arc::clone(&self.service);
        blocking(move || Ok(service.reload())).await
    }
}

#[async_trait]
impl ImageClassifier for AsyncDetector {
    async fn detect(&self, bytes: Vec<u8>) -> Result<DetectionResult> {
        let service = Arc::clone(&self.service);
        blocking(move || service.detect(&bytes)).await
    }

    async fn predict_proba(&self, bytes: Vec<u8>) -> Result<Distribution> {
        let service = Arc::clone(&self.service);
        blocking(move || service.predict_proba(&bytes)).await
    }

    async fn detect_all(&self, bytes: Vec<u8>, threshold: Option<f32>) -> Result<EnsembleResult> {
        let service = Arc::clone(&self.service);
        blocking(move || service.detect_all(&bytes, threshold)).await
    }

    fn name(&self) -> &str {
        "skin-condition-ensemble"
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::internal(format!("inference task failed: {}", e)))?
}
