//! Error types for HealHub

use std::path::{Path, PathBuf};

/// Result type alias using HealHub's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for HealHub operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A model artifact could not be read or rebuilt
    #[error("failed to load model {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },

    /// Input bytes are not a decodable image
    #[error("image decode error: {0}")]
    Decode(String),

    /// No image was supplied
    #[error("no image provided")]
    EmptyInput,

    /// A loaded model failed during its forward pass
    #[error("inference error in model '{model}': {reason}")]
    Inference { model: String, reason: String },

    /// Configuration errors (missing directories, bad manifest, ...)
    #[error("configuration error: {0}")]
    Config(String),

    /// Retrained model did not reach the required accuracy
    #[error("model accuracy {accuracy:.2} below required {required:.2}")]
    AccuracyBelowThreshold { accuracy: f32, required: f32 },

    /// Training or evaluation process failed
    #[error("retrain error: {0}")]
    Retrain(String),

    /// Filesystem errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization errors
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new load error for an artifact
    pub fn load(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::Load {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Create a new decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a new inference error
    pub fn inference(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Inference {
            model: model.into(),
            reason: reason.into(),
        }
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new retrain error
    pub fn retrain(msg: impl Into<String>) -> Self {
        Self::Retrain(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error was caused by caller-supplied input.
    ///
    /// The HTTP layer renders these as 4xx; everything else is degraded
    /// internally or reported as a server fault.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::EmptyInput)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors() {
        assert!(Error::decode("not a png").is_client_error());
        assert!(Error::EmptyInput.is_client_error());
        assert!(!Error::inference("m", "boom").is_client_error());
        assert!(!Error::config("missing dir").is_client_error());
    }

    #[test]
    fn test_display() {
        let err = Error::load("/models/a.safetensors", "truncated header");
        assert_eq!(
            err.to_string(),
            "failed to load model /models/a.safetensors: truncated header"
        );

        let err = Error::AccuracyBelowThreshold {
            accuracy: 0.8123,
            required: 0.9,
        };
        assert_eq!(err.to_string(), "model accuracy 0.81 below required 0.90");
    }
}
