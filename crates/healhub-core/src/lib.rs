//! HealHub Core
//!
//! Types and errors shared across HealHub components.
//!
//! This crate provides:
//! - The error taxonomy used by the inference core and its callers
//! - Serializable detection, ensemble, and registry status types

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    AuxiliaryOutput, DetectionResult, Distribution, EnsembleResult, ModelKind, ModelSummary,
    RegistryStatus,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::types::{DetectionResult, Distribution, EnsembleResult, RegistryStatus};
}
