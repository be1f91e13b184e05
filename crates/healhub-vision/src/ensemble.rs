//! Ensemble resolution: binary override, multiclass fallback

use healhub_core::Distribution;
use std::collections::BTreeMap;

/// Which model family decided the ensemble label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Binary,
    Multiclass,
    None,
}

/// Outcome of [`resolve`]
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub label: Option<String>,
    pub confidence: f32,
    pub source: ResolutionSource,
}

impl Resolution {
    fn none() -> Self {
        Self {
            label: None,
            confidence: 0.0,
            source: ResolutionSource::None,
        }
    }
}

/// Binary entry with the highest probability.
///
/// Equal maxima resolve to the lexicographically smallest label.
pub fn best_binary(binaries: &BTreeMap<String, f32>) -> Option<(&str, f32)> {
    let mut best: Option<(&str, f32)> = None;
    for (label, &p) in binaries {
        match best {
            Some((_, best_p)) if p <= best_p => {}
            _ => best = Some((label.as_str(), p)),
        }
    }
    best
}

/// Combine binary and multiclass outputs into one label.
///
/// A binary model at or above `threshold` wins; otherwise the multiclass
/// arg-max is used. Auxiliary outputs never participate.
pub fn resolve(
    multiclass: Option<&Distribution>,
    binaries: &BTreeMap<String, f32>,
    threshold: f32,
) -> Resolution {
    if let Some((label, p)) = best_binary(binaries) {
        if p >= threshold {
            return Resolution {
                label: Some(label.to_string()),
                confidence: p,
                source: ResolutionSource::Binary,
            };
        }
    }

    match multiclass.and_then(Distribution::top) {
        Some((label, p)) => Resolution {
            label: Some(label.to_string()),
            confidence: p,
            source: ResolutionSource::Multiclass,
        },
        None => Resolution::none(),
    }
}
