//! Metric names and emitters for the `metrics` facade.
//!
//! No recorder is installed here; the embedding application decides where
//! the values go.

use std::time::Duration;

pub const INFERENCES_TOTAL: &str = "healhub_inferences_total";
pub const MODEL_ABSTENTIONS_TOTAL: &str = "healhub_model_abstentions_total";
pub const REGISTRY_LOADS_TOTAL: &str = "healhub_registry_loads_total";
pub const INFERENCE_LATENCY_US: &str = "healhub_inference_latency_us";

/// Register descriptions with the installed recorder
pub fn describe_metrics() {
    metrics::describe_counter!(INFERENCES_TOTAL, "Total number of service inference calls by operation");
    metrics::describe_counter!(
        MODEL_ABSTENTIONS_TOTAL,
        "Total number of models that failed inference for an image"
    );
    metrics::describe_counter!(REGISTRY_LOADS_TOTAL, "Total number of model registry loads by outcome");
    metrics::describe_histogram!(
        INFERENCE_LATENCY_US,
        metrics::Unit::Microseconds,
        "End-to-end inference latency in microseconds"
    );
}

pub(crate) fn record_inference(op: &'static str, elapsed: Duration) {
    metrics::counter!(INFERENCES_TOTAL, "op" => op).increment(1);
    metrics::histogram!(INFERENCE_LATENCY_US, "op" => op).record(elapsed.as_micros() as f64);
}

pub(crate) fn record_abstention(kind: &'static str) {
    metrics::counter!(MODEL_ABSTENTIONS_TOTAL, "kind" => kind).increment(1);
}

pub(crate) fn record_load(outcome: &'static str) {
    metrics::counter!(REGISTRY_LOADS_TOTAL, "outcome" => outcome).increment(1);
}
