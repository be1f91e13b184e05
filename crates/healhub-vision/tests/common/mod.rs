//! Shared fixtures: tiny real Candle models written into temp directories

#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use healhub_vision::VisionConfig;
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const CLASSES: [&str; 4] = ["Acne", "Eczema", "Diabetic Foot Ulcer", "Fungal Infection"];

/// Pooling + dense head; with zero weights the output equals the bias
pub const TINY_ARCH: &str = r#"
layers:
  - type: global_avg_pool
  - type: linear
input_size: 16
normalization: unit_scale
"#;

pub const TINY_SIGMOID_ARCH: &str = r#"
layers:
  - type: global_avg_pool
  - type: linear
  - type: sigmoid
input_size: 12
normalization: symmetric
"#;

/// Tensors for [`TINY_ARCH`]: zero weights and the given bias
pub fn dense_tensors(bias: &[f32]) -> HashMap<String, Tensor> {
    let mut tensors = HashMap::new();
    tensors.insert(
        "1.weight".to_string(),
        Tensor::zeros((bias.len(), 3), DType::F32, &Device::Cpu).unwrap(),
    );
    tensors.insert("1.bias".to_string(), Tensor::new(bias, &Device::Cpu).unwrap());
    tensors
}

/// Weights-only artifact, no architecture next to it
pub fn write_weights(dir: &Path, file: &str, bias: &[f32]) -> PathBuf {
    let path = dir.join(file);
    candle_core::safetensors::save(&dense_tensors(bias), &path).unwrap();
    path
}

/// Artifact plus `<stem>.arch.yaml` describing it
pub fn write_model(dir: &Path, file: &str, bias: &[f32], arch: &str) -> PathBuf {
    let path = write_weights(dir, file, bias);
    std::fs::write(path.with_extension("arch.yaml"), arch).unwrap();
    path
}

pub fn write_corrupt(dir: &Path, file: &str) -> PathBuf {
    let path = dir.join(file);
    std::fs::write(&path, b"not a model").unwrap();
    path
}

pub fn write_classes(dir: &Path, classes: &[&str]) {
    std::fs::write(dir.join("classes.json"), serde_json::to_string(classes).unwrap()).unwrap();
}

/// Four-class primary whose arg-max is "Diabetic Foot Ulcer"
pub fn write_primary(dir: &Path) -> PathBuf {
    write_classes(dir, &CLASSES);
    write_model(dir, "skin_classifier.safetensors", &[0.0, 0.0, 5.0, 0.0], TINY_ARCH)
}

/// Legacy-named binary model with probability `sigmoid(logit)`
pub fn write_binary(dir: &Path, label: &str, logit: f32) -> PathBuf {
    let file = format!("AIWoundAndRashDetector_binary_{}.safetensors", label.replace(' ', "_"));
    write_model(dir, &file, &[logit], TINY_ARCH)
}

pub fn config(dir: &Path) -> VisionConfig {
    VisionConfig::with_models_dir(dir)
}

pub fn models_dir() -> TempDir {
    TempDir::new().unwrap()
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x * 7) as u8, (y * 5) as u8, 90]));
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
        .unwrap();
    buf
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
