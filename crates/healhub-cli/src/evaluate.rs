//! Ensemble accuracy on a held-out slice of a class-per-directory dataset

use futures::stream::{self, StreamExt};
use healhub_vision::{AsyncDetector, ImageClassifier};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Prediction recorded when the ensemble produced no label or failed
pub const UNKNOWN: &str = "Unknown";

/// One validation image and its true class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub path: PathBuf,
    pub class: String,
}

/// Accuracy report
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub validation_examples: usize,
    pub overall_accuracy: f64,
    pub per_class: BTreeMap<String, f64>,
    pub classes: Vec<String>,
    /// Rows are true classes, columns predicted classes
    pub confusion: Vec<Vec<usize>>,
    /// Predictions outside the class list (counted as wrong)
    pub unknown: usize,
}

impl EvaluationReport {
    /// Human-readable summary; the `Overall accuracy` line is the one the
    /// retrain gate parses
    pub fn render(&self) -> String {
        let mut out = format!(
            "Validation examples: {}\nOverall accuracy: {:.2}%\nPer-class accuracy:\n",
            self.validation_examples,
            self.overall_accuracy * 100.0
        );
        for (class, acc) in &self.per_class {
            out.push_str(&format!("  {}: {:.2}%\n", class, acc * 100.0));
        }
        out
    }
}

/// The last `val_split` share of each sorted class directory (at least one
/// file per non-empty class)
pub fn gather_validation_files(data_dir: &Path, val_split: f64) -> std::io::Result<(Vec<String>, Vec<Sample>)> {
    let mut classes = Vec::new();
    for entry in std::fs::read_dir(data_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                classes.push(name.to_string());
            }
        }
    }
    classes.sort();

    let mut samples = Vec::new();
    for class in &classes {
        let mut images = Vec::new();
        for entry in std::fs::read_dir(data_dir.join(class))? {
            let path = entry?.path();
            if path.is_file() {
                images.push(path);
            }
        }
        images.sort();

        let n_val = ((images.len() as f64 * val_split).round() as usize).max(1).min(images.len());
        let start = images.len() - n_val;
        samples.extend(images.drain(start..).map(|path| Sample {
            path,
            class: class.clone(),
        }));
    }

    Ok((classes, samples))
}

/// Run `detect_all` over every sample, `concurrency` images at a time
pub async fn evaluate(
    detector: &AsyncDetector,
    classes: Vec<String>,
    samples: Vec<Sample>,
    threshold: Option<f32>,
    concurrency: usize,
) -> EvaluationReport {
    let predictions: Vec<(Sample, String)> = stream::iter(samples)
        .map(|sample| async move {
            let predicted = match tokio::fs::read(&sample.path).await {
                Ok(bytes) => match detector.detect_all(bytes, threshold).await {
                    Ok(result) => result.ensemble_label.unwrap_or_else(|| UNKNOWN.to_string()),
                    Err(e) => {
                        warn!("Prediction failed for {}: {}", sample.path.display(), e);
                        UNKNOWN.to_string()
                    }
                },
                Err(e) => {
                    warn!("Failed to read {}: {}", sample.path.display(), e);
                    UNKNOWN.to_string()
                }
            };
            debug!("{} -> {}", sample.path.display(), predicted);
            (sample, predicted)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    tally(classes, &predictions)
}

/// Accuracy and confusion matrix from `(sample, predicted label)` pairs
pub fn tally(classes: Vec<String>, predictions: &[(Sample, String)]) -> EvaluationReport {
    let index: BTreeMap<&str, usize> = classes.iter().enumerate().map(|(i, c)| (c.as_str(), i)).collect();
    let n = classes.len();
    let mut confusion = vec![vec![0usize; n]; n];
    let mut correct = 0;
    let mut unknown = 0;

    for (sample, predicted) in predictions {
        let Some(&truth) = index.get(sample.class.as_str()) else {
            continue;
        };
        match index.get(predicted.as_str()) {
            Some(&pred) => {
                confusion[truth][pred] += 1;
                if truth == pred {
                    correct += 1;
                }
            }
            None => unknown += 1,
        }
    }

    let total = predictions.len();
    let per_class = classes
        .iter()
        .enumerate()
        .map(|(i, class)| {
            let row: usize = confusion[i].iter().sum();
            let acc = if row > 0 { confusion[i][i] as f64 / row as f64 } else { 0.0 };
            (class.clone(), acc)
        })
        .collect();

    EvaluationReport {
        validation_examples: total,
        overall_accuracy: if total > 0 { correct as f64 / total as f64 } else { 0.0 },
        per_class,
        classes,
        confusion,
        unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(class: &str) -> Sample {
        Sample {
            path: PathBuf::from(format!("{}.jpg", class)),
            class: class.to_string(),
        }
    }

    #[test]
    fn test_gather_takes_last_files() {
        let dir = TempDir::new().unwrap();
        let acne = dir.path().join("Acne");
        let eczema = dir.path().join("Eczema");
        std::fs::create_dir_all(&acne).unwrap();
        std::fs::create_dir_all(&eczema).unwrap();
        std::fs::create_dir_all(dir.path().join("Empty")).unwrap();
        for i in 0..10 {
            std::fs::write(acne.join(format!("img_{:02}.jpg", i)), b"x").unwrap();
        }
        std::fs::write(eczema.join("only.jpg"), b"x").unwrap();

        let (classes, samples) = gather_validation_files(dir.path(), 0.2).unwrap();

        assert_eq!(classes, vec!["Acne", "Eczema", "Empty"]);
        assert_eq!(samples.len(), 3);
        assert!(samples[0].path.ends_with("img_08.jpg"));
        assert!(samples[1].path.ends_with("img_09.jpg"));
        assert_eq!(samples[2].class, "Eczema");
    }

    #[test]
    fn test_tally() {
        let classes = vec!["Acne".to_string(), "Eczema".to_string()];
        let predictions = vec![
            (sample("Acne"), "Acne".to_string()),
            (sample("Acne"), "Eczema".to_string()),
            (sample("Eczema"), "Eczema".to_string()),
            (sample("Eczema"), UNKNOWN.to_string()),
        ];

        let report = tally(classes, &predictions);

        assert_eq!(report.validation_examples, 4);
        assert!((report.overall_accuracy - 0.5).abs() < 1e-9);
        assert_eq!(report.per_class["Acne"], 0.5);
        assert_eq!(report.per_class["Eczema"], 1.0);
        assert_eq!(report.confusion, vec![vec![1, 1], vec![0, 1]]);
        assert_eq!(report.unknown, 1);
        assert!(report.render().contains("Overall accuracy: 50.00%"));
    }

    #[test]
    fn test_tally_empty() {
        let report = tally(Vec::new(), &[]);
        assert_eq!(report.overall_accuracy, 0.0);
        assert_eq!(report.validation_examples, 0);
    }
}
