//! Class catalog: the index <-> label mapping of the multiclass model

use healhub_core::Result;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};

/// Where the catalog was resolved from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogSource {
    Manifest,
    Checkpoint,
    ClassesFile,
    Dataset,
    Empty,
}

/// Ordered, duplicate-free list of class names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassCatalog {
    classes: Vec<String>,
    source: CatalogSource,
}

impl ClassCatalog {
    /// Build a catalog, dropping repeated names after their first occurrence
    pub fn new(classes: impl IntoIterator<Item = String>, source: CatalogSource) -> Self {
        let mut seen = HashSet::new();
        let classes = classes
            .into_iter()
            .filter(|c| seen.insert(c.clone()))
            .collect();

        Self { classes, source }
    }

    pub fn empty() -> Self {
        Self {
            classes: Vec::new(),
            source: CatalogSource::Empty,
        }
    }

    /// Resolve the catalog from the first source that has one.
    ///
    /// Precedence: manifest class list, class list saved in the primary
    /// checkpoint, `classes.json`, dataset sub-directories, empty.
    /// Unreadable sources are skipped with a warning.
    pub fn resolve(
        manifest_classes: &[String],
        checkpoint_classes: &[String],
        classes_file: &Path,
        dataset_dir: Option<&Path>,
    ) -> Self {
        if !manifest_classes.is_empty() {
            return Self::new(manifest_classes.iter().cloned(), CatalogSource::Manifest);
        }

        if !checkpoint_classes.is_empty() {
            return Self::new(checkpoint_classes.iter().cloned(), CatalogSource::Checkpoint);
        }

        match Self::from_classes_file(classes_file) {
            Ok(Some(catalog)) => return catalog,
            Ok(None) => {}
            Err(e) => warn!("Ignoring class manifest {}: {}", classes_file.display(), e),
        }

        if let Some(dir) = dataset_dir {
            match Self::from_dataset_dir(dir) {
                Ok(Some(catalog)) => return catalog,
                Ok(None) => {}
                Err(e) => warn!("Ignoring dataset directory {}: {}", dir.display(), e),
            }
        }

        debug!("No class catalog available");
        Self::empty()
    }

    /// Read a JSON array of class names
    pub fn from_classes_file(path: &Path) -> Result<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)?;
        let classes: Vec<String> = serde_json::from_str(&content)?;
        if classes.is_empty() {
            return Ok(None);
        }

        Ok(Some(Self::new(classes, CatalogSource::ClassesFile)))
    }

    /// Sorted names of the sub-directories of a training-data root
    pub fn from_dataset_dir(dir: &Path) -> Result<Option<Self>> {
        if !dir.is_dir() {
            return Ok(None);
        }

        let mut classes = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    classes.push(name.to_string());
                }
            }
        }

        if classes.is_empty() {
            return Ok(None);
        }

        classes.sort();
        Ok(Some(Self::new(classes, CatalogSource::Dataset)))
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.classes.get(index).map(String::as_str)
    }

    /// Labels for an output of width `n`.
    ///
    /// Indices past the end of the catalog are named `class_<i>`.
    pub fn labels_for(&self, n: usize) -> Vec<String> {
        (0..n)
            .map(|i| {
                self.label(i)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("class_{}", i))
            })
            .collect()
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn source(&self) -> CatalogSource {
        self.source
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl Default for ClassCatalog {
    fn default() -> Self {
        Self::empty()
    }
}
