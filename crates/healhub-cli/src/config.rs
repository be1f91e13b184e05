//! Configuration loading with CLI overrides

use anyhow::Context;
use healhub_vision::VisionConfig;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "healhub.yaml";

/// Where the configuration was read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Defaults,
}

/// Load the vision configuration.
///
/// An explicit path must exist. The default file name is looked up in the
/// working directory, then in the user config directory
/// (`~/.config/healhub/healhub.yaml` on Linux).
pub fn load(config_path: Option<&Path>, models_dir: Option<&Path>) -> anyhow::Result<(VisionConfig, ConfigSource)> {
    let path = match config_path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("configuration file {} not found", path.display());
            }
            Some(path.to_path_buf())
        }
        None => default_locations().into_iter().find(|p| p.is_file()),
    };

    let (mut config, source) = match path {
        Some(path) => {
            let config = VisionConfig::from_file(&path)
                .with_context(|| format!("failed to load configuration from {}", path.display()))?;
            (config, ConfigSource::File(path))
        }
        None => (VisionConfig::default(), ConfigSource::Defaults),
    };

    // Apply CLI overrides
    if let Some(dir) = models_dir {
        config.models_dir = dir.to_path_buf();
    }

    Ok((config, source))
}

fn default_locations() -> Vec<PathBuf> {
    let mut locations = vec![PathBuf::from(DEFAULT_CONFIG_FILE)];
    if let Some(dir) = dirs::config_dir() {
        locations.push(dir.join("healhub").join(DEFAULT_CONFIG_FILE));
    }
    locations
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_explicit_file_with_override() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.yaml");
        std::fs::write(&path, "models_dir: ./from-file\nbinary_threshold: 0.7\n").unwrap();

        let (config, source) = load(Some(&path), None).unwrap();
        assert_eq!(config.models_dir, PathBuf::from("./from-file"));
        assert_eq!(config.binary_threshold, 0.7);
        assert_eq!(source, ConfigSource::File(path.clone()));

        let (config, _) = load(Some(&path), Some(Path::new("/srv/models"))).unwrap();
        assert_eq!(config.models_dir, PathBuf::from("/srv/models"));
        assert_eq!(config.binary_threshold, 0.7);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        assert!(load(Some(Path::new("/nonexistent/healhub.yaml")), None).is_err());
    }

    #[test]
    fn test_invalid_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "binary_threshold: [not, a, number]").unwrap();

        let err = load(Some(&path), None).unwrap_err();
        assert!(err.to_string().contains("failed to load configuration"));
    }
}
