use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Defaults read from `config.toml`. Command-line flags take precedence.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub workers: Option<usize>,
    pub extension: Option<String>,
    pub key_file: Option<PathBuf>,
}

impl Settings {
    /// Loads `explicit`, or the per-user config file if one exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let settings: Self = toml::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(settings)
    }

    pub fn workers(&self, flag: Option<usize>) -> usize {
        flag.or(self.workers).unwrap_or(1).max(1)
    }
}

fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "cipherset").map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "workers = 4\nextension = \"enc\"\n").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.workers(None), 4);
        assert_eq!(settings.workers(Some(2)), 2);
        assert_eq!(settings.extension.as_deref(), Some("enc"));
        assert!(settings.key_file.is_none());
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "wrokers = 4\n").unwrap();
        assert!(Settings::load(Some(&path)).is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(Settings::load(Some(Path::new("/nonexistent/cipherset.toml"))).is_err());
    }

    #[test]
    fn test_workers_never_zero() {
        assert_eq!(Settings::default().workers(Some(0)), 1);
        assert_eq!(Settings::default().workers(None), 1);
    }
}
