//! TOML configuration shared by the library entry points and the CLI.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::journal::JournalOptions;
use crate::primitives::pager::CacheOptions;
use crate::storage::extent::ExtentTreeOptions;
use crate::storage::volume::VolumeOptions;

/// Filter installed when neither the config nor `RUST_LOG` names one.
pub const DEFAULT_LOG_FILTER: &str = "extmap=warn";

/// Every tunable of a volume session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Geometry used by `format`.
    pub volume: VolumeOptions,
    /// Per-tree knobs.
    pub tree: ExtentTreeOptions,
    /// Transaction credits and restart behaviour.
    pub journal: JournalOptions,
    /// Block cache sizing.
    pub cache: CacheOptions,
    /// `tracing` filter directive.
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            volume: VolumeOptions::default(),
            tree: ExtentTreeOptions::default(),
            journal: JournalOptions::default(),
            cache: CacheOptions::default(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl Config {
    /// Loads `explicit`, or the default location when it exists. A missing
    /// default file yields the built-in defaults; a missing explicit file
    /// is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => read_file(path),
            None => match default_config_path() {
                Some(path) if path.exists() => read_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Parses a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Writes the configuration to `path`, creating parent directories.
    pub fn persist(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let serialized =
            toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })?;
        fs::write(path, serialized).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// `<config dir>/extmap/config.toml`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("extmap").join("config.toml"))
}

/// Failures while reading or writing the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// File is not valid TOML for [`Config`].
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// Serialisation failed.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// Underlying error.
        source: toml::ser::Error,
    },
    /// File could not be written.
    #[error("failed to write config {path}: {source}")]
    Write {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Parent directory could not be created.
    #[error("failed to create config directory {path}: {source}")]
    CreateDir {
        /// Directory that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            log_filter = "extmap=debug"

            [tree]
            max_zeroout_kb = 0

            [volume]
            block_size = 1024
            "#,
        )
        .unwrap();
        assert_eq!(config.log_filter, "extmap=debug");
        assert_eq!(config.tree.max_zeroout_kb, 0);
        assert!(config.tree.cache_holes);
        assert_eq!(config.volume.block_size, 1024);
        assert_eq!(config.volume.cluster_ratio, 1);
        assert_eq!(config.journal.initial_credits, 64);
    }

    #[test]
    fn persist_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.cache.capacity_blocks = 7;
        config.journal.restart_every = 3;
        config.persist(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.cache.capacity_blocks, 7);
        assert_eq!(loaded.journal.restart_every, 3);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn bad_toml_reports_parse_error() {
        assert!(matches!(
            Config::from_toml("tree = 3"),
            Err(ConfigError::Parse { .. })
        ));
    }
}
