//! Host configuration (`host.toml`)
//!
//! ```toml
//! data_dir = "/var/lib/app-host"
//! log_filter = "info,ext_events=debug"
//!
//! [lifecycle]
//! suspend_timeout_secs = 10
//! ```

use ext_app::LifecycleConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DATABASE_FILE: &str = "applications.db";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directory holding the application database (default: platform data dir)
    pub data_dir: Option<PathBuf>,
    /// Tracing filter used when `APP_HOST_LOG` is unset
    pub log_filter: Option<String>,
    pub lifecycle: LifecycleConfig,
}

impl HostConfig {
    /// `<config_dir>/app-host/host.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("app-host").join("host.toml"))
    }

    pub fn from_str(source: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&source, path)
    }

    /// Load `path` if given, otherwise the default location when it exists
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::load(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn database_path(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.join(DATABASE_FILE),
            None => ext_storage::default_database_path(),
        }
    }
}
