// src/system/daemon_config.rs

use crate::core::paths::{self, PathError};
use crate::models::DaemonConfig;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Loads the daemon configuration.
///
/// An explicit path must exist. Without one, `<config_dir>/kshell/kshelld.toml`
/// is read if present, otherwise the defaults are used.
pub fn load_daemon_config(explicit: Option<&Path>) -> Result<DaemonConfig, ConfigError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let default_path = paths::get_daemon_config_path()?;
            if !default_path.exists() {
                log::debug!(
                    "No config file at '{}', using defaults.",
                    default_path.display()
                );
                return DaemonConfig::default().validated();
            }
            default_path
        }
    };

    log::debug!("Loading daemon config from '{}'", path.display());
    let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    let config: DaemonConfig =
        toml::from_str(&content).map_err(|source| ConfigError::Toml { path, source })?;
    config.validated()
}

impl DaemonConfig {
    /// Rejects values the daemon cannot work with.
    pub fn validated(self) -> Result<Self, ConfigError> {
        if self.max_children == 0 {
            return Err(ConfigError::Invalid {
                key: "max_children",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_payload == 0 {
            return Err(ConfigError::Invalid {
                key: "max_payload",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.socket_path.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "socket_path",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(self)
    }

    /// The socket path with `~` and variables expanded.
    pub fn resolved_socket_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(paths::expand_path(&self.socket_path)?)
    }

    /// The scheme path, expanded, or the default location.
    pub fn resolved_scheme_path(&self) -> Result<PathBuf, ConfigError> {
        match self.scheme.as_deref() {
            Some(scheme) => Ok(paths::expand_path(scheme)?),
            None => Ok(paths::get_default_scheme_path()?),
        }
    }

    pub fn resolved_shell(&self) -> Result<PathBuf, ConfigError> {
        Ok(paths::expand_path(&self.shell)?)
    }
}
