// src/core/paths.rs

use crate::constants::{CONFIG_DIR_NAME, DAEMON_CONFIG_FILENAME, SCHEME_FILENAME};
use lazy_static::lazy_static;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

lazy_static! {
    static ref KSHELL_CONFIG_DIR: Mutex<Option<PathBuf>> = Mutex::new(None);
}

#[derive(Error, Debug)]
pub enum PathError {
    #[error("Could not find system config directory.")]
    ConfigDirNotFound,
    #[error("Failed to expand path '{path}': {reason}")]
    Expansion { path: String, reason: String },
}

/// Returns the path to the kshell configuration directory (`~/.config/kshell`).
///
/// Memoized: the first call computes the path, later calls return the cached
/// value. The directory is not created; every file in it is optional.
pub fn get_kshell_config_dir() -> Result<PathBuf, PathError> {
    let mut cached = KSHELL_CONFIG_DIR
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);

    if let Some(path) = &*cached {
        return Ok(path.clone());
    }

    let config_path = dirs::config_dir()
        .ok_or(PathError::ConfigDirNotFound)?
        .join(CONFIG_DIR_NAME);
    *cached = Some(config_path.clone());
    Ok(config_path)
}

/// `<config_dir>/kshell/kshelld.toml`
pub fn get_daemon_config_path() -> Result<PathBuf, PathError> {
    get_kshell_config_dir().map(|dir| dir.join(DAEMON_CONFIG_FILENAME))
}

/// `<config_dir>/kshell/scheme.toml`
pub fn get_default_scheme_path() -> Result<PathBuf, PathError> {
    get_kshell_config_dir().map(|dir| dir.join(SCHEME_FILENAME))
}

/// Expands `~` and environment variables (`$VAR`, `${VAR}`) in a path.
pub fn expand_path(template: &str) -> Result<PathBuf, PathError> {
    let expanded = shellexpand::full(template).map_err(|e| PathError::Expansion {
        path: template.to_string(),
        reason: e.to_string(),
    })?;
    Ok(PathBuf::from(expanded.into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_path_resolves_variables() {
        // Setup
        let home = dirs::home_dir().unwrap();

        // Execute
        let expanded = expand_path("~/kshell/scheme.toml").unwrap();

        // Assert
        assert_eq!(expanded, home.join("kshell/scheme.toml"));
        assert_eq!(expand_path("/plain/path").unwrap(), PathBuf::from("/plain/path"));
    }

    #[test]
    fn test_expand_path_rejects_unknown_variable() {
        let result = expand_path("$KSHELL_TEST_SURELY_UNDEFINED_VAR/x");
        assert!(matches!(result, Err(PathError::Expansion { .. })));
    }

    #[test]
    fn test_config_paths_share_directory() {
        let dir = get_kshell_config_dir().unwrap();
        assert!(dir.ends_with(CONFIG_DIR_NAME));
        assert_eq!(get_daemon_config_path().unwrap(), dir.join(DAEMON_CONFIG_FILENAME));
        assert_eq!(get_default_scheme_path().unwrap(), dir.join(SCHEME_FILENAME));
    }
}
