//! Bootstrap configuration resolution
//!
//! Settings resolve in priority order:
//! 1. Command-line argument
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "SLIMGAP_CONFIG";

/// Platform config file location (`~/.config/slimgap/config.toml` on Linux)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("slimgap").join("config.toml"))
}

/// Locate the config file to load, if any
///
/// An explicit path (CLI, then `SLIMGAP_CONFIG`) is returned even if it does
/// not exist so the caller reports the error; the platform default is only
/// returned when present.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    default_config_path().filter(|p| p.exists())
}

/// Read and deserialize a TOML file
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Resolve one setting: CLI, then environment, then file, then default
///
/// An environment value that fails to parse is skipped with a warning.
pub fn resolve_value<T: FromStr>(
    cli_arg: Option<T>,
    env_var_name: &str,
    file_value: Option<T>,
    default: T,
) -> T {
    if let Some(value) = cli_arg {
        return value;
    }

    if let Ok(raw) = std::env::var(env_var_name) {
        match raw.parse::<T>() {
            Ok(value) => return value,
            Err(_) => tracing::warn!("Ignoring unparsable {}={:?}", env_var_name, raw),
        }
    }

    file_value.unwrap_or(default)
}
