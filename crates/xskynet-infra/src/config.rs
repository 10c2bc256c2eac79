//! Runtime configuration loader for X-Skynet.
//!
//! Reads `xskynet.toml` from a directory (the working directory in practice)
//! and deserializes it into [`RuntimeConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use thiserror::Error;
use xskynet_types::config::RuntimeConfig;

/// Name of the optional config file.
pub const CONFIG_FILE: &str = "xskynet.toml";

/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "XSKYNET_STATE_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load `{dir}/xskynet.toml`, returning `Ok(None)` when it does not exist.
pub async fn try_load_runtime_config(dir: &Path) -> Result<Option<RuntimeConfig>, ConfigError> {
    let path = dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(ConfigError::Read { path, source }),
    };

    toml::from_str::<RuntimeConfig>(&content)
        .map(Some)
        .map_err(|source| ConfigError::Parse { path, source })
}

/// Load runtime configuration from `{dir}/xskynet.toml`.
///
/// - Missing file: returns [`RuntimeConfig::default()`].
/// - Unreadable or malformed file: logs a warning and returns the default.
pub async fn load_runtime_config(dir: &Path) -> RuntimeConfig {
    match try_load_runtime_config(dir).await {
        Ok(Some(config)) => config,
        Ok(None) => {
            tracing::debug!(
                "No {CONFIG_FILE} found in {}, using defaults",
                dir.display()
            );
            RuntimeConfig::default()
        }
        Err(err) => {
            tracing::warn!("{err}, using defaults");
            RuntimeConfig::default()
        }
    }
}

/// Resolve the local state directory.
///
/// Priority:
/// 1. `XSKYNET_STATE_DIR` environment variable
/// 2. `config.state_dir`, relative to `cwd` unless absolute
pub fn resolve_state_dir(cwd: &Path, config: &RuntimeConfig) -> PathBuf {
    state_dir_from(std::env::var(STATE_DIR_ENV).ok(), cwd, config)
}

fn state_dir_from(env_value: Option<String>, cwd: &Path, config: &RuntimeConfig) -> PathBuf {
    match env_value.filter(|dir| !dir.trim().is_empty()) {
        Some(dir) => cwd.join(dir),
        None => cwd.join(&config.state_dir),
    }
}
