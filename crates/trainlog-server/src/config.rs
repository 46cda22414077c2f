//! Server configuration: TOML file + CLI overrides.

use crate::session::FlushSettings;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use trainlog_core::{TrainlogError, TrainlogResult, DEFAULT_BUCKET_SECS};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub flush: FlushSection,
}

/// `[storage]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// `[flush]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct FlushSection {
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    #[serde(default = "default_bucket_secs")]
    pub bucket_secs: u32,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for FlushSection {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
            bucket_secs: default_bucket_secs(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_period_ms() -> u64 {
    20_000
}
fn default_bucket_secs() -> u32 {
    DEFAULT_BUCKET_SECS
}
fn default_write_timeout_ms() -> u64 {
    5_000
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub flush: FlushSettings,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_data_dir: Option<&str>,
        cli_period_ms: Option<u64>,
        cli_bucket_secs: Option<u32>,
    ) -> TrainlogResult<Self> {
        let file_config = match config_path.map(expand_tilde) {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(&path)?;
                parse(&content)?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli_data_dir, cli_period_ms, cli_bucket_secs)
    }

    fn resolve(
        file_config: ConfigFile,
        cli_data_dir: Option<&str>,
        cli_period_ms: Option<u64>,
        cli_bucket_secs: Option<u32>,
    ) -> TrainlogResult<Self> {
        let data_dir = cli_data_dir
            .map(|s| s.to_string())
            .unwrap_or(file_config.storage.data_dir);
        let period_ms = cli_period_ms.unwrap_or(file_config.flush.period_ms);
        let bucket_secs = cli_bucket_secs.unwrap_or(file_config.flush.bucket_secs);

        if period_ms == 0 {
            return Err(TrainlogError::Other(
                "flush period must be greater than zero".to_string(),
            ));
        }
        let bucket_width = NonZeroU32::new(bucket_secs).ok_or_else(|| {
            TrainlogError::Other("bucket width must be greater than zero".to_string())
        })?;
        if file_config.flush.write_timeout_ms == 0 {
            return Err(TrainlogError::Other(
                "write timeout must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            data_dir: expand_tilde_str(&data_dir),
            flush: FlushSettings {
                period: Duration::from_millis(period_ms),
                bucket_width,
                write_timeout: Duration::from_millis(file_config.flush.write_timeout_ms),
            },
        })
    }
}

fn parse(content: &str) -> TrainlogResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| TrainlogError::Other(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
