//! TOML-based configuration for sqlbridge.
//!
//! Supports a config file (sqlbridge.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [worker]
//! transport = "process"          # or "thread" (default)
//! path = "${HOME}/bin/sqlbridge"
//! request_timeout_secs = 30
//!
//! [storage]
//! path = "./data/store.db"
//! key = "database"
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the worker executable searched for when no path is configured.
const WORKER_BINARY: &str = "sqlbridge";

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Worker binary not found")]
    WorkerNotFound,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Worker configuration.
    pub worker: WorkerSettings,

    /// Image storage configuration.
    pub storage: StorageSettings,

    /// Logging configuration.
    pub logging: LoggingSettings,
}

/// Where the database engine runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Dedicated thread in this process.
    #[default]
    Thread,
    /// Child process speaking NDJSON on stdio.
    Process,
}

/// Worker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub transport: Transport,

    /// Path to the worker binary (process transport only).
    pub path: Option<String>,

    /// Seconds to wait for a response before failing a request.
    pub request_timeout_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            transport: Transport::Thread,
            path: None,
            request_timeout_secs: 30,
        }
    }
}

impl WorkerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Get the worker binary path.
    ///
    /// Returns the configured path if set, otherwise searches common
    /// locations for the `sqlbridge` binary.
    pub fn worker_path(&self) -> Result<PathBuf, SettingsError> {
        if let Some(path) = &self.path {
            return Ok(PathBuf::from(expand_env_vars(path)?));
        }

        let candidates = [
            format!("./{}", WORKER_BINARY),
            format!("./target/release/{}", WORKER_BINARY),
            format!("./target/debug/{}", WORKER_BINARY),
        ];

        for candidate in candidates {
            let path = PathBuf::from(candidate);
            if path.is_file() {
                return Ok(path);
            }
        }

        Err(SettingsError::WorkerNotFound)
    }
}

/// Image storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Path of the store file (supports ${ENV_VAR} expansion).
    pub path: Option<String>,

    /// Key the database image is stored under.
    pub key: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: None,
            key: "database".to_string(),
        }
    }
}

impl StorageSettings {
    /// Resolve the store file path, defaulting to `~/.sqlbridge/store.db`.
    pub fn store_path(&self) -> Result<PathBuf, SettingsError> {
        if let Some(path) = &self.path {
            return Ok(PathBuf::from(expand_env_vars(path)?));
        }

        dirs::home_dir()
            .map(|home| home.join(".sqlbridge").join("store.db"))
            .ok_or_else(|| SettingsError::InvalidConfig("no home directory for the store".into()))
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter directive, e.g. "info" or "sqlbridge=debug". `RUST_LOG` wins.
    pub level: String,

    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `SQLBRIDGE_CONFIG`
    /// 2. `./sqlbridge.toml`
    /// 3. `~/.config/sqlbridge/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("SQLBRIDGE_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("sqlbridge.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("sqlbridge").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.next_if_eq(&'{').is_some() {
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
        } else {
            while let Some(ch) = chars.next_if(|ch| ch.is_alphanumeric() || *ch == '_') {
                var_name.push(ch);
            }
            if var_name.is_empty() {
                // Lone $, keep it
                result.push('$');
                continue;
            }
        }

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
