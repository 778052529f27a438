use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use todu::db::FreshnessPolicy;
use todu::sync::RepositoryOptions;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Sync server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the task API (e.g., "https://tasks.example.com/api/v1")
    pub server_url: Option<String>,
    /// Bearer token for the API
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Seconds between background sync cycles
    pub interval_secs: u64,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Mutations per batched request; 0 sends them one at a time
    pub batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            api_key: None,
            interval_secs: 60,
            timeout_secs: 15,
            batch_size: 0,
        }
    }
}

impl SyncConfig {
    /// Returns true if a server to sync with has been set
    pub fn is_configured(&self) -> bool {
        self.server_url.is_some()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn repository_options(&self) -> RepositoryOptions {
        RepositoryOptions {
            batch_size: self.batch_size,
        }
    }
}

/// How long cached collections stay fresh
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub task_ttl_secs: u64,
    pub project_ttl_secs: u64,
    pub section_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            task_ttl_secs: 60,
            project_ttl_secs: 300,
            section_ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn policy(&self) -> FreshnessPolicy {
        FreshnessPolicy {
            project_ttl: Duration::from_secs(self.project_ttl_secs),
            section_ttl: Duration::from_secs(self.section_ttl_secs),
            task_ttl: Duration::from_secs(self.task_ttl_secs),
        }
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the SQLite cache
    pub database_path: ConfigValue<PathBuf>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    pub sync: SyncConfig,
    pub cache: CacheConfig,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    sync: Option<SyncConfig>,
    cache: Option<CacheConfig>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut database_path = ConfigValue::new(
            Self::default_data_dir().join("todu.db"),
            ConfigSource::Default,
        );
        let mut config_file = None;
        let mut sync = SyncConfig::default();
        let mut cache = CacheConfig::default();

        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(db_path) = file_config.database_path {
                // Relative to the config file's directory
                let resolved_path = if db_path.is_relative() {
                    path.parent().map(|p| p.join(&db_path)).unwrap_or(db_path)
                } else {
                    db_path
                };
                database_path = ConfigValue::new(resolved_path, ConfigSource::File);
            }
            if let Some(sync_config) = file_config.sync {
                sync = sync_config;
            }
            if let Some(cache_config) = file_config.cache {
                cache = cache_config;
            }
        }

        if let Ok(db_path) = std::env::var("TODU_DATABASE_PATH") {
            database_path = ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("TODU_SYNC_URL") {
            sync.server_url = Some(url);
        }
        if let Ok(key) = std::env::var("TODU_SYNC_API_KEY") {
            sync.api_key = Some(key);
        }

        Ok(Self {
            database_path,
            config_file,
            sync,
            cache,
        })
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/todu/
    /// - macOS: ~/Library/Application Support/todu/
    /// - Windows: %APPDATA%/todu/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("todu")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/todu/
    /// - macOS: ~/Library/Application Support/todu/
    /// - Windows: %APPDATA%/todu/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("todu")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
