//! Configuration management for the watermarking engine

use crate::error::{Result, WatermarkError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Prefix for environment overrides, e.g. `WATERMARK__WATERMARKING__ENABLED=false`
const ENV_PREFIX: &str = "WATERMARK";

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub watermarking: WatermarkingSettings,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Global watermarking toggles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatermarkingSettings {
    pub enabled: bool,
    pub apply_on_upload: bool,
    pub apply_on_import: bool,
    pub supported_types: BTreeSet<String>,
}

impl Default for WatermarkingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            apply_on_upload: true,
            apply_on_import: true,
            supported_types: ["image/jpeg", "image/png", "image/webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl WatermarkingSettings {
    /// Whether a media of this MIME type may be watermarked
    pub fn supports(&self, media_type: &str) -> bool {
        let normalized = media_type.trim().to_ascii_lowercase();
        self.supported_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(&normalized))
    }
}

/// SQLite database configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub enable_wal_mode: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("media-watermark")
            .join("watermark.db");
        Self {
            database_url: format!("sqlite:{}", path.display()),
            max_connections: 5,
            enable_wal_mode: true,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the files tree (`<root>/<derivative>/<storage id>`)
    pub files_root: PathBuf,
    /// Derivative renditions that receive a watermark, in processing order
    pub derivatives: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            files_root: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("media-watermark")
                .join("files"),
            derivatives: vec!["large".to_string(), "medium".to_string()],
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub output_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output_path: None,
        }
    }
}

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
    config: AppConfig,
}

impl ConfigManager {
    /// Create a configuration manager at the default location
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::with_path(config_path)
    }

    /// Create a configuration manager with a custom path
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let config = Self::load_or_create_config(&config_path)?;

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Get the current configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Path the configuration is read from and saved to
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Update the configuration
    pub fn update_config(&mut self, config: AppConfig) -> Result<()> {
        self.config = config;
        self.save()
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WatermarkError::Config {
                message: format!("Failed to create config directory: {}", e),
            })?;
        }

        let config_str =
            toml::to_string_pretty(&self.config).map_err(|e| WatermarkError::Config {
                message: format!("Failed to serialize config: {}", e),
            })?;

        std::fs::write(&self.config_path, config_str).map_err(|e| WatermarkError::Config {
            message: format!("Failed to write config file: {}", e),
        })?;

        tracing::info!("Configuration saved to {:?}", self.config_path);
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| WatermarkError::Config {
                message: "Could not determine config directory".to_string(),
            })?
            .join("media-watermark");

        Ok(config_dir.join("config.toml"))
    }

    /// Load the file (if any) with environment overrides layered on top
    fn load_or_create_config(path: &Path) -> Result<AppConfig> {
        let mut builder = ::config::Config::builder();
        if path.exists() {
            builder = builder.add_source(
                ::config::File::from(path.to_path_buf()).format(::config::FileFormat::Toml),
            );
            tracing::info!("Configuration loaded from {:?}", path);
        } else {
            tracing::info!("Using default configuration");
        }

        let layered = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| WatermarkError::Config {
                message: format!("Failed to read config file: {}", e),
            })?;

        layered
            .try_deserialize::<AppConfig>()
            .map_err(|e| WatermarkError::Config {
                message: format!("Failed to parse config file: {}", e),
            })
    }
}
