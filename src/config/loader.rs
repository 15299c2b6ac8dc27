//! Configuration Loader
//!
//! Handles loading and merging gateway configurations from multiple sources.

use crate::config::provider::GatewayConfig;
use crate::error::{GatewayError, Result};
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "LLMSWITCH_CONFIG";

/// Configuration loader with support for multiple sources
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config: GatewayConfig,
}

impl ConfigLoader {
    /// Create a new config loader and load from default locations
    pub fn new() -> Result<Self> {
        let mut loader = Self::default();
        loader.load_from_default_paths()?;
        Ok(loader)
    }

    /// Create a loader with a specific config file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let mut loader = Self::default();
        loader.load_from_file(path)?;
        Ok(loader)
    }

    /// Parse a configuration document directly
    pub fn parse(json: &str) -> Result<GatewayConfig> {
        serde_json::from_str(json)
            .map_err(|e| GatewayError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from default paths
    fn load_from_default_paths(&mut self) -> Result<()> {
        for path in Self::get_config_paths() {
            if path.exists() {
                tracing::debug!(path = %path.display(), "loading gateway config");
                self.load_from_file(&path)?;
            }
        }
        Ok(())
    }

    /// Get list of config paths to check, lowest precedence first
    fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // 1. Home directory
        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".llmswitch").join("config.json"));
        }

        // 2. User config directory
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("llmswitch").join("config.json"));
        }

        // 3. Current directory
        paths.push(PathBuf::from("llmswitch.json"));

        // 4. Environment variable
        if let Ok(custom_path) = std::env::var(CONFIG_PATH_ENV) {
            paths.push(PathBuf::from(custom_path));
        }

        paths
    }

    /// Load configuration from a specific file
    fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let parse_error =
            |e: serde_json::Error| GatewayError::Config(format!("Failed to parse {}: {}", path.display(), e));
        let value: serde_json::Value = serde_json::from_str(&content).map_err(parse_error)?;
        let sets_router = value.get("router").is_some();
        let config: GatewayConfig = serde_json::from_value(value).map_err(parse_error)?;

        self.merge_config(config, sets_router);
        Ok(())
    }

    /// Merge another config into this one (later configs override earlier).
    ///
    /// Router settings are replaced only when the later source has a `router` section.
    fn merge_config(&mut self, other: GatewayConfig, sets_router: bool) {
        for (name, provider) in other.providers {
            self.config.providers.insert(name, provider);
        }

        for (name, model) in other.models {
            self.config.models.insert(name, model);
        }

        if sets_router {
            self.config.router = other.router;
        }
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Take ownership of the configuration
    pub fn into_config(self) -> GatewayConfig {
        self.config
    }
}
