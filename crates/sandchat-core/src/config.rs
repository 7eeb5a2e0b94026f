use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Result, anyhow};
use tracing::warn;

use crate::client::{DEFAULT_ENDPOINT, DEFAULT_MODEL, DEFAULT_SYSTEM_PROMPT};
use crate::controller::ChatSettings;
use crate::functions::{NodeExecutor, DEFAULT_TIMEOUT_SECS};

/// Environment variable checked before the config file for the API key.
pub const API_KEY_ENV: &str = "XAI_API_KEY";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub system_prompt: Option<String>,
    pub executor_timeout_secs: Option<u64>,
    pub node_binary: Option<String>,
    #[serde(default)]
    pub node_args: Vec<String>,
    pub log_level: Option<String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::new());
        }

        let config_content = fs::read_to_string(config_path)?;
        let config: Config = serde_json::from_str(&config_content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let config_content = serde_json::to_string_pretty(self)?;
        fs::write(config_path, config_content)?;
        Ok(())
    }

    pub fn save_api_key(key: &str) -> Result<()> {
        Self::update(&Self::get_config_path()?, |config| config.api_key = Some(key.to_string()))
    }

    pub fn save_model(model: &str) -> Result<()> {
        Self::update(&Self::get_config_path()?, |config| config.model = Some(model.to_string()))
    }

    /// Load, change one field, and save. An unreadable file is replaced.
    fn update(config_path: &Path, apply: impl FnOnce(&mut Self)) -> Result<()> {
        let mut config = Self::load_from(config_path).unwrap_or_else(|e| {
            warn!(path = %config_path.display(), error = %e, "unreadable config file replaced with defaults");
            Self::new()
        });
        apply(&mut config);
        config.save_to(config_path)
    }

    /// API key from the environment first, then the config file.
    pub fn resolve_api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.api_key.clone())
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT)
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn settings(&self) -> ChatSettings {
        ChatSettings {
            model: self.model().to_string(),
            system_prompt: self
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        }
    }

    pub fn executor(&self) -> NodeExecutor {
        NodeExecutor::new(self.node_binary.as_deref().unwrap_or("node"))
            .with_args(self.node_args.clone())
            .with_timeout(Duration::from_secs(
                self.executor_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ))
    }

    pub fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;

        Ok(config_dir.join("sandchat").join("config.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::new();
        assert_eq!(config.model(), "grok-beta");
        assert_eq!(config.endpoint(), "https://api.x.ai/v1/chat/completions");
        assert_eq!(config.log_level(), "info");
        assert_eq!(config.settings().system_prompt, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::new());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = Config {
            api_key: Some("xai-123".to_string()),
            model: Some("grok-2".to_string()),
            node_args: vec!["--permission".to_string()],
            ..Config::new()
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.settings().model, "grok-2");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"model":"grok-vision"}"#).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.model(), "grok-vision");
        assert!(loaded.api_key.is_none());
        assert!(loaded.node_args.is_empty());
    }

    #[test]
    fn test_update_keeps_other_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"model":"grok-2","log_level":"debug"}"#).unwrap();

        Config::update(&path, |c| c.api_key = Some("xai-new".to_string())).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.api_key.as_deref(), Some("xai-new"));
        assert_eq!(loaded.model(), "grok-2");
        assert_eq!(loaded.log_level(), "debug");
    }

    #[test]
    fn test_update_replaces_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert!(Config::load_from(&path).is_err());

        Config::update(&path, |c| c.model = Some("grok-2".to_string())).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.model(), "grok-2");
        assert!(loaded.api_key.is_none());
    }
}
