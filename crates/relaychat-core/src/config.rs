use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::ai::gemini::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::sandbox::SandboxLimits;

pub const DEFAULT_BIND: &str = "127.0.0.1:3000";
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub gemini_api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    /// Address the relay server listens on
    pub bind: String,
    /// Relay server the chat UI talks to
    pub server_url: String,
    /// Request timeout in seconds, 0 waits forever
    pub timeout_secs: u64,
    pub sandbox: SandboxLimits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            bind: DEFAULT_BIND.to_string(),
            server_url: DEFAULT_SERVER_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            sandbox: SandboxLimits::default(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Config file, then environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::get_config_path()?)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// A missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::get_config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Apply `GEMINI_API_KEY`, `RELAYCHAT_MODEL` and `RELAYCHAT_SERVER_URL`
    /// from `lookup`, ignoring empty values.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("GEMINI_API_KEY") {
            self.gemini_api_key = Some(key);
        }
        if let Some(model) = get("RELAYCHAT_MODEL") {
            self.model = model;
        }
        if let Some(url) = get("RELAYCHAT_SERVER_URL") {
            self.server_url = url;
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("relaychat"))
    }

    pub fn get_config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.model, "gemini-1.5-flash");
        assert_eq!(config.timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::new();
        config.model = "gemini-1.5-pro".to_string();
        config.timeout_secs = 0;
        config.sandbox.max_steps = 500;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.timeout(), None);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "bind": "0.0.0.0:8080", "sandbox": { "max_steps": 10 } }"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.bind, "0.0.0.0:8080");
        assert_eq!(config.sandbox.max_steps, 10);
        assert_eq!(config.sandbox.max_call_depth, SandboxLimits::default().max_call_depth);
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("GEMINI_API_KEY", "secret"),
            ("RELAYCHAT_MODEL", "gemini-2.0-flash"),
            ("RELAYCHAT_SERVER_URL", ""),
        ]
        .into_iter()
        .collect();

        let mut config = Config::new();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.gemini_api_key.as_deref(), Some("secret"));
        assert_eq!(config.model, "gemini-2.0-flash");
        // Empty values are ignored
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
    }
}
