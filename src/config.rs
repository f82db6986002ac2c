use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub mailbox: MailboxConfig,
    pub executor: ExecutorConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MailboxConfig {
    pub base_dir: PathBuf,
    pub poll_interval_ms: u64,
    // How often the daemon sweeps old files, and how old "old" is
    pub cleanup_interval_secs: u64,
    pub max_age_hours: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExecutorConfig {
    pub timeout_secs: u64,
    pub stdout_preview: usize,
    pub stderr_preview: usize,
    // Defaults to the invoking user's home directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DisplayConfig {
    pub language: String,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/tmp/claude-discord"),
            poll_interval_ms: 500,
            cleanup_interval_secs: 3600,
            max_age_hours: 24,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            stdout_preview: 1000,
            stderr_preview: 500,
            working_dir: None,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            language: "auto".to_string(),
        }
    }
}

impl MailboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn max_age(&self) -> Duration {
        hours(self.max_age_hours)
    }
}

pub fn hours(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(3600))
}

impl Config {
    /// Loads `~/.mailbridge/config.toml`, writing the defaults on first use,
    /// then applies environment overrides.
    pub fn new() -> Result<Self> {
        let mut config = Self::load_or_create(&Self::get_config_path())?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_or_create(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = fs::read_to_string(config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("invalid config {}", config_path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_path)?;
            Ok(config)
        }
    }

    pub fn save(&self, config_path: &Path) -> Result<()> {
        if let Some(config_dir) = config_path.parent() {
            fs::create_dir_all(config_dir)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(config_path, content)?;
        Ok(())
    }

    fn get_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mailbridge")
            .join("config.toml")
    }

    /// `MAILBRIDGE_COMM_DIR` (or the older `COMM_DIR`) and `MAILBRIDGE_LANG`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(dir) = non_empty("MAILBRIDGE_COMM_DIR").or_else(|| non_empty("COMM_DIR")) {
            self.mailbox.base_dir = PathBuf::from(dir);
        }
        if let Some(lang) = non_empty("MAILBRIDGE_LANG") {
            self.display.language = lang;
        }
    }

    pub fn get_effective_language(&self) -> String {
        if self.display.language == "auto" {
            // Try to get system language
            std::env::var("LANG")
                .unwrap_or_else(|_| "en_US".to_string())
                .split('.')
                .next()
                .unwrap_or("en")
                .to_string()
        } else {
            self.display.language.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn first_load_writes_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.toml");
        let config = Config::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.executor.timeout_secs, 300);
        assert_eq!(config.mailbox.base_dir, PathBuf::from("/tmp/claude-discord"));

        let again = Config::load_or_create(&path).unwrap();
        assert_eq!(again.mailbox.poll_interval_ms, 500);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "[executor]\ntimeout_secs = 5\n").unwrap();
        let config = Config::load_or_create(&path).unwrap();
        assert_eq!(config.executor.timeout_secs, 5);
        assert_eq!(config.executor.stdout_preview, 1000);
        assert_eq!(config.mailbox.max_age(), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn huge_max_age_saturates() {
        let mut config = Config::default();
        config.mailbox.max_age_hours = u64::MAX;
        assert_eq!(config.mailbox.max_age(), Duration::from_secs(u64::MAX));
        assert_eq!(hours(2), Duration::from_secs(7200));
    }

    #[test]
    fn invalid_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "[executor\n").unwrap();
        assert!(Config::load_or_create(&path).is_err());
    }

    #[test]
    fn env_overrides_base_dir_and_language() {
        let env: HashMap<&str, &str> = [("COMM_DIR", "/srv/old"), ("MAILBRIDGE_LANG", "ja")].into();
        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.mailbox.base_dir, PathBuf::from("/srv/old"));
        assert_eq!(config.get_effective_language(), "ja");

        let env: HashMap<&str, &str> = [("COMM_DIR", "/srv/old"), ("MAILBRIDGE_COMM_DIR", "/srv/new")].into();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.mailbox.base_dir, PathBuf::from("/srv/new"));
    }
}
