//! Cohort configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CohortError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CohortConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl CohortConfig {
    /// Load config from the default path (~/.cohort/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CohortError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CohortError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CohortError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Cohort home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cohort")
    }
}

/// Scheduler and workflow engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Execution records kept in memory per engine.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Upper bound for a single action's transport call. Absent = unbounded.
    #[serde(default)]
    pub action_timeout_secs: Option<u64>,
    /// SQLite database holding rules, recurring tasks and execution history.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_tick_interval() -> u64 { 60 }
fn default_history_limit() -> usize { 200 }
fn default_db_path() -> String { "~/.cohort/scheduler.db".into() }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            history_limit: default_history_limit(),
            action_timeout_secs: None,
            db_path: default_db_path(),
        }
    }
}

/// Dashboard notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Notifications kept in the in-memory history.
    #[serde(default = "default_notify_history")]
    pub history_limit: usize,
    /// Channel used when an action does not name one.
    #[serde(default = "default_channel")]
    pub default_channel: String,
}

fn default_notify_history() -> usize { 100 }
fn default_channel() -> String { "dashboard".into() }

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            history_limit: default_notify_history(),
            default_channel: default_channel(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CohortConfig::default();
        assert_eq!(config.scheduler.tick_interval_secs, 60);
        assert_eq!(config.scheduler.history_limit, 200);
        assert!(config.scheduler.action_timeout_secs.is_none());
        assert_eq!(config.notify.default_channel, "dashboard");
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [scheduler]
            tick_interval_secs = 15
            action_timeout_secs = 30
            db_path = "/var/lib/cohort/scheduler.db"

            [notify]
            default_channel = "slack"
        "#;

        let config: CohortConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scheduler.tick_interval_secs, 15);
        assert_eq!(config.scheduler.action_timeout_secs, Some(30));
        assert_eq!(config.scheduler.db_path, "/var/lib/cohort/scheduler.db");
        assert_eq!(config.scheduler.history_limit, 200);
        assert_eq!(config.notify.default_channel, "slack");
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: CohortConfig = toml::from_str("").unwrap();
        assert_eq!(config.notify.history_limit, 100);
        assert_eq!(config.scheduler.db_path, "~/.cohort/scheduler.db");
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir()
            .join(format!("cohort-config-{}", std::process::id()))
            .join("config.toml");
        let mut config = CohortConfig::default();
        config.scheduler.tick_interval_secs = 5;
        config.save_to(&path).unwrap();

        let loaded = CohortConfig::load_from(&path).unwrap();
        assert_eq!(loaded.scheduler.tick_interval_secs, 5);
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_load_from_missing_file_is_config_error() {
        let err = CohortConfig::load_from(Path::new("/nonexistent/cohort.toml")).unwrap_err();
        assert!(matches!(err, CohortError::Config(_)));
    }

    #[test]
    fn test_home_dir() {
        let home = CohortConfig::home_dir();
        assert!(home.to_string_lossy().contains("cohort"));
    }
}
