use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const SINGLE_USER_ID: &str = "local";

fn default_fallback_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
        .join("wick")
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("wick")
        .join("config.json")
}

/// Whether documents live at the collection root or under a per-user prefix.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum UserMode {
    #[default]
    Single,
    Multi { user_id: String },
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub user_mode: UserMode,
    /// Quiet time before a coalesced edit is written.
    pub quiet_period_ms: u64,
    /// Interval of the idle clock and of the idle accumulator flush.
    pub idle_tick_ms: u64,
    /// How often a canary write is attempted while the breaker is open.
    pub canary_interval_ms: u64,
    pub fallback_dir: PathBuf,
    pub debug_logging: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_mode: UserMode::Single,
            quiet_period_ms: 1_000,
            idle_tick_ms: 60_000,
            canary_interval_ms: 60_000,
            fallback_dir: default_fallback_dir(),
            debug_logging: false,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn user_id(&self) -> &str {
        match &self.user_mode {
            UserMode::Single => SINGLE_USER_ID,
            UserMode::Multi { user_id } => user_id,
        }
    }

    pub fn paths(&self) -> DocumentPaths {
        DocumentPaths::for_mode(&self.user_mode)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms.max(1))
    }

    pub fn idle_tick(&self) -> Duration {
        Duration::from_millis(self.idle_tick_ms.max(1))
    }

    pub fn canary_interval(&self) -> Duration {
        Duration::from_millis(self.canary_interval_ms.max(1))
    }
}

/// Remote document layout for one identity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DocumentPaths {
    prefix: String,
}

impl DocumentPaths {
    pub fn for_mode(mode: &UserMode) -> Self {
        let prefix = match mode {
            UserMode::Single => String::new(),
            UserMode::Multi { user_id } => format!("users/{}/", user_id),
        };
        Self { prefix }
    }

    pub fn tasks_collection(&self) -> String {
        format!("{}tasks", self.prefix)
    }

    pub fn task_doc(&self, id: &str) -> String {
        format!("{}tasks/{}", self.prefix, id)
    }

    pub fn stats_doc(&self) -> String {
        format!("{}stats/aggregate", self.prefix)
    }

    pub fn canary_doc(&self) -> String {
        format!("{}meta/canary", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_user_mode() {
        let single = DocumentPaths::for_mode(&UserMode::Single);
        assert_eq!(single.tasks_collection(), "tasks");
        assert_eq!(single.task_doc("abc"), "tasks/abc");

        let multi = DocumentPaths::for_mode(&UserMode::Multi {
            user_id: "u1".into(),
        });
        assert_eq!(multi.tasks_collection(), "users/u1/tasks");
        assert_eq!(multi.stats_doc(), "users/u1/stats/aggregate");
        assert_eq!(multi.canary_doc(), "users/u1/meta/canary");
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.user_id(), SINGLE_USER_ID);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"user_mode":{"mode":"multi","user_id":"alice"},"quiet_period_ms":250}"#,
        )
        .unwrap();
        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.user_id(), "alice");
        assert_eq!(cfg.quiet_period(), Duration::from_millis(250));
        assert_eq!(cfg.idle_tick_ms, 60_000);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let cfg = EngineConfig {
            canary_interval_ms: 5_000,
            ..EngineConfig::default()
        };
        cfg.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), cfg);
    }
}
