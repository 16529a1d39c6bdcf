//! Local key/value store used while the remote store is unreachable.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::task::{Stats, Task};
use crate::error::FallbackError;

use super::backlog::Backlog;

/// String values by key; last write wins, no merging.
pub trait FallbackStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, FallbackError>;
    fn set(&self, key: &str, value: &str) -> Result<(), FallbackError>;
    fn remove(&self, key: &str) -> Result<(), FallbackError>;
}

/// Keys are scoped per identity as `{field}_{user_id}`.
pub fn scoped_key(field: &str, user_id: &str) -> String {
    format!("{}_{}", field, user_id)
}

pub const TASKS: &str = "tasks";
pub const TOTAL_FOCUS_TIME: &str = "totalFocusTime";
pub const TOTAL_IDLING_TIME: &str = "totalIdlingTime";
pub const LAST_RESET_TIME: &str = "lastResetTime";
pub const PENDING_IDLING_TIME: &str = "pendingIdlingTime";
pub const QUOTA_EXCEEDED: &str = "quotaExceeded";
pub const BACKLOG: &str = "backlog";

/// One file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileFallback {
    dir: PathBuf,
}

impl FileFallback {
    pub fn open(dir: &Path) -> Result<Self, FallbackError> {
        std::fs::create_dir_all(dir)?;
        log::debug!("Opened fallback store at {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Bytes outside `[A-Za-z0-9_-]` are written as `%XX`, so distinct keys
    /// never share a file.
    fn path_for(&self, key: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len() + 5);
        for b in key.bytes() {
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
                name.push(char::from(b));
            } else {
                name.push_str(&format!("%{:02X}", b));
            }
        }
        name.push_str(".json");
        self.dir.join(name)
    }
}

impl FallbackStore for FileFallback {
    fn get(&self, key: &str) -> Result<Option<String>, FallbackError> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), FallbackError> {
        // Write-then-rename so a crash never leaves a half-written value.
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), FallbackError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Typed access to the fallback keys of one identity.
#[derive(Clone)]
pub struct ScopedFallback {
    store: Arc<dyn FallbackStore>,
    user_id: String,
}

impl ScopedFallback {
    pub fn new(store: Arc<dyn FallbackStore>, user_id: impl Into<String>) -> Self {
        Self {
            store,
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn key(&self, field: &str) -> String {
        scoped_key(field, &self.user_id)
    }

    fn read<T: DeserializeOwned>(&self, field: &str) -> Result<Option<T>, FallbackError> {
        let key = self.key(field);
        match self.store.get(&key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| FallbackError::Corrupt { key, source }),
            None => Ok(None),
        }
    }

    fn write<T: Serialize + ?Sized>(&self, field: &str, value: &T) -> Result<(), FallbackError> {
        let json = serde_json::to_string(value)?;
        self.store.set(&self.key(field), &json)
    }

    pub fn load_tasks(&self) -> Result<Option<Vec<Task>>, FallbackError> {
        self.read(TASKS)
    }

    pub fn save_tasks(&self, tasks: &[Task]) -> Result<(), FallbackError> {
        self.write(TASKS, tasks)
    }

    /// Stats are kept as three separate keys.
    pub fn load_stats(&self) -> Result<Option<Stats>, FallbackError> {
        let focus: Option<u64> = self.read(TOTAL_FOCUS_TIME)?;
        let idling: Option<u64> = self.read(TOTAL_IDLING_TIME)?;
        let reset: Option<Option<DateTime<Utc>>> = self.read(LAST_RESET_TIME)?;
        if focus.is_none() && idling.is_none() && reset.is_none() {
            return Ok(None);
        }
        Ok(Some(Stats {
            total_focus_time: focus.unwrap_or(0),
            total_idling_time: idling.unwrap_or(0),
            last_reset_time: reset.flatten(),
        }))
    }

    pub fn save_stats(&self, stats: &Stats) -> Result<(), FallbackError> {
        self.write(TOTAL_FOCUS_TIME, &stats.total_focus_time)?;
        self.write(TOTAL_IDLING_TIME, &stats.total_idling_time)?;
        self.write(LAST_RESET_TIME, &stats.last_reset_time)
    }

    pub fn load_pending_idle(&self) -> Result<u64, FallbackError> {
        Ok(self.read(PENDING_IDLING_TIME)?.unwrap_or(0))
    }

    pub fn save_pending_idle(&self, ms: u64) -> Result<(), FallbackError> {
        self.write(PENDING_IDLING_TIME, &ms)
    }

    pub fn quota_exceeded(&self) -> Result<bool, FallbackError> {
        Ok(self.read(QUOTA_EXCEEDED)?.unwrap_or(false))
    }

    pub fn set_quota_exceeded(&self, exceeded: bool) -> Result<(), FallbackError> {
        if exceeded {
            self.write(QUOTA_EXCEEDED, &true)
        } else {
            self.store.remove(&self.key(QUOTA_EXCEEDED))
        }
    }

    pub fn load_backlog(&self) -> Result<Backlog, FallbackError> {
        Ok(self.read(BACKLOG)?.unwrap_or_default())
    }

    pub fn save_backlog(&self, backlog: &Backlog) -> Result<(), FallbackError> {
        if backlog.is_empty() {
            self.store.remove(&self.key(BACKLOG))
        } else {
            self.write(BACKLOG, backlog)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{ChecklistItem, TaskId, display_order};
    use chrono::TimeZone;

    fn scoped(dir: &Path, user: &str) -> ScopedFallback {
        ScopedFallback::new(Arc::new(FileFallback::open(dir).unwrap()), user)
    }

    #[test]
    fn keys_are_scoped_per_user() {
        assert_eq!(scoped_key("totalFocusTime", "u42"), "totalFocusTime_u42");
        assert_eq!(scoped_key(TASKS, "u42"), "tasks_u42");
    }

    #[test]
    fn file_store_roundtrip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileFallback::open(dir.path()).unwrap();
        assert_eq!(store.get("k_u").unwrap(), None);
        store.set("k_u", "v1").unwrap();
        store.set("k_u", "v2").unwrap();
        assert_eq!(store.get("k_u").unwrap().as_deref(), Some("v2"));
        store.remove("k_u").unwrap();
        store.remove("k_u").unwrap();
        assert_eq!(store.get("k_u").unwrap(), None);
    }

    #[test]
    fn users_differing_in_punctuation_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let at = scoped(dir.path(), "alice@x.com");
        let plus = scoped(dir.path(), "alice+x.com");
        at.set_quota_exceeded(true).unwrap();
        assert!(at.quota_exceeded().unwrap());
        assert!(!plus.quota_exceeded().unwrap());

        let store = FileFallback::open(dir.path()).unwrap();
        assert_ne!(store.path_for("tasks_a@b"), store.path_for("tasks_a+b"));
        assert_ne!(store.path_for("tasks_a%40b"), store.path_for("tasks_a@b"));
        assert_eq!(
            store.path_for("tasks_alice@x.com").file_name().unwrap(),
            "tasks_alice%40x%2Ecom.json"
        );
    }

    #[test]
    fn mirror_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let created = Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap();
        let mut a = Task::new(TaskId::from("a"), "first", created);
        a.order = 1;
        a.elapsed_time = 12_345;
        a.completed = true;
        let mut b = Task::new(TaskId::from("b"), "second", created);
        b.order = 0;
        b.checklist = Some(vec![ChecklistItem {
            prompt: "Check".into(),
            outcome: "ok".into(),
            rationale: "because".into(),
            completed: false,
        }]);
        let mut tasks = vec![b, a];
        tasks.sort_by(display_order);

        scoped(dir.path(), "u1").save_tasks(&tasks).unwrap();
        let mut loaded = scoped(dir.path(), "u1").load_tasks().unwrap().unwrap();
        loaded.sort_by(display_order);
        assert_eq!(loaded, tasks);

        assert!(scoped(dir.path(), "u2").load_tasks().unwrap().is_none());
    }

    #[test]
    fn stats_use_separate_keys() {
        let dir = tempfile::tempdir().unwrap();
        let fb = scoped(dir.path(), "u1");
        assert!(fb.load_stats().unwrap().is_none());
        let stats = Stats {
            total_focus_time: 10,
            total_idling_time: 20,
            last_reset_time: None,
        };
        fb.save_stats(&stats).unwrap();
        assert_eq!(fb.load_stats().unwrap(), Some(stats));
        assert!(dir.path().join("totalFocusTime_u1.json").exists());
    }

    #[test]
    fn corrupt_value_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileFallback::open(dir.path()).unwrap();
        store.set("tasks_u1", "[{").unwrap();
        let fb = ScopedFallback::new(Arc::new(store), "u1");
        assert!(matches!(fb.load_tasks(), Err(FallbackError::Corrupt { .. })));
    }

    #[test]
    fn quota_flag_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let fb = scoped(dir.path(), "u1");
        assert!(!fb.quota_exceeded().unwrap());
        fb.set_quota_exceeded(true).unwrap();
        assert!(fb.quota_exceeded().unwrap());
        fb.set_quota_exceeded(false).unwrap();
        assert!(!fb.quota_exceeded().unwrap());
    }
}
