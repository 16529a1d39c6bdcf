use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

const LOCAL_ID_PREFIX: &str = "local-";

/// Stable task identifier. Normally assigned by the remote store; tasks created
/// while offline carry a client-generated `local-` id instead.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn local() -> Self {
        Self(format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One entry of an imported checklist. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistItem {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub deadline: Option<NaiveDateTime>,
    pub completed: bool,
    /// Accumulated tracked time in milliseconds.
    pub elapsed_time: u64,
    pub is_tracking: bool,
    pub tracking_start_time: Option<DateTime<Utc>>,
    pub order: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checklist: Option<Vec<ChecklistItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl Task {
    pub fn new(id: TaskId, description: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            description: description.into(),
            deadline: None,
            completed: false,
            elapsed_time: 0,
            is_tracking: false,
            tracking_start_time: None,
            order: 0,
            created_at,
            checklist: None,
            link: None,
        }
    }

    /// Document fields as written to the remote store (the id lives in the path).
    pub fn to_fields(&self) -> Map<String, Value> {
        let mut fields = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        fields.remove("id");
        fields
    }
}

/// Fields the user can set when creating a task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub description: String,
    pub deadline: Option<NaiveDateTime>,
    pub checklist: Option<Vec<ChecklistItem>>,
    pub link: Option<String>,
}

impl NewTask {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }
}

/// A partial update of a task. `None` leaves the field alone; for nullable
/// fields `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<Option<NaiveDateTime>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_tracking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_start_time: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
}

impl TaskPatch {
    pub fn description(text: impl Into<String>) -> Self {
        Self {
            description: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn deadline(deadline: Option<NaiveDateTime>) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::default()
        }
    }

    pub fn completed(completed: bool) -> Self {
        Self {
            completed: Some(completed),
            ..Self::default()
        }
    }

    pub fn order(order: i64) -> Self {
        Self {
            order: Some(order),
            ..Self::default()
        }
    }

    pub fn tracking_started(at: DateTime<Utc>) -> Self {
        Self {
            is_tracking: Some(true),
            tracking_start_time: Some(Some(at)),
            ..Self::default()
        }
    }

    pub fn tracking_stopped(elapsed_time: u64) -> Self {
        Self {
            elapsed_time: Some(elapsed_time),
            is_tracking: Some(false),
            tracking_start_time: Some(None),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, task: &mut Task) {
        if let Some(description) = &self.description {
            task.description = description.clone();
        }
        if let Some(deadline) = self.deadline {
            task.deadline = deadline;
        }
        if let Some(completed) = self.completed {
            task.completed = completed;
        }
        if let Some(elapsed) = self.elapsed_time {
            task.elapsed_time = elapsed;
        }
        if let Some(tracking) = self.is_tracking {
            task.is_tracking = tracking;
        }
        if let Some(start) = self.tracking_start_time {
            task.tracking_start_time = start;
        }
        if let Some(order) = self.order {
            task.order = order;
        }
    }

    /// The task's current values for exactly the fields this patch touches.
    /// Applying the result undoes `self`.
    pub fn capture(&self, task: &Task) -> Self {
        Self {
            description: self.description.as_ref().map(|_| task.description.clone()),
            deadline: self.deadline.map(|_| task.deadline),
            completed: self.completed.map(|_| task.completed),
            elapsed_time: self.elapsed_time.map(|_| task.elapsed_time),
            is_tracking: self.is_tracking.map(|_| task.is_tracking),
            tracking_start_time: self.tracking_start_time.map(|_| task.tracking_start_time),
            order: self.order.map(|_| task.order),
        }
    }

    /// Fold a later patch into this one; the later value wins per field.
    pub fn merge(&mut self, later: &TaskPatch) {
        if later.description.is_some() {
            self.description = later.description.clone();
        }
        if later.deadline.is_some() {
            self.deadline = later.deadline;
        }
        if later.completed.is_some() {
            self.completed = later.completed;
        }
        if later.elapsed_time.is_some() {
            self.elapsed_time = later.elapsed_time;
        }
        if later.is_tracking.is_some() {
            self.is_tracking = later.is_tracking;
        }
        if later.tracking_start_time.is_some() {
            self.tracking_start_time = later.tracking_start_time;
        }
        if later.order.is_some() {
            self.order = later.order;
        }
    }

    pub fn to_fields(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Aggregate focus statistics, all durations in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    #[serde(default)]
    pub total_focus_time: u64,
    #[serde(default)]
    pub total_idling_time: u64,
    #[serde(default)]
    pub last_reset_time: Option<DateTime<Utc>>,
}

impl Stats {
    pub fn to_fields(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Sort key for the rendered list: `order` ascending, newest first among equals.
pub fn display_order(a: &Task, b: &Task) -> std::cmp::Ordering {
    a.order
        .cmp(&b.order)
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Task {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let mut task = Task::new(TaskId::from("t1"), "Write report", created);
        task.elapsed_time = 1_500;
        task
    }

    #[test]
    fn capture_undoes_patch() {
        let mut task = sample();
        let original = task.clone();
        let patch = TaskPatch {
            description: Some("Edited".into()),
            order: Some(7),
            ..TaskPatch::default()
        };
        let undo = patch.capture(&task);
        patch.apply(&mut task);
        assert_eq!(task.description, "Edited");
        assert_eq!(task.order, 7);

        undo.apply(&mut task);
        assert_eq!(task, original);
    }

    #[test]
    fn patch_fields_only_touched_keys() {
        let fields = TaskPatch::tracking_stopped(4_000).to_fields();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields["elapsedTime"], 4_000u64);
        assert_eq!(fields["isTracking"], false);
        assert!(fields["trackingStartTime"].is_null());
    }

    #[test]
    fn task_fields_omit_id() {
        let task = sample();
        let fields = task.to_fields();
        assert!(!fields.contains_key("id"));
        assert_eq!(fields["description"], "Write report");
        assert!(!fields.contains_key("checklist"));
    }

    #[test]
    fn later_patch_wins_on_merge() {
        let mut first = TaskPatch::description("a");
        first.merge(&TaskPatch::description("b"));
        first.merge(&TaskPatch::completed(true));
        assert_eq!(first.description.as_deref(), Some("b"));
        assert_eq!(first.completed, Some(true));
    }

    #[test]
    fn display_order_breaks_ties_newest_first() {
        let older = sample();
        let mut newer = sample();
        newer.id = TaskId::from("t2");
        newer.created_at = older.created_at + chrono::Duration::minutes(5);
        let mut tasks = vec![older.clone(), newer.clone()];
        tasks.sort_by(display_order);
        assert_eq!(tasks[0].id, newer.id);
    }

    #[test]
    fn local_ids_are_recognized() {
        assert!(TaskId::local().is_local());
        assert!(!TaskId::from("abc").is_local());
    }
}
