//! Rebuild the task list from a raw remote snapshot.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::core::task::{ChecklistItem, Stats, Task, TaskId, display_order};

use super::remote::{CollectionSnapshot, Fields, RawDocument};

/// Why a single remote record was dropped from a snapshot.
#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("field {field} is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl RecordError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Result of reconciling one snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciled {
    /// Tasks in display order, with at most one marked tracking.
    pub tasks: Vec<Task>,
    pub skipped: usize,
}

/// Timestamps arrive as epoch milliseconds, RFC 3339 strings or
/// `{seconds, nanoseconds}` objects depending on the writer.
pub fn coerce_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Object(map) => {
            let seconds = map.get("seconds").or_else(|| map.get("_seconds"))?.as_i64()?;
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            DateTime::from_timestamp(seconds, u32::try_from(nanos).ok()?)
        }
        _ => None,
    }
}

/// Non-negative milliseconds; anything malformed counts as zero.
fn coerce_millis(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        _ => 0,
    }
}

fn coerce_order(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .unwrap_or(0),
        _ => 0,
    }
}

fn parse_deadline(value: Option<&Value>) -> Result<Option<NaiveDateTime>, RecordError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M")
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
            .map(Some)
            .map_err(|e| RecordError::invalid("deadline", format!("{}: {}", s, e))),
        Some(other) => Err(RecordError::invalid("deadline", format!("unexpected {}", other))),
    }
}

/// Turn one raw record into a [`Task`].
pub fn normalize_document(doc: &RawDocument) -> Result<Task, RecordError> {
    let f = &doc.fields;

    let description = match f.get("description") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => return Err(RecordError::invalid("description", format!("unexpected {}", other))),
    };

    let completed = match f.get("completed") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(other) => return Err(RecordError::invalid("completed", format!("unexpected {}", other))),
    };

    let checklist = match f.get("checklist") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            serde_json::from_value::<Vec<ChecklistItem>>(v.clone())
                .map_err(|e| RecordError::invalid("checklist", e.to_string()))?,
        ),
    };

    let start = f.get("trackingStartTime").and_then(coerce_timestamp);
    let is_tracking = matches!(f.get("isTracking"), Some(Value::Bool(true))) && start.is_some();

    let mut task = Task::new(
        TaskId::new(doc.id.clone()),
        description,
        f.get("createdAt")
            .and_then(coerce_timestamp)
            .unwrap_or(DateTime::UNIX_EPOCH),
    );
    task.deadline = parse_deadline(f.get("deadline"))?;
    task.completed = completed;
    task.elapsed_time = coerce_millis(f.get("elapsedTime"));
    task.is_tracking = is_tracking;
    task.tracking_start_time = if is_tracking { start } else { None };
    task.order = coerce_order(f.get("order"));
    task.checklist = checklist;
    task.link = f.get("link").and_then(Value::as_str).map(str::to_string);
    Ok(task)
}

/// Aggregate stats document. Missing or malformed totals read as zero.
pub fn stats_from_fields(fields: &Fields) -> Stats {
    Stats {
        total_focus_time: coerce_millis(fields.get("totalFocusTime")),
        total_idling_time: coerce_millis(fields.get("totalIdlingTime")),
        last_reset_time: fields.get("lastResetTime").and_then(coerce_timestamp),
    }
}

/// Normalize a whole snapshot. Bad records are skipped, never fatal.
pub fn reconcile(snapshot: &CollectionSnapshot) -> Reconciled {
    let mut tasks = Vec::with_capacity(snapshot.documents.len());
    let mut skipped = 0;

    for doc in &snapshot.documents {
        match normalize_document(doc) {
            Ok(task) => tasks.push(task),
            Err(e) => {
                log::debug!("Skipping unparseable task {}: {}", doc.id, e);
                skipped += 1;
            }
        }
    }

    let winner = tasks
        .iter()
        .filter(|t| t.is_tracking)
        .max_by(|a, b| {
            a.tracking_start_time
                .cmp(&b.tracking_start_time)
                .then_with(|| b.id.cmp(&a.id))
        })
        .map(|t| t.id.clone());

    if let Some(winner) = &winner {
        for task in tasks.iter_mut().filter(|t| t.is_tracking && &t.id != winner) {
            log::info!("Multiple trackers in snapshot, showing {} as stopped", task.id);
            task.is_tracking = false;
            task.tracking_start_time = None;
        }
    }

    tasks.sort_by(display_order);
    Reconciled { tasks, skipped }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn doc(id: &str, value: Value) -> RawDocument {
        match value {
            Value::Object(fields) => RawDocument::new(id, fields),
            _ => panic!("fields must be an object"),
        }
    }

    #[test]
    fn tracking_start_accepts_all_shapes() {
        let expected = Utc.with_ymd_and_hms(2026, 2, 3, 4, 5, 6).unwrap();
        let millis = json!(expected.timestamp_millis());
        let text = json!("2026-02-03T04:05:06Z");
        let object = json!({"seconds": expected.timestamp(), "nanoseconds": 0});
        let legacy = json!({"_seconds": expected.timestamp(), "_nanoseconds": 0});
        for value in [millis, text, object, legacy] {
            assert_eq!(coerce_timestamp(&value), Some(expected), "{value}");
        }
        assert_eq!(coerce_timestamp(&json!(true)), None);
    }

    #[test]
    fn malformed_elapsed_becomes_zero() {
        for value in [json!("abc"), json!(-5), json!(null), json!({})] {
            let task = normalize_document(&doc("a", json!({"description": "x", "elapsedTime": value}))).unwrap();
            assert_eq!(task.elapsed_time, 0);
        }
        let task = normalize_document(&doc("a", json!({"description": "x"}))).unwrap();
        assert_eq!(task.elapsed_time, 0);
        let task = normalize_document(&doc("a", json!({"elapsedTime": 1500.7}))).unwrap();
        assert_eq!(task.elapsed_time, 1500);
    }

    #[test]
    fn tracking_without_start_is_not_tracking() {
        let task = normalize_document(&doc("a", json!({"isTracking": true}))).unwrap();
        assert!(!task.is_tracking);
        assert_eq!(task.tracking_start_time, None);
    }

    #[test]
    fn deadline_formats() {
        let task = normalize_document(&doc("a", json!({"deadline": "2026-07-01T18:30"}))).unwrap();
        assert_eq!(task.deadline.map(|d| d.to_string()).as_deref(), Some("2026-07-01 18:30:00"));
        let task = normalize_document(&doc("a", json!({"deadline": ""}))).unwrap();
        assert_eq!(task.deadline, None);
        assert!(normalize_document(&doc("a", json!({"deadline": "next week"}))).is_err());
    }

    #[test]
    fn extension_fields_pass_through() {
        let task = normalize_document(&doc(
            "a",
            json!({
                "description": "Review",
                "checklist": [{"prompt": "p", "outcome": "o", "rationale": "r", "completed": true}],
                "link": "https://example.org/x"
            }),
        ))
        .unwrap();
        let checklist = task.checklist.unwrap();
        assert_eq!(checklist.len(), 1);
        assert!(checklist[0].completed);
        assert_eq!(task.link.as_deref(), Some("https://example.org/x"));
    }

    #[test]
    fn bad_record_is_skipped_not_fatal() {
        let snapshot = CollectionSnapshot {
            documents: vec![
                doc("good", json!({"description": "ok", "order": 1})),
                doc("bad", json!({"description": 42})),
                doc("also-good", json!({"description": "fine", "order": 0})),
            ],
            changes: Vec::new(),
        };
        let result = reconcile(&snapshot);
        assert_eq!(result.skipped, 1);
        let ids: Vec<&str> = result.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["also-good", "good"]);
    }

    #[test]
    fn ties_sort_newest_first() {
        let snapshot = CollectionSnapshot {
            documents: vec![
                doc("old", json!({"order": 0, "createdAt": 1_000})),
                doc("new", json!({"order": 0, "createdAt": 2_000})),
            ],
            changes: Vec::new(),
        };
        let result = reconcile(&snapshot);
        assert_eq!(result.tasks[0].id.as_str(), "new");
    }

    #[test]
    fn stats_document_tolerates_garbage() {
        let fields = json!({"totalFocusTime": 90_000, "totalIdlingTime": "x", "lastResetTime": null});
        let stats = stats_from_fields(fields.as_object().unwrap());
        assert_eq!(stats.total_focus_time, 90_000);
        assert_eq!(stats.total_idling_time, 0);
        assert_eq!(stats.last_reset_time, None);
    }

    #[test]
    fn latest_tracker_wins() {
        let snapshot = CollectionSnapshot {
            documents: vec![
                doc("a", json!({"isTracking": true, "trackingStartTime": 1_000})),
                doc("b", json!({"isTracking": true, "trackingStartTime": 5_000})),
            ],
            changes: Vec::new(),
        };
        let result = reconcile(&snapshot);
        let trackers: Vec<&str> = result
            .tasks
            .iter()
            .filter(|t| t.is_tracking)
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(trackers, ["b"]);
    }
}
