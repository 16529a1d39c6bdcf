use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::core::task::{Task, TaskId, TaskPatch};

/// Local state that has not reached the remote store yet and must survive a
/// reconcile.
#[derive(Debug, Default)]
pub struct LocalOverlay {
    /// Coalesced edits still pending or in flight, per task.
    pub edits: Vec<(TaskId, TaskPatch)>,
    /// Tasks created locally whose insert has not been acknowledged.
    pub provisional: Vec<Task>,
    /// Tasks deleted locally whose delete has not been acknowledged.
    pub removed: Vec<TaskId>,
    /// Unacknowledged local tracking start.
    pub tracking: Option<(TaskId, DateTime<Utc>)>,
    /// Unacknowledged stops, with the elapsed time written.
    pub settling: HashMap<TaskId, u64>,
}

/// Merge an incoming remote list with local state.
///
/// Remote values win everywhere except where local state is newer than anything
/// the remote store could have seen.
pub fn overlay_local(mut incoming: Vec<Task>, overlay: &LocalOverlay) -> Vec<Task> {
    incoming.retain(|t| !overlay.removed.contains(&t.id));

    for (id, patch) in &overlay.edits {
        if let Some(task) = incoming.iter_mut().find(|t| &t.id == id) {
            patch.apply(task);
        }
    }

    for task in &overlay.provisional {
        if !incoming.iter().any(|t| t.id == task.id) {
            incoming.push(task.clone());
        }
    }

    // Stops before starts: a task may have been stopped and another started
    // before either write was acknowledged.
    for (id, elapsed) in &overlay.settling {
        if let Some(task) = incoming.iter_mut().find(|t| &t.id == id) {
            task.is_tracking = false;
            task.tracking_start_time = None;
            task.elapsed_time = task.elapsed_time.max(*elapsed);
        }
    }

    if let Some((id, started)) = &overlay.tracking {
        if incoming.iter().any(|t| &t.id == id) {
            for task in incoming.iter_mut() {
                if &task.id == id {
                    task.is_tracking = true;
                    task.tracking_start_time = Some(*started);
                } else if task.is_tracking {
                    task.is_tracking = false;
                    task.tracking_start_time = None;
                }
            }
        }
    }

    incoming
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 9, min, 0).unwrap()
    }

    fn make_remote() -> Vec<Task> {
        let mut a = Task::new(TaskId::from("a"), "remote a", at(0));
        a.elapsed_time = 1_000;
        let b = Task::new(TaskId::from("b"), "remote b", at(1));
        vec![a, b]
    }

    #[test]
    fn empty_overlay_keeps_remote() {
        let merged = overlay_local(make_remote(), &LocalOverlay::default());
        assert_eq!(merged, make_remote());
    }

    #[test]
    fn pending_edit_wins_over_remote() {
        let overlay = LocalOverlay {
            edits: vec![(TaskId::from("a"), TaskPatch::description("typing..."))],
            ..LocalOverlay::default()
        };
        let merged = overlay_local(make_remote(), &overlay);
        assert_eq!(merged[0].description, "typing...");
        assert_eq!(merged[1].description, "remote b");
    }

    #[test]
    fn provisional_task_is_kept() {
        let local = Task::new(TaskId::from("local-1"), "new", at(2));
        let overlay = LocalOverlay {
            provisional: vec![local.clone()],
            ..LocalOverlay::default()
        };
        let merged = overlay_local(make_remote(), &overlay);
        assert_eq!(merged.len(), 3);
        assert!(merged.contains(&local));
    }

    #[test]
    fn pending_delete_hides_task() {
        let overlay = LocalOverlay {
            removed: vec![TaskId::from("b")],
            ..LocalOverlay::default()
        };
        let merged = overlay_local(make_remote(), &overlay);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id.as_str(), "a");
    }

    #[test]
    fn unacknowledged_start_forces_single_tracker() {
        let mut remote = make_remote();
        remote[0].is_tracking = true;
        remote[0].tracking_start_time = Some(at(0));
        let overlay = LocalOverlay {
            tracking: Some((TaskId::from("b"), at(5))),
            ..LocalOverlay::default()
        };
        let merged = overlay_local(remote, &overlay);
        assert!(!merged[0].is_tracking);
        assert!(merged[1].is_tracking);
        assert_eq!(merged[1].tracking_start_time, Some(at(5)));
    }

    #[test]
    fn settling_stop_keeps_larger_elapsed() {
        let mut remote = make_remote();
        remote[0].is_tracking = true;
        remote[0].tracking_start_time = Some(at(0));
        let overlay = LocalOverlay {
            settling: HashMap::from([(TaskId::from("a"), 61_000)]),
            ..LocalOverlay::default()
        };
        let merged = overlay_local(remote, &overlay);
        assert!(!merged[0].is_tracking);
        assert_eq!(merged[0].elapsed_time, 61_000);
    }

    #[test]
    fn override_for_missing_task_is_ignored() {
        let overlay = LocalOverlay {
            tracking: Some((TaskId::from("gone"), at(5))),
            ..LocalOverlay::default()
        };
        let merged = overlay_local(make_remote(), &overlay);
        assert!(merged.iter().all(|t| !t.is_tracking));
    }
}
