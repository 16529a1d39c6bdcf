use super::task::{Task, TaskId};

/// Where the dragged task lands relative to the drop target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPosition {
    Before,
    After,
}

impl DropPosition {
    /// Dragging upward lands before the target, dragging downward lands after it,
    /// so the dragged task always takes the target's slot.
    pub fn natural(from_index: usize, target_index: usize) -> Self {
        if from_index > target_index {
            Self::Before
        } else {
            Self::After
        }
    }
}

/// A single `order` field write produced by the planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderWrite {
    pub id: TaskId,
    pub order: i64,
}

/// Compute the order writes for moving `dragged` next to `target`.
///
/// `tasks` must be in display order. The whole list is renumbered
/// 0, 1, 2, ... and only tasks whose stored order differs from the new one are
/// returned. Returns `None` when either id is unknown.
pub fn plan_reorder(
    tasks: &[Task],
    dragged: &TaskId,
    target: &TaskId,
    position: Option<DropPosition>,
) -> Option<Vec<OrderWrite>> {
    let from = tasks.iter().position(|t| &t.id == dragged)?;
    let to = tasks.iter().position(|t| &t.id == target)?;

    let mut ids: Vec<&TaskId> = tasks.iter().map(|t| &t.id).collect();
    if from != to {
        let moving = ids.remove(from);
        let target_index = ids.iter().position(|id| *id == target)?;
        let insert_at = match position.unwrap_or_else(|| DropPosition::natural(from, to)) {
            DropPosition::Before => target_index,
            DropPosition::After => target_index + 1,
        };
        ids.insert(insert_at, moving);
    }

    let writes = ids
        .into_iter()
        .enumerate()
        .filter_map(|(index, id)| {
            let order = index as i64;
            let stored = tasks.iter().find(|t| &t.id == id)?;
            (stored.order != order).then(|| OrderWrite {
                id: id.clone(),
                order,
            })
        })
        .collect();

    Some(writes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn list(ids: &[&str]) -> Vec<Task> {
        let created = Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap();
        ids.iter()
            .enumerate()
            .map(|(i, id)| {
                let mut t = Task::new(TaskId::from(*id), *id, created);
                t.order = i as i64;
                t
            })
            .collect()
    }

    fn ids(writes: &[OrderWrite]) -> Vec<(&str, i64)> {
        writes.iter().map(|w| (w.id.as_str(), w.order)).collect()
    }

    #[test]
    fn move_last_onto_first() {
        // A=0 B=1 C=2; dropping C before A gives C=0 A=1 B=2, so every entry changes.
        let tasks = list(&["A", "B", "C"]);
        let writes = plan_reorder(
            &tasks,
            &TaskId::from("C"),
            &TaskId::from("A"),
            Some(DropPosition::Before),
        )
        .unwrap();
        assert_eq!(ids(&writes), vec![("C", 0), ("A", 1), ("B", 2)]);
    }

    #[test]
    fn only_displaced_tasks_are_written() {
        let tasks = list(&["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"]);
        let writes = plan_reorder(&tasks, &TaskId::from("e"), &TaskId::from("d"), None).unwrap();
        assert_eq!(ids(&writes), vec![("e", 3), ("d", 4)]);
    }

    #[test]
    fn ten_tasks_last_to_first_is_bounded() {
        let tasks = list(&["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"]);
        let writes = plan_reorder(&tasks, &TaskId::from("j"), &TaskId::from("a"), None).unwrap();
        assert!(writes.len() <= tasks.len());
        assert_eq!(writes[0], OrderWrite { id: TaskId::from("j"), order: 0 });
    }

    #[test]
    fn dragging_down_lands_after_target() {
        let tasks = list(&["a", "b", "c", "d"]);
        let writes = plan_reorder(&tasks, &TaskId::from("a"), &TaskId::from("c"), None).unwrap();
        assert_eq!(ids(&writes), vec![("b", 0), ("c", 1), ("a", 2)]);
    }

    #[test]
    fn sparse_orders_are_compacted() {
        let mut tasks = list(&["a", "b", "c"]);
        tasks[1].order = 5;
        tasks[2].order = 9;
        let writes = plan_reorder(&tasks, &TaskId::from("a"), &TaskId::from("a"), None).unwrap();
        assert_eq!(ids(&writes), vec![("b", 1), ("c", 2)]);
    }

    #[test]
    fn unknown_ids_yield_none() {
        let tasks = list(&["a", "b"]);
        assert!(plan_reorder(&tasks, &TaskId::from("x"), &TaskId::from("a"), None).is_none());
        assert!(plan_reorder(&tasks, &TaskId::from("a"), &TaskId::from("x"), None).is_none());
    }
}
