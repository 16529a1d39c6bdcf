use std::sync::Arc;

use super::task::{Stats, Task, TaskId, TaskPatch, display_order};

/// Read-only view of the mirror handed to renderers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MirrorSnapshot {
    pub tasks: Vec<Task>,
    pub stats: Stats,
    /// Bumped on every change; lets renderers skip redundant redraws.
    pub version: u64,
}

impl MirrorSnapshot {
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn tracking(&self) -> Option<&Task> {
        self.tasks.iter().find(|t| t.is_tracking)
    }
}

/// In-memory copy of the task list and stats. Never performs I/O.
#[derive(Debug, Default)]
pub struct Mirror {
    tasks: Vec<Task>,
    stats: Stats,
    version: u64,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks in display order.
    pub fn get_all(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get_by_id(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.get_by_id(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Swap the whole list in one step. Used by the reconciler.
    pub fn replace_all(&mut self, mut tasks: Vec<Task>) {
        tasks.sort_by(display_order);
        self.tasks = tasks;
        self.version += 1;
    }

    /// Returns `false` if the task is not in the mirror.
    pub fn apply_patch(&mut self, id: &TaskId, patch: &TaskPatch) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| &t.id == id) else {
            return false;
        };
        patch.apply(task);
        if patch.order.is_some() {
            self.tasks.sort_by(display_order);
        }
        self.version += 1;
        true
    }

    pub fn insert(&mut self, task: Task) {
        self.tasks.retain(|t| t.id != task.id);
        self.tasks.push(task);
        self.tasks.sort_by(display_order);
        self.version += 1;
    }

    pub fn remove(&mut self, id: &TaskId) -> Option<Task> {
        let pos = self.tasks.iter().position(|t| &t.id == id)?;
        self.version += 1;
        Some(self.tasks.remove(pos))
    }

    /// Move a task to a new id, keeping everything else.
    pub fn rekey(&mut self, from: &TaskId, to: TaskId) -> bool {
        if from == &to {
            return self.contains(from);
        }
        let Some(mut task) = self.remove(from) else {
            return false;
        };
        task.id = to;
        self.insert(task);
        true
    }

    pub fn tracking(&self) -> Option<&Task> {
        self.tasks.iter().find(|t| t.is_tracking)
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn set_stats(&mut self, stats: Stats) {
        self.stats = stats;
        self.version += 1;
    }

    pub fn update_stats(&mut self, f: impl FnOnce(&mut Stats)) {
        f(&mut self.stats);
        self.version += 1;
    }

    /// Lowest `order` in the list, if any.
    pub fn min_order(&self) -> Option<i64> {
        self.tasks.iter().map(|t| t.order).min()
    }

    pub fn snapshot(&self) -> Arc<MirrorSnapshot> {
        Arc::new(MirrorSnapshot {
            tasks: self.tasks.clone(),
            stats: self.stats.clone(),
            version: self.version,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn task(id: &str, order: i64, minutes: i64) -> Task {
        let base = Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).unwrap();
        let mut t = Task::new(TaskId::from(id), id, base + Duration::minutes(minutes));
        t.order = order;
        t
    }

    #[test]
    fn replace_all_sorts() {
        let mut mirror = Mirror::new();
        mirror.replace_all(vec![task("c", 2, 0), task("a", 0, 0), task("b", 1, 0)]);
        let ids: Vec<&str> = mirror.get_all().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn equal_orders_show_newest_first() {
        let mut mirror = Mirror::new();
        mirror.replace_all(vec![task("old", 0, 0), task("new", 0, 30)]);
        assert_eq!(mirror.get_all()[0].id.as_str(), "new");
    }

    #[test]
    fn patch_missing_task_is_reported() {
        let mut mirror = Mirror::new();
        let before = mirror.version();
        assert!(!mirror.apply_patch(&TaskId::from("ghost"), &TaskPatch::completed(true)));
        assert_eq!(mirror.version(), before);
    }

    #[test]
    fn order_patch_resorts() {
        let mut mirror = Mirror::new();
        mirror.replace_all(vec![task("a", 0, 0), task("b", 1, 0)]);
        mirror.apply_patch(&TaskId::from("a"), &TaskPatch::order(5));
        assert_eq!(mirror.get_all()[0].id.as_str(), "b");
    }

    #[test]
    fn rekey_keeps_fields() {
        let mut mirror = Mirror::new();
        let mut t = task("local-1", 3, 0);
        t.description = "draft".into();
        mirror.insert(t);
        assert!(mirror.rekey(&TaskId::from("local-1"), TaskId::from("srv-9")));
        let moved = mirror.get_by_id(&TaskId::from("srv-9")).unwrap();
        assert_eq!(moved.description, "draft");
        assert_eq!(moved.order, 3);
        assert!(!mirror.contains(&TaskId::from("local-1")));
    }

    #[test]
    fn snapshot_is_detached() {
        let mut mirror = Mirror::new();
        mirror.insert(task("a", 0, 0));
        let snap = mirror.snapshot();
        mirror.remove(&TaskId::from("a"));
        assert_eq!(snap.tasks.len(), 1);
        assert!(mirror.is_empty());
    }
}
