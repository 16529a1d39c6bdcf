//! Time tracking: at most one task accrues focus time at any instant, and idle
//! time accrues while nothing is tracked.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::clock::millis_between;
use super::mirror::Mirror;
use super::task::{Stats, Task, TaskId, TaskPatch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingState {
    Idle {
        since: DateTime<Utc>,
    },
    Tracking {
        task: TaskId,
        started: DateTime<Utc>,
        /// The remote store has acknowledged the start (or it came from there).
        confirmed: bool,
    },
}

/// Local changes made by a transition, plus what is needed to roll them back.
#[derive(Debug, Clone)]
pub struct Transition {
    pub epoch: u64,
    pub task_writes: Vec<(TaskId, TaskPatch)>,
    pub stats_changed: bool,
    pub undo: TransitionUndo,
}

#[derive(Debug, Clone)]
pub struct TransitionUndo {
    state: TrackingState,
    pending_idle: u64,
    stats: Stats,
    settling: HashMap<TaskId, u64>,
    tasks: Vec<(TaskId, TaskPatch)>,
}

/// What the tracker concluded from a fresh remote snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteVerdict {
    Unchanged,
    /// Our start has not been acknowledged yet; local tracking fields win.
    KeepLocal,
    /// Another client is tracking this task; we follow it.
    Adopted(TaskId),
    /// Another client stopped or removed the task we were tracking.
    Cleared(TaskId),
}

#[derive(Debug, Clone)]
pub struct TimeTracker {
    state: TrackingState,
    /// Idle milliseconds accrued locally but not yet written remotely.
    pending_idle: u64,
    /// Tasks whose stop has not been acknowledged, with the elapsed time we wrote.
    settling: HashMap<TaskId, u64>,
    epoch: u64,
}

impl TimeTracker {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: TrackingState::Idle { since: now },
            pending_idle: 0,
            settling: HashMap::new(),
            epoch: 0,
        }
    }

    pub fn state(&self) -> &TrackingState {
        &self.state
    }

    pub fn tracking_task(&self) -> Option<&TaskId> {
        match &self.state {
            TrackingState::Tracking { task, .. } => Some(task),
            TrackingState::Idle { .. } => None,
        }
    }

    pub fn pending_idle(&self) -> u64 {
        self.pending_idle
    }

    /// Seed the accumulator with idle time left over from a previous run.
    pub fn restore_pending_idle(&mut self, ms: u64) {
        self.pending_idle = ms;
    }

    pub fn settling(&self) -> &HashMap<TaskId, u64> {
        &self.settling
    }

    /// Unacknowledged local tracking that must survive a reconcile.
    pub fn local_override(&self) -> Option<(&TaskId, DateTime<Utc>)> {
        match &self.state {
            TrackingState::Tracking {
                task,
                started,
                confirmed: false,
            } => Some((task, *started)),
            _ => None,
        }
    }

    /// `Idle -> Tracking(id)`, or `Tracking(other) -> Idle -> Tracking(id)`.
    /// Returns `None` if the task is unknown or already tracked.
    pub fn start(&mut self, mirror: &mut Mirror, id: &TaskId, now: DateTime<Utc>) -> Option<Transition> {
        if !mirror.contains(id) || self.tracking_task() == Some(id) {
            return None;
        }
        let mut undo = self.undo_point(mirror);
        let mut writes = Vec::new();
        let mut stats_changed = false;

        match self.state.clone() {
            TrackingState::Tracking { task, started, .. } => {
                self.stop_session(mirror, &task, started, now, &mut writes, &mut undo);
                stats_changed = true;
            }
            TrackingState::Idle { .. } => {
                self.accrue_idle(mirror, now);
            }
        }

        Self::write(mirror, id, TaskPatch::tracking_started(now), &mut writes, &mut undo);
        self.state = TrackingState::Tracking {
            task: id.clone(),
            started: now,
            confirmed: false,
        };
        self.epoch += 1;

        Some(Transition {
            epoch: self.epoch,
            task_writes: writes,
            stats_changed,
            undo,
        })
    }

    /// `Tracking(t) -> Idle`. Returns `None` when already idle.
    pub fn stop(&mut self, mirror: &mut Mirror, now: DateTime<Utc>) -> Option<Transition> {
        let TrackingState::Tracking { task, started, .. } = self.state.clone() else {
            return None;
        };
        let mut undo = self.undo_point(mirror);
        let mut writes = Vec::new();
        self.stop_session(mirror, &task, started, now, &mut writes, &mut undo);
        self.state = TrackingState::Idle { since: now };
        self.epoch += 1;

        Some(Transition {
            epoch: self.epoch,
            task_writes: writes,
            stats_changed: true,
            undo,
        })
    }

    /// Accrue idle time up to `now`. Returns the milliseconds added.
    pub fn tick(&mut self, mirror: &mut Mirror, now: DateTime<Utc>) -> u64 {
        self.accrue_idle(mirror, now)
    }

    /// The remote store now holds `amount` of the pending idle time.
    pub fn commit_idle(&mut self, amount: u64) {
        self.pending_idle = self.pending_idle.saturating_sub(amount);
    }

    /// Zero the idle accumulator and restart the idle clock after a stats reset.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.pending_idle = 0;
        if let TrackingState::Idle { since } = &mut self.state {
            *since = now;
        }
    }

    /// Mark a transition as durably persisted (or accepted by the fallback path).
    pub fn confirm(&mut self, transition: &Transition) {
        self.release_settled(transition);
        if transition.epoch == self.epoch {
            if let TrackingState::Tracking { confirmed, .. } = &mut self.state {
                *confirmed = true;
            }
        }
    }

    /// Roll back a failed transition. Only the most recent transition can be
    /// undone; returns `false` if a later one superseded it.
    pub fn revert(&mut self, mirror: &mut Mirror, transition: Transition) -> bool {
        if transition.epoch != self.epoch {
            self.release_settled(&transition);
            return false;
        }
        let undo = transition.undo;
        for (id, patch) in undo.tasks.iter().rev() {
            mirror.apply_patch(id, patch);
        }
        mirror.set_stats(undo.stats);
        self.state = undo.state;
        self.pending_idle = undo.pending_idle;
        self.settling = undo.settling;
        self.epoch += 1;
        true
    }

    /// Fold a reconciled remote list into the tracking state.
    ///
    /// `tasks` must already have at most one tracking entry.
    pub fn observe_remote(&mut self, mirror: &mut Mirror, tasks: &[Task], now: DateTime<Utc>) -> RemoteVerdict {
        let remote_tracker = tasks
            .iter()
            .find(|t| t.is_tracking && !self.settling.contains_key(&t.id));

        match self.state.clone() {
            TrackingState::Idle { .. } => match remote_tracker {
                Some(t) => {
                    self.accrue_idle(mirror, now);
                    self.adopt(t, now)
                }
                None => RemoteVerdict::Unchanged,
            },
            TrackingState::Tracking {
                task,
                started,
                confirmed,
            } => {
                let Some(remote) = tasks.iter().find(|t| t.id == task) else {
                    self.state = TrackingState::Idle { since: now };
                    self.epoch += 1;
                    return RemoteVerdict::Cleared(task);
                };
                if remote.is_tracking && remote.tracking_start_time == Some(started) {
                    if let TrackingState::Tracking { confirmed, .. } = &mut self.state {
                        *confirmed = true;
                    }
                    return RemoteVerdict::Unchanged;
                }
                if !confirmed {
                    return RemoteVerdict::KeepLocal;
                }
                match remote_tracker {
                    Some(t) => self.adopt(t, now),
                    None => {
                        self.state = TrackingState::Idle { since: now };
                        self.epoch += 1;
                        RemoteVerdict::Cleared(task)
                    }
                }
            }
        }
    }

    /// Drop the tracking session for a task that is being deleted, crediting the
    /// focus time it accrued.
    pub fn forget(&mut self, mirror: &mut Mirror, id: &TaskId, now: DateTime<Utc>) -> bool {
        let TrackingState::Tracking { task, started, .. } = self.state.clone() else {
            return false;
        };
        if &task != id {
            return false;
        }
        let elapsed = millis_between(started, now);
        mirror.update_stats(|s| s.total_focus_time = s.total_focus_time.saturating_add(elapsed));
        self.state = TrackingState::Idle { since: now };
        self.epoch += 1;
        true
    }

    /// Follow a task that was given a server-assigned id.
    pub fn rekey(&mut self, from: &TaskId, to: &TaskId) {
        if let TrackingState::Tracking { task, .. } = &mut self.state {
            if task == from {
                *task = to.clone();
            }
        }
        if let Some(elapsed) = self.settling.remove(from) {
            self.settling.insert(to.clone(), elapsed);
        }
    }

    fn release_settled(&mut self, transition: &Transition) {
        for (id, patch) in &transition.task_writes {
            if patch.is_tracking == Some(false) && self.settling.get(id) == patch.elapsed_time.as_ref() {
                self.settling.remove(id);
            }
        }
    }

    fn adopt(&mut self, remote: &Task, now: DateTime<Utc>) -> RemoteVerdict {
        self.state = TrackingState::Tracking {
            task: remote.id.clone(),
            started: remote.tracking_start_time.unwrap_or(now),
            confirmed: true,
        };
        self.epoch += 1;
        RemoteVerdict::Adopted(remote.id.clone())
    }

    fn accrue_idle(&mut self, mirror: &mut Mirror, now: DateTime<Utc>) -> u64 {
        let TrackingState::Idle { since } = &mut self.state else {
            return 0;
        };
        let delta = millis_between(*since, now);
        *since = now;
        if delta > 0 {
            self.pending_idle = self.pending_idle.saturating_add(delta);
            mirror.update_stats(|s| s.total_idling_time = s.total_idling_time.saturating_add(delta));
        }
        delta
    }

    fn stop_session(
        &mut self,
        mirror: &mut Mirror,
        task: &TaskId,
        started: DateTime<Utc>,
        now: DateTime<Utc>,
        writes: &mut Vec<(TaskId, TaskPatch)>,
        undo: &mut TransitionUndo,
    ) {
        let elapsed = millis_between(started, now);
        mirror.update_stats(|s| s.total_focus_time = s.total_focus_time.saturating_add(elapsed));
        let Some(current) = mirror.get_by_id(task).map(|t| t.elapsed_time) else {
            return;
        };
        let total = current.saturating_add(elapsed);
        Self::write(mirror, task, TaskPatch::tracking_stopped(total), writes, undo);
        self.settling.insert(task.clone(), total);
    }

    fn write(
        mirror: &mut Mirror,
        id: &TaskId,
        patch: TaskPatch,
        writes: &mut Vec<(TaskId, TaskPatch)>,
        undo: &mut TransitionUndo,
    ) {
        if let Some(task) = mirror.get_by_id(id) {
            undo.tasks.push((id.clone(), patch.capture(task)));
        }
        mirror.apply_patch(id, &patch);
        writes.push((id.clone(), patch));
    }

    fn undo_point(&self, mirror: &Mirror) -> TransitionUndo {
        TransitionUndo {
            state: self.state.clone(),
            pending_idle: self.pending_idle,
            stats: mirror.stats().clone(),
            settling: self.settling.clone(),
            tasks: Vec::new(),
        }
    }
}
