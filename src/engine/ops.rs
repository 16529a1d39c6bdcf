//! Mutation handlers and write settlement.
//!
//! Every mutation follows the same shape: change the mirror, publish, build a
//! [`Plan`] of remote writes, and submit it with a [`Completion`] describing how
//! to finish (reply, confirm or roll back) once the outcome is known.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::config::DocumentPaths;
use crate::core::reorder::{DropPosition, plan_reorder};
use crate::core::task::{NewTask, Stats, Task, TaskId, TaskPatch};
use crate::core::tracking::Transition;
use crate::error::{EngineError, FallbackError, RemoteError};
use crate::sync::backlog::Backlog;
use crate::sync::coalesce::{CoalescedWrite, FieldGroup, Fired, WriteKey};
use crate::sync::remote::{RemoteWrite, WriteAck};

use super::{Engine, JobResult, Notice, Reply, WriteJob};

/// Remote writes for one mutation plus the local state they carry.
#[derive(Debug, Default)]
pub(super) struct Plan {
    pub(super) writes: Vec<RemoteWrite>,
    /// Tasks whose current value must reach the store eventually.
    pub(super) upserts: Vec<TaskId>,
    pub(super) deletes: Vec<TaskId>,
    pub(super) stats: bool,
    /// Edits re-applied over incoming snapshots until the plan settles.
    pub(super) overlay: Vec<(TaskId, TaskPatch)>,
}

impl Plan {
    pub(super) fn replay(writes: Vec<RemoteWrite>) -> Self {
        Self {
            writes,
            ..Self::default()
        }
    }

    fn patch(mut self, paths: &DocumentPaths, id: &TaskId, patch: &TaskPatch) -> Self {
        self.writes.push(RemoteWrite::Set {
            path: paths.task_doc(id.as_str()),
            fields: patch.to_fields(),
            merge: true,
        });
        self.upserts.push(id.clone());
        self.overlay.push((id.clone(), patch.clone()));
        self
    }

    fn upsert(mut self, paths: &DocumentPaths, task: &Task) -> Self {
        self.writes.push(RemoteWrite::Set {
            path: paths.task_doc(task.id.as_str()),
            fields: task.to_fields(),
            merge: true,
        });
        self.upserts.push(task.id.clone());
        self
    }

    fn add(mut self, paths: &DocumentPaths, task: &Task) -> Self {
        self.writes.push(RemoteWrite::Add {
            collection: paths.tasks_collection(),
            fields: task.to_fields(),
        });
        self.upserts.push(task.id.clone());
        self
    }

    fn delete(mut self, paths: &DocumentPaths, id: &TaskId) -> Self {
        self.writes.push(RemoteWrite::Delete {
            path: paths.task_doc(id.as_str()),
        });
        self.deletes.push(id.clone());
        self
    }

    /// Full totals, so a repeated or reordered write converges on the same document.
    pub(super) fn stats(mut self, paths: &DocumentPaths, stats: &Stats) -> Self {
        self.writes.push(RemoteWrite::Set {
            path: paths.stats_doc(),
            fields: stats.to_fields(),
            merge: true,
        });
        self.stats = true;
        self
    }

    fn is_empty(&self) -> bool {
        self.writes.is_empty() && !self.stats
    }
}

/// A local change and the patch that undoes it.
#[derive(Debug)]
pub(super) struct Change {
    id: TaskId,
    patch: TaskPatch,
    undo: TaskPatch,
}

pub(super) enum Completion {
    Add {
        reply: Reply<TaskId>,
        id: TaskId,
    },
    Delete {
        reply: Reply<()>,
        /// `None` when the task never reached the store.
        task: Option<Task>,
    },
    Patches {
        reply: Reply<()>,
        changes: Vec<Change>,
    },
    Tracking {
        reply: Reply<()>,
        transition: Transition,
        /// Idle time included in the stats write.
        idle: u64,
    },
    Coalesced(CoalescedWrite),
    ResetStats {
        reply: Reply<()>,
        previous: Stats,
        pending_idle: u64,
        at: DateTime<Utc>,
    },
    IdleFlush {
        amount: u64,
    },
    Replay {
        backlog: Backlog,
        recovering: bool,
    },
    /// Catch-up write after a server id arrived.
    Followup,
}

pub(super) struct Job {
    pub(super) plan: Plan,
    completion: Completion,
}

/// A task whose insert has been sent but not acknowledged. Edits made in the
/// meantime wait for the server id.
#[derive(Debug, Default)]
pub(super) struct PendingAdd {
    dirty: bool,
    deleted: bool,
    /// Server id of the document this insert produced, once a snapshot has
    /// shown it ahead of the acknowledgement.
    pub(super) landed: Option<TaskId>,
}

enum Outcome {
    Written(Vec<WriteAck>),
    /// Redirected to the fallback store while the breaker is open.
    Offline(Result<(), FallbackError>),
    Failed(RemoteError),
}

impl Outcome {
    fn into_result(self) -> Result<(), EngineError> {
        match self {
            Outcome::Written(_) | Outcome::Offline(Ok(())) => Ok(()),
            Outcome::Offline(Err(e)) => Err(e.into()),
            Outcome::Failed(e) => Err(e.into()),
        }
    }

    fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

impl Engine {
    // Submission

    pub(super) fn submit(&mut self, plan: Plan, completion: Completion) {
        if self.breaker.is_open() {
            let saved = self.persist_offline(&plan);
            self.settle(completion, Outcome::Offline(saved));
            return;
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        let job = WriteJob {
            seq,
            writes: plan.writes.clone(),
        };
        self.jobs.insert(seq, Job { plan, completion });
        if self.writer_tx.send(job).is_err() {
            log::error!("Remote writer is gone, dropping job {}", seq);
            if let Some(job) = self.jobs.remove(&seq) {
                let err = RemoteError::unavailable("remote writer stopped");
                self.settle(job.completion, Outcome::Failed(err));
            }
        }
    }

    /// Record what a plan would have written so it can be replayed later.
    fn persist_offline(&mut self, plan: &Plan) -> Result<(), FallbackError> {
        for id in &plan.deletes {
            self.backlog.record_delete(id);
        }
        for id in &plan.upserts {
            self.backlog.record_upsert(id);
        }
        if plan.stats {
            self.backlog.record_stats();
        }
        let saved = self.save_offline_copy();
        if let Err(e) = &saved {
            log::error!("Failed to save offline copy: {}", e);
        }
        saved
    }

    pub(super) fn on_persisted(&mut self, seq: u64, result: JobResult) {
        let Some(job) = self.jobs.remove(&seq) else {
            log::debug!("Ignoring result for unknown job {}", seq);
            return;
        };
        let outcome = match result {
            JobResult::Written(acks) => Outcome::Written(acks),
            JobResult::Skipped => Outcome::Offline(self.persist_offline(&job.plan)),
            JobResult::Failed(e) => {
                if self.observe_failure(&e) {
                    Outcome::Offline(self.persist_offline(&job.plan))
                } else {
                    Outcome::Failed(e)
                }
            }
        };
        self.settle(job.completion, outcome);
    }

    fn settle(&mut self, completion: Completion, outcome: Outcome) {
        match completion {
            Completion::Add { reply, id } => self.settle_add(reply, id, outcome),
            Completion::Delete { reply, task } => {
                if let (Outcome::Failed(e), Some(mut task)) = (&outcome, task) {
                    log::warn!("Failed to delete {}: {}", task.id, e);
                    task.is_tracking = false;
                    task.tracking_start_time = None;
                    self.mirror.insert(task);
                    self.publish();
                }
                let _ = reply.send(outcome.into_result());
            }
            Completion::Patches { reply, changes } => {
                if let Outcome::Failed(e) = &outcome {
                    log::warn!("Failed to write {} task changes: {}", changes.len(), e);
                    for change in changes.iter().rev() {
                        let current = self.mirror.get_by_id(&change.id).map(|t| change.patch.capture(t));
                        if current.as_ref() == Some(&change.patch) {
                            self.mirror.apply_patch(&change.id, &change.undo);
                        }
                    }
                    self.publish();
                }
                let _ = reply.send(outcome.into_result());
            }
            Completion::Tracking {
                reply,
                transition,
                idle,
            } => {
                match &outcome {
                    Outcome::Written(_) => {
                        self.tracker.confirm(&transition);
                        self.tracker.commit_idle(idle);
                        self.save_pending_idle();
                    }
                    Outcome::Offline(_) => self.tracker.confirm(&transition),
                    Outcome::Failed(e) => {
                        log::warn!("Failed to write tracking change: {}", e);
                        if self.tracker.revert(&mut self.mirror, transition) {
                            self.publish();
                        }
                    }
                }
                let _ = reply.send(outcome.into_result());
            }
            Completion::Coalesced(write) => match outcome {
                Outcome::Failed(e) => {
                    log::warn!("Failed to write edit of {}: {}", write.key.task, e);
                    if let Some(undo) = self.coalescer.reject(&write) {
                        if self.mirror.apply_patch(&write.key.task, &undo) {
                            self.publish();
                        }
                    }
                    self.notify(Notice::SyncFailed { message: e.to_string() });
                }
                _ => self.coalescer.confirm(&write),
            },
            Completion::ResetStats {
                reply,
                previous,
                pending_idle,
                at,
            } => {
                if outcome.is_failed() && self.mirror.stats().last_reset_time == Some(at) {
                    let since = self.mirror.stats().clone();
                    self.mirror.set_stats(Stats {
                        total_focus_time: previous.total_focus_time.saturating_add(since.total_focus_time),
                        total_idling_time: previous.total_idling_time.saturating_add(since.total_idling_time),
                        last_reset_time: previous.last_reset_time,
                    });
                    self.tracker
                        .restore_pending_idle(pending_idle.saturating_add(self.tracker.pending_idle()));
                    self.save_pending_idle();
                    self.publish();
                }
                let _ = reply.send(outcome.into_result());
            }
            Completion::IdleFlush { amount } => {
                self.idle_flush_in_flight = false;
                match outcome {
                    Outcome::Written(_) => {
                        self.tracker.commit_idle(amount);
                        self.save_pending_idle();
                    }
                    Outcome::Offline(_) => {}
                    Outcome::Failed(e) => log::debug!("Idle flush failed, retrying on next tick: {}", e),
                }
            }
            Completion::Replay { backlog, recovering } => self.settle_replay(backlog, recovering, outcome),
            Completion::Followup => {
                if let Outcome::Failed(e) = outcome {
                    log::warn!("Follow-up write failed: {}", e);
                    self.notify(Notice::SyncFailed { message: e.to_string() });
                }
            }
        }
    }

    fn settle_add(&mut self, reply: Reply<TaskId>, id: TaskId, outcome: Outcome) {
        let pending = self.pending_adds.remove(&id).unwrap_or_default();
        match outcome {
            Outcome::Written(acks) => {
                let server = acks
                    .iter()
                    .find_map(|ack| match ack {
                        WriteAck::Added(doc) => Some(TaskId::new(doc.clone())),
                        WriteAck::Done => None,
                    })
                    .unwrap_or_else(|| id.clone());
                log::debug!("Task {} stored as {}", id, server);
                self.coalescer.rekey_task(&id, &server);
                self.tracker.rekey(&id, &server);
                if pending.deleted {
                    let plan = Plan::default().delete(&self.paths, &server);
                    self.submit(plan, Completion::Followup);
                } else if self.mirror.rekey(&id, server.clone()) {
                    self.publish();
                    if pending.dirty {
                        if let Some(task) = self.mirror.get_by_id(&server) {
                            let plan = Plan::default().upsert(&self.paths, task);
                            self.submit(plan, Completion::Followup);
                        }
                    }
                }
                let _ = reply.send(Ok(server));
            }
            Outcome::Offline(saved) => {
                if pending.deleted {
                    self.backlog.record_delete(&id);
                    if let Err(e) = self.fallback.save_backlog(&self.backlog) {
                        log::error!("Failed to save offline backlog: {}", e);
                    }
                }
                let _ = reply.send(saved.map(|()| id).map_err(EngineError::from));
            }
            Outcome::Failed(e) => {
                log::warn!("Failed to add task: {}", e);
                if !pending.deleted {
                    self.coalescer.forget_task(&id);
                    let now = self.clock.now();
                    self.tracker.forget(&mut self.mirror, &id, now);
                    self.mirror.remove(&id);
                    self.publish();
                }
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    fn settle_replay(&mut self, backlog: Backlog, recovering: bool, outcome: Outcome) {
        match outcome {
            Outcome::Written(acks) => {
                log::info!("Replayed {} offline writes", acks.len());
                if let Err(e) = self.fallback.save_backlog(&self.backlog) {
                    log::error!("Failed to save offline backlog: {}", e);
                }
                self.subscribe();
                if recovering {
                    self.notify(Notice::Recovered);
                }
            }
            Outcome::Offline(_) => {
                self.backlog.absorb(backlog);
                if let Err(e) = self.fallback.save_backlog(&self.backlog) {
                    log::error!("Failed to save offline backlog: {}", e);
                }
            }
            Outcome::Failed(e) => {
                log::warn!("Replay of offline changes failed: {}", e);
                self.backlog.absorb(backlog);
                if let Err(e) = self.fallback.save_backlog(&self.backlog) {
                    log::error!("Failed to save offline backlog: {}", e);
                }
                self.notify(Notice::SyncFailed { message: e.to_string() });
                self.subscribe();
            }
        }
    }

    /// Patch writes for a task whose insert is still in flight are folded into
    /// a single upsert once the server id is known.
    fn patch_plan(&mut self, plan: Plan, id: &TaskId, patch: &TaskPatch) -> Plan {
        if let Some(pending) = self.pending_adds.get_mut(id) {
            pending.dirty = true;
            return plan;
        }
        plan.patch(&self.paths, id, patch)
    }

    // Mutations

    pub(super) fn add_task(&mut self, new: NewTask, reply: Reply<TaskId>) {
        let now = self.clock.now();
        let id = TaskId::local();
        let mut task = Task::new(id.clone(), new.description, now);
        task.deadline = new.deadline;
        task.checklist = new.checklist;
        task.link = new.link;
        task.order = self.mirror.min_order().map_or(0, |min| min - 1);

        self.mirror.insert(task.clone());
        self.publish();
        if !self.breaker.is_open() {
            self.pending_adds.insert(id.clone(), PendingAdd::default());
        }
        let plan = Plan::default().add(&self.paths, &task);
        self.submit(plan, Completion::Add { reply, id });
    }

    pub(super) fn delete_task(&mut self, id: TaskId, reply: Reply<()>) {
        if !self.mirror.contains(&id) {
            log::debug!("Delete of unknown task {} ignored", id);
            let _ = reply.send(Ok(()));
            return;
        }
        self.coalescer.forget_task(&id);
        let now = self.clock.now();
        let was_tracked = self.tracker.forget(&mut self.mirror, &id, now);
        let removed = self.mirror.remove(&id);
        self.publish();

        let mut plan = Plan::default();
        if was_tracked {
            plan = plan.stats(&self.paths, self.mirror.stats());
        }
        let task = match self.pending_adds.get_mut(&id) {
            Some(pending) => {
                pending.deleted = true;
                None
            }
            None => {
                plan = plan.delete(&self.paths, &id);
                removed
            }
        };
        if plan.is_empty() {
            let _ = reply.send(Ok(()));
            return;
        }
        self.submit(plan, Completion::Delete { reply, task });
    }

    pub(super) fn toggle_complete(&mut self, id: TaskId, reply: Reply<()>) {
        let Some(task) = self.mirror.get_by_id(&id) else {
            log::debug!("Toggle of unknown task {} ignored", id);
            let _ = reply.send(Ok(()));
            return;
        };
        let patch = TaskPatch::completed(!task.completed);
        let undo = patch.capture(task);
        self.mirror.apply_patch(&id, &patch);
        self.publish();

        let plan = self.patch_plan(Plan::default(), &id, &patch);
        let changes = vec![Change { id, patch, undo }];
        self.submit(plan, Completion::Patches { reply, changes });
    }

    pub(super) fn start_tracking(&mut self, id: TaskId, reply: Reply<()>) {
        let now = self.clock.now();
        match self.tracker.start(&mut self.mirror, &id, now) {
            Some(transition) => self.submit_transition(transition, reply),
            None => {
                log::debug!("Tracking start for {} is a no-op", id);
                let _ = reply.send(Ok(()));
            }
        }
    }

    pub(super) fn stop_tracking(&mut self, reply: Reply<()>) {
        let now = self.clock.now();
        match self.tracker.stop(&mut self.mirror, now) {
            Some(transition) => self.submit_transition(transition, reply),
            None => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn submit_transition(&mut self, transition: Transition, reply: Reply<()>) {
        self.publish();
        let mut plan = Plan::default();
        for (id, patch) in &transition.task_writes {
            plan = self.patch_plan(plan, id, patch);
        }
        plan = plan.stats(&self.paths, self.mirror.stats());
        let idle = self.tracker.pending_idle();
        self.submit(
            plan,
            Completion::Tracking {
                reply,
                transition,
                idle,
            },
        );
    }

    pub(super) fn update_description(&mut self, id: TaskId, text: String, reply: Reply<()>) {
        self.schedule_edit(id, FieldGroup::Description, TaskPatch::description(text), reply);
    }

    pub(super) fn update_deadline(&mut self, id: TaskId, deadline: Option<NaiveDateTime>, reply: Reply<()>) {
        self.schedule_edit(id, FieldGroup::Deadline, TaskPatch::deadline(deadline), reply);
    }

    /// Apply an edit locally and hand it to the coalescer. The caller gets its
    /// reply immediately; failures surface later as a notice.
    fn schedule_edit(&mut self, id: TaskId, group: FieldGroup, patch: TaskPatch, reply: Reply<()>) {
        let Some(task) = self.mirror.get_by_id(&id) else {
            log::debug!("Edit of unknown task {} ignored", id);
            let _ = reply.send(Ok(()));
            return;
        };
        let previous = patch.capture(task);
        self.mirror.apply_patch(&id, &patch);
        self.publish();
        self.coalescer.schedule(WriteKey::new(id, group), patch, previous);
        let _ = reply.send(Ok(()));
    }

    pub(super) fn on_fired(&mut self, fired: Fired) {
        if let Some(write) = self.coalescer.take_fired(&fired) {
            self.persist_coalesced(write);
        }
    }

    pub(super) fn persist_coalesced(&mut self, write: CoalescedWrite) {
        let id = write.key.task.clone();
        if !self.mirror.contains(&id) {
            log::debug!("Dropping edit of deleted task {}", id);
            self.coalescer.forget_task(&id);
            return;
        }
        let plan = self.patch_plan(Plan::default(), &id, &write.patch);
        self.submit(plan, Completion::Coalesced(write));
    }

    pub(super) fn reorder(
        &mut self,
        dragged: TaskId,
        target: TaskId,
        position: Option<DropPosition>,
        reply: Reply<()>,
    ) {
        let Some(writes) = plan_reorder(self.mirror.get_all(), &dragged, &target, position) else {
            log::debug!("Reorder of {} onto {} is a no-op", dragged, target);
            let _ = reply.send(Ok(()));
            return;
        };
        let mut plan = Plan::default();
        let mut changes = Vec::with_capacity(writes.len());
        for write in writes {
            let patch = TaskPatch::order(write.order);
            let Some(task) = self.mirror.get_by_id(&write.id) else {
                continue;
            };
            let undo = patch.capture(task);
            self.mirror.apply_patch(&write.id, &patch);
            plan = self.patch_plan(plan, &write.id, &patch);
            changes.push(Change {
                id: write.id,
                patch,
                undo,
            });
        }
        self.publish();
        self.submit(plan, Completion::Patches { reply, changes });
    }

    pub(super) fn reset_stats(&mut self, reply: Reply<()>) {
        let now = self.clock.now();
        self.tracker.tick(&mut self.mirror, now);
        let previous = self.mirror.stats().clone();
        let pending_idle = self.tracker.pending_idle();

        self.mirror.set_stats(Stats {
            total_focus_time: 0,
            total_idling_time: 0,
            last_reset_time: Some(now),
        });
        self.tracker.reset(now);
        self.save_pending_idle();
        self.publish();
        log::info!("Stats reset");

        let plan = Plan::default().stats(&self.paths, self.mirror.stats());
        self.submit(
            plan,
            Completion::ResetStats {
                reply,
                previous,
                pending_idle,
                at: now,
            },
        );
    }
}
