//! Debounced writes: many edits of one field group become one durable write
//! once the field has been quiet for a while.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::core::task::{TaskId, TaskPatch};

use super::disposer::Disposer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldGroup {
    Description,
    Deadline,
}

/// Coalescing unit: one task, one group of fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WriteKey {
    pub task: TaskId,
    pub group: FieldGroup,
}

impl WriteKey {
    pub fn new(task: TaskId, group: FieldGroup) -> Self {
        Self { task, group }
    }
}

/// Timer notification: the key has been quiet for the full period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fired {
    pub key: WriteKey,
    pub generation: u64,
}

/// A write that is ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct CoalescedWrite {
    pub key: WriteKey,
    pub patch: TaskPatch,
    pub generation: u64,
}

#[derive(Debug)]
struct Pending {
    generation: u64,
    patch: TaskPatch,
    timer: Disposer,
}

#[derive(Debug)]
struct Slot {
    pending: Option<Pending>,
    in_flight: Option<(u64, TaskPatch)>,
    /// Last value known to be durable; what a failed write reverts to.
    confirmed: TaskPatch,
}

impl Slot {
    fn is_idle(&self) -> bool {
        self.pending.is_none() && self.in_flight.is_none()
    }
}

#[derive(Debug)]
pub struct WriteCoalescer {
    quiet: Duration,
    slots: HashMap<WriteKey, Slot>,
    next_generation: u64,
    fired_tx: mpsc::UnboundedSender<Fired>,
}

impl WriteCoalescer {
    pub fn new(quiet: Duration) -> (Self, mpsc::UnboundedReceiver<Fired>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let coalescer = Self {
            quiet,
            slots: HashMap::new(),
            next_generation: 0,
            fired_tx,
        };
        (coalescer, fired_rx)
    }

    /// Register an edit. Any timer already armed for `key` is cancelled before
    /// the new one starts. `previous` is the value the caller just overwrote in
    /// the mirror; it becomes the revert target if nothing is confirmed yet.
    pub fn schedule(&mut self, key: WriteKey, patch: TaskPatch, previous: TaskPatch) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;

        let slot = self.slots.entry(key.clone()).or_insert_with(|| Slot {
            pending: None,
            in_flight: None,
            confirmed: previous,
        });

        let mut merged = match slot.pending.take() {
            Some(old) => old.patch,
            None => TaskPatch::default(),
        };
        merged.merge(&patch);

        slot.pending = Some(Pending {
            generation,
            patch: merged,
            timer: Self::arm(&self.fired_tx, self.quiet, key, generation),
        });
        generation
    }

    fn arm(tx: &mpsc::UnboundedSender<Fired>, quiet: Duration, key: WriteKey, generation: u64) -> Disposer {
        let tx = tx.clone();
        Disposer::spawn(async move {
            tokio::time::sleep(quiet).await;
            let _ = tx.send(Fired { key, generation });
        })
    }

    /// Claim the write for a timer that fired. Stale notifications (the key was
    /// rescheduled or forgotten meanwhile) yield `None`.
    pub fn take_fired(&mut self, fired: &Fired) -> Option<CoalescedWrite> {
        let slot = self.slots.get_mut(&fired.key)?;
        if slot.pending.as_ref().map(|p| p.generation) != Some(fired.generation) {
            return None;
        }
        let pending = slot.pending.take()?;
        slot.in_flight = Some((pending.generation, pending.patch.clone()));
        Some(CoalescedWrite {
            key: fired.key.clone(),
            patch: pending.patch,
            generation: pending.generation,
        })
    }

    /// Claim every pending write without waiting for its timer.
    pub fn take_all(&mut self) -> Vec<CoalescedWrite> {
        let mut writes = Vec::new();
        for (key, slot) in self.slots.iter_mut() {
            if let Some(pending) = slot.pending.take() {
                slot.in_flight = Some((pending.generation, pending.patch.clone()));
                writes.push(CoalescedWrite {
                    key: key.clone(),
                    patch: pending.patch,
                    generation: pending.generation,
                });
            }
        }
        writes
    }

    /// The write is durable (remotely, or in the fallback store).
    pub fn confirm(&mut self, write: &CoalescedWrite) {
        let Some(slot) = self.slots.get_mut(&write.key) else {
            return;
        };
        slot.confirmed.merge(&write.patch);
        if slot.in_flight.as_ref().map(|(g, _)| *g) == Some(write.generation) {
            slot.in_flight = None;
        }
        if slot.is_idle() {
            self.slots.remove(&write.key);
        }
    }

    /// The write failed for good. Returns the patch that restores the last
    /// confirmed value, unless a newer edit of the same key supersedes it.
    pub fn reject(&mut self, write: &CoalescedWrite) -> Option<TaskPatch> {
        let slot = self.slots.get_mut(&write.key)?;
        if slot.in_flight.as_ref().map(|(g, _)| *g) == Some(write.generation) {
            slot.in_flight = None;
        }
        if !slot.is_idle() {
            return None;
        }
        self.slots.remove(&write.key).map(|slot| slot.confirmed)
    }

    /// Drop all state for a task (it was deleted).
    pub fn forget_task(&mut self, task: &TaskId) {
        self.slots.retain(|key, _| &key.task != task);
    }

    /// Move state to a new id after the remote store assigned one.
    pub fn rekey_task(&mut self, from: &TaskId, to: &TaskId) {
        let keys: Vec<WriteKey> = self.slots.keys().filter(|k| &k.task == from).cloned().collect();
        for key in keys {
            if let Some(mut slot) = self.slots.remove(&key) {
                let moved = WriteKey::new(to.clone(), key.group);
                // The old timer would fire under the old key; restart it.
                if let Some(pending) = slot.pending.as_mut() {
                    log::debug!("Pending edit of {} rekeyed to {}", from, to);
                    pending.timer = Self::arm(&self.fired_tx, self.quiet, moved.clone(), pending.generation);
                }
                self.slots.insert(moved, slot);
            }
        }
    }

    /// Edits not yet acknowledged, newest last. A reconcile must not clobber them.
    pub fn unacknowledged(&self) -> Vec<(TaskId, TaskPatch)> {
        let mut out = Vec::new();
        for (key, slot) in &self.slots {
            let mut patch = TaskPatch::default();
            if let Some((_, p)) = &slot.in_flight {
                patch.merge(p);
            }
            if let Some(p) = &slot.pending {
                patch.merge(&p.patch);
            }
            if !patch.is_empty() {
                out.push((key.task.clone(), patch));
            }
        }
        out
    }

    pub fn pending_count(&self) -> usize {
        self.slots.values().filter(|s| s.pending.is_some()).count()
    }
}
