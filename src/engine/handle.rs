use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::core::mirror::MirrorSnapshot;
use crate::core::reorder::DropPosition;
use crate::core::task::{NewTask, TaskId};
use crate::error::EngineError;

use super::{Command, EngineStatus, Notice, Reply};

/// Cheap, cloneable front door to a running engine.
///
/// Mutations resolve once the change is durable (or safely parked in the
/// fallback store). Description and deadline edits resolve as soon as they are
/// applied locally; their writes are debounced.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    mirror: watch::Receiver<Arc<MirrorSnapshot>>,
    notices: broadcast::Sender<Notice>,
}

impl EngineHandle {
    pub(super) fn new(
        commands: mpsc::Sender<Command>,
        mirror: watch::Receiver<Arc<MirrorSnapshot>>,
        notices: broadcast::Sender<Notice>,
    ) -> Self {
        Self {
            commands,
            mirror,
            notices,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Load stats and subscribe to tasks, or open from the fallback store if the
    /// quota flag is set. Calling it again after success is a no-op.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.request(Command::Start).await
    }

    /// Returns the task's id: server-assigned when online, `local-` prefixed
    /// when created offline.
    pub async fn add_task(&self, task: NewTask) -> Result<TaskId, EngineError> {
        self.request(|reply| Command::AddTask(task, reply)).await
    }

    pub async fn delete_task(&self, id: &TaskId) -> Result<(), EngineError> {
        let id = id.clone();
        self.request(|reply| Command::DeleteTask(id, reply)).await
    }

    pub async fn toggle_complete(&self, id: &TaskId) -> Result<(), EngineError> {
        let id = id.clone();
        self.request(|reply| Command::ToggleComplete(id, reply)).await
    }

    /// Start tracking `id`, stopping whatever else was tracked.
    pub async fn start_tracking(&self, id: &TaskId) -> Result<(), EngineError> {
        let id = id.clone();
        self.request(|reply| Command::StartTracking(id, reply)).await
    }

    pub async fn stop_tracking(&self) -> Result<(), EngineError> {
        self.request(Command::StopTracking).await
    }

    pub async fn update_description(&self, id: &TaskId, text: impl Into<String>) -> Result<(), EngineError> {
        let (id, text) = (id.clone(), text.into());
        self.request(|reply| Command::UpdateDescription(id, text, reply)).await
    }

    pub async fn update_deadline(&self, id: &TaskId, deadline: Option<NaiveDateTime>) -> Result<(), EngineError> {
        let id = id.clone();
        self.request(|reply| Command::UpdateDeadline(id, deadline, reply)).await
    }

    /// Drop `dragged` next to `target`. Without a position the natural side for
    /// the drag direction is used.
    pub async fn reorder(
        &self,
        dragged: &TaskId,
        target: &TaskId,
        position: Option<DropPosition>,
    ) -> Result<(), EngineError> {
        let (dragged, target) = (dragged.clone(), target.clone());
        self.request(|reply| Command::Reorder {
            dragged,
            target,
            position,
            reply,
        })
        .await
    }

    pub async fn reset_stats(&self) -> Result<(), EngineError> {
        self.request(Command::ResetStats).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Status(tx))
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Flush pending edits and idle time, wait for in-flight writes, then stop.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(Command::Shutdown).await
    }

    /// Current view of tasks and stats.
    pub fn snapshot(&self) -> Arc<MirrorSnapshot> {
        self.mirror.borrow().clone()
    }

    /// A receiver that wakes on every published change.
    pub fn on_mirror_changed(&self) -> watch::Receiver<Arc<MirrorSnapshot>> {
        self.mirror.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }
}
