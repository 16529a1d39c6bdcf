//! The sync engine.
//!
//! One task owns the mirror, the tracker, the breaker and every timer. All
//! mutations arrive as commands; remote I/O runs elsewhere and reports back as
//! events, so no handler ever waits on the network.

mod handle;
mod ops;

pub use handle::EngineHandle;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDateTime;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::config::{DocumentPaths, EngineConfig};
use crate::core::clock::Clock;
use crate::core::mirror::{Mirror, MirrorSnapshot};
use crate::core::reorder::DropPosition;
use crate::core::task::{NewTask, Task, TaskId};
use crate::core::tracking::{RemoteVerdict, TimeTracker};
use crate::error::{EngineError, FallbackError, RemoteError};
use crate::sync::backlog::Backlog;
use crate::sync::breaker::{BreakerState, CircuitBreaker, Observation, Trip};
use crate::sync::coalesce::{Fired, WriteCoalescer};
use crate::sync::disposer::Disposer;
use crate::sync::fallback::{FallbackStore, ScopedFallback};
use crate::sync::merge::{LocalOverlay, overlay_local};
use crate::sync::reconcile::{reconcile, stats_from_fields};
use crate::sync::remote::{
    ChangeKind, CollectionSnapshot, Fields, RawDocument, RemoteStore, RemoteWrite, SnapshotStream, WriteAck, execute_all,
};

use ops::{Completion, Job, PendingAdd, Plan};

const COMMAND_QUEUE: usize = 64;
const NOTICE_CAPACITY: usize = 16;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Something the renderer should tell the user about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Remote quota exhausted; the engine now works against the fallback store.
    /// Sent once per session.
    QuotaExceeded,
    /// A canary write succeeded and offline changes were replayed.
    Recovered,
    /// A background write or the subscription failed.
    SyncFailed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub initialized: bool,
    pub breaker: BreakerState,
    pub tracking: Option<TaskId>,
    /// Debounced edits not yet flushed plus writes in flight.
    pub pending_writes: usize,
}

pub(crate) enum Command {
    Start(Reply<()>),
    AddTask(NewTask, Reply<TaskId>),
    DeleteTask(TaskId, Reply<()>),
    ToggleComplete(TaskId, Reply<()>),
    StartTracking(TaskId, Reply<()>),
    StopTracking(Reply<()>),
    UpdateDescription(TaskId, String, Reply<()>),
    UpdateDeadline(TaskId, Option<NaiveDateTime>, Reply<()>),
    Reorder {
        dragged: TaskId,
        target: TaskId,
        position: Option<DropPosition>,
        reply: Reply<()>,
    },
    ResetStats(Reply<()>),
    Status(oneshot::Sender<EngineStatus>),
    Shutdown(Reply<()>),
}

impl Command {
    fn reject(self, err: EngineError) {
        match self {
            Command::AddTask(_, reply) => {
                let _ = reply.send(Err(err));
            }
            Command::Start(reply)
            | Command::DeleteTask(_, reply)
            | Command::ToggleComplete(_, reply)
            | Command::StartTracking(_, reply)
            | Command::StopTracking(reply)
            | Command::UpdateDescription(_, _, reply)
            | Command::UpdateDeadline(_, _, reply)
            | Command::Reorder { reply, .. }
            | Command::ResetStats(reply)
            | Command::Shutdown(reply) => {
                let _ = reply.send(Err(err));
            }
            Command::Status(_) => {}
        }
    }
}

pub(crate) enum Event {
    StatsLoaded(Result<Option<RawDocument>, RemoteError>),
    Persisted { seq: u64, result: JobResult },
    IdleTick,
    CanaryTick,
    CanaryDone(Result<(), RemoteError>),
}

pub(crate) enum JobResult {
    Written(Vec<WriteAck>),
    /// The breaker opened before the job ran; nothing was sent.
    Skipped,
    Failed(RemoteError),
}

pub(crate) struct WriteJob {
    seq: u64,
    writes: Vec<RemoteWrite>,
}

/// Receivers polled by the run loop.
struct Inbox {
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedReceiver<Event>,
    fired: mpsc::UnboundedReceiver<Fired>,
    subscription: Option<SnapshotStream>,
}

/// Runs remote writes one job at a time so writes reach the store in the order
/// they were issued. Once a quota failure is seen, later jobs are skipped until
/// the engine reopens the gate.
async fn run_writer(
    remote: Arc<dyn RemoteStore>,
    gate: Arc<AtomicBool>,
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(job) = jobs.recv().await {
        let result = if gate.load(Ordering::SeqCst) {
            JobResult::Skipped
        } else {
            match execute_all(remote.as_ref(), job.writes).await {
                Ok(acks) => JobResult::Written(acks),
                Err(e) => {
                    if e.is_quota() {
                        gate.store(true, Ordering::SeqCst);
                    }
                    JobResult::Failed(e)
                }
            }
        };
        if events.send(Event::Persisted { seq: job.seq, result }).is_err() {
            break;
        }
    }
}

async fn next_snapshot(slot: &mut Option<SnapshotStream>) -> Option<Result<CollectionSnapshot, RemoteError>> {
    match slot.as_mut() {
        Some(stream) => stream.next().await,
        None => None,
    }
}

pub struct Engine {
    config: EngineConfig,
    paths: DocumentPaths,
    remote: Arc<dyn RemoteStore>,
    fallback: ScopedFallback,
    clock: Arc<dyn Clock>,
    mirror: Mirror,
    tracker: TimeTracker,
    breaker: CircuitBreaker,
    coalescer: WriteCoalescer,
    backlog: Backlog,
    initialized: bool,
    starting: Option<Reply<()>>,
    /// Set while remote writes must not be attempted. Shared with the writer.
    gate: Arc<AtomicBool>,
    writer_tx: mpsc::UnboundedSender<WriteJob>,
    events_tx: mpsc::UnboundedSender<Event>,
    jobs: BTreeMap<u64, Job>,
    next_seq: u64,
    pending_adds: HashMap<TaskId, PendingAdd>,
    idle_flush_in_flight: bool,
    canary_in_flight: bool,
    subscribed: bool,
    /// Applied to the inbox after the current handler returns.
    subscription_change: Option<Option<SnapshotStream>>,
    idle_ticker: Disposer,
    canary: Disposer,
    writer: Disposer,
    mirror_tx: watch::Sender<Arc<MirrorSnapshot>>,
    notices: broadcast::Sender<Notice>,
    accepting: bool,
    stopping: bool,
    shutdown_replies: Vec<Reply<()>>,
}

impl Engine {
    /// Start the engine task and return a handle to it. Nothing touches the
    /// remote store until [`EngineHandle::start`] is called.
    pub fn spawn(
        config: EngineConfig,
        remote: Arc<dyn RemoteStore>,
        fallback: Arc<dyn FallbackStore>,
        clock: Arc<dyn Clock>,
    ) -> EngineHandle {
        if config.debug_logging {
            crate::set_debug_logging(true);
        }

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (coalescer, fired_rx) = WriteCoalescer::new(config.quiet_period());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        let mirror = Mirror::new();
        let (mirror_tx, mirror_rx) = watch::channel(mirror.snapshot());
        let gate = Arc::new(AtomicBool::new(false));
        let writer = Disposer::spawn(run_writer(remote.clone(), gate.clone(), writer_rx, events_tx.clone()));

        let engine = Engine {
            paths: config.paths(),
            fallback: ScopedFallback::new(fallback, config.user_id()),
            tracker: TimeTracker::new(clock.now()),
            config,
            remote,
            clock,
            mirror,
            breaker: CircuitBreaker::new(),
            coalescer,
            backlog: Backlog::default(),
            initialized: false,
            starting: None,
            gate,
            writer_tx,
            events_tx,
            jobs: BTreeMap::new(),
            next_seq: 0,
            pending_adds: HashMap::new(),
            idle_flush_in_flight: false,
            canary_in_flight: false,
            subscribed: false,
            subscription_change: None,
            idle_ticker: Disposer::default(),
            canary: Disposer::default(),
            writer,
            mirror_tx,
            notices: notices.clone(),
            accepting: true,
            stopping: false,
            shutdown_replies: Vec::new(),
        };
        let inbox = Inbox {
            commands: commands_rx,
            events: events_rx,
            fired: fired_rx,
            subscription: None,
        };
        tokio::spawn(engine.run(inbox));

        EngineHandle::new(commands_tx, mirror_rx, notices)
    }

    async fn run(mut self, mut inbox: Inbox) {
        log::info!("Sync engine running for user {}", self.fallback.user_id());
        loop {
            // Snapshots first: a snapshot queued before a write acknowledgement
            // must be folded in before that acknowledgement.
            tokio::select! {
                biased;
                snapshot = next_snapshot(&mut inbox.subscription), if inbox.subscription.is_some() => {
                    match snapshot {
                        Some(result) => self.on_snapshot(result),
                        None => {
                            log::info!("Task subscription ended");
                            inbox.subscription = None;
                            self.subscribed = false;
                        }
                    }
                }
                Some(event) = inbox.events.recv() => self.handle_event(event),
                Some(fired) = inbox.fired.recv() => self.on_fired(fired),
                command = inbox.commands.recv(), if self.accepting => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        log::info!("All engine handles dropped, shutting down");
                        self.begin_shutdown(None);
                    }
                },
            }

            if let Some(change) = self.subscription_change.take() {
                inbox.subscription = change;
            }
            if self.stopping && self.jobs.is_empty() {
                self.finish_shutdown();
                break;
            }
        }
        self.writer.dispose();
        log::info!("Sync engine stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => self.start(reply),
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown(reply) => self.begin_shutdown(Some(reply)),
            command if !self.initialized => command.reject(EngineError::NotInitialized),
            Command::AddTask(new, reply) => self.add_task(new, reply),
            Command::DeleteTask(id, reply) => self.delete_task(id, reply),
            Command::ToggleComplete(id, reply) => self.toggle_complete(id, reply),
            Command::StartTracking(id, reply) => self.start_tracking(id, reply),
            Command::StopTracking(reply) => self.stop_tracking(reply),
            Command::UpdateDescription(id, text, reply) => self.update_description(id, text, reply),
            Command::UpdateDeadline(id, deadline, reply) => self.update_deadline(id, deadline, reply),
            Command::Reorder {
                dragged,
                target,
                position,
                reply,
            } => self.reorder(dragged, target, position, reply),
            Command::ResetStats(reply) => self.reset_stats(reply),
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::StatsLoaded(result) => self.on_stats_loaded(result),
            Event::Persisted { seq, result } => self.on_persisted(seq, result),
            Event::IdleTick => self.on_idle_tick(),
            Event::CanaryTick => self.on_canary_tick(),
            Event::CanaryDone(result) => self.on_canary_done(result),
        }
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            initialized: self.initialized,
            breaker: self.breaker.state(),
            tracking: self.tracker.tracking_task().cloned(),
            pending_writes: self.coalescer.pending_count() + self.jobs.len(),
        }
    }

    fn publish(&self) {
        self.mirror_tx.send_replace(self.mirror.snapshot());
    }

    fn notify(&self, notice: Notice) {
        // No receivers is fine.
        let _ = self.notices.send(notice);
    }

    // Startup

    fn start(&mut self, reply: Reply<()>) {
        if self.initialized {
            let _ = reply.send(Ok(()));
            return;
        }
        if self.starting.is_some() || self.stopping {
            let _ = reply.send(Err(EngineError::NotInitialized));
            return;
        }

        self.backlog = self.fallback.load_backlog().unwrap_or_else(|e| {
            log::warn!("Discarding unreadable offline backlog: {}", e);
            Backlog::default()
        });
        match self.fallback.load_pending_idle() {
            Ok(ms) => self.tracker.restore_pending_idle(ms),
            Err(e) => log::warn!("Failed to read pending idle time: {}", e),
        }
        let offline = self.fallback.quota_exceeded().unwrap_or_else(|e| {
            log::warn!("Failed to read quota flag: {}", e);
            false
        });

        if offline {
            log::info!("Quota flag set, starting from fallback store");
            let result = self.load_fallback_mirror(true).map(|()| {
                self.initialized = true;
                self.trip_breaker("quota flag set at startup");
                self.start_idle_ticker();
            });
            let _ = reply.send(result.map_err(EngineError::from));
            return;
        }

        log::info!("Reading stats from {}", self.paths.stats_doc());
        self.starting = Some(reply);
        let read = self.remote.get_document(&self.paths.stats_doc());
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let _ = events.send(Event::StatsLoaded(read.await));
        });
    }

    fn on_stats_loaded(&mut self, result: Result<Option<RawDocument>, RemoteError>) {
        let Some(reply) = self.starting.take() else {
            return;
        };
        let outcome = match result {
            Ok(doc) => {
                let mut stats = doc.map(|d| stats_from_fields(&d.fields)).unwrap_or_default();
                let leftover = self.tracker.pending_idle();
                if leftover > 0 {
                    log::info!("Recovering {} ms of unflushed idle time", leftover);
                    stats.total_idling_time = stats.total_idling_time.saturating_add(leftover);
                }
                self.mirror.set_stats(stats);
                if !self.backlog.is_empty() {
                    if let Err(e) = self.load_fallback_mirror(false) {
                        log::warn!("Failed to load offline tasks for replay: {}", e);
                    }
                }
                self.publish();
                self.initialized = true;
                self.start_idle_ticker();
                if leftover > 0 {
                    self.flush_idle();
                }
                self.resume_remote(false);
                log::info!("Sync engine started");
                Ok(())
            }
            Err(e) if e.is_quota() => {
                log::warn!("Quota exhausted reading stats: {}", e);
                self.load_fallback_mirror(true)
                    .map(|()| {
                        self.initialized = true;
                        self.observe_failure(&e);
                        self.start_idle_ticker();
                    })
                    .map_err(EngineError::from)
            }
            Err(e) => {
                log::warn!("Failed to read stats: {}", e);
                Err(EngineError::from(e))
            }
        };
        let _ = reply.send(outcome);
    }

    /// Seed the mirror from the fallback copy. With `with_stats` the stored
    /// totals replace the mirror's.
    fn load_fallback_mirror(&mut self, with_stats: bool) -> Result<(), FallbackError> {
        let tasks = self.fallback.load_tasks()?.unwrap_or_default();
        if with_stats {
            let stats = self.fallback.load_stats()?.unwrap_or_default();
            self.mirror.set_stats(stats);
        }
        let now = self.clock.now();
        self.tracker.observe_remote(&mut self.mirror, &tasks, now);
        log::info!("Loaded {} tasks from fallback store", tasks.len());
        self.mirror.replace_all(tasks);
        self.publish();
        Ok(())
    }

    /// Replay offline changes if there are any, then subscribe.
    fn resume_remote(&mut self, recovering: bool) {
        if self.backlog.is_empty() {
            self.subscribe();
            if recovering {
                self.notify(Notice::Recovered);
            }
            return;
        }
        let backlog = std::mem::take(&mut self.backlog);
        log::info!("Replaying {} offline changes", backlog.len());
        let writes = backlog.plan(&self.mirror, &self.paths);
        self.submit(Plan::replay(writes), Completion::Replay { backlog, recovering });
    }

    fn subscribe(&mut self) {
        let collection = self.paths.tasks_collection();
        log::info!("Subscribing to {}", collection);
        let stream = self.remote.subscribe_collection(&collection);
        self.subscription_change = Some(Some(stream));
        self.subscribed = true;
    }

    fn unsubscribe(&mut self) {
        if self.subscribed {
            log::info!("Task subscription stopped");
            self.subscription_change = Some(None);
            self.subscribed = false;
        }
    }

    // Reconciliation

    fn on_snapshot(&mut self, result: Result<CollectionSnapshot, RemoteError>) {
        if self.breaker.is_open() || !self.subscribed {
            return;
        }
        match result {
            Ok(snapshot) => self.apply_snapshot(&snapshot),
            Err(e) => {
                if !self.observe_failure(&e) {
                    log::warn!("Task subscription error: {}", e);
                    self.notify(Notice::SyncFailed { message: e.to_string() });
                }
            }
        }
    }

    fn apply_snapshot(&mut self, snapshot: &CollectionSnapshot) {
        let mut reconciled = reconcile(snapshot);
        let now = self.clock.now();
        self.hold_landed_adds(snapshot, &mut reconciled.tasks);

        let provisional: Vec<Task> = self
            .pending_adds
            .keys()
            .filter_map(|id| self.mirror.get_by_id(id).cloned())
            .collect();
        let mut remote_view = reconciled.tasks.clone();
        remote_view.extend(provisional.iter().cloned());

        match self.tracker.observe_remote(&mut self.mirror, &remote_view, now) {
            RemoteVerdict::Adopted(id) => log::info!("Following tracking of {} from another client", id),
            RemoteVerdict::Cleared(id) => log::info!("Tracking of {} ended elsewhere", id),
            RemoteVerdict::KeepLocal | RemoteVerdict::Unchanged => {}
        }

        let vanished: Vec<TaskId> = self
            .mirror
            .get_all()
            .iter()
            .filter(|t| !remote_view.iter().any(|r| r.id == t.id))
            .map(|t| t.id.clone())
            .collect();
        for id in &vanished {
            self.coalescer.forget_task(id);
        }

        let overlay = self.local_overlay(provisional);
        let merged = overlay_local(reconciled.tasks, &overlay);
        self.mirror.replace_all(merged);
        self.publish();
        log::debug!(
            "Reconciled {} tasks ({} skipped, {} gone)",
            self.mirror.len(),
            reconciled.skipped,
            vanished.len()
        );
    }

    /// A snapshot can deliver an inserted document before the insert's
    /// acknowledgement. Until then the provisional copy stands in for it, so
    /// the server copy is held back rather than shown twice.
    fn hold_landed_adds(&mut self, snapshot: &CollectionSnapshot, incoming: &mut Vec<Task>) {
        if self.pending_adds.is_empty() {
            return;
        }
        let added: Vec<&str> = snapshot
            .changes
            .iter()
            .filter(|c| c.kind == ChangeKind::Added)
            .map(|c| c.id.as_str())
            .collect();
        let mut claimed: Vec<TaskId> = self.pending_adds.values().filter_map(|p| p.landed.clone()).collect();
        for (id, pending) in self.pending_adds.iter_mut() {
            if pending.landed.is_none() {
                let Some(created) = self.mirror.get_by_id(id).map(|t| t.created_at.timestamp_millis()) else {
                    continue;
                };
                pending.landed = incoming
                    .iter()
                    .find(|t| {
                        added.contains(&t.id.as_str())
                            && !self.mirror.contains(&t.id)
                            && !claimed.contains(&t.id)
                            && t.created_at.timestamp_millis() == created
                    })
                    .map(|t| t.id.clone());
                if let Some(server) = &pending.landed {
                    claimed.push(server.clone());
                    log::debug!("Task {} seen as {} before its insert was acknowledged", id, server);
                }
            }
            if let Some(server) = &pending.landed {
                incoming.retain(|t| &t.id != server);
            }
        }
    }

    fn local_overlay(&self, provisional: Vec<Task>) -> LocalOverlay {
        let mut edits = Vec::new();
        let mut removed = Vec::new();
        for job in self.jobs.values() {
            edits.extend(job.plan.overlay.iter().cloned());
            removed.extend(job.plan.deletes.iter().cloned());
        }
        edits.extend(self.coalescer.unacknowledged());
        LocalOverlay {
            edits,
            provisional,
            removed,
            tracking: self
                .tracker
                .local_override()
                .map(|(id, started)| (id.clone(), started)),
            settling: self.tracker.settling().clone(),
        }
    }

    // Breaker

    /// Feed a remote failure to the breaker. Returns `true` if it was
    /// quota-class and the engine is now offline.
    fn observe_failure(&mut self, err: &RemoteError) -> bool {
        match self.breaker.observe(err) {
            Observation::Tripped(trip) => {
                self.opened(trip, &err.message);
                true
            }
            Observation::Surface => false,
        }
    }

    /// Open the breaker. Repeated trips are no-ops.
    fn trip_breaker(&mut self, reason: &str) {
        let trip = self.breaker.trip();
        self.opened(trip, reason);
    }

    fn opened(&mut self, trip: Trip, reason: &str) {
        self.gate.store(true, Ordering::SeqCst);
        let Trip::Opened { first_report } = trip else {
            return;
        };
        log::warn!("Remote quota exhausted ({}), switching to fallback store", reason);
        self.unsubscribe();
        if let Err(e) = self.fallback.set_quota_exceeded(true) {
            log::error!("Failed to persist quota flag: {}", e);
        }
        if let Err(e) = self.save_offline_copy() {
            log::error!("Failed to save offline copy: {}", e);
        }
        self.start_canary();
        if first_report {
            self.notify(Notice::QuotaExceeded);
        }
    }

    fn start_canary(&mut self) {
        let events = self.events_tx.clone();
        let period = self.config.canary_interval();
        self.canary = Disposer::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                if events.send(Event::CanaryTick).is_err() {
                    break;
                }
            }
        });
    }

    fn on_canary_tick(&mut self) {
        if !self.breaker.is_open() || self.canary_in_flight || self.stopping {
            return;
        }
        self.canary_in_flight = true;
        let mut fields = Fields::new();
        fields.insert("probedAt".into(), Value::String(self.clock.now().to_rfc3339()));
        log::debug!("Sending canary write");
        let write = self.remote.set_document(&self.paths.canary_doc(), fields, true);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let _ = events.send(Event::CanaryDone(write.await));
        });
    }

    fn on_canary_done(&mut self, result: Result<(), RemoteError>) {
        self.canary_in_flight = false;
        match result {
            Ok(()) if self.breaker.is_open() && !self.stopping => self.recover(),
            Ok(()) => {}
            Err(e) => log::debug!("Canary write failed: {}", e),
        }
    }

    fn recover(&mut self) {
        self.breaker.close();
        self.gate.store(false, Ordering::SeqCst);
        self.canary.dispose();
        log::info!("Canary write succeeded, remote store is back");
        if let Err(e) = self.fallback.set_quota_exceeded(false) {
            log::error!("Failed to clear quota flag: {}", e);
        }
        self.resume_remote(true);
    }

    // Idle clock

    fn start_idle_ticker(&mut self) {
        let events = self.events_tx.clone();
        let period = self.config.idle_tick();
        self.idle_ticker = Disposer::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                if events.send(Event::IdleTick).is_err() {
                    break;
                }
            }
        });
    }

    fn on_idle_tick(&mut self) {
        if !self.initialized || self.stopping {
            return;
        }
        let now = self.clock.now();
        if self.tracker.tick(&mut self.mirror, now) > 0 {
            self.publish();
        }
        self.save_pending_idle();
        if self.breaker.is_open() {
            self.backlog.record_stats();
            if let Err(e) = self.save_offline_copy() {
                log::error!("Failed to save offline copy: {}", e);
            }
        } else {
            self.flush_idle();
        }
    }

    /// Write the stats totals if idle time is waiting to be committed.
    fn flush_idle(&mut self) {
        let amount = self.tracker.pending_idle();
        if amount == 0 || self.idle_flush_in_flight {
            return;
        }
        self.idle_flush_in_flight = true;
        let plan = Plan::default().stats(&self.paths, self.mirror.stats());
        self.submit(plan, Completion::IdleFlush { amount });
    }

    // Fallback persistence

    fn save_offline_copy(&self) -> Result<(), FallbackError> {
        self.fallback.save_tasks(self.mirror.get_all())?;
        self.fallback.save_stats(self.mirror.stats())?;
        self.fallback.save_pending_idle(self.tracker.pending_idle())?;
        self.fallback.save_backlog(&self.backlog)
    }

    fn save_pending_idle(&self) {
        if let Err(e) = self.fallback.save_pending_idle(self.tracker.pending_idle()) {
            log::warn!("Failed to persist pending idle time: {}", e);
        }
    }

    // Shutdown

    fn begin_shutdown(&mut self, reply: Option<Reply<()>>) {
        self.shutdown_replies.extend(reply);
        if self.stopping {
            return;
        }
        log::info!("Shutting down sync engine");
        self.stopping = true;
        self.accepting = false;
        self.idle_ticker.dispose();
        self.canary.dispose();
        self.unsubscribe();
        if let Some(reply) = self.starting.take() {
            let _ = reply.send(Err(EngineError::Stopped));
        }
        if !self.initialized {
            return;
        }
        let now = self.clock.now();
        if self.tracker.tick(&mut self.mirror, now) > 0 {
            self.publish();
        }
        for write in self.coalescer.take_all() {
            self.persist_coalesced(write);
        }
    }

    fn finish_shutdown(&mut self) {
        if self.initialized {
            self.save_pending_idle();
            if self.breaker.is_open() {
                if let Err(e) = self.save_offline_copy() {
                    log::error!("Failed to save offline copy: {}", e);
                }
            }
        }
        for reply in self.shutdown_replies.drain(..) {
            let _ = reply.send(Ok(()));
        }
    }
}
