//! Per-app supervision engine.
//!
//! A [`Supervisor`] owns the worker pool of one app and is driven by a single
//! task: worker events and control commands are processed one at a time, so
//! every handler sees a consistent pool. External callers talk to it through
//! a cloneable [`SupervisorHandle`].
//!
//! Lifecycle: `STARTING -> ONLINE -> STOPPING -> STOPPED`. A worker that exits
//! before the pool first comes online aborts the app instead of being
//! respawned.

use crate::config::{AppConfig, ConfigError};
use crate::log;
use crate::log_ring::{LogRing, SubscriberId};
use crate::protocol::{SupervisorState, SupervisorStatus};
use crate::sys::Signal;
use crate::usage::{self, ProcessTable};
use crate::worker::{EventSender, Launcher, WorkerEvent, WorkerHandle, WorkerId};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("supervisor is shutting down")]
    ShuttingDown,
    #[error("app is still starting")]
    Starting,
    #[error("no worker with id {0}")]
    UnknownWorker(WorkerId),
    #[error("failed to message worker {0}: {1}")]
    Send(WorkerId, String),
}

pub type ReloadReply = oneshot::Sender<Result<(), SupervisorError>>;

/// How the engine task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Stopped,
    BootFailed,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor {
    app: String,
    instances: usize,
    reload_signal: Signal,
    kill_timeout: Option<Duration>,
    launcher: Box<dyn Launcher>,
    events: EventSender,
    events_rx: Option<mpsc::UnboundedReceiver<WorkerEvent>>,
    started_at: Instant,

    workers: BTreeMap<WorkerId, WorkerHandle>,
    next_id: WorkerId,
    status: SupervisorState,
    online_count: usize,
    death_count: u64,
    kill_count: u64,
    has_started: bool,
    boot_failed: bool,
    /// Workers belonging to the current reload generation.
    generation: HashSet<WorkerId>,
    reload_instant: bool,
    /// `Some` while a reload is in flight.
    reload_waiters: Option<Vec<ReloadReply>>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    ready: Option<oneshot::Sender<()>>,

    log: LogRing,
    log_sink: Option<mpsc::UnboundedSender<String>>,
}

impl Supervisor {
    pub fn new(config: &AppConfig, launcher: Box<dyn Launcher>) -> Result<Self, ConfigError> {
        let reload_signal = config.reload_signal()?;
        let kill_timeout =
            (config.kill_timeout_ms > 0).then(|| Duration::from_millis(config.kill_timeout_ms));
        let (events, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            app: config.id.clone(),
            instances: config.instances.max(1),
            reload_signal,
            kill_timeout,
            launcher,
            events,
            events_rx: Some(events_rx),
            started_at: Instant::now(),
            workers: BTreeMap::new(),
            next_id: 1,
            status: SupervisorState::Starting,
            online_count: 0,
            death_count: 0,
            kill_count: 0,
            has_started: false,
            boot_failed: false,
            generation: HashSet::new(),
            reload_instant: false,
            reload_waiters: None,
            shutdown_waiters: Vec::new(),
            ready: None,
            log: LogRing::default(),
            log_sink: None,
        })
    }

    /// Persist every tagged output line through `sink`.
    pub fn with_log_sink(mut self, sink: mpsc::UnboundedSender<String>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Sender for readiness and output events coming from outside the launcher.
    pub fn event_sender(&self) -> EventSender {
        self.events.clone()
    }

    /// Resolves the first time the pool reaches `instances` online workers.
    /// Dropped without firing if the app stops first.
    pub fn ready_signal(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.ready = Some(tx);
        rx
    }

    // -- accessors ----------------------------------------------------------

    pub fn state(&self) -> SupervisorState {
        self.status
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn online_count(&self) -> usize {
        self.online_count
    }

    pub fn death_count(&self) -> u64 {
        self.death_count
    }

    pub fn kill_count(&self) -> u64 {
        self.kill_count
    }

    pub fn has_started(&self) -> bool {
        self.has_started
    }

    pub fn is_reloading(&self) -> bool {
        self.reload_waiters.is_some()
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.keys().copied().collect()
    }

    pub fn in_generation(&self, id: WorkerId) -> bool {
        self.generation.contains(&id)
    }

    fn is_stopping(&self) -> bool {
        matches!(
            self.status,
            SupervisorState::Stopping | SupervisorState::Stopped
        )
    }

    fn is_stopped(&self) -> bool {
        self.status == SupervisorState::Stopped
    }

    // -- pool management ----------------------------------------------------

    /// Tops the pool up to `instances`. New workers join the current generation.
    pub fn fork(&mut self) {
        if self.is_stopping() {
            return;
        }
        let to_spawn = self.instances.saturating_sub(self.workers.len());
        for _ in 0..to_spawn {
            if self.spawn_worker().is_none() {
                if !self.has_started {
                    self.abort_boot();
                }
                return;
            }
        }
    }

    fn spawn_worker(&mut self) -> Option<WorkerId> {
        let id = self.next_id;
        self.next_id += 1;
        match self.launcher.launch(id, &self.events) {
            Ok(process) => {
                let handle = WorkerHandle::new(id, process);
                tracing::info!(app = %self.app, worker = id, pid = ?handle.pid(), "forked worker");
                self.generation.insert(id);
                self.workers.insert(id, handle);
                Some(id)
            }
            Err(e) => {
                tracing::error!(app = %self.app, worker = id, "failed to spawn worker: {e}");
                None
            }
        }
    }

    fn abort_boot(&mut self) {
        tracing::error!(app = %self.app, "worker failed before the app came online, aborting");
        self.boot_failed = true;
        drop(self.shutdown(None));
    }

    /// Sends `signal` and waits for the worker to exit, force-killing it after
    /// the kill timeout.
    fn drain_worker(&mut self, id: WorkerId, signal: Signal) {
        let Some(worker) = self.workers.get_mut(&id) else {
            return;
        };
        worker.draining = true;
        worker.disconnect();
        self.kill_count += 1;
        if let Err(e) = worker.kill(signal) {
            tracing::warn!(app = %self.app, worker = id, "failed to send {}: {e}", signal.as_str());
        }
        if let Some(timeout) = self.kill_timeout {
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = events.send(WorkerEvent::DrainDeadline(id));
            });
        }
    }

    // -- events -------------------------------------------------------------

    pub fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Online(id) => self.on_online(id),
            WorkerEvent::Listening(id, address) => {
                if let Some(worker) = self.workers.get_mut(&id) {
                    tracing::info!(app = %self.app, worker = id, %address, "worker listening");
                    worker.on_listening(address);
                }
                self.on_online(id);
            }
            WorkerEvent::Output { id, stream, line } => {
                let formatted = log::format_line(&self.app, id, stream, &line);
                if let Some(worker) = self.workers.get_mut(&id) {
                    worker.log.log(formatted.clone());
                }
                if let Some(sink) = &self.log_sink {
                    let _ = sink.send(formatted.clone());
                }
                self.log.log(formatted);
            }
            WorkerEvent::Exited { id, code, signal } => self.on_exit(id, code, signal),
            WorkerEvent::DrainDeadline(id) => {
                if let Some(worker) = self.workers.get_mut(&id)
                    && worker.draining
                {
                    tracing::warn!(app = %self.app, worker = id, "worker ignored graceful signal, killing");
                    let _ = worker.force_kill();
                }
            }
        }
    }

    fn on_online(&mut self, id: WorkerId) {
        let Some(worker) = self.workers.get_mut(&id) else {
            return;
        };
        if worker.online {
            return;
        }
        worker.online = true;
        self.online_count += 1;

        if !self.has_started
            && self.status == SupervisorState::Starting
            && self.online_count >= self.instances
        {
            self.has_started = true;
            self.status = SupervisorState::Online;
            tracing::info!(app = %self.app, workers = self.workers.len(), "app online");
            if let Some(ready) = self.ready.take() {
                let _ = ready.send(());
            }
        }
    }

    fn on_exit(&mut self, id: WorkerId, code: Option<i32>, signal: Option<i32>) {
        let Some(mut worker) = self.workers.remove(&id) else {
            return;
        };
        self.generation.remove(&id);
        if worker.online {
            self.online_count -= 1;
        }
        worker.log.detach_all();
        tracing::info!(app = %self.app, worker = id, ?code, ?signal, "worker exited");

        if !self.has_started && !self.is_stopping() {
            self.abort_boot();
            return;
        }

        self.death_count += 1;
        self.fork();
        self.reload_step();
        self.check_stopped();
    }

    // -- reload -------------------------------------------------------------

    /// Replaces every current worker with a fresh one. Calls made while a
    /// reload is in flight restart the stale set and share its completion.
    pub fn reload(&mut self, instant: bool) -> oneshot::Receiver<Result<(), SupervisorError>> {
        let (tx, rx) = oneshot::channel();
        self.reload_with(instant, tx);
        rx
    }

    pub fn reload_with(&mut self, instant: bool, reply: ReloadReply) {
        if self.is_stopping() {
            let _ = reply.send(Err(SupervisorError::ShuttingDown));
            return;
        }
        // A signalled worker exiting during boot would read as a boot failure
        if !self.has_started {
            let _ = reply.send(Err(SupervisorError::Starting));
            return;
        }
        self.generation.clear();
        self.reload_instant = instant;
        tracing::info!(app = %self.app, instant, "reload requested");

        match self.reload_waiters.as_mut() {
            Some(waiters) => waiters.push(reply),
            None => {
                self.reload_waiters = Some(vec![reply]);
                self.reload_step();
            }
        }
    }

    fn reload_step(&mut self) {
        if self.reload_waiters.is_none() || self.is_stopping() {
            return;
        }

        let stale: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| !w.draining && !self.generation.contains(&w.id))
            .map(|w| w.id)
            .collect();

        if stale.is_empty() {
            if !self.workers.values().any(|w| w.draining) {
                tracing::info!(app = %self.app, "reload complete");
                for waiter in self.reload_waiters.take().unwrap_or_default() {
                    let _ = waiter.send(Ok(()));
                }
            }
            return;
        }

        let batch = if self.reload_instant { stale.len() } else { 1 };
        for id in stale.into_iter().take(batch) {
            self.replace_worker(id);
        }
    }

    fn replace_worker(&mut self, stale: WorkerId) {
        if let Some(fresh) = self.spawn_worker() {
            tracing::info!(app = %self.app, stale, fresh, "replacing worker");
        }
        self.drain_worker(stale, self.reload_signal);
    }

    // -- shutdown -----------------------------------------------------------

    /// Stops every worker: `signal` lets them drain, `None` kills them
    /// outright. Repeated calls share the same completion.
    pub fn shutdown(&mut self, signal: Option<Signal>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.shutdown_with(signal, tx);
        rx
    }

    pub fn shutdown_with(&mut self, signal: Option<Signal>, reply: oneshot::Sender<()>) {
        match self.status {
            SupervisorState::Stopped => {
                let _ = reply.send(());
                return;
            }
            SupervisorState::Stopping => {
                self.shutdown_waiters.push(reply);
                return;
            }
            _ => {}
        }

        tracing::info!(app = %self.app, ?signal, workers = self.workers.len(), "shutting down");
        self.status = SupervisorState::Stopping;
        self.shutdown_waiters.push(reply);
        self.ready.take();
        for waiter in self.reload_waiters.take().unwrap_or_default() {
            let _ = waiter.send(Err(SupervisorError::ShuttingDown));
        }

        for id in self.worker_ids() {
            match signal {
                Some(signal) => self.drain_worker(id, signal),
                None => {
                    if let Some(worker) = self.workers.get_mut(&id) {
                        worker.draining = true;
                        worker.disconnect();
                        if let Err(e) = worker.force_kill() {
                            tracing::warn!(app = %self.app, worker = id, "failed to kill: {e}");
                        }
                    }
                }
            }
        }

        self.check_stopped();
    }

    fn check_stopped(&mut self) {
        if self.status != SupervisorState::Stopping || !self.workers.is_empty() {
            return;
        }
        self.status = SupervisorState::Stopped;
        self.log.detach_all();
        tracing::info!(app = %self.app, deaths = self.death_count, kills = self.kill_count, "stopped");
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    // -- status, logs, messages ---------------------------------------------

    pub fn status_snapshot(&self, table: Option<&ProcessTable>) -> SupervisorStatus {
        let pid = std::process::id();
        let own = table.and_then(|t| t.get(pid));
        SupervisorStatus {
            pid,
            uptime: self.started_at.elapsed().as_secs(),
            cpu: own.map(|p| p.cpu_percent).unwrap_or_default(),
            mem: own.map(|p| p.rss_bytes).unwrap_or_default(),
            status: self.status,
            worker_count: self.workers.len(),
            online_count: self.online_count,
            death_count: self.death_count,
            kill_count: self.kill_count,
            reloading: self.is_reloading(),
            workers: self.workers.values().map(|w| w.status(table)).collect(),
        }
    }

    /// Attaches to the app-wide log (`None`) or one worker's log.
    pub fn subscribe(
        &mut self,
        worker: Option<WorkerId>,
        subscriber: mpsc::UnboundedSender<String>,
    ) -> Result<SubscriberId, SupervisorError> {
        if self.is_stopped() {
            return Err(SupervisorError::ShuttingDown);
        }
        match worker {
            None => Ok(self.log.attach(subscriber)),
            Some(id) => self
                .workers
                .get_mut(&id)
                .map(|w| w.log.attach(subscriber))
                .ok_or(SupervisorError::UnknownWorker(id)),
        }
    }

    pub fn unsubscribe(&mut self, worker: Option<WorkerId>, id: SubscriberId) {
        match worker {
            None => {
                self.log.detach(id);
            }
            Some(worker) => {
                if let Some(w) = self.workers.get_mut(&worker) {
                    w.log.detach(id);
                }
            }
        }
    }

    /// Messages one worker, or every worker when `target` is `None`.
    /// Returns the number of workers reached.
    pub fn send(
        &mut self,
        target: Option<WorkerId>,
        message: &serde_json::Value,
    ) -> Result<usize, SupervisorError> {
        match target {
            Some(id) => {
                let worker = self
                    .workers
                    .get_mut(&id)
                    .ok_or(SupervisorError::UnknownWorker(id))?;
                worker
                    .send(message)
                    .map_err(|e| SupervisorError::Send(id, e.to_string()))?;
                Ok(1)
            }
            None => {
                let mut reached = 0;
                for (id, worker) in self.workers.iter_mut() {
                    match worker.send(message) {
                        Ok(()) => reached += 1,
                        Err(e) => {
                            tracing::warn!(app = %self.app, worker = id, "broadcast failed: {e}")
                        }
                    }
                }
                Ok(reached)
            }
        }
    }

    // -- actor --------------------------------------------------------------

    /// Moves the engine onto its own task and forks the initial pool.
    pub fn start(self) -> (SupervisorHandle, tokio::task::JoinHandle<Outcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move { self.run(rx).await });
        (SupervisorHandle { commands: tx }, task)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> Outcome {
        let Some(mut events) = self.events_rx.take() else {
            return Outcome::Stopped;
        };

        self.fork();
        while !self.is_stopped() {
            tokio::select! {
                Some(event) = events.recv() => self.handle_event(event),
                Some(command) = commands.recv() => self.handle_command(command),
                else => break,
            }
        }

        if self.boot_failed {
            Outcome::BootFailed
        } else {
            Outcome::Stopped
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Status { table, reply } => {
                let _ = reply.send(self.status_snapshot(table.as_ref()));
            }
            Command::Reload { instant, reply } => self.reload_with(instant, reply),
            Command::Shutdown { signal, reply } => self.shutdown_with(signal, reply),
            Command::Subscribe {
                worker,
                subscriber,
                reply,
            } => {
                let _ = reply.send(self.subscribe(worker, subscriber));
            }
            Command::Unsubscribe { worker, id } => self.unsubscribe(worker, id),
            Command::Send {
                target,
                message,
                reply,
            } => {
                let _ = reply.send(self.send(target, &message));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

enum Command {
    Status {
        table: Option<ProcessTable>,
        reply: oneshot::Sender<SupervisorStatus>,
    },
    Reload {
        instant: bool,
        reply: ReloadReply,
    },
    Shutdown {
        signal: Option<Signal>,
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        worker: Option<WorkerId>,
        subscriber: mpsc::UnboundedSender<String>,
        reply: oneshot::Sender<Result<SubscriberId, SupervisorError>>,
    },
    Unsubscribe {
        worker: Option<WorkerId>,
        id: SubscriberId,
    },
    Send {
        target: Option<WorkerId>,
        message: serde_json::Value,
        reply: oneshot::Sender<Result<usize, SupervisorError>>,
    },
}

#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SupervisorHandle {
    fn submit(&self, command: Command) -> Result<(), SupervisorError> {
        self.commands
            .send(command)
            .map_err(|_| SupervisorError::ShuttingDown)
    }

    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.submit(build(tx))?;
        rx.await.map_err(|_| SupervisorError::ShuttingDown)
    }

    /// Samples process usage, then asks the engine for a snapshot.
    pub async fn status(&self) -> Result<SupervisorStatus, SupervisorError> {
        let table = usage::snapshot().await;
        self.ask(|reply| Command::Status { table, reply }).await
    }

    pub async fn reload(&self, instant: bool) -> Result<(), SupervisorError> {
        self.ask(|reply| Command::Reload { instant, reply }).await?
    }

    /// Starts a shutdown; the receiver resolves once every worker is gone.
    pub fn shutdown(&self, signal: Option<Signal>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        // A closed engine drops `tx`, which resolves the receiver with an error
        let _ = self.submit(Command::Shutdown { signal, reply: tx });
        rx
    }

    pub async fn subscribe(&self, worker: Option<WorkerId>) -> Result<LogFeed, SupervisorError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .ask(|reply| Command::Subscribe {
                worker,
                subscriber: tx,
                reply,
            })
            .await??;
        Ok(LogFeed {
            lines: rx,
            guard: DetachGuard {
                handle: self.clone(),
                worker,
                id,
            },
        })
    }

    pub async fn send(
        &self,
        target: Option<WorkerId>,
        message: serde_json::Value,
    ) -> Result<usize, SupervisorError> {
        self.ask(|reply| Command::Send {
            target,
            message,
            reply,
        })
        .await?
    }
}

/// Live log lines, backlog first. Detaches from the ring when dropped.
pub struct LogFeed {
    lines: mpsc::UnboundedReceiver<String>,
    guard: DetachGuard,
}

impl LogFeed {
    pub async fn next(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    pub fn worker(&self) -> Option<WorkerId> {
        self.guard.worker
    }
}

struct DetachGuard {
    handle: SupervisorHandle,
    worker: Option<WorkerId>,
    id: SubscriberId,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        let _ = self.handle.submit(Command::Unsubscribe {
            worker: self.worker,
            id: self.id,
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
