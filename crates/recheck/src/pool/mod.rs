//! Worker pool - runs checks across a bounded set of executors.
//!
//! A single coordinator task owns all pool state (refs, FIFO queue, free
//! workers, bound workers). Handles talk to it over a command channel;
//! executors report over an event channel. Nothing is shared, so nothing is
//! locked.
//!
//! Cancellation is asymmetric: a queued Ref is just dropped, a dispatched Ref
//! destroys its worker because an execution context interrupted mid-analysis
//! is not safe to reuse.

pub mod executor;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{CheckRequest, Response, WorkerRequest};
use crate::diagnostics::Diagnostics;
use crate::engine::SharedEngine;
use crate::options::{CheckOptions, ProgressSender, progress_text};
use crate::pending::PendingRegistry;

pub use executor::{
    EventSender, Executor, ExecutorFactory, ProcessExecutor, ProcessExecutorFactory,
    ThreadExecutor, ThreadExecutorFactory, WorkerEvent, WorkerEventKind, WorkerId,
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("failed to create worker: {0}")]
    Spawn(String),
    #[error("failed to encode check request: {0}")]
    Encode(String),
    #[error("worker exited while running a check")]
    WorkerExited,
    #[error("worker pool is closed")]
    Closed,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub max_workers: usize,
    /// Live workers, free or bound.
    pub running_workers: usize,
    pub free_workers: usize,
    /// Refs waiting for a worker.
    pub queued: usize,
    /// Refs not yet settled, queued or dispatched.
    pub outstanding: usize,
}

type Reply = oneshot::Sender<Result<Diagnostics, PoolError>>;

enum Command {
    Check {
        check: CheckRequest,
        cancel: Option<CancellationToken>,
        progress: Option<ProgressSender>,
        reply: Reply,
    },
    Cancel(u64),
    Kill(oneshot::Sender<()>),
    Stats(oneshot::Sender<PoolStats>),
}

/// Handle to a worker pool. Cheap to clone.
///
/// Dropping every handle kills the pool.
#[derive(Clone)]
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<Command>,
    pinned: watch::Receiver<bool>,
    max_workers: usize,
}

impl WorkerPool {
    /// Start the coordinator. Must be called within a tokio runtime.
    ///
    /// `max_workers` is clamped to at least 1.
    pub fn new(max_workers: usize, factory: Arc<dyn ExecutorFactory>) -> Self {
        let max_workers = max_workers.max(1);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();

        let refs = PendingRegistry::new();
        let pinned = refs.pinned();

        let coordinator = Coordinator {
            max_workers,
            factory,
            refs,
            queue: VecDeque::new(),
            free: VecDeque::new(),
            busy: HashMap::new(),
            running: 0,
            next_worker: 0,
            events,
            commands: commands.downgrade(),
        };
        tokio::spawn(coordinator.run(commands_rx, events_rx));

        tracing::debug!(max_workers, "Worker pool started");
        Self {
            commands,
            pinned,
            max_workers,
        }
    }

    /// Pool of engine threads.
    pub fn with_engine(max_workers: usize, engine: SharedEngine) -> Self {
        Self::new(max_workers, Arc::new(ThreadExecutorFactory::new(engine)))
    }

    /// Pool of agent processes, one per worker.
    pub fn with_command<I, S>(max_workers: usize, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            max_workers,
            Arc::new(ProcessExecutorFactory::new(command, args)),
        )
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Queue a check and wait for its diagnostic.
    ///
    /// Cancellation resolves with [`Diagnostics::cancelled`], never an error.
    pub async fn check(
        &self,
        source: &str,
        flags: &str,
        options: CheckOptions,
    ) -> Result<Diagnostics, PoolError> {
        let (params, cancel, progress) = options.into_parts();
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Check {
                check: CheckRequest::new(source, flags, params),
                cancel,
                progress,
                reply,
            })
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)?
    }

    /// Cancel everything outstanding and terminate every worker. Idempotent;
    /// the pool stays usable afterwards.
    pub async fn kill(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Kill(done)).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(reply))
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)
    }

    /// Whether any check is outstanding.
    pub fn is_pinned(&self) -> bool {
        *self.pinned.borrow()
    }

    /// Wait until no check is outstanding.
    pub async fn wait_idle(&self) {
        let mut pinned = self.pinned.clone();
        let _ = pinned.wait_for(|pinned| !*pinned).await;
    }
}

/// A unit of queued or dispatched work.
struct Ref {
    check: CheckRequest,
    progress: Option<ProgressSender>,
    cancel: Option<CancellationToken>,
    reply: Option<Reply>,
    worker: Option<WorkerId>,
    listener: Option<AbortHandle>,
}

impl Ref {
    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    fn settle(mut self, id: u64, outcome: Result<Diagnostics, PoolError>) {
        if let Some(reply) = self.reply.take()
            && reply.send(outcome).is_err()
        {
            tracing::trace!(id, "Caller gone before result");
        }
    }

    fn cancelled(&self) -> Diagnostics {
        Diagnostics::cancelled(&self.check.source, &self.check.flags)
    }
}

impl Drop for Ref {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

struct Coordinator {
    max_workers: usize,
    factory: Arc<dyn ExecutorFactory>,
    refs: PendingRegistry<Ref>,
    queue: VecDeque<u64>,
    free: VecDeque<Box<dyn Executor>>,
    /// Workers holding a Ref, with the Ref's id.
    busy: HashMap<WorkerId, (Box<dyn Executor>, u64)>,
    running: usize,
    next_worker: WorkerId,
    events: EventSender,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                biased;

                Some(event) = events.recv() => self.handle_event(event),

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::debug!("All pool handles dropped");
                        self.kill();
                        break;
                    }
                },
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Check {
                check,
                cancel,
                progress,
                reply,
            } => self.submit(check, cancel, progress, reply),
            Command::Cancel(id) => self.cancel(id),
            Command::Kill(done) => {
                self.kill();
                let _ = done.send(());
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn submit(
        &mut self,
        check: CheckRequest,
        cancel: Option<CancellationToken>,
        progress: Option<ProgressSender>,
        reply: Reply,
    ) {
        let id = self.refs.allocate();
        let listener = cancel.clone().map(|token| self.listen(id, token));
        self.refs.register(
            id,
            Ref {
                check,
                progress,
                cancel,
                reply: Some(reply),
                worker: None,
                listener,
            },
        );
        self.queue.push_back(id);
        tracing::trace!(id, queued = self.queue.len(), "Check queued");
        self.dispatch();
    }

    /// Forward the token firing to the coordinator as a `Cancel`.
    fn listen(&self, id: u64, token: CancellationToken) -> AbortHandle {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Cancel(id));
            }
        })
        .abort_handle()
    }

    /// Hand queued Refs to workers until the queue or capacity runs out.
    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let mut worker = match self.free.pop_front() {
                Some(worker) => worker,
                None if self.running < self.max_workers => match self.create_worker() {
                    Ok(worker) => worker,
                    Err(e) => {
                        if let Some(id) = self.queue.pop_front()
                            && let Some(r) = self.refs.remove(id)
                        {
                            tracing::warn!(id, error = %e, "Failed to create worker");
                            r.settle(id, Err(e));
                        }
                        continue;
                    }
                },
                None => break,
            };

            let Some(id) = self.queue.pop_front() else {
                self.free.push_front(worker);
                break;
            };
            let Some(r) = self.refs.get_mut(id) else {
                self.free.push_front(worker);
                continue;
            };

            if r.is_cancelled() {
                self.free.push_front(worker);
                if let Some(r) = self.refs.remove(id) {
                    tracing::debug!(id, "Check cancelled before dispatch");
                    let cancelled = r.cancelled();
                    r.settle(id, Ok(cancelled));
                }
                continue;
            }

            let request = WorkerRequest {
                id,
                check: r.check.clone(),
            };
            let worker_id = worker.id();
            if let Err(e) = worker.post(request) {
                tracing::warn!(worker = worker_id, id, error = %e, "Failed to post to worker");
                worker.terminate();
                self.running -= 1;
                if let Some(r) = self.refs.remove(id) {
                    r.settle(id, Err(e));
                }
                continue;
            }

            r.worker = Some(worker_id);
            self.busy.insert(worker_id, (worker, id));
            tracing::trace!(worker = worker_id, id, "Check dispatched");
        }
    }

    fn create_worker(&mut self) -> Result<Box<dyn Executor>, PoolError> {
        let id = self.next_worker;
        self.next_worker += 1;
        let worker = self.factory.create(id, self.events.clone())?;
        self.running += 1;
        tracing::debug!(worker = id, running = self.running, "Worker created");
        Ok(worker)
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        let WorkerEvent { worker, kind } = event;
        match kind {
            WorkerEventKind::Response(Response::Progress { id, message }) => {
                if !self.is_bound(worker, id) {
                    return;
                }
                if let Some(r) = self.refs.get(id)
                    && let Some(progress) = &r.progress
                    && progress.send(progress_text(message)).is_err()
                {
                    tracing::trace!(id, "Progress receiver dropped");
                }
            }
            WorkerEventKind::Response(Response::Result { id, result }) => {
                if !self.is_bound(worker, id) {
                    tracing::trace!(worker, id, "Ignoring result for unbound id");
                    return;
                }
                if let Some((executor, _)) = self.busy.remove(&worker) {
                    self.free.push_back(executor);
                }
                if let Some(r) = self.refs.remove(id) {
                    let diagnostics =
                        Diagnostics::from_value(result, &r.check.source, &r.check.flags);
                    tracing::trace!(worker, id, status = diagnostics.status().as_str(), "Check settled");
                    r.settle(id, Ok(diagnostics));
                }
                self.dispatch();
            }
            WorkerEventKind::Exited => {
                if let Some((_, id)) = self.busy.remove(&worker) {
                    self.running -= 1;
                    tracing::warn!(worker, id, "Worker exited while running a check");
                    if let Some(r) = self.refs.remove(id) {
                        r.settle(id, Err(PoolError::WorkerExited));
                    }
                    self.dispatch();
                } else if let Some(pos) = self.free.iter().position(|w| w.id() == worker) {
                    self.free.remove(pos);
                    self.running -= 1;
                    tracing::warn!(worker, "Idle worker exited");
                }
            }
        }
    }

    fn is_bound(&self, worker: WorkerId, id: u64) -> bool {
        self.busy.get(&worker).is_some_and(|(_, bound)| *bound == id)
    }

    /// Resolve `id` as cancelled. Unknown or already-settled ids are a no-op.
    fn cancel(&mut self, id: u64) {
        let Some(r) = self.refs.remove(id) else {
            return;
        };
        self.queue.retain(|queued| *queued != id);

        if let Some(worker) = r.worker
            && let Some((mut executor, _)) = self.busy.remove(&worker)
        {
            executor.terminate();
            self.running -= 1;
            tracing::debug!(worker, id, running = self.running, "Worker destroyed by cancel");
        } else {
            tracing::debug!(id, "Queued check cancelled");
        }

        let cancelled = r.cancelled();
        r.settle(id, Ok(cancelled));
        self.dispatch();
    }

    fn kill(&mut self) {
        let outstanding = self.refs.size();
        self.queue.clear();

        for (id, r) in self.refs.drain() {
            let cancelled = r.cancelled();
            r.settle(id, Ok(cancelled));
        }
        for (_, (mut executor, _)) in self.busy.drain() {
            executor.terminate();
        }
        for mut executor in self.free.drain(..) {
            executor.terminate();
        }
        let terminated = self.running;
        self.running = 0;

        tracing::info!(outstanding, terminated, "Worker pool killed");
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            max_workers: self.max_workers,
            running_workers: self.running,
            free_workers: self.free.len(),
            queued: self.queue.len(),
            outstanding: self.refs.size(),
        }
    }
}
