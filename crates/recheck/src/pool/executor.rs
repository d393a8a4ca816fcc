//! Workers the pool dispatches to.
//!
//! The pool only sees [`Executor`]: post a request, get [`WorkerEvent`]s
//! back on a shared channel tagged with the worker id, terminate. Two
//! implementations:
//! - [`ThreadExecutor`]: an OS thread running an [`Engine`]
//! - [`ProcessExecutor`]: a child process speaking the agent line protocol

use std::process::Stdio;
use std::sync::mpsc as std_mpsc;
use std::thread;

use futures::{SinkExt, StreamExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::PoolError;
use crate::bridge::codec::JsonLineCodec;
use crate::bridge::framer::LineFramer;
use crate::bridge::protocol::{Request, Response, WorkerRequest};
use crate::engine::{Progress, SharedEngine};

/// Worker identifier, unique within one pool.
pub type WorkerId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEventKind {
    /// A progress push or terminal result for the request the worker holds.
    Response(Response),
    /// The worker is gone. Sent at most once.
    Exited,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub worker: WorkerId,
    pub kind: WorkerEventKind,
}

pub type EventSender = mpsc::UnboundedSender<WorkerEvent>;

/// One execution context. The pool hands it at most one request at a time.
pub trait Executor: Send {
    fn id(&self) -> WorkerId;

    /// Hand the worker a request. Output arrives as [`WorkerEvent`]s.
    fn post(&mut self, request: WorkerRequest) -> Result<(), PoolError>;

    /// Stop the worker. Anything it emits afterwards is ignored by the pool.
    fn terminate(&mut self);
}

/// Creates workers on demand.
pub trait ExecutorFactory: Send + Sync {
    fn create(&self, id: WorkerId, events: EventSender) -> Result<Box<dyn Executor>, PoolError>;
}

// --- Thread-backed ---

struct Job {
    request: WorkerRequest,
}

/// Runs the engine on a dedicated OS thread.
///
/// Terminating signals the abort token and drops the inbox; the thread
/// finishes whatever it is doing and exits on its own.
pub struct ThreadExecutor {
    id: WorkerId,
    inbox: Option<std_mpsc::Sender<Job>>,
    abort: CancellationToken,
}

impl ThreadExecutor {
    pub fn spawn(id: WorkerId, engine: SharedEngine, events: EventSender) -> Result<Self, PoolError> {
        let (inbox, jobs) = std_mpsc::channel::<Job>();
        let abort = CancellationToken::new();

        let thread_abort = abort.clone();
        thread::Builder::new()
            .name(format!("recheck-worker-{id}"))
            .spawn(move || run_engine_thread(id, engine, jobs, events, thread_abort))
            .map_err(|e| PoolError::Spawn(e.to_string()))?;

        tracing::debug!(worker = id, "Worker thread started");
        Ok(Self {
            id,
            inbox: Some(inbox),
            abort,
        })
    }
}

impl Executor for ThreadExecutor {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn post(&mut self, request: WorkerRequest) -> Result<(), PoolError> {
        let inbox = self.inbox.as_ref().ok_or(PoolError::WorkerExited)?;
        inbox
            .send(Job { request })
            .map_err(|_| PoolError::WorkerExited)
    }

    fn terminate(&mut self) {
        self.abort.cancel();
        if self.inbox.take().is_some() {
            tracing::debug!(worker = self.id, "Worker thread terminated");
        }
    }
}

impl Drop for ThreadExecutor {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Reports `Exited` when the worker thread ends, including by panic.
struct ExitGuard {
    worker: WorkerId,
    events: EventSender,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::warn!(worker = self.worker, "Worker thread panicked");
        }
        let _ = self.events.send(WorkerEvent {
            worker: self.worker,
            kind: WorkerEventKind::Exited,
        });
    }
}

fn run_engine_thread(
    worker: WorkerId,
    engine: SharedEngine,
    jobs: std_mpsc::Receiver<Job>,
    events: EventSender,
    abort: CancellationToken,
) {
    let _guard = ExitGuard {
        worker,
        events: events.clone(),
    };

    while let Ok(Job { request }) = jobs.recv() {
        let id = request.id;
        let mut progress = Progress::new(abort.clone());
        if request.check.params.wants_progress() {
            let events = events.clone();
            progress = progress.with_sink(move |message| {
                let _ = events.send(WorkerEvent {
                    worker,
                    kind: WorkerEventKind::Response(Response::progress(id, message)),
                });
            });
        }

        tracing::trace!(worker, id, "Worker running check");
        let diagnostics = engine.check(&request.check, &progress);

        let result = match serde_json::to_value(&diagnostics) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(worker, id, error = %e, "Failed to encode diagnostics");
                break;
            }
        };
        let sent = events.send(WorkerEvent {
            worker,
            kind: WorkerEventKind::Response(Response::result(id, result)),
        });
        if sent.is_err() {
            break;
        }
    }
}

/// Spawns [`ThreadExecutor`]s around a shared engine.
pub struct ThreadExecutorFactory {
    engine: SharedEngine,
}

impl ThreadExecutorFactory {
    pub fn new(engine: SharedEngine) -> Self {
        Self { engine }
    }
}

impl ExecutorFactory for ThreadExecutorFactory {
    fn create(&self, id: WorkerId, events: EventSender) -> Result<Box<dyn Executor>, PoolError> {
        Ok(Box::new(ThreadExecutor::spawn(
            id,
            self.engine.clone(),
            events,
        )?))
    }
}

// --- Process-backed ---

/// A child process speaking the agent line protocol.
///
/// Each posted request becomes a `check` call whose id is the pool's Ref id.
/// Terminating kills the child.
pub struct ProcessExecutor {
    id: WorkerId,
    outgoing: mpsc::UnboundedSender<Request>,
    child: Option<Child>,
}

impl ProcessExecutor {
    pub fn spawn(
        id: WorkerId,
        command: &str,
        args: &[String],
        events: EventSender,
    ) -> Result<Self, PoolError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PoolError::Spawn(format!("{command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Spawn("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Spawn("stdout not captured".to_string()))?;

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_requests(
            id,
            FramedWrite::new(stdin, JsonLineCodec::<Request>::new()),
            outgoing_rx,
        ));
        tokio::spawn(read_events(
            id,
            FramedRead::new(stdout, LineFramer::new()),
            events,
        ));

        tracing::debug!(worker = id, pid = ?child.id(), "Worker process started");
        Ok(Self {
            id,
            outgoing,
            child: Some(child),
        })
    }
}

impl Executor for ProcessExecutor {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn post(&mut self, request: WorkerRequest) -> Result<(), PoolError> {
        let params =
            serde_json::to_value(&request.check).map_err(|e| PoolError::Encode(e.to_string()))?;
        self.outgoing
            .send(Request::call(request.id, "check", params))
            .map_err(|_| PoolError::WorkerExited)
    }

    fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                tracing::warn!(worker = self.id, error = %e, "Failed to kill worker process");
            }
            tracing::debug!(worker = self.id, "Worker process terminated");
        }
    }
}

impl Drop for ProcessExecutor {
    fn drop(&mut self) {
        self.terminate();
    }
}

async fn write_requests(
    worker: WorkerId,
    mut writer: FramedWrite<ChildStdin, JsonLineCodec<Request>>,
    mut outgoing: mpsc::UnboundedReceiver<Request>,
) {
    while let Some(request) = outgoing.recv().await {
        if let Err(e) = writer.send(request).await {
            tracing::warn!(worker, error = %e, "Failed to write to worker stdin");
            break;
        }
    }
}

async fn read_events(
    worker: WorkerId,
    mut reader: FramedRead<ChildStdout, LineFramer>,
    events: EventSender,
) {
    while let Some(line) = reader.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(worker, error = %e, "Worker stdout error");
                break;
            }
        };
        let Some(response) = Response::parse(&line) else {
            continue;
        };
        let event = WorkerEvent {
            worker,
            kind: WorkerEventKind::Response(response),
        };
        if events.send(event).is_err() {
            return;
        }
    }
    let _ = events.send(WorkerEvent {
        worker,
        kind: WorkerEventKind::Exited,
    });
}

/// Spawns one [`ProcessExecutor`] per worker from a fixed command line.
#[derive(Debug, Clone)]
pub struct ProcessExecutorFactory {
    command: String,
    args: Vec<String>,
}

impl ProcessExecutorFactory {
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl ExecutorFactory for ProcessExecutorFactory {
    fn create(&self, id: WorkerId, events: EventSender) -> Result<Box<dyn Executor>, PoolError> {
        Ok(Box::new(ProcessExecutor::spawn(
            id,
            &self.command,
            &self.args,
            events,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::bridge::protocol::CheckRequest;
    use crate::diagnostics::{Diagnostics, Parameters, Status};
    use crate::engine::testing::SlowEngine;

    fn request(id: u64, source: &str, logger: bool) -> WorkerRequest {
        let params = Parameters {
            logger: logger.then_some(true),
            ..Parameters::default()
        };
        WorkerRequest {
            id,
            check: CheckRequest::new(source, "", params),
        }
    }

    async fn next_response(events: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Response {
        match events.recv().await {
            Some(WorkerEvent {
                kind: WorkerEventKind::Response(response),
                ..
            }) => response,
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn thread_executor_runs_checks_in_order() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let engine = SlowEngine::new(Duration::ZERO);
        let mut worker = ThreadExecutor::spawn(7, engine.clone(), tx).unwrap();
        assert_eq!(worker.id(), 7);

        worker.post(request(1, "^(a|a)*$", false)).unwrap();
        worker.post(request(2, "^a$", false)).unwrap();

        let Response::Result { id, result } = next_response(&mut events).await else {
            panic!("expected result");
        };
        assert_eq!(id, 1);
        assert_eq!(
            Diagnostics::from_value(result, "", "").status(),
            Status::Vulnerable
        );

        let second = next_response(&mut events).await;
        assert_eq!(second.id(), 2);
        assert!(second.is_terminal());
    }

    #[tokio::test]
    async fn thread_executor_streams_progress_only_when_asked() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let mut worker = ThreadExecutor::spawn(0, SlowEngine::new(Duration::ZERO), tx).unwrap();

        worker.post(request(3, "^a$", true)).unwrap();
        assert_eq!(
            next_response(&mut events).await,
            Response::progress(3, "checking ^a$")
        );
        assert!(next_response(&mut events).await.is_terminal());

        worker.post(request(4, "^a$", false)).unwrap();
        assert!(next_response(&mut events).await.is_terminal());
    }

    #[tokio::test]
    async fn terminate_aborts_and_reports_exit() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let engine = SlowEngine::new(Duration::from_secs(30));
        let mut worker = ThreadExecutor::spawn(5, engine.clone(), tx).unwrap();
        worker.post(request(1, "^a$", false)).unwrap();

        // Let the engine pick the job up before terminating.
        while engine.calls.load(std::sync::atomic::Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        worker.terminate();
        worker.terminate();
        assert!(matches!(
            worker.post(request(2, "^a$", false)),
            Err(PoolError::WorkerExited)
        ));

        let mut exited = false;
        let deadline = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if event.kind == WorkerEventKind::Exited {
                    exited = true;
                    break;
                }
            }
        });
        deadline.await.unwrap();
        assert!(exited);
    }

    #[tokio::test]
    async fn process_executor_reports_spawn_failure() {
        let (tx, _events) = mpsc::unbounded_channel();
        let factory = ProcessExecutorFactory::new("/nonexistent/recheck-agent", ["agent"]);
        assert!(matches!(factory.create(0, tx), Err(PoolError::Spawn(_))));
    }

    #[tokio::test]
    async fn thread_factory_creates_working_executors() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let factory = ThreadExecutorFactory::new(Arc::new(|req: &CheckRequest, _: &Progress| {
            Diagnostics::cancelled(&req.source, &req.flags)
        }));
        let mut worker = factory.create(9, tx).unwrap();
        worker.post(request(11, "x", false)).unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.worker, 9);
        let WorkerEventKind::Response(Response::Result { result, .. }) = event.kind else {
            panic!("expected result");
        };
        assert!(Diagnostics::from_value(result, "", "").is_cancelled());
    }
}
