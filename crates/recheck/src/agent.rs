//! Agent - client for an external analysis process.
//!
//! Flow:
//! 1. Spawn the process with piped stdin/stdout
//! 2. Send `ping`, wait for its result (the handshake)
//! 3. Multiplex requests over stdin; a reader task routes stdout lines to
//!    pending callers by id
//! 4. On stdout EOF or a failed write: fail everything still pending; later
//!    requests fail fast with [`AgentError::Closed`]
//!
//! Requests are queued to a single writer task so lines never interleave and
//! `request` returns without awaiting the pipe.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonLineCodec;
use crate::bridge::framer::LineFramer;
use crate::bridge::protocol::{CheckRequest, Request, Response};
use crate::diagnostics::Diagnostics;
use crate::options::CheckOptions;
use crate::pending::{PendingCall, PendingRegistry, Subscriber};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to spawn agent: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("agent startup failed: {0}")]
    StartupFailed(String),
    #[error("agent handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("agent connection closed")]
    Closed,
    #[error("agent killed")]
    Killed,
    #[error("agent protocol error: {0}")]
    Protocol(String),
}

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How to launch an agent process.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub command: String,
    pub args: Vec<String>,
    pub handshake_timeout: Option<Duration>,
}

impl AgentConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// `None` waits for the handshake indefinitely.
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub async fn start(self) -> Result<Agent, AgentError> {
        Agent::start_with(self).await
    }
}

struct Shared {
    pending: StdMutex<PendingRegistry<PendingCall>>,
    outgoing: mpsc::UnboundedSender<Request>,
    child: StdMutex<Option<Child>>,
    killed: AtomicBool,
    /// Set once either pipe is gone. Only flipped under the `pending` lock.
    closed: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingRegistry<PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, response: Response) {
        let mut pending = self.pending();
        match response {
            Response::Progress { id, message } => {
                if !pending.push(id, message) {
                    tracing::trace!(id, "Progress for unknown id");
                }
            }
            Response::Result { id, result } => {
                if pending.resolve(id, result) {
                    tracing::trace!(id, outstanding = pending.size(), "Request settled");
                }
            }
        }
    }

    /// Mark the connection dead and fail everything pending. Later requests
    /// fail fast with [`AgentError::Closed`].
    fn close(&self) -> usize {
        let mut pending = self.pending();
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        pending.reject_all(|| AgentError::Closed)
    }

    /// Why a new request cannot be sent, if it cannot.
    fn refusal(&self) -> Option<AgentError> {
        if self.killed.load(Ordering::Acquire) {
            Some(AgentError::Killed)
        } else if self.closed.load(Ordering::Acquire) {
            Some(AgentError::Closed)
        } else {
            None
        }
    }
}

/// Handle to a running agent process. Cheap to clone.
///
/// The process is terminated by [`Agent::kill`], or when the last handle is
/// dropped.
#[derive(Clone)]
pub struct Agent {
    shared: Arc<Shared>,
    pinned: watch::Receiver<bool>,
}

impl Agent {
    /// Spawn `command args...` and wait for the handshake.
    pub async fn start<I, S>(command: &str, args: I) -> Result<Agent, AgentError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AgentConfig::new(command).with_args(args).start().await
    }

    pub async fn start_with(config: AgentConfig) -> Result<Agent, AgentError> {
        tracing::info!(command = %config.command, args = ?config.args, "Spawning agent");

        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(AgentError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::StartupFailed("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::StartupFailed("stdout not captured".to_string()))?;

        let agent = Agent::attach(child, stdin, stdout);

        tracing::debug!("Waiting for agent handshake");
        let ping = agent.request("ping", json!({}), None);
        let handshake = match config.handshake_timeout {
            Some(limit) => match tokio::time::timeout(limit, ping).await {
                Ok(outcome) => outcome,
                Err(_) => Err(AgentError::HandshakeTimeout(limit)),
            },
            None => ping.await,
        };

        match handshake {
            Ok(_) => {
                tracing::info!(command = %config.command, "Agent ready");
                Ok(agent)
            }
            Err(e) => {
                agent.kill();
                Err(match e {
                    AgentError::Closed => {
                        AgentError::StartupFailed("process closed before handshake".to_string())
                    }
                    AgentError::HandshakeTimeout(_) => e,
                    other => AgentError::StartupFailed(other.to_string()),
                })
            }
        }
    }

    fn attach(child: Child, stdin: ChildStdin, stdout: ChildStdout) -> Agent {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let pending = PendingRegistry::new();
        let pinned = pending.pinned();

        let shared = Arc::new(Shared {
            pending: StdMutex::new(pending),
            outgoing,
            child: StdMutex::new(Some(child)),
            killed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(write_requests(
            FramedWrite::new(stdin, JsonLineCodec::<Request>::new()),
            outgoing_rx,
            Arc::downgrade(&shared),
        ));
        tokio::spawn(read_responses(
            FramedRead::new(stdout, LineFramer::new()),
            Arc::downgrade(&shared),
        ));

        Agent { shared, pinned }
    }

    /// Send a request. Returns immediately; await the returned [`Call`] for
    /// the terminal result. Progress pushes go to `subscribe`.
    pub fn request(
        &self,
        method: &str,
        params: Value,
        subscribe: Option<Subscriber>,
    ) -> Call {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.shared.pending();
            let id = pending.allocate();
            if let Some(refusal) = self.shared.refusal() {
                let _ = tx.send(Err(refusal));
                return Call::settled(id, rx);
            }
            pending.register(id, PendingCall::new(tx, subscribe));
            id
        };

        tracing::trace!(id, method, "Sending request");
        if self
            .shared
            .outgoing
            .send(Request::call(id, method, params))
            .is_err()
        {
            self.shared.pending().reject(id, AgentError::Closed);
        }

        Call {
            id,
            rx,
            shared: Arc::downgrade(&self.shared),
            done: false,
        }
    }

    /// Send a notification. No id, no response.
    pub fn notify(&self, method: &str, params: Value) -> Result<(), AgentError> {
        if let Some(refusal) = self.shared.refusal() {
            return Err(refusal);
        }
        tracing::trace!(method, "Sending notification");
        self.shared
            .outgoing
            .send(Request::notification(method, params))
            .map_err(|_| AgentError::Closed)
    }

    /// Check a pattern via the agent's `check` method.
    ///
    /// Cancellation sends a `cancel` notification and keeps waiting for the
    /// agent's own answer; it is never preemptive. If the agent is killed
    /// while the check is pending, the check resolves as cancelled.
    pub async fn check(
        &self,
        source: &str,
        flags: &str,
        options: CheckOptions,
    ) -> Result<Diagnostics, AgentError> {
        let (params, cancel, progress) = options.into_parts();
        let payload = serde_json::to_value(CheckRequest::new(source, flags, params))
            .map_err(|e| AgentError::Protocol(e.to_string()))?;

        let mut call = self.request("check", payload, progress.map(Subscriber::from));
        let id = call.id();

        let outcome = match cancel {
            None => call.await,
            Some(cancel) => {
                let mut cancel_sent = false;
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled(), if !cancel_sent => {
                            cancel_sent = true;
                            tracing::debug!(id, "Check cancelled, notifying agent");
                            if let Err(e) = self.notify("cancel", json!({ "id": id })) {
                                tracing::warn!(id, error = %e, "Failed to send cancel");
                            }
                        }
                        outcome = &mut call => break outcome,
                    }
                }
            }
        };

        match outcome {
            Ok(value) => Ok(Diagnostics::from_value(value, source, flags)),
            Err(AgentError::Killed) => Ok(Diagnostics::cancelled(source, flags)),
            Err(e) => Err(e),
        }
    }

    /// Terminate the process. Idempotent.
    ///
    /// Everything still pending is settled first: raw requests fail with
    /// [`AgentError::Killed`], checks resolve as cancelled.
    pub fn kill(&self) {
        if self.shared.killed.swap(true, Ordering::AcqRel) {
            return;
        }

        let rejected = self.shared.pending().reject_all(|| AgentError::Killed);

        let child = self
            .shared
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut child) = child
            && let Err(e) = child.start_kill()
        {
            tracing::warn!(error = %e, "Failed to kill agent process");
        }

        tracing::info!(rejected, "Agent killed");
    }

    pub fn is_killed(&self) -> bool {
        self.shared.killed.load(Ordering::Acquire)
    }

    /// Whether the process has gone away (stdout EOF or broken stdin).
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of requests awaiting a result.
    pub fn outstanding(&self) -> usize {
        self.shared.pending().size()
    }

    /// Whether any request is outstanding.
    pub fn is_pinned(&self) -> bool {
        *self.pinned.borrow()
    }

    /// Wait until no request is outstanding.
    pub async fn wait_idle(&self) {
        let mut pinned = self.pinned.clone();
        let _ = pinned.wait_for(|pinned| !*pinned).await;
    }
}

/// A request in flight. Resolves to the terminal `result` value.
///
/// Dropping an unsettled `Call` forgets the request: a late result for its id
/// is discarded and the agent no longer counts it as outstanding.
#[must_use = "a Call does nothing unless awaited"]
pub struct Call {
    id: u64,
    rx: oneshot::Receiver<Result<Value, AgentError>>,
    shared: Weak<Shared>,
    done: bool,
}

impl Call {
    fn settled(id: u64, rx: oneshot::Receiver<Result<Value, AgentError>>) -> Self {
        Self {
            id,
            rx,
            shared: Weak::new(),
            done: true,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for Call {
    type Output = Result<Value, AgentError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(outcome) => {
                this.done = true;
                Poll::Ready(outcome.unwrap_or(Err(AgentError::Closed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(shared) = self.shared.upgrade()
            && shared.pending().remove(self.id).is_some()
        {
            tracing::debug!(id = self.id, "Request abandoned by caller");
        }
    }
}

async fn write_requests(
    mut writer: FramedWrite<ChildStdin, JsonLineCodec<Request>>,
    mut outgoing: mpsc::UnboundedReceiver<Request>,
    shared: Weak<Shared>,
) {
    while let Some(request) = outgoing.recv().await {
        if let Err(e) = writer.send(request).await {
            let failed = shared.upgrade().map_or(0, |shared| shared.close());
            tracing::warn!(error = %e, failed, "Failed to write to agent stdin");
            break;
        }
    }
    tracing::trace!("Agent writer exiting");
}

async fn read_responses(mut reader: FramedRead<ChildStdout, LineFramer>, shared: Weak<Shared>) {
    while let Some(line) = reader.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Agent stdout error");
                break;
            }
        };
        let Some(response) = Response::parse(&line) else {
            continue;
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.route(response);
    }

    if let Some(shared) = shared.upgrade() {
        let failed = shared.close();
        if failed > 0 {
            tracing::warn!(failed, "Agent output closed with requests outstanding");
        } else {
            tracing::debug!("Agent output closed");
        }
    }
}
