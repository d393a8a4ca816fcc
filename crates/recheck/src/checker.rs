//! Checker - picks a backend once and routes every `check` through it.
//!
//! Backends are established lazily on the first call and cached for the
//! checker's lifetime. In [`Backend::Auto`] a backend that fails to start is
//! logged and the next one is tried; a pinned backend surfaces the failure
//! and is retried on the next call.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::OnceCell;

use crate::agent::{Agent, AgentConfig, AgentError};
use crate::bridge::protocol::CheckRequest;
use crate::config::{Backend, CheckerConfig, ConfigError, SyncBackend};
use crate::diagnostics::Diagnostics;
use crate::engine::{Engine, Progress, SharedEngine};
use crate::options::{CheckOptions, CancellationToken, ProgressSender};
use crate::pool::{PoolError, WorkerPool};

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("there is no available implementation for the {0} backend")]
    BackendUnavailable(Backend),
    #[error("check_sync cannot block a thread that is driving the async runtime")]
    BlockingInRuntime,
    #[error("no tokio runtime was available when the checker was created")]
    NoRuntime,
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("engine failed: {0}")]
    Engine(String),
}

/// Something that can answer `check`.
#[async_trait]
pub trait CheckBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(
        &self,
        source: &str,
        flags: &str,
        options: CheckOptions,
    ) -> Result<Diagnostics, CheckError>;

    /// Release processes and workers. Later checks resolve as cancelled or
    /// fail, depending on the backend.
    async fn shutdown(&self);
}

#[async_trait]
impl CheckBackend for Agent {
    fn name(&self) -> &'static str {
        "agent"
    }

    async fn check(
        &self,
        source: &str,
        flags: &str,
        options: CheckOptions,
    ) -> Result<Diagnostics, CheckError> {
        Ok(Agent::check(self, source, flags, options).await?)
    }

    async fn shutdown(&self) {
        self.kill();
    }
}

#[async_trait]
impl CheckBackend for WorkerPool {
    fn name(&self) -> &'static str {
        "worker"
    }

    async fn check(
        &self,
        source: &str,
        flags: &str,
        options: CheckOptions,
    ) -> Result<Diagnostics, CheckError> {
        Ok(WorkerPool::check(self, source, flags, options).await?)
    }

    async fn shutdown(&self) {
        self.kill().await;
    }
}

/// Runs the engine on tokio's blocking pool, one call per check.
pub struct DirectBackend {
    engine: SharedEngine,
}

impl DirectBackend {
    pub fn new(engine: SharedEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl CheckBackend for DirectBackend {
    fn name(&self) -> &'static str {
        "pure"
    }

    async fn check(
        &self,
        source: &str,
        flags: &str,
        options: CheckOptions,
    ) -> Result<Diagnostics, CheckError> {
        let engine = self.engine.clone();
        let (params, cancel, progress) = options.into_parts();
        let request = CheckRequest::new(source, flags, params);
        tokio::task::spawn_blocking(move || run_engine(engine.as_ref(), &request, cancel, progress))
            .await
            .map_err(|e| CheckError::Engine(e.to_string()))
    }

    async fn shutdown(&self) {}
}

fn run_engine(
    engine: &dyn Engine,
    request: &CheckRequest,
    cancel: Option<CancellationToken>,
    progress: Option<ProgressSender>,
) -> Diagnostics {
    let abort = cancel.unwrap_or_default();
    if abort.is_cancelled() {
        return Diagnostics::cancelled(&request.source, &request.flags);
    }
    let mut sink = Progress::new(abort);
    if let Some(progress) = progress {
        sink = sink.with_sink(move |message| {
            let _ = progress.send(message);
        });
    }
    engine.check(request, &sink)
}

/// Entry point: `check` a pattern with whichever backend is configured.
pub struct Checker {
    config: CheckerConfig,
    backend: OnceCell<Arc<dyn CheckBackend>>,
    runtime: Option<Handle>,
}

impl Checker {
    /// Create a checker. Captures the current tokio runtime, if any, for
    /// [`check_sync`](Self::check_sync).
    pub fn new(config: CheckerConfig) -> Self {
        Self {
            config,
            backend: OnceCell::new(),
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(CheckerConfig::from_env()?))
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Name of the established backend, `None` before the first check.
    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.get().map(|backend| backend.name())
    }

    pub async fn check(
        &self,
        source: &str,
        flags: &str,
        options: CheckOptions,
    ) -> Result<Diagnostics, CheckError> {
        let backend = self
            .backend
            .get_or_try_init(|| self.establish())
            .await?;
        backend.check(source, flags, options).await
    }

    /// Blocking `check`.
    ///
    /// With [`SyncBackend::Worker`] the calling thread drives the async path
    /// on the runtime captured at construction, which must be multi-threaded.
    /// Calling it from a thread inside that runtime would deadlock, so it
    /// fails with [`CheckError::BlockingInRuntime`] instead.
    pub fn check_sync(
        &self,
        source: &str,
        flags: &str,
        options: CheckOptions,
    ) -> Result<Diagnostics, CheckError> {
        match self.config.sync_backend {
            SyncBackend::Pure => {
                let engine = self
                    .config
                    .engine
                    .as_ref()
                    .ok_or(CheckError::BackendUnavailable(Backend::Pure))?;
                let (params, cancel, progress) = options.into_parts();
                let request = CheckRequest::new(source, flags, params);
                Ok(run_engine(engine.as_ref(), &request, cancel, progress))
            }
            SyncBackend::Worker => {
                if Handle::try_current().is_ok() {
                    return Err(CheckError::BlockingInRuntime);
                }
                let runtime = self.runtime.as_ref().ok_or(CheckError::NoRuntime)?;
                runtime.block_on(self.check(source, flags, options))
            }
        }
    }

    /// Kill the established backend, if any.
    pub async fn shutdown(&self) {
        if let Some(backend) = self.backend.get() {
            tracing::debug!(backend = backend.name(), "Shutting down backend");
            backend.shutdown().await;
        }
    }

    async fn establish(&self) -> Result<Arc<dyn CheckBackend>, CheckError> {
        let backend = self.config.backend;
        tracing::debug!(%backend, "Establishing backend");

        match backend {
            Backend::Auto => {
                let candidates = [
                    ("native", self.config.native_command()),
                    ("java", self.config.java_command()),
                ];
                for (kind, command) in candidates {
                    let Some((command, args)) = command else {
                        continue;
                    };
                    match self.start_agent(command, args).await {
                        Ok(agent) => {
                            tracing::info!(backend = kind, "Using agent backend");
                            return Ok(Arc::new(agent));
                        }
                        Err(e) => {
                            tracing::debug!(backend = kind, error = %e, "Backend failed to start, trying next");
                        }
                    }
                }
                match &self.config.engine {
                    Some(engine) => {
                        tracing::info!(workers = self.config.workers, "Using worker pool backend");
                        Ok(Arc::new(WorkerPool::with_engine(
                            self.config.workers,
                            engine.clone(),
                        )))
                    }
                    None => Err(CheckError::BackendUnavailable(backend)),
                }
            }
            Backend::Native => {
                let (command, args) = self
                    .config
                    .native_command()
                    .ok_or(CheckError::BackendUnavailable(backend))?;
                Ok(Arc::new(self.start_agent(command, args).await?))
            }
            Backend::Java => {
                let (command, args) = self
                    .config
                    .java_command()
                    .ok_or(CheckError::BackendUnavailable(backend))?;
                Ok(Arc::new(self.start_agent(command, args).await?))
            }
            Backend::Worker => {
                if let Some(engine) = &self.config.engine {
                    return Ok(Arc::new(WorkerPool::with_engine(
                        self.config.workers,
                        engine.clone(),
                    )));
                }
                let (command, args) = self
                    .config
                    .native_command()
                    .ok_or(CheckError::BackendUnavailable(backend))?;
                Ok(Arc::new(WorkerPool::with_command(
                    self.config.workers,
                    command,
                    args,
                )))
            }
            Backend::Pure => {
                let engine = self
                    .config
                    .engine
                    .clone()
                    .ok_or(CheckError::BackendUnavailable(backend))?;
                Ok(Arc::new(DirectBackend::new(engine)))
            }
        }
    }

    async fn start_agent(&self, command: String, args: Vec<String>) -> Result<Agent, AgentError> {
        AgentConfig::new(command)
            .with_args(args)
            .with_handshake_timeout(self.config.handshake_timeout)
            .start()
            .await
    }
}
