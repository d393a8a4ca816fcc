//! In-process analysis engine contract.
//!
//! The engine itself lives outside this crate. Implementations run
//! synchronously on a dedicated thread (pool workers, the direct backend,
//! `check_sync`), so the trait is blocking.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::CheckRequest;
use crate::diagnostics::Diagnostics;

/// Analyses one pattern.
///
/// Long analyses should poll [`Progress::is_aborted`] and return
/// [`Diagnostics::cancelled`] once it turns `true`. Timeouts from
/// `params.timeout` are the engine's job.
pub trait Engine: Send + Sync + 'static {
    fn check(&self, request: &CheckRequest, progress: &Progress) -> Diagnostics;
}

impl<F> Engine for F
where
    F: Fn(&CheckRequest, &Progress) -> Diagnostics + Send + Sync + 'static,
{
    fn check(&self, request: &CheckRequest, progress: &Progress) -> Diagnostics {
        self(request, progress)
    }
}

type Sink = Box<dyn Fn(String) + Send + Sync>;

/// Progress sink and abort flag handed to a running analysis.
pub struct Progress {
    sink: Option<Sink>,
    abort: CancellationToken,
}

impl Progress {
    pub fn new(abort: CancellationToken) -> Self {
        Self { sink: None, abort }
    }

    /// A sink that never aborts and drops messages.
    pub fn detached() -> Self {
        Self::new(CancellationToken::new())
    }

    pub fn with_sink(mut self, sink: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Report a progress line. Dropped when nobody asked for progress.
    pub fn log(&self, message: impl Into<String>) {
        if let Some(sink) = &self.sink {
            sink(message.into());
        }
    }

    pub fn is_logging(&self) -> bool {
        self.sink.is_some()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }
}

/// Shared handle to an engine.
pub type SharedEngine = Arc<dyn Engine>;
