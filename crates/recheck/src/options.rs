//! Per-call options for `check`.

use tokio::sync::mpsc;
pub use tokio_util::sync::CancellationToken;

use crate::diagnostics::Parameters;

/// Receives progress messages for one check. Closed when the check settles.
pub type ProgressSender = mpsc::UnboundedSender<String>;

/// Parameters plus the two things that cannot be serialized: the
/// cancellation signal and the progress channel.
#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    pub params: Parameters,
    pub cancel: Option<CancellationToken>,
    pub progress: Option<ProgressSender>,
}

impl CheckOptions {
    pub fn new(params: Parameters) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Split into the wire parameters and the local-only parts.
    ///
    /// When a progress channel is present the `logger` marker is set so the
    /// engine knows to stream messages back.
    pub(crate) fn into_parts(
        self,
    ) -> (Parameters, Option<CancellationToken>, Option<ProgressSender>) {
        let Self {
            mut params,
            cancel,
            progress,
        } = self;
        params.logger = progress.as_ref().map(|_| true);
        (params, cancel, progress)
    }
}

/// Render a progress payload as text.
pub(crate) fn progress_text(message: serde_json::Value) -> String {
    match message {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    }
}
