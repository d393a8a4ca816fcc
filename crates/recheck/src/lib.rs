//! recheck: dispatch layer for ReDoS checks.
//!
//! Routes `check(source, flags, params)` to an external agent process over a
//! newline-delimited JSON protocol, to a bounded pool of workers, or to an
//! in-process engine, and manages their lifecycles.

pub mod agent;
pub mod bridge;
pub mod checker;
pub mod config;
pub mod diagnostics;
pub mod engine;
mod options;
pub mod pending;
pub mod pool;

pub use agent::{Agent, AgentConfig, AgentError, Call};
pub use bridge::framer::LineFramer;
pub use checker::{CheckBackend, CheckError, Checker, DirectBackend};
pub use config::{Backend, CheckerConfig, ConfigError, SyncBackend};
pub use diagnostics::{
    AnalysisError, CheckerStrategy, Complexity, Diagnostics, Parameters, Status,
};
pub use engine::{Engine, Progress, SharedEngine};
pub use options::{CancellationToken, CheckOptions, ProgressSender};
pub use pending::{PendingRegistry, Subscriber};
pub use pool::{PoolError, PoolStats, WorkerPool};
