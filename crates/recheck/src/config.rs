//! Checker configuration.
//!
//! Resolved once, either through the `with_*` builder or from `RECHECK_*`
//! environment variables, and fixed for the lifetime of a [`Checker`].
//!
//! [`Checker`]: crate::checker::Checker

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::SharedEngine;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid backend: {0}")]
    InvalidBackend(String),
    #[error("invalid sync backend: {0}")]
    InvalidSyncBackend(String),
    #[error("invalid worker count: {0}")]
    InvalidWorkers(String),
}

/// Which implementation serves `check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Native agent, then Java agent, then the worker pool.
    #[default]
    Auto,
    /// Java agent only.
    Java,
    /// Native agent only.
    Native,
    /// Worker pool only.
    Worker,
    /// Engine called directly on a blocking thread.
    Pure,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Java => "java",
            Self::Native => "native",
            Self::Worker => "worker",
            Self::Pure => "pure",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "java" => Ok(Self::Java),
            "native" => Ok(Self::Native),
            "worker" => Ok(Self::Worker),
            "pure" => Ok(Self::Pure),
            other => Err(ConfigError::InvalidBackend(other.to_string())),
        }
    }
}

/// How `check_sync` blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncBackend {
    /// Drive the async backend from the calling thread.
    #[default]
    Worker,
    /// Run the engine inline on the calling thread.
    Pure,
}

impl FromStr for SyncBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" | "synckit" => Ok(Self::Worker),
            "pure" => Ok(Self::Pure),
            other => Err(ConfigError::InvalidSyncBackend(other.to_string())),
        }
    }
}

const DEFAULT_JAVA: &str = "java";
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct CheckerConfig {
    pub backend: Backend,
    pub sync_backend: SyncBackend,
    /// Native agent binary, started as `<bin> agent`.
    pub native_bin: Option<PathBuf>,
    /// Agent jar, started as `<java> -jar <jar> agent`.
    pub jar: Option<PathBuf>,
    pub java: String,
    pub workers: usize,
    pub handshake_timeout: Option<Duration>,
    /// In-process engine for the worker pool and the pure backends.
    pub engine: Option<SharedEngine>,
}

impl fmt::Debug for CheckerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckerConfig")
            .field("backend", &self.backend)
            .field("sync_backend", &self.sync_backend)
            .field("native_bin", &self.native_bin)
            .field("jar", &self.jar)
            .field("java", &self.java)
            .field("workers", &self.workers)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("engine", &self.engine.is_some())
            .finish()
    }
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Auto,
            sync_backend: SyncBackend::Worker,
            native_bin: None,
            jar: None,
            java: DEFAULT_JAVA.to_string(),
            workers: 1,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            engine: None,
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `RECHECK_BACKEND`, `RECHECK_SYNC_BACKEND`, `RECHECK_BIN`,
    /// `RECHECK_JAR`, `RECHECK_JAVA` and `RECHECK_WORKERS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    /// Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(backend) = var("RECHECK_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Some(sync_backend) = var("RECHECK_SYNC_BACKEND") {
            config.sync_backend = sync_backend.parse()?;
        }
        config.native_bin = var("RECHECK_BIN").map(PathBuf::from);
        config.jar = var("RECHECK_JAR").map(PathBuf::from);
        if let Some(java) = var("RECHECK_JAVA") {
            config.java = java;
        }
        if let Some(workers) = var("RECHECK_WORKERS") {
            config.workers = match workers.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::InvalidWorkers(workers)),
            };
        }

        Ok(config)
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_sync_backend(mut self, sync_backend: SyncBackend) -> Self {
        self.sync_backend = sync_backend;
        self
    }

    pub fn with_native_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.native_bin = Some(path.into());
        self
    }

    pub fn with_jar(mut self, path: impl Into<PathBuf>) -> Self {
        self.jar = Some(path.into());
        self
    }

    pub fn with_java(mut self, java: impl Into<String>) -> Self {
        self.java = java.into();
        self
    }

    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_engine(mut self, engine: SharedEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Command line for the native agent, if configured.
    pub fn native_command(&self) -> Option<(String, Vec<String>)> {
        let bin = self.native_bin.as_ref()?;
        Some((bin.display().to_string(), vec!["agent".to_string()]))
    }

    /// Command line for the Java agent, if configured.
    pub fn java_command(&self) -> Option<(String, Vec<String>)> {
        let jar = self.jar.as_ref()?;
        Some((
            self.java.clone(),
            vec![
                "-jar".to_string(),
                jar.display().to_string(),
                "agent".to_string(),
            ],
        ))
    }
}
