//! Analysis parameters and results.
//!
//! The dispatcher treats results as opaque beyond the `status` tag and the
//! error `kind`: payload fields are defaulted when absent so that whatever
//! the engine reports passes through unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which analysis strategy the engine should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckerStrategy {
    Hybrid,
    Automaton,
    Fuzz,
}

/// Which checker produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckerKind {
    Automaton,
    Fuzz,
}

/// Engine parameters forwarded verbatim to the analysis collaborator.
///
/// Unset fields are omitted on the wire so the engine applies its own
/// defaults. `logger` is the serializable stand-in for a progress callback:
/// when `true` the engine streams progress messages for the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameters {
    /// Timeout in milliseconds. Enforced by the engine, which reports
    /// `unknown/timeout` when it expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checker: Option<CheckerStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attack_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attack_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incubation_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutate_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_seed_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_generation_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iteration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_degree: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heat_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses_acceleration: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_repeat_count: Option<u64>,
    #[serde(
        default,
        rename = "maxNFASize",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_nfa_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pattern_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<bool>,
}

impl Parameters {
    pub fn with_timeout(mut self, millis: u64) -> Self {
        self.timeout = Some(millis);
        self
    }

    pub fn with_checker(mut self, checker: CheckerStrategy) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn with_random_seed(mut self, seed: i64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    /// Whether the caller asked for progress messages.
    pub fn wants_progress(&self) -> bool {
        self.logger == Some(true)
    }
}

/// Growth of the matching time against the input length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Complexity {
    Constant {
        #[serde(default, rename = "isFuzz")]
        is_fuzz: bool,
    },
    Linear {
        #[serde(default, rename = "isFuzz")]
        is_fuzz: bool,
    },
    Safe {
        #[serde(default, rename = "isFuzz")]
        is_fuzz: bool,
    },
    Polynomial {
        degree: u32,
        #[serde(default, rename = "isFuzz")]
        is_fuzz: bool,
    },
    Exponential {
        #[serde(default, rename = "isFuzz")]
        is_fuzz: bool,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pump {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub pump: String,
    #[serde(default)]
    pub bias: u64,
}

/// An input that triggers the super-linear behaviour.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttackPattern {
    #[serde(default)]
    pub pumps: Vec<Pump>,
    #[serde(default)]
    pub suffix: String,
    #[serde(default)]
    pub base: u64,
    #[serde(default)]
    pub string: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Temperature {
    Heat,
    Normal,
}

/// A span of the pattern responsible for the backtracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hotspot {
    pub start: usize,
    pub end: usize,
    pub temperature: Temperature,
}

/// Why an analysis ended without a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisError {
    Timeout,
    Cancel,
    Unsupported {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Invalid {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Unexpected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafeDiagnostics {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub flags: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checker: Option<CheckerKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerableDiagnostics {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub flags: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checker: Option<CheckerKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attack: Option<AttackPattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hotspot: Vec<Hotspot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnknownDiagnostics {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub flags: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checker: Option<CheckerKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AnalysisError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Safe,
    Vulnerable,
    Unknown,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Vulnerable => "vulnerable",
            Self::Unknown => "unknown",
        }
    }
}

/// Result of checking one pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Diagnostics {
    Safe(SafeDiagnostics),
    Vulnerable(VulnerableDiagnostics),
    Unknown(UnknownDiagnostics),
}

impl Diagnostics {
    /// The result reported for a check cancelled by its caller or by `kill`.
    pub fn cancelled(source: impl Into<String>, flags: impl Into<String>) -> Self {
        Self::unknown(source, flags, AnalysisError::Cancel)
    }

    pub fn unexpected(
        source: impl Into<String>,
        flags: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::unknown(
            source,
            flags,
            AnalysisError::Unexpected {
                message: Some(message.into()),
            },
        )
    }

    pub fn unknown(
        source: impl Into<String>,
        flags: impl Into<String>,
        error: AnalysisError,
    ) -> Self {
        Self::Unknown(UnknownDiagnostics {
            source: source.into(),
            flags: flags.into(),
            checker: None,
            error: Some(error),
        })
    }

    /// Interpret a raw engine result.
    ///
    /// Anything without a recognised `status` becomes `unknown/unexpected`
    /// rather than an error: the caller always gets a diagnostic.
    pub fn from_value(value: Value, source: &str, flags: &str) -> Self {
        match serde_json::from_value(value) {
            Ok(diagnostics) => diagnostics,
            Err(e) => {
                tracing::warn!(error = %e, "Engine returned an unrecognised result");
                Self::unexpected(source, flags, format!("unrecognised result: {e}"))
            }
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Self::Safe(_) => Status::Safe,
            Self::Vulnerable(_) => Status::Vulnerable,
            Self::Unknown(_) => Status::Unknown,
        }
    }

    pub fn error(&self) -> Option<&AnalysisError> {
        match self {
            Self::Unknown(d) => d.error.as_ref(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error(), Some(AnalysisError::Cancel))
    }

    pub fn source(&self) -> &str {
        match self {
            Self::Safe(d) => &d.source,
            Self::Vulnerable(d) => &d.source,
            Self::Unknown(d) => &d.source,
        }
    }
}
