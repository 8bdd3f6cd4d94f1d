//! Execution outcomes
//!
//! `FailureKind` is what the execution capability returns at its boundary.
//! The scheduler never inspects free text; it only matches on these variants.

use std::fmt;

/// Payload returned by a successful execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    /// Raw payload (typically the response body)
    pub payload: String,
    /// Sub-items produced (posts, comments, ...)
    pub items: u64,
}

impl ExecutionOutput {
    pub fn new(payload: impl Into<String>, items: u64) -> Self {
        Self {
            payload: payload.into(),
            items,
        }
    }
}

/// Typed failure returned by the execution capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Empty or unparseable body; often a disguised rate limit
    Malformed(String),

    /// Connection refused, DNS failure, reset, 5xx
    Network(String),

    /// The attempt did not finish in time
    Timeout,

    /// Explicit throttling, 403/412, login wall
    Blocked { status: Option<u16>, reason: String },

    /// The unit itself cannot be served (deleted post, 404)
    Rejected(String),

    /// Anything else
    Other(String),
}

/// Coarse error class used for statistics and propagation rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retried locally after a short delay
    Transient,
    /// Retried with rotation and cooldown
    RateLimited,
    /// Retrying cannot help
    Permanent,
}

impl FailureKind {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Network(_) | Self::Timeout | Self::Other(_) => FailureClass::Transient,
            Self::Malformed(_) | Self::Blocked { .. } => FailureClass::RateLimited,
            Self::Rejected(_) => FailureClass::Permanent,
        }
    }

    /// Counts toward the run-wide consecutive-timeout counter
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "malformed response: {}", msg),
            Self::Network(msg) => write!(f, "network error: {}", msg),
            Self::Timeout => f.write_str("timed out"),
            Self::Blocked {
                status: Some(code),
                reason,
            } => write!(f, "blocked (HTTP {}): {}", code, reason),
            Self::Blocked { status: None, reason } => write!(f, "blocked: {}", reason),
            Self::Rejected(msg) => write!(f, "rejected: {}", msg),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Final outcome of one work unit within a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Succeeded { items: u64 },

    /// Permanent failure reported by the executor
    Failed { failure: FailureKind },

    /// Ran out of attempts
    Abandoned { last: FailureKind },

    /// Already marked succeeded by an earlier run
    Skipped,

    /// The run was cancelled before the unit resolved
    Interrupted,
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Skipped)
    }
}

/// Result of running one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeResult {
    pub unit_id: String,
    /// Attempt number that produced the outcome
    pub attempts: u32,
    pub outcome: UnitOutcome,
}
