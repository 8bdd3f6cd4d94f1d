//! Sumi-Sluice: a patient multi-identity scrape scheduler
//!
//! This crate drives long-running scrapes against rate-limited platforms. It
//! pairs each unit of work with an account identity and, optionally, a proxy
//! lease, paces requests, classifies failures into backoff decisions, and keeps
//! a durable progress record so that an interrupted run can be resumed.

pub mod config;
pub mod pool;
pub mod progress;
pub mod scheduler;
pub mod state;
pub mod transport;
pub mod work;

use thiserror::Error;

/// Main error type for Sumi-Sluice operations
#[derive(Debug, Error)]
pub enum SluiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Progress storage error: {0}")]
    Storage(#[from] progress::StorageError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Every identity in the pool has a dead session
    #[error("No healthy identity is available")]
    NoIdentityAvailable,

    /// Too many hard block signals were seen in a single run
    #[error("Block ceiling exceeded: {blocks} block events (ceiling {ceiling})")]
    BlockCeilingExceeded { blocks: u32, ceiling: u32 },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid work unit: {0}")]
    InvalidUnit(String),
}

impl SluiceError {
    /// Returns true for errors that abort the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoIdentityAvailable | Self::BlockCeilingExceeded { .. }
        )
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Sumi-Sluice operations
pub type Result<T> = std::result::Result<T, SluiceError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use pool::{IdentityPool, ProxyPool, ReleaseOutcome};
pub use progress::{ProgressStore, RunStats};
pub use scheduler::{BackoffClassifier, RunReport, Scheduler};
pub use state::{Identity, Lease, UnitStatus};
pub use work::{FailureKind, ScrapeResult, UnitOutcome, WorkKind, WorkQueue, WorkUnit};
