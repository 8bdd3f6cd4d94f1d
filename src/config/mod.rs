//! Configuration module for Sumi-Sluice
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use sumi_sluice::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("sluice.toml")).unwrap();
//! println!("Running {} workers", config.scheduler.concurrency);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    BackoffConfig, Config, IdentitiesConfig, IdentityEntry, OutputConfig, PacingConfig,
    ProxyConfig, SchedulerConfig, TransportConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash};
pub use validation::validate;
