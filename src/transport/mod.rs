//! Collaborator contracts consumed by the scheduler
//!
//! The core never talks to a platform directly. It depends on four
//! capabilities, each a trait object so tests can substitute stubs:
//!
//! - `UnitExecutor`: perform one unit of work and return a payload or a typed failure
//! - `SessionProvider`: acquire or refresh the session of an identity
//! - `ProxyProvider`: provision fresh proxy leases
//! - `ProxyValidator`: check a lease against a known-good endpoint
//!
//! `http` holds the reqwest-backed implementations used by the binary.

mod http;

pub use http::{
    build_http_client, classify_response, render_url, CredentialSessions, HttpExecutor,
    HttpProxyProvider, HttpProxyValidator,
};

use crate::state::{Identity, Lease};
use crate::work::{ExecutionOutput, FailureKind, WorkUnit};
use async_trait::async_trait;
use thiserror::Error;

/// Performs one unit of work
#[async_trait]
pub trait UnitExecutor: Send + Sync {
    /// Executes `unit` as `identity`, optionally through `lease`
    ///
    /// The scheduler bounds this call with its own timeout.
    async fn execute(
        &self,
        identity: &Identity,
        lease: Option<&Lease>,
        unit: &WorkUnit,
    ) -> Result<ExecutionOutput, FailureKind>;
}

/// Errors from session acquisition
#[derive(Debug, Error)]
pub enum SessionError {
    /// The account can no longer log in; the identity becomes unhealthy
    #[error("session is dead: {0}")]
    Dead(String),

    /// Temporary failure; the identity keeps its current session
    #[error("session unavailable: {0}")]
    Unavailable(String),
}

/// Acquires or refreshes authentication state
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Returns a new opaque session handle for `identity`
    async fn acquire_session(&self, identity: &Identity) -> Result<String, SessionError>;
}

/// Errors from proxy provisioning
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("proxy provider request failed: {0}")]
    Request(String),

    #[error("proxy provider returned an unexpected payload: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for ProvisionError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.to_string())
    }
}

/// Obtains fresh leases from an upstream proxy provider
#[async_trait]
pub trait ProxyProvider: Send + Sync {
    async fn provision(&self, count: usize) -> Result<Vec<Lease>, ProvisionError>;
}

/// Tests a lease once, at replenishment time
#[async_trait]
pub trait ProxyValidator: Send + Sync {
    async fn validate(&self, lease: &Lease) -> bool;
}
