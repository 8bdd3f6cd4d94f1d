//! Shared resource pools
//!
//! The identity and proxy pools are the only mutable state shared between
//! workers. Each guards its resources with a single mutex and exposes an
//! atomic select-and-mark-used operation.

mod identity_pool;
mod proxy_pool;

pub use identity_pool::{IdentityPool, ReleaseOutcome};
pub use proxy_pool::ProxyPool;
