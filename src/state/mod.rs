//! State module for the shared scraping resources
//!
//! # Components
//!
//! - `Identity`: an account with its health, usage counters and cooldown
//! - `Lease`: a time-bounded proxy endpoint
//! - `UnitStatus`: the persisted status of a work unit (success, failed, pending)

mod identity;
mod lease;
mod unit_status;

pub use identity::Identity;
pub use lease::{Lease, ProxyEndpoint};
pub use unit_status::UnitStatus;
