//! Work units and the shared backlog
//!
//! - `WorkUnit` / `WorkKind`: one schedulable item of scraping work
//! - `FailureKind` / `UnitOutcome` / `ScrapeResult`: what happened to it
//! - `WorkQueue`: the backlog that workers drain

mod queue;
mod result;
mod unit;

pub use queue::WorkQueue;
pub use result::{ExecutionOutput, FailureClass, FailureKind, ScrapeResult, UnitOutcome};
pub use unit::{parse_units, WorkKind, WorkUnit};
