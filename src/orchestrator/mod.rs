//! Top-level orchestration: polling work units, dispatching stages, and
//! executing approved plans through the scheduler.

mod plan;
mod runner;

pub use plan::PlanExecutor;
pub use runner::{Orchestrator, ProcessSummary};
