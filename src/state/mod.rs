//! Persistent per-plan execution state.
//!
//! Two pieces: the serialized data model (`model`) and the durable store
//! with per-plan locking and atomic writes (`store`).

mod model;
mod store;

pub use model::{ExecutionState, KNOWN_STAGES, StageState, StepStatus, TaskState};
pub use store::StateStore;
