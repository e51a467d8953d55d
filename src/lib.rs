//! Gantry: label-driven workflow automation for GitHub repositories.
//!
//! Open issues and pull requests are work units. Their labels route each
//! unit to exactly one pipeline stage (planning, approval, execution,
//! review, fix, QA, merge); an AI agent does the heavy lifting inside each
//! stage; per-plan execution state persists as JSON so every step is
//! resumable.

pub mod agent;
pub mod config;
pub mod errors;
pub mod github;
pub mod orchestrator;
pub mod pipeline;
pub mod scheduler;
pub mod state;
