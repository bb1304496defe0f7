//! Session orchestration core.
//!
//! Owns the wiring between components; everything stateful lives in the runtime and the
//! session registry.

pub mod orchestrator;

pub use orchestrator::{DestroyReport, SessionOrchestrator, StartOutcome};
