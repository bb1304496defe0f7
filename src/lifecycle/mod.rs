//! Session lifecycle
//!
//! Admission, idle and memory reaping, and garbage collection of terminal instances.

pub mod decision;
pub mod monitor;
pub mod sweep;

pub use decision::{
    classify_for_gc, decide_idle, decide_memory, GcClass, GcPlan, ReapAction, ReapDecision,
};
pub use monitor::{CycleReport, LifecycleMonitor};
