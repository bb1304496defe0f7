//! Observability
//!
//! Structured lifecycle events and metrics for operational visibility.

pub mod audit;
pub mod metrics;

pub use audit::{AuditLog, EventKind, EventSink, LifecycleEvent, LogSink};
pub use metrics::MetricsRegistry;
