//! sessionbox: a single-host sandbox session orchestrator
//! Turns declarative sandbox requests into hardened container instances and keeps them in check.
//!
//! # Architecture
//!
//! ## Configuration & Policy ([`config`])
//! - [`config::settings`]: Configuration loading
//! - [`config::validator`]: Startup config validation
//! - [`config::types`]: Requests, sessions and the error taxonomy
//! - [`config::policy`]: Request validation and policy compilation
//!
//! ## Networking ([`network`])
//! - [`network::tier`]: Access tiers and their host catalogs
//! - [`network::resolver`]: Tier resolution into allow-lists
//! - [`network::rules`]: Ordered egress rules
//!
//! ## Sessions ([`session`])
//! - [`session::registry`]: Durable session bookkeeping
//! - [`session::reconcile`]: Records merged with live runtime state
//! - [`session::store`]: Locked, atomic state file
//!
//! ## Runtime ([`runtime`])
//! - [`runtime::backend`]: Container runtime seam
//! - [`runtime::docker`]: Docker CLI adapter
//! - [`runtime::firewall`]: Per-instance egress chains
//! - [`runtime::launcher`]: Session launch flow
//!
//! ## Verification ([`verify`])
//!
//! ## Lifecycle ([`lifecycle`])
//! - [`lifecycle::decision`]: Pure reaping and GC decisions
//! - [`lifecycle::monitor`]: Admission, reaping and GC executor
//! - [`lifecycle::sweep`]: Bounded parallel sampling
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured lifecycle events
//! - [`observability::metrics`]: Prometheus metrics export
//!
//! ## Testing Infrastructure ([`testing`])
//! - [`testing::fakes`]: In-memory runtime, firewall, resolver and event sink

// Configuration & Policy
pub mod config;

// Networking
pub mod network;

// Session bookkeeping
pub mod session;

// Container runtime integration
pub mod runtime;

// Isolation posture checks
pub mod verify;

// Admission, reaping, GC
pub mod lifecycle;

// Observability
pub mod observability;

// Component wiring
pub mod core;

// Testing Infrastructure
pub mod testing;

// CLI entrypoint
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use config::Config;
pub use crate::core::SessionOrchestrator;
