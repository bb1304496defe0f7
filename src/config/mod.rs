//! Configuration and policy
//!
//! Orchestrator settings, request types, request validation, and policy compilation.

pub mod policy;
pub mod settings;
pub mod types;
pub mod validator;

pub use settings::Config;
