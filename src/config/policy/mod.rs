//! Policy modules
//!
//! Request validation and compilation into an immutable enforcement policy.

pub mod builder;
pub mod model;

// Re-export commonly used items
pub use builder::{parse_size, PolicyBuilder, MAX_IDLE_TIMEOUT_MINUTES, MIN_MEMORY_BYTES};
pub use model::*;
