//! Session bookkeeping
//!
//! Durable records, reconciliation against the runtime, and name generation.

pub mod names;
pub mod reconcile;
pub mod registry;
pub mod store;

pub use names::{generate_name, validate_name};
pub use reconcile::{reconcile, SessionView};
pub use registry::SessionRegistry;
pub use store::{SessionMap, SessionStore};
