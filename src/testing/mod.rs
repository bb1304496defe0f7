//! Testing infrastructure
//!
//! In-memory runtime, firewall, resolver and event sink for exercising the orchestrator
//! without a container daemon.

pub mod fakes;

pub use fakes::{
    managed_instance, running_instance, scratch_config, scratch_dir, FakeFirewall,
    FakeRuntime, FirewallCall, MemorySink, StaticResolver,
};
