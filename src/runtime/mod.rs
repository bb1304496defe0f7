//! Container runtime integration
//!
//! Runtime and firewall seams, their host adapters, and the session launcher.

pub mod backend;
pub mod docker;
pub mod firewall;
pub mod launcher;

pub use backend::{ContainerRuntime, InstanceInfo, InstanceState, InstanceStats, LaunchSpec};
pub use docker::DockerRuntime;
pub use firewall::{Firewall, IptablesFirewall};
pub use launcher::{LaunchOutcome, RuntimeLauncher};
