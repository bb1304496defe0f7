//! Container runtime abstraction.
//!
//! The orchestrator never talks to a runtime directly; everything goes through
//! [`ContainerRuntime`] so the Docker adapter and the in-process fake are interchangeable.

use crate::config::policy::model::Capability;
use crate::config::types::{MountSpec, PortSpec, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Label carrying the session name
pub const LABEL_SESSION: &str = "io.sessionbox.session";
/// Label carrying the session mode
pub const LABEL_MODE: &str = "io.sessionbox.mode";
/// Label carrying the policy fingerprint
pub const LABEL_POLICY: &str = "io.sessionbox.policy";

/// Instance state as reported by the runtime
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl InstanceState {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "created" => InstanceState::Created,
            "running" | "up" => InstanceState::Running,
            "paused" => InstanceState::Paused,
            "restarting" => InstanceState::Restarting,
            "removing" => InstanceState::Removing,
            "exited" | "stopped" => InstanceState::Exited,
            "dead" => InstanceState::Dead,
            _ => InstanceState::Unknown,
        }
    }

    /// Holds a slot against the session cap
    pub fn is_live(self) -> bool {
        matches!(
            self,
            InstanceState::Running | InstanceState::Paused | InstanceState::Restarting
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Created => "created",
            InstanceState::Running => "running",
            InstanceState::Paused => "paused",
            InstanceState::Restarting => "restarting",
            InstanceState::Removing => "removing",
            InstanceState::Exited => "exited",
            InstanceState::Dead => "dead",
            InstanceState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inspected view of one instance
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InstanceInfo {
    pub name: String,
    pub id: String,
    pub state: InstanceState,
    pub labels: BTreeMap<String, String>,
    pub started_at: Option<DateTime<Utc>>,
    /// Address on the bridge network, if any
    pub address: Option<IpAddr>,
    pub read_only_rootfs: bool,
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
    /// Memory ceiling in bytes; 0 means unlimited
    pub memory_limit: u64,
    /// Named volumes mounted into the instance
    pub volumes: Vec<String>,
    pub restart_count: u32,
    pub oom_killed: bool,
}

impl InstanceInfo {
    /// Bare instance in `state`, everything else empty
    pub fn new(name: &str, state: InstanceState) -> Self {
        Self {
            name: name.to_string(),
            id: String::new(),
            state,
            labels: BTreeMap::new(),
            started_at: None,
            address: None,
            read_only_rootfs: false,
            cap_drop: Vec::new(),
            cap_add: Vec::new(),
            security_opt: Vec::new(),
            memory_limit: 0,
            volumes: Vec::new(),
            restart_count: 0,
            oom_killed: false,
        }
    }

    /// Session name from the label, falling back to the instance name
    pub fn session_name(&self) -> &str {
        self.labels
            .get(LABEL_SESSION)
            .map(String::as_str)
            .unwrap_or(&self.name)
    }

    pub fn uptime(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.started_at
            .and_then(|started| (now - started).to_std().ok())
    }

    pub fn has_no_new_privileges(&self) -> bool {
        self.security_opt
            .iter()
            .any(|opt| matches!(opt.as_str(), "no-new-privileges" | "no-new-privileges:true" | "no-new-privileges=true"))
    }
}

/// Instantaneous resource sample
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceStats {
    pub cpu_pct: f64,
    /// Memory use as a percentage of the instance ceiling
    pub mem_pct: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartPolicy {
    No,
    OnFailure,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LaunchNetwork {
    None,
    Host,
    Bridge(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ulimit {
    pub name: &'static str,
    pub soft: u64,
    pub hard: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeMount {
    pub name: String,
    pub target: PathBuf,
}

/// Everything needed to create one instance
#[derive(Clone, Debug, PartialEq)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    /// Allocate a TTY and keep stdin open for a later attach
    pub interactive: bool,
    pub auto_remove: bool,
    pub restart: RestartPolicy,
    pub network: LaunchNetwork,
    pub read_only_rootfs: bool,
    /// (path, size in bytes, mount options)
    pub tmpfs: Vec<(PathBuf, u64, String)>,
    /// Always dropped before `cap_add` is applied
    pub cap_drop_all: bool,
    pub cap_add: Vec<Capability>,
    pub security_opt: Vec<String>,
    pub cpus: f64,
    pub memory_bytes: u64,
    pub pids_limit: u32,
    pub ulimits: Vec<Ulimit>,
    pub gpus: bool,
    pub mounts: Vec<MountSpec>,
    pub volume: Option<VolumeMount>,
    pub ports: Vec<PortSpec>,
    pub env: Vec<(String, String)>,
}

/// Container runtime seam. Stop and remove treat "already gone" as success.
pub trait ContainerRuntime: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Create (but do not start) an instance; returns its id
    fn create(&self, spec: &LaunchSpec) -> Result<String>;

    fn start(&self, name: &str) -> Result<()>;

    /// Attach the caller's terminal; returns the instance exit code
    fn attach(&self, name: &str) -> Result<i32>;

    fn stop(&self, name: &str) -> Result<()>;

    fn remove(&self, name: &str) -> Result<()>;

    fn remove_volume(&self, volume: &str) -> Result<()>;

    /// None when no instance has this name
    fn inspect(&self, name: &str) -> Result<Option<InstanceInfo>>;

    fn stats(&self, name: &str) -> Result<InstanceStats>;

    /// Every managed instance, in any state
    fn list_instances(&self) -> Result<Vec<InstanceInfo>>;

    /// Every managed volume name
    fn list_volumes(&self) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_state_parse() {
        assert_eq!(InstanceState::parse("running"), InstanceState::Running);
        assert_eq!(InstanceState::parse("Exited"), InstanceState::Exited);
        assert_eq!(InstanceState::parse("dead"), InstanceState::Dead);
        assert_eq!(InstanceState::parse("weird"), InstanceState::Unknown);
        assert!(InstanceState::Running.is_live());
        assert!(!InstanceState::Created.is_live());
        assert!(!InstanceState::Exited.is_live());
    }

    #[test]
    fn test_session_name_prefers_label() {
        let mut info = InstanceInfo::new("container-name", InstanceState::Running);
        assert_eq!(info.session_name(), "container-name");
        info.labels
            .insert(LABEL_SESSION.to_string(), "calm-otter-0001".to_string());
        assert_eq!(info.session_name(), "calm-otter-0001");
    }

    #[test]
    fn test_uptime() {
        let now = Utc::now();
        let mut info = InstanceInfo::new("s", InstanceState::Running);
        assert_eq!(info.uptime(now), None);
        info.started_at = Some(now - chrono::Duration::minutes(65));
        assert_eq!(info.uptime(now), Some(Duration::from_secs(65 * 60)));
        // Clock skew never yields a negative uptime
        info.started_at = Some(now + chrono::Duration::minutes(1));
        assert_eq!(info.uptime(now), None);
    }
}
