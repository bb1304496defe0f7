//! Resolved enforcement policy.
//!
//! A [`SandboxPolicy`] is compiled once per session and never mutated afterwards: fields
//! are private and only readable through accessors.

use crate::config::types::NetworkMode;
use crate::network::rules::ResolvedRuleSet;
use crate::network::tier::Tier;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

/// Capabilities a sandbox may retain. Everything else is dropped.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    Chown,
    DacOverride,
    Setgid,
    Setuid,
}

/// The fixed maximal baseline
pub const BASELINE_CAPABILITIES: [Capability; 4] = [
    Capability::Chown,
    Capability::DacOverride,
    Capability::Setgid,
    Capability::Setuid,
];

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Chown => "CHOWN",
            Capability::DacOverride => "DAC_OVERRIDE",
            Capability::Setgid => "SETGID",
            Capability::Setuid => "SETUID",
        }
    }

    /// Parse a runtime-reported name, with or without the `CAP_` prefix.
    /// Returns None for anything outside the baseline.
    pub fn parse(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("CAP_").unwrap_or(&upper);
        BASELINE_CAPABILITIES
            .iter()
            .copied()
            .find(|cap| cap.as_str() == bare)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mount options applied to every tmpfs overlay
pub const TMPFS_OPTIONS: &str = "rw,noexec,nosuid,nodev";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TmpfsMount {
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilesystemPolicy {
    pub read_only_root: bool,
    pub tmpfs: Vec<TmpfsMount>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SeccompProfile {
    /// The container runtime's built-in default profile
    RuntimeDefault,
    Custom(PathBuf),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityProfiles {
    pub seccomp: SeccompProfile,
    pub apparmor: Option<String>,
    pub no_new_privileges: bool,
}

/// Process ceiling for every sandbox
pub const MAX_PIDS: u32 = 512;
pub const NOFILE_SOFT: u64 = 1024;
pub const NOFILE_HARD: u64 = 2048;
pub const NPROC_SOFT: u64 = 256;
pub const NPROC_HARD: u64 = 512;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResourceCeilings {
    pub cpus: f64,
    pub memory_bytes: u64,
    pub pids: u32,
    pub nofile_soft: u64,
    pub nofile_hard: u64,
    pub nproc_soft: u64,
    pub nproc_hard: u64,
}

impl ResourceCeilings {
    pub fn new(cpus: f64, memory_bytes: u64) -> Self {
        Self {
            cpus,
            memory_bytes,
            pids: MAX_PIDS,
            nofile_soft: NOFILE_SOFT,
            nofile_hard: NOFILE_HARD,
            nproc_soft: NPROC_SOFT,
            nproc_hard: NPROC_HARD,
        }
    }
}

/// Egress scope of a session
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum NetworkScope {
    /// Loopback only
    Isolated,
    /// Shares the host network namespace
    Host,
    /// Bridged with no filtering (privileged tiers)
    Unrestricted,
    /// Bridged and limited to a resolved allow-list
    AllowList(ResolvedRuleSet),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NetworkPolicy {
    pub mode: NetworkMode,
    pub tier: Tier,
    pub scope: NetworkScope,
}

impl NetworkPolicy {
    /// Rules to push after start, if any
    pub fn rule_set(&self) -> Option<&ResolvedRuleSet> {
        match &self.scope {
            NetworkScope::AllowList(rules) => Some(rules),
            _ => None,
        }
    }
}

/// Resolved enforcement spec for one session
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SandboxPolicy {
    capabilities: Vec<Capability>,
    filesystem: FilesystemPolicy,
    security: SecurityProfiles,
    ceilings: ResourceCeilings,
    network: NetworkPolicy,
    gpu: bool,
    fingerprint: String,
}

impl SandboxPolicy {
    pub(crate) fn new(
        capabilities: Vec<Capability>,
        filesystem: FilesystemPolicy,
        security: SecurityProfiles,
        ceilings: ResourceCeilings,
        network: NetworkPolicy,
        gpu: bool,
    ) -> Self {
        let mut policy = Self {
            capabilities,
            filesystem,
            security,
            ceilings,
            network,
            gpu,
            fingerprint: String::new(),
        };
        policy.fingerprint = policy.compute_fingerprint();
        policy
    }

    /// SHA-256 over the canonical JSON form (fingerprint field left empty)
    fn compute_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        match serde_json::to_vec(self) {
            Ok(bytes) => hasher.update(&bytes),
            Err(e) => {
                log::warn!("Policy serialization failed, fingerprinting debug form: {}", e);
                hasher.update(format!("{:?}", self).as_bytes());
            }
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn filesystem(&self) -> &FilesystemPolicy {
        &self.filesystem
    }

    pub fn security(&self) -> &SecurityProfiles {
        &self.security
    }

    pub fn ceilings(&self) -> &ResourceCeilings {
        &self.ceilings
    }

    pub fn network(&self) -> &NetworkPolicy {
        &self.network
    }

    /// GPU pass-through marker
    pub fn gpu(&self) -> bool {
        self.gpu
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}
