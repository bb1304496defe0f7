//! Core types and structures for the sessionbox system

use crate::config::policy::SandboxPolicy;
use crate::network::tier::Tier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Sandbox interaction mode
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Attached interactive shell, never restarted
    Cli,
    /// Detached desktop session, restarted on failure
    Desktop,
}

impl Mode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cli" => Some(Mode::Cli),
            "desktop" => Some(Mode::Desktop),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Cli => "cli",
            Mode::Desktop => "desktop",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network attachment of a sandbox
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No network interface besides loopback
    None,
    /// Host network namespace, unfiltered
    Host,
    /// Bridged network restricted by a tier allow-list
    Filtered,
}

impl NetworkMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Some(NetworkMode::None),
            "host" => Some(NetworkMode::Host),
            "filtered" => Some(NetworkMode::Filtered),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NetworkMode::None => "none",
            NetworkMode::Host => "host",
            NetworkMode::Filtered => "filtered",
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport protocol for published ports and firewall rules
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bind mount from the host into the sandbox
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountSpec {
    /// Source directory on host system
    pub source: PathBuf,
    /// Target directory within sandbox
    pub target: PathBuf,
    pub read_only: bool,
}

impl MountSpec {
    /// Parse a mount from `source=target[:ro|rw]`; a bare path mounts at the same location.
    pub fn parse(spec: &str) -> std::result::Result<Self, String> {
        let (path_part, options) = match spec.rsplit_once(':') {
            Some((path, opts)) if matches!(opts, "ro" | "rw" | "") => (path, opts),
            _ => (spec, ""),
        };

        let (source, target) = match path_part.split_once('=') {
            Some((source, target)) => {
                if source.is_empty() || target.is_empty() || target.contains('=') {
                    return Err("expected source=target[:ro|rw]".to_string());
                }
                (PathBuf::from(source), PathBuf::from(target))
            }
            None => (PathBuf::from(path_part), PathBuf::from(path_part)),
        };

        if !target.is_absolute() {
            return Err(format!("target '{}' must be an absolute path", target.display()));
        }
        if target
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(format!("target '{}' must not contain '..'", target.display()));
        }

        Ok(MountSpec {
            source,
            target,
            read_only: options != "rw",
        })
    }
}

/// Published port mapping
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortSpec {
    pub host: Option<u16>,
    pub container: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    /// Parse a port from `[host:]container[/tcp|udp]`.
    pub fn parse(spec: &str) -> std::result::Result<Self, String> {
        let (ports, protocol) = match spec.split_once('/') {
            Some((ports, "tcp")) => (ports, Protocol::Tcp),
            Some((ports, "udp")) => (ports, Protocol::Udp),
            Some((_, other)) => return Err(format!("unknown protocol '{}'", other)),
            None => (spec, Protocol::Tcp),
        };

        let parse_port = |value: &str| -> std::result::Result<u16, String> {
            match value.parse::<u16>() {
                Ok(0) | Err(_) => Err(format!("'{}' is not a port in 1-65535", value)),
                Ok(port) => Ok(port),
            }
        };

        let (host, container) = match ports.split_once(':') {
            Some((host, container)) => (Some(parse_port(host)?), parse_port(container)?),
            None => (None, parse_port(ports)?),
        };

        Ok(PortSpec {
            host,
            container,
            protocol,
        })
    }
}

/// Unvalidated request as received from the command surface.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawRequest {
    pub mode: String,
    pub network: String,
    pub tier: Option<String>,
    pub cpus: String,
    pub memory: String,
    pub gpu: bool,
    pub ephemeral: bool,
    pub persist: bool,
    pub mounts: Vec<String>,
    pub ports: Vec<String>,
    pub env: Vec<String>,
    pub image: Option<String>,
    pub idle_timeout_minutes: Option<String>,
}

/// A validated sandbox request. Immutable once accepted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SandboxRequest {
    pub mode: Mode,
    pub network: NetworkMode,
    pub tier: Tier,
    /// CPU limit in cores
    pub cpus: f64,
    /// Memory limit in bytes
    pub memory_bytes: u64,
    pub gpu: bool,
    pub ephemeral: bool,
    pub persist: bool,
    pub mounts: Vec<MountSpec>,
    pub ports: Vec<PortSpec>,
    pub env: Vec<(String, String)>,
    pub image: Option<String>,
    /// Per-session idle timeout override
    pub idle_timeout_minutes: Option<u64>,
}

/// Session lifecycle status
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Running,
    Stopped,
    Exited,
    Removed,
    /// Live instance with no registry record. Never persisted.
    Orphan,
}

impl SessionStatus {
    fn rank(self) -> u8 {
        match self {
            SessionStatus::Created => 0,
            SessionStatus::Running => 1,
            SessionStatus::Stopped | SessionStatus::Exited => 2,
            SessionStatus::Removed => 3,
            SessionStatus::Orphan => 0,
        }
    }

    /// Status only moves forward, or from orphan back to running on reconciliation.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        match (self, next) {
            (_, SessionStatus::Orphan) => false,
            (SessionStatus::Orphan, SessionStatus::Running) => true,
            (SessionStatus::Orphan, _) => false,
            (current, next) => next.rank() > current.rank(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Exited => "exited",
            SessionStatus::Removed => "removed",
            SessionStatus::Orphan => "orphan",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sandboxed execution context. Owned by the session registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub name: String,
    pub request: SandboxRequest,
    pub policy: SandboxPolicy,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Instance id assigned by the container runtime
    pub runtime_ref: Option<String>,
}

impl Session {
    pub fn mode(&self) -> Mode {
        self.request.mode
    }
}

/// A single rejected request field
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

/// Request validation failure naming every invalid field
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    errors: Vec<FieldError>,
}

impl ValidationError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: &str, reason: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.to_string(),
            reason: reason.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    pub fn fields(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.field.as_str()).collect()
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid request field(s): ")?;
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", error.field, error.reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Non-fatal gap in a resolved allow-list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialPolicyWarning {
    pub host: String,
    pub reason: String,
}

impl fmt::Display for PartialPolicyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host '{}' could not be resolved ({}); allow-list is partial",
            self.host, self.reason
        )
    }
}

/// Non-fatal mismatch between applied isolation and policy
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VerificationWarning {
    pub session: String,
    pub failed_checks: Vec<String>,
}

impl fmt::Display for VerificationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session '{}' isolation posture degraded: {}",
            self.session,
            self.failed_checks.join(", ")
        )
    }
}

/// Custom error types for sessionbox
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("session '{name}' already exists (status: {status}); pick another name or destroy it first")]
    DuplicateSession { name: String, status: SessionStatus },

    #[error(
        "capacity reached: {running} of {max} sessions running; run `sessionbox list` to inspect, then `sessionbox stop <name>` or `sessionbox reap` to free a slot"
    )]
    Capacity { running: usize, max: usize },

    #[error("launch conflict for session '{name}': {detail}")]
    LaunchConflict { name: String, detail: String },

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("runtime operation '{operation}' failed: {detail}")]
    Runtime { operation: String, detail: String },

    #[error("firewall error: {0}")]
    Firewall(String),

    #[error("session registry error: {0}")]
    Registry(String),

    #[error("session '{0}' not found")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn runtime(operation: &str, detail: impl Into<String>) -> Self {
        SandboxError::Runtime {
            operation: operation.to_string(),
            detail: detail.into(),
        }
    }

    /// Process exit code for the command surface
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// Result type alias for sessionbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;
