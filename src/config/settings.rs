//! Orchestrator configuration, loaded once at startup and shared immutably.

use crate::config::types::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "SESSIONBOX_CONFIG";

/// Default config file name looked up in the current directory
pub const DEFAULT_CONFIG_FILE: &str = "sessionbox.json";

/// Full sessionbox.json structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding sessions.json and its lock file
    pub state_dir: PathBuf,
    /// JSON-lines audit log for lifecycle decisions (None disables the file sink)
    pub audit_log: Option<PathBuf>,
    pub runtime: RuntimeSettings,
    pub limits: LimitSettings,
    pub security: SecuritySettings,
    pub tiers: TierSettings,
    pub firewall: FirewallSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Container CLI binary
    pub binary: String,
    pub cli_image: String,
    pub desktop_image: String,
    /// Label marking instances owned by this orchestrator
    pub managed_label: String,
    /// Prefix for persistent volume names (`<prefix>-<session>`)
    pub volume_prefix: String,
    /// Mount point of the persistent volume inside the sandbox
    pub volume_mount: PathBuf,
    /// Bridge network used for filtered sessions
    pub filtered_network: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub max_sessions: usize,
    pub idle_timeout_minutes: u64,
    /// Sessions sampled below this CPU percentage are idle
    pub idle_cpu_pct: f64,
    pub memory_warn_pct: f64,
    pub memory_kill_pct: f64,
    /// Upper bound for one session's inspection during a sweep
    pub inspect_timeout_secs: u64,
    pub monitor_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// Seccomp profile path; None keeps the runtime default profile
    pub seccomp_profile: Option<PathBuf>,
    pub apparmor_profile: Option<String>,
    pub tmpfs: Vec<TmpfsSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TmpfsSettings {
    pub path: PathBuf,
    pub size_mb: u64,
}

/// Hosts added by each tier; the resolver accumulates them free ⊂ basic ⊂ pro.
///
/// The built-in hosts apply only when the `tiers` section is absent. A present section
/// replaces them, and a list it omits is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSettings {
    #[serde(default)]
    pub free: Vec<String>,
    #[serde(default)]
    pub basic: Vec<String>,
    #[serde(default)]
    pub pro: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallSettings {
    pub binary: String,
    /// Chain the per-instance chains are jumped from
    pub parent_chain: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: runtime_root_dir(),
            audit_log: Some(runtime_root_dir().join("audit.log")),
            runtime: RuntimeSettings::default(),
            limits: LimitSettings::default(),
            security: SecuritySettings::default(),
            tiers: TierSettings::default(),
            firewall: FirewallSettings::default(),
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            cli_image: "sessionbox/cli:latest".to_string(),
            desktop_image: "sessionbox/desktop:latest".to_string(),
            managed_label: "io.sessionbox.managed".to_string(),
            volume_prefix: "sessionbox-home".to_string(),
            volume_mount: PathBuf::from("/home/sandbox"),
            filtered_network: "bridge".to_string(),
        }
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_sessions: 5,
            idle_timeout_minutes: 60,
            idle_cpu_pct: 1.0,
            memory_warn_pct: 85.0,
            memory_kill_pct: 95.0,
            inspect_timeout_secs: 10,
            monitor_interval_secs: 60,
        }
    }
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            seccomp_profile: None,
            apparmor_profile: Some("docker-default".to_string()),
            tmpfs: vec![
                TmpfsSettings {
                    path: PathBuf::from("/tmp"),
                    size_mb: 256,
                },
                TmpfsSettings {
                    path: PathBuf::from("/run"),
                    size_mb: 64,
                },
                TmpfsSettings {
                    path: PathBuf::from("/var/tmp"),
                    size_mb: 128,
                },
            ],
        }
    }
}

impl Default for TierSettings {
    fn default() -> Self {
        Self {
            free: vec!["pypi.org:443".to_string(), "files.pythonhosted.org:443".to_string()],
            basic: vec![
                "github.com:443".to_string(),
                "codeload.github.com:443".to_string(),
                "registry.npmjs.org:443".to_string(),
            ],
            pro: vec![
                "crates.io:443".to_string(),
                "static.crates.io:443".to_string(),
                "deb.debian.org:80".to_string(),
            ],
        }
    }
}

impl Default for FirewallSettings {
    fn default() -> Self {
        Self {
            binary: "iptables".to_string(),
            parent_chain: "DOCKER-USER".to_string(),
        }
    }
}

/// State root scoped by effective UID so root and non-root runs never share bookkeeping.
pub fn runtime_root_dir() -> PathBuf {
    let euid = nix::unistd::geteuid();
    std::env::temp_dir().join(format!("sessionbox-uid-{}", euid))
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: Config = serde_json::from_str(&content).map_err(|e| {
            SandboxError::Config(format!("Failed to parse config JSON {}: {}", path.display(), e))
        })?;

        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Resolve the config source: explicit path, then `$SESSIONBOX_CONFIG`, then
    /// `./sessionbox.json`, then built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }

        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return Self::load_from_file(PathBuf::from(path));
        }

        let local = std::env::current_dir()
            .map_err(|e| SandboxError::Config(format!("Failed to get current directory: {}", e)))?
            .join(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Self::load_from_file(local);
        }

        log::debug!("No config file found, using built-in defaults");
        Ok(Self::default())
    }

    pub fn sessions_file(&self) -> PathBuf {
        self.state_dir.join("sessions.json")
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.idle_timeout_minutes * 60)
    }

    pub fn inspect_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.inspect_timeout_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.limits.monitor_interval_secs)
    }

    /// Durable volume name for a persistent session
    pub fn volume_name(&self, session: &str) -> String {
        format!("{}-{}", self.runtime.volume_prefix, session)
    }

    /// Inverse of [`Config::volume_name`]
    pub fn session_for_volume<'a>(&self, volume: &'a str) -> Option<&'a str> {
        volume
            .strip_prefix(self.runtime.volume_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .filter(|name| !name.is_empty())
    }
}
