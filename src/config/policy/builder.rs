//! Request validation and policy compilation.

use crate::config::policy::model::{
    FilesystemPolicy, NetworkPolicy, NetworkScope, ResourceCeilings, SandboxPolicy,
    SeccompProfile, SecurityProfiles, TmpfsMount, BASELINE_CAPABILITIES,
};
use crate::config::settings::Config;
use crate::config::types::{
    Mode, MountSpec, NetworkMode, PortSpec, RawRequest, SandboxRequest, ValidationError,
};
use crate::network::tier::Tier;
use std::sync::Arc;

/// Smallest memory limit a sandbox may request
pub const MIN_MEMORY_BYTES: u64 = 4 * 1024 * 1024;

/// Longest accepted per-session idle timeout (one year)
pub const MAX_IDLE_TIMEOUT_MINUTES: u64 = 365 * 24 * 60;

const KIB: f64 = 1024.0;

/// Parse `<digits>[.<digits>][b|k|kb|m|mb|g|gb]`, case-insensitive. Bare digits are bytes.
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim().to_ascii_lowercase();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);

    let (whole, fraction) = match number.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (number, None),
    };
    if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if let Some(fraction) = fraction {
        if fraction.is_empty() || !fraction.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
    }

    let multiplier = match unit {
        "" | "b" => 1.0,
        "k" | "kb" => KIB,
        "m" | "mb" => KIB * KIB,
        "g" | "gb" => KIB * KIB * KIB,
        _ => return None,
    };

    let amount: f64 = number.parse().ok()?;
    let bytes = (amount * multiplier).floor();
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return None;
    }
    Some(bytes as u64)
}

fn valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Turns raw requests into validated requests, and validated requests into policies.
#[derive(Clone)]
pub struct PolicyBuilder {
    config: Arc<Config>,
}

impl PolicyBuilder {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Validate every field; the error names each invalid field and nothing partial is
    /// returned.
    pub fn validate(&self, raw: &RawRequest) -> Result<SandboxRequest, ValidationError> {
        let mut errors = ValidationError::new();

        let mode = Mode::parse(&raw.mode);
        if mode.is_none() {
            errors.push(
                "mode",
                format!("'{}' is not one of: cli, desktop", raw.mode),
            );
        }

        let network = NetworkMode::parse(&raw.network);
        if network.is_none() {
            errors.push(
                "network",
                format!("'{}' is not one of: none, host, filtered", raw.network),
            );
        }

        let tier = match raw.tier.as_deref() {
            None => Some(Tier::default()),
            Some(value) => {
                let tier = Tier::parse(value);
                if tier.is_none() {
                    errors.push(
                        "tier",
                        format!(
                            "'{}' is not one of: free, basic, pro, dev, founder, admin",
                            value
                        ),
                    );
                }
                tier
            }
        };

        let cpus = raw
            .cpus
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|c| c.is_finite() && *c > 0.0);
        if cpus.is_none() {
            errors.push(
                "cpus",
                format!("'{}' is not a positive decimal number", raw.cpus),
            );
        }

        let memory_bytes = match parse_size(&raw.memory) {
            Some(bytes) if bytes >= MIN_MEMORY_BYTES => Some(bytes),
            Some(bytes) => {
                errors.push(
                    "memory",
                    format!("{} bytes is below the 4m minimum", bytes),
                );
                None
            }
            None => {
                errors.push(
                    "memory",
                    format!(
                        "'{}' does not match <digits>[.<digits>][b|k|kb|m|mb|g|gb]",
                        raw.memory
                    ),
                );
                None
            }
        };

        if raw.ephemeral && raw.persist {
            errors.push("persist", "cannot be combined with ephemeral");
        }

        let mut mounts = Vec::with_capacity(raw.mounts.len());
        for spec in &raw.mounts {
            match MountSpec::parse(spec) {
                Ok(mount) => mounts.push(mount),
                Err(reason) => errors.push("mounts", format!("'{}': {}", spec, reason)),
            }
        }

        let mut ports = Vec::with_capacity(raw.ports.len());
        for spec in &raw.ports {
            match PortSpec::parse(spec) {
                Ok(port) => ports.push(port),
                Err(reason) => errors.push("ports", format!("'{}': {}", spec, reason)),
            }
        }
        if !ports.is_empty() && network.is_some() && network != Some(NetworkMode::Filtered) {
            errors.push("ports", "published ports need the filtered (bridged) network");
        }

        let mut env = Vec::with_capacity(raw.env.len());
        for entry in &raw.env {
            match entry.split_once('=') {
                Some((key, value)) if valid_env_key(key) => {
                    env.push((key.to_string(), value.to_string()))
                }
                _ => errors.push("env", format!("'{}' is not KEY=VALUE", entry)),
            }
        }

        let image = match raw.image.as_deref().map(str::trim) {
            Some("") => {
                errors.push("image", "cannot be empty");
                None
            }
            other => other.map(str::to_string),
        };

        let idle_timeout_minutes = match raw.idle_timeout_minutes.as_deref() {
            None => None,
            Some(value) => {
                match value.trim().parse::<u64>() {
                    Ok(minutes) if minutes <= MAX_IDLE_TIMEOUT_MINUTES => Some(minutes),
                    Ok(_) => {
                        errors.push(
                            "idle_timeout_minutes",
                            format!("'{}' exceeds the maximum of {} minutes", value, MAX_IDLE_TIMEOUT_MINUTES),
                        );
                        None
                    }
                    Err(_) => {
                        errors.push(
                            "idle_timeout_minutes",
                            format!("'{}' is not a non-negative integer", value),
                        );
                        None
                    }
                }
            }
        };

        match (mode, network, tier, cpus, memory_bytes) {
            (Some(mode), Some(network), Some(tier), Some(cpus), Some(memory_bytes))
                if errors.is_empty() =>
            {
                Ok(SandboxRequest {
                    mode,
                    network,
                    tier,
                    cpus,
                    memory_bytes,
                    gpu: raw.gpu,
                    ephemeral: raw.ephemeral,
                    persist: raw.persist,
                    mounts,
                    ports,
                    env,
                    image,
                    idle_timeout_minutes,
                })
            }
            _ => Err(errors),
        }
    }

    /// Compile a validated request and its resolved network scope into a policy.
    pub fn compile(&self, request: &SandboxRequest, scope: NetworkScope) -> SandboxPolicy {
        let security = &self.config.security;

        let filesystem = FilesystemPolicy {
            read_only_root: true,
            tmpfs: security
                .tmpfs
                .iter()
                .map(|t| TmpfsMount {
                    path: t.path.clone(),
                    size_bytes: t.size_mb * 1024 * 1024,
                })
                .collect(),
        };

        let profiles = SecurityProfiles {
            seccomp: match &security.seccomp_profile {
                Some(path) => SeccompProfile::Custom(path.clone()),
                None => SeccompProfile::RuntimeDefault,
            },
            apparmor: security.apparmor_profile.clone(),
            no_new_privileges: true,
        };

        let network = NetworkPolicy {
            mode: request.network,
            tier: request.tier,
            scope,
        };

        let policy = SandboxPolicy::new(
            BASELINE_CAPABILITIES.to_vec(),
            filesystem,
            profiles,
            ResourceCeilings::new(request.cpus, request.memory_bytes),
            network,
            request.gpu,
        );

        log::debug!(
            "Compiled policy {} (mode={}, network={}, tier={}, gpu={})",
            policy.fingerprint(),
            request.mode,
            request.network,
            request.tier,
            request.gpu
        );
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::policy::model::{Capability, NOFILE_HARD, NOFILE_SOFT, NPROC_HARD};

    fn builder() -> PolicyBuilder {
        PolicyBuilder::new(Arc::new(Config::default()))
    }

    fn raw() -> RawRequest {
        RawRequest {
            mode: "cli".to_string(),
            network: "filtered".to_string(),
            cpus: "2".to_string(),
            memory: "4g".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_size_grammar() {
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("512b"), Some(512));
        assert_eq!(parse_size("4k"), Some(4096));
        assert_eq!(parse_size("4KB"), Some(4096));
        assert_eq!(parse_size("1.5m"), Some(1572864));
        assert_eq!(parse_size("4G"), Some(4 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("2gb"), Some(2 * 1024 * 1024 * 1024));

        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("g"), None);
        assert_eq!(parse_size("1.g"), None);
        assert_eq!(parse_size(".5g"), None);
        assert_eq!(parse_size("1.2.3m"), None);
        assert_eq!(parse_size("12x"), None);
        assert_eq!(parse_size("-1m"), None);
    }

    #[test]
    fn test_validate_defaults_tier_to_free() {
        let request = builder().validate(&raw()).unwrap();
        assert_eq!(request.tier, Tier::Free);
        assert_eq!(request.mode, Mode::Cli);
        assert_eq!(request.memory_bytes, 4 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_validate_collects_every_invalid_field() {
        let request = RawRequest {
            mode: "tui".to_string(),
            network: "bridge".to_string(),
            cpus: "0".to_string(),
            memory: "12x".to_string(),
            tier: Some("gold".to_string()),
            ..Default::default()
        };

        let error = builder().validate(&request).unwrap_err();
        for field in ["mode", "network", "cpus", "memory", "tier"] {
            assert!(error.has_field(field), "missing {}", field);
        }
    }

    #[test]
    fn test_validate_rejects_memory_below_minimum() {
        let mut request = raw();
        request.memory = "1m".to_string();
        let error = builder().validate(&request).unwrap_err();
        assert_eq!(error.fields(), vec!["memory"]);

        request.memory = "4m".to_string();
        assert!(builder().validate(&request).is_ok());
    }

    #[test]
    fn test_validate_rejects_ephemeral_with_persist() {
        let mut request = raw();
        request.ephemeral = true;
        request.persist = true;
        assert!(builder().validate(&request).unwrap_err().has_field("persist"));
    }

    #[test]
    fn test_validate_env_mounts_ports() {
        let mut request = raw();
        request.env = vec!["LANG=C.UTF-8".to_string(), "EMPTY=".to_string()];
        request.mounts = vec!["/srv/data=/data:ro".to_string()];
        request.ports = vec!["8080:80".to_string()];
        let valid = builder().validate(&request).unwrap();
        assert_eq!(valid.env[0], ("LANG".to_string(), "C.UTF-8".to_string()));
        assert_eq!(valid.env[1].1, "");
        assert_eq!(valid.mounts.len(), 1);

        request.env = vec!["1BAD=x".to_string(), "novalue".to_string()];
        request.network = "none".to_string();
        let error = builder().validate(&request).unwrap_err();
        assert!(error.has_field("env"));
        assert!(error.has_field("ports"));
    }

    #[test]
    fn test_validate_idle_timeout_override() {
        let mut request = raw();
        request.idle_timeout_minutes = Some("0".to_string());
        assert_eq!(
            builder().validate(&request).unwrap().idle_timeout_minutes,
            Some(0)
        );

        request.idle_timeout_minutes = Some("-5".to_string());
        assert!(builder()
            .validate(&request)
            .unwrap_err()
            .has_field("idle_timeout_minutes"));
    }

    #[test]
    fn test_validate_idle_timeout_upper_bound() {
        let mut request = raw();
        request.idle_timeout_minutes = Some(MAX_IDLE_TIMEOUT_MINUTES.to_string());
        assert_eq!(
            builder().validate(&request).unwrap().idle_timeout_minutes,
            Some(MAX_IDLE_TIMEOUT_MINUTES)
        );

        for value in [
            (MAX_IDLE_TIMEOUT_MINUTES + 1).to_string(),
            "307445734561825862".to_string(),
            u64::MAX.to_string(),
        ] {
            request.idle_timeout_minutes = Some(value);
            assert!(builder()
                .validate(&request)
                .unwrap_err()
                .has_field("idle_timeout_minutes"));
        }
    }

    #[test]
    fn test_capabilities_never_exceed_baseline() {
        let builder = builder();
        for (mode, network, gpu) in [
            ("cli", "none", false),
            ("cli", "host", true),
            ("desktop", "filtered", true),
            ("desktop", "none", false),
        ] {
            let mut request = raw();
            request.mode = mode.to_string();
            request.network = network.to_string();
            request.gpu = gpu;
            let request = builder.validate(&request).unwrap();
            let policy = builder.compile(&request, NetworkScope::Isolated);

            assert!(policy
                .capabilities()
                .iter()
                .all(|cap| BASELINE_CAPABILITIES.contains(cap)));
            assert_eq!(policy.gpu(), gpu);
        }
    }

    #[test]
    fn test_compile_applies_hardening_and_ceilings() {
        let builder = builder();
        let request = builder.validate(&raw()).unwrap();
        let policy = builder.compile(&request, NetworkScope::Unrestricted);

        assert!(policy.filesystem().read_only_root);
        let tmpfs: Vec<_> = policy
            .filesystem()
            .tmpfs
            .iter()
            .map(|t| t.path.to_string_lossy().to_string())
            .collect();
        assert_eq!(tmpfs, vec!["/tmp", "/run", "/var/tmp"]);

        assert!(policy.security().no_new_privileges);
        assert_eq!(policy.security().seccomp, SeccompProfile::RuntimeDefault);
        assert_eq!(policy.ceilings().pids, 512);
        assert_eq!(policy.ceilings().nofile_hard, NOFILE_HARD);
        assert_eq!(policy.ceilings().nofile_soft, NOFILE_SOFT);
        assert_eq!(policy.ceilings().nproc_hard, NPROC_HARD);
        assert_eq!(policy.ceilings().memory_bytes, request.memory_bytes);
        assert!(policy.capabilities().contains(&Capability::Chown));
    }

    #[test]
    fn test_gpu_does_not_alter_capabilities_or_seccomp() {
        let builder = builder();
        let mut with_gpu = raw();
        with_gpu.gpu = true;
        let plain = builder.compile(&builder.validate(&raw()).unwrap(), NetworkScope::Isolated);
        let gpu = builder.compile(&builder.validate(&with_gpu).unwrap(), NetworkScope::Isolated);

        assert_eq!(plain.capabilities(), gpu.capabilities());
        assert_eq!(plain.security(), gpu.security());
        assert_ne!(plain.fingerprint(), gpu.fingerprint());
    }

    #[test]
    fn test_fingerprint_is_stable_for_equal_policies() {
        let builder = builder();
        let request = builder.validate(&raw()).unwrap();
        let a = builder.compile(&request, NetworkScope::Host);
        let b = builder.compile(&request, NetworkScope::Host);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }
}
