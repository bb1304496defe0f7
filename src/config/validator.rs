// Config validation
// Startup validation fails fast with actionable errors; warnings are logged and tolerated.

use crate::config::settings::Config;
use crate::config::types::{Result, SandboxError};

/// Validation result with detailed errors
#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate config at startup. Any error is fatal.
pub fn validate_config(config: &Config) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_limits(config, &mut result);
    validate_paths(config, &mut result);
    validate_runtime(config, &mut result);
    validate_tiers(config, &mut result);

    for warning in &result.warnings {
        log::warn!("config: {}", warning);
    }

    if !result.is_valid() {
        return Err(SandboxError::Config(format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn validate_limits(config: &Config, result: &mut ValidationResult) {
    let limits = &config.limits;

    if limits.max_sessions == 0 {
        result.add_error("limits.max_sessions cannot be zero".to_string());
    }

    for (name, pct) in [
        ("limits.memory_warn_pct", limits.memory_warn_pct),
        ("limits.memory_kill_pct", limits.memory_kill_pct),
        ("limits.idle_cpu_pct", limits.idle_cpu_pct),
    ] {
        if !(0.0..=100.0).contains(&pct) {
            result.add_error(format!("{} must be within 0-100, got {}", name, pct));
        }
    }

    if limits.memory_warn_pct >= limits.memory_kill_pct {
        result.add_error(format!(
            "limits.memory_warn_pct ({}) must be below limits.memory_kill_pct ({})",
            limits.memory_warn_pct, limits.memory_kill_pct
        ));
    }

    if limits.inspect_timeout_secs == 0 {
        result.add_error("limits.inspect_timeout_secs cannot be zero".to_string());
    }

    if limits.monitor_interval_secs == 0 {
        result.add_error("limits.monitor_interval_secs cannot be zero".to_string());
    }

    if limits.idle_timeout_minutes == 0 {
        result.add_warning(
            "limits.idle_timeout_minutes is 0: every idle session is reaped on the next sweep"
                .to_string(),
        );
    }
}

fn validate_paths(config: &Config, result: &mut ValidationResult) {
    if !config.state_dir.is_absolute() {
        result.add_error(format!(
            "state_dir must be absolute path: {:?}",
            config.state_dir
        ));
    }

    if let Some(ref audit_log) = config.audit_log {
        if !audit_log.is_absolute() {
            result.add_error(format!("audit_log must be absolute path: {:?}", audit_log));
        }
    }

    if let Some(ref profile) = config.security.seccomp_profile {
        if !profile.exists() {
            result.add_warning(format!("seccomp_profile does not exist: {:?}", profile));
        }
    }

    for tmpfs in &config.security.tmpfs {
        if !tmpfs.path.is_absolute() {
            result.add_error(format!(
                "security.tmpfs path must be absolute: {:?}",
                tmpfs.path
            ));
        }
        if tmpfs.size_mb == 0 {
            result.add_error(format!(
                "security.tmpfs size for {:?} cannot be zero",
                tmpfs.path
            ));
        }
    }

    if !config.runtime.volume_mount.is_absolute() {
        result.add_error(format!(
            "runtime.volume_mount must be absolute path: {:?}",
            config.runtime.volume_mount
        ));
    }
}

fn validate_runtime(config: &Config, result: &mut ValidationResult) {
    if config.runtime.binary.trim().is_empty() {
        result.add_error("runtime.binary cannot be empty".to_string());
    }
    if config.runtime.volume_prefix.trim().is_empty() {
        result.add_error("runtime.volume_prefix cannot be empty".to_string());
    }
    if config.runtime.managed_label.trim().is_empty() {
        result.add_error("runtime.managed_label cannot be empty".to_string());
    }
    if config.firewall.parent_chain.trim().is_empty() {
        result.add_error("firewall.parent_chain cannot be empty".to_string());
    }
}

fn validate_tiers(config: &Config, result: &mut ValidationResult) {
    let tiers = [
        ("free", &config.tiers.free),
        ("basic", &config.tiers.basic),
        ("pro", &config.tiers.pro),
    ];

    for (tier, hosts) in tiers {
        for host in hosts {
            if let Err(e) = crate::network::tier::HostEndpoint::parse(host) {
                result.add_error(format!("tiers.{}: invalid host '{}': {}", tier, host, e));
            }
        }
    }

    if config.tiers.free.is_empty() {
        result.add_warning(
            "tiers.free is empty: filtered free-tier sessions only get DNS egress".to_string(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_default_config() {
        let config = Config::default();
        let result = validate_config(&config);

        assert!(result.is_ok());
    }

    #[test]
    fn test_zero_max_sessions() {
        let mut config = Config::default();
        config.limits.max_sessions = 0;

        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("max_sessions cannot be zero"));
    }

    #[test]
    fn test_warn_threshold_must_be_below_kill() {
        let mut config = Config::default();
        config.limits.memory_warn_pct = 96.0;
        config.limits.memory_kill_pct = 95.0;

        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("memory_warn_pct"));
    }

    #[test]
    fn test_relative_state_dir_rejected() {
        let mut config = Config::default();
        config.state_dir = "relative/state".into();

        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_tier_host_rejected() {
        let mut config = Config::default();
        config.tiers.basic.push("example.com:notaport".to_string());

        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("tiers.basic"));
    }

    #[test]
    fn test_zero_idle_timeout_is_a_warning() {
        let mut config = Config::default();
        config.limits.idle_timeout_minutes = 0;

        let result = validate_config(&config).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
    }
}
