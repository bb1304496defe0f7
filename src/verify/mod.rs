//! Isolation posture verification.
//!
//! Read-only diagnostic: compares what the runtime actually applied to an instance with
//! what the session policy asked for. Never mutates anything; a failed check is a warning.

use crate::config::policy::{Capability, SandboxPolicy};
use crate::config::types::{Result, SandboxError, VerificationWarning};
use crate::runtime::backend::{ContainerRuntime, InstanceInfo};
use crate::session::SessionRegistry;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    ReadOnlyRootfs,
    CapabilityDrop,
    NoNewPrivileges,
    MemoryCeiling,
}

impl CheckKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckKind::ReadOnlyRootfs => "read_only_rootfs",
            CheckKind::CapabilityDrop => "capability_drop",
            CheckKind::NoNewPrivileges => "no_new_privileges",
            CheckKind::MemoryCeiling => "memory_ceiling",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckOutcome {
    Pass,
    Warn,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct CheckResult {
    pub check: CheckKind,
    pub outcome: CheckOutcome,
    pub detail: String,
}

impl CheckResult {
    fn new(check: CheckKind, passed: bool, detail: String) -> Self {
        Self {
            check,
            outcome: if passed {
                CheckOutcome::Pass
            } else {
                CheckOutcome::Warn
            },
            detail,
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == CheckOutcome::Pass
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct VerificationReport {
    pub session: String,
    pub checks: Vec<CheckResult>,
}

impl VerificationReport {
    /// Overall posture passes iff every check passes
    pub fn passed(&self) -> bool {
        self.checks.iter().all(CheckResult::passed)
    }

    pub fn warning(&self) -> Option<VerificationWarning> {
        if self.passed() {
            return None;
        }
        Some(VerificationWarning {
            session: self.session.clone(),
            failed_checks: self
                .checks
                .iter()
                .filter(|c| !c.passed())
                .map(|c| format!("{} ({})", c.check, c.detail))
                .collect(),
        })
    }
}

/// Pure core of [`SandboxVerifier::verify`]: checks in fixed order.
pub fn verify_instance(session: &str, info: &InstanceInfo, policy: &SandboxPolicy) -> VerificationReport {
    let mut checks = Vec::with_capacity(4);

    let want_ro = policy.filesystem().read_only_root;
    checks.push(CheckResult::new(
        CheckKind::ReadOnlyRootfs,
        info.read_only_rootfs == want_ro,
        format!("expected read_only={}, found {}", want_ro, info.read_only_rootfs),
    ));

    let drops_all = info.cap_drop.iter().any(|c| c.eq_ignore_ascii_case("ALL"));
    let outside_baseline: Vec<&str> = info
        .cap_add
        .iter()
        .filter(|c| match Capability::parse(c) {
            Some(cap) => !policy.capabilities().contains(&cap),
            None => true,
        })
        .map(String::as_str)
        .collect();
    let cap_detail = if !drops_all {
        "capabilities are not dropped (no ALL in drop list)".to_string()
    } else if !outside_baseline.is_empty() {
        format!("added outside baseline: {}", outside_baseline.join(","))
    } else {
        format!("drop=ALL add={}", info.cap_add.join(","))
    };
    checks.push(CheckResult::new(
        CheckKind::CapabilityDrop,
        drops_all && outside_baseline.is_empty(),
        cap_detail,
    ));

    let nnp = info.has_no_new_privileges();
    checks.push(CheckResult::new(
        CheckKind::NoNewPrivileges,
        nnp || !policy.security().no_new_privileges,
        if nnp {
            "no-new-privileges set".to_string()
        } else {
            "no-new-privileges missing from security options".to_string()
        },
    ));

    checks.push(CheckResult::new(
        CheckKind::MemoryCeiling,
        info.memory_limit > 0,
        format!(
            "limit={} bytes (policy {})",
            info.memory_limit,
            policy.ceilings().memory_bytes
        ),
    ));

    VerificationReport {
        session: session.to_string(),
        checks,
    }
}

pub struct SandboxVerifier {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<SessionRegistry>,
}

impl SandboxVerifier {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, registry: Arc<SessionRegistry>) -> Self {
        Self { runtime, registry }
    }

    /// Inspect the session's instance and compare against its recorded policy.
    pub fn verify(&self, name: &str) -> Result<VerificationReport> {
        let session = self
            .registry
            .get(name)?
            .ok_or_else(|| SandboxError::NotFound(name.to_string()))?;
        let info = self
            .runtime
            .inspect(name)?
            .ok_or_else(|| SandboxError::NotFound(format!("{} (no instance)", name)))?;

        let report = verify_instance(name, &info, &session.policy);
        match report.warning() {
            Some(warning) => log::warn!("{}", warning),
            None => log::info!("Session {} isolation posture verified", name),
        }
        Ok(report)
    }
}
