//! Pure reaping and garbage-collection decisions.
//!
//! Nothing here touches the runtime or the registry; the monitor samples, calls these,
//! and executes whatever they return.

use crate::config::settings::Config;
use crate::config::types::{Session, SessionStatus};
use crate::runtime::backend::{InstanceInfo, InstanceState};
use crate::session::store::SessionMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Age below which a `created` record with a never-started instance is a launch in flight
pub const LAUNCH_GRACE: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReapAction {
    None,
    IdleStop,
    /// Log only, never acts
    MemoryWarn,
    MemoryKill,
    GcRemove,
}

impl fmt::Display for ReapAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReapAction::None => "none",
            ReapAction::IdleStop => "idle-stop",
            ReapAction::MemoryWarn => "memory-warn",
            ReapAction::MemoryKill => "memory-kill",
            ReapAction::GcRemove => "gc-remove",
        })
    }
}

/// A decision plus the sample that triggered it
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ReapDecision {
    pub session: String,
    pub action: ReapAction,
    pub metric: Option<f64>,
    pub threshold: Option<f64>,
    pub uptime: Option<Duration>,
}

impl ReapDecision {
    pub fn none(session: &str) -> Self {
        Self {
            session: session.to_string(),
            action: ReapAction::None,
            metric: None,
            threshold: None,
            uptime: None,
        }
    }

    pub fn is_none(&self) -> bool {
        self.action == ReapAction::None
    }
}

/// Whether a session is old enough to be considered for idle reaping
pub fn idle_eligible(uptime: Option<Duration>, timeout: Duration) -> bool {
    matches!(uptime, Some(uptime) if uptime >= timeout)
}

/// Stop when the session has outlived its timeout and its single CPU sample is below
/// `idle_cpu_pct`.
pub fn decide_idle(
    session: &str,
    uptime: Option<Duration>,
    cpu_pct: f64,
    timeout: Duration,
    idle_cpu_pct: f64,
) -> ReapDecision {
    if !idle_eligible(uptime, timeout) || cpu_pct >= idle_cpu_pct {
        return ReapDecision {
            uptime,
            ..ReapDecision::none(session)
        };
    }
    ReapDecision {
        session: session.to_string(),
        action: ReapAction::IdleStop,
        metric: Some(cpu_pct),
        threshold: Some(idle_cpu_pct),
        uptime,
    }
}

/// `kill_pct` and above stops; `warn_pct` and above only warns.
pub fn decide_memory(session: &str, mem_pct: f64, warn_pct: f64, kill_pct: f64) -> ReapDecision {
    let (action, threshold) = if mem_pct >= kill_pct {
        (ReapAction::MemoryKill, kill_pct)
    } else if mem_pct >= warn_pct {
        (ReapAction::MemoryWarn, warn_pct)
    } else {
        return ReapDecision::none(session);
    };
    ReapDecision {
        session: session.to_string(),
        action,
        metric: Some(mem_pct),
        threshold: Some(threshold),
        uptime: None,
    }
}

/// Effective idle timeout: per-session override or the default
pub fn effective_timeout(record: Option<&Session>, default: Duration) -> Duration {
    record
        .and_then(|s| s.request.idle_timeout_minutes)
        .map(|minutes| Duration::from_secs(minutes.saturating_mul(60)))
        .unwrap_or(default)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcClass {
    Keep,
    Remove,
}

fn launch_in_flight(record: Option<&Session>, now: DateTime<Utc>) -> bool {
    match record {
        Some(session) if session.status == SessionStatus::Created => (now - session.created_at)
            .to_std()
            .map(|age| age < LAUNCH_GRACE)
            .unwrap_or(true),
        _ => false,
    }
}

/// Terminal instances (exited, dead, created-never-started) are removed unless the
/// registry records them as stopped, which makes them resumable.
pub fn classify_for_gc(info: &InstanceInfo, record: Option<&Session>, now: DateTime<Utc>) -> GcClass {
    match info.state {
        InstanceState::Exited | InstanceState::Dead => match record.map(|s| s.status) {
            Some(SessionStatus::Stopped) => GcClass::Keep,
            _ => GcClass::Remove,
        },
        InstanceState::Created if info.started_at.is_none() => {
            if launch_in_flight(record, now) {
                GcClass::Keep
            } else {
                GcClass::Remove
            }
        }
        _ => GcClass::Keep,
    }
}

/// Everything one GC pass will delete
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct GcPlan {
    pub instances: Vec<String>,
    pub volumes: Vec<String>,
    pub records: Vec<String>,
}

impl GcPlan {
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty() && self.volumes.is_empty() && self.records.is_empty()
    }
}

/// Plan a GC pass. A volume survives whenever a kept (live or resumable) instance, or a
/// launch in flight, references it by name.
pub fn plan_gc(
    config: &Config,
    instances: &[InstanceInfo],
    records: &SessionMap,
    volumes: &[String],
    now: DateTime<Utc>,
) -> GcPlan {
    let mut plan = GcPlan::default();
    let mut protected: BTreeSet<String> = BTreeSet::new();
    let mut with_instance: BTreeSet<&str> = BTreeSet::new();

    for info in instances {
        let session = info.session_name();
        with_instance.insert(session);
        let record = records.get(session);

        match classify_for_gc(info, record, now) {
            GcClass::Keep => {
                protected.extend(info.volumes.iter().cloned());
                protected.insert(config.volume_name(session));
            }
            GcClass::Remove => {
                plan.instances.push(info.name.clone());
                if record.is_some() {
                    plan.records.push(session.to_string());
                }
            }
        }
    }

    // Records whose instance is gone, other than launches still in flight
    for (name, record) in records {
        if with_instance.contains(name.as_str()) {
            continue;
        }
        if launch_in_flight(Some(record), now) {
            protected.insert(config.volume_name(name));
        } else {
            plan.records.push(name.clone());
        }
    }

    for volume in volumes {
        if config.session_for_volume(volume).is_some() && !protected.contains(volume) {
            plan.volumes.push(volume.clone());
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_idle_stop_after_timeout() {
        let decision = decide_idle("a", Some(Duration::from_secs(65 * 60)), 0.4, HOUR, 1.0);
        assert_eq!(decision.action, ReapAction::IdleStop);
        assert_eq!(decision.metric, Some(0.4));
        assert_eq!(decision.threshold, Some(1.0));
        assert_eq!(decision.uptime, Some(Duration::from_secs(65 * 60)));
    }

    #[test]
    fn test_idle_never_reaps_young_sessions() {
        for timeout_min in [0u64, 1, 30, 60, 600] {
            let timeout = Duration::from_secs(timeout_min * 60);
            for uptime_min in [0u64, 1, 29, 59, 60, 61, 1000] {
                let uptime = Duration::from_secs(uptime_min * 60);
                let decision = decide_idle("a", Some(uptime), 0.0, timeout, 1.0);
                if uptime < timeout {
                    assert!(decision.is_none(), "reaped at {}m with {}m timeout", uptime_min, timeout_min);
                }
            }
        }
    }

    #[test]
    fn test_idle_busy_or_unknown_uptime_is_kept() {
        assert!(decide_idle("a", Some(2 * HOUR), 1.0, HOUR, 1.0).is_none());
        assert!(decide_idle("a", Some(2 * HOUR), 35.0, HOUR, 1.0).is_none());
        assert!(decide_idle("a", None, 0.0, HOUR, 1.0).is_none());
    }

    #[test]
    fn test_memory_thresholds() {
        assert_eq!(decide_memory("a", 96.0, 85.0, 95.0).action, ReapAction::MemoryKill);
        assert_eq!(decide_memory("a", 95.0, 85.0, 95.0).action, ReapAction::MemoryKill);
        assert_eq!(decide_memory("a", 90.0, 85.0, 95.0).action, ReapAction::MemoryWarn);
        assert_eq!(decide_memory("a", 84.9, 85.0, 95.0).action, ReapAction::None);

        let kill = decide_memory("a", 96.0, 85.0, 95.0);
        assert_eq!(kill.metric, Some(96.0));
        assert_eq!(kill.threshold, Some(95.0));
    }

    #[test]
    fn test_classify_for_gc() {
        let now = Utc::now();
        let exited = InstanceInfo::new("a", InstanceState::Exited);
        let dead = InstanceInfo::new("a", InstanceState::Dead);
        let running = InstanceInfo::new("a", InstanceState::Running);
        let fresh = InstanceInfo::new("a", InstanceState::Created);

        assert_eq!(classify_for_gc(&exited, None, now), GcClass::Remove);
        assert_eq!(classify_for_gc(&dead, None, now), GcClass::Remove);
        assert_eq!(classify_for_gc(&running, None, now), GcClass::Keep);
        assert_eq!(classify_for_gc(&fresh, None, now), GcClass::Remove);
    }

    fn session_with_override(minutes: Option<u64>) -> Session {
        use crate::config::policy::{NetworkScope, PolicyBuilder};
        use crate::config::types::RawRequest;
        use std::sync::Arc;

        let builder = PolicyBuilder::new(Arc::new(Config::default()));
        let mut request = builder
            .validate(&RawRequest {
                mode: "cli".to_string(),
                network: "none".to_string(),
                cpus: "1".to_string(),
                memory: "1g".to_string(),
                ..Default::default()
            })
            .unwrap();
        request.idle_timeout_minutes = minutes;
        let policy = builder.compile(&request, NetworkScope::Isolated);
        let now = Utc::now();
        Session {
            name: "calm-otter-0001".to_string(),
            request,
            policy,
            status: SessionStatus::Running,
            created_at: now,
            updated_at: now,
            runtime_ref: None,
        }
    }

    #[test]
    fn test_effective_timeout_override_and_saturation() {
        assert_eq!(effective_timeout(None, HOUR), HOUR);
        assert_eq!(
            effective_timeout(Some(&session_with_override(None)), HOUR),
            HOUR
        );
        assert_eq!(
            effective_timeout(Some(&session_with_override(Some(90))), HOUR),
            Duration::from_secs(90 * 60)
        );

        // A stored override too large to convert never wraps to a short timeout
        let huge = session_with_override(Some(307_445_734_561_825_862));
        let timeout = effective_timeout(Some(&huge), HOUR);
        assert_eq!(timeout, Duration::from_secs(u64::MAX));
        let decision = decide_idle("calm-otter-0001", Some(Duration::from_secs(65 * 60)), 0.1, timeout, 1.0);
        assert!(decision.is_none());
    }
}
