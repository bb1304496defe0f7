//! Integration tests for the lifecycle monitor
//!
//! Admission, idle and memory reaping, and garbage collection against the in-memory
//! runtime.

use sessionbox::config::policy::{NetworkScope, PolicyBuilder, MAX_IDLE_TIMEOUT_MINUTES};
use sessionbox::config::types::{RawRequest, SandboxError, SessionStatus};
use sessionbox::lifecycle::{LifecycleMonitor, ReapAction};
use sessionbox::observability::{EventKind, MetricsRegistry};
use sessionbox::runtime::{ContainerRuntime, InstanceState};
use sessionbox::session::SessionRegistry;
use sessionbox::testing::{
    managed_instance, running_instance, scratch_config, FakeRuntime, MemorySink,
};
use sessionbox::Config;
use std::sync::Arc;
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);

struct Harness {
    config: Config,
    runtime: Arc<FakeRuntime>,
    registry: Arc<SessionRegistry>,
    sink: Arc<MemorySink>,
    metrics: Arc<MetricsRegistry>,
    monitor: LifecycleMonitor,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(scratch_config())
    }

    fn with_config(config: Config) -> Self {
        let runtime = Arc::new(FakeRuntime::new());
        let registry = Arc::new(SessionRegistry::new(&config, runtime.clone()));
        let sink = Arc::new(MemorySink::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let monitor = LifecycleMonitor::new(
            Arc::new(config.clone()),
            runtime.clone(),
            registry.clone(),
            sink.clone(),
            metrics.clone(),
        );
        Self {
            config,
            runtime,
            registry,
            sink,
            metrics,
            monitor,
        }
    }

    /// Record a session as running, optionally with an idle-timeout override
    fn record(&self, name: &str, status: SessionStatus, idle_timeout: Option<&str>) {
        let builder = PolicyBuilder::new(Arc::new(self.config.clone()));
        let request = builder
            .validate(&RawRequest {
                mode: "desktop".to_string(),
                network: "none".to_string(),
                cpus: "1".to_string(),
                memory: "1g".to_string(),
                persist: true,
                idle_timeout_minutes: idle_timeout.map(str::to_string),
                ..Default::default()
            })
            .unwrap();
        let policy = builder.compile(&request, NetworkScope::Isolated);
        self.registry.create(name, &request, &policy).unwrap();
        if status != SessionStatus::Created {
            self.registry.set_status(name, SessionStatus::Running).unwrap();
            self.registry.set_status(name, status).unwrap();
        }
    }

    /// Running session with a record and a CPU/memory sample
    fn running(&self, name: &str, uptime: Duration, cpu: f64, mem: f64) {
        self.record(name, SessionStatus::Running, None);
        self.runtime.insert_instance(running_instance(&self.config, name, uptime));
        self.runtime.set_stats(name, cpu, mem);
    }

    fn status(&self, name: &str) -> Option<SessionStatus> {
        self.registry.get(name).unwrap().map(|s| s.status)
    }

    fn state(&self, name: &str) -> Option<InstanceState> {
        self.runtime.instance(name).map(|i| i.state)
    }
}

#[test]
fn test_idle_session_is_stopped_after_timeout() {
    let h = Harness::new();
    h.running("sleepy", 65 * MINUTE, 0.4, 10.0);

    let stopped = h.monitor.reap_idle(60 * MINUTE).unwrap();

    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].session, "sleepy");
    assert_eq!(stopped[0].action, ReapAction::IdleStop);
    assert_eq!(stopped[0].metric, Some(0.4));
    assert_eq!(h.state("sleepy"), Some(InstanceState::Exited));
    assert_eq!(h.status("sleepy"), Some(SessionStatus::Stopped));

    let events = h.sink.of_kind(EventKind::IdleStop);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].metric, Some(0.4));
    assert_eq!(events[0].threshold, Some(1.0));
    assert!(events[0].uptime_secs.unwrap() >= 65 * 60);
    assert_eq!(h.metrics.idle_stops.get(), 1);
}

#[test]
fn test_young_or_busy_sessions_are_never_reaped() {
    let h = Harness::new();
    h.running("young", 30 * MINUTE, 0.0, 10.0);
    h.running("busy", 3 * 60 * MINUTE, 45.0, 10.0);

    for timeout_min in [31u64, 60, 240] {
        let stopped = h.monitor.reap_idle(Duration::from_secs(timeout_min * 60)).unwrap();
        assert!(stopped.iter().all(|d| d.session != "young" && d.session != "busy"));
    }
    assert_eq!(h.state("young"), Some(InstanceState::Running));
    assert_eq!(h.state("busy"), Some(InstanceState::Running));
    // Below-timeout sessions are not even sampled
    assert!(!h.runtime.called("stats:young"));
}

#[test]
fn test_per_session_timeout_override_wins() {
    let h = Harness::new();
    h.record("short-fuse", SessionStatus::Running, Some("10"));
    h.runtime
        .insert_instance(running_instance(&h.config, "short-fuse", 15 * MINUTE));
    h.runtime.set_stats("short-fuse", 0.1, 5.0);

    let stopped = h.monitor.reap_idle(60 * MINUTE).unwrap();
    assert_eq!(stopped.len(), 1);
    assert_eq!(h.status("short-fuse"), Some(SessionStatus::Stopped));
}

#[test]
fn test_longest_timeout_override_is_respected() {
    let h = Harness::new();
    let longest = MAX_IDLE_TIMEOUT_MINUTES.to_string();
    h.record("night-owl", SessionStatus::Running, Some(&longest));
    h.runtime
        .insert_instance(running_instance(&h.config, "night-owl", 65 * MINUTE));
    h.runtime.set_stats("night-owl", 0.1, 5.0);

    let stopped = h.monitor.reap_idle(60 * MINUTE).unwrap();
    assert!(stopped.is_empty());
    assert_eq!(h.state("night-owl"), Some(InstanceState::Running));
    assert!(!h.runtime.called("stats:night-owl"));
}

#[test]
fn test_memory_kill_and_warn() {
    let h = Harness::new();
    h.running("hog", 5 * MINUTE, 80.0, 96.0);
    h.running("heavy", 5 * MINUTE, 80.0, 90.0);
    h.running("light", 5 * MINUTE, 80.0, 20.0);

    let decisions = h.monitor.reap_memory(85.0, 95.0).unwrap();

    let action = |name: &str| {
        decisions
            .iter()
            .find(|d| d.session == name)
            .map(|d| d.action)
    };
    assert_eq!(action("hog"), Some(ReapAction::MemoryKill));
    assert_eq!(action("heavy"), Some(ReapAction::MemoryWarn));
    assert_eq!(action("light"), None);

    assert_eq!(h.state("hog"), Some(InstanceState::Exited));
    assert_eq!(h.status("hog"), Some(SessionStatus::Stopped));
    // Warn only logs
    assert_eq!(h.state("heavy"), Some(InstanceState::Running));
    assert_eq!(h.status("heavy"), Some(SessionStatus::Running));

    let kills = h.sink.of_kind(EventKind::MemoryKill);
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].metric, Some(96.0));
    assert_eq!(kills[0].threshold, Some(95.0));
    assert_eq!(h.sink.count(EventKind::MemoryWarn), 1);
}

#[test]
fn test_admission_refused_when_full_of_busy_sessions() {
    let h = Harness::new();
    h.running("one", 2 * 60 * MINUTE, 50.0, 10.0);
    h.running("two", 2 * 60 * MINUTE, 50.0, 10.0);

    match h.monitor.enforce_admission(2) {
        Err(SandboxError::Capacity { running, max }) => {
            assert_eq!(running, 2);
            assert_eq!(max, 2);
        }
        other => panic!("expected capacity error, got {:?}", other),
    }
    // Never evicts a busy session
    assert_eq!(h.state("one"), Some(InstanceState::Running));
    assert_eq!(h.state("two"), Some(InstanceState::Running));
    assert_eq!(h.sink.count(EventKind::AdmissionRefused), 1);
    assert_eq!(h.metrics.admissions_refused.get(), 1);
}

#[test]
fn test_admission_reaps_idle_session_to_make_room() {
    let h = Harness::new();
    h.running("idle", 2 * 60 * MINUTE, 0.2, 10.0);
    h.running("busy", 2 * 60 * MINUTE, 50.0, 10.0);

    h.monitor.enforce_admission(2).unwrap();

    assert_eq!(h.state("idle"), Some(InstanceState::Exited));
    assert_eq!(h.state("busy"), Some(InstanceState::Running));
    assert!(h.monitor.running_count().unwrap() < 2);
    assert_eq!(h.sink.count(EventKind::IdleStop), 1);
    assert_eq!(h.sink.count(EventKind::AdmissionGranted), 1);
}

#[test]
fn test_admission_below_capacity_does_not_reap() {
    let h = Harness::new();
    h.running("idle", 2 * 60 * MINUTE, 0.2, 10.0);

    h.monitor.enforce_admission(5).unwrap();
    assert_eq!(h.state("idle"), Some(InstanceState::Running));
    assert_eq!(h.sink.count(EventKind::IdleStop), 0);
}

#[test]
fn test_gc_removes_only_the_exited_instance_volume() {
    let h = Harness::new();
    let volume_a = h.config.volume_name("crashed");
    let volume_b = h.config.volume_name("alive");
    let volume_c = h.config.volume_name("paused-work");

    h.record("crashed", SessionStatus::Running, None);
    let mut crashed = managed_instance(&h.config, "crashed", InstanceState::Exited);
    crashed.volumes.push(volume_a.clone());
    h.runtime.insert_instance(crashed);

    h.record("alive", SessionStatus::Running, None);
    let mut alive = running_instance(&h.config, "alive", 5 * MINUTE);
    alive.volumes.push(volume_b.clone());
    h.runtime.insert_instance(alive);

    // Stopped by the operator: resumable
    h.record("paused-work", SessionStatus::Stopped, None);
    let mut resumable = managed_instance(&h.config, "paused-work", InstanceState::Exited);
    resumable.volumes.push(volume_c.clone());
    h.runtime.insert_instance(resumable);

    let removed = h.monitor.gc().unwrap();

    assert_eq!(removed.instances, vec!["crashed".to_string()]);
    assert_eq!(removed.volumes, vec![volume_a.clone()]);
    assert_eq!(removed.records, vec!["crashed".to_string()]);

    let volumes = h.runtime.volumes();
    assert!(!volumes.contains(&volume_a));
    assert!(volumes.contains(&volume_b));
    assert!(volumes.contains(&volume_c));
    assert!(h.runtime.instance("paused-work").is_some());
    assert_eq!(h.status("paused-work"), Some(SessionStatus::Stopped));
    assert!(h.registry.get("crashed").unwrap().is_none());

    assert_eq!(h.sink.count(EventKind::GcRemove), 1);
    assert_eq!(h.sink.count(EventKind::GcVolumeRemove), 1);
}

#[test]
fn test_gc_spares_launches_in_flight() {
    let h = Harness::new();
    h.record("launching", SessionStatus::Created, None);
    h.runtime
        .insert_instance(managed_instance(&h.config, "launching", InstanceState::Created));
    // Never started and nobody tracks it
    h.runtime
        .insert_instance(managed_instance(&h.config, "abandoned", InstanceState::Created));

    let removed = h.monitor.gc().unwrap();
    assert_eq!(removed.instances, vec!["abandoned".to_string()]);
    assert!(h.runtime.instance("launching").is_some());
    assert!(h.registry.get("launching").unwrap().is_some());
}

#[test]
fn test_gc_drops_records_and_volumes_of_vanished_instances() {
    let h = Harness::new();
    h.record("vanished", SessionStatus::Running, None);
    // Instance removed out of band, volume left behind
    let volume = h.config.volume_name("vanished");
    h.runtime.add_volume(&volume);
    h.runtime.add_volume("someone-elses-volume");

    let removed = h.monitor.gc().unwrap();
    assert!(removed.instances.is_empty());
    assert_eq!(removed.records, vec!["vanished".to_string()]);
    assert_eq!(removed.volumes, vec![volume]);
    assert_eq!(h.runtime.volumes(), vec!["someone-elses-volume".to_string()]);
}

#[test]
fn test_slow_inspection_is_skipped_not_fatal() {
    let mut config = scratch_config();
    config.limits.inspect_timeout_secs = 1;
    let h = Harness::with_config(config);
    h.running("stuck", 2 * 60 * MINUTE, 0.1, 10.0);
    h.running("idle", 2 * 60 * MINUTE, 0.1, 10.0);
    h.runtime.delay_stats("stuck", Duration::from_secs(3));

    let started = std::time::Instant::now();
    let stopped = h.monitor.reap_idle(60 * MINUTE).unwrap();

    assert!(started.elapsed() < Duration::from_millis(2500));
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].session, "idle");
    assert_eq!(h.state("stuck"), Some(InstanceState::Running));
    assert_eq!(h.sink.count(EventKind::InspectTimeout), 1);
    assert_eq!(h.metrics.inspect_timeouts.get(), 1);
}

#[test]
fn test_failed_inspection_is_skipped_not_fatal() {
    let h = Harness::new();
    h.running("broken", 2 * 60 * MINUTE, 0.1, 10.0);
    h.running("idle", 2 * 60 * MINUTE, 0.1, 10.0);
    h.runtime.fail_on("stats:broken");

    let stopped = h.monitor.reap_idle(60 * MINUTE).unwrap();
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].session, "idle");
    assert_eq!(h.sink.count(EventKind::InspectFailed), 1);
}

#[test]
fn test_failed_stop_is_skipped() {
    let h = Harness::new();
    h.running("stubborn", 2 * 60 * MINUTE, 0.1, 10.0);
    h.running("idle", 2 * 60 * MINUTE, 0.1, 10.0);
    h.runtime.fail_on("stop:stubborn");

    let stopped = h.monitor.reap_idle(60 * MINUTE).unwrap();
    assert_eq!(stopped.len(), 1);
    assert_eq!(h.status("stubborn"), Some(SessionStatus::Running));
}

#[test]
fn test_run_cycle_records_sweep_metrics() {
    let h = Harness::new();
    h.running("hog", 2 * 60 * MINUTE, 50.0, 99.0);
    h.running("idle", 2 * 60 * MINUTE, 0.1, 10.0);
    h.running("busy", 2 * 60 * MINUTE, 50.0, 10.0);

    let report = h.monitor.run_cycle().unwrap();

    assert_eq!(report.live, 1);
    assert!(report
        .decisions
        .iter()
        .any(|d| d.session == "hog" && d.action == ReapAction::MemoryKill));
    assert!(report
        .decisions
        .iter()
        .any(|d| d.session == "idle" && d.action == ReapAction::IdleStop));
    // Stopped sessions are resumable, so GC keeps them
    assert!(report.gc.instances.is_empty());

    assert_eq!(h.metrics.sweeps_total.get(), 1);
    assert_eq!(h.metrics.sessions_live.get(), 1);
    assert_eq!(h.metrics.sweep_latency.get_count(), 1);
    let text = h.metrics.export_prometheus();
    assert!(text.contains("sessionbox_reaps_total{decision=\"memory-kill\"} 1"));
}

#[test]
fn test_cycle_events_share_the_report_run_id() {
    let h = Harness::new();
    h.running("hog", 2 * 60 * MINUTE, 50.0, 99.0);
    h.running("idle", 2 * 60 * MINUTE, 0.1, 10.0);
    h.runtime
        .insert_instance(managed_instance(&h.config, "crashed", InstanceState::Exited));

    let report = h.monitor.run_cycle().unwrap();

    assert_eq!(report.gc.instances, vec!["crashed".to_string()]);
    let events = h.sink.events();
    for kind in [EventKind::MemoryKill, EventKind::IdleStop, EventKind::GcRemove] {
        assert!(events.iter().any(|e| e.kind == kind), "missing {:?}", kind);
    }
    assert!(events
        .iter()
        .all(|e| e.run_id.as_deref() == Some(report.run_id.as_str())));

    let next = h.monitor.run_cycle().unwrap();
    assert_ne!(next.run_id, report.run_id);
}

#[test]
fn test_runtime_outage_fails_the_pass() {
    let h = Harness::new();
    h.runtime.set_unavailable(true);
    assert!(matches!(
        h.monitor.reap_idle(MINUTE),
        Err(SandboxError::RuntimeUnavailable(_))
    ));
    assert!(matches!(
        h.runtime.list_instances(),
        Err(SandboxError::RuntimeUnavailable(_))
    ));
}
