//! Wires policy, network, registry, launcher, verifier and monitor together for the
//! command surface.

use crate::config::policy::PolicyBuilder;
use crate::config::settings::Config;
use crate::config::types::{RawRequest, Result, SandboxError, Session, SessionStatus};
use crate::lifecycle::{CycleReport, GcPlan, LifecycleMonitor, ReapDecision};
use crate::network::resolver::{HostResolver, NetworkTierResolver};
use crate::observability::audit::{new_run_id, EventKind, EventSink, LifecycleEvent};
use crate::observability::metrics::MetricsRegistry;
use crate::runtime::backend::ContainerRuntime;
use crate::runtime::firewall::Firewall;
use crate::runtime::launcher::{LaunchOutcome, RuntimeLauncher};
use crate::session::{generate_name, SessionRegistry, SessionView};
use crate::verify::{SandboxVerifier, VerificationReport};
use std::sync::Arc;

/// Attempts at drawing an unused generated name
const NAME_ATTEMPTS: usize = 8;

/// Result of a successful `start`
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub session: Session,
    pub launch: LaunchOutcome,
    /// Non-fatal problems to show the operator (partial allow-list, degraded posture)
    pub warnings: Vec<String>,
}

/// What `destroy` removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestroyReport {
    pub instance: bool,
    pub volume: Option<String>,
    pub record: bool,
}

pub struct SessionOrchestrator {
    config: Arc<Config>,
    runtime: Arc<dyn ContainerRuntime>,
    firewall: Arc<dyn Firewall>,
    registry: Arc<SessionRegistry>,
    policy: PolicyBuilder,
    tiers: NetworkTierResolver,
    launcher: RuntimeLauncher,
    verifier: SandboxVerifier,
    monitor: LifecycleMonitor,
    events: Arc<dyn EventSink>,
    metrics: Arc<MetricsRegistry>,
}

impl SessionOrchestrator {
    pub fn new(
        config: Arc<Config>,
        runtime: Arc<dyn ContainerRuntime>,
        firewall: Arc<dyn Firewall>,
        resolver: Arc<dyn HostResolver>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let registry = Arc::new(SessionRegistry::new(&config, Arc::clone(&runtime)));
        let launcher = RuntimeLauncher::new(
            Arc::clone(&config),
            Arc::clone(&runtime),
            Arc::clone(&firewall),
            Arc::clone(&registry),
        );
        let verifier = SandboxVerifier::new(Arc::clone(&runtime), Arc::clone(&registry));
        let monitor = LifecycleMonitor::new(
            Arc::clone(&config),
            Arc::clone(&runtime),
            Arc::clone(&registry),
            Arc::clone(&events),
            Arc::clone(&metrics),
        );

        Self {
            policy: PolicyBuilder::new(Arc::clone(&config)),
            tiers: NetworkTierResolver::new(&config, resolver),
            config,
            runtime,
            firewall,
            registry,
            launcher,
            verifier,
            monitor,
            events,
            metrics,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn monitor(&self) -> &LifecycleMonitor {
        &self.monitor
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    fn emit(&self, event: LifecycleEvent) {
        self.metrics.record_event(event.kind);
        self.events.emit(event);
    }

    fn pick_name(&self, requested: Option<&str>) -> Result<String> {
        if let Some(name) = requested {
            return Ok(name.to_string());
        }
        for _ in 0..NAME_ATTEMPTS {
            let name = generate_name();
            if self.registry.get(&name)?.is_none() && self.runtime.inspect(&name)?.is_none() {
                return Ok(name);
            }
        }
        Err(SandboxError::Registry(format!(
            "could not find a free session name after {} attempts",
            NAME_ATTEMPTS
        )))
    }

    /// Validate, admit, compile, record and launch a new session.
    pub fn start(&self, raw: &RawRequest, name: Option<&str>) -> Result<StartOutcome> {
        let run_id = new_run_id();
        let request = self.policy.validate(raw)?;

        self.monitor
            .enforce_admission(self.config.limits.max_sessions)?;

        let name = self.pick_name(name)?;
        let scope = self.tiers.scope_for(&request);
        let policy = self.policy.compile(&request, scope);
        let session = self.registry.create(&name, &request, &policy)?;

        let mut warnings: Vec<String> = policy
            .network()
            .rule_set()
            .map(|rules| rules.warnings().iter().map(|w| w.to_string()).collect())
            .unwrap_or_default();

        let launch = match self.launcher.run(&session) {
            Ok(launch) => launch,
            Err(e) => {
                self.emit(
                    LifecycleEvent::new(EventKind::LaunchFailed)
                        .with_session(&name)
                        .with_detail(e.to_string())
                        .with_run_id(&run_id),
                );
                return Err(e);
            }
        };

        self.emit(
            LifecycleEvent::new(EventKind::SessionLaunched)
                .with_session(&name)
                .with_detail(format!(
                    "mode={} network={} tier={} policy={}",
                    request.mode,
                    request.network,
                    request.tier,
                    policy.fingerprint()
                ))
                .with_run_id(&run_id),
        );

        if let Some(warning) = launch.verification.as_ref().and_then(|r| r.warning()) {
            self.emit(
                LifecycleEvent::new(EventKind::VerificationWarning)
                    .with_session(&name)
                    .with_detail(warning.failed_checks.join("; "))
                    .with_run_id(&run_id),
            );
            warnings.push(warning.to_string());
        }

        Ok(StartOutcome {
            session,
            launch,
            warnings,
        })
    }

    /// Stop a session, keeping it resumable. Stopping an already stopped session succeeds.
    pub fn stop(&self, name: &str) -> Result<()> {
        let record = self.registry.get(name)?;
        let instance = self.runtime.inspect(name)?;
        if record.is_none() && instance.is_none() {
            return Err(SandboxError::NotFound(name.to_string()));
        }

        self.runtime.stop(name)?;
        self.registry.set_status(name, SessionStatus::Stopped)?;
        if record.map(|r| r.request.ephemeral).unwrap_or(false) {
            self.registry.remove(name)?;
        }

        self.emit(LifecycleEvent::new(EventKind::SessionStopped).with_session(name));
        Ok(())
    }

    /// Reconciled view of every session
    pub fn list(&self) -> Result<Vec<SessionView>> {
        self.registry.list()
    }

    /// A named session, or the most recent running one
    pub fn status(&self, name: Option<&str>) -> Result<SessionView> {
        match name {
            Some(name) => self
                .registry
                .list()?
                .into_iter()
                .find(|view| view.name == name)
                .ok_or_else(|| SandboxError::NotFound(name.to_string())),
            None => self
                .registry
                .most_recent()?
                .ok_or_else(|| SandboxError::NotFound("no running session".to_string())),
        }
    }

    /// Remove the instance, its volume (if any) and its record.
    pub fn destroy(&self, name: &str) -> Result<DestroyReport> {
        let record = self.registry.get(name)?;
        let instance = self.runtime.inspect(name)?;
        if record.is_none() && instance.is_none() {
            return Err(SandboxError::NotFound(name.to_string()));
        }

        let mut report = DestroyReport::default();

        if let Some(info) = &instance {
            self.runtime.remove(name)?;
            report.instance = true;
            if let Some(address) = info.address {
                if let Err(e) = self.firewall.release(address) {
                    log::warn!("Could not release firewall chain for {}: {}", address, e);
                }
            }
        }

        let volume = self.config.volume_name(name);
        let persistent = record.as_ref().map(|r| r.request.persist).unwrap_or(false)
            || instance
                .as_ref()
                .map(|i| i.volumes.contains(&volume))
                .unwrap_or(false);
        if persistent {
            self.runtime.remove_volume(&volume)?;
            report.volume = Some(volume);
        }

        report.record = self.registry.remove(name)?;

        self.emit(
            LifecycleEvent::new(EventKind::SessionDestroyed)
                .with_session(name)
                .with_detail(format!(
                    "instance={} volume={}",
                    report.instance,
                    report.volume.as_deref().unwrap_or("-")
                )),
        );
        Ok(report)
    }

    /// One memory and idle reaping pass with configured thresholds
    pub fn reap(&self) -> Result<Vec<ReapDecision>> {
        let limits = &self.config.limits;
        let mut decisions = self
            .monitor
            .reap_memory(limits.memory_warn_pct, limits.memory_kill_pct)?;
        decisions.extend(self.monitor.reap_idle(self.config.idle_timeout())?);
        Ok(decisions)
    }

    pub fn gc(&self) -> Result<GcPlan> {
        self.monitor.gc()
    }

    pub fn verify(&self, name: &str) -> Result<VerificationReport> {
        let report = self.verifier.verify(name)?;
        if let Some(warning) = report.warning() {
            self.emit(
                LifecycleEvent::new(EventKind::VerificationWarning)
                    .with_session(name)
                    .with_detail(warning.failed_checks.join("; ")),
            );
        }
        Ok(report)
    }

    pub fn monitor_once(&self) -> Result<CycleReport> {
        self.monitor.run_cycle()
    }

    pub fn monitor_forever(&self) -> ! {
        self.monitor.run_forever(self.config.monitor_interval())
    }
}
