//! Admission control, idle/memory reaping and garbage collection.
//!
//! Each pass re-reads the runtime, samples sessions in parallel with a bounded wait,
//! runs the pure decisions from [`crate::lifecycle::decision`] and executes the result.
//! A failure on one session is logged and skipped.

use crate::config::settings::Config;
use crate::config::types::{Result, SandboxError, SessionStatus};
use crate::lifecycle::decision::{
    decide_idle, decide_memory, effective_timeout, idle_eligible, plan_gc, GcPlan, ReapAction,
    ReapDecision,
};
use crate::lifecycle::sweep::{sample_all, SampleOutcome};
use crate::observability::audit::{new_run_id, EventKind, EventSink, LifecycleEvent};
use crate::observability::metrics::MetricsRegistry;
use crate::runtime::backend::{ContainerRuntime, InstanceInfo, InstanceStats};
use crate::session::SessionRegistry;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of one monitor cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub run_id: String,
    pub live: usize,
    pub decisions: Vec<ReapDecision>,
    pub gc: GcPlan,
}

pub struct LifecycleMonitor {
    config: Arc<Config>,
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<SessionRegistry>,
    events: Arc<dyn EventSink>,
    metrics: Arc<MetricsRegistry>,
}

impl LifecycleMonitor {
    pub fn new(
        config: Arc<Config>,
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<SessionRegistry>,
        events: Arc<dyn EventSink>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config,
            runtime,
            registry,
            events,
            metrics,
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        self.metrics.record_event(event.kind);
        self.events.emit(event);
    }

    fn live_instances(&self) -> Result<Vec<InstanceInfo>> {
        Ok(self
            .runtime
            .list_instances()?
            .into_iter()
            .filter(|info| info.state.is_live())
            .collect())
    }

    pub fn running_count(&self) -> Result<usize> {
        Ok(self.live_instances()?.len())
    }

    /// Sample stats for `instances`, dropping sessions whose sample failed or timed out.
    fn sample_stats(&self, instances: &[InstanceInfo], run_id: &str) -> Vec<(String, InstanceStats)> {
        let names: Vec<String> = instances.iter().map(|i| i.name.clone()).collect();
        let runtime = Arc::clone(&self.runtime);
        let results = sample_all(&names, self.config.inspect_timeout(), move |name| {
            runtime.stats(name)
        });

        let mut samples = Vec::with_capacity(results.len());
        for (name, outcome) in results {
            match outcome {
                SampleOutcome::Done(stats) => samples.push((name, stats)),
                SampleOutcome::Failed(e) => {
                    self.emit(
                        LifecycleEvent::new(EventKind::InspectFailed)
                            .with_session(&name)
                            .with_detail(e.to_string())
                            .with_run_id(run_id),
                    );
                }
                SampleOutcome::TimedOut => {
                    self.emit(
                        LifecycleEvent::new(EventKind::InspectTimeout)
                            .with_session(&name)
                            .with_detail(format!(
                                "no sample within {:?}",
                                self.config.inspect_timeout()
                            ))
                            .with_run_id(run_id),
                    );
                }
            }
        }
        samples
    }

    /// Stop an instance and record it as stopped (resumable).
    fn stop_session(&self, info: &InstanceInfo) -> Result<()> {
        self.runtime.stop(&info.name)?;
        self.registry
            .set_status(info.session_name(), SessionStatus::Stopped)
    }

    /// Admit one more session, reaping idle sessions first when at capacity. Never evicts
    /// a busy session.
    pub fn enforce_admission(&self, max: usize) -> Result<()> {
        let run_id = new_run_id();
        let mut running = self.running_count()?;

        if running >= max {
            log::info!(
                "At capacity ({}/{}), reaping idle sessions before admission",
                running,
                max
            );
            self.reap_idle_in_run(self.config.idle_timeout(), &run_id)?;
            running = self.running_count()?;
        }

        if running >= max {
            self.emit(
                LifecycleEvent::new(EventKind::AdmissionRefused)
                    .with_metric(running as f64, max as f64)
                    .with_run_id(&run_id),
            );
            return Err(SandboxError::Capacity { running, max });
        }

        self.emit(
            LifecycleEvent::new(EventKind::AdmissionGranted)
                .with_metric(running as f64, max as f64)
                .with_run_id(&run_id),
        );
        Ok(())
    }

    /// Stop live sessions that outlived their idle timeout and sampled below the idle
    /// CPU threshold. Returns the stops performed.
    pub fn reap_idle(&self, default_timeout: Duration) -> Result<Vec<ReapDecision>> {
        self.reap_idle_in_run(default_timeout, &new_run_id())
    }

    fn reap_idle_in_run(&self, default_timeout: Duration, run_id: &str) -> Result<Vec<ReapDecision>> {
        let records = self.registry.records()?;
        let now = Utc::now();
        let threshold = self.config.limits.idle_cpu_pct;

        let candidates: Vec<InstanceInfo> = self
            .live_instances()?
            .into_iter()
            .filter(|info| {
                let timeout = effective_timeout(records.get(info.session_name()), default_timeout);
                idle_eligible(info.uptime(now), timeout)
            })
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let samples = self.sample_stats(&candidates, run_id);
        let mut stopped = Vec::new();

        for (name, stats) in samples {
            let Some(info) = candidates.iter().find(|i| i.name == name) else {
                continue;
            };
            let session = info.session_name();
            let timeout = effective_timeout(records.get(session), default_timeout);
            let decision = decide_idle(session, info.uptime(now), stats.cpu_pct, timeout, threshold);
            if decision.action != ReapAction::IdleStop {
                continue;
            }

            if let Err(e) = self.stop_session(info) {
                log::warn!("Idle stop of {} failed, skipping: {}", name, e);
                continue;
            }

            let mut event = LifecycleEvent::new(EventKind::IdleStop)
                .with_session(session)
                .with_metric(stats.cpu_pct, threshold)
                .with_run_id(run_id);
            if let Some(uptime) = decision.uptime {
                event = event.with_uptime(uptime);
            }
            self.emit(event);
            stopped.push(decision);
        }

        Ok(stopped)
    }

    /// Stop sessions at or above `kill_pct` memory; warn (only) at or above `warn_pct`.
    /// Returns every non-trivial decision.
    pub fn reap_memory(&self, warn_pct: f64, kill_pct: f64) -> Result<Vec<ReapDecision>> {
        self.reap_memory_in_run(warn_pct, kill_pct, &new_run_id())
    }

    fn reap_memory_in_run(&self, warn_pct: f64, kill_pct: f64, run_id: &str) -> Result<Vec<ReapDecision>> {
        let live = self.live_instances()?;
        if live.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut decisions = Vec::new();

        for (name, stats) in self.sample_stats(&live, run_id) {
            let Some(info) = live.iter().find(|i| i.name == name) else {
                continue;
            };
            let session = info.session_name();
            let mut decision = decide_memory(session, stats.mem_pct, warn_pct, kill_pct);
            decision.uptime = info.uptime(now);

            let kind = match decision.action {
                ReapAction::MemoryKill => {
                    if let Err(e) = self.stop_session(info) {
                        log::warn!("Memory stop of {} failed, skipping: {}", name, e);
                        continue;
                    }
                    EventKind::MemoryKill
                }
                ReapAction::MemoryWarn => EventKind::MemoryWarn,
                _ => continue,
            };

            self.emit(
                LifecycleEvent::new(kind)
                    .with_session(session)
                    .with_metric(stats.mem_pct, decision.threshold.unwrap_or(kill_pct))
                    .with_run_id(run_id),
            );
            decisions.push(decision);
        }

        Ok(decisions)
    }

    /// Remove terminal instances, their unreferenced volumes and stale records.
    pub fn gc(&self) -> Result<GcPlan> {
        self.gc_in_run(&new_run_id())
    }

    fn gc_in_run(&self, run_id: &str) -> Result<GcPlan> {
        let instances = self.runtime.list_instances()?;
        let volumes = self.runtime.list_volumes()?;
        let records = self.registry.records()?;

        let plan = plan_gc(&self.config, &instances, &records, &volumes, Utc::now());
        let mut done = GcPlan::default();

        for name in &plan.instances {
            match self.runtime.remove(name) {
                Ok(()) => {
                    self.emit(
                        LifecycleEvent::new(EventKind::GcRemove)
                            .with_session(name)
                            .with_run_id(run_id),
                    );
                    done.instances.push(name.clone());
                }
                Err(e) => log::warn!("GC could not remove instance {}: {}", name, e),
            }
        }

        for volume in &plan.volumes {
            match self.runtime.remove_volume(volume) {
                Ok(()) => {
                    self.emit(
                        LifecycleEvent::new(EventKind::GcVolumeRemove)
                            .with_session(self.config.session_for_volume(volume).unwrap_or(volume))
                            .with_detail(format!("volume {}", volume))
                            .with_run_id(run_id),
                    );
                    done.volumes.push(volume.clone());
                }
                Err(e) => log::warn!("GC could not remove volume {}: {}", volume, e),
            }
        }

        for name in &plan.records {
            match self.registry.remove(name) {
                Ok(_) => done.records.push(name.clone()),
                Err(e) => log::warn!("GC could not remove record {}: {}", name, e),
            }
        }

        if !done.is_empty() {
            log::info!(
                "GC removed {} instance(s), {} volume(s), {} record(s)",
                done.instances.len(),
                done.volumes.len(),
                done.records.len()
            );
        }
        Ok(done)
    }

    /// Memory reaping, idle reaping and GC, once.
    pub fn run_cycle(&self) -> Result<CycleReport> {
        let started = Instant::now();
        let run_id = new_run_id();
        let limits = &self.config.limits;

        let mut decisions =
            self.reap_memory_in_run(limits.memory_warn_pct, limits.memory_kill_pct, &run_id)?;
        decisions.extend(self.reap_idle_in_run(self.config.idle_timeout(), &run_id)?);
        let gc = self.gc_in_run(&run_id)?;
        decisions.extend(gc.instances.iter().map(|name| ReapDecision {
            action: ReapAction::GcRemove,
            ..ReapDecision::none(name)
        }));

        let live = self.running_count()?;
        self.metrics.record_sweep(started.elapsed(), live);

        Ok(CycleReport {
            run_id,
            live,
            decisions,
            gc,
        })
    }

    /// Repeat cycles every `interval` until the process exits. A failed cycle is logged
    /// and retried on the next tick.
    pub fn run_forever(&self, interval: Duration) -> ! {
        log::info!("Lifecycle monitor running every {:?}", interval);
        loop {
            match self.run_cycle() {
                Ok(report) => log::debug!(
                    "Cycle done: {} live, {} decision(s)",
                    report.live,
                    report.decisions.len()
                ),
                Err(e) => log::error!("Monitor cycle failed: {}", e),
            }
            std::thread::sleep(interval);
        }
    }
}
