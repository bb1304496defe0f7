//! In-process doubles for the runtime, firewall, resolver and event seams.
//!
//! The fake runtime keeps instances and volumes in memory and follows the same
//! idempotency contract as the Docker adapter: stopping or removing something that is
//! already gone succeeds.

use crate::config::settings::Config;
use crate::config::types::{Result, SandboxError};
use crate::network::resolver::HostResolver;
use crate::network::rules::NetworkRule;
use crate::observability::audit::{EventKind, EventSink, LifecycleEvent};
use crate::runtime::backend::{
    ContainerRuntime, InstanceInfo, InstanceState, InstanceStats, LaunchNetwork, LaunchSpec,
    LABEL_SESSION,
};
use crate::runtime::firewall::Firewall;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Config rooted in a fresh scratch directory, with the audit file disabled
pub fn scratch_config() -> Config {
    let mut config = Config::default();
    config.state_dir = scratch_dir("state");
    config.audit_log = None;
    config
}

/// Unique directory under the system temp dir (not created)
pub fn scratch_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("sessionbox-test-{}-{}", tag, uuid::Uuid::new_v4()))
}

/// Managed running instance started `uptime` ago
pub fn running_instance(config: &Config, name: &str, uptime: Duration) -> InstanceInfo {
    let mut info = managed_instance(config, name, InstanceState::Running);
    let elapsed = chrono::Duration::from_std(uptime).unwrap_or_else(|_| chrono::Duration::zero());
    info.started_at = Some(Utc::now() - elapsed);
    info
}

/// Managed instance in `state`, never started
pub fn managed_instance(config: &Config, name: &str, state: InstanceState) -> InstanceInfo {
    let mut info = InstanceInfo::new(name, state);
    info.id = format!("fake-{}", name);
    info.labels
        .insert(config.runtime.managed_label.clone(), "true".to_string());
    info.labels
        .insert(LABEL_SESSION.to_string(), name.to_string());
    info
}

#[derive(Default)]
struct RuntimeState {
    instances: BTreeMap<String, InstanceInfo>,
    specs: BTreeMap<String, LaunchSpec>,
    volumes: BTreeSet<String>,
    stats: BTreeMap<String, InstanceStats>,
    stats_delay: BTreeMap<String, Duration>,
    failing: BTreeSet<String>,
    calls: Vec<String>,
    next_host: u8,
}

/// In-memory container runtime
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
    unavailable: AtomicBool,
    /// Leave CLI instances running after attach returns, as a detach would
    detach_on_attach: AtomicBool,
    attach_exit_code: Mutex<i32>,
    /// Runs after every successful create, outside the state lock
    create_hook: Mutex<Option<CreateHook>>,
}

type CreateHook = Box<dyn Fn(&str) + Send + Sync>;

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RuntimeState {
                next_host: 2,
                ..Default::default()
            }),
            unavailable: AtomicBool::new(false),
            detach_on_attach: AtomicBool::new(false),
            attach_exit_code: Mutex::new(0),
            create_hook: Mutex::new(None),
        }
    }

    pub fn with_instance(self, info: InstanceInfo) -> Self {
        self.insert_instance(info);
        self
    }

    pub fn with_volume(self, volume: &str) -> Self {
        self.add_volume(volume);
        self
    }

    pub fn with_stats(self, name: &str, cpu_pct: f64, mem_pct: f64) -> Self {
        self.set_stats(name, cpu_pct, mem_pct);
        self
    }

    pub fn insert_instance(&self, info: InstanceInfo) {
        let mut state = lock(&self.state);
        state.volumes.extend(info.volumes.iter().cloned());
        state.instances.insert(info.name.clone(), info);
    }

    pub fn add_volume(&self, volume: &str) {
        lock(&self.state).volumes.insert(volume.to_string());
    }

    pub fn set_stats(&self, name: &str, cpu_pct: f64, mem_pct: f64) {
        lock(&self.state)
            .stats
            .insert(name.to_string(), InstanceStats { cpu_pct, mem_pct });
    }

    /// Make `stats(name)` block for `delay` before answering
    pub fn delay_stats(&self, name: &str, delay: Duration) {
        lock(&self.state)
            .stats_delay
            .insert(name.to_string(), delay);
    }

    /// Fail every call of `operation` (e.g. "create", "stats:calm-otter-0001")
    pub fn fail_on(&self, operation: &str) {
        lock(&self.state).failing.insert(operation.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_detach_on_attach(&self, detach: bool) {
        self.detach_on_attach.store(detach, Ordering::SeqCst);
    }

    pub fn set_attach_exit_code(&self, code: i32) {
        *lock(&self.attach_exit_code) = code;
    }

    /// Call `hook` with the instance name after each successful create
    pub fn on_create(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *lock(&self.create_hook) = Some(Box::new(hook));
    }

    pub fn instance(&self, name: &str) -> Option<InstanceInfo> {
        lock(&self.state).instances.get(name).cloned()
    }

    pub fn spec(&self, name: &str) -> Option<LaunchSpec> {
        lock(&self.state).specs.get(name).cloned()
    }

    pub fn volumes(&self) -> Vec<String> {
        lock(&self.state).volumes.iter().cloned().collect()
    }

    /// Every call so far as `operation:name`
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn called(&self, call: &str) -> bool {
        lock(&self.state).calls.iter().any(|c| c == call)
    }

    fn enter(&self, operation: &str, name: &str) -> Result<MutexGuard<'_, RuntimeState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SandboxError::RuntimeUnavailable(
                "fake runtime is down".to_string(),
            ));
        }
        let mut state = lock(&self.state);
        state.calls.push(format!("{}:{}", operation, name));
        let scoped = format!("{}:{}", operation, name);
        if state.failing.contains(operation) || state.failing.contains(&scoped) {
            return Err(SandboxError::runtime(operation, format!("injected failure for {}", name)));
        }
        Ok(state)
    }
}

impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn create(&self, spec: &LaunchSpec) -> Result<String> {
        let mut state = self.enter("create", &spec.name)?;
        if state.instances.contains_key(&spec.name) {
            return Err(SandboxError::LaunchConflict {
                name: spec.name.clone(),
                detail: "an instance with this name already exists".to_string(),
            });
        }

        let mut info = InstanceInfo::new(&spec.name, InstanceState::Created);
        info.id = format!("fake-{}", spec.name);
        info.labels = spec.labels.clone();
        info.read_only_rootfs = spec.read_only_rootfs;
        if spec.cap_drop_all {
            info.cap_drop = vec!["ALL".to_string()];
        }
        info.cap_add = spec.cap_add.iter().map(|c| c.as_str().to_string()).collect();
        info.security_opt = spec.security_opt.clone();
        info.memory_limit = spec.memory_bytes;
        if let Some(volume) = &spec.volume {
            info.volumes.push(volume.name.clone());
            state.volumes.insert(volume.name.clone());
        }

        let id = info.id.clone();
        state.instances.insert(spec.name.clone(), info);
        state.specs.insert(spec.name.clone(), spec.clone());
        drop(state);

        if let Some(hook) = lock(&self.create_hook).as_ref() {
            hook(&spec.name);
        }
        Ok(id)
    }

    fn start(&self, name: &str) -> Result<()> {
        let mut state = self.enter("start", name)?;
        let bridged = matches!(
            state.specs.get(name).map(|s| &s.network),
            Some(LaunchNetwork::Bridge(_))
        );
        let address = if bridged {
            let host = state.next_host;
            state.next_host = state.next_host.wrapping_add(1);
            Some(IpAddr::V4(Ipv4Addr::new(172, 17, 0, host)))
        } else {
            None
        };

        let info = state
            .instances
            .get_mut(name)
            .ok_or_else(|| SandboxError::runtime("start", format!("no such instance: {}", name)))?;
        info.state = InstanceState::Running;
        info.started_at = Some(Utc::now());
        if address.is_some() {
            info.address = address;
        }
        Ok(())
    }

    fn attach(&self, name: &str) -> Result<i32> {
        let mut state = self.enter("attach", name)?;
        if !self.detach_on_attach.load(Ordering::SeqCst) {
            let auto_remove = state.specs.get(name).map(|s| s.auto_remove).unwrap_or(false);
            if auto_remove {
                state.instances.remove(name);
            } else if let Some(info) = state.instances.get_mut(name) {
                info.state = InstanceState::Exited;
            }
        }
        Ok(*lock(&self.attach_exit_code))
    }

    fn stop(&self, name: &str) -> Result<()> {
        let mut state = self.enter("stop", name)?;
        let auto_remove = state.specs.get(name).map(|s| s.auto_remove).unwrap_or(false);
        if auto_remove {
            state.instances.remove(name);
        } else if let Some(info) = state.instances.get_mut(name) {
            info.state = InstanceState::Exited;
        }
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        let mut state = self.enter("remove", name)?;
        state.instances.remove(name);
        state.specs.remove(name);
        Ok(())
    }

    fn remove_volume(&self, volume: &str) -> Result<()> {
        let mut state = self.enter("remove_volume", volume)?;
        state.volumes.remove(volume);
        Ok(())
    }

    fn inspect(&self, name: &str) -> Result<Option<InstanceInfo>> {
        let state = self.enter("inspect", name)?;
        Ok(state.instances.get(name).cloned())
    }

    fn stats(&self, name: &str) -> Result<InstanceStats> {
        let delay = {
            let state = self.enter("stats", name)?;
            if !state.instances.contains_key(name) {
                return Err(SandboxError::runtime("stats", format!("no such instance: {}", name)));
            }
            state.stats_delay.get(name).copied()
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        Ok(lock(&self.state).stats.get(name).copied().unwrap_or_default())
    }

    fn list_instances(&self) -> Result<Vec<InstanceInfo>> {
        let state = self.enter("list_instances", "*")?;
        Ok(state.instances.values().cloned().collect())
    }

    fn list_volumes(&self) -> Result<Vec<String>> {
        let state = self.enter("list_volumes", "*")?;
        Ok(state.volumes.iter().cloned().collect())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FirewallCall {
    Reset(IpAddr),
    Apply(NetworkRule),
    Release(IpAddr),
}

/// Records every firewall call
#[derive(Default)]
pub struct FakeFirewall {
    calls: Mutex<Vec<FirewallCall>>,
    fail_apply: AtomicBool,
}

impl FakeFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<FirewallCall> {
        lock(&self.calls).clone()
    }

    /// Rules currently in force for `source`, in application order
    pub fn rules_for(&self, source: IpAddr) -> Vec<NetworkRule> {
        let mut rules = Vec::new();
        for call in lock(&self.calls).iter() {
            match call {
                FirewallCall::Reset(addr) | FirewallCall::Release(addr) if *addr == source => {
                    rules.clear()
                }
                FirewallCall::Apply(rule) if rule.source == source => rules.push(*rule),
                _ => {}
            }
        }
        rules
    }
}

impl Firewall for FakeFirewall {
    fn reset(&self, source: IpAddr) -> Result<()> {
        lock(&self.calls).push(FirewallCall::Reset(source));
        Ok(())
    }

    fn apply_rule(&self, rule: &NetworkRule) -> Result<()> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(SandboxError::Firewall(format!("injected failure for {}", rule)));
        }
        lock(&self.calls).push(FirewallCall::Apply(*rule));
        Ok(())
    }

    fn release(&self, source: IpAddr) -> Result<()> {
        lock(&self.calls).push(FirewallCall::Release(source));
        Ok(())
    }
}

/// Fixed host table; unknown hosts fail to resolve
#[derive(Default)]
pub struct StaticResolver {
    hosts: BTreeMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unparseable addresses are ignored
    pub fn with_host(mut self, host: &str, addrs: &[&str]) -> Self {
        self.hosts.insert(
            host.to_string(),
            addrs.iter().filter_map(|a| a.parse().ok()).collect(),
        );
        self
    }
}

impl HostResolver for StaticResolver {
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        match self.hosts.get(host) {
            Some(addrs) if !addrs.is_empty() => Ok(addrs.clone()),
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("failed to lookup address information: {}", host),
            )),
        }
    }
}

/// Keeps every emitted event in memory
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        lock(&self.events).clone()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<LifecycleEvent> {
        lock(&self.events)
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        lock(&self.events).iter().filter(|e| e.kind == kind).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: LifecycleEvent) {
        lock(&self.events).push(event);
    }
}
