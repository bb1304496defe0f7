//! Launches a registered session as a runtime instance.
//!
//! Flow: create → start → (filtered) push firewall rules for the assigned address →
//! verify → (cli) attach. Anything failing before the instance is up removes the
//! just-created registry record so the name can be retried.

use crate::config::policy::{NetworkScope, TMPFS_OPTIONS};
use crate::config::settings::Config;
use crate::config::types::{Mode, NetworkMode, Result, SandboxError, Session, SessionStatus};
use crate::runtime::backend::{
    ContainerRuntime, LaunchNetwork, LaunchSpec, RestartPolicy, Ulimit, VolumeMount, LABEL_MODE,
    LABEL_POLICY, LABEL_SESSION,
};
use crate::runtime::firewall::Firewall;
use crate::session::SessionRegistry;
use crate::verify::{SandboxVerifier, VerificationReport};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Build the single launch spec for a session from its policy and request.
pub fn launch_spec(config: &Config, session: &Session) -> LaunchSpec {
    let request = &session.request;
    let policy = &session.policy;
    let ceilings = policy.ceilings();

    let mut labels = BTreeMap::new();
    labels.insert(config.runtime.managed_label.clone(), "true".to_string());
    labels.insert(LABEL_SESSION.to_string(), session.name.clone());
    labels.insert(LABEL_MODE.to_string(), request.mode.as_str().to_string());
    labels.insert(LABEL_POLICY.to_string(), policy.fingerprint().to_string());

    let image = request.image.clone().unwrap_or_else(|| match request.mode {
        Mode::Cli => config.runtime.cli_image.clone(),
        Mode::Desktop => config.runtime.desktop_image.clone(),
    });

    let restart = match (request.mode, request.ephemeral) {
        (Mode::Desktop, false) => RestartPolicy::OnFailure,
        _ => RestartPolicy::No,
    };

    let network = match request.network {
        NetworkMode::None => LaunchNetwork::None,
        NetworkMode::Host => LaunchNetwork::Host,
        NetworkMode::Filtered => LaunchNetwork::Bridge(config.runtime.filtered_network.clone()),
    };

    let mut security_opt = Vec::new();
    if policy.security().no_new_privileges {
        security_opt.push("no-new-privileges".to_string());
    }
    if let crate::config::policy::SeccompProfile::Custom(path) = &policy.security().seccomp {
        security_opt.push(format!("seccomp={}", path.display()));
    }
    if let Some(profile) = &policy.security().apparmor {
        security_opt.push(format!("apparmor={}", profile));
    }

    let volume = request.persist.then(|| VolumeMount {
        name: config.volume_name(&session.name),
        target: config.runtime.volume_mount.clone(),
    });

    LaunchSpec {
        name: session.name.clone(),
        image,
        labels,
        interactive: request.mode == Mode::Cli,
        auto_remove: request.ephemeral,
        restart,
        network,
        read_only_rootfs: policy.filesystem().read_only_root,
        tmpfs: policy
            .filesystem()
            .tmpfs
            .iter()
            .map(|t| (t.path.clone(), t.size_bytes, TMPFS_OPTIONS.to_string()))
            .collect(),
        cap_drop_all: true,
        cap_add: policy.capabilities().to_vec(),
        security_opt,
        cpus: ceilings.cpus,
        memory_bytes: ceilings.memory_bytes,
        pids_limit: ceilings.pids,
        ulimits: vec![
            Ulimit {
                name: "nofile",
                soft: ceilings.nofile_soft,
                hard: ceilings.nofile_hard,
            },
            Ulimit {
                name: "nproc",
                soft: ceilings.nproc_soft,
                hard: ceilings.nproc_hard,
            },
        ],
        gpus: policy.gpu(),
        mounts: request.mounts.clone(),
        volume,
        ports: request.ports.clone(),
        env: request.env.clone(),
    }
}

/// What a launch produced
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub name: String,
    pub runtime_ref: String,
    pub address: Option<IpAddr>,
    /// Firewall rules pushed for the instance
    pub rules_applied: usize,
    pub verification: Option<VerificationReport>,
    /// Exit code of an attached CLI session
    pub exit_code: Option<i32>,
}

pub struct RuntimeLauncher {
    config: Arc<Config>,
    runtime: Arc<dyn ContainerRuntime>,
    firewall: Arc<dyn Firewall>,
    registry: Arc<SessionRegistry>,
    verifier: SandboxVerifier,
}

impl RuntimeLauncher {
    pub fn new(
        config: Arc<Config>,
        runtime: Arc<dyn ContainerRuntime>,
        firewall: Arc<dyn Firewall>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        let verifier = SandboxVerifier::new(Arc::clone(&runtime), Arc::clone(&registry));
        Self {
            config,
            runtime,
            firewall,
            registry,
            verifier,
        }
    }

    /// Drop the record of a launch that never came up
    fn abandon(&self, name: &str, cause: &SandboxError) {
        log::error!("Launch of {} failed: {}", name, cause);
        if let Err(e) = self.registry.remove(name) {
            log::warn!("Could not remove record of failed launch {}: {}", name, e);
        }
    }

    /// Tear down a started instance whose setup failed, then abandon it
    fn tear_down(&self, name: &str, cause: &SandboxError) {
        if let Err(e) = self.runtime.remove(name) {
            log::warn!("Could not remove instance {} after failed setup: {}", name, e);
        }
        self.abandon(name, cause);
    }

    /// Push the session's egress rules against its assigned address.
    fn apply_network(&self, session: &Session) -> Result<(Option<IpAddr>, usize)> {
        let network = session.policy.network();
        if network.mode != NetworkMode::Filtered {
            return Ok((None, 0));
        }

        let address = self
            .runtime
            .inspect(&session.name)?
            .and_then(|info| info.address);

        match (&network.scope, address) {
            (NetworkScope::AllowList(rules), Some(address)) => {
                for warning in rules.warnings() {
                    log::warn!("{}: {}", session.name, warning);
                }
                self.firewall.reset(address)?;
                let bound = rules.bind(address);
                for rule in &bound {
                    self.firewall.apply_rule(rule)?;
                }
                log::info!(
                    "Applied {} firewall rule(s) for {} at {} (tier {})",
                    bound.len(),
                    session.name,
                    address,
                    network.tier
                );
                Ok((Some(address), bound.len()))
            }
            (NetworkScope::AllowList(_), None) => Err(SandboxError::Firewall(format!(
                "instance {} has no bridge address to filter",
                session.name
            ))),
            (_, Some(address)) => {
                // A recycled address may still carry an old session's chain
                if let Err(e) = self.firewall.release(address) {
                    log::warn!("Could not clear stale rules for {}: {}", address, e);
                }
                Ok((Some(address), 0))
            }
            (_, None) => Ok((None, 0)),
        }
    }

    /// Launch a session previously recorded with `SessionRegistry::create`.
    pub fn run(&self, session: &Session) -> Result<LaunchOutcome> {
        let name = session.name.as_str();
        let spec = launch_spec(&self.config, session);

        let runtime_ref = match self.runtime.create(&spec) {
            Ok(id) => id,
            Err(e) => {
                self.abandon(name, &e);
                return Err(e);
            }
        };
        if let Err(e) = self.registry.set_runtime_ref(name, &runtime_ref) {
            self.tear_down(name, &e);
            return Err(e);
        }

        if let Err(e) = self
            .runtime
            .start(name)
            .and_then(|_| self.registry.set_status(name, SessionStatus::Running))
        {
            self.tear_down(name, &e);
            return Err(e);
        }
        log::info!(
            "Started {} session {} ({}, network={})",
            session.mode(),
            name,
            self.runtime.name(),
            session.request.network
        );

        let (address, rules_applied) = match self.apply_network(session) {
            Ok(applied) => applied,
            Err(e) => {
                // Never leave a filtered session running without its rules
                self.tear_down(name, &e);
                return Err(e);
            }
        };

        let verification = match self.verifier.verify(name) {
            Ok(report) => Some(report),
            Err(e) => {
                log::warn!("Verification of {} could not run: {}", name, e);
                None
            }
        };

        let mut outcome = LaunchOutcome {
            name: name.to_string(),
            runtime_ref,
            address,
            rules_applied,
            verification,
            exit_code: None,
        };

        if session.mode() == Mode::Cli {
            outcome.exit_code = Some(self.attach(session)?);
        }

        Ok(outcome)
    }

    /// Attach an interactive CLI session and record how it ended.
    fn attach(&self, session: &Session) -> Result<i32> {
        let name = session.name.as_str();
        let code = self.runtime.attach(name)?;

        let still_live = self
            .runtime
            .inspect(name)?
            .map(|info| info.state.is_live())
            .unwrap_or(false);
        if still_live {
            log::info!("Detached from {}; it keeps running", name);
            return Ok(code);
        }

        self.registry.set_status(name, SessionStatus::Exited)?;
        if session.request.ephemeral {
            self.registry.remove(name)?;
        }
        log::info!("Session {} exited with code {}", name, code);
        Ok(code)
    }
}
