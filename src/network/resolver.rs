//! Tier → firewall rule resolution.

use crate::config::policy::model::NetworkScope;
use crate::config::settings::Config;
use crate::config::types::{NetworkMode, PartialPolicyWarning, Protocol, SandboxRequest};
use crate::network::rules::{Destination, ResolvedRuleSet, RuleTemplate};
use crate::network::tier::{Tier, TierCatalog, TierScope};
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;

/// Forward DNS lookup seam
pub trait HostResolver: Send + Sync {
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Uses the host's configured resolver
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let mut addrs: Vec<IpAddr> = Vec::new();
        for addr in (host, 0u16).to_socket_addrs()? {
            if !addrs.contains(&addr.ip()) {
                addrs.push(addr.ip());
            }
        }
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {}", host),
            ));
        }
        Ok(addrs)
    }
}

pub struct NetworkTierResolver {
    catalog: TierCatalog,
    resolver: Arc<dyn HostResolver>,
}

impl NetworkTierResolver {
    pub fn new(config: &Config, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            catalog: TierCatalog::from_settings(&config.tiers),
            resolver,
        }
    }

    /// Resolve a tier into its egress scope. Privileged tiers yield the unrestricted
    /// sentinel; a host that fails to resolve is skipped with a warning.
    pub fn resolve(&self, tier: Tier) -> NetworkScope {
        let hosts = match self.catalog.scope(tier) {
            TierScope::Unrestricted => {
                log::info!("Tier {} is unrestricted, no egress filtering", tier);
                return NetworkScope::Unrestricted;
            }
            TierScope::Restricted(hosts) => hosts,
        };

        let mut allows = Vec::new();
        let mut warnings = Vec::new();

        for endpoint in &hosts {
            match self.resolver.lookup(&endpoint.host) {
                Ok(addrs) => {
                    log::debug!("Resolved {} to {:?}", endpoint, addrs);
                    allows.extend(addrs.into_iter().map(|addr| {
                        RuleTemplate::allow(Destination::Address(addr), Protocol::Tcp, endpoint.port)
                    }));
                }
                Err(e) => {
                    let warning = PartialPolicyWarning {
                        host: endpoint.host.clone(),
                        reason: e.to_string(),
                    };
                    log::warn!("{}", warning);
                    warnings.push(warning);
                }
            }
        }

        let rules = ResolvedRuleSet::assemble(allows, warnings);
        log::info!(
            "Resolved tier {}: {} rule(s) from {} host(s){}",
            tier,
            rules.rules().len(),
            hosts.len(),
            if rules.is_partial() { " (partial)" } else { "" }
        );
        NetworkScope::AllowList(rules)
    }

    /// Scope for a validated request: only filtered sessions consult the tier.
    pub fn scope_for(&self, request: &SandboxRequest) -> NetworkScope {
        match request.network {
            NetworkMode::None => NetworkScope::Isolated,
            NetworkMode::Host => NetworkScope::Host,
            NetworkMode::Filtered => self.resolve(request.tier),
        }
    }
}
