//! Named network-access tiers.
//!
//! Restricted tiers are cumulative: `free ⊂ basic ⊂ pro`. The privileged tiers
//! (`dev`, `founder`, `admin`) bypass filtering and are only ever selected explicitly.

use crate::config::settings::TierSettings;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Port assumed for host entries without an explicit port
pub const DEFAULT_HOST_PORT: u16 = 443;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Basic,
    Pro,
    Dev,
    Founder,
    Admin,
}

impl Tier {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Tier::Free),
            "basic" => Some(Tier::Basic),
            "pro" => Some(Tier::Pro),
            "dev" => Some(Tier::Dev),
            "founder" => Some(Tier::Founder),
            "admin" => Some(Tier::Admin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Pro => "pro",
            Tier::Dev => "dev",
            Tier::Founder => "founder",
            Tier::Admin => "admin",
        }
    }

    /// Privileged tiers skip filtering entirely.
    pub fn is_unrestricted(self) -> bool {
        matches!(self, Tier::Dev | Tier::Founder | Tier::Admin)
    }

    pub fn all() -> [Tier; 6] {
        [
            Tier::Free,
            Tier::Basic,
            Tier::Pro,
            Tier::Dev,
            Tier::Founder,
            Tier::Admin,
        ]
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `host[:port]` entry of a tier
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct HostEndpoint {
    pub host: String,
    pub port: u16,
}

impl HostEndpoint {
    pub fn parse(entry: &str) -> std::result::Result<Self, String> {
        let entry = entry.trim();
        let (host, port) = match entry.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| format!("'{}' is not a port in 1-65535", port))?;
                (host, port)
            }
            None => (entry, DEFAULT_HOST_PORT),
        };

        if host.is_empty() {
            return Err("host cannot be empty".to_string());
        }
        if !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        {
            return Err(format!("'{}' is not a valid hostname", host));
        }

        Ok(Self {
            host: host.to_ascii_lowercase(),
            port,
        })
    }
}

impl fmt::Display for HostEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Host set a tier grants
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TierScope {
    /// No filtering at all
    Unrestricted,
    /// Egress limited to these endpoints (plus DNS)
    Restricted(Vec<HostEndpoint>),
}

/// Cumulative tier → host mapping built from configuration
#[derive(Clone, Debug)]
pub struct TierCatalog {
    free: Vec<HostEndpoint>,
    basic: Vec<HostEndpoint>,
    pro: Vec<HostEndpoint>,
}

impl TierCatalog {
    /// Build the catalog; unparsable entries are skipped with a warning (config
    /// validation rejects them up front).
    pub fn from_settings(settings: &TierSettings) -> Self {
        let parse_all = |tier: &str, entries: &[String]| -> Vec<HostEndpoint> {
            entries
                .iter()
                .filter_map(|entry| match HostEndpoint::parse(entry) {
                    Ok(endpoint) => Some(endpoint),
                    Err(e) => {
                        log::warn!("Ignoring invalid {} tier host '{}': {}", tier, entry, e);
                        None
                    }
                })
                .collect()
        };

        Self {
            free: parse_all("free", &settings.free),
            basic: parse_all("basic", &settings.basic),
            pro: parse_all("pro", &settings.pro),
        }
    }

    /// Hosts granted by a tier, in declaration order, without duplicates.
    pub fn scope(&self, tier: Tier) -> TierScope {
        let layers: &[&[HostEndpoint]] = match tier {
            Tier::Free => &[&self.free],
            Tier::Basic => &[&self.free, &self.basic],
            Tier::Pro => &[&self.free, &self.basic, &self.pro],
            Tier::Dev | Tier::Founder | Tier::Admin => return TierScope::Unrestricted,
        };

        let mut hosts: Vec<HostEndpoint> = Vec::new();
        for endpoint in layers.iter().flat_map(|layer| layer.iter()) {
            if !hosts.contains(endpoint) {
                hosts.push(endpoint.clone());
            }
        }
        TierScope::Restricted(hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TierSettings {
        TierSettings {
            free: vec!["pypi.org".to_string()],
            basic: vec!["github.com:443".to_string(), "pypi.org:443".to_string()],
            pro: vec!["deb.debian.org:80".to_string()],
        }
    }

    fn hosts(scope: TierScope) -> Vec<HostEndpoint> {
        match scope {
            TierScope::Restricted(hosts) => hosts,
            TierScope::Unrestricted => panic!("expected restricted scope"),
        }
    }

    #[test]
    fn test_host_endpoint_parse() {
        let endpoint = HostEndpoint::parse("PyPI.org").unwrap();
        assert_eq!(endpoint.host, "pypi.org");
        assert_eq!(endpoint.port, DEFAULT_HOST_PORT);

        let endpoint = HostEndpoint::parse("deb.debian.org:80").unwrap();
        assert_eq!(endpoint.port, 80);

        assert!(HostEndpoint::parse("").is_err());
        assert!(HostEndpoint::parse("example.com:0").is_err());
        assert!(HostEndpoint::parse("bad host").is_err());
    }

    #[test]
    fn test_tiers_are_cumulative() {
        let catalog = TierCatalog::from_settings(&settings());
        let free = hosts(catalog.scope(Tier::Free));
        let basic = hosts(catalog.scope(Tier::Basic));
        let pro = hosts(catalog.scope(Tier::Pro));

        assert!(free.iter().all(|h| basic.contains(h)));
        assert!(basic.iter().all(|h| pro.contains(h)));
        assert!(free.len() <= basic.len() && basic.len() <= pro.len());
        // pypi.org:443 appears in both free and basic but only once in the union
        assert_eq!(basic.len(), 2);
    }

    #[test]
    fn test_privileged_tiers_are_unrestricted() {
        let catalog = TierCatalog::from_settings(&settings());
        for tier in [Tier::Dev, Tier::Founder, Tier::Admin] {
            assert_eq!(catalog.scope(tier), TierScope::Unrestricted);
            assert!(tier.is_unrestricted());
        }
    }

    #[test]
    fn test_default_tier_is_restricted() {
        assert_eq!(Tier::default(), Tier::Free);
        assert!(!Tier::default().is_unrestricted());
    }
}
