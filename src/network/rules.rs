//! Resolved firewall rules.
//!
//! A [`ResolvedRuleSet`] is a point-in-time DNS snapshot with no source address yet.
//! [`ResolvedRuleSet::bind`] scopes it to an instance's assigned address, producing the
//! ordered [`NetworkRule`] list pushed to the firewall: allows first, terminal deny last.

use crate::config::types::{PartialPolicyWarning, Protocol};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

pub const DNS_PORT: u16 = 53;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Any,
    Address(IpAddr),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Any => f.write_str("*"),
            Destination::Address(addr) => write!(f, "{}", addr),
        }
    }
}

/// Rule without a source address
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RuleTemplate {
    pub action: RuleAction,
    pub destination: Destination,
    /// None matches every protocol
    pub protocol: Option<Protocol>,
    pub port: Option<u16>,
}

impl RuleTemplate {
    pub fn allow(destination: Destination, protocol: Protocol, port: u16) -> Self {
        Self {
            action: RuleAction::Allow,
            destination,
            protocol: Some(protocol),
            port: Some(port),
        }
    }

    pub fn deny_all() -> Self {
        Self {
            action: RuleAction::Deny,
            destination: Destination::Any,
            protocol: None,
            port: None,
        }
    }
}

/// Firewall rule scoped to an instance address
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NetworkRule {
    pub source: IpAddr,
    pub action: RuleAction,
    pub destination: Destination,
    pub protocol: Option<Protocol>,
    pub port: Option<u16>,
}

impl fmt::Display for NetworkRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.action {
            RuleAction::Allow => "allow",
            RuleAction::Deny => "deny",
        };
        write!(f, "{} {} -> {}", action, self.source, self.destination)?;
        match (self.protocol, self.port) {
            (Some(proto), Some(port)) => write!(f, " {}/{}", port, proto),
            (Some(proto), None) => write!(f, " {}", proto),
            (None, Some(port)) => write!(f, " port {}", port),
            (None, None) => Ok(()),
        }
    }
}

/// Ordered allow-list snapshot for one tier
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResolvedRuleSet {
    rules: Vec<RuleTemplate>,
    warnings: Vec<PartialPolicyWarning>,
    resolved_at: DateTime<Utc>,
}

impl ResolvedRuleSet {
    /// Assemble the final ordering: host allows (deduplicated), DNS egress, terminal deny.
    pub fn assemble(
        host_allows: Vec<RuleTemplate>,
        warnings: Vec<PartialPolicyWarning>,
    ) -> Self {
        let mut rules: Vec<RuleTemplate> = Vec::with_capacity(host_allows.len() + 3);
        for rule in host_allows {
            if !rules.contains(&rule) {
                rules.push(rule);
            }
        }
        rules.push(RuleTemplate::allow(Destination::Any, Protocol::Udp, DNS_PORT));
        rules.push(RuleTemplate::allow(Destination::Any, Protocol::Tcp, DNS_PORT));
        rules.push(RuleTemplate::deny_all());

        Self {
            rules,
            warnings,
            resolved_at: Utc::now(),
        }
    }

    pub fn rules(&self) -> &[RuleTemplate] {
        &self.rules
    }

    pub fn warnings(&self) -> &[PartialPolicyWarning] {
        &self.warnings
    }

    pub fn resolved_at(&self) -> DateTime<Utc> {
        self.resolved_at
    }

    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Scope every rule to `source`, preserving order.
    pub fn bind(&self, source: IpAddr) -> Vec<NetworkRule> {
        self.rules
            .iter()
            .map(|rule| NetworkRule {
                source,
                action: rule.action,
                destination: rule.destination,
                protocol: rule.protocol,
                port: rule.port,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_orders_allows_before_terminal_deny() {
        let addr: IpAddr = "1.2.3.4".parse().unwrap();
        let set = ResolvedRuleSet::assemble(
            vec![
                RuleTemplate::allow(Destination::Address(addr), Protocol::Tcp, 443),
                RuleTemplate::allow(Destination::Address(addr), Protocol::Tcp, 443),
            ],
            Vec::new(),
        );

        assert_eq!(
            set.rules(),
            &[
                RuleTemplate::allow(Destination::Address(addr), Protocol::Tcp, 443),
                RuleTemplate::allow(Destination::Any, Protocol::Udp, DNS_PORT),
                RuleTemplate::allow(Destination::Any, Protocol::Tcp, DNS_PORT),
                RuleTemplate::deny_all(),
            ]
        );
        assert!(!set.is_partial());
    }

    #[test]
    fn test_bind_is_stable_across_reapplication() {
        let set = ResolvedRuleSet::assemble(Vec::new(), Vec::new());
        let source: IpAddr = "172.17.0.5".parse().unwrap();

        let first = set.bind(source);
        let second = set.bind(source);
        assert_eq!(first, second);
        assert!(first.iter().all(|rule| rule.source == source));
        assert_eq!(first.last().unwrap().action, RuleAction::Deny);
    }

    #[test]
    fn test_rule_display() {
        let rule = NetworkRule {
            source: "172.17.0.5".parse().unwrap(),
            action: RuleAction::Allow,
            destination: Destination::Any,
            protocol: Some(Protocol::Udp),
            port: Some(53),
        };
        assert_eq!(rule.to_string(), "allow 172.17.0.5 -> * 53/udp");
    }
}
