//! Host firewall seam and the iptables adapter.
//!
//! Each instance address gets its own chain, jumped to from the parent chain
//! (`DOCKER-USER` by default) for packets sourced from that address. Resetting flushes
//! the chain, so re-applying a rule set on restart is idempotent. Every chain opens with a
//! conntrack accept so replies on established flows (published ports) pass the final drop.

use crate::config::settings::FirewallSettings;
use crate::config::types::{Result, SandboxError};
use crate::network::rules::{Destination, NetworkRule, RuleAction};
use sha2::{Digest, Sha256};
use std::io;
use std::net::IpAddr;
use std::process::{Command, Stdio};

pub trait Firewall: Send + Sync {
    /// Ensure an empty chain for `source` exists and is jumped to
    fn reset(&self, source: IpAddr) -> Result<()>;

    /// Append one rule to the chain of `rule.source`
    fn apply_rule(&self, rule: &NetworkRule) -> Result<()>;

    /// Drop all filtering for `source`; a missing chain is success
    fn release(&self, source: IpAddr) -> Result<()>;
}

/// Chain name for an address; iptables caps names at 28 characters.
pub fn chain_name(source: IpAddr) -> String {
    match source {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("SBX-{}-{}-{}-{}", o[0], o[1], o[2], o[3])
        }
        IpAddr::V6(v6) => {
            let digest = Sha256::digest(v6.octets());
            let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
            format!("SBX6-{}", hex)
        }
    }
}

/// Commands that leave `chain` empty except for the established-flow accept
pub fn chain_prelude(chain: &str) -> Vec<Vec<String>> {
    vec![
        vec!["-F".to_string(), chain.to_string()],
        [
            "-A",
            chain,
            "-m",
            "conntrack",
            "--ctstate",
            "ESTABLISHED,RELATED",
            "-j",
            "ACCEPT",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    ]
}

/// iptables argument list for one rule
pub fn rule_args(chain: &str, rule: &NetworkRule) -> Vec<String> {
    let mut args = vec!["-A".to_string(), chain.to_string()];
    args.push("-s".into());
    args.push(rule.source.to_string());
    if let Destination::Address(addr) = rule.destination {
        args.push("-d".into());
        args.push(addr.to_string());
    }
    if let Some(protocol) = rule.protocol {
        args.push("-p".into());
        args.push(protocol.as_str().to_string());
        if let Some(port) = rule.port {
            args.push("--dport".into());
            args.push(port.to_string());
        }
    }
    args.push("-j".into());
    args.push(
        match rule.action {
            RuleAction::Allow => "ACCEPT",
            RuleAction::Deny => "DROP",
        }
        .to_string(),
    );
    args
}

pub struct IptablesFirewall {
    binary: String,
    ip6_binary: String,
    parent_chain: String,
}

impl IptablesFirewall {
    pub fn new(settings: &FirewallSettings) -> Self {
        Self {
            binary: settings.binary.clone(),
            ip6_binary: settings.binary.replacen("iptables", "ip6tables", 1),
            parent_chain: settings.parent_chain.clone(),
        }
    }

    fn binary_for(&self, source: IpAddr) -> &str {
        match source {
            IpAddr::V4(_) => &self.binary,
            IpAddr::V6(_) => &self.ip6_binary,
        }
    }

    /// Run and report (success, stderr)
    fn exec(&self, binary: &str, args: &[String]) -> Result<(bool, String)> {
        log::debug!("{} {}", binary, args.join(" "));
        let output = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    SandboxError::Firewall(format!("'{}' not found on PATH", binary))
                } else {
                    SandboxError::Firewall(format!("failed to run '{}': {}", binary, e))
                }
            })?;
        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }

    fn exec_checked(&self, binary: &str, args: &[String]) -> Result<()> {
        let (ok, stderr) = self.exec(binary, args)?;
        if ok {
            Ok(())
        } else {
            Err(SandboxError::Firewall(format!(
                "{} {} failed: {}",
                binary,
                args.join(" "),
                stderr
            )))
        }
    }

    fn jump_args(&self, op: &str, source: IpAddr, chain: &str) -> Vec<String> {
        let mut args = vec![op.to_string(), self.parent_chain.clone()];
        if op == "-I" {
            args.push("1".to_string());
        }
        args.extend([
            "-s".to_string(),
            source.to_string(),
            "-j".to_string(),
            chain.to_string(),
        ]);
        args
    }
}

impl Firewall for IptablesFirewall {
    fn reset(&self, source: IpAddr) -> Result<()> {
        let binary = self.binary_for(source);
        let chain = chain_name(source);

        let (created, stderr) = self.exec(binary, &["-N".to_string(), chain.clone()])?;
        if !created && !stderr.to_ascii_lowercase().contains("exists") {
            return Err(SandboxError::Firewall(format!(
                "cannot create chain {}: {}",
                chain, stderr
            )));
        }
        for args in chain_prelude(&chain) {
            self.exec_checked(binary, &args)?;
        }

        let (jump_present, _) = self.exec(binary, &self.jump_args("-C", source, &chain))?;
        if !jump_present {
            self.exec_checked(binary, &self.jump_args("-I", source, &chain))?;
        }

        log::debug!("Reset firewall chain {} for {}", chain, source);
        Ok(())
    }

    fn apply_rule(&self, rule: &NetworkRule) -> Result<()> {
        let chain = chain_name(rule.source);
        if let Destination::Address(addr) = rule.destination {
            if addr.is_ipv4() != rule.source.is_ipv4() {
                log::debug!("Skipping cross-family rule {}", rule);
                return Ok(());
            }
        }
        self.exec_checked(self.binary_for(rule.source), &rule_args(&chain, rule))
    }

    fn release(&self, source: IpAddr) -> Result<()> {
        let binary = self.binary_for(source);
        let chain = chain_name(source);

        // Remove every jump, then the chain itself; failures mean it is already gone
        while self.exec(binary, &self.jump_args("-D", source, &chain))?.0 {}
        let _ = self.exec(binary, &["-F".to_string(), chain.clone()])?;
        let _ = self.exec(binary, &["-X".to_string(), chain.clone()])?;

        log::debug!("Released firewall chain {} for {}", chain, source);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::Protocol;

    fn rule(action: RuleAction, destination: Destination, protocol: Option<Protocol>, port: Option<u16>) -> NetworkRule {
        NetworkRule {
            source: "172.17.0.5".parse().unwrap(),
            action,
            destination,
            protocol,
            port,
        }
    }

    #[test]
    fn test_chain_name_fits_iptables_limit() {
        assert_eq!(chain_name("172.17.0.5".parse().unwrap()), "SBX-172-17-0-5");
        assert!(chain_name("255.255.255.255".parse().unwrap()).len() <= 28);
        let v6 = chain_name("fd00::1234".parse().unwrap());
        assert!(v6.starts_with("SBX6-"));
        assert!(v6.len() <= 28);
    }

    #[test]
    fn test_rule_args() {
        let allow = rule(
            RuleAction::Allow,
            Destination::Address("1.2.3.4".parse().unwrap()),
            Some(Protocol::Tcp),
            Some(443),
        );
        assert_eq!(
            rule_args("SBX-172-17-0-5", &allow).join(" "),
            "-A SBX-172-17-0-5 -s 172.17.0.5 -d 1.2.3.4 -p tcp --dport 443 -j ACCEPT"
        );

        let deny = rule(RuleAction::Deny, Destination::Any, None, None);
        assert_eq!(
            rule_args("SBX-172-17-0-5", &deny).join(" "),
            "-A SBX-172-17-0-5 -s 172.17.0.5 -j DROP"
        );
    }

    #[test]
    fn test_reset_accepts_established_flows_first() {
        let chain = "SBX-172-17-0-5";
        let prelude: Vec<String> = chain_prelude(chain).iter().map(|a| a.join(" ")).collect();
        assert_eq!(
            prelude,
            vec![
                "-F SBX-172-17-0-5",
                "-A SBX-172-17-0-5 -m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT",
            ]
        );

        // Resolved rules are appended after it, so the terminal drop stays last
        let deny = rule(RuleAction::Deny, Destination::Any, None, None);
        assert_eq!(rule_args(chain, &deny)[0], "-A");
    }

    #[test]
    fn test_missing_binary_is_firewall_error() {
        let firewall = IptablesFirewall::new(&FirewallSettings {
            binary: format!("sessionbox-no-iptables-{}", uuid::Uuid::new_v4()),
            parent_chain: "DOCKER-USER".to_string(),
        });
        let result = firewall.reset("172.17.0.5".parse().unwrap());
        assert!(matches!(result, Err(SandboxError::Firewall(_))));
    }
}
