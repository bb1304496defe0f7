//! Network tiers and egress rules
//!
//! Tier catalogs, DNS resolution into allow-lists, and source-bound firewall rules.

pub mod resolver;
pub mod rules;
pub mod tier;

pub use resolver::{HostResolver, NetworkTierResolver, SystemResolver};
pub use rules::{Destination, NetworkRule, ResolvedRuleSet, RuleAction, RuleTemplate};
pub use tier::{HostEndpoint, Tier, TierCatalog, TierScope};
