//! Outbound-connection admission control: §4.4 of the specification.
//!
//! A [`PolicyEngine`] is built once per call from the merged global and
//! per-project rule lists and is immutable for the lifetime of that call
//! (the "policy snapshot" referenced elsewhere). `evaluate` is consulted by
//! the builtin bridge's `http`/`https`/`net`/`dns` shims before any outbound
//! connection or lookup.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

mod dns;
pub use dns::{DnsResolver, HickoryDnsResolver, StaticDnsResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Ip,
    Cidr,
    Domain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRule {
    pub action: Action,
    pub target_type: TargetType,
    pub target_value: String,
    pub priority: i64,
    #[serde(default)]
    pub description: Option<String>,
}

impl NetworkRule {
    fn matches(&self, host: &str, is_ip_literal: bool, ips: &[IpAddr]) -> bool {
        match self.target_type {
            TargetType::Domain => !is_ip_literal && domain_glob_match(&self.target_value, host),
            TargetType::Ip => match self.target_value.parse::<IpAddr>() {
                Ok(target) => ips.contains(&target),
                Err(_) => false,
            },
            TargetType::Cidr => match self.target_value.parse::<IpNetwork>() {
                Ok(net) => ips.iter().any(|ip| net.contains(*ip)),
                Err(_) => false,
            },
        }
    }

    fn mentions_ipv6(&self) -> bool {
        match self.target_type {
            TargetType::Ip => self
                .target_value
                .parse::<IpAddr>()
                .map(|ip| ip.is_ipv6())
                .unwrap_or(false),
            TargetType::Cidr => self
                .target_value
                .parse::<IpNetwork>()
                .map(|n| n.is_ipv6())
                .unwrap_or(false),
            TargetType::Domain => false,
        }
    }
}

/// Case-insensitive match with a single leading `*.` wildcard segment, the
/// only glob form the specification's worked examples exercise. `*.example.com`
/// matches `foo.example.com` and `a.b.example.com` but not bare `example.com`.
fn domain_glob_match(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => {
            let dotted_suffix = format!(".{suffix}");
            host.ends_with(&dotted_suffix) && host.len() > dotted_suffix.len()
        },
        None => host == pattern,
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub allowed: bool,
    pub reason: String,
    pub resolved_ip: Option<IpAddr>,
}

/// An immutable, priority-ordered rule set for a single call.
pub struct PolicyEngine {
    rules: Vec<NetworkRule>,
}

impl PolicyEngine {
    /// Merges `global` and `project` rules and stable-sorts ascending by
    /// `priority`, per spec §4.4.
    pub fn new(global: Vec<NetworkRule>, project: Vec<NetworkRule>) -> Self {
        let mut rules: Vec<NetworkRule> = global.into_iter().chain(project).collect();
        rules.sort_by_key(|r| r.priority);
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub async fn evaluate(&self, host: &str, dns: &dyn DnsResolver) -> EvaluationResult {
        let is_ip_literal = host.parse::<IpAddr>().is_ok();

        let resolved = if is_ip_literal {
            vec![host.parse::<IpAddr>().expect("checked above")]
        } else {
            dns.resolve(host).await
        };

        if resolved.is_empty() {
            tracing::debug!(host, "dns resolution returned no records");
            return EvaluationResult {
                allowed: true,
                reason: "dns pending/failed".to_string(),
                resolved_ip: None,
            };
        }

        let has_ipv4 = resolved.iter().any(IpAddr::is_ipv4);
        let candidate_ips: Vec<IpAddr> = if has_ipv4 {
            resolved.iter().copied().filter(IpAddr::is_ipv4).collect()
        } else {
            resolved.clone()
        };

        if !has_ipv4 && !self.rules.iter().any(NetworkRule::mentions_ipv6) {
            tracing::debug!(host, "policy denied: no ipv6 rule configured");
            return EvaluationResult {
                allowed: false,
                reason: "ipv6 unconfigured".to_string(),
                resolved_ip: candidate_ips.first().copied(),
            };
        }

        for rule in &self.rules {
            if rule.matches(host, is_ip_literal, &candidate_ips) {
                let allowed = matches!(rule.action, Action::Allow);
                if !allowed {
                    tracing::debug!(
                        host,
                        priority = rule.priority,
                        target_type = ?rule.target_type,
                        "policy denied: matched deny rule"
                    );
                }
                return EvaluationResult {
                    allowed,
                    reason: format!(
                        "matched rule priority={} target_type={:?}",
                        rule.priority, rule.target_type
                    ),
                    resolved_ip: candidate_ips.first().copied(),
                };
            }
        }

        tracing::debug!(host, "policy denied: no matching rule, default deny");
        EvaluationResult {
            allowed: false,
            reason: "no matching rule".to_string(),
            resolved_ip: candidate_ips.first().copied(),
        }
    }
}
