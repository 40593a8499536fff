use std::{collections::HashMap, net::IpAddr};

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;

/// Resolves a hostname to the set of addresses a policy decision is made
/// against. Abstracted so tests can supply canned answers without touching
/// the network.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Vec<IpAddr>;
}

/// Resolves via the system's configured nameservers.
pub struct HickoryDnsResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryDnsResolver {
    pub fn from_system_conf() -> anyhow::Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Self { resolver })
    }
}

#[async_trait]
impl DnsResolver for HickoryDnsResolver {
    async fn resolve(&self, host: &str) -> Vec<IpAddr> {
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => lookup.iter().collect(),
            Err(err) => {
                tracing::debug!(host, error = %err, "dns lookup failed");
                Vec::new()
            },
        }
    }
}

/// A fixed host-to-addresses table, for tests.
pub struct StaticDnsResolver {
    records: HashMap<String, Vec<IpAddr>>,
}

impl StaticDnsResolver {
    pub fn new<I, S>(records: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<IpAddr>)>,
        S: Into<String>,
    {
        Self {
            records: records.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

#[async_trait]
impl DnsResolver for StaticDnsResolver {
    async fn resolve(&self, host: &str) -> Vec<IpAddr> {
        self.records.get(host).cloned().unwrap_or_default()
    }
}
