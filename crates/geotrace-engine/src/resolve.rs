//! DNS resolution backed by hickory.

use async_trait::async_trait;
use geotrace_core::{DnsResolver, TraceError};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use tracing::debug;

/// System-independent resolver using hickory's default upstream config.
pub struct HickoryDnsResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryDnsResolver {
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(
                ResolverConfig::default(),
                ResolverOpts::default(),
            ),
        }
    }
}

impl Default for HickoryDnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsResolver for HickoryDnsResolver {
    async fn resolve(&self, host: &str, want_v4: bool) -> Result<IpAddr, TraceError> {
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| TraceError::HostResolution {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        // Prefer the requested family, fall back to whatever answered.
        let mut fallback = None;
        for ip in lookup.iter() {
            if ip.is_ipv4() == want_v4 {
                return Ok(ip);
            }
            fallback.get_or_insert(ip);
        }
        fallback.ok_or_else(|| TraceError::HostResolution {
            host: host.to_string(),
            reason: "no addresses in answer".to_string(),
        })
    }

    async fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        match self.resolver.reverse_lookup(ip).await {
            Ok(lookup) => lookup
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string()),
            Err(e) => {
                debug!(ip = %ip, error = %e, "Reverse lookup failed");
                None
            }
        }
    }
}
