//! Rate-limited A-record resolution for domain and URL indicators

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::net::Ipv4Addr;
use std::num::NonZeroU32;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Resolves host names to IPv4 addresses. Failures yield an empty list.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve_a(&self, host: &str) -> Vec<Ipv4Addr>;
}

/// System resolver behind a queries-per-second limit.
pub struct TrustDnsResolver {
    resolver: TokioAsyncResolver,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl TrustDnsResolver {
    pub fn new(queries_per_second: u32) -> Self {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        let rate = NonZeroU32::new(queries_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            resolver,
            limiter: RateLimiter::direct(Quota::per_second(rate)),
        }
    }
}

#[async_trait]
impl DnsResolver for TrustDnsResolver {
    async fn resolve_a(&self, host: &str) -> Vec<Ipv4Addr> {
        self.limiter.until_ready().await;
        match self.resolver.ipv4_lookup(host).await {
            Ok(response) => response.iter().map(|a| a.0).collect(),
            Err(e) => {
                tracing::debug!(host, error = %e, "A lookup failed");
                Vec::new()
            }
        }
    }
}
