//! DNS cross-type dedup: resolve domain/url indicators into a cache, then
//! drop domains whose addresses are already blocked as IP indicators.

use chrono::{Duration as ChronoDuration, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use metrics::counter;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::DnsSettings;
use crate::enrichment::DnsResolver;
use crate::error::StoreError;
use crate::models::ioc_utils::resolvable_host;
use crate::models::IndicatorType;
use crate::storage::{with_retry, IndicatorStore, RetryPolicy};

/// Lookups in flight at once. The resolver's own rate limit still applies.
const RESOLVE_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolveReport {
    pub candidates: usize,
    pub resolved: usize,
    pub unresolved: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub ip_indicators: usize,
    pub cache_entries: usize,
    pub removed: u64,
}

pub struct DnsDeduplicator {
    store: Arc<dyn IndicatorStore>,
    resolver: Arc<dyn DnsResolver>,
    settings: DnsSettings,
    retry: RetryPolicy,
}

impl DnsDeduplicator {
    pub fn new(store: Arc<dyn IndicatorStore>, resolver: Arc<dyn DnsResolver>, settings: DnsSettings) -> Self {
        Self {
            store,
            resolver,
            settings,
            retry: RetryPolicy::default(),
        }
    }

    pub fn settings(&self) -> &DnsSettings {
        &self.settings
    }

    /// Resolve up to `batch_size` domains whose cache entry is missing or
    /// older than `retry_days`. Never deletes anything.
    pub async fn resolve_batch(&self) -> Result<ResolveReport, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::days(self.settings.retry_days);
        let candidates = self
            .store
            .domains_for_resolution(self.settings.batch_size, cutoff)
            .await?;

        let mut report = ResolveReport {
            candidates: candidates.len(),
            ..Default::default()
        };
        if candidates.is_empty() {
            tracing::debug!("No domains due for resolution");
            return Ok(report);
        }

        let resolved: Vec<(String, Vec<String>)> = stream::iter(candidates)
            .map(|(value, indicator_type)| async move {
                let ips = match resolvable_host(&value, indicator_type) {
                    Some(host) => self
                        .resolver
                        .resolve_a(&host)
                        .await
                        .into_iter()
                        .map(|ip| ip.to_string())
                        .collect(),
                    None => Vec::new(),
                };
                (value, ips)
            })
            .buffer_unordered(RESOLVE_CONCURRENCY)
            .collect()
            .await;

        for (domain, ips) in &resolved {
            if ips.is_empty() {
                report.unresolved += 1;
            } else {
                report.resolved += 1;
            }
            with_retry(self.retry, "upsert_dns_cache", || self.store.upsert_dns_cache(domain, ips)).await?;
        }

        tracing::info!(
            candidates = report.candidates,
            resolved = report.resolved,
            unresolved = report.unresolved,
            "DNS resolution batch finished"
        );
        Ok(report)
    }

    /// Delete cached domains that resolve to any stored IP indicator.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let ip_set: HashSet<String> = self
            .store
            .indicator_values_of_type(IndicatorType::Ip)
            .await?
            .into_iter()
            .collect();

        let mut report = SweepReport {
            ip_indicators: ip_set.len(),
            ..Default::default()
        };

        let mut redundant = Vec::new();
        {
            let mut entries = self.store.stream_dns_cache();
            while let Some(entry) = entries.try_next().await? {
                report.cache_entries += 1;
                if entry.resolved().any(|ip| ip_set.contains(ip)) {
                    redundant.push(entry.domain);
                }
            }
        }

        for chunk in redundant.chunks(self.settings.delete_batch_size.max(1)) {
            report.removed += with_retry(self.retry, "delete_indicators", || self.store.delete_indicators(chunk)).await?;
        }

        if report.removed > 0 {
            counter!("feedforge_dns_dedup_removed_total").increment(report.removed);
        }
        tracing::info!(
            ip_indicators = report.ip_indicators,
            cache_entries = report.cache_entries,
            removed = report.removed,
            "DNS dedup sweep finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::dns::MockDnsResolver;
    use crate::models::NewIndicator;
    use crate::storage::SqliteStore;
    use std::net::Ipv4Addr;

    fn row(value: &str, ty: IndicatorType) -> NewIndicator {
        NewIndicator {
            value: value.to_string(),
            indicator_type: ty,
            country: None,
        }
    }

    async fn seeded() -> Arc<dyn IndicatorStore> {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .upsert_indicators(
                "Feed A",
                &[
                    row("203.0.113.7", IndicatorType::Ip),
                    row("bad.com", IndicatorType::Domain),
                    row("good-cdn.net", IndicatorType::Domain),
                    row("http://evil.org/payload", IndicatorType::Url),
                ],
            )
            .await
            .unwrap();
        Arc::new(store)
    }

    fn resolver() -> MockDnsResolver {
        let mut resolver = MockDnsResolver::new();
        resolver.expect_resolve_a().returning(|host| match host {
            "bad.com" => vec![Ipv4Addr::new(203, 0, 113, 7), Ipv4Addr::new(198, 51, 100, 1)],
            "evil.org" => vec![Ipv4Addr::new(198, 51, 100, 2)],
            _ => Vec::new(),
        });
        resolver
    }

    #[tokio::test]
    async fn resolves_domains_and_url_hosts_into_cache() {
        let store = seeded().await;
        let dedup = DnsDeduplicator::new(store.clone(), Arc::new(resolver()), DnsSettings::default());

        let report = dedup.resolve_batch().await.unwrap();
        assert_eq!(report.candidates, 3);
        assert_eq!(report.resolved, 2);
        assert_eq!(report.unresolved, 1);

        let cache: Vec<_> = store.stream_dns_cache().try_collect().await.unwrap();
        let url = cache.iter().find(|e| e.domain == "http://evil.org/payload").unwrap();
        assert_eq!(url.resolved_ips, "198.51.100.2");

        // Fresh entries are not due again.
        let again = dedup.resolve_batch().await.unwrap();
        assert_eq!(again.candidates, 0);
        assert!(store.get_indicator("bad.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_removes_only_domains_overlapping_ip_indicators() {
        let store = seeded().await;
        let dedup = DnsDeduplicator::new(store.clone(), Arc::new(resolver()), DnsSettings::default());
        dedup.resolve_batch().await.unwrap();

        let report = dedup.sweep().await.unwrap();
        assert_eq!(report.ip_indicators, 1);
        assert_eq!(report.cache_entries, 3);
        assert_eq!(report.removed, 1);
        assert!(store.get_indicator("bad.com").await.unwrap().is_none());
        assert!(store.get_indicator("http://evil.org/payload").await.unwrap().is_some());
        assert!(store.get_indicator("good-cdn.net").await.unwrap().is_some());
        assert!(store.get_indicator("203.0.113.7").await.unwrap().is_some());
        assert!(store.sources_for_indicator("bad.com").await.unwrap().is_empty());

        let rerun = dedup.sweep().await.unwrap();
        assert_eq!(rerun.removed, 0);
    }
}
