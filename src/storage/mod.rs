//! Indicator store: one interface, a backend per database engine.

pub mod postgres;
pub mod retry;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StoreError;
use crate::models::{
    BlocklistEntry, CountryCount, DnsCacheEntry, Indicator, IndicatorFilter, IndicatorSource,
    IndicatorType, JobOutcome, JobRecord, NewIndicator, PaginatedResponse, SourceCount,
    StatsSnapshot, WhitelistEntry,
};

pub use postgres::PostgresStore;
pub use retry::{with_retry, RetryPolicy};
pub use sqlite::SqliteStore;

/// Rows removed by a retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub links_removed: u64,
    pub orphans_removed: u64,
    pub dns_cache_removed: u64,
}

/// Indicator counts per type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCounts {
    pub ip: i64,
    pub cidr: i64,
    pub domain: i64,
    pub url: i64,
}

impl TypeCounts {
    pub fn total(&self) -> i64 {
        self.ip + self.cidr + self.domain + self.url
    }

    pub(crate) fn add(&mut self, indicator_type: &str, count: i64) {
        match indicator_type.parse::<IndicatorType>() {
            Ok(IndicatorType::Ip) => self.ip += count,
            Ok(IndicatorType::Cidr) => self.cidr += count,
            Ok(IndicatorType::Domain) => self.domain += count,
            Ok(IndicatorType::Url) => self.url += count,
            Err(e) => tracing::warn!(error = %e, "Skipping row with unknown indicator type"),
        }
    }
}

/// Persistence for indicators, provenance, allow/block-lists, DNS cache,
/// job history and stats history.
///
/// Every write runs inside its own transaction.
#[async_trait]
pub trait IndicatorStore: Send + Sync {
    /// Apply the schema migrations for this backend.
    async fn migrate(&self) -> Result<(), StoreError>;

    // ---- ingestion ----

    /// Insert or refresh `rows` and link each to `source`.
    /// Returns the number of distinct values written.
    async fn upsert_indicators(&self, source: &str, rows: &[NewIndicator]) -> Result<usize, StoreError>;

    /// Recompute `source_count` and `risk_score` from the live source links.
    /// With `target_source`, only indicators linked to that source are touched.
    async fn recalculate_scores(
        &self,
        confidences: &HashMap<String, i32>,
        target_source: Option<&str>,
    ) -> Result<u64, StoreError>;

    /// Drop source links older than each source's retention, then purge
    /// orphaned indicators and DNS cache rows of vanished indicators.
    async fn remove_expired(
        &self,
        retention_days: &HashMap<String, i64>,
        default_days: i64,
    ) -> Result<RetentionReport, StoreError>;

    /// Delete indicators together with their source links.
    async fn delete_indicators(&self, values: &[String]) -> Result<u64, StoreError>;

    // ---- reads ----

    fn stream_indicators(&self) -> BoxStream<'_, Result<Indicator, StoreError>>;

    async fn get_indicator(&self, value: &str) -> Result<Option<Indicator>, StoreError>;

    async fn indicator_values_of_type(&self, indicator_type: IndicatorType) -> Result<Vec<String>, StoreError>;

    async fn query_indicators(&self, filter: &IndicatorFilter) -> Result<PaginatedResponse<Indicator>, StoreError>;

    /// Indicators of the given types (all when empty) linked to any of the
    /// given sources (all when empty), highest risk first.
    async fn export_indicators(
        &self,
        types: &[IndicatorType],
        sources: &[String],
    ) -> Result<Vec<Indicator>, StoreError>;

    async fn sources_for_indicator(&self, value: &str) -> Result<Vec<IndicatorSource>, StoreError>;

    async fn source_counts(&self) -> Result<Vec<SourceCount>, StoreError>;

    async fn counts_by_type(&self) -> Result<TypeCounts, StoreError>;

    /// Most frequent countries among IP indicators.
    async fn country_stats(&self, limit: i64) -> Result<Vec<CountryCount>, StoreError>;

    // ---- user whitelist ----

    async fn add_whitelist(
        &self,
        item: &str,
        indicator_type: IndicatorType,
        description: Option<&str>,
    ) -> Result<WhitelistEntry, StoreError>;

    async fn list_whitelist(&self) -> Result<Vec<WhitelistEntry>, StoreError>;

    async fn remove_whitelist(&self, id: i64) -> Result<bool, StoreError>;

    // ---- manual block-list ----

    async fn add_blocklist(
        &self,
        item: &str,
        indicator_type: IndicatorType,
        comment: Option<&str>,
    ) -> Result<BlocklistEntry, StoreError>;

    async fn list_blocklist(&self) -> Result<Vec<BlocklistEntry>, StoreError>;

    async fn remove_blocklist(&self, id: i64) -> Result<bool, StoreError>;

    // ---- DNS cache ----

    /// Domain and URL indicators never resolved or last resolved before
    /// `resolved_before`.
    async fn domains_for_resolution(
        &self,
        limit: i64,
        resolved_before: DateTime<Utc>,
    ) -> Result<Vec<(String, IndicatorType)>, StoreError>;

    async fn upsert_dns_cache(&self, domain: &str, resolved_ips: &[String]) -> Result<(), StoreError>;

    fn stream_dns_cache(&self) -> BoxStream<'_, Result<DnsCacheEntry, StoreError>>;

    // ---- job history ----

    /// Open a `running` history row and return its id.
    async fn job_started(&self, source: &str) -> Result<i64, StoreError>;

    async fn job_finished(
        &self,
        id: i64,
        outcome: JobOutcome,
        items_processed: i64,
        message: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn job_history(&self, limit: i64) -> Result<Vec<JobRecord>, StoreError>;

    async fn clear_job_history(&self) -> Result<u64, StoreError>;

    // ---- stats history ----

    /// Record current counts. CIDRs are counted with IPs.
    async fn save_stats_snapshot(&self) -> Result<StatsSnapshot, StoreError>;

    async fn stats_history(&self, since: DateTime<Utc>) -> Result<Vec<StatsSnapshot>, StoreError>;
}

/// Open the store matching the URL scheme.
pub async fn create_store(database_url: &str) -> Result<Arc<dyn IndicatorStore>, StoreError> {
    if database_url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteStore::connect(database_url).await?))
    } else if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        Ok(Arc::new(PostgresStore::connect(database_url).await?))
    } else {
        Err(StoreError::Configuration(format!(
            "unsupported database URL scheme: {}",
            database_url.split(':').next().unwrap_or_default()
        )))
    }
}

/// Keep the last row per value; bulk upserts may not touch a row twice.
pub(crate) fn dedupe_rows(rows: &[NewIndicator]) -> Vec<&NewIndicator> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(rows.len());
    let mut out: Vec<&NewIndicator> = Vec::with_capacity(rows.len());
    for row in rows {
        match index.get(row.value.as_str()) {
            Some(&i) => out[i] = row,
            None => {
                index.insert(row.value.as_str(), out.len());
                out.push(row);
            }
        }
    }
    out
}

/// `%term%` with LIKE wildcards escaped (`\` is the escape character).
pub(crate) fn like_pattern(search: &str) -> String {
    let mut escaped = String::with_capacity(search.len() + 2);
    escaped.push('%');
    for c in search.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// Confidence map as a JSON object, bound as a single query parameter.
pub(crate) fn confidence_json(confidences: &HashMap<String, i32>) -> String {
    serde_json::to_string(confidences).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_keeps_last_row_in_first_position() {
        let rows = vec![
            NewIndicator {
                value: "1.1.1.1".into(),
                indicator_type: IndicatorType::Ip,
                country: None,
            },
            NewIndicator {
                value: "bad.com".into(),
                indicator_type: IndicatorType::Domain,
                country: None,
            },
            NewIndicator {
                value: "1.1.1.1".into(),
                indicator_type: IndicatorType::Ip,
                country: Some("AU".into()),
            },
        ];
        let deduped = dedupe_rows(&rows);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].country.as_deref(), Some("AU"));
        assert_eq!(deduped[1].value, "bad.com");
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("bad_%"), r"%bad\_\%%");
    }

    #[tokio::test]
    async fn rejects_unknown_scheme() {
        assert!(matches!(
            create_store("mysql://localhost/db").await,
            Err(StoreError::Configuration(_))
        ));
    }
}
