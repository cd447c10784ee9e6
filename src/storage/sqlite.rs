//! SQLite backend. SQLite allows one writer at a time, so every write takes
//! a process-wide async lock before opening its transaction. Reads go
//! straight to the pool.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::models::{
    BlocklistEntry, CountryCount, DnsCacheEntry, Indicator, IndicatorFilter, IndicatorSource,
    IndicatorType, JobOutcome, JobRecord, NewIndicator, PaginatedResponse, SourceCount,
    StatsSnapshot, WhitelistEntry, DEFAULT_CONFIDENCE, DEFAULT_RISK_SCORE, SOURCE_BONUS,
};
use crate::storage::{
    confidence_json, dedupe_rows, like_pattern, IndicatorStore, RetentionReport, TypeCounts,
};

/// Rows per INSERT statement, well below SQLite's bind-variable limit.
const ROWS_PER_STATEMENT: usize = 500;

const SELECT_INDICATORS: &str =
    "SELECT value, type AS indicator_type, country, risk_score, source_count, last_seen FROM indicators";

pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteStore {
    /// Connect to a file database, creating it if needed.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        tracing::info!(url = %database_url, "Connected to SQLite store");
        Ok(Self::from_pool(pool))
    }

    /// Private in-memory database, already migrated.
    ///
    /// Backed by a single connection that is never recycled, so the data
    /// lives as long as the store.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &IndicatorFilter) {
    qb.push(" WHERE 1=1");
    if let Some(ty) = filter.indicator_type {
        qb.push(" AND type = ").push_bind(ty.as_str());
    }
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        qb.push(" AND value LIKE ")
            .push_bind(like_pattern(search))
            .push(" ESCAPE '\\'");
    }
    if let Some(min) = filter.min_risk_score {
        qb.push(" AND risk_score >= ").push_bind(min);
    }
    push_source_filter(qb, &filter.source_names());
}

fn push_source_filter(qb: &mut QueryBuilder<'_, Sqlite>, sources: &[String]) {
    if sources.is_empty() {
        return;
    }
    qb.push(" AND value IN (SELECT indicator_value FROM indicator_sources WHERE source_name IN (");
    let mut separated = qb.separated(", ");
    for source in sources {
        separated.push_bind(source.clone());
    }
    qb.push("))");
}

#[async_trait]
impl IndicatorStore for SqliteStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        tracing::info!("Running SQLite migrations");
        sqlx::migrate!("./migrations/sqlite").run(&self.pool).await?;
        Ok(())
    }

    async fn upsert_indicators(&self, source: &str, rows: &[NewIndicator]) -> Result<usize, StoreError> {
        let rows = dedupe_rows(rows);
        if rows.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO indicators (value, type, country, risk_score, source_count, last_seen) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.value.clone())
                    .push_bind(row.indicator_type.as_str())
                    .push_bind(row.country.clone())
                    .push_bind(DEFAULT_RISK_SCORE)
                    .push_bind(1_i32)
                    .push_bind(now);
            });
            qb.push(
                " ON CONFLICT(value) DO UPDATE SET \
                 last_seen = excluded.last_seen, \
                 type = excluded.type, \
                 country = COALESCE(NULLIF(excluded.country, ''), indicators.country)",
            );
            qb.build().execute(&mut *tx).await?;

            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO indicator_sources (indicator_value, source_name, last_seen) ");
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.value.clone())
                    .push_bind(source.to_string())
                    .push_bind(now);
            });
            qb.push(
                " ON CONFLICT(indicator_value, source_name) DO UPDATE SET last_seen = excluded.last_seen",
            );
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(rows.len())
    }

    async fn recalculate_scores(
        &self,
        confidences: &HashMap<String, i32>,
        target_source: Option<&str>,
    ) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            WITH conf(name, confidence) AS (SELECT key, value FROM json_each(?1)),
            agg AS (
                SELECT s.indicator_value AS ind,
                       COUNT(DISTINCT s.source_name) AS n,
                       MAX(COALESCE(conf.confidence, ?3)) AS max_conf
                FROM indicator_sources s
                LEFT JOIN conf ON conf.name = s.source_name
                WHERE ?2 IS NULL OR s.indicator_value IN (
                    SELECT indicator_value FROM indicator_sources WHERE source_name = ?2
                )
                GROUP BY s.indicator_value
            )
            UPDATE indicators
            SET source_count = agg.n,
                risk_score = MIN(100, agg.max_conf + ?4 * (agg.n - 1))
            FROM agg
            WHERE indicators.value = agg.ind
            "#,
        )
        .bind(confidence_json(confidences))
        .bind(target_source)
        .bind(DEFAULT_CONFIDENCE)
        .bind(SOURCE_BONUS)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn remove_expired(
        &self,
        retention_days: &HashMap<String, i64>,
        default_days: i64,
    ) -> Result<RetentionReport, StoreError> {
        let now = Utc::now();
        let mut report = RetentionReport::default();

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        for (source, days) in retention_days {
            let cutoff = now - Duration::days(*days);
            report.links_removed += sqlx::query(
                "DELETE FROM indicator_sources WHERE source_name = ? AND last_seen < ?",
            )
            .bind(source)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        let known: Vec<&String> = retention_days.keys().collect();
        let known = serde_json::to_string(&known).unwrap_or_else(|_| "[]".to_string());
        report.links_removed += sqlx::query(
            "DELETE FROM indicator_sources \
             WHERE source_name NOT IN (SELECT value FROM json_each(?)) AND last_seen < ?",
        )
        .bind(known)
        .bind(now - Duration::days(default_days))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        report.orphans_removed = sqlx::query(
            "DELETE FROM indicators WHERE NOT EXISTS \
             (SELECT 1 FROM indicator_sources s WHERE s.indicator_value = indicators.value)",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        report.dns_cache_removed = sqlx::query(
            "DELETE FROM dns_cache WHERE NOT EXISTS \
             (SELECT 1 FROM indicators i WHERE i.value = dns_cache.domain)",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(report)
    }

    async fn delete_indicators(&self, values: &[String]) -> Result<u64, StoreError> {
        if values.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;

        for chunk in values.chunks(ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM indicator_sources WHERE indicator_value IN (");
            let mut separated = qb.separated(", ");
            for value in chunk {
                separated.push_bind(value.clone());
            }
            qb.push(")");
            qb.build().execute(&mut *tx).await?;

            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM indicators WHERE value IN (");
            let mut separated = qb.separated(", ");
            for value in chunk {
                separated.push_bind(value.clone());
            }
            qb.push(")");
            deleted += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(deleted)
    }

    fn stream_indicators(&self) -> BoxStream<'_, Result<Indicator, StoreError>> {
        sqlx::query_as::<_, Indicator>(SELECT_INDICATORS)
            .fetch(&self.pool)
            .map_err(StoreError::from)
            .boxed()
    }

    async fn get_indicator(&self, value: &str) -> Result<Option<Indicator>, StoreError> {
        let indicator = sqlx::query_as::<_, Indicator>(&format!("{SELECT_INDICATORS} WHERE value = ?"))
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(indicator)
    }

    async fn indicator_values_of_type(&self, indicator_type: IndicatorType) -> Result<Vec<String>, StoreError> {
        let values = sqlx::query_scalar::<_, String>("SELECT value FROM indicators WHERE type = ?")
            .bind(indicator_type.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(values)
    }

    async fn query_indicators(&self, filter: &IndicatorFilter) -> Result<PaginatedResponse<Indicator>, StoreError> {
        let page = filter.page();
        let per_page = filter.per_page();

        let mut count_qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*) FROM indicators");
        push_filters(&mut count_qb, filter);
        let total = count_qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_INDICATORS);
        push_filters(&mut qb, filter);
        qb.push(" ORDER BY last_seen DESC, value LIMIT ")
            .push_bind(per_page)
            .push(" OFFSET ")
            .push_bind((page - 1) * per_page);
        let data = qb.build_query_as::<Indicator>().fetch_all(&self.pool).await?;

        Ok(PaginatedResponse::new(data, total, page, per_page))
    }

    async fn export_indicators(
        &self,
        types: &[IndicatorType],
        sources: &[String],
    ) -> Result<Vec<Indicator>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_INDICATORS);
        qb.push(" WHERE 1=1");
        if !types.is_empty() {
            qb.push(" AND type IN (");
            let mut separated = qb.separated(", ");
            for ty in types {
                separated.push_bind(ty.as_str());
            }
            qb.push(")");
        }
        push_source_filter(&mut qb, sources);
        qb.push(" ORDER BY risk_score DESC, value");
        Ok(qb.build_query_as::<Indicator>().fetch_all(&self.pool).await?)
    }

    async fn sources_for_indicator(&self, value: &str) -> Result<Vec<IndicatorSource>, StoreError> {
        let sources = sqlx::query_as::<_, IndicatorSource>(
            "SELECT indicator_value, source_name, last_seen FROM indicator_sources \
             WHERE indicator_value = ? ORDER BY source_name",
        )
        .bind(value)
        .fetch_all(&self.pool)
        .await?;
        Ok(sources)
    }

    async fn source_counts(&self) -> Result<Vec<SourceCount>, StoreError> {
        let counts = sqlx::query_as::<_, SourceCount>(
            "SELECT source_name, COUNT(*) AS count FROM indicator_sources \
             GROUP BY source_name ORDER BY count DESC, source_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(counts)
    }

    async fn counts_by_type(&self) -> Result<TypeCounts, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>("SELECT type, COUNT(*) FROM indicators GROUP BY type")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = TypeCounts::default();
        for (ty, count) in rows {
            counts.add(&ty, count);
        }
        Ok(counts)
    }

    async fn country_stats(&self, limit: i64) -> Result<Vec<CountryCount>, StoreError> {
        let stats = sqlx::query_as::<_, CountryCount>(
            "SELECT country, COUNT(*) AS count FROM indicators \
             WHERE type = 'ip' AND country IS NOT NULL AND country <> '' \
             GROUP BY country ORDER BY count DESC, country LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(stats)
    }

    async fn add_whitelist(
        &self,
        item: &str,
        indicator_type: IndicatorType,
        description: Option<&str>,
    ) -> Result<WhitelistEntry, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let entry = sqlx::query_as::<_, WhitelistEntry>(
            "INSERT INTO whitelist (item, type, description, added_at) VALUES (?, ?, ?, ?) \
             RETURNING id, item, type AS indicator_type, description, added_at",
        )
        .bind(item.trim())
        .bind(indicator_type.as_str())
        .bind(description)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(entry)
    }

    async fn list_whitelist(&self) -> Result<Vec<WhitelistEntry>, StoreError> {
        let entries = sqlx::query_as::<_, WhitelistEntry>(
            "SELECT id, item, type AS indicator_type, description, added_at FROM whitelist ORDER BY added_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn remove_whitelist(&self, id: i64) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM whitelist WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_blocklist(
        &self,
        item: &str,
        indicator_type: IndicatorType,
        comment: Option<&str>,
    ) -> Result<BlocklistEntry, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let entry = sqlx::query_as::<_, BlocklistEntry>(
            "INSERT INTO manual_blocklist (item, type, comment, added_at) VALUES (?, ?, ?, ?) \
             RETURNING id, item, type AS indicator_type, comment, added_at",
        )
        .bind(item.trim())
        .bind(indicator_type.as_str())
        .bind(comment)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(entry)
    }

    async fn list_blocklist(&self) -> Result<Vec<BlocklistEntry>, StoreError> {
        let entries = sqlx::query_as::<_, BlocklistEntry>(
            "SELECT id, item, type AS indicator_type, comment, added_at FROM manual_blocklist ORDER BY added_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn remove_blocklist(&self, id: i64) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM manual_blocklist WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn domains_for_resolution(
        &self,
        limit: i64,
        resolved_before: DateTime<Utc>,
    ) -> Result<Vec<(String, IndicatorType)>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT i.value, i.type FROM indicators i \
             LEFT JOIN dns_cache d ON d.domain = i.value \
             WHERE i.type IN ('domain', 'url') \
               AND (d.domain IS NULL OR d.last_resolved < ?) \
             ORDER BY d.domain IS NOT NULL, d.last_resolved, i.value \
             LIMIT ?",
        )
        .bind(resolved_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(value, ty)| {
                let ty = ty
                    .parse::<IndicatorType>()
                    .map_err(|e| StoreError::InvalidValue(e.to_string()))?;
                Ok((value, ty))
            })
            .collect()
    }

    async fn upsert_dns_cache(&self, domain: &str, resolved_ips: &[String]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO dns_cache (domain, resolved_ips, last_resolved) VALUES (?, ?, ?) \
             ON CONFLICT(domain) DO UPDATE SET \
             resolved_ips = excluded.resolved_ips, last_resolved = excluded.last_resolved",
        )
        .bind(domain)
        .bind(resolved_ips.join(","))
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    fn stream_dns_cache(&self) -> BoxStream<'_, Result<DnsCacheEntry, StoreError>> {
        sqlx::query_as::<_, DnsCacheEntry>(
            "SELECT domain, resolved_ips, last_resolved FROM dns_cache ORDER BY domain",
        )
        .fetch(&self.pool)
        .map_err(StoreError::from)
        .boxed()
    }

    async fn job_started(&self, source: &str) -> Result<i64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO job_history (source_name, start_time, status, items_processed) \
             VALUES (?, ?, ?, 0) RETURNING id",
        )
        .bind(source)
        .bind(Utc::now())
        .bind(JobOutcome::Running.as_str())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn job_finished(
        &self,
        id: i64,
        outcome: JobOutcome,
        items_processed: i64,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE job_history SET end_time = ?, status = ?, items_processed = ?, message = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(outcome.as_str())
        .bind(items_processed)
        .bind(message)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn job_history(&self, limit: i64) -> Result<Vec<JobRecord>, StoreError> {
        let records = sqlx::query_as::<_, JobRecord>(
            "SELECT id, source_name, start_time, end_time, status, items_processed, message \
             FROM job_history ORDER BY start_time DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn clear_job_history(&self) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM job_history").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn save_stats_snapshot(&self) -> Result<StatsSnapshot, StoreError> {
        let counts = self.counts_by_type().await?;
        let snapshot = StatsSnapshot {
            timestamp: Utc::now(),
            total_indicators: counts.total(),
            ip_count: counts.ip + counts.cidr,
            domain_count: counts.domain,
            url_count: counts.url,
        };

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO stats_history (timestamp, total_indicators, ip_count, domain_count, url_count) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(snapshot.timestamp)
        .bind(snapshot.total_indicators)
        .bind(snapshot.ip_count)
        .bind(snapshot.domain_count)
        .bind(snapshot.url_count)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(snapshot)
    }

    async fn stats_history(&self, since: DateTime<Utc>) -> Result<Vec<StatsSnapshot>, StoreError> {
        let history = sqlx::query_as::<_, StatsSnapshot>(
            "SELECT timestamp, total_indicators, ip_count, domain_count, url_count \
             FROM stats_history WHERE timestamp >= ? ORDER BY timestamp",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn row(value: &str, ty: IndicatorType, country: Option<&str>) -> NewIndicator {
        NewIndicator {
            value: value.to_string(),
            indicator_type: ty,
            country: country.map(str::to_string),
        }
    }

    fn confidences(pairs: &[(&str, i32)]) -> HashMap<String, i32> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    async fn store() -> SqliteStore {
        SqliteStore::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn upsert_inserts_with_defaults_and_links_source() {
        let store = store().await;
        let written = store
            .upsert_indicators(
                "Feed A",
                &[
                    row("1.1.1.1", IndicatorType::Ip, Some("AU")),
                    row("bad.com", IndicatorType::Domain, None),
                    row("1.1.1.1", IndicatorType::Ip, Some("AU")),
                ],
            )
            .await
            .unwrap();
        assert_eq!(written, 2);

        let ip = store.get_indicator("1.1.1.1").await.unwrap().unwrap();
        assert_eq!(ip.indicator_type, IndicatorType::Ip);
        assert_eq!(ip.country.as_deref(), Some("AU"));
        assert_eq!(ip.risk_score, DEFAULT_RISK_SCORE);
        assert_eq!(ip.source_count, 1);

        let links = store.sources_for_indicator("1.1.1.1").await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].source_name, "Feed A");
    }

    #[tokio::test]
    async fn resighting_keeps_country_when_new_one_is_empty() {
        let store = store().await;
        store
            .upsert_indicators("A", &[row("8.8.8.8", IndicatorType::Ip, Some("US"))])
            .await
            .unwrap();
        store
            .upsert_indicators("B", &[row("8.8.8.8", IndicatorType::Ip, None)])
            .await
            .unwrap();
        store
            .upsert_indicators("C", &[row("8.8.8.8", IndicatorType::Ip, Some(""))])
            .await
            .unwrap();
        let ip = store.get_indicator("8.8.8.8").await.unwrap().unwrap();
        assert_eq!(ip.country.as_deref(), Some("US"));
        assert_eq!(store.sources_for_indicator("8.8.8.8").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn scores_follow_max_confidence_and_source_count() {
        let store = store().await;
        store
            .upsert_indicators("Strong", &[row("1.2.3.4", IndicatorType::Ip, None)])
            .await
            .unwrap();
        store
            .upsert_indicators(
                "Weak",
                &[
                    row("1.2.3.4", IndicatorType::Ip, None),
                    row("5.6.7.8", IndicatorType::Ip, None),
                ],
            )
            .await
            .unwrap();

        let map = confidences(&[("Strong", 90), ("Weak", 10)]);
        store.recalculate_scores(&map, None).await.unwrap();

        let shared = store.get_indicator("1.2.3.4").await.unwrap().unwrap();
        assert_eq!((shared.risk_score, shared.source_count), (95, 2));
        let single = store.get_indicator("5.6.7.8").await.unwrap().unwrap();
        assert_eq!((single.risk_score, single.source_count), (10, 1));

        store.recalculate_scores(&map, None).await.unwrap();
        let again = store.get_indicator("1.2.3.4").await.unwrap().unwrap();
        assert_eq!((again.risk_score, again.source_count), (95, 2));
    }

    #[tokio::test]
    async fn unknown_sources_score_with_default_confidence() {
        let store = store().await;
        store
            .upsert_indicators("Unlisted", &[row("9.9.9.9", IndicatorType::Ip, None)])
            .await
            .unwrap();
        store.recalculate_scores(&HashMap::new(), None).await.unwrap();
        let ip = store.get_indicator("9.9.9.9").await.unwrap().unwrap();
        assert_eq!(ip.risk_score, DEFAULT_CONFIDENCE);
    }

    #[tokio::test]
    async fn scoped_recalculation_only_touches_target_source() {
        let store = store().await;
        store
            .upsert_indicators("A", &[row("1.1.1.1", IndicatorType::Ip, None)])
            .await
            .unwrap();
        store
            .upsert_indicators("B", &[row("2.2.2.2", IndicatorType::Ip, None)])
            .await
            .unwrap();
        let map = confidences(&[("A", 80), ("B", 20)]);
        let touched = store.recalculate_scores(&map, Some("A")).await.unwrap();
        assert_eq!(touched, 1);
        assert_eq!(store.get_indicator("1.1.1.1").await.unwrap().unwrap().risk_score, 80);
        assert_eq!(
            store.get_indicator("2.2.2.2").await.unwrap().unwrap().risk_score,
            DEFAULT_RISK_SCORE
        );
    }

    #[tokio::test]
    async fn retention_purges_orphans_but_keeps_shared_indicators() {
        let store = store().await;
        store
            .upsert_indicators(
                "Short",
                &[
                    row("1.1.1.1", IndicatorType::Ip, None),
                    row("2.2.2.2", IndicatorType::Ip, None),
                ],
            )
            .await
            .unwrap();
        store
            .upsert_indicators("Long", &[row("2.2.2.2", IndicatorType::Ip, None)])
            .await
            .unwrap();
        store.upsert_dns_cache("1.1.1.1", &[]).await.unwrap();

        // Negative retention puts the cutoff in the future, expiring every link.
        let retention = HashMap::from([("Short".to_string(), -1), ("Long".to_string(), 30)]);
        let report = store.remove_expired(&retention, 30).await.unwrap();

        assert_eq!(report.links_removed, 2);
        assert_eq!(report.orphans_removed, 1);
        assert_eq!(report.dns_cache_removed, 1);
        assert!(store.get_indicator("1.1.1.1").await.unwrap().is_none());
        assert!(store.get_indicator("2.2.2.2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unconfigured_sources_use_default_lifetime() {
        let store = store().await;
        store
            .upsert_indicators("Removed Feed", &[row("3.3.3.3", IndicatorType::Ip, None)])
            .await
            .unwrap();
        let report = store.remove_expired(&HashMap::new(), -1).await.unwrap();
        assert_eq!(report.orphans_removed, 1);
    }

    #[tokio::test]
    async fn delete_removes_rows_and_links() {
        let store = store().await;
        store
            .upsert_indicators(
                "A",
                &[
                    row("bad.com", IndicatorType::Domain, None),
                    row("good.com", IndicatorType::Domain, None),
                ],
            )
            .await
            .unwrap();
        let deleted = store.delete_indicators(&["bad.com".to_string()]).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.sources_for_indicator("bad.com").await.unwrap().is_empty());
        let remaining: Vec<Indicator> = store.stream_indicators().try_collect().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].value, "good.com");
    }

    #[tokio::test]
    async fn query_paginates_and_filters() {
        let store = store().await;
        let rows: Vec<NewIndicator> = (0..25)
            .map(|i| row(&format!("10.0.0.{i}"), IndicatorType::Ip, None))
            .chain([row("bad_site.com", IndicatorType::Domain, None)])
            .collect();
        store.upsert_indicators("A", &rows).await.unwrap();
        store
            .upsert_indicators("B", &[row("badXsite.com", IndicatorType::Domain, None)])
            .await
            .unwrap();

        let page = store
            .query_indicators(&IndicatorFilter {
                indicator_type: Some(IndicatorType::Ip),
                page: Some(3),
                per_page: Some(10),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 25);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.data.len(), 5);

        // `_` is matched literally
        let search = store
            .query_indicators(&IndicatorFilter {
                search: Some("bad_".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(search.total, 1);
        assert_eq!(search.data[0].value, "bad_site.com");

        let by_source = store
            .query_indicators(&IndicatorFilter {
                sources: Some("B".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_source.total, 1);
    }

    #[tokio::test]
    async fn whitelist_items_are_unique() {
        let store = store().await;
        let entry = store
            .add_whitelist("8.8.8.8", IndicatorType::Ip, Some("resolver"))
            .await
            .unwrap();
        assert_eq!(entry.item, "8.8.8.8");
        assert!(matches!(
            store.add_whitelist("8.8.8.8", IndicatorType::Ip, None).await,
            Err(StoreError::Constraint(_))
        ));
        assert_eq!(store.list_whitelist().await.unwrap().len(), 1);
        assert!(store.remove_whitelist(entry.id).await.unwrap());
        assert!(!store.remove_whitelist(entry.id).await.unwrap());
    }

    #[tokio::test]
    async fn dns_candidates_skip_fresh_cache_entries() {
        let store = store().await;
        store
            .upsert_indicators(
                "A",
                &[
                    row("fresh.com", IndicatorType::Domain, None),
                    row("new.com", IndicatorType::Domain, None),
                    row("http://x.org/a", IndicatorType::Url, None),
                    row("1.1.1.1", IndicatorType::Ip, None),
                ],
            )
            .await
            .unwrap();
        store
            .upsert_dns_cache("fresh.com", &["1.1.1.1".to_string()])
            .await
            .unwrap();

        let due = store
            .domains_for_resolution(50, Utc::now() - Duration::days(7))
            .await
            .unwrap();
        let values: Vec<_> = due.iter().map(|(v, _)| v.as_str()).collect();
        assert_eq!(values, vec!["http://x.org/a", "new.com"]);

        let cached: Vec<DnsCacheEntry> = store.stream_dns_cache().try_collect().await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].resolved().collect::<Vec<_>>(), vec!["1.1.1.1"]);
    }

    #[tokio::test]
    async fn job_history_lifecycle() {
        let store = store().await;
        let id = store.job_started("Feed A").await.unwrap();
        store
            .job_finished(id, JobOutcome::Warning, 0, Some("No data"))
            .await
            .unwrap();
        let history = store.job_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, JobOutcome::Warning);
        assert!(history[0].end_time.is_some());
        assert_eq!(store.clear_job_history().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stats_snapshot_counts_cidrs_as_ips() {
        let store = store().await;
        store
            .upsert_indicators(
                "A",
                &[
                    row("1.1.1.1", IndicatorType::Ip, Some("AU")),
                    row("10.0.0.0/8", IndicatorType::Cidr, None),
                    row("bad.com", IndicatorType::Domain, None),
                ],
            )
            .await
            .unwrap();
        let snapshot = store.save_stats_snapshot().await.unwrap();
        assert_eq!(snapshot.total_indicators, 3);
        assert_eq!(snapshot.ip_count, 2);
        assert_eq!(snapshot.domain_count, 1);

        let history = store.stats_history(Utc::now() - Duration::days(1)).await.unwrap();
        assert_eq!(history.len(), 1);

        let countries = store.country_stats(10).await.unwrap();
        assert_eq!(countries.len(), 1);
        assert_eq!(countries[0].country, "AU");
    }
}
