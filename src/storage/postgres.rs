//! PostgreSQL backend. Writers rely on the engine's own row locking:
//! every write is one transaction built from `ON CONFLICT` upserts with
//! array (`UNNEST`/`ANY`) binds.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;

use crate::error::StoreError;
use crate::models::{
    BlocklistEntry, CountryCount, DnsCacheEntry, Indicator, IndicatorFilter, IndicatorSource,
    IndicatorType, JobOutcome, JobRecord, NewIndicator, PaginatedResponse, SourceCount,
    StatsSnapshot, WhitelistEntry, DEFAULT_CONFIDENCE, DEFAULT_RISK_SCORE, SOURCE_BONUS,
};
use crate::storage::{
    confidence_json, dedupe_rows, like_pattern, IndicatorStore, RetentionReport, TypeCounts,
};

const SELECT_INDICATORS: &str =
    "SELECT value, type AS indicator_type, country, risk_score, source_count, last_seen FROM indicators";

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await?;

        tracing::info!("Connected to PostgreSQL store");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &IndicatorFilter) {
    qb.push(" WHERE 1=1");
    if let Some(ty) = filter.indicator_type {
        qb.push(" AND type = ").push_bind(ty.as_str());
    }
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        qb.push(" AND value ILIKE ")
            .push_bind(like_pattern(search))
            .push(" ESCAPE '\\'");
    }
    if let Some(min) = filter.min_risk_score {
        qb.push(" AND risk_score >= ").push_bind(min);
    }
    push_source_filter(qb, filter.source_names());
}

fn push_source_filter(qb: &mut QueryBuilder<'_, Postgres>, sources: Vec<String>) {
    if sources.is_empty() {
        return;
    }
    qb.push(" AND value IN (SELECT indicator_value FROM indicator_sources WHERE source_name = ANY(")
        .push_bind(sources)
        .push("))");
}

#[async_trait]
impl IndicatorStore for PostgresStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        tracing::info!("Running PostgreSQL migrations");
        sqlx::migrate!("./migrations/postgres").run(&self.pool).await?;
        Ok(())
    }

    async fn upsert_indicators(&self, source: &str, rows: &[NewIndicator]) -> Result<usize, StoreError> {
        let rows = dedupe_rows(rows);
        if rows.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();

        let values: Vec<String> = rows.iter().map(|r| r.value.clone()).collect();
        let types: Vec<String> = rows.iter().map(|r| r.indicator_type.as_str().to_string()).collect();
        let countries: Vec<Option<String>> = rows.iter().map(|r| r.country.clone()).collect();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO indicators (value, type, country, risk_score, source_count, last_seen)
            SELECT v, t, c, $4, 1, $5
            FROM UNNEST($1::text[], $2::text[], $3::text[]) AS u(v, t, c)
            ON CONFLICT (value) DO UPDATE SET
                last_seen = EXCLUDED.last_seen,
                type = EXCLUDED.type,
                country = COALESCE(NULLIF(EXCLUDED.country, ''), indicators.country)
            "#,
        )
        .bind(&values)
        .bind(&types)
        .bind(&countries)
        .bind(DEFAULT_RISK_SCORE)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO indicator_sources (indicator_value, source_name, last_seen)
            SELECT v, $2, $3 FROM UNNEST($1::text[]) AS u(v)
            ON CONFLICT (indicator_value, source_name) DO UPDATE SET last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(&values)
        .bind(source)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(values.len())
    }

    async fn recalculate_scores(
        &self,
        confidences: &HashMap<String, i32>,
        target_source: Option<&str>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            WITH conf AS (
                SELECT key AS name, value::int AS confidence FROM jsonb_each_text($1::jsonb)
            ),
            agg AS (
                SELECT s.indicator_value AS ind,
                       COUNT(DISTINCT s.source_name)::int AS n,
                       MAX(COALESCE(conf.confidence, $3))::int AS max_conf
                FROM indicator_sources s
                LEFT JOIN conf ON conf.name = s.source_name
                WHERE $2::text IS NULL OR s.indicator_value IN (
                    SELECT indicator_value FROM indicator_sources WHERE source_name = $2
                )
                GROUP BY s.indicator_value
            )
            UPDATE indicators
            SET source_count = agg.n,
                risk_score = LEAST(100, agg.max_conf + $4 * (agg.n - 1))
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
        let mut tx = self.pool.begin().await?;

        for (source, days) in retention_days {
            report.links_removed += sqlx::query(
                "DELETE FROM indicator_sources WHERE source_name = $1 AND last_seen < $2",
            )
            .bind(source)
            .bind(now - Duration::days(*days))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        let known: Vec<String> = retention_days.keys().cloned().collect();
        report.links_removed += sqlx::query(
            "DELETE FROM indicator_sources WHERE source_name <> ALL($1::text[]) AND last_seen < $2",
        )
        .bind(&known)
        .bind(now - Duration::days(default_days))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        report.orphans_removed = sqlx::query(
            "DELETE FROM indicators i WHERE NOT EXISTS \
             (SELECT 1 FROM indicator_sources s WHERE s.indicator_value = i.value)",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        report.dns_cache_removed = sqlx::query(
            "DELETE FROM dns_cache d WHERE NOT EXISTS \
             (SELECT 1 FROM indicators i WHERE i.value = d.domain)",
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
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM indicator_sources WHERE indicator_value = ANY($1::text[])")
            .bind(values)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM indicators WHERE value = ANY($1::text[])")
            .bind(values)
            .execute(&mut *tx)
            .await?
            .rows_affected();
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
        let indicator = sqlx::query_as::<_, Indicator>(&format!("{SELECT_INDICATORS} WHERE value = $1"))
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(indicator)
    }

    async fn indicator_values_of_type(&self, indicator_type: IndicatorType) -> Result<Vec<String>, StoreError> {
        let values = sqlx::query_scalar::<_, String>("SELECT value FROM indicators WHERE type = $1")
            .bind(indicator_type.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(values)
    }

    async fn query_indicators(&self, filter: &IndicatorFilter) -> Result<PaginatedResponse<Indicator>, StoreError> {
        let page = filter.page();
        let per_page = filter.per_page();

        let mut count_qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM indicators");
        push_filters(&mut count_qb, filter);
        let total = count_qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_INDICATORS);
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
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_INDICATORS);
        qb.push(" WHERE 1=1");
        if !types.is_empty() {
            let types: Vec<String> = types.iter().map(|t| t.as_str().to_string()).collect();
            qb.push(" AND type = ANY(").push_bind(types).push(")");
        }
        push_source_filter(&mut qb, sources.to_vec());
        qb.push(" ORDER BY risk_score DESC, value");
        Ok(qb.build_query_as::<Indicator>().fetch_all(&self.pool).await?)
    }

    async fn sources_for_indicator(&self, value: &str) -> Result<Vec<IndicatorSource>, StoreError> {
        let sources = sqlx::query_as::<_, IndicatorSource>(
            "SELECT indicator_value, source_name, last_seen FROM indicator_sources \
             WHERE indicator_value = $1 ORDER BY source_name",
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
             GROUP BY country ORDER BY count DESC, country LIMIT $1",
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
        let entry = sqlx::query_as::<_, WhitelistEntry>(
            "INSERT INTO whitelist (item, type, description, added_at) VALUES ($1, $2, $3, $4) \
             RETURNING id, item, type AS indicator_type, description, added_at",
        )
        .bind(item.trim())
        .bind(indicator_type.as_str())
        .bind(description)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
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
        let result = sqlx::query("DELETE FROM whitelist WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_blocklist(
        &self,
        item: &str,
        indicator_type: IndicatorType,
        comment: Option<&str>,
    ) -> Result<BlocklistEntry, StoreError> {
        let entry = sqlx::query_as::<_, BlocklistEntry>(
            "INSERT INTO manual_blocklist (item, type, comment, added_at) VALUES ($1, $2, $3, $4) \
             RETURNING id, item, type AS indicator_type, comment, added_at",
        )
        .bind(item.trim())
        .bind(indicator_type.as_str())
        .bind(comment)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
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
        let result = sqlx::query("DELETE FROM manual_blocklist WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
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
               AND (d.domain IS NULL OR d.last_resolved < $1) \
             ORDER BY d.domain IS NOT NULL, d.last_resolved, i.value \
             LIMIT $2",
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
        sqlx::query(
            "INSERT INTO dns_cache (domain, resolved_ips, last_resolved) VALUES ($1, $2, $3) \
             ON CONFLICT (domain) DO UPDATE SET \
             resolved_ips = EXCLUDED.resolved_ips, last_resolved = EXCLUDED.last_resolved",
        )
        .bind(domain)
        .bind(resolved_ips.join(","))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
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
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO job_history (source_name, start_time, status, items_processed) \
             VALUES ($1, $2, $3, 0) RETURNING id",
        )
        .bind(source)
        .bind(Utc::now())
        .bind(JobOutcome::Running.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn job_finished(
        &self,
        id: i64,
        outcome: JobOutcome,
        items_processed: i64,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE job_history SET end_time = $1, status = $2, items_processed = $3, message = $4 WHERE id = $5",
        )
        .bind(Utc::now())
        .bind(outcome.as_str())
        .bind(items_processed)
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job_history(&self, limit: i64) -> Result<Vec<JobRecord>, StoreError> {
        let records = sqlx::query_as::<_, JobRecord>(
            "SELECT id, source_name, start_time, end_time, status, items_processed, message \
             FROM job_history ORDER BY start_time DESC, id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn clear_job_history(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM job_history").execute(&self.pool).await?;
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
        sqlx::query(
            "INSERT INTO stats_history (timestamp, total_indicators, ip_count, domain_count, url_count) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(snapshot.timestamp)
        .bind(snapshot.total_indicators)
        .bind(snapshot.ip_count)
        .bind(snapshot.domain_count)
        .bind(snapshot.url_count)
        .execute(&self.pool)
        .await?;
        Ok(snapshot)
    }

    async fn stats_history(&self, since: DateTime<Utc>) -> Result<Vec<StatsSnapshot>, StoreError> {
        let history = sqlx::query_as::<_, StatsSnapshot>(
            "SELECT timestamp, total_indicators, ip_count, domain_count, url_count \
             FROM stats_history WHERE timestamp >= $1 ORDER BY timestamp",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(history)
    }
}
