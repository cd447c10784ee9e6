//! Per-source ingestion state machine and multi-source orchestration.
//!
//! Fetch and parse run concurrently across sources, bounded by
//! `max_concurrent_sources`. Rows are handed to the [`WriteQueue`], which
//! applies them to the store one request at a time.

pub mod jobs;
pub mod writer;

use chrono::Utc;
use futures::{stream, StreamExt, TryStreamExt};
use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

use crate::collectors::{parse, FeedFetcher};
use crate::config::{AppConfig, SourceConfig};
use crate::enrichment::{enrich_countries, CountryLookup, NoopCountryLookup};
use crate::error::{FetchError, ParseError, PipelineError};
use crate::export::{EdlReport, EdlWriter};
use crate::models::{JobOutcome, NewIndicator, SourceResult, StatsSnapshot};
use crate::storage::{with_retry, IndicatorStore, RetentionReport, RetryPolicy};
use crate::whitelist::{WhitelistEngine, WhitelistSnapshot};

pub use jobs::{JobState, JobStatus, JobTracker, RunGuard, SourceGuard};
pub use writer::{SaveOutcome, WriteQueue};

/// Values per delete statement in the whitelist sweep.
const DELETE_CHUNK: usize = 1000;
/// Indicators shown by a feed dry run.
const SAMPLE_SIZE: usize = 5;

/// Outcome of one source within a full run.
#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub source: String,
    pub succeeded: bool,
    /// Another task was already processing the source.
    pub skipped: bool,
    pub count: usize,
    pub message: Option<String>,
}

/// Counts from the shared end-of-run pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub retention: RetentionReport,
    pub whitelist_removed: u64,
    pub rescored: u64,
    pub stats: Option<StatsSnapshot>,
    pub edl: EdlReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcomes: Vec<SourceOutcome>,
    /// `None` when the maintenance pass failed; see `maintenance_error`.
    pub maintenance: Option<MaintenanceReport>,
    pub maintenance_error: Option<String>,
}

impl RunReport {
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.succeeded && !o.skipped).count()
    }
}

/// Result of a dry run against a feed.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FeedTestReport {
    pub valid_count: usize,
    pub sample: Vec<String>,
}

/// Rows ready to persist plus what was dropped on the way.
#[derive(Debug, Default)]
struct Prepared {
    rows: Vec<NewIndicator>,
    tokens: usize,
    unknown: usize,
    whitelisted: usize,
    duplicates: usize,
    enriched: usize,
}

struct StageOutcome {
    count: usize,
    fetch_duration: Duration,
    status: JobOutcome,
    message: Option<String>,
}

pub struct Pipeline {
    store: Arc<dyn IndicatorStore>,
    fetcher: Arc<dyn FeedFetcher>,
    whitelist: Arc<WhitelistEngine>,
    geoip: Arc<dyn CountryLookup>,
    jobs: Arc<JobTracker>,
    writer: WriteQueue,
    retry: RetryPolicy,
    config: Arc<RwLock<AppConfig>>,
    config_path: Option<PathBuf>,
    edl: EdlWriter,
}

impl Pipeline {
    /// Build the pipeline and spawn its writer task.
    pub fn new(
        store: Arc<dyn IndicatorStore>,
        fetcher: Arc<dyn FeedFetcher>,
        whitelist: Arc<WhitelistEngine>,
        config: Arc<RwLock<AppConfig>>,
        edl: EdlWriter,
    ) -> Self {
        let retry = RetryPolicy::default();
        let batch_size = config.read().batch_size;
        Self {
            writer: WriteQueue::spawn(store.clone(), batch_size, retry),
            store,
            fetcher,
            whitelist,
            geoip: Arc::new(NoopCountryLookup),
            jobs: Arc::new(JobTracker::new()),
            retry,
            config,
            config_path: None,
            edl,
        }
    }

    /// Persist settings changes to this file.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_country_lookup(mut self, lookup: Arc<dyn CountryLookup>) -> Self {
        self.geoip = lookup;
        self
    }

    /// Replace the write retry policy. Respawns the writer task.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        let batch_size = self.config.read().batch_size;
        self.writer = WriteQueue::spawn(self.store.clone(), batch_size, retry);
        self.retry = retry;
        self
    }

    pub fn jobs(&self) -> &Arc<JobTracker> {
        &self.jobs
    }

    pub fn store(&self) -> &Arc<dyn IndicatorStore> {
        &self.store
    }

    pub fn whitelist(&self) -> &Arc<WhitelistEngine> {
        &self.whitelist
    }

    pub fn edl(&self) -> &EdlWriter {
        &self.edl
    }

    pub fn config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Validate, persist and apply new settings. Passwords missing from
    /// `config` are carried over from the current settings. Schedules and
    /// the write batch size are read at startup.
    pub async fn update_config(&self, mut config: AppConfig) -> Result<AppConfig, PipelineError> {
        config.keep_secrets_from(&self.config.read());
        config.validate()?;
        if let Some(path) = self.config_path.clone() {
            let to_save = config.clone();
            tokio::task::spawn_blocking(move || to_save.save(&path))
                .await
                .map_err(|e| PipelineError::Task(e.to_string()))??;
        }
        *self.config.write() = config.clone();
        tracing::info!(sources = config.sources.len(), "Settings updated");
        Ok(config)
    }

    /// Run one source through every stage and close out its history row.
    /// Fails with [`PipelineError::SourceBusy`] while another task is
    /// processing the same source.
    pub async fn process_source(&self, source: &SourceConfig) -> Result<SourceResult, PipelineError> {
        let _claim = self
            .jobs
            .try_claim_source(&source.name)
            .ok_or_else(|| PipelineError::SourceBusy(source.name.clone()))?;
        let span = tracing::info_span!("source", source = %source.name);
        async {
            let job_id = self.store.job_started(&source.name).await?;
            match self.run_stages(source).await {
                Ok(stage) => {
                    self.store
                        .job_finished(job_id, stage.status, stage.count as i64, stage.message.as_deref())
                        .await?;
                    let detail = stage
                        .message
                        .clone()
                        .unwrap_or_else(|| format!("Saved {} indicators", stage.count));
                    self.jobs.update(&source.name, JobState::Completed, detail);
                    counter!("feedforge_indicators_ingested_total", "source" => source.name.clone())
                        .increment(stage.count as u64);
                    tracing::info!(
                        count = stage.count,
                        status = stage.status.as_str(),
                        fetch_secs = stage.fetch_duration.as_secs_f64(),
                        "Source completed"
                    );
                    Ok(SourceResult {
                        name: source.name.clone(),
                        count: stage.count,
                        fetch_duration_secs: stage.fetch_duration.as_secs_f64(),
                        completed_at: Utc::now(),
                    })
                }
                Err(e) => {
                    let message = e.to_string();
                    tracing::error!(error = %message, "Source failed");
                    self.jobs.update(&source.name, JobState::Failed, message.clone());
                    counter!("feedforge_source_failures_total", "source" => source.name.clone()).increment(1);
                    if let Err(store_err) = self
                        .store
                        .job_finished(job_id, JobOutcome::Failure, 0, Some(&message))
                        .await
                    {
                        tracing::warn!(error = %store_err, "Failed to close job history row");
                    }
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_stages(&self, source: &SourceConfig) -> Result<StageOutcome, PipelineError> {
        let name = source.name.as_str();

        self.jobs.update(name, JobState::Fetching, format!("Downloading {}", source.url));
        let started = Instant::now();
        let body = self.fetcher.fetch(source).await?;
        let fetch_duration = started.elapsed();
        let Some(body) = body else {
            tracing::warn!("Feed returned no data");
            return Ok(StageOutcome {
                count: 0,
                fetch_duration,
                status: JobOutcome::Warning,
                message: Some("No data received".to_string()),
            });
        };

        self.jobs.update(name, JobState::Parsing, format!("Parsing {} bytes", body.len()));
        let snapshot = self.whitelist.snapshot().await?;
        let prepared = {
            let source = source.clone();
            let lookup = self.geoip.clone();
            let jobs = self.jobs.clone();
            tokio::task::spawn_blocking(move || {
                prepare_rows(&body, &source, &snapshot, lookup.as_ref(), &jobs)
            })
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))?
        };
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::warn!(error = %e, "Feed payload could not be parsed");
                return Ok(StageOutcome {
                    count: 0,
                    fetch_duration,
                    status: JobOutcome::Warning,
                    message: Some(format!("Parse error: {e}")),
                });
            }
        };
        tracing::debug!(
            tokens = prepared.tokens,
            unknown = prepared.unknown,
            whitelisted = prepared.whitelisted,
            duplicates = prepared.duplicates,
            enriched = prepared.enriched,
            "Feed prepared"
        );

        self.jobs.update(name, JobState::Saving, format!("Saving {} indicators", prepared.rows.len()));
        let saved = self.writer.save(name, prepared.rows).await?;
        if saved.all_failed() {
            return Err(PipelineError::PersistFailed(saved.chunks));
        }

        let confidences = self.config.read().confidence_map();
        with_retry(self.retry, "recalculate_scores", || {
            self.store.recalculate_scores(&confidences, Some(name))
        })
        .await?;

        let (status, message) = if saved.failed_chunks > 0 {
            (
                JobOutcome::Warning,
                Some(format!(
                    "Saved {} indicators; skipped {} rows in {} failed batches",
                    saved.saved, saved.failed_rows, saved.failed_chunks
                )),
            )
        } else {
            (JobOutcome::Success, None)
        };
        Ok(StageOutcome {
            count: saved.saved,
            fetch_duration,
            status,
            message,
        })
    }

    /// Process every enabled source, then run the shared maintenance pass.
    /// Rejected while another full run is active.
    pub async fn run_all(&self) -> Result<RunReport, PipelineError> {
        let _guard = self.jobs.try_start_run().ok_or(PipelineError::AlreadyRunning)?;
        let run_id = Uuid::new_v4();
        let (sources, concurrency) = {
            let config = self.config.read();
            (config.enabled_sources(), config.max_concurrent_sources.max(1))
        };
        let span = tracing::info_span!("run", %run_id);
        async {
            tracing::info!(sources = sources.len(), concurrency, "Starting aggregation run");
            let outcomes: Vec<SourceOutcome> = stream::iter(sources)
                .map(|source| async move {
                    match self.process_source(&source).await {
                        Ok(result) => SourceOutcome {
                            source: source.name,
                            succeeded: true,
                            skipped: false,
                            count: result.count,
                            message: None,
                        },
                        Err(e) => SourceOutcome {
                            source: source.name,
                            succeeded: false,
                            skipped: matches!(e, PipelineError::SourceBusy(_)),
                            count: 0,
                            message: Some(e.to_string()),
                        },
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

            let (maintenance, maintenance_error) = match self.maintenance().await {
                Ok(report) => (Some(report), None),
                Err(e) => {
                    tracing::error!(error = %e, "Maintenance pass failed");
                    (None, Some(e.to_string()))
                }
            };
            let report = RunReport {
                run_id,
                outcomes,
                maintenance,
                maintenance_error,
            };
            tracing::info!(
                failed = report.failed(),
                total = report.outcomes.len(),
                "Aggregation run finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Process one configured source, then sweep whitelisted rows and
    /// refresh the block-lists.
    pub async fn process_single(&self, name: &str) -> Result<SourceResult, PipelineError> {
        let source = self
            .config
            .read()
            .source(name)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownSource(name.to_string()))?;
        let result = self.process_source(&source).await?;
        self.cleanup_whitelisted().await?;
        self.edl.regenerate(self.store.as_ref()).await?;
        Ok(result)
    }

    /// Retention, whitelist sweep, full rescoring, stats snapshot and EDL
    /// regeneration, in that order.
    pub async fn maintenance(&self) -> Result<MaintenanceReport, PipelineError> {
        let (retention_map, lifetime, confidences) = {
            let config = self.config.read();
            (config.retention_map(), config.indicator_lifetime_days, config.confidence_map())
        };

        let retention = with_retry(self.retry, "remove_expired", || {
            self.store.remove_expired(&retention_map, lifetime)
        })
        .await?;
        tracing::info!(
            links = retention.links_removed,
            orphans = retention.orphans_removed,
            dns_cache = retention.dns_cache_removed,
            "Retention cleanup finished"
        );

        let whitelist_removed = self.cleanup_whitelisted().await?;

        let rescored = with_retry(self.retry, "recalculate_scores", || {
            self.store.recalculate_scores(&confidences, None)
        })
        .await?;

        let stats = match self.store.save_stats_snapshot().await {
            Ok(snapshot) => {
                gauge!("feedforge_indicators_total").set(snapshot.total_indicators as f64);
                Some(snapshot)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to record stats snapshot");
                None
            }
        };

        let edl = self.edl.regenerate(self.store.as_ref()).await?;

        Ok(MaintenanceReport {
            retention,
            whitelist_removed,
            rescored,
            stats,
            edl,
        })
    }

    /// Delete every stored indicator covered by the safelist or the user
    /// whitelist. Returns the number of rows removed.
    pub async fn cleanup_whitelisted(&self) -> Result<u64, PipelineError> {
        let snapshot = self.whitelist.snapshot().await?;
        if snapshot.is_empty() {
            return Ok(0);
        }

        let doomed: Vec<String> = self
            .store
            .stream_indicators()
            .try_filter_map(|indicator| {
                let hit = snapshot.is_whitelisted(&indicator.value);
                futures::future::ready(Ok(hit.then_some(indicator.value)))
            })
            .try_collect()
            .await?;

        let mut removed = 0;
        for chunk in doomed.chunks(DELETE_CHUNK) {
            removed += with_retry(self.retry, "delete_indicators", || self.store.delete_indicators(chunk)).await?;
        }
        if removed > 0 {
            counter!("feedforge_whitelist_removed_total").increment(removed);
            tracing::info!(removed, "Removed whitelisted indicators");
        }
        Ok(removed)
    }

    /// Fetch and parse a feed without saving anything.
    pub async fn test_feed(&self, source: &SourceConfig) -> Result<FeedTestReport, PipelineError> {
        if !source.url.starts_with("http://") && !source.url.starts_with("https://") {
            return Err(FetchError::InvalidUrl {
                url: source.url.clone(),
                reason: "only http:// and https:// feeds are supported".to_string(),
            }
            .into());
        }
        let Some(body) = self.fetcher.fetch(source).await? else {
            return Ok(FeedTestReport {
                valid_count: 0,
                sample: Vec::new(),
            });
        };
        let source = source.clone();
        tokio::task::spawn_blocking(move || -> Result<FeedTestReport, PipelineError> {
            let mut report = FeedTestReport {
                valid_count: 0,
                sample: Vec::new(),
            };
            for token in parse(&body, &source)?.filter(|t| t.is_known()) {
                report.valid_count += 1;
                if report.sample.len() < SAMPLE_SIZE {
                    report.sample.push(token.value);
                }
            }
            Ok(report)
        })
        .await
        .map_err(|e| PipelineError::Task(e.to_string()))?
    }
}

/// Parse, classify, filter and enrich a payload. Runs on a blocking thread.
fn prepare_rows(
    body: &str,
    source: &SourceConfig,
    whitelist: &WhitelistSnapshot,
    lookup: &dyn CountryLookup,
    jobs: &JobTracker,
) -> Result<Prepared, ParseError> {
    let mut prepared = Prepared::default();
    let mut seen = HashSet::new();

    let tokens = parse(body, source)?;
    jobs.update(&source.name, JobState::Filtering, "Applying whitelist");
    for token in tokens {
        prepared.tokens += 1;
        let Some(indicator_type) = token.indicator_type else {
            prepared.unknown += 1;
            continue;
        };
        if let Some(hit) = whitelist.check(&token.value) {
            tracing::trace!(value = %token.value, tier = ?hit.tier, entry = %hit.entry, "Whitelisted");
            prepared.whitelisted += 1;
            continue;
        }
        if !seen.insert(token.value.clone()) {
            prepared.duplicates += 1;
            continue;
        }
        prepared.rows.push(NewIndicator {
            value: token.value,
            indicator_type,
            country: None,
        });
    }

    jobs.update(&source.name, JobState::Enriching, format!("Enriching {} indicators", prepared.rows.len()));
    prepared.enriched = enrich_countries(lookup, &mut prepared.rows);
    Ok(prepared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::MockFeedFetcher;
    use crate::config::FeedFormat;
    use crate::models::IndicatorType;
    use crate::storage::SqliteStore;
    use crate::whitelist::safelist::Safelist;
    use std::net::IpAddr;

    struct FixedCountry;

    impl CountryLookup for FixedCountry {
        fn country_code(&self, _ip: IpAddr) -> Option<String> {
            Some("NL".to_string())
        }
    }

    struct Harness {
        pipeline: Pipeline,
        store: Arc<dyn IndicatorStore>,
        _out: tempfile::TempDir,
    }

    async fn harness(config: AppConfig, fetcher: MockFeedFetcher, safelist: &[&str]) -> Harness {
        let store: Arc<dyn IndicatorStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let safelist = Arc::new(Safelist::from_items(safelist.iter().map(|s| s.to_string()).collect()));
        let whitelist = Arc::new(WhitelistEngine::new(safelist, store.clone()));
        let out = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(
            store.clone(),
            Arc::new(fetcher),
            whitelist,
            Arc::new(RwLock::new(config)),
            EdlWriter::new(out.path()),
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        });
        Harness {
            pipeline,
            store,
            _out: out,
        }
    }

    fn serving(body: Option<&'static str>) -> MockFeedFetcher {
        let mut fetcher = MockFeedFetcher::new();
        fetcher
            .expect_fetch()
            .returning(move |_| Ok(body.map(str::to_string)));
        fetcher
    }

    fn config_with(sources: Vec<SourceConfig>) -> AppConfig {
        AppConfig {
            sources,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ingests_scores_and_records_history() {
        let source = SourceConfig::new("Feed A", "https://feeds.example/a.txt").with_confidence(90);
        let h = harness(
            config_with(vec![source.clone()]),
            serving(Some("# header\n1.1.1.1\nBAD.com\nnot a thing\n1.1.1.1\n")),
            &[],
        )
        .await;

        let result = h.pipeline.process_source(&source).await.unwrap();
        assert_eq!(result.name, "Feed A");
        assert_eq!(result.count, 2);

        let ip = h.store.get_indicator("1.1.1.1").await.unwrap().unwrap();
        assert_eq!(ip.risk_score, 90);
        assert_eq!(ip.source_count, 1);
        let domain = h.store.get_indicator("bad.com").await.unwrap().unwrap();
        assert_eq!(domain.indicator_type, IndicatorType::Domain);

        let history = h.store.job_history(10).await.unwrap();
        assert_eq!(history[0].status, JobOutcome::Success);
        assert_eq!(history[0].items_processed, 2);
        assert_eq!(h.pipeline.jobs().get("Feed A").unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn safelisted_tokens_are_dropped_and_ips_enriched() {
        let source = SourceConfig::new("Feed A", "https://feeds.example/a.txt");
        let h = harness(
            config_with(vec![source.clone()]),
            serving(Some("8.8.8.8\n10.1.2.3\n203.0.113.9\n")),
            &["8.8.8.8", "10.0.0.0/8"],
        )
        .await;
        let pipeline = h.pipeline.with_country_lookup(Arc::new(FixedCountry));

        let result = pipeline.process_source(&source).await.unwrap();
        assert_eq!(result.count, 1);
        assert!(h.store.get_indicator("8.8.8.8").await.unwrap().is_none());
        let kept = h.store.get_indicator("203.0.113.9").await.unwrap().unwrap();
        assert_eq!(kept.country.as_deref(), Some("NL"));
    }

    #[tokio::test]
    async fn empty_feed_completes_with_warning() {
        let source = SourceConfig::new("Feed A", "https://feeds.example/a.txt");
        let h = harness(config_with(vec![source.clone()]), serving(None), &[]).await;

        let result = h.pipeline.process_source(&source).await.unwrap();
        assert_eq!(result.count, 0);
        let history = h.store.job_history(1).await.unwrap();
        assert_eq!(history[0].status, JobOutcome::Warning);
        assert_eq!(history[0].message.as_deref(), Some("No data received"));
    }

    #[tokio::test]
    async fn malformed_payload_is_a_warning_not_a_failure() {
        let source = SourceConfig::new("Feed J", "https://feeds.example/j.json")
            .with_format(FeedFormat::Json, Some("ip"));
        let h = harness(config_with(vec![source.clone()]), serving(Some("{not json")), &[]).await;

        let result = h.pipeline.process_source(&source).await.unwrap();
        assert_eq!(result.count, 0);
        let history = h.store.job_history(1).await.unwrap();
        assert_eq!(history[0].status, JobOutcome::Warning);
        assert!(history[0].message.as_deref().unwrap().starts_with("Parse error"));
    }

    #[tokio::test]
    async fn fetch_failure_marks_job_failed() {
        let source = SourceConfig::new("Feed A", "https://feeds.example/a.txt");
        let mut fetcher = MockFeedFetcher::new();
        fetcher.expect_fetch().returning(|s| {
            Err(FetchError::Timeout { url: s.url.clone() })
        });
        let h = harness(config_with(vec![source.clone()]), fetcher, &[]).await;

        let err = h.pipeline.process_source(&source).await.unwrap_err();
        assert!(matches!(err, PipelineError::Fetch(FetchError::Timeout { .. })));
        let history = h.store.job_history(1).await.unwrap();
        assert_eq!(history[0].status, JobOutcome::Failure);
        assert_eq!(history[0].items_processed, 0);
        assert_eq!(h.pipeline.jobs().get("Feed A").unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn run_all_isolates_failures_and_writes_edl() {
        let good = SourceConfig::new("Good", "https://feeds.example/good.txt").with_confidence(90);
        let bad = SourceConfig::new("Bad", "https://feeds.example/bad.txt");
        let mut fetcher = MockFeedFetcher::new();
        fetcher.expect_fetch().returning(|s| {
            if s.name == "Bad" {
                Err(FetchError::Status {
                    url: s.url.clone(),
                    status: 503,
                })
            } else {
                Ok(Some("10.0.0.0\n10.0.0.1\nbad.com\n".to_string()))
            }
        });
        let h = harness(config_with(vec![good, bad]), fetcher, &[]).await;

        let report = h.pipeline.run_all().await.unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.failed(), 1);
        let good = report.outcomes.iter().find(|o| o.source == "Good").unwrap();
        assert!(good.succeeded);
        assert_eq!(good.count, 3);
        let maintenance = report.maintenance.as_ref().unwrap();
        assert_eq!(maintenance.edl.network_entries, 1);
        assert_eq!(maintenance.edl.url_entries, 1);
        assert_eq!(maintenance.stats.as_ref().unwrap().ip_count, 2);
        assert!(report.maintenance_error.is_none());

        let palo = std::fs::read_to_string(h.pipeline.edl().output_dir().join("palo_alto_edl.txt")).unwrap();
        assert_eq!(palo, "10.0.0.0/31\n");
        assert!(!h.pipeline.jobs().is_running());
    }

    #[tokio::test]
    async fn failed_maintenance_keeps_source_outcomes() {
        let source = SourceConfig::new("Good", "https://feeds.example/good.txt");
        let store: Arc<dyn IndicatorStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let whitelist = Arc::new(WhitelistEngine::new(Arc::new(Safelist::from_items(Vec::new())), store.clone()));
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the output directory should be.
        let blocked = dir.path().join("not-a-dir");
        std::fs::write(&blocked, "").unwrap();
        let pipeline = Pipeline::new(
            store.clone(),
            Arc::new(serving(Some("10.0.0.1
"))),
            whitelist,
            Arc::new(RwLock::new(config_with(vec![source]))),
            EdlWriter::new(&blocked),
        );

        let report = pipeline.run_all().await.unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert!(report.outcomes[0].succeeded);
        assert_eq!(report.outcomes[0].count, 1);
        assert!(report.maintenance.is_none());
        assert!(report.maintenance_error.is_some());
        assert!(store.get_indicator("10.0.0.1").await.unwrap().is_some());
        assert!(!pipeline.jobs().is_running());
    }

    #[tokio::test]
    async fn busy_source_is_skipped_not_ingested_twice() {
        let source = SourceConfig::new("Feed A", "https://feeds.example/a.txt");
        let mut fetcher = MockFeedFetcher::new();
        fetcher.expect_fetch().never();
        let h = harness(config_with(vec![source.clone()]), fetcher, &[]).await;

        let _claim = h.pipeline.jobs().try_claim_source("Feed A").unwrap();
        assert!(matches!(
            h.pipeline.process_single("Feed A").await,
            Err(PipelineError::SourceBusy(name)) if name == "Feed A"
        ));
        let report = h.pipeline.run_all().await.unwrap();
        assert!(report.outcomes[0].skipped);
        assert_eq!(report.failed(), 0);
        assert!(h.store.job_history(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn settings_update_is_persisted_and_applied() {
        let mut source = SourceConfig::new("Feed A", "https://feeds.example/a.txt");
        source.password = Some("s3cret".to_string());
        let h = harness(config_with(vec![source]), MockFeedFetcher::new(), &[]).await;
        let path = h._out.path().join("config.json");
        let pipeline = h.pipeline.with_config_path(&path);

        let mut edited = pipeline.config().redacted();
        edited.sources[0].confidence = 95;
        edited.sources.push(SourceConfig::new("Feed B", "https://feeds.example/b.txt"));
        pipeline.update_config(edited).await.unwrap();

        let saved = AppConfig::load(&path).unwrap();
        assert_eq!(saved.sources.len(), 2);
        assert_eq!(saved.sources[0].confidence, 95);
        assert_eq!(saved.sources[0].password.as_deref(), Some("s3cret"));
        assert!(pipeline.config().source("Feed B").is_some());

        let mut invalid = pipeline.config();
        invalid.batch_size = 0;
        assert!(matches!(
            pipeline.update_config(invalid).await,
            Err(PipelineError::Config(_))
        ));
        assert_eq!(pipeline.config().batch_size, saved.batch_size);
    }

    #[tokio::test]
    async fn concurrent_full_run_is_rejected() {
        let h = harness(AppConfig::default(), MockFeedFetcher::new(), &[]).await;
        let _guard = h.pipeline.jobs().try_start_run().unwrap();
        assert!(matches!(h.pipeline.run_all().await, Err(PipelineError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn whitelist_added_after_ingestion_is_swept() {
        let source = SourceConfig::new("Feed A", "https://feeds.example/a.txt").with_confidence(90);
        let h = harness(
            config_with(vec![source.clone()]),
            serving(Some("1.1.1.1\nbad.com\n")),
            &[],
        )
        .await;
        h.pipeline.process_source(&source).await.unwrap();

        h.store
            .add_whitelist("1.1.1.1", IndicatorType::Ip, Some("resolver"))
            .await
            .unwrap();
        assert_eq!(h.pipeline.cleanup_whitelisted().await.unwrap(), 1);
        assert!(h.store.get_indicator("1.1.1.1").await.unwrap().is_none());
        assert!(h.store.get_indicator("bad.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn process_single_rejects_unknown_sources() {
        let h = harness(AppConfig::default(), MockFeedFetcher::new(), &[]).await;
        assert!(matches!(
            h.pipeline.process_single("nope").await,
            Err(PipelineError::UnknownSource(name)) if name == "nope"
        ));
    }

    #[tokio::test]
    async fn dry_run_samples_without_saving() {
        let source = SourceConfig::new("Feed A", "https://feeds.example/a.txt");
        let body = "1.1.1.1\n2.2.2.2\n3.3.3.3\nbad.com\nevil.org\nfoo.net\n???\n";
        let h = harness(AppConfig::default(), serving(Some(body)), &[]).await;

        let report = h.pipeline.test_feed(&source).await.unwrap();
        assert_eq!(report.valid_count, 6);
        assert_eq!(report.sample, vec!["1.1.1.1", "2.2.2.2", "3.3.3.3", "bad.com", "evil.org"]);
        assert_eq!(h.store.counts_by_type().await.unwrap().total(), 0);

        let ftp = SourceConfig::new("Feed F", "ftp://feeds.example/list");
        assert!(matches!(
            h.pipeline.test_feed(&ftp).await,
            Err(PipelineError::Fetch(FetchError::InvalidUrl { .. }))
        ));
    }
}
