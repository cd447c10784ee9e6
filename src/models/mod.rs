//! Core data models for the feed aggregator

pub mod ioc_utils;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use thiserror::Error;

/// Confidence used for sources that do not configure one.
pub const DEFAULT_CONFIDENCE: i32 = 50;

/// Score written on first insert, before recomputation runs.
pub const DEFAULT_RISK_SCORE: i32 = 50;

/// Score bonus for every additional source reporting an indicator.
pub const SOURCE_BONUS: i32 = 5;

/// Types of indicators tracked by the store
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorType {
    Ip,
    Cidr,
    Domain,
    Url,
}

impl IndicatorType {
    pub const ALL: [IndicatorType; 4] = [
        IndicatorType::Ip,
        IndicatorType::Cidr,
        IndicatorType::Domain,
        IndicatorType::Url,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorType::Ip => "ip",
            IndicatorType::Cidr => "cidr",
            IndicatorType::Domain => "domain",
            IndicatorType::Url => "url",
        }
    }

    /// IPs and CIDRs end up in the aggregated address block-lists.
    pub fn is_network(&self) -> bool {
        matches!(self, IndicatorType::Ip | IndicatorType::Cidr)
    }
}

impl std::fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown indicator type '{0}'")]
pub struct UnknownIndicatorType(pub String);

impl FromStr for IndicatorType {
    type Err = UnknownIndicatorType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ip" => Ok(IndicatorType::Ip),
            "cidr" => Ok(IndicatorType::Cidr),
            "domain" => Ok(IndicatorType::Domain),
            "url" => Ok(IndicatorType::Url),
            other => Err(UnknownIndicatorType(other.to_string())),
        }
    }
}

impl TryFrom<String> for IndicatorType {
    type Error = UnknownIndicatorType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Stored indicator row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct Indicator {
    pub value: String,
    #[sqlx(try_from = "String")]
    #[serde(rename = "type")]
    pub indicator_type: IndicatorType,
    pub country: Option<String>,
    pub risk_score: i32,
    pub source_count: i32,
    pub last_seen: DateTime<Utc>,
}

/// A classified, enriched indicator waiting to be persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIndicator {
    pub value: String,
    pub indicator_type: IndicatorType,
    pub country: Option<String>,
}

/// Link between an indicator and a feed that reported it
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IndicatorSource {
    pub indicator_value: String,
    pub source_name: String,
    pub last_seen: DateTime<Utc>,
}

/// User-managed allow-list entry
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WhitelistEntry {
    pub id: i64,
    pub item: String,
    #[sqlx(try_from = "String")]
    #[serde(rename = "type")]
    pub indicator_type: IndicatorType,
    pub description: Option<String>,
    pub added_at: DateTime<Utc>,
}

/// Operator-pushed block-list entry, always exported with full risk
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BlocklistEntry {
    pub id: i64,
    pub item: String,
    #[sqlx(try_from = "String")]
    #[serde(rename = "type")]
    pub indicator_type: IndicatorType,
    pub comment: Option<String>,
    pub added_at: DateTime<Utc>,
}

/// Cached A-record resolution of a domain or URL indicator
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DnsCacheEntry {
    pub domain: String,
    pub resolved_ips: String,
    pub last_resolved: DateTime<Utc>,
}

impl DnsCacheEntry {
    pub fn resolved(&self) -> impl Iterator<Item = &str> {
        self.resolved_ips
            .split(',')
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
    }
}

/// Final status of a job-history row
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Running,
    Success,
    Warning,
    Failure,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Running => "running",
            JobOutcome::Success => "success",
            JobOutcome::Warning => "warning",
            JobOutcome::Failure => "failure",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown job status '{0}'")]
pub struct UnknownJobOutcome(pub String);

impl TryFrom<String> for JobOutcome {
    type Error = UnknownJobOutcome;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "running" => Ok(JobOutcome::Running),
            "success" => Ok(JobOutcome::Success),
            "warning" => Ok(JobOutcome::Warning),
            "failure" => Ok(JobOutcome::Failure),
            _ => Err(UnknownJobOutcome(value)),
        }
    }
}

/// Persistent record of one source run
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobRecord {
    pub id: i64,
    pub source_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[sqlx(try_from = "String")]
    pub status: JobOutcome,
    pub items_processed: i64,
    pub message: Option<String>,
}

/// Periodic snapshot used for trend reporting
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StatsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total_indicators: i64,
    pub ip_count: i64,
    pub domain_count: i64,
    pub url_count: i64,
}

/// Indicator count per source
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SourceCount {
    pub source_name: String,
    pub count: i64,
}

/// Indicator count per country (IP indicators only)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CountryCount {
    pub country: String,
    pub count: i64,
}

/// Search/filter parameters
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IndicatorFilter {
    #[serde(rename = "type")]
    pub indicator_type: Option<IndicatorType>,
    pub search: Option<String>,
    pub min_risk_score: Option<i32>,
    /// Comma-separated source names; matches indicators linked to any of them.
    pub sources: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

impl IndicatorFilter {
    pub fn source_names(&self) -> Vec<String> {
        self.sources
            .as_deref()
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn per_page(&self) -> i64 {
        self.per_page.unwrap_or(50).clamp(1, 1000)
    }
}

/// Paginated response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, total: i64, page: i64, per_page: i64) -> Self {
        Self {
            data,
            total,
            page,
            per_page,
            total_pages: (total + per_page - 1) / per_page,
        }
    }
}

/// Outcome of a successful source run, consumed by stats and EDL refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceResult {
    pub name: String,
    pub count: usize,
    pub fetch_duration_secs: f64,
    pub completed_at: DateTime<Utc>,
}

/// Risk score of an indicator from the highest confidence of its sources
/// and the number of distinct sources reporting it.
pub fn risk_score(max_confidence: i32, source_count: i32) -> i32 {
    (max_confidence + SOURCE_BONUS * (source_count - 1)).min(100)
}
