//! Persisted settings: feed sources, retention and runtime tuning.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::ConfigError;
use crate::models::DEFAULT_CONFIDENCE;

/// Payload format of a feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    #[default]
    Text,
    Mixed,
    Json,
    Csv,
    Stix,
}

/// One external threat feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,

    #[serde(default)]
    pub format: FeedFormat,

    /// Dot-path key for JSON feeds, column index for CSV feeds.
    #[serde(default)]
    pub key_or_column: Option<String>,

    /// Trust weight (0-100) used in risk scoring.
    #[serde(default = "default_confidence")]
    pub confidence: i32,

    /// Days a sighting from this source stays valid. Falls back to
    /// `indicator_lifetime_days`.
    #[serde(default)]
    pub retention_days: Option<i64>,

    #[serde(default)]
    pub schedule_interval_minutes: Option<u64>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Basic auth credentials.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            format: FeedFormat::Text,
            key_or_column: None,
            confidence: DEFAULT_CONFIDENCE,
            retention_days: None,
            schedule_interval_minutes: None,
            enabled: true,
            username: None,
            password: None,
        }
    }

    pub fn with_format(mut self, format: FeedFormat, key_or_column: Option<&str>) -> Self {
        self.format = format;
        self.key_or_column = key_or_column.map(str::to_string);
        self
    }

    pub fn with_confidence(mut self, confidence: i32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = Some(days);
        self
    }

    /// CSV column index, defaulting to the first column.
    pub fn csv_column(&self) -> usize {
        self.key_or_column
            .as_deref()
            .and_then(|c| c.trim().parse().ok())
            .unwrap_or(0)
    }

    /// JSON dot-path key, if any.
    pub fn json_key(&self) -> Option<&str> {
        self.key_or_column
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

/// Outbound proxy for feed downloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Tuning of the DNS resolution batch and dedup sweep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DnsSettings {
    #[serde(default = "default_dns_batch")]
    pub batch_size: i64,
    #[serde(default = "default_retry_days")]
    pub retry_days: i64,
    #[serde(default = "default_delete_batch")]
    pub delete_batch_size: usize,
    #[serde(default = "default_qps")]
    pub queries_per_second: u32,
    #[serde(default)]
    pub resolve_interval_minutes: Option<u64>,
    #[serde(default)]
    pub sweep_interval_minutes: Option<u64>,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            batch_size: default_dns_batch(),
            retry_days: default_retry_days(),
            delete_batch_size: default_delete_batch(),
            queries_per_second: default_qps(),
            resolve_interval_minutes: None,
            sweep_interval_minutes: None,
        }
    }
}

/// Published cloud provider address ranges turned into allow-list EDLs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Github,
    Ms365,
    Azure,
}

impl CloudProvider {
    pub const ALL: [CloudProvider; 3] = [CloudProvider::Github, CloudProvider::Ms365, CloudProvider::Azure];

    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProvider::Github => "github",
            CloudProvider::Ms365 => "ms365",
            CloudProvider::Azure => "azure",
        }
    }
}

impl std::fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CloudProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(CloudProvider::Github),
            "ms365" | "microsoft" | "microsoft365" => Ok(CloudProvider::Ms365),
            "azure" => Ok(CloudProvider::Azure),
            other => Err(format!("unknown cloud provider '{other}'")),
        }
    }
}

/// Where the cloud range documents live and how often to refresh them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudSettings {
    /// Providers refreshed by the scheduler.
    #[serde(default)]
    pub providers: Vec<CloudProvider>,
    #[serde(default)]
    pub interval_minutes: Option<u64>,
    #[serde(default = "default_github_meta_url")]
    pub github_meta_url: String,
    #[serde(default = "default_ms365_endpoints_url")]
    pub ms365_endpoints_url: String,
    /// Download page linking the current Azure service tags file.
    #[serde(default = "default_azure_download_page")]
    pub azure_download_page_url: String,
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            interval_minutes: None,
            github_meta_url: default_github_meta_url(),
            ms365_endpoints_url: default_ms365_endpoints_url(),
            azure_download_page_url: default_azure_download_page(),
        }
    }
}

/// Top-level settings file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    #[serde(default = "default_lifetime_days")]
    pub indicator_lifetime_days: i64,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_concurrency")]
    pub max_concurrent_sources: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub proxy: Option<ProxyConfig>,

    #[serde(default)]
    pub dns: DnsSettings,

    #[serde(default)]
    pub cloud: CloudSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            indicator_lifetime_days: default_lifetime_days(),
            fetch_timeout_secs: default_fetch_timeout(),
            max_concurrent_sources: default_concurrency(),
            batch_size: default_batch_size(),
            proxy: None,
            dns: DnsSettings::default(),
            cloud: CloudSettings::default(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_confidence() -> i32 {
    DEFAULT_CONFIDENCE
}
fn default_lifetime_days() -> i64 {
    30
}
fn default_fetch_timeout() -> u64 {
    30
}
fn default_concurrency() -> usize {
    4
}
fn default_batch_size() -> usize {
    5000
}
fn default_dns_batch() -> i64 {
    50
}
fn default_retry_days() -> i64 {
    7
}
fn default_delete_batch() -> usize {
    1000
}
fn default_qps() -> u32 {
    20
}
fn default_github_meta_url() -> String {
    "https://api.github.com/meta".to_string()
}
fn default_ms365_endpoints_url() -> String {
    "https://endpoints.office.com/endpoints/worldwide".to_string()
}
fn default_azure_download_page() -> String {
    "https://www.microsoft.com/en-us/download/confirmation.aspx?id=56519".to_string()
}

impl AppConfig {
    /// Read the settings file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: AppConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the settings file, replacing it atomically.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        let io_err = |source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        };
        let body = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for (idx, source) in self.sources.iter().enumerate() {
            let prefix = format!("sources[{idx}]");
            if source.name.trim().is_empty() {
                return Err(ConfigError::Validation {
                    field: format!("{prefix}.name"),
                    message: "source name must not be empty".to_string(),
                });
            }
            if !names.insert(source.name.as_str()) {
                return Err(ConfigError::Validation {
                    field: format!("{prefix}.name"),
                    message: format!("duplicate source name '{}'", source.name),
                });
            }
            if !source.url.starts_with("http://") && !source.url.starts_with("https://") {
                return Err(ConfigError::Validation {
                    field: format!("{prefix}.url"),
                    message: format!("feed URL must use http:// or https://, got '{}'", source.url),
                });
            }
            if !(0..=100).contains(&source.confidence) {
                return Err(ConfigError::Validation {
                    field: format!("{prefix}.confidence"),
                    message: format!("confidence must be within 0..=100, got {}", source.confidence),
                });
            }
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Validation {
                field: "batch_size".to_string(),
                message: "batch size must be > 0".to_string(),
            });
        }
        if self.max_concurrent_sources == 0 {
            return Err(ConfigError::Validation {
                field: "max_concurrent_sources".to_string(),
                message: "concurrency must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// Copy with every stored password removed.
    pub fn redacted(&self) -> AppConfig {
        let mut config = self.clone();
        for source in &mut config.sources {
            source.password = None;
        }
        if let Some(proxy) = &mut config.proxy {
            proxy.password = None;
        }
        config
    }

    /// Fill passwords left out of an edited config from `previous`, so a
    /// redacted config can be sent back unchanged.
    pub fn keep_secrets_from(&mut self, previous: &AppConfig) {
        for source in &mut self.sources {
            if source.password.is_none() {
                source.password = previous.source(&source.name).and_then(|s| s.password.clone());
            }
        }
        if let (Some(proxy), Some(old)) = (&mut self.proxy, &previous.proxy) {
            if proxy.password.is_none() && proxy.url == old.url {
                proxy.password = old.password.clone();
            }
        }
    }

    pub fn enabled_sources(&self) -> Vec<SourceConfig> {
        self.sources.iter().filter(|s| s.enabled).cloned().collect()
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// Source name -> confidence.
    pub fn confidence_map(&self) -> HashMap<String, i32> {
        self.sources
            .iter()
            .map(|s| (s.name.clone(), s.confidence))
            .collect()
    }

    /// Source name -> retention days.
    pub fn retention_map(&self) -> HashMap<String, i64> {
        self.sources
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    s.retention_days.unwrap_or(self.indicator_lifetime_days),
                )
            })
            .collect()
    }
}
