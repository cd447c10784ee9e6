//! Block-list (EDL) generation and generic indicator export

pub mod cidr;
pub mod cloud;

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ExportError;
use crate::models::{BlocklistEntry, Indicator, IndicatorType};
use crate::storage::IndicatorStore;

pub use cidr::aggregate;
pub use cloud::{CloudLists, CloudReport};

/// Aggregated address list for Palo Alto EDL consumers.
pub const PALO_ALTO_EDL: &str = "palo_alto_edl.txt";
/// Aggregated address list for Fortinet threat feed connectors.
pub const FORTINET_EDL: &str = "fortinet_edl.txt";
/// Domains and URLs, one per line, not aggregated.
pub const URL_LIST: &str = "url_list.txt";

pub const EDL_FILES: [&str; 3] = [PALO_ALTO_EDL, FORTINET_EDL, URL_LIST];

/// Score reported for operator-pushed block-list items.
pub const BLOCKLIST_RISK_SCORE: i32 = 100;

/// Output format of the generic export.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Text,
    Csv,
    Json,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Text => "text/plain; charset=utf-8",
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Json => "application/json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "txt" => Ok(ExportFormat::Text),
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(format!("unknown export format '{other}'")),
        }
    }
}

/// One row of the generic export.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportRecord {
    pub indicator: String,
    #[serde(rename = "type")]
    pub indicator_type: IndicatorType,
    pub risk_score: i32,
    pub country: Option<String>,
}

impl From<Indicator> for ExportRecord {
    fn from(ind: Indicator) -> Self {
        Self {
            indicator: ind.value,
            indicator_type: ind.indicator_type,
            risk_score: ind.risk_score,
            country: ind.country,
        }
    }
}

pub fn render(records: &[ExportRecord], format: ExportFormat) -> Result<String, ExportError> {
    match format {
        ExportFormat::Text => Ok(join_lines(records.iter().map(|r| r.indicator.as_str()))),
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_writer(Vec::new());
            for record in records {
                writer.serialize(record)?;
            }
            let bytes = writer.into_inner().map_err(|e| ExportError::Io {
                path: "<memory>".to_string(),
                source: e.into_error(),
            })?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        ExportFormat::Json => Ok(serde_json::to_string_pretty(records)?),
    }
}

/// Export stored indicators, optionally restricted by type and source.
pub async fn export_indicators(
    store: &dyn IndicatorStore,
    types: &[IndicatorType],
    sources: &[String],
    format: ExportFormat,
) -> Result<String, ExportError> {
    let mut records: Vec<ExportRecord> = store
        .export_indicators(types, sources)
        .await?
        .into_iter()
        .map(ExportRecord::from)
        .collect();

    // Manual entries belong to no feed, so a source filter excludes them.
    if sources.is_empty() {
        let blocklist = store.list_blocklist().await?;
        merge_blocklist(&mut records, blocklist, types);
    }
    render(&records, format)
}

/// Raise stored values to the block-list score and append the rest.
fn merge_blocklist(records: &mut Vec<ExportRecord>, blocklist: Vec<BlocklistEntry>, types: &[IndicatorType]) {
    let mut position: HashMap<String, usize> = records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.indicator.clone(), i))
        .collect();
    for entry in blocklist {
        if !types.is_empty() && !types.contains(&entry.indicator_type) {
            continue;
        }
        match position.get(&entry.item) {
            Some(&i) => records[i].risk_score = BLOCKLIST_RISK_SCORE,
            None => {
                position.insert(entry.item.clone(), records.len());
                records.push(ExportRecord {
                    indicator: entry.item,
                    indicator_type: entry.indicator_type,
                    risk_score: BLOCKLIST_RISK_SCORE,
                    country: None,
                });
            }
        }
    }
}

fn join_lines<'a>(lines: impl Iterator<Item = &'a str>) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Entry counts of the last regeneration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EdlReport {
    pub indicators_scanned: usize,
    pub blocklist_items: usize,
    pub network_entries: usize,
    pub url_entries: usize,
}

/// Renders the EDL files into an output directory.
#[derive(Debug, Clone)]
pub struct EdlWriter {
    output_dir: PathBuf,
}

impl EdlWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Path of a generated list, `None` for names that are not EDL files.
    pub fn path_of(&self, name: &str) -> Option<PathBuf> {
        (EDL_FILES.contains(&name) || cloud::is_cloud_list(name)).then(|| self.output_dir.join(name))
    }

    /// Write one list, one entry per line, replacing any previous version.
    pub async fn write_list<S: AsRef<str>>(&self, name: &str, lines: &[S]) -> Result<(), ExportError> {
        self.ensure_dir().await?;
        let body = join_lines(lines.iter().map(AsRef::as_ref));
        self.write_atomic(name, &body).await
    }

    async fn ensure_dir(&self) -> Result<(), ExportError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| ExportError::Io {
                path: self.output_dir.display().to_string(),
                source,
            })
    }

    /// Rebuild every list from the store plus the manual block-list.
    pub async fn regenerate(&self, store: &dyn IndicatorStore) -> Result<EdlReport, ExportError> {
        let mut networks: Vec<String> = Vec::new();
        let mut urls: BTreeSet<String> = BTreeSet::new();
        let mut report = EdlReport::default();

        {
            let mut rows = store.stream_indicators();
            while let Some(indicator) = rows.try_next().await? {
                report.indicators_scanned += 1;
                if indicator.indicator_type.is_network() {
                    networks.push(indicator.value);
                } else {
                    urls.insert(indicator.value);
                }
            }
        }

        let blocklist = store.list_blocklist().await?;
        report.blocklist_items = blocklist.len();
        for entry in blocklist {
            if entry.indicator_type.is_network() {
                networks.push(entry.item);
            } else {
                urls.insert(entry.item);
            }
        }

        let aggregated = tokio::task::spawn_blocking(move || aggregate(&networks))
            .await
            .map_err(|e| ExportError::Task(e.to_string()))?;

        report.network_entries = aggregated.len();
        report.url_entries = urls.len();

        let network_body = join_lines(aggregated.iter().map(String::as_str));
        let url_body = join_lines(urls.iter().map(String::as_str));

        self.ensure_dir().await?;
        self.write_atomic(PALO_ALTO_EDL, &network_body).await?;
        self.write_atomic(FORTINET_EDL, &network_body).await?;
        self.write_atomic(URL_LIST, &url_body).await?;

        tracing::info!(
            scanned = report.indicators_scanned,
            networks = report.network_entries,
            urls = report.url_entries,
            "EDL files regenerated"
        );
        Ok(report)
    }

    async fn write_atomic(&self, name: &str, body: &str) -> Result<(), ExportError> {
        let path = self.output_dir.join(name);
        let tmp = self.output_dir.join(format!(".{name}.tmp"));
        let io_err = |source| ExportError::Io {
            path: path.display().to_string(),
            source,
        };
        tokio::fs::write(&tmp, body).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
        Ok(())
    }
}
