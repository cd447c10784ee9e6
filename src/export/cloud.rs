//! Allow-list EDLs built from the address ranges cloud providers publish.
//!
//! Each provider document is fetched, split into per-service lists,
//! aggregated with [`aggregate`](super::aggregate) and written next to the
//! threat EDLs. Empty lists are not written.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use super::{aggregate, EdlWriter};
use crate::collectors::FeedFetcher;
use crate::config::{CloudProvider, CloudSettings, SourceConfig};
use crate::error::ExportError;

const GITHUB_SERVICES: [&str; 5] = ["git", "web", "actions", "hooks", "pages"];
/// `serviceArea` values of the Microsoft 365 endpoint list. Skype covers Teams.
const MS365_AREAS: [&str; 4] = ["Exchange", "Skype", "SharePoint", "Common"];
const AZURE_LISTS: [&str; 5] = ["all", "sql", "storage", "westeurope", "northeurope"];

static AZURE_TAGS_HREF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"href="([^"]*ServiceTags_Public[^"]+\.json)""#).expect("valid regex"));
static AZURE_TAGS_BARE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(https://download\.microsoft\.com/download/[^"'\s]*?\.json)"#).expect("valid regex")
});

/// File names written for a provider.
pub fn list_names(provider: CloudProvider) -> Vec<String> {
    match provider {
        CloudProvider::Github => GITHUB_SERVICES
            .iter()
            .map(|s| format!("github_{s}_ips.txt"))
            .collect(),
        CloudProvider::Ms365 => MS365_AREAS
            .iter()
            .flat_map(|area| {
                let area = area.to_ascii_lowercase();
                [format!("ms365_{area}_ips.txt"), format!("ms365_{area}_urls.txt")]
            })
            .collect(),
        CloudProvider::Azure => AZURE_LISTS
            .iter()
            .map(|l| format!("azure_{l}_ips.txt"))
            .collect(),
    }
}

pub fn is_cloud_list(name: &str) -> bool {
    CloudProvider::ALL
        .iter()
        .any(|p| list_names(*p).iter().any(|n| n == name))
}

/// Lists written for one provider.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CloudReport {
    pub provider: CloudProvider,
    pub files: Vec<String>,
    pub entries: usize,
    pub error: Option<String>,
}

type Lists = Vec<(String, Vec<String>)>;

/// GitHub `/meta`: one aggregated list per service key.
pub fn github_lists(meta: &serde_json::Value) -> Lists {
    GITHUB_SERVICES
        .iter()
        .filter_map(|service| {
            let ranges: Vec<&str> = meta
                .get(*service)?
                .as_array()?
                .iter()
                .filter_map(|v| v.as_str())
                .collect();
            let ranges = aggregate(ranges);
            (!ranges.is_empty()).then(|| (format!("github_{service}_ips.txt"), ranges))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ms365Endpoint {
    pub service_area: String,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub urls: Vec<String>,
}

/// Microsoft 365 endpoints: aggregated ranges and sorted unique URLs per
/// service area.
pub fn ms365_lists(endpoints: &[Ms365Endpoint]) -> Lists {
    let mut lists = Vec::new();
    for area in MS365_AREAS {
        let matching: Vec<&Ms365Endpoint> = endpoints.iter().filter(|e| e.service_area == area).collect();
        let ranges = aggregate(matching.iter().flat_map(|e| e.ips.iter()));
        let urls: BTreeSet<&str> = matching
            .iter()
            .flat_map(|e| e.urls.iter().map(String::as_str))
            .collect();

        let area = area.to_ascii_lowercase();
        if !ranges.is_empty() {
            lists.push((format!("ms365_{area}_ips.txt"), ranges));
        }
        if !urls.is_empty() {
            lists.push((
                format!("ms365_{area}_urls.txt"),
                urls.into_iter().map(str::to_string).collect(),
            ));
        }
    }
    lists
}

#[derive(Debug, Deserialize)]
pub struct ServiceTags {
    #[serde(default)]
    pub values: Vec<ServiceTag>,
}

#[derive(Debug, Deserialize)]
pub struct ServiceTag {
    pub name: String,
    #[serde(default)]
    pub properties: ServiceTagProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTagProperties {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub address_prefixes: Vec<String>,
}

/// Link to the current service tags file on the Azure download page.
pub fn azure_tags_url(page: &str) -> Option<String> {
    AZURE_TAGS_HREF
        .captures(page)
        .or_else(|| AZURE_TAGS_BARE.captures(page))
        .map(|c| c[1].to_string())
}

/// Azure service tags: everything, SQL, Storage and two European regions.
pub fn azure_lists(tags: &ServiceTags) -> Lists {
    AZURE_LISTS
        .iter()
        .filter_map(|&list| {
            let ranges = aggregate(
                tags.values
                    .iter()
                    .filter(|tag| azure_selects(list, tag))
                    .flat_map(|tag| tag.properties.address_prefixes.iter()),
            );
            (!ranges.is_empty()).then(|| (format!("azure_{list}_ips.txt"), ranges))
        })
        .collect()
}

fn azure_selects(list: &str, tag: &ServiceTag) -> bool {
    match list {
        "all" => true,
        "sql" => tag.name.starts_with("Sql"),
        "storage" => tag.name.starts_with("Storage"),
        region => tag.properties.region == region,
    }
}

/// Refreshes the provider allow-lists into the EDL output directory.
pub struct CloudLists {
    fetcher: Arc<dyn FeedFetcher>,
    settings: CloudSettings,
    writer: EdlWriter,
}

impl CloudLists {
    pub fn new(fetcher: Arc<dyn FeedFetcher>, settings: CloudSettings, writer: EdlWriter) -> Self {
        Self {
            fetcher,
            settings,
            writer,
        }
    }

    pub fn settings(&self) -> &CloudSettings {
        &self.settings
    }

    /// Fetch one provider's document and rewrite its lists.
    pub async fn refresh(&self, provider: CloudProvider) -> Result<CloudReport, ExportError> {
        let lists = match provider {
            CloudProvider::Github => {
                let body = self.download(provider, &self.settings.github_meta_url).await?;
                github_lists(&parse(provider, &body)?)
            }
            CloudProvider::Ms365 => {
                let url = format!(
                    "{}?clientrequestid={}",
                    self.settings.ms365_endpoints_url,
                    Uuid::new_v4()
                );
                let body = self.download(provider, &url).await?;
                let endpoints: Vec<Ms365Endpoint> = parse(provider, &body)?;
                ms365_lists(&endpoints)
            }
            CloudProvider::Azure => {
                let page = self.download(provider, &self.settings.azure_download_page_url).await?;
                let url = azure_tags_url(&page).ok_or_else(|| ExportError::Payload {
                    provider: provider.to_string(),
                    message: "no service tags link on the download page".to_string(),
                })?;
                tracing::debug!(%url, "Found Azure service tags file");
                let body = self.download(provider, &url).await?;
                let tags: ServiceTags = parse(provider, &body)?;
                azure_lists(&tags)
            }
        };

        let mut report = CloudReport {
            provider,
            files: Vec::with_capacity(lists.len()),
            entries: 0,
            error: None,
        };
        for (name, lines) in lists {
            self.writer.write_list(&name, &lines).await?;
            report.entries += lines.len();
            report.files.push(name);
        }
        tracing::info!(%provider, files = report.files.len(), entries = report.entries, "Cloud lists written");
        Ok(report)
    }

    /// Refresh each provider in turn. A failing provider is reported and
    /// does not stop the others.
    pub async fn refresh_all(&self, providers: &[CloudProvider]) -> Vec<CloudReport> {
        let mut reports = Vec::with_capacity(providers.len());
        for &provider in providers {
            match self.refresh(provider).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::error!(%provider, error = %e, "Cloud list refresh failed");
                    reports.push(CloudReport {
                        provider,
                        files: Vec::new(),
                        entries: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        reports
    }

    async fn download(&self, provider: CloudProvider, url: &str) -> Result<String, ExportError> {
        let source = SourceConfig::new(provider.as_str(), url);
        self.fetcher
            .fetch(&source)
            .await?
            .ok_or_else(|| ExportError::Payload {
                provider: provider.to_string(),
                message: format!("empty response from {url}"),
            })
    }
}

fn parse<T: serde::de::DeserializeOwned>(provider: CloudProvider, body: &str) -> Result<T, ExportError> {
    serde_json::from_str(body).map_err(|e| ExportError::Payload {
        provider: provider.to_string(),
        message: e.to_string(),
    })
}
