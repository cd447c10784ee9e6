//! HTTP feed fetcher

use async_trait::async_trait;
use reqwest::{Client, Proxy};
use std::time::{Duration, Instant};

use crate::collectors::FeedFetcher;
use crate::config::{ProxyConfig, SourceConfig};
use crate::error::FetchError;

/// Fetches feeds over HTTP(S) with a per-request timeout, optional proxy
/// and optional basic auth.
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, proxy: Option<&ProxyConfig>) -> Result<Self, FetchError> {
        let mut builder = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("feedforge/", env!("CARGO_PKG_VERSION")));

        if let Some(proxy) = proxy {
            let mut p = Proxy::all(&proxy.url).map_err(|e| FetchError::Proxy(e.to_string()))?;
            if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
                p = p.basic_auth(user, pass);
            }
            builder = builder.proxy(p);
        }

        let client = builder
            .build()
            .map_err(|e| FetchError::Proxy(e.to_string()))?;

        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl FeedFetcher for HttpFetcher {
    async fn fetch(&self, source: &SourceConfig) -> Result<Option<String>, FetchError> {
        let url = reqwest::Url::parse(&source.url).map_err(|e| FetchError::InvalidUrl {
            url: source.url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl {
                url: source.url.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        let started = Instant::now();
        let mut request = self.client.get(url).timeout(self.timeout);
        if let Some(user) = &source.username {
            request = request.basic_auth(user, source.password.as_ref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(&source.url, e))?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: source.url.clone(),
                status: response.status().as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(&source.url, e))?;

        metrics::histogram!("feedforge_fetch_duration_seconds", "source" => source.name.clone())
            .record(started.elapsed().as_secs_f64());

        tracing::debug!(source = %source.name, bytes = body.len(), "Fetched feed");

        if body.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(body))
    }
}
