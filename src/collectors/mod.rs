//! Feed download and payload parsing

pub mod http;
pub mod parsers;

use async_trait::async_trait;

use crate::config::SourceConfig;
use crate::error::FetchError;

pub use http::HttpFetcher;
pub use parsers::{parse, Token};

/// Downloads the raw payload of a feed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// Fetch the feed body. `Ok(None)` means the feed answered with no data.
    async fn fetch(&self, source: &SourceConfig) -> Result<Option<String>, FetchError>;
}
