//! GeoIP country lookup using a MaxMind database

use lru::LruCache;
use maxminddb::{geoip2, Reader};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use crate::enrichment::CountryLookup;

/// Entries kept in front of the database reader.
pub const CACHE_CAPACITY: usize = 10_000;

/// Country lookups against a MaxMind Country (or City) database.
pub struct GeoIpLookup {
    reader: Option<Arc<Reader<Vec<u8>>>>,
    cache: Mutex<LruCache<IpAddr, Option<String>>>,
}

impl GeoIpLookup {
    /// Open the database. A missing path or unreadable file yields a lookup
    /// that always answers `None`.
    pub fn open(path: Option<&Path>) -> Self {
        let reader = match path {
            Some(path) if path.exists() => match Reader::open_readfile(path) {
                Ok(reader) => {
                    tracing::info!(path = %path.display(), "GeoIP country database loaded");
                    Some(Arc::new(reader))
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to open GeoIP database");
                    None
                }
            },
            Some(path) => {
                tracing::warn!(path = %path.display(), "GeoIP database not found");
                None
            }
            None => None,
        };
        Self::with_reader(reader)
    }

    fn with_reader(reader: Option<Arc<Reader<Vec<u8>>>>) -> Self {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            reader,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.reader.is_some()
    }

    fn lookup_uncached(&self, ip: IpAddr) -> Option<String> {
        let reader = self.reader.as_ref()?;
        match reader.lookup::<geoip2::Country>(ip) {
            Ok(record) => record
                .country
                .and_then(|c| c.iso_code)
                .map(str::to_string),
            Err(e) => {
                tracing::trace!(%ip, error = %e, "GeoIP lookup miss");
                None
            }
        }
    }
}

impl CountryLookup for GeoIpLookup {
    fn country_code(&self, ip: IpAddr) -> Option<String> {
        if self.reader.is_none() {
            return None;
        }
        if let Some(hit) = self.cache.lock().get(&ip) {
            return hit.clone();
        }
        let code = self.lookup_uncached(ip);
        self.cache.lock().put(ip, code.clone());
        code
    }
}
