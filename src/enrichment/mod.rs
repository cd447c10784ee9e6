//! Enrichment services: GeoIP country lookup and DNS resolution

pub mod dns;
pub mod geoip;

use std::net::IpAddr;

use crate::models::{IndicatorType, NewIndicator};

pub use dns::{DnsResolver, TrustDnsResolver};
pub use geoip::GeoIpLookup;

/// Country code of an address. Lookups never fail; unknown yields `None`.
pub trait CountryLookup: Send + Sync {
    fn country_code(&self, ip: IpAddr) -> Option<String>;
}

/// Lookup used when no GeoIP database is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCountryLookup;

impl CountryLookup for NoopCountryLookup {
    fn country_code(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// Attach country codes to IP rows in place. Other types are left alone.
pub fn enrich_countries(lookup: &dyn CountryLookup, rows: &mut [NewIndicator]) -> usize {
    let mut enriched = 0;
    for row in rows.iter_mut() {
        if row.indicator_type != IndicatorType::Ip {
            continue;
        }
        let Ok(ip) = row.value.parse::<IpAddr>() else {
            continue;
        };
        if let Some(code) = lookup.country_code(ip) {
            row.country = Some(code);
            enriched += 1;
        }
    }
    enriched
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    impl CountryLookup for Fixed {
        fn country_code(&self, ip: IpAddr) -> Option<String> {
            (ip.to_string() == "1.1.1.1").then(|| "AU".to_string())
        }
    }

    #[test]
    fn only_ip_rows_are_enriched() {
        let mut rows = vec![
            NewIndicator {
                value: "1.1.1.1".into(),
                indicator_type: IndicatorType::Ip,
                country: None,
            },
            NewIndicator {
                value: "9.9.9.9".into(),
                indicator_type: IndicatorType::Ip,
                country: None,
            },
            NewIndicator {
                value: "1.1.1.0/24".into(),
                indicator_type: IndicatorType::Cidr,
                country: None,
            },
        ];
        assert_eq!(enrich_countries(&Fixed, &mut rows), 1);
        assert_eq!(rows[0].country.as_deref(), Some("AU"));
        assert_eq!(rows[1].country, None);
        assert_eq!(rows[2].country, None);
    }
}
