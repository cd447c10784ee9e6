// src/models/ioc_utils.rs

use crate::models::IndicatorType;
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use regex::Regex;
use once_cell::sync::Lazy;
use std::net::{IpAddr, Ipv4Addr};

static IP_CANDIDATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-fA-F:./]+$").expect("valid regex"));

static URL_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^https?://(?:[-\w.]|%[0-9a-f]{2})+").expect("valid regex")
});

static HOSTNAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,63}$")
        .expect("valid regex")
});

/// Classify a raw indicator string. `None` means unknown.
pub fn classify(value: &str) -> Option<IndicatorType> {
    let trimmed = value.trim();

    if trimmed.is_empty() {
        return None;
    }

    // Only attempt address parsing on strings built from address characters
    if IP_CANDIDATE.is_match(trimmed) {
        if trimmed.contains('/') {
            if parse_network(trimmed).is_some() {
                return Some(IndicatorType::Cidr);
            }
        } else if parse_ip(trimmed).is_some() {
            return Some(IndicatorType::Ip);
        }
    }

    if URL_PREFIX.is_match(trimmed) {
        return Some(IndicatorType::Url);
    }

    if HOSTNAME.is_match(trimmed) {
        return Some(IndicatorType::Domain);
    }

    // "host/path" without a scheme
    if let Some((host, _)) = trimmed.split_once('/') {
        if HOSTNAME.is_match(host) {
            return Some(IndicatorType::Url);
        }
    }

    None
}

/// Parse an IP address, accepting zero-padded IPv4 octets ("010.000.000.001").
pub fn parse_ip(value: &str) -> Option<IpAddr> {
    let value = value.trim();
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip);
    }
    parse_padded_ipv4(value).map(IpAddr::V4)
}

fn parse_padded_ipv4(value: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut parts = value.split('.');
    for octet in octets.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *octet = part.parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(Ipv4Addr::from(octets))
}

/// Parse "addr/prefix" and mask off host bits, so "192.168.1.7/24"
/// becomes 192.168.1.0/24. A bare address yields a host network.
pub fn parse_network(value: &str) -> Option<IpNetwork> {
    let value = value.trim();
    let (addr, prefix) = match value.split_once('/') {
        Some((addr, prefix)) => {
            if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            (addr, Some(prefix.parse::<u8>().ok()?))
        }
        None => (value, None),
    };

    match parse_ip(addr)? {
        IpAddr::V4(ip) => {
            let net = Ipv4Network::new(ip, prefix.unwrap_or(32)).ok()?;
            let masked = Ipv4Network::new(net.network(), net.prefix()).ok()?;
            Some(IpNetwork::V4(masked))
        }
        IpAddr::V6(ip) => {
            let net = Ipv6Network::new(ip, prefix.unwrap_or(128)).ok()?;
            let masked = Ipv6Network::new(net.network(), net.prefix()).ok()?;
            Some(IpNetwork::V6(masked))
        }
    }
}

/// Whether `inner` lies entirely inside `outer` (equal networks included).
pub fn is_subnet_of(inner: &IpNetwork, outer: &IpNetwork) -> bool {
    match (inner, outer) {
        (IpNetwork::V4(inner), IpNetwork::V4(outer)) => {
            inner.prefix() >= outer.prefix() && outer.contains(inner.network())
        }
        (IpNetwork::V6(inner), IpNetwork::V6(outer)) => {
            inner.prefix() >= outer.prefix() && outer.contains(inner.network())
        }
        _ => false,
    }
}

/// Canonical textual form of an indicator of the given type.
pub fn normalize_indicator(value: &str, indicator_type: IndicatorType) -> String {
    let trimmed = value.trim();

    match indicator_type {
        IndicatorType::Ip => parse_ip(trimmed)
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| trimmed.to_lowercase()),
        IndicatorType::Cidr => parse_network(trimmed)
            .map(|net| net.to_string())
            .unwrap_or_else(|| trimmed.to_lowercase()),
        IndicatorType::Domain => trimmed.trim_end_matches('.').to_lowercase(),
        IndicatorType::Url => {
            if let Some(idx) = trimmed.find("://") {
                let (scheme, rest) = trimmed.split_at(idx + 3);
                if let Some(path_idx) = rest.find('/') {
                    let (host, path) = rest.split_at(path_idx);
                    format!("{}{}{}", scheme.to_lowercase(), host.to_lowercase(), path)
                } else {
                    trimmed.to_lowercase()
                }
            } else if let Some((host, path)) = trimmed.split_once('/') {
                format!("{}/{}", host.to_lowercase(), path)
            } else {
                trimmed.to_lowercase()
            }
        }
    }
}

/// Classify and canonicalize in one step.
pub fn classify_and_normalize(value: &str) -> Option<(String, IndicatorType)> {
    let indicator_type = classify(value)?;
    Some((normalize_indicator(value, indicator_type), indicator_type))
}

/// Host part of a domain or URL indicator, used for DNS resolution.
pub fn resolvable_host(value: &str, indicator_type: IndicatorType) -> Option<String> {
    match indicator_type {
        IndicatorType::Domain => Some(value.to_string()),
        IndicatorType::Url => {
            if let Ok(parsed) = url::Url::parse(value) {
                if let Some(host) = parsed.host_str() {
                    return Some(host.to_string());
                }
            }
            value
                .split('/')
                .next()
                .filter(|host| !host.is_empty())
                .map(str::to_string)
        }
        IndicatorType::Ip | IndicatorType::Cidr => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_addresses() {
        assert_eq!(classify("1.2.3.4"), Some(IndicatorType::Ip));
        assert_eq!(classify("2001:db8::1"), Some(IndicatorType::Ip));
        assert_eq!(classify("10.0.0.0/8"), Some(IndicatorType::Cidr));
        assert_eq!(classify("2001:db8::/32"), Some(IndicatorType::Cidr));
        assert_eq!(classify("010.001.002.003"), Some(IndicatorType::Ip));
    }

    #[test]
    fn classifies_urls_and_domains() {
        assert_eq!(classify("http://evil.example.com/x"), Some(IndicatorType::Url));
        assert_eq!(classify("HTTPS://Evil.Example.com"), Some(IndicatorType::Url));
        assert_eq!(classify("evil.example.com"), Some(IndicatorType::Domain));
        assert_eq!(classify("bad.be"), Some(IndicatorType::Domain));
        assert_eq!(classify("evil.example.com/payload.exe"), Some(IndicatorType::Url));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(classify(""), None);
        assert_eq!(classify("   "), None);
        assert_eq!(classify("not an indicator"), None);
        assert_eq!(classify("localhost"), None);
        assert_eq!(classify("999.1.1.1"), None);
        assert_eq!(classify("10.0.0.0/33"), None);
        assert_eq!(classify("dead/beef"), None);
        assert_eq!(classify("-bad-.com"), None);
    }

    #[test]
    fn classification_is_deterministic() {
        for input in ["1.1.1.1", "bad.com", "http://x.io/a", "junk", "10.0.0.0/8"] {
            assert_eq!(classify(input), classify(input));
        }
    }

    #[test]
    fn normalizes_to_canonical_form() {
        assert_eq!(normalize_indicator("010.000.000.001", IndicatorType::Ip), "10.0.0.1");
        assert_eq!(
            normalize_indicator("2001:0DB8:0000::0001", IndicatorType::Ip),
            "2001:db8::1"
        );
        assert_eq!(
            normalize_indicator("192.168.1.77/24", IndicatorType::Cidr),
            "192.168.1.0/24"
        );
        assert_eq!(normalize_indicator("Evil.COM", IndicatorType::Domain), "evil.com");
        assert_eq!(
            normalize_indicator("HTTP://Evil.COM/Path/A", IndicatorType::Url),
            "http://evil.com/Path/A"
        );
        assert_eq!(
            normalize_indicator("Evil.COM/Path", IndicatorType::Url),
            "evil.com/Path"
        );
    }

    #[test]
    fn subnet_check_requires_full_containment() {
        let outer = parse_network("10.0.0.0/8").unwrap();
        assert!(is_subnet_of(&parse_network("10.1.0.0/16").unwrap(), &outer));
        assert!(is_subnet_of(&outer, &outer));
        assert!(!is_subnet_of(&parse_network("0.0.0.0/0").unwrap(), &outer));
        assert!(!is_subnet_of(&parse_network("2001:db8::/32").unwrap(), &outer));
    }

    #[test]
    fn extracts_resolvable_host() {
        assert_eq!(
            resolvable_host("http://evil.com:8080/a", IndicatorType::Url).as_deref(),
            Some("evil.com")
        );
        assert_eq!(
            resolvable_host("evil.com/a/b", IndicatorType::Url).as_deref(),
            Some("evil.com")
        );
        assert_eq!(resolvable_host("evil.com", IndicatorType::Domain).as_deref(), Some("evil.com"));
        assert_eq!(resolvable_host("1.1.1.1", IndicatorType::Ip), None);
    }
}
