//! Allow-list matching across mixed indicator types.
//!
//! Two tiers are consulted in order: the process-wide safelist shipped with
//! the deployment, then the user whitelist kept in the store. The first
//! match wins.

pub mod safelist;

use ipnetwork::IpNetwork;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use crate::error::StoreError;
use crate::models::ioc_utils::{classify_and_normalize, is_subnet_of, parse_ip, parse_network};
use crate::storage::IndicatorStore;

pub use safelist::Safelist;

/// Pre-split allow-list: exact addresses, networks and exact strings.
///
/// Built once per batch so matching never re-parses entries.
#[derive(Debug, Clone, Default)]
pub struct WhitelistSet {
    exact_ips: HashSet<IpAddr>,
    networks: Vec<IpNetwork>,
    exact_strings: HashSet<String>,
}

impl WhitelistSet {
    pub fn from_items<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = WhitelistSet::default();
        for item in items {
            set.insert(item.as_ref());
        }
        set
    }

    fn insert(&mut self, item: &str) {
        let item = item.trim();
        if item.is_empty() {
            return;
        }
        if item.contains('/') {
            if let Some(net) = parse_network(item) {
                self.networks.push(net);
                return;
            }
        } else if let Some(ip) = parse_ip(item) {
            self.exact_ips.insert(ip);
            return;
        }
        let canonical = classify_and_normalize(item)
            .map(|(value, _)| value)
            .unwrap_or_else(|| item.to_lowercase());
        self.exact_strings.insert(canonical);
    }

    pub fn is_empty(&self) -> bool {
        self.exact_ips.is_empty() && self.networks.is_empty() && self.exact_strings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.exact_ips.len() + self.networks.len() + self.exact_strings.len()
    }

    /// The whitelist entry that covers `value`, if any.
    ///
    /// IPs match an exact entry or any containing network. CIDRs match only
    /// when equal to or fully inside a listed network (overlap is not
    /// enough); exact IP entries count as host networks. Everything else is
    /// compared as an exact string.
    pub fn matches(&self, value: &str) -> Option<String> {
        let value = value.trim();

        if !value.contains('/') {
            if let Some(ip) = parse_ip(value) {
                if self.exact_ips.contains(&ip) {
                    return Some(ip.to_string());
                }
                return self
                    .networks
                    .iter()
                    .find(|net| net.contains(ip))
                    .map(|net| net.to_string());
            }
        } else if let Some(candidate) = parse_network(value) {
            let host_prefix = match candidate {
                IpNetwork::V4(_) => 32,
                IpNetwork::V6(_) => 128,
            };
            if candidate.prefix() == host_prefix && self.exact_ips.contains(&candidate.network()) {
                return Some(candidate.network().to_string());
            }
            return self
                .networks
                .iter()
                .find(|net| is_subnet_of(&candidate, net))
                .map(|net| net.to_string());
        }

        if self.exact_strings.contains(value) {
            return Some(value.to_string());
        }
        let lowered = value.to_lowercase();
        self.exact_strings.get(&lowered).cloned()
    }
}

/// Tier that produced a whitelist match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Safelist,
    Whitelist,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Safelist => f.write_str("global safelist"),
            Tier::Whitelist => f.write_str("user whitelist"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhitelistMatch {
    pub tier: Tier,
    pub entry: String,
}

impl fmt::Display for WhitelistMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "matched {} entry {}", self.tier, self.entry)
    }
}

/// Consistent view of both tiers at one point in time.
#[derive(Debug, Clone, Default)]
pub struct WhitelistSnapshot {
    pub global: Arc<WhitelistSet>,
    pub user: Arc<WhitelistSet>,
}

impl WhitelistSnapshot {
    pub fn check(&self, value: &str) -> Option<WhitelistMatch> {
        if let Some(entry) = self.global.matches(value) {
            return Some(WhitelistMatch {
                tier: Tier::Safelist,
                entry,
            });
        }
        self.user.matches(value).map(|entry| WhitelistMatch {
            tier: Tier::Whitelist,
            entry,
        })
    }

    pub fn is_whitelisted(&self, value: &str) -> bool {
        self.check(value).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.user.is_empty()
    }
}

/// Items not covered by `whitelist`, in input order.
pub fn filter_whitelisted<S: AsRef<str>>(items: &[S], whitelist: &[S]) -> Vec<String> {
    let set = WhitelistSet::from_items(whitelist);
    items
        .iter()
        .map(AsRef::as_ref)
        .filter(|item| set.matches(item).is_none())
        .map(str::to_string)
        .collect()
}

/// Combines the safelist with the store-backed user whitelist.
pub struct WhitelistEngine {
    safelist: Arc<Safelist>,
    store: Arc<dyn IndicatorStore>,
}

impl WhitelistEngine {
    pub fn new(safelist: Arc<Safelist>, store: Arc<dyn IndicatorStore>) -> Self {
        Self { safelist, store }
    }

    pub fn safelist(&self) -> &Arc<Safelist> {
        &self.safelist
    }

    pub async fn snapshot(&self) -> Result<WhitelistSnapshot, StoreError> {
        let entries = self.store.list_whitelist().await?;
        Ok(WhitelistSnapshot {
            global: self.safelist.snapshot(),
            user: Arc::new(WhitelistSet::from_items(entries.iter().map(|e| e.item.as_str()))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_exact_and_contained_addresses() {
        let items = ["1.1.1.1", "8.8.8.8", "10.0.0.5", "192.168.1.1"];
        let whitelist = ["8.8.8.8", "10.0.0.0/8"];
        let kept = filter_whitelisted(&items[..], &whitelist[..]);
        assert_eq!(kept, vec!["1.1.1.1", "192.168.1.1"]);
    }

    #[test]
    fn cidr_must_be_fully_contained() {
        let set = WhitelistSet::from_items(["10.0.0.0/8", "8.8.8.8"]);
        assert!(set.matches("10.1.0.0/16").is_some());
        assert!(set.matches("10.0.0.0/8").is_some());
        assert!(set.matches("8.8.8.8/32").is_some());
        assert!(set.matches("0.0.0.0/0").is_none());
        assert!(set.matches("8.8.8.0/24").is_none());
    }

    #[test]
    fn strings_match_exactly() {
        let set = WhitelistSet::from_items(["Google.com", "http://ok.example/path"]);
        assert!(set.matches("google.com").is_some());
        assert!(set.matches("mail.google.com").is_none());
        assert!(set.matches("http://ok.example/path").is_some());
        assert!(set.matches("bad.com").is_none());
    }

    #[test]
    fn ipv6_networks() {
        let set = WhitelistSet::from_items(["2001:db8::/32"]);
        assert!(set.matches("2001:db8::1").is_some());
        assert!(set.matches("2001:db8:1::/48").is_some());
        assert!(set.matches("2001:db9::1").is_none());
    }

    #[test]
    fn safelist_tier_wins() {
        let snapshot = WhitelistSnapshot {
            global: Arc::new(WhitelistSet::from_items(["1.1.1.1"])),
            user: Arc::new(WhitelistSet::from_items(["1.1.1.1", "bad.com"])),
        };
        assert_eq!(snapshot.check("1.1.1.1").unwrap().tier, Tier::Safelist);
        assert_eq!(snapshot.check("bad.com").unwrap().tier, Tier::Whitelist);
        assert!(snapshot.check("2.2.2.2").is_none());
    }
}
