//! Collapse IP and CIDR values into the minimal set of covering networks.

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::models::ioc_utils::parse_network;

/// A network as (first address, prefix length) within a `BITS`-wide family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Block {
    start: u128,
    prefix: u8,
}

fn host_mask(bits: u8, prefix: u8) -> u128 {
    let host_bits = u32::from(bits - prefix);
    if host_bits >= 128 {
        u128::MAX
    } else {
        (1u128 << host_bits) - 1
    }
}

impl Block {
    fn contains(&self, other: &Block, bits: u8) -> bool {
        other.prefix >= self.prefix && other.start & !host_mask(bits, self.prefix) == self.start
    }

    /// Parent network if `self` and `next` are the two halves of it.
    fn merge_with(&self, next: &Block, bits: u8) -> Option<Block> {
        if self.prefix != next.prefix || self.prefix == 0 {
            return None;
        }
        let parent_prefix = self.prefix - 1;
        let aligned = self.start & !host_mask(bits, parent_prefix) == self.start;
        let adjacent = self.start.checked_add(host_mask(bits, self.prefix))? + 1 == next.start;
        (aligned && adjacent).then_some(Block {
            start: self.start,
            prefix: parent_prefix,
        })
    }
}

/// Sort, drop contained blocks and merge sibling halves until stable.
fn collapse(mut blocks: Vec<Block>, bits: u8) -> Vec<Block> {
    blocks.sort_unstable();
    blocks.dedup();

    let mut stack: Vec<Block> = Vec::with_capacity(blocks.len());
    for block in blocks {
        if stack.last().is_some_and(|top| top.contains(&block, bits)) {
            continue;
        }
        stack.push(block);
        while stack.len() >= 2 {
            let top = stack[stack.len() - 1];
            let below = stack[stack.len() - 2];
            match below.merge_with(&top, bits) {
                Some(parent) => {
                    stack.truncate(stack.len() - 2);
                    stack.push(parent);
                }
                None => break,
            }
        }
    }
    stack
}

/// Aggregate IPs and CIDRs into minimal non-overlapping networks.
///
/// Invalid values are dropped. IPv4 blocks come first, then IPv6; hosts are
/// rendered with an explicit `/32` or `/128`. The result does not depend on
/// input order and aggregating it again yields the same list.
pub fn aggregate<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();

    for value in values {
        match parse_network(value.as_ref()) {
            Some(IpNetwork::V4(net)) => v4.push(Block {
                start: u128::from(u32::from(net.network())),
                prefix: net.prefix(),
            }),
            Some(IpNetwork::V6(net)) => v6.push(Block {
                start: u128::from(net.network()),
                prefix: net.prefix(),
            }),
            None => {}
        }
    }

    let mut out = Vec::with_capacity(v4.len() + v6.len());
    for block in collapse(v4, 32) {
        // start fits in 32 bits for IPv4 blocks
        let addr = Ipv4Addr::from(block.start as u32);
        if let Ok(net) = Ipv4Network::new(addr, block.prefix) {
            out.push(net.to_string());
        }
    }
    for block in collapse(v6, 128) {
        if let Ok(net) = Ipv6Network::new(Ipv6Addr::from(block.start), block.prefix) {
            out.push(net.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_sibling_halves() {
        assert_eq!(
            aggregate(["192.168.1.0/25", "192.168.1.128/25"]),
            vec!["192.168.1.0/24"]
        );
    }

    #[test]
    fn merges_consecutive_hosts() {
        assert_eq!(
            aggregate(["10.0.0.0", "10.0.0.1", "10.0.0.2", "10.0.0.3"]),
            vec!["10.0.0.0/30"]
        );
    }

    #[test]
    fn keeps_unaligned_neighbours_apart() {
        assert_eq!(
            aggregate(["10.0.0.0/30", "10.0.0.4"]),
            vec!["10.0.0.0/30", "10.0.0.4/32"]
        );
    }

    #[test]
    fn drops_contained_networks() {
        assert_eq!(
            aggregate(["192.168.1.0/24", "192.168.0.0/16"]),
            vec!["192.168.0.0/16"]
        );
    }

    #[test]
    fn cascades_merges() {
        assert_eq!(
            aggregate(["10.0.0.128/26", "10.0.0.0/25", "10.0.0.192/26"]),
            vec!["10.0.0.0/24"]
        );
    }

    #[test]
    fn ipv4_before_ipv6_and_garbage_dropped() {
        assert_eq!(
            aggregate(["2001:db8::1", "not-an-ip", "1.2.3.4", "2001:db8::/127", "bad.com"]),
            vec!["1.2.3.4/32", "2001:db8::/127"]
        );
    }

    #[test]
    fn whole_address_space() {
        assert_eq!(aggregate(["0.0.0.0/1", "128.0.0.0/1"]), vec!["0.0.0.0/0"]);
        assert_eq!(aggregate(["::/1", "8000::/1"]), vec!["::/0"]);
    }

    #[test]
    fn order_independent_and_idempotent() {
        let input = vec![
            "10.0.0.3", "172.16.0.0/13", "10.0.0.2", "172.24.0.0/13", "10.0.0.0/31", "8.8.8.8",
        ];
        let forward = aggregate(&input);
        let mut reversed = input.clone();
        reversed.reverse();
        assert_eq!(aggregate(&reversed), forward);
        assert_eq!(aggregate(&forward), forward);
        assert_eq!(forward, vec!["8.8.8.8/32", "10.0.0.0/30", "172.16.0.0/12"]);
    }
}
