//! Longest-prefix CIDR routing table
//!
//! Maps destination addresses to peer handles. Lookups on the packet path
//! take a read lock only; administrative churn takes the write lock.
//!
//! When two entries both contain a destination, the longer prefix wins.
//! This is a deliberate tie-break (overlapping entries are a
//! misconfiguration, but the outcome should at least be deterministic).

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use parking_lot::RwLock;

use crate::error::{MeshError, Result};

/// Normalize a CIDR string to its network form
///
/// A bare IP (`10.0.0.5`) and its host route (`10.0.0.5/32`) collapse to the
/// same key; aliased forms (`10.0.0.5/24`) collapse to the network address.
///
/// # Errors
///
/// Returns a route error if the string parses as neither CIDR nor IPv4.
pub fn normalize_cidr(cidr: &str) -> Result<Ipv4Net> {
    if let Ok(net) = cidr.parse::<Ipv4Net>() {
        return Ok(net.trunc());
    }
    let ip: Ipv4Addr = cidr
        .parse()
        .map_err(|_| MeshError::route(format!("invalid cidr: {cidr}")))?;
    Ok(Ipv4Net::new(ip, 32).expect("/32 prefix is always valid"))
}

/// Routing table entries keyed by normalized network, bucketed by prefix
/// length so lookups walk /32 down to /0.
#[derive(Debug)]
pub struct RouteTable<T> {
    entries: RwLock<BTreeMap<u8, HashMap<Ipv4Net, T>>>,
}

impl<T: Clone> RouteTable<T> {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Insert a handle for a network, returning any displaced handle
    ///
    /// The caller is responsible for tearing down whatever it gets back.
    pub fn insert(&self, net: Ipv4Net, handle: T) -> Option<T> {
        let mut entries = self.entries.write();
        entries
            .entry(net.prefix_len())
            .or_default()
            .insert(net.trunc(), handle)
    }

    /// Swap the entry for a network only while `matches` holds for the
    /// current handle, returning the displaced handle
    ///
    /// Used by reconnect loops: a peer that was administratively removed or
    /// replaced while a reconnect was in flight must not be clobbered, so
    /// the swap is conditioned on the slot still holding the handle the
    /// reconnect started from.
    pub fn swap_entry_if<F>(&self, net: Ipv4Net, handle: T, matches: F) -> Option<T>
    where
        F: FnOnce(&T) -> bool,
    {
        let mut entries = self.entries.write();
        let bucket = entries.get_mut(&net.prefix_len())?;
        let key = net.trunc();
        match bucket.get(&key) {
            Some(current) if matches(current) => bucket.insert(key, handle),
            _ => None,
        }
    }

    /// Remove the entry for a network, returning its handle
    ///
    /// Removing an absent entry is a no-op.
    pub fn remove(&self, net: Ipv4Net) -> Option<T> {
        let mut entries = self.entries.write();
        let bucket = entries.get_mut(&net.prefix_len())?;
        let removed = bucket.remove(&net.trunc());
        if bucket.is_empty() {
            entries.remove(&net.prefix_len());
        }
        removed
    }

    /// Whether an entry exists for the network
    #[must_use]
    pub fn contains(&self, net: Ipv4Net) -> bool {
        self.entries
            .read()
            .get(&net.prefix_len())
            .is_some_and(|bucket| bucket.contains_key(&net.trunc()))
    }

    /// Resolve a destination address to a handle, longest prefix first
    #[must_use]
    pub fn resolve(&self, dst: Ipv4Addr) -> Option<T> {
        let entries = self.entries.read();
        for (&prefix, bucket) in entries.iter().rev() {
            let candidate = Ipv4Net::new(dst, prefix)
                .expect("prefix comes from a stored Ipv4Net")
                .trunc();
            if let Some(handle) = bucket.get(&candidate) {
                return Some(handle.clone());
            }
        }
        None
    }

    /// Number of entries in the table
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().values().map(HashMap::len).sum()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for RouteTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        normalize_cidr(s).unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_normalize_bare_ip_and_host_route_collapse() {
        assert_eq!(net("10.0.0.5"), net("10.0.0.5/32"));
    }

    #[test]
    fn test_normalize_aliased_network() {
        assert_eq!(net("10.0.0.5/24"), net("10.0.0.0/24"));
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_cidr("not-a-cidr").is_err());
        assert!(normalize_cidr("10.0.0.0/33").is_err());
    }

    #[test]
    fn test_host_route_single_entry() {
        let table = RouteTable::new();
        table.insert(net("10.0.0.5"), "a");
        assert_eq!(table.len(), 1);

        // Inserting the /32 spelling replaces, not duplicates.
        let old = table.insert(net("10.0.0.5/32"), "b");
        assert_eq!(old, Some("a"));
        assert_eq!(table.len(), 1);

        // Removing either spelling removes the same entry.
        assert_eq!(table.remove(net("10.0.0.5")), Some("b"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_disjoint_cidr_matching() {
        let table = RouteTable::new();
        table.insert(net("10.0.0.0/24"), "a");
        table.insert(net("10.0.1.0/24"), "b");

        assert_eq!(table.resolve(ip("10.0.0.42")), Some("a"));
        assert_eq!(table.resolve(ip("10.0.1.1")), Some("b"));
        assert_eq!(table.resolve(ip("10.0.2.1")), None);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = RouteTable::new();
        table.insert(net("10.0.0.0/16"), "wide");
        table.insert(net("10.0.3.0/24"), "narrow");
        table.insert(net("10.0.3.7/32"), "host");

        assert_eq!(table.resolve(ip("10.0.3.7")), Some("host"));
        assert_eq!(table.resolve(ip("10.0.3.9")), Some("narrow"));
        assert_eq!(table.resolve(ip("10.0.200.1")), Some("wide"));
        assert_eq!(table.resolve(ip("10.1.0.1")), None);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let table: RouteTable<&str> = RouteTable::new();
        assert_eq!(table.remove(net("192.168.0.0/24")), None);
    }

    #[test]
    fn test_swap_entry_if() {
        let table = RouteTable::new();
        // Entry gone: swap must not resurrect it.
        assert_eq!(table.swap_entry_if(net("10.0.0.0/24"), "x", |_| true), None);
        assert!(!table.contains(net("10.0.0.0/24")));

        table.insert(net("10.0.0.0/24"), "a");
        assert_eq!(
            table.swap_entry_if(net("10.0.0.0/24"), "b", |cur| *cur == "a"),
            Some("a")
        );
        assert_eq!(table.resolve(ip("10.0.0.1")), Some("b"));

        // Slot now holds "b"; a swap expecting "a" must leave it alone.
        assert_eq!(
            table.swap_entry_if(net("10.0.0.0/24"), "c", |cur| *cur == "a"),
            None
        );
        assert_eq!(table.resolve(ip("10.0.0.1")), Some("b"));
    }

    #[test]
    fn test_contains_after_churn() {
        let table = RouteTable::new();
        table.insert(net("172.16.0.0/12"), 1);
        assert!(table.contains(net("172.16.0.0/12")));
        table.remove(net("172.16.0.0/12"));
        assert!(!table.contains(net("172.16.0.0/12")));
    }
}
