//! Address Database for Peer Discovery
//!
//! Known peer addresses with freshness tracking, expiration and ban
//! filtering. Holds dialled addresses only: an inbound peer's source port is
//! ephemeral and nobody listens on it. Persisted to `peers.dat` next to the
//! ban table.

use crate::network::ban_list::BanTable;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

/// Address entry with metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressEntry {
    pub addr: SocketAddr,
    /// Unix timestamp when address was first seen
    pub first_seen: u64,
    /// Unix timestamp when address was last seen
    pub last_seen: u64,
    /// Service flags from version message
    pub services: u64,
    /// Number of times we've seen this address
    pub seen_count: u32,
}

impl AddressEntry {
    pub fn new(addr: SocketAddr, services: u64, now: u64) -> Self {
        Self {
            addr,
            first_seen: now,
            last_seen: now,
            services,
            seen_count: 1,
        }
    }

    pub fn update_seen(&mut self, now: u64) {
        self.last_seen = self.last_seen.max(now);
        self.seen_count = self.seen_count.saturating_add(1);
    }

    /// Seen within the expiration window
    pub fn is_fresh(&self, expiration_seconds: u64, now: u64) -> bool {
        now.saturating_sub(self.last_seen) < expiration_seconds
    }
}

/// Address database for peer discovery
#[derive(Debug, Clone)]
pub struct AddressDatabase {
    addresses: HashMap<SocketAddr, AddressEntry>,
    max_addresses: usize,
    expiration_seconds: u64,
    dirty: bool,
}

impl AddressDatabase {
    /// Create with the default 24 hour expiration
    pub fn new(max_addresses: usize) -> Self {
        Self::with_expiration(max_addresses, 24 * 60 * 60)
    }

    pub fn with_expiration(max_addresses: usize, expiration_seconds: u64) -> Self {
        Self {
            addresses: HashMap::new(),
            max_addresses,
            expiration_seconds,
            dirty: false,
        }
    }

    /// Rebuild from persisted entries, dropping the ones already expired
    pub fn from_entries(
        entries: Vec<AddressEntry>,
        max_addresses: usize,
        expiration_seconds: u64,
        now: u64,
    ) -> Self {
        let mut db = Self::with_expiration(max_addresses, expiration_seconds);
        for entry in entries {
            if entry.is_fresh(expiration_seconds, now) {
                db.addresses.insert(entry.addr, entry);
            }
        }
        while db.addresses.len() > db.max_addresses {
            db.evict_oldest();
        }
        db
    }

    /// Add or update an address
    pub fn add_address(&mut self, addr: SocketAddr, services: u64, now: u64) {
        match self.addresses.get_mut(&addr) {
            Some(entry) => {
                entry.update_seen(now);
                entry.services |= services; // Merge service flags
            }
            None => {
                if self.addresses.len() >= self.max_addresses {
                    self.evict_oldest();
                }
                self.addresses.insert(addr, AddressEntry::new(addr, services, now));
            }
        }
        self.dirty = true;
    }

    /// Merge service flags learned from a finished handshake into a known
    /// address. Does not count as another sighting.
    pub fn record_services(&mut self, addr: &SocketAddr, services: u64, now: u64) -> bool {
        let Some(entry) = self.addresses.get_mut(addr) else {
            return false;
        };
        entry.services |= services;
        entry.last_seen = entry.last_seen.max(now);
        self.dirty = true;
        true
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&AddressEntry> {
        self.addresses.get(addr)
    }

    /// Fresh, unbanned addresses, most recently seen first
    pub fn fresh_addresses(&self, count: usize, bans: &BanTable, now: u64) -> Vec<SocketAddr> {
        let mut fresh: Vec<&AddressEntry> = self
            .addresses
            .values()
            .filter(|entry| entry.is_fresh(self.expiration_seconds, now))
            .filter(|entry| !bans.is_banned(entry.addr.ip(), now))
            .collect();
        fresh.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.addr.cmp(&b.addr)));
        fresh.into_iter().take(count).map(|entry| entry.addr).collect()
    }

    pub fn remove_expired(&mut self, now: u64) -> usize {
        let before = self.addresses.len();
        let expiration = self.expiration_seconds;
        self.addresses.retain(|_, entry| entry.is_fresh(expiration, now));
        let removed = before - self.addresses.len();
        self.dirty |= removed > 0;
        removed
    }

    pub fn remove_address(&mut self, addr: &SocketAddr) -> bool {
        let removed = self.addresses.remove(addr).is_some();
        self.dirty |= removed;
        removed
    }

    /// Check if address is local/private
    pub fn is_local(addr: &SocketAddr) -> bool {
        match addr.ip().to_canonical() {
            IpAddr::V4(ipv4) => {
                ipv4.is_loopback() || ipv4.is_private() || ipv4.is_link_local() || ipv4.is_broadcast()
            }
            IpAddr::V6(ipv6) => ipv6.is_loopback() || ipv6.is_unspecified(),
        }
    }

    /// Persistable copy of every entry, ordered by address
    pub fn entries(&self) -> Vec<AddressEntry> {
        let mut entries: Vec<AddressEntry> = self.addresses.values().cloned().collect();
        entries.sort_by(|a, b| a.addr.cmp(&b.addr));
        entries
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .addresses
            .iter()
            .min_by_key(|(addr, entry)| (entry.last_seen, **addr))
            .map(|(addr, _)| *addr);
        if let Some(addr) = oldest {
            self.addresses.remove(&addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ban_list::{BanReason, SubNet};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_add_and_update() {
        let mut db = AddressDatabase::new(10);
        db.add_address(addr("1.2.3.4:8333"), 1, 100);
        db.add_address(addr("1.2.3.4:8333"), 8, 150);
        let entry = db.get(&addr("1.2.3.4:8333")).unwrap();
        assert_eq!(entry.seen_count, 2);
        assert_eq!(entry.services, 9);
        assert_eq!((entry.first_seen, entry.last_seen), (100, 150));
        assert!(db.is_dirty());
    }

    #[test]
    fn test_record_services_merges_without_sighting() {
        let mut db = AddressDatabase::new(10);
        assert!(!db.record_services(&addr("1.2.3.4:8333"), 1, 100));
        assert!(db.is_empty());

        db.add_address(addr("1.2.3.4:8333"), 0, 100);
        db.set_dirty(false);
        assert!(db.record_services(&addr("1.2.3.4:8333"), 9, 180));
        let entry = db.get(&addr("1.2.3.4:8333")).unwrap();
        assert_eq!(entry.services, 9);
        assert_eq!(entry.seen_count, 1);
        assert_eq!(entry.last_seen, 180);
        assert!(db.is_dirty());
    }

    #[test]
    fn test_fresh_addresses_ordered_and_filtered() {
        let mut db = AddressDatabase::with_expiration(10, 1000);
        db.add_address(addr("1.1.1.1:1"), 0, 100);
        db.add_address(addr("2.2.2.2:2"), 0, 300);
        db.add_address(addr("3.3.3.3:3"), 0, 200);
        db.add_address(addr("4.4.4.4:4"), 0, 10); // expires at 1010

        let mut bans = BanTable::new();
        bans.ban(SubNet::single("3.3.3.3".parse().unwrap()), BanReason::ManuallyAdded, 0, false, 1000);

        let fresh = db.fresh_addresses(10, &bans, 1050);
        assert_eq!(fresh, vec![addr("2.2.2.2:2"), addr("1.1.1.1:1")]);
        assert_eq!(db.fresh_addresses(1, &bans, 1050).len(), 1);
    }

    #[test]
    fn test_remove_expired() {
        let mut db = AddressDatabase::with_expiration(10, 100);
        db.add_address(addr("1.1.1.1:1"), 0, 0);
        db.add_address(addr("2.2.2.2:2"), 0, 50);
        assert_eq!(db.remove_expired(120), 1);
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn test_eviction_when_full() {
        let mut db = AddressDatabase::new(2);
        db.add_address(addr("1.1.1.1:1"), 0, 10);
        db.add_address(addr("2.2.2.2:2"), 0, 20);
        db.add_address(addr("3.3.3.3:3"), 0, 30);
        assert_eq!(db.len(), 2);
        assert!(db.get(&addr("1.1.1.1:1")).is_none());
    }

    #[test]
    fn test_from_entries_drops_expired() {
        let entries = vec![
            AddressEntry::new(addr("1.1.1.1:1"), 0, 0),
            AddressEntry::new(addr("2.2.2.2:2"), 0, 900),
        ];
        let db = AddressDatabase::from_entries(entries, 10, 500, 1000);
        assert_eq!(db.len(), 1);
        assert!(!db.is_dirty());
        assert_eq!(db.entries()[0].addr, addr("2.2.2.2:2"));
    }

    #[test]
    fn test_is_local() {
        assert!(AddressDatabase::is_local(&addr("127.0.0.1:1")));
        assert!(AddressDatabase::is_local(&addr("192.168.1.1:1")));
        assert!(AddressDatabase::is_local(&addr("[::1]:1")));
        assert!(!AddressDatabase::is_local(&addr("8.8.8.8:1")));
    }
}
