//! Connection directory
//!
//! The list of live peers sits under one coarse lock that is held only to
//! insert, remove or copy out `Arc`s, never across socket I/O. Iteration
//! works on a snapshot: the copied `Arc`s keep every record alive until the
//! snapshot is dropped.
//!
//! Disconnected peers move to a drain set and are released only when
//! nothing else holds a reference and none of their locks is taken.

use crate::network::ban_list::{BanMap, BanReason, BanTable, SubNet};
use crate::network::peer::{Peer, PeerId};
use crate::utils::lock::lock_or_recover;
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("connection limit of {0} reached")]
    Full(usize),
    #[error("inbound connection limit of {0} reached")]
    InboundFull(usize),
    #[error("already connected to {0}")]
    Duplicate(SocketAddr),
}

pub struct ConnectionDirectory {
    peers: Mutex<Vec<Arc<Peer>>>,
    drain: Mutex<Vec<Arc<Peer>>>,
    blacklist: Mutex<BTreeSet<String>>,
    bans: Mutex<BanTable>,
    next_id: AtomicU64,
    max_connections: usize,
    max_inbound: usize,
}

impl ConnectionDirectory {
    pub fn new(max_connections: usize, max_inbound: usize) -> Self {
        Self {
            peers: Mutex::new(Vec::new()),
            drain: Mutex::new(Vec::new()),
            blacklist: Mutex::new(BTreeSet::new()),
            bans: Mutex::new(BanTable::new()),
            next_id: AtomicU64::new(0),
            max_connections,
            max_inbound,
        }
    }

    pub fn next_peer_id(&self) -> PeerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn max_inbound(&self) -> usize {
        self.max_inbound
    }

    fn check_caps(&self, peers: &[Arc<Peer>], inbound: bool) -> Result<(), DirectoryError> {
        if peers.len() >= self.max_connections {
            return Err(DirectoryError::Full(self.max_connections));
        }
        if inbound && peers.iter().filter(|p| p.is_inbound()).count() >= self.max_inbound {
            return Err(DirectoryError::InboundFull(self.max_inbound));
        }
        Ok(())
    }

    /// Cheap pre-check before a socket is wrapped in a peer record
    pub fn check_capacity(&self, inbound: bool) -> Result<(), DirectoryError> {
        let peers = lock_or_recover(&self.peers);
        self.check_caps(&peers, inbound)
    }

    /// Add a peer, enforcing the caps and rejecting duplicate addresses
    pub fn insert(&self, peer: Arc<Peer>) -> Result<(), DirectoryError> {
        let mut peers = lock_or_recover(&self.peers);
        self.check_caps(&peers, peer.is_inbound())?;
        if peers.iter().any(|p| p.addr() == peer.addr()) {
            return Err(DirectoryError::Duplicate(peer.addr()));
        }
        debug!("Directory: added peer {} ({})", peer.id(), peer.addr());
        peers.push(peer);
        Ok(())
    }

    pub fn find_by_id(&self, id: PeerId) -> Option<Arc<Peer>> {
        lock_or_recover(&self.peers)
            .iter()
            .find(|p| p.id() == id)
            .cloned()
    }

    pub fn find_by_addr(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        lock_or_recover(&self.peers)
            .iter()
            .find(|p| p.addr() == *addr)
            .cloned()
    }

    pub fn find_by_ip(&self, ip: IpAddr) -> Vec<Arc<Peer>> {
        let ip = ip.to_canonical();
        lock_or_recover(&self.peers)
            .iter()
            .filter(|p| p.ip() == ip)
            .cloned()
            .collect()
    }

    pub fn find_by_subnet(&self, subnet: &SubNet) -> Vec<Arc<Peer>> {
        lock_or_recover(&self.peers)
            .iter()
            .filter(|p| subnet.contains(p.ip()))
            .cloned()
            .collect()
    }

    /// Copy out every live peer; each copy holds a reference until dropped
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        lock_or_recover(&self.peers).clone()
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.peers).len()
    }

    pub fn is_empty(&self) -> bool {
        lock_or_recover(&self.peers).is_empty()
    }

    pub fn inbound_count(&self) -> usize {
        lock_or_recover(&self.peers)
            .iter()
            .filter(|p| p.is_inbound())
            .count()
    }

    /// Move every peer flagged for disconnect into the drain set.
    ///
    /// Returns the moved peers so the caller can tear down their sockets.
    pub fn prune_disconnected(&self) -> Vec<Arc<Peer>> {
        let pruned: Vec<Arc<Peer>> = {
            let mut peers = lock_or_recover(&self.peers);
            let (gone, live): (Vec<_>, Vec<_>) =
                peers.drain(..).partition(|p| p.is_disconnecting());
            *peers = live;
            gone
        };
        if !pruned.is_empty() {
            lock_or_recover(&self.drain).extend(pruned.iter().cloned());
        }
        pruned
    }

    /// Release drained peers nobody references and whose locks are free
    pub fn free_drained(&self) -> usize {
        let mut drain = lock_or_recover(&self.drain);
        let before = drain.len();
        drain.retain(|p| !(Arc::strong_count(p) == 1 && p.locks_free()));
        before - drain.len()
    }

    pub fn drain_len(&self) -> usize {
        lock_or_recover(&self.drain).len()
    }

    /// Insert into the session blacklist; false if already present
    pub fn blacklist_insert(&self, addr: &str) -> bool {
        lock_or_recover(&self.blacklist).insert(addr.to_string())
    }

    pub fn blacklist_remove(&self, addr: &str) -> bool {
        lock_or_recover(&self.blacklist).remove(addr)
    }

    pub fn is_blacklisted(&self, addr: &str) -> bool {
        lock_or_recover(&self.blacklist).contains(addr)
    }

    pub fn clear_blacklist(&self) -> usize {
        let mut blacklist = lock_or_recover(&self.blacklist);
        let n = blacklist.len();
        blacklist.clear();
        n
    }

    pub fn blacklist(&self) -> Vec<String> {
        lock_or_recover(&self.blacklist).iter().cloned().collect()
    }

    /// Run `f` with the ban table locked
    pub fn with_bans<R>(&self, f: impl FnOnce(&mut BanTable) -> R) -> R {
        f(&mut lock_or_recover(&self.bans))
    }

    pub fn ban(
        &self,
        subnet: SubNet,
        reason: BanReason,
        ban_time: u64,
        absolute: bool,
        now: u64,
    ) -> bool {
        self.with_bans(|bans| bans.ban(subnet, reason, ban_time, absolute, now))
    }

    pub fn unban(&self, subnet: &SubNet) -> bool {
        self.with_bans(|bans| bans.unban(subnet))
    }

    pub fn is_banned(&self, ip: IpAddr, now: u64) -> bool {
        self.with_bans(|bans| bans.is_banned(ip, now))
    }

    pub fn sweep_bans(&self, now: u64) -> Vec<SubNet> {
        self.with_bans(|bans| bans.sweep(now))
    }

    pub fn clear_bans(&self) {
        self.with_bans(BanTable::clear)
    }

    pub fn ban_entries(&self) -> BanMap {
        self.with_bans(|bans| bans.entries().clone())
    }

    /// Replace the ban table with a loaded one
    pub fn load_bans(&self, entries: BanMap) {
        self.with_bans(|bans| *bans = BanTable::from_map(entries));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer::test_support::loopback_peer;

    fn directory_with(n: usize, max: usize, max_inbound: usize) -> (ConnectionDirectory, Vec<std::net::TcpStream>) {
        let dir = ConnectionDirectory::new(max, max_inbound);
        let mut remotes = Vec::new();
        for _ in 0..n {
            let (peer, remote) = loopback_peer(dir.next_peer_id(), 0);
            dir.insert(Arc::new(peer)).unwrap();
            remotes.push(remote);
        }
        (dir, remotes)
    }

    #[test]
    fn test_caps_enforced() {
        let (dir, _remotes) = directory_with(2, 3, 2);
        let (peer, _r) = loopback_peer(dir.next_peer_id(), 0);
        assert_eq!(dir.insert(Arc::new(peer)), Err(DirectoryError::InboundFull(2)));
        assert_eq!(dir.check_capacity(false), Ok(()));
        assert_eq!(dir.len(), 2);
        assert_eq!(dir.inbound_count(), 2);
    }

    #[test]
    fn test_total_cap() {
        let (dir, _remotes) = directory_with(2, 2, 2);
        assert_eq!(dir.check_capacity(false), Err(DirectoryError::Full(2)));
    }

    #[test]
    fn test_find_by_subnet_and_addr() {
        let (dir, _remotes) = directory_with(2, 8, 8);
        let all = dir.find_by_subnet(&"127.0.0.0/8".parse().unwrap());
        assert_eq!(all.len(), 2);
        assert!(dir.find_by_subnet(&"10.0.0.0/8".parse().unwrap()).is_empty());
        let addr = all[0].addr();
        assert_eq!(dir.find_by_addr(&addr).unwrap().id(), all[0].id());
        assert_eq!(dir.find_by_ip("127.0.0.1".parse().unwrap()).len(), 2);
    }

    #[test]
    fn test_drain_waits_for_references() {
        let (dir, _remotes) = directory_with(2, 8, 8);
        let snapshot = dir.snapshot();
        snapshot[0].mark_disconnect();
        let pruned = dir.prune_disconnected();
        assert_eq!(pruned.len(), 1);
        assert_eq!(dir.len(), 1);
        drop(pruned);

        // the snapshot still references the record
        assert_eq!(dir.free_drained(), 0);
        assert_eq!(dir.drain_len(), 1);
        drop(snapshot);
        assert_eq!(dir.free_drained(), 1);
        assert_eq!(dir.drain_len(), 0);
    }

    #[test]
    fn test_drain_waits_for_locks() {
        let (dir, _remotes) = directory_with(1, 8, 8);
        let peer = dir.snapshot().remove(0);
        peer.mark_disconnect();
        dir.prune_disconnected();
        let weak = Arc::downgrade(&peer);
        drop(peer);
        {
            let strong = weak.upgrade().unwrap();
            let _guard = strong.inventory_lock().lock().unwrap();
            // two references while upgraded
            assert_eq!(dir.free_drained(), 0);
        }
        assert_eq!(dir.free_drained(), 1);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_blacklist_set() {
        let dir = ConnectionDirectory::new(8, 8);
        assert!(dir.blacklist_insert("1.2.3.4"));
        assert!(!dir.blacklist_insert("1.2.3.4"));
        assert!(dir.is_blacklisted("1.2.3.4"));
        assert_eq!(dir.clear_blacklist(), 1);
        assert!(!dir.is_blacklisted("1.2.3.4"));
    }
}
