//! Network layer for the connection manager
//!
//! [`ConnectionManager`] wires the pieces together: a reactor thread that
//! owns every socket, a dispatcher thread that runs protocol handling and
//! the firewall, and a tokio maintenance task that sweeps expired bans and
//! flushes the ban and address tables to disk.

pub mod address_db;
pub mod ban_list;
pub mod directory;
pub mod dispatcher;
pub mod frame;
pub mod handshake;
pub mod inventory;
pub mod peer;
pub mod protocol;
pub mod reactor;

use crate::config::NodeConfig;
use crate::firewall::{Firewall, Rejection};
use crate::network::address_db::{AddressDatabase, AddressEntry};
use crate::network::ban_list::{BanMap, BanReason, SubNet};
use crate::network::directory::{ConnectionDirectory, DirectoryError};
use crate::network::dispatcher::{Dispatcher, MessageHandler};
use crate::network::peer::{Peer, PeerId, PeerStats};
use crate::network::protocol::InventoryItem;
use crate::network::reactor::{Reactor, ReactorSettings};
use crate::storage::{FlatFile, PersistError};
use crate::utils::error::{log_error, with_fallback};
use crate::utils::lock::{lock_or_recover, try_guard};
use crate::utils::time::current_timestamp;
use anyhow::Context;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Upper bound on remembered peer addresses
pub const MAX_ADDRESSES: usize = 10_000;

/// Connection lifecycle callbacks for the rest of the node.
///
/// Called from the reactor thread (or the dialling thread for outbound
/// connections); implementations must not block.
pub trait PeerObserver: Send + Sync {
    fn peer_connected(&self, _peer: &Peer) {}
    fn peer_disconnected(&self, _peer: &Peer) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
pub struct ObserverRegistry {
    observers: Mutex<Vec<(ObserverId, Arc<dyn PeerObserver>)>>,
    next_id: AtomicU64,
}

impl ObserverRegistry {
    pub fn register(&self, observer: Arc<dyn PeerObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock_or_recover(&self.observers).push((id, observer));
        id
    }

    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = lock_or_recover(&self.observers);
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    fn current(&self) -> Vec<Arc<dyn PeerObserver>> {
        lock_or_recover(&self.observers)
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect()
    }

    /// Tell observers about a peer that passed the connect hook. Repeats
    /// for the same peer are ignored.
    pub fn notify_connected(&self, peer: &Peer) {
        if !peer.mark_announced() {
            return;
        }
        for observer in self.current() {
            observer.peer_connected(peer);
        }
    }

    /// Only peers previously announced as connected are reported
    pub fn notify_disconnected(&self, peer: &Peer) {
        if !peer.take_announced() {
            return;
        }
        for observer in self.current() {
            observer.peer_disconnected(peer);
        }
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.observers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("address is {}", .0.as_str())]
    Rejected(Rejection),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Persisted tables loaded at start and written by the maintenance task
struct Persistence {
    bans: FlatFile,
    addresses: FlatFile,
}

pub struct ConnectionManager {
    config: NodeConfig,
    directory: Arc<ConnectionDirectory>,
    firewall: Arc<Firewall>,
    addresses: Arc<Mutex<AddressDatabase>>,
    observers: Arc<ObserverRegistry>,
    persistence: Persistence,
    handler: Mutex<Option<Box<dyn MessageHandler>>>,
    shutdown: Arc<AtomicBool>,
    reactor_waker: Mutex<Option<Arc<mio::Waker>>>,
    dispatcher_wake: Mutex<Option<SyncSender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ConnectionManager {
    pub fn new(config: NodeConfig, handler: Box<dyn MessageHandler>) -> Self {
        let magic = config.network.network.magic();
        let directory = Arc::new(ConnectionDirectory::new(
            config.network.max_connections,
            config.network.max_inbound,
        ));
        let firewall = Arc::new(Firewall::new(config.firewall.clone(), Arc::clone(&directory)));
        let addresses = Arc::new(Mutex::new(AddressDatabase::with_expiration(
            MAX_ADDRESSES,
            config.storage.address_expiry_secs,
        )));
        let persistence = Persistence {
            bans: FlatFile::new(config.storage.ban_file(), magic),
            addresses: FlatFile::new(config.storage.address_file(), magic),
        };
        Self {
            config,
            directory,
            firewall,
            addresses,
            observers: Arc::new(ObserverRegistry::default()),
            persistence,
            handler: Mutex::new(Some(handler)),
            shutdown: Arc::new(AtomicBool::new(false)),
            reactor_waker: Mutex::new(None),
            dispatcher_wake: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<ConnectionDirectory> {
        &self.directory
    }

    pub fn firewall(&self) -> &Arc<Firewall> {
        &self.firewall
    }

    /// Bound listening address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock_or_recover(&self.local_addr)
    }

    /// Load persisted state, bind the listener and spawn the reactor and
    /// dispatcher threads. Configured outbound peers are dialled last.
    pub fn start(&self) -> anyhow::Result<()> {
        let handler = lock_or_recover(&self.handler)
            .take()
            .ok_or_else(|| anyhow::anyhow!("connection manager already started"))?;
        let now = current_timestamp();
        self.load_persistence(now);

        let net = &self.config.network;
        let (wake_tx, wake_rx) = sync_channel(1);
        let mut reactor = Reactor::new(
            Arc::clone(&self.directory),
            Arc::clone(&self.firewall),
            Arc::clone(&self.addresses),
            Arc::clone(&self.observers),
            wake_tx.clone(),
            ReactorSettings::from(net),
        )
        .context("Failed to create reactor")?;

        if let Some(addr) = net.listen_addr {
            let listener =
                TcpListener::bind(addr).with_context(|| format!("Failed to bind {}", addr))?;
            *lock_or_recover(&self.local_addr) = Some(listener.local_addr()?);
            reactor.listen(listener)?;
        }

        let waker = reactor.waker();
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.directory),
            Arc::clone(&self.firewall),
            handler,
            net.network.magic(),
        )
        .with_reactor_waker(waker.clone());

        let shutdown = Arc::clone(&self.shutdown);
        let reactor_thread = std::thread::Builder::new()
            .name("reactor".into())
            .spawn(move || reactor.run(shutdown))
            .context("Failed to spawn reactor thread")?;

        let shutdown = Arc::clone(&self.shutdown);
        let idle_wait = Duration::from_millis(net.dispatcher_wait_ms);
        let dispatcher_thread = std::thread::Builder::new()
            .name("dispatcher".into())
            .spawn(move || dispatcher.run(wake_rx, shutdown, idle_wait))
            .context("Failed to spawn dispatcher thread")?;

        *lock_or_recover(&self.reactor_waker) = Some(waker);
        *lock_or_recover(&self.dispatcher_wake) = Some(wake_tx);
        lock_or_recover(&self.threads).extend([reactor_thread, dispatcher_thread]);
        info!(
            "Connection manager started ({:?}, max {} peers)",
            net.network, net.max_connections
        );

        for addr in net.connect.clone() {
            if let Err(e) = self.connect(addr) {
                warn!("Failed to connect to {}: {}", addr, e);
            }
        }
        Ok(())
    }

    fn load_persistence(&self, now: u64) {
        let bans_file = &self.persistence.bans;
        let bans: BanMap = if bans_file.path().exists() {
            with_fallback(|| bans_file.read(), BanMap::new, "Ban table unreadable, starting empty")
        } else {
            BanMap::new()
        };
        info!("Loaded {} bans from {}", bans.len(), bans_file.path().display());
        self.directory.load_bans(bans);
        let expired = self.directory.sweep_bans(now);
        if !expired.is_empty() {
            debug!("Dropped {} expired bans on load", expired.len());
        }

        let addr_file = &self.persistence.addresses;
        let entries: Vec<AddressEntry> = if addr_file.path().exists() {
            with_fallback(|| addr_file.read(), Vec::new, "Address table unreadable, starting empty")
        } else {
            Vec::new()
        };
        let db = AddressDatabase::from_entries(
            entries,
            MAX_ADDRESSES,
            self.config.storage.address_expiry_secs,
            now,
        );
        info!("Loaded {} addresses from {}", db.len(), addr_file.path().display());
        *lock_or_recover(&self.addresses) = db;
    }

    /// Write the ban and address tables if they changed since the last flush
    pub fn flush_persistence(&self) -> Result<(), PersistError> {
        let bans = self.directory.with_bans(|bans| {
            bans.is_dirty().then(|| {
                bans.set_dirty(false);
                bans.entries().clone()
            })
        });
        if let Some(bans) = bans {
            if let Err(e) = self.persistence.bans.write(&bans) {
                self.directory.with_bans(|b| b.set_dirty(true));
                return Err(e);
            }
            debug!("Flushed {} bans", bans.len());
        }

        let entries = {
            let mut db = lock_or_recover(&self.addresses);
            db.is_dirty().then(|| {
                db.set_dirty(false);
                db.entries()
            })
        };
        if let Some(entries) = entries {
            if let Err(e) = self.persistence.addresses.write(&entries) {
                lock_or_recover(&self.addresses).set_dirty(true);
                return Err(e);
            }
            debug!("Flushed {} addresses", entries.len());
        }
        Ok(())
    }

    /// Remove expired bans
    pub fn sweep_bans(&self, now: u64) -> Vec<SubNet> {
        let removed = self.directory.sweep_bans(now);
        for subnet in &removed {
            debug!(target: "firewall", "Ban on {} expired", subnet);
        }
        removed
    }

    /// Periodic ban sweep and persistence flush, until `shutdown` flips
    pub async fn run_maintenance(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let storage = &self.config.storage;
        let mut sweep = tokio::time::interval(Duration::from_secs(storage.sweep_interval_secs.max(1)));
        let mut flush = tokio::time::interval(Duration::from_secs(storage.flush_interval_secs.max(1)));
        sweep.tick().await;
        flush.tick().await;

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    self.sweep_bans(current_timestamp());
                }
                _ = flush.tick() => {
                    let manager = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || manager.flush_persistence()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("Persistence flush failed: {}", e),
                        Err(e) => warn!("Persistence flush task failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Maintenance task stopped");
    }

    /// Dial `addr`, blocking up to the configured connect timeout
    pub fn connect(&self, addr: SocketAddr) -> Result<PeerId, ConnectError> {
        let now = current_timestamp();
        if let Some(rejection) = self.firewall.screen(addr.ip(), now) {
            return Err(ConnectError::Rejected(rejection));
        }
        if self.directory.find_by_addr(&addr).is_some() {
            return Err(DirectoryError::Duplicate(addr).into());
        }
        self.directory.check_capacity(false)?;

        let timeout = Duration::from_millis(self.config.network.connect_timeout_ms);
        let socket = TcpStream::connect_timeout(&addr, timeout)?;
        let now = current_timestamp();
        let peer = Arc::new(Peer::new(self.directory.next_peer_id(), socket, addr, false, now)?);
        self.directory.insert(Arc::clone(&peer))?;

        self.firewall.on_connect(&peer, now).map_err(ConnectError::Rejected)?;
        info!("Connected to {} (peer {})", addr, peer.id());
        lock_or_recover(&self.addresses).add_address(addr, 0, now);
        self.observers.notify_connected(&peer);
        self.wake_reactor();
        Ok(peer.id())
    }

    /// Flag every connection to `addr` for disconnect. Port 0 matches any port.
    pub fn disconnect_peer(&self, addr: SocketAddr) -> bool {
        let peers = if addr.port() == 0 {
            self.directory.find_by_ip(addr.ip())
        } else {
            self.directory.find_by_addr(&addr).into_iter().collect()
        };
        for peer in &peers {
            peer.force_disconnect();
        }
        if !peers.is_empty() {
            self.wake_reactor();
        }
        !peers.is_empty()
    }

    pub fn disconnect_by_id(&self, id: PeerId) -> bool {
        match self.directory.find_by_id(id) {
            Some(peer) => {
                peer.force_disconnect();
                self.wake_reactor();
                true
            }
            None => false,
        }
    }

    pub fn peer_info(&self) -> Vec<PeerStats> {
        self.directory.snapshot().iter().map(|p| p.stats()).collect()
    }

    pub fn peer_count(&self) -> usize {
        self.directory.len()
    }

    /// Ban a subnet and disconnect every peer inside it
    pub fn ban(&self, subnet: SubNet, reason: BanReason, ban_time: u64, absolute: bool) -> bool {
        let changed = self
            .directory
            .ban(subnet, reason, ban_time, absolute, current_timestamp());
        for peer in self.directory.find_by_subnet(&subnet) {
            peer.force_disconnect();
        }
        self.wake_reactor();
        changed
    }

    pub fn unban(&self, subnet: &SubNet) -> bool {
        self.directory.unban(subnet)
    }

    pub fn list_banned(&self) -> BanMap {
        self.directory.ban_entries()
    }

    pub fn clear_banned(&self) {
        self.directory.clear_bans();
    }

    pub fn clear_blacklist(&self) -> usize {
        self.directory.clear_blacklist()
    }

    pub fn fresh_addresses(&self, count: usize) -> Vec<SocketAddr> {
        let now = current_timestamp();
        let db = lock_or_recover(&self.addresses);
        self.directory
            .with_bans(|bans| db.fresh_addresses(count, bans, now))
    }

    /// Queue an inventory announcement for every peer whose inventory lock
    /// is free. Returns how many peers took it.
    pub fn announce_inventory(&self, item: InventoryItem) -> usize {
        let queued = self
            .directory
            .snapshot()
            .iter()
            .filter(|peer| !peer.is_disconnecting())
            .filter(|peer| {
                try_guard(peer.inventory_lock())
                    .map(|mut inv| inv.push_announcement(item))
                    .unwrap_or(false)
            })
            .count();
        if queued > 0 {
            if let Some(tx) = lock_or_recover(&self.dispatcher_wake).as_ref() {
                let _ = tx.try_send(());
            }
        }
        queued
    }

    pub fn register_observer(&self, observer: Arc<dyn PeerObserver>) -> ObserverId {
        self.observers.register(observer)
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.observers.unregister(id)
    }

    fn wake_reactor(&self) {
        if let Some(waker) = lock_or_recover(&self.reactor_waker).as_ref() {
            if let Err(e) = waker.wake() {
                debug!("Failed to wake reactor: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !lock_or_recover(&self.threads).is_empty()
    }

    /// Stop both threads after their current tick and flush persistence
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake_reactor();
        if let Some(tx) = lock_or_recover(&self.dispatcher_wake).take() {
            let _ = tx.try_send(());
        }
        let threads: Vec<JoinHandle<()>> = lock_or_recover(&self.threads).drain(..).collect();
        for thread in threads {
            let name = thread.thread().name().unwrap_or("worker").to_string();
            if thread.join().is_err() {
                warn!("{} thread panicked", name);
            }
        }
        log_error(|| self.flush_persistence(), "Final persistence flush failed");
        info!("Connection manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::handshake::HandshakeHandler;
    use std::sync::atomic::AtomicUsize;

    fn config(dir: &std::path::Path) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.storage.data_dir = dir.to_string_lossy().into_owned();
        config
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl PeerObserver for Counter {
        fn peer_connected(&self, _peer: &Peer) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_observer_registry() {
        let registry = ObserverRegistry::default();
        let counter = Arc::new(Counter::default());
        let id = registry.register(counter.clone());
        let (peer, _remote) = crate::network::peer::test_support::loopback_peer(1, 0);
        registry.notify_connected(&peer);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        registry.notify_connected(&peer);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[derive(Default)]
    struct Lifecycle {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
    }

    impl PeerObserver for Lifecycle {
        fn peer_connected(&self, _peer: &Peer) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn peer_disconnected(&self, _peer: &Peer) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_disconnect_reported_only_after_connect() {
        let registry = ObserverRegistry::default();
        let seen = Arc::new(Lifecycle::default());
        registry.register(seen.clone());

        // refused by the connect hook: never announced, never reported gone
        let (refused, _remote) = crate::network::peer::test_support::loopback_peer(1, 0);
        registry.notify_disconnected(&refused);
        assert_eq!(seen.disconnected.load(Ordering::SeqCst), 0);

        let (peer, _remote) = crate::network::peer::test_support::loopback_peer(2, 0);
        registry.notify_connected(&peer);
        registry.notify_connected(&peer);
        registry.notify_disconnected(&peer);
        registry.notify_disconnected(&peer);
        assert_eq!(seen.connected.load(Ordering::SeqCst), 1);
        assert_eq!(seen.disconnected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConnectionManager::new(config(dir.path()), Box::new(HandshakeHandler::default()));
        let subnet: SubNet = "10.1.0.0/16".parse().unwrap();
        assert!(manager.ban(subnet, BanReason::ManuallyAdded, 0, false));
        lock_or_recover(&manager.addresses).add_address("8.8.8.8:8333".parse().unwrap(), 1, current_timestamp());
        manager.flush_persistence().unwrap();
        assert!(manager.config.storage.ban_file().exists());

        let reloaded = ConnectionManager::new(config(dir.path()), Box::new(HandshakeHandler::default()));
        reloaded.load_persistence(current_timestamp());
        assert!(reloaded.list_banned().contains_key(&subnet));
        assert_eq!(reloaded.fresh_addresses(10), vec!["8.8.8.8:8333".parse().unwrap()]);
    }

    #[test]
    fn test_corrupt_ban_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        std::fs::write(cfg.storage.ban_file(), b"garbage").unwrap();
        let manager = ConnectionManager::new(cfg, Box::new(HandshakeHandler::default()));
        manager.load_persistence(current_timestamp());
        assert!(manager.list_banned().is_empty());
    }

    #[test]
    fn test_connect_rejects_banned() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConnectionManager::new(config(dir.path()), Box::new(HandshakeHandler::default()));
        manager.ban(SubNet::single("127.0.0.1".parse().unwrap()), BanReason::ManuallyAdded, 0, false);
        let err = manager.connect("127.0.0.1:1".parse().unwrap()).unwrap_err();
        assert!(matches!(err, ConnectError::Rejected(Rejection::Banned)));
    }

    #[tokio::test]
    async fn test_maintenance_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(ConnectionManager::new(
            config(dir.path()),
            Box::new(HandshakeHandler::default()),
        ));
        let (tx, rx) = crate::utils::create_shutdown_channel();
        let task = tokio::spawn(Arc::clone(&manager).run_maintenance(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
