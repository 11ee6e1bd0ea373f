//! I/O reactor
//!
//! Owns every socket syscall. One pass ("tick"):
//!
//! ```text
//! a. prune peers flagged for disconnect into the drain set
//! b. free drained peers nobody references any more
//! c. pick each socket's interest: writable while its send queue is
//!    non-empty, else readable unless the receive queue is flooded
//! d. poll, bounded by a short timeout
//! e. accept inbound connections
//! f. one read per readable socket, fed to the frame decoder
//! g. optimistic writes for every non-empty send queue
//! h. inactivity timeouts
//! ```
//!
//! mio readiness is edge-triggered, so a socket that was readable but got
//! skipped (busy lock, flood control) keeps a `read_pending` mark and is
//! retried on later ticks until a read returns `WouldBlock`.

use crate::firewall::Firewall;
use crate::network::address_db::AddressDatabase;
use crate::network::directory::ConnectionDirectory;
use crate::network::frame::FrameDecoder;
use crate::network::peer::{is_transient, Peer, PeerId};
use crate::network::ObserverRegistry;
use crate::utils::lock::{lock_or_recover, try_guard};
use crate::utils::time::{current_timestamp, seconds_since};
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

pub const LISTENER: Token = Token(0);
pub const WAKER: Token = Token(1);

const EVENT_CAPACITY: usize = 1024;

fn peer_token(id: PeerId) -> Token {
    Token(id as usize + 2)
}

/// Socket plumbing values the reactor needs from the network config
#[derive(Debug, Clone)]
pub struct ReactorSettings {
    pub idle_timeout: u64,
    pub data_timeout: u64,
    pub receive_flood_size: usize,
    pub poll_timeout: Duration,
    pub read_chunk_size: usize,
}

impl From<&crate::config::NetworkConfig> for ReactorSettings {
    fn from(cfg: &crate::config::NetworkConfig) -> Self {
        Self {
            idle_timeout: cfg.idle_timeout_secs,
            data_timeout: cfg.data_timeout_secs,
            receive_flood_size: cfg.receive_flood_size,
            poll_timeout: Duration::from_millis(cfg.poll_timeout_ms),
            read_chunk_size: cfg.read_chunk_size,
        }
    }
}

struct Registration {
    peer: Arc<Peer>,
    stream: mio::net::TcpStream,
    interest: Option<Interest>,
    read_pending: bool,
}

/// Why a peer timed out, if it did
pub fn inactivity(peer: &Peer, now: u64, idle_timeout: u64, data_timeout: u64) -> Option<&'static str> {
    let last_send = peer.last_send();
    let last_recv = peer.last_recv();
    if last_send == 0 || last_recv == 0 {
        if seconds_since(peer.conn_time(), now) > idle_timeout {
            return Some("no message exchange");
        }
        return None;
    }
    if seconds_since(last_send, now) > data_timeout {
        return Some("send timeout");
    }
    if seconds_since(last_recv, now) > data_timeout {
        return Some("receive timeout");
    }
    None
}

/// Interest a peer should be registered with this tick.
///
/// `None` from the outer option means a lock was busy and the peer is
/// skipped entirely.
fn wanted_interest(peer: &Peer, flood_size: usize) -> Option<Option<Interest>> {
    let send_pending = !try_guard(peer.send_lock())?.is_empty();
    if send_pending {
        return Some(Some(Interest::WRITABLE));
    }
    let decoder = try_guard(peer.recv_lock())?;
    Some(receive_allowed(&decoder, flood_size).then_some(Interest::READABLE))
}

fn receive_allowed(decoder: &FrameDecoder, flood_size: usize) -> bool {
    decoder.is_empty() || decoder.has_incomplete_tail() || decoder.buffered_size() < flood_size
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    listener: Option<TcpListener>,
    listener_source: Option<mio::net::TcpListener>,
    registrations: HashMap<Token, Registration>,
    directory: Arc<ConnectionDirectory>,
    firewall: Arc<Firewall>,
    addresses: Arc<Mutex<AddressDatabase>>,
    observers: Arc<ObserverRegistry>,
    dispatcher: SyncSender<()>,
    settings: ReactorSettings,
    buf: Vec<u8>,
}

impl Reactor {
    pub fn new(
        directory: Arc<ConnectionDirectory>,
        firewall: Arc<Firewall>,
        addresses: Arc<Mutex<AddressDatabase>>,
        observers: Arc<ObserverRegistry>,
        dispatcher: SyncSender<()>,
        settings: ReactorSettings,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let buf = vec![0u8; settings.read_chunk_size.max(1)];
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            waker,
            listener: None,
            listener_source: None,
            registrations: HashMap::new(),
            directory,
            firewall,
            addresses,
            observers,
            dispatcher,
            settings,
            buf,
        })
    }

    /// Handle other threads use to interrupt a poll
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Start accepting on `listener`
    pub fn listen(&mut self, listener: TcpListener) -> io::Result<()> {
        listener.set_nonblocking(true)?;
        let mut source = mio::net::TcpListener::from_std(listener.try_clone()?);
        self.poll
            .registry()
            .register(&mut source, LISTENER, Interest::READABLE)?;
        info!("Listening on {}", listener.local_addr()?);
        self.listener = Some(listener);
        self.listener_source = Some(source);
        Ok(())
    }

    pub fn run(mut self, shutdown: Arc<AtomicBool>) {
        debug!("Reactor started");
        while !shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.tick(current_timestamp()) {
                warn!("Reactor poll failed: {}", e);
                std::thread::sleep(self.settings.poll_timeout);
            }
        }
        // in-flight sends are abandoned
        let now = current_timestamp();
        let registrations: Vec<Registration> = self.registrations.drain().map(|(_, reg)| reg).collect();
        for reg in registrations {
            self.record_services(&reg.peer, now);
            reg.peer.shutdown_socket();
        }
        debug!("Reactor stopped");
    }

    /// One full pass. Only a failing poll is an error; everything per-peer
    /// is handled inside.
    pub fn tick(&mut self, now: u64) -> io::Result<()> {
        // a, b
        for peer in self.directory.prune_disconnected() {
            self.teardown(&peer);
        }
        self.directory.free_drained();

        // c
        let snapshot = self.directory.snapshot();
        for peer in &snapshot {
            self.arm(peer);
        }
        drop(snapshot);

        // d
        let timeout = if self
            .registrations
            .values()
            .any(|r| r.read_pending && r.interest == Some(Interest::READABLE))
        {
            Duration::ZERO
        } else {
            self.settings.poll_timeout
        };
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let mut accept = false;
        for event in self.events.iter() {
            match event.token() {
                LISTENER => accept = true,
                WAKER => {}
                token => {
                    if let Some(reg) = self.registrations.get_mut(&token) {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            reg.read_pending = true;
                        }
                    }
                }
            }
        }

        // e
        if accept {
            self.accept_all(now);
        }

        // f, g
        let mut delivered = false;
        let tokens: Vec<Token> = self.registrations.keys().copied().collect();
        for token in tokens {
            delivered |= self.service_read(token, now);
            self.service_write(token, now);
        }
        if delivered {
            // full means a wake-up is already pending
            let _ = self.dispatcher.try_send(());
        }

        // h
        for reg in self.registrations.values() {
            let peer = &reg.peer;
            if peer.is_disconnecting() {
                continue;
            }
            if let Some(reason) =
                inactivity(peer, now, self.settings.idle_timeout, self.settings.data_timeout)
            {
                debug!("Peer {} ({}) timed out: {}", peer.id(), peer.addr(), reason);
                peer.mark_disconnect();
            }
        }
        Ok(())
    }

    /// Register a peer or update its interest
    fn arm(&mut self, peer: &Arc<Peer>) {
        if peer.is_disconnecting() {
            return;
        }
        let token = peer_token(peer.id());
        let Some(want) = wanted_interest(peer, self.settings.receive_flood_size) else {
            return;
        };

        if !self.registrations.contains_key(&token) {
            let stream = match peer.socket_clone() {
                Ok(socket) => mio::net::TcpStream::from_std(socket),
                Err(e) => {
                    debug!("Peer {}: cannot clone socket: {}", peer.id(), e);
                    peer.mark_disconnect();
                    return;
                }
            };
            self.registrations.insert(
                token,
                Registration {
                    peer: Arc::clone(peer),
                    stream,
                    interest: None,
                    read_pending: true,
                },
            );
        }
        let Some(reg) = self.registrations.get_mut(&token) else {
            return;
        };
        if reg.interest == want {
            return;
        }

        let registry = self.poll.registry();
        let result = match (reg.interest, want) {
            (None, Some(interest)) => registry.register(&mut reg.stream, token, interest),
            (Some(_), Some(interest)) => registry.reregister(&mut reg.stream, token, interest),
            (Some(_), None) => registry.deregister(&mut reg.stream),
            (None, None) => Ok(()),
        };
        match result {
            Ok(()) => reg.interest = want,
            Err(e) => {
                debug!("Peer {}: registration failed: {}", peer.id(), e);
                peer.mark_disconnect();
            }
        }
    }

    fn teardown(&mut self, peer: &Arc<Peer>) {
        self.record_services(peer, current_timestamp());
        peer.shutdown_socket();
        if let Some(mut reg) = self.registrations.remove(&peer_token(peer.id())) {
            if reg.interest.is_some() {
                let _ = self.poll.registry().deregister(&mut reg.stream);
            }
        }
        debug!("Peer {} ({}) disconnected", peer.id(), peer.addr());
        self.observers.notify_disconnected(peer);
    }

    /// Service flags of a dialled peer that finished its version exchange
    fn record_services(&self, peer: &Peer, now: u64) {
        if peer.is_inbound() || peer.version() == 0 {
            return;
        }
        lock_or_recover(&self.addresses).record_services(&peer.addr(), peer.services(), now);
    }

    /// One read for a socket marked readable. Returns true if at least one
    /// frame was completed.
    fn service_read(&mut self, token: Token, now: u64) -> bool {
        let Some(reg) = self.registrations.get_mut(&token) else {
            return false;
        };
        if !reg.read_pending || reg.interest != Some(Interest::READABLE) {
            return false;
        }
        let peer = &reg.peer;
        if peer.is_disconnecting() {
            return false;
        }
        let Some(mut decoder) = try_guard(peer.recv_lock()) else {
            return false;
        };

        match peer.socket_recv(&mut self.buf) {
            Ok(0) => {
                debug!("Peer {} ({}) closed the connection", peer.id(), peer.addr());
                peer.mark_disconnect();
                false
            }
            Ok(n) => {
                peer.record_recv(n, now);
                match decoder.feed(&self.buf[..n]) {
                    Ok(completed) => completed > 0,
                    Err(e) => {
                        debug!("Peer {} ({}): framing error: {}", peer.id(), peer.addr(), e);
                        peer.mark_disconnect();
                        false
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                reg.read_pending = false;
                false
            }
            Err(e) if is_transient(&e) => false,
            Err(e) => {
                debug!("Peer {} ({}): receive error: {}", peer.id(), peer.addr(), e);
                peer.mark_disconnect();
                false
            }
        }
    }

    fn service_write(&mut self, token: Token, now: u64) {
        let Some(reg) = self.registrations.get(&token) else {
            return;
        };
        let peer = &reg.peer;
        if peer.is_disconnecting() {
            return;
        }
        let Some(mut queue) = try_guard(peer.send_lock()) else {
            return;
        };
        if queue.is_empty() {
            return;
        }
        if let Err(e) = peer.socket_send(&mut queue, now) {
            debug!("Peer {} ({}): send error: {}", peer.id(), peer.addr(), e);
        }
    }

    fn accept_all(&mut self, now: u64) {
        let Some(listener) = &self.listener else {
            return;
        };
        loop {
            let (socket, addr) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if is_transient(&e) => continue,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    break;
                }
            };

            if let Some(rejection) = self.firewall.screen(addr.ip(), now) {
                debug!("Rejected inbound {}: {}", addr, rejection.as_str());
                continue;
            }
            if self.directory.find_by_addr(&addr).is_some() {
                debug!("Rejected inbound {}: duplicate", addr);
                continue;
            }
            if let Err(e) = self.directory.check_capacity(true) {
                debug!("Rejected inbound {}: {}", addr, e);
                continue;
            }

            let peer = match Peer::new(self.directory.next_peer_id(), socket, addr, true, now) {
                Ok(peer) => Arc::new(peer),
                Err(e) => {
                    debug!("Cannot set up inbound {}: {}", addr, e);
                    continue;
                }
            };
            if let Err(e) = self.directory.insert(Arc::clone(&peer)) {
                debug!("Rejected inbound {}: {}", addr, e);
                continue;
            }
            if let Err(rejection) = self.firewall.on_connect(&peer, now) {
                debug!("Refused inbound {}: {}", addr, rejection.as_str());
                continue;
            }

            trace!("Accepted inbound peer {} ({})", peer.id(), addr);
            self.observers.notify_connected(&peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FirewallConfig;
    use crate::network::peer::test_support::loopback_peer;
    use std::io::Write;
    use std::sync::mpsc::sync_channel;

    #[test]
    fn test_inactivity_rules() {
        let (peer, _remote) = loopback_peer(1, 1000);
        assert_eq!(inactivity(&peer, 1060, 60, 1200), None);
        assert_eq!(inactivity(&peer, 1061, 60, 1200), Some("no message exchange"));

        peer.record_send(1, 1010);
        peer.record_recv(1, 1020);
        assert_eq!(inactivity(&peer, 2210, 60, 1200), None);
        assert_eq!(inactivity(&peer, 2211, 60, 1200), Some("send timeout"));

        peer.record_send(1, 2000);
        assert_eq!(inactivity(&peer, 2221, 60, 1200), Some("receive timeout"));
    }

    #[test]
    fn test_flood_control() {
        let mut decoder = FrameDecoder::new();
        assert!(receive_allowed(&decoder, 10));
        let frame =
            crate::network::protocol::serialize_frame([0; 4], "tx", &[0u8; 100]).unwrap();
        decoder.feed(&frame).unwrap();
        assert!(!receive_allowed(&decoder, 10));
        assert!(receive_allowed(&decoder, 1000));
        // an incomplete newest frame is always read to completion
        decoder.feed(&frame[..30]).unwrap();
        assert!(receive_allowed(&decoder, 10));
    }

    fn reactor() -> (Reactor, Arc<ConnectionDirectory>, std::sync::mpsc::Receiver<()>) {
        let directory = Arc::new(ConnectionDirectory::new(8, 8));
        let firewall = Arc::new(Firewall::new(FirewallConfig::default(), Arc::clone(&directory)));
        let (tx, rx) = sync_channel(1);
        let settings = ReactorSettings::from(&crate::config::NetworkConfig::default());
        let reactor = Reactor::new(
            Arc::clone(&directory),
            firewall,
            Arc::new(Mutex::new(AddressDatabase::new(100))),
            Arc::new(ObserverRegistry::default()),
            tx,
            settings,
        )
        .unwrap();
        (reactor, directory, rx)
    }

    #[test]
    fn test_reads_frames_and_wakes_dispatcher() {
        let (mut reactor, directory, wake) = reactor();
        let (peer, mut remote) = loopback_peer(directory.next_peer_id(), 0);
        let peer = Arc::new(peer);
        directory.insert(Arc::clone(&peer)).unwrap();

        let frame = crate::network::protocol::serialize_frame([0; 4], "ping", &[0u8; 8]).unwrap();
        remote.write_all(&frame).unwrap();

        for _ in 0..50 {
            reactor.tick(1).unwrap();
            if peer.recv_lock().lock().unwrap().has_complete() {
                break;
            }
        }
        assert!(peer.recv_lock().lock().unwrap().has_complete());
        assert_eq!(peer.bytes_recv(), frame.len() as u64);
        assert!(wake.try_recv().is_ok());
    }

    #[test]
    fn test_remote_close_prunes_peer() {
        let (mut reactor, directory, _wake) = reactor();
        let (peer, remote) = loopback_peer(directory.next_peer_id(), 0);
        let peer = Arc::new(peer);
        directory.insert(Arc::clone(&peer)).unwrap();
        drop(remote);

        for _ in 0..50 {
            reactor.tick(1).unwrap();
            if directory.is_empty() {
                break;
            }
        }
        assert!(peer.is_disconnecting());
        assert!(directory.is_empty());
        drop(peer);
        reactor.tick(1).unwrap();
        assert_eq!(directory.drain_len(), 0);
    }
}
