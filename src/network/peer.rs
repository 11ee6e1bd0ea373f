//! Peer record
//!
//! One live connection. The record is shared between the reactor (socket
//! reads and writes) and the dispatcher (message processing, examination)
//! as an `Arc<Peer>`; the strong count is its reference count.
//!
//! Three independent locks guard the outbound queue, the inbound frame
//! decoder and the inventory. Both threads only ever `try_lock` them.
//! Counters, timers and flags are atomics so either thread can read them
//! without taking any lock.

use crate::network::frame::FrameDecoder;
use crate::network::inventory::PeerInventory;
use crate::utils::lock::{lock_or_recover, try_guard};
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Mutex;

pub type PeerId = u64;

/// Transient socket errors: retried on a later tick, never logged as failures
pub fn is_transient(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    ) {
        return true;
    }
    #[cfg(unix)]
    {
        if e.raw_os_error() == Some(libc::EMSGSIZE) {
            return true;
        }
    }
    false
}

/// Outbound byte queue with the offset into its partly flushed front buffer
#[derive(Debug, Default)]
pub struct SendQueue {
    buffers: VecDeque<Vec<u8>>,
    offset: usize,
    size: usize,
}

impl SendQueue {
    pub fn push(&mut self, frame: Vec<u8>) {
        self.size += frame.len();
        self.buffers.push_back(frame);
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Bytes still to send, counting the unsent tail of the front buffer
    pub fn pending_bytes(&self) -> usize {
        self.size - self.offset
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
        self.offset = 0;
        self.size = 0;
    }
}

/// Inputs to the traffic baseline, touched only by the examination step
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrafficStats {
    /// sent / received, as of the last examination
    pub ratio: f64,
    /// Smoothed ratio: `average += ratio / 2` per examination
    pub average: f64,
    /// Last time this peer's average was folded into the global baseline
    pub last_fold: u64,
}

/// Serializable view of a peer for the RPC layer
#[derive(Debug, Clone, Serialize)]
pub struct PeerStats {
    pub id: PeerId,
    pub addr: String,
    pub inbound: bool,
    pub conntime: u64,
    pub lastsend: u64,
    pub lastrecv: u64,
    pub bytessent: u64,
    pub bytesrecv: u64,
    pub invalidrecv: u64,
    pub version: i32,
    pub subver: String,
    pub services: String,
    pub startingheight: i32,
    pub syncheight: i32,
    pub trafficratio: f64,
    pub trafficaverage: f64,
    pub disconnecting: bool,
}

pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    inbound: bool,
    socket: TcpStream,
    conn_time: u64,
    last_send: AtomicU64,
    last_recv: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    invalid_recv: AtomicU64,
    version: AtomicI32,
    services: AtomicU64,
    starting_height: AtomicI32,
    checkpoint_height: AtomicI32,
    legacy_checkpoint_height: AtomicI32,
    subver: Mutex<String>,
    traffic: Mutex<TrafficStats>,
    disconnect: AtomicBool,
    send_ended: AtomicBool,
    /// Set while observers consider the peer connected
    announced: AtomicBool,
    send: Mutex<SendQueue>,
    recv: Mutex<FrameDecoder>,
    inventory: Mutex<PeerInventory>,
}

impl Peer {
    /// Wrap a connected socket. The socket is switched to non-blocking mode.
    pub fn new(
        id: PeerId,
        socket: TcpStream,
        addr: SocketAddr,
        inbound: bool,
        now: u64,
    ) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let _ = socket.set_nodelay(true);
        Ok(Self {
            id,
            addr,
            inbound,
            socket,
            conn_time: now,
            last_send: AtomicU64::new(0),
            last_recv: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            invalid_recv: AtomicU64::new(0),
            version: AtomicI32::new(0),
            services: AtomicU64::new(0),
            starting_height: AtomicI32::new(0),
            checkpoint_height: AtomicI32::new(0),
            legacy_checkpoint_height: AtomicI32::new(0),
            subver: Mutex::new(String::new()),
            traffic: Mutex::new(TrafficStats::default()),
            disconnect: AtomicBool::new(false),
            send_ended: AtomicBool::new(false),
            announced: AtomicBool::new(false),
            send: Mutex::new(SendQueue::default()),
            recv: Mutex::new(FrameDecoder::new()),
            inventory: Mutex::new(PeerInventory::new()),
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip().to_canonical()
    }

    /// Address string used for blacklist and whitelist matching
    pub fn ip_string(&self) -> String {
        self.ip().to_string()
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    pub fn conn_time(&self) -> u64 {
        self.conn_time
    }

    pub fn last_send(&self) -> u64 {
        self.last_send.load(Ordering::Relaxed)
    }

    pub fn last_recv(&self) -> u64 {
        self.last_recv.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_recv(&self) -> u64 {
        self.bytes_recv.load(Ordering::Relaxed)
    }

    pub fn invalid_recv(&self) -> u64 {
        self.invalid_recv.load(Ordering::Relaxed)
    }

    pub fn record_send(&self, bytes: usize, now: u64) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_send.store(now, Ordering::Relaxed);
    }

    pub fn record_recv(&self, bytes: usize, now: u64) {
        self.bytes_recv.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_recv.store(now, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) -> u64 {
        self.invalid_recv.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn version(&self) -> i32 {
        self.version.load(Ordering::Relaxed)
    }

    pub fn set_version(&self, version: i32) {
        self.version.store(version, Ordering::Relaxed);
    }

    pub fn services(&self) -> u64 {
        self.services.load(Ordering::Relaxed)
    }

    pub fn set_services(&self, services: u64) {
        self.services.store(services, Ordering::Relaxed);
    }

    pub fn starting_height(&self) -> i32 {
        self.starting_height.load(Ordering::Relaxed)
    }

    pub fn set_starting_height(&self, height: i32) {
        self.starting_height.store(height, Ordering::Relaxed);
    }

    pub fn set_checkpoint_height(&self, height: i32) {
        self.checkpoint_height.store(height, Ordering::Relaxed);
    }

    /// Height from the embedder's legacy checkpoint lookup. Nothing on the
    /// wire carries it, so the built-in handler never sets it and the sync
    /// height falls through to the starting height unless the node does.
    pub fn set_legacy_checkpoint_height(&self, height: i32) {
        self.legacy_checkpoint_height.store(height, Ordering::Relaxed);
    }

    pub fn subver(&self) -> String {
        lock_or_recover(&self.subver).clone()
    }

    pub fn set_subver(&self, subver: &str) {
        *lock_or_recover(&self.subver) = subver.to_string();
    }

    /// Best height the peer is believed to have reached.
    ///
    /// Cooperative checkpoint height, else the legacy checkpoint height,
    /// else the starting height; never below the starting height.
    pub fn sync_height(&self) -> i32 {
        let starting = self.starting_height();
        let mut height = self.checkpoint_height.load(Ordering::Relaxed);
        if height == 0 {
            height = self.legacy_checkpoint_height.load(Ordering::Relaxed);
        }
        if height == 0 {
            height = starting;
        }
        height.max(starting)
    }

    pub fn traffic(&self) -> TrafficStats {
        *lock_or_recover(&self.traffic)
    }

    pub(crate) fn traffic_mut(&self) -> std::sync::MutexGuard<'_, TrafficStats> {
        lock_or_recover(&self.traffic)
    }

    /// Flip to announced; false if observers already saw this peer connect
    pub(crate) fn mark_announced(&self) -> bool {
        !self.announced.swap(true, Ordering::AcqRel)
    }

    /// Flip back; true if the peer had been announced
    pub(crate) fn take_announced(&self) -> bool {
        self.announced.swap(false, Ordering::AcqRel)
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnect.load(Ordering::Acquire)
    }

    pub fn mark_disconnect(&self) {
        self.disconnect.store(true, Ordering::Release);
    }

    /// True once a forced disconnect could not take the send lock
    pub fn is_send_ended(&self) -> bool {
        self.send_ended.load(Ordering::Acquire)
    }

    pub fn send_lock(&self) -> &Mutex<SendQueue> {
        &self.send
    }

    pub fn recv_lock(&self) -> &Mutex<FrameDecoder> {
        &self.recv
    }

    pub fn inventory_lock(&self) -> &Mutex<PeerInventory> {
        &self.inventory
    }

    /// Duplicate handle of the socket for readiness registration
    pub fn socket_clone(&self) -> io::Result<TcpStream> {
        self.socket.try_clone()
    }

    pub fn shutdown_socket(&self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }

    /// Disconnect without ever blocking.
    ///
    /// With the send lock free the socket is shut down and the queue dropped
    /// right away; otherwise the queue is marked ended and the reactor
    /// finishes the job on its next pass.
    pub fn force_disconnect(&self) {
        match try_guard(&self.send) {
            Some(mut queue) => {
                self.shutdown_socket();
                queue.clear();
            }
            None => self.send_ended.store(true, Ordering::Release),
        }
        self.mark_disconnect();
    }

    /// True when none of the three per-peer locks is held
    pub fn locks_free(&self) -> bool {
        try_guard(&self.send).is_some()
            && try_guard(&self.recv).is_some()
            && try_guard(&self.inventory).is_some()
    }

    /// Read one chunk from the socket
    pub fn socket_recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.socket).read(buf)
    }

    /// Write as much of `queue` as the socket accepts without blocking.
    ///
    /// Stops on a transient error; a fatal error flags the peer for
    /// disconnect and is returned.
    pub fn socket_send(&self, queue: &mut SendQueue, now: u64) -> io::Result<usize> {
        let mut total = 0;
        if self.is_send_ended() {
            queue.clear();
            return Ok(0);
        }
        while let Some(front) = queue.buffers.front() {
            let front_len = front.len();
            match (&self.socket).write(&front[queue.offset..]) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    queue.offset += n;
                    if queue.offset < front_len {
                        break;
                    }
                    queue.size -= front_len;
                    queue.offset = 0;
                    queue.buffers.pop_front();
                }
                Err(e) if is_transient(&e) => break,
                Err(e) => {
                    self.mark_disconnect();
                    if total > 0 {
                        self.record_send(total, now);
                    }
                    return Err(e);
                }
            }
        }
        if total > 0 {
            self.record_send(total, now);
        }
        Ok(total)
    }

    pub fn stats(&self) -> PeerStats {
        let traffic = self.traffic();
        PeerStats {
            id: self.id,
            addr: self.addr.to_string(),
            inbound: self.inbound,
            conntime: self.conn_time,
            lastsend: self.last_send(),
            lastrecv: self.last_recv(),
            bytessent: self.bytes_sent(),
            bytesrecv: self.bytes_recv(),
            invalidrecv: self.invalid_recv(),
            version: self.version(),
            subver: self.subver(),
            services: format!("{:016x}", self.services()),
            startingheight: self.starting_height(),
            syncheight: self.sync_height(),
            trafficratio: traffic.ratio,
            trafficaverage: traffic.average,
            disconnecting: self.is_disconnecting(),
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("inbound", &self.inbound)
            .field("disconnect", &self.is_disconnecting())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::net::TcpListener;

    /// A connected loopback pair: the peer record and the remote end
    pub fn loopback_peer(id: PeerId, now: u64) -> (Peer, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let local = listener.local_addr().unwrap();
        let remote = TcpStream::connect(local).unwrap();
        let (socket, addr) = listener.accept().unwrap();
        (Peer::new(id, socket, addr, true, now).unwrap(), remote)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::loopback_peer;
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sync_height_fallback_chain() {
        let (peer, _remote) = loopback_peer(1, 0);
        peer.set_starting_height(100);
        assert_eq!(peer.sync_height(), 100);
        peer.set_legacy_checkpoint_height(150);
        assert_eq!(peer.sync_height(), 150);
        peer.set_checkpoint_height(200);
        assert_eq!(peer.sync_height(), 200);
        // never below the starting height
        peer.set_checkpoint_height(50);
        assert_eq!(peer.sync_height(), 100);
    }

    #[test]
    fn test_counters() {
        let (peer, _remote) = loopback_peer(1, 10);
        peer.record_recv(100, 11);
        peer.record_send(40, 12);
        assert_eq!(peer.bytes_recv(), 100);
        assert_eq!(peer.bytes_sent(), 40);
        assert_eq!(peer.last_recv(), 11);
        assert_eq!(peer.last_send(), 12);
        assert_eq!(peer.record_invalid(), 1);
        assert_eq!(peer.conn_time(), 10);
    }

    #[test]
    fn test_socket_send_flushes_queue() {
        let (peer, mut remote) = loopback_peer(1, 0);
        let mut queue = SendQueue::default();
        queue.push(vec![1, 2, 3]);
        queue.push(vec![4, 5]);
        assert_eq!(queue.pending_bytes(), 5);
        assert_eq!(peer.socket_send(&mut queue, 7).unwrap(), 5);
        assert!(queue.is_empty());
        assert_eq!(peer.bytes_sent(), 5);

        remote.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_force_disconnect_with_free_lock() {
        let (peer, _remote) = loopback_peer(1, 0);
        try_guard(peer.send_lock()).unwrap().push(vec![0; 10]);
        peer.force_disconnect();
        assert!(peer.is_disconnecting());
        assert!(!peer.is_send_ended());
        assert!(try_guard(peer.send_lock()).unwrap().is_empty());
    }

    #[test]
    fn test_force_disconnect_with_held_lock_does_not_block() {
        let (peer, _remote) = loopback_peer(1, 0);
        let held = peer.send_lock().lock().unwrap();
        peer.force_disconnect();
        assert!(peer.is_disconnecting());
        assert!(peer.is_send_ended());
        assert!(!peer.locks_free());
        drop(held);
        assert!(peer.locks_free());
    }

    #[test]
    fn test_send_ended_discards_queue() {
        let (peer, _remote) = loopback_peer(1, 0);
        {
            let _held = peer.send_lock().lock().unwrap();
            peer.force_disconnect();
        }
        let mut queue = try_guard(peer.send_lock()).unwrap();
        queue.push(vec![1]);
        assert_eq!(peer.socket_send(&mut queue, 0).unwrap(), 0);
        assert!(queue.is_empty());
    }
}
