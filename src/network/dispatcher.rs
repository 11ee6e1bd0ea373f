//! Message dispatcher
//!
//! The protocol-level half of the connection manager. Each pass walks a
//! directory snapshot and, per peer:
//!
//! 1. initializes handler state the first time the peer is seen
//! 2. pops at most one complete frame off the receive queue, validates its
//!    header and hands it to the [`MessageHandler`]
//! 3. runs the firewall send hook; a verdict aborts the send
//! 4. lets the handler queue outbound messages and flushes them with an
//!    optimistic write, waking the reactor if bytes are left over
//!
//! Per-peer locks are only ever tried. A busy lock skips that step for the
//! peer until the next pass.

use crate::firewall::Firewall;
use crate::network::directory::ConnectionDirectory;
use crate::network::frame::NetMessage;
use crate::network::peer::{Peer, PeerId};
use crate::network::protocol::{
    calculate_checksum, serialize_frame, ProtocolError, ProtocolMessage, ProtocolParser,
};
use crate::utils::lock::try_guard;
use crate::utils::time::current_timestamp;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("malformed payload: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("protocol violation: {0}")]
    Violation(String),
}

/// Protocol logic plugged into the dispatcher.
///
/// Handlers run on the dispatcher thread only. Anything they queue through
/// [`PeerContext`] is flushed after the firewall send hook has passed.
pub trait MessageHandler: Send {
    fn initialize_peer(&mut self, _ctx: &mut PeerContext<'_>) {}

    /// Handle one validated frame. An error counts as an invalid frame.
    fn process_message(
        &mut self,
        ctx: &mut PeerContext<'_>,
        command: &str,
        payload: &[u8],
    ) -> Result<(), HandlerError>;

    fn send_messages(&mut self, _ctx: &mut PeerContext<'_>) {}

    /// Called once after the peer is disconnected
    fn finalize_peer(&mut self, _id: PeerId) {}
}

/// The peer being serviced plus its pending outbound frames
pub struct PeerContext<'a> {
    peer: &'a Peer,
    outbound: &'a mut VecDeque<Vec<u8>>,
    magic: [u8; 4],
    now: u64,
}

impl<'a> PeerContext<'a> {
    pub fn new(peer: &'a Peer, outbound: &'a mut VecDeque<Vec<u8>>, magic: [u8; 4], now: u64) -> Self {
        Self {
            peer,
            outbound,
            magic,
            now,
        }
    }

    pub fn peer(&self) -> &Peer {
        self.peer
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }

    /// Queue a message the connection manager understands
    pub fn push_message(&mut self, message: &ProtocolMessage) -> Result<(), ProtocolError> {
        let frame = ProtocolParser::serialize_message(self.magic, message)?;
        self.outbound.push_back(frame);
        Ok(())
    }

    /// Queue an opaque payload under `command`
    pub fn push_raw(&mut self, command: &str, payload: &[u8]) -> Result<(), ProtocolError> {
        let frame = serialize_frame(self.magic, command, payload)?;
        self.outbound.push_back(frame);
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.outbound.len()
    }
}

struct PeerState {
    peer: Arc<Peer>,
    outbound: VecDeque<Vec<u8>>,
}

/// Something that can be woken after the dispatcher leaves bytes queued
pub trait Wake: Send + Sync {
    fn wake(&self);
}

impl Wake for mio::Waker {
    fn wake(&self) {
        if let Err(e) = mio::Waker::wake(self) {
            debug!("Failed to wake reactor: {}", e);
        }
    }
}

pub struct Dispatcher {
    directory: Arc<ConnectionDirectory>,
    firewall: Arc<Firewall>,
    handler: Box<dyn MessageHandler>,
    magic: [u8; 4],
    states: HashMap<PeerId, PeerState>,
    reactor: Option<Arc<dyn Wake>>,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<ConnectionDirectory>,
        firewall: Arc<Firewall>,
        handler: Box<dyn MessageHandler>,
        magic: [u8; 4],
    ) -> Self {
        Self {
            directory,
            firewall,
            handler,
            magic,
            states: HashMap::new(),
            reactor: None,
        }
    }

    pub fn with_reactor_waker(mut self, waker: Arc<dyn Wake>) -> Self {
        self.reactor = Some(waker);
        self
    }

    /// Loop until `shutdown` is set. Sleeps on `wake` when a pass found
    /// no further queued frames.
    pub fn run(mut self, wake: Receiver<()>, shutdown: Arc<AtomicBool>, idle_wait: Duration) {
        debug!("Dispatcher started");
        while !shutdown.load(Ordering::Acquire) {
            let more = self.tick(current_timestamp());
            if more {
                continue;
            }
            match wake.recv_timeout(idle_wait) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        for (id, _) in self.states.drain() {
            self.handler.finalize_peer(id);
        }
        debug!("Dispatcher stopped");
    }

    /// One pass over every live peer. Returns true if any peer still has a
    /// complete frame waiting.
    pub fn tick(&mut self, now: u64) -> bool {
        let snapshot = self.directory.snapshot();
        let mut more = false;
        let mut live = HashSet::with_capacity(snapshot.len());

        for peer in &snapshot {
            if peer.is_disconnecting() {
                continue;
            }
            live.insert(peer.id());

            let state = self.states.entry(peer.id()).or_insert_with(|| {
                let mut state = PeerState {
                    peer: Arc::clone(peer),
                    outbound: VecDeque::new(),
                };
                let mut ctx = PeerContext::new(peer, &mut state.outbound, self.magic, now);
                self.handler.initialize_peer(&mut ctx);
                state
            });

            let message = try_guard(peer.recv_lock()).and_then(|mut decoder| {
                let message = decoder.pop_complete();
                more |= decoder.has_complete();
                message
            });
            if let Some(message) = message {
                Self::process(&mut *self.handler, self.magic, peer, &mut state.outbound, &message, now);
            }

            if peer.is_disconnecting() {
                continue;
            }
            self.send(peer, now);
        }

        let gone: Vec<PeerId> = self
            .states
            .keys()
            .filter(|id| !live.contains(id))
            .copied()
            .collect();
        for id in gone {
            if let Some(state) = self.states.remove(&id) {
                trace!("Finalizing peer {} ({})", id, state.peer.addr());
                self.handler.finalize_peer(id);
            }
        }
        more
    }

    fn process(
        handler: &mut dyn MessageHandler,
        magic: [u8; 4],
        peer: &Peer,
        outbound: &mut VecDeque<Vec<u8>>,
        message: &NetMessage,
        now: u64,
    ) {
        let header = match message.header() {
            Some(header) => *header,
            None => return,
        };

        if header.magic != magic {
            warn!(
                "Peer {} ({}) sent frame with wrong magic {}",
                peer.id(),
                peer.addr(),
                hex::encode(header.magic)
            );
            peer.force_disconnect();
            return;
        }

        if !header.is_command_valid() {
            debug!("Peer {}: invalid command bytes {}", peer.id(), hex::encode(header.command));
            peer.record_invalid();
            return;
        }

        let command = header.command_name();
        let payload = message.payload();
        if calculate_checksum(payload) != header.checksum {
            debug!(
                "Peer {}: checksum mismatch on {} ({} bytes)",
                peer.id(),
                command,
                payload.len()
            );
            peer.record_invalid();
            return;
        }

        trace!("Peer {}: {} ({} bytes)", peer.id(), command, payload.len());
        let mut ctx = PeerContext::new(peer, outbound, magic, now);
        if let Err(e) = handler.process_message(&mut ctx, &command, payload) {
            debug!("Peer {}: {} rejected: {}", peer.id(), command, e);
            peer.record_invalid();
        }
    }

    fn send(&mut self, peer: &Arc<Peer>, now: u64) {
        let Some(state) = self.states.get_mut(&peer.id()) else {
            return;
        };

        if !self.firewall.on_send(peer, now) {
            state.outbound.clear();
            return;
        }

        let mut ctx = PeerContext::new(peer, &mut state.outbound, self.magic, now);
        self.handler.send_messages(&mut ctx);
        if state.outbound.is_empty() {
            return;
        }

        let Some(mut queue) = try_guard(peer.send_lock()) else {
            return;
        };
        for frame in state.outbound.drain(..) {
            queue.push(frame);
        }
        if let Err(e) = peer.socket_send(&mut queue, now) {
            debug!("Peer {}: send failed: {}", peer.id(), e);
        }
        if !queue.is_empty() {
            if let Some(reactor) = &self.reactor {
                reactor.wake();
            }
        }
    }
}
