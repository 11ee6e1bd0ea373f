//! Default message handler
//!
//! Version handshake, keepalive pings, inventory bookkeeping and
//! cooperative checkpoint heights: the message types whose fields feed the
//! firewall's peer statistics. Every other command is left to the rest of
//! the node and accepted as-is.

use crate::network::dispatcher::{HandlerError, MessageHandler, PeerContext};
use crate::network::peer::PeerId;
use crate::network::protocol::{
    InvMessage, PingMessage, PongMessage, ProtocolMessage, ProtocolParser, VersionMessage,
    PROTOCOL_VERSION,
};
use crate::utils::lock::try_guard;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Seconds between keepalive pings
pub const PING_INTERVAL: u64 = 2 * 60;

pub const DEFAULT_USER_AGENT: &str = concat!("/bllvm-connman:", env!("CARGO_PKG_VERSION"), "/");

#[derive(Debug, Default)]
struct HandshakeState {
    version_sent: bool,
    version_received: bool,
    verack_received: bool,
    last_ping: u64,
    ping_nonce: Option<u64>,
}

impl HandshakeState {
    fn is_complete(&self) -> bool {
        self.version_received && self.verack_received
    }
}

/// What this node announces in its own version message
#[derive(Debug, Clone)]
pub struct LocalVersion {
    pub services: u64,
    pub start_height: i32,
    pub user_agent: String,
}

impl Default for LocalVersion {
    fn default() -> Self {
        Self {
            services: 0,
            start_height: 0,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct HandshakeHandler {
    local: LocalVersion,
    peers: HashMap<PeerId, HandshakeState>,
}

impl HandshakeHandler {
    pub fn new(local: LocalVersion) -> Self {
        Self {
            local,
            peers: HashMap::new(),
        }
    }

    pub fn is_handshake_complete(&self, id: PeerId) -> bool {
        self.peers.get(&id).map(HandshakeState::is_complete).unwrap_or(false)
    }

    fn send_version(&self, ctx: &mut PeerContext<'_>) -> Result<(), HandlerError> {
        let version = VersionMessage {
            version: PROTOCOL_VERSION,
            services: self.local.services,
            timestamp: ctx.now() as i64,
            nonce: rand::random(),
            user_agent: self.local.user_agent.clone(),
            start_height: self.local.start_height,
            relay: true,
        };
        ctx.push_message(&ProtocolMessage::Version(version))?;
        Ok(())
    }
}

impl MessageHandler for HandshakeHandler {
    fn initialize_peer(&mut self, ctx: &mut PeerContext<'_>) {
        let mut state = HandshakeState {
            last_ping: ctx.now(),
            ..HandshakeState::default()
        };
        if !ctx.peer().is_inbound() {
            match self.send_version(ctx) {
                Ok(()) => state.version_sent = true,
                Err(e) => debug!("Peer {}: failed to queue version: {}", ctx.peer().id(), e),
            }
        }
        self.peers.insert(ctx.peer().id(), state);
    }

    fn process_message(
        &mut self,
        ctx: &mut PeerContext<'_>,
        command: &str,
        payload: &[u8],
    ) -> Result<(), HandlerError> {
        let message = match ProtocolParser::parse_payload(command, payload)? {
            Some(message) => message,
            None => {
                trace!("Peer {}: passing through {}", ctx.peer().id(), command);
                return Ok(());
            }
        };
        let id = ctx.peer().id();

        match message {
            ProtocolMessage::Version(version) => {
                let already = self.peers.get(&id).map(|s| s.version_received).unwrap_or(false);
                if already {
                    return Err(HandlerError::Violation("duplicate version".into()));
                }
                let peer = ctx.peer();
                peer.set_version(version.version);
                peer.set_services(version.services);
                peer.set_starting_height(version.start_height);
                peer.set_subver(&version.user_agent);
                debug!(
                    "Peer {} ({}) version={} height={} agent={}",
                    id,
                    peer.addr(),
                    version.version,
                    version.start_height,
                    version.user_agent
                );

                let version_sent = self.peers.get(&id).map(|s| s.version_sent).unwrap_or(false);
                if !version_sent {
                    self.send_version(ctx)?;
                }
                ctx.push_message(&ProtocolMessage::Verack)?;
                let state = self.peers.entry(id).or_default();
                state.version_sent = true;
                state.version_received = true;
            }
            ProtocolMessage::Verack => {
                self.peers.entry(id).or_default().verack_received = true;
            }
            ProtocolMessage::Ping(ping) => {
                ctx.push_message(&ProtocolMessage::Pong(PongMessage { nonce: ping.nonce }))?;
            }
            ProtocolMessage::Pong(pong) => {
                if let Some(state) = self.peers.get_mut(&id) {
                    if state.ping_nonce == Some(pong.nonce) {
                        state.ping_nonce = None;
                    }
                }
            }
            ProtocolMessage::Inv(inv) => match try_guard(ctx.peer().inventory_lock()) {
                Some(mut known) => {
                    let added = known.add_known(&inv.inventory);
                    trace!("Peer {}: {} new inventory items", id, added);
                }
                None => trace!("Peer {}: inventory busy, dropping inv", id),
            },
            ProtocolMessage::Checkpoint(checkpoint) => {
                ctx.peer().set_checkpoint_height(checkpoint.height);
            }
        }
        Ok(())
    }

    fn send_messages(&mut self, ctx: &mut PeerContext<'_>) {
        let id = ctx.peer().id();
        let Some(state) = self.peers.get_mut(&id) else {
            return;
        };
        if !state.is_complete() {
            return;
        }

        if ctx.now().saturating_sub(state.last_ping) >= PING_INTERVAL {
            let nonce = rand::random();
            if ctx.push_message(&ProtocolMessage::Ping(PingMessage { nonce })).is_ok() {
                state.last_ping = ctx.now();
                state.ping_nonce = Some(nonce);
            }
        }

        let announcements = match try_guard(ctx.peer().inventory_lock()) {
            Some(mut inventory) => inventory.take_announcements(),
            None => return,
        };
        if !announcements.is_empty() {
            let inv = ProtocolMessage::Inv(InvMessage {
                inventory: announcements,
            });
            if let Err(e) = ctx.push_message(&inv) {
                debug!("Peer {}: failed to queue inv: {}", id, e);
            }
        }
    }

    fn finalize_peer(&mut self, id: PeerId) {
        self.peers.remove(&id);
    }
}
