//! Shared helpers for integration tests

#![allow(dead_code)]

use bllvm_connman::config::NodeConfig;
use bllvm_connman::network::peer::{Peer, PeerId};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;

/// A peer wrapping the accepted half of a loopback connection, plus the
/// remote end to talk to it through
pub fn loopback_peer(id: PeerId, now: u64) -> (Arc<Peer>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let remote = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (socket, addr) = listener.accept().unwrap();
    let peer = Peer::new(id, socket, addr, true, now).unwrap();
    (Arc::new(peer), remote)
}

/// Default config with persistence under `dir` and the flooding pattern
/// list emptied so only the filter under test can fire
pub fn test_config(dir: &Path) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.storage.data_dir = dir.to_string_lossy().into_owned();
    config.firewall.flooding_wallet.attack_patterns = Default::default();
    config
}
