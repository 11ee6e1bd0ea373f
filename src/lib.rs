//! BLLVM connection manager
//!
//! Peer connection management for a Bitcoin node with an inline heuristic
//! firewall. A single reactor thread owns every socket, a dispatcher thread
//! runs protocol handling, and every outbound send first passes through the
//! firewall's detection pipeline.
//!
//! ## Layout
//!
//! - [`network`]: frames, peers, the connection directory, the reactor and
//!   dispatcher threads, and [`network::ConnectionManager`] tying them together
//! - [`firewall`]: baseline tracking, the four attack filters and mitigation
//! - [`storage`]: checksummed flat files for the ban and address tables
//! - [`rpc`]: JSON-RPC control methods
//! - [`config`]: every tunable, loadable from JSON or TOML

pub mod config;
pub mod firewall;
pub mod network;
pub mod rpc;
pub mod storage;
pub mod utils;

pub use config::NodeConfig;
pub use firewall::Firewall;
pub use network::ConnectionManager;
