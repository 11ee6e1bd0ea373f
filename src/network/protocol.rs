//! Bitcoin protocol framing and message payloads
//!
//! Every frame is a 24-byte header (magic, null-padded command, payload
//! length, checksum) followed by the payload. Payloads of the messages the
//! connection manager itself understands are bincode structs, as elsewhere
//! in the node; everything else is passed through opaque.

use crate::storage::hashing::double_sha256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bitcoin protocol constants
pub const BITCOIN_MAGIC_MAINNET: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];
pub const BITCOIN_MAGIC_TESTNET: [u8; 4] = [0x0b, 0x11, 0x09, 0x07];
pub const BITCOIN_MAGIC_REGTEST: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

/// Maximum declared payload size (32MB)
pub const MAX_PROTOCOL_MESSAGE_LENGTH: usize = 0x0200_0000;

pub const MESSAGE_HEADER_SIZE: usize = 24;
pub const COMMAND_SIZE: usize = 12;

/// Protocol version this node speaks
pub const PROTOCOL_VERSION: i32 = 70015;

/// Inventory type codes
pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("command '{0}' longer than {COMMAND_SIZE} bytes")]
    CommandTooLong(String),
    #[error("payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("header needs {MESSAGE_HEADER_SIZE} bytes, got {0}")]
    ShortHeader(usize),
    #[error("payload encoding: {0}")]
    Encoding(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Chain selection; decides the magic on frames and data files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainNetwork {
    Mainnet,
    Testnet,
    #[default]
    Regtest,
}

impl ChainNetwork {
    pub fn magic(&self) -> [u8; 4] {
        match self {
            ChainNetwork::Mainnet => BITCOIN_MAGIC_MAINNET,
            ChainNetwork::Testnet => BITCOIN_MAGIC_TESTNET,
            ChainNetwork::Regtest => BITCOIN_MAGIC_REGTEST,
        }
    }
}

impl std::str::FromStr for ChainNetwork {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "mainnet" | "main" => Ok(ChainNetwork::Mainnet),
            "testnet" | "test" => Ok(ChainNetwork::Testnet),
            "regtest" => Ok(ChainNetwork::Regtest),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

/// Fixed 24-byte frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: [u8; COMMAND_SIZE],
    pub payload_len: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MESSAGE_HEADER_SIZE {
            return Err(ProtocolError::ShortHeader(data.len()));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[0..4]);
        let mut command = [0u8; COMMAND_SIZE];
        command.copy_from_slice(&data[4..16]);
        let payload_len = u32::from_le_bytes([data[16], data[17], data[18], data[19]]);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&data[20..24]);
        Ok(Self {
            magic,
            command,
            payload_len,
            checksum,
        })
    }

    pub fn new(magic: [u8; 4], command: &str, payload: &[u8]) -> Result<Self> {
        if command.len() > COMMAND_SIZE {
            return Err(ProtocolError::CommandTooLong(command.to_string()));
        }
        if payload.len() > MAX_PROTOCOL_MESSAGE_LENGTH {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PROTOCOL_MESSAGE_LENGTH,
            });
        }
        let mut command_bytes = [0u8; COMMAND_SIZE];
        command_bytes[..command.len()].copy_from_slice(command.as_bytes());
        Ok(Self {
            magic,
            command: command_bytes,
            payload_len: payload.len() as u32,
            checksum: calculate_checksum(payload),
        })
    }

    pub fn encode(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut out = [0u8; MESSAGE_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic);
        out[4..16].copy_from_slice(&self.command);
        out[16..20].copy_from_slice(&self.payload_len.to_le_bytes());
        out[20..24].copy_from_slice(&self.checksum);
        out
    }

    /// Command name with the null padding stripped
    pub fn command_name(&self) -> String {
        String::from_utf8_lossy(&self.command)
            .trim_end_matches('\0')
            .to_string()
    }

    /// Printable ASCII up to the first null, nothing but nulls after it
    pub fn is_command_valid(&self) -> bool {
        let end = self
            .command
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMMAND_SIZE);
        end > 0
            && self.command[..end].iter().all(|b| (0x20..=0x7e).contains(b))
            && self.command[end..].iter().all(|&b| b == 0)
    }
}

/// First four bytes of the double SHA256 of the payload
pub fn calculate_checksum(payload: &[u8]) -> [u8; 4] {
    let hash = double_sha256(payload);
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&hash[..4]);
    checksum
}

/// Frame a raw payload under `command`
pub fn serialize_frame(magic: [u8; 4], command: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let header = MessageHeader::new(magic, command, payload)?;
    let mut frame = Vec::with_capacity(MESSAGE_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Messages the connection manager interprets itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    Version(VersionMessage),
    Verack,
    Ping(PingMessage),
    Pong(PongMessage),
    Inv(InvMessage),
    Checkpoint(CheckpointMessage),
}

/// Version message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

/// Ping message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingMessage {
    pub nonce: u64,
}

/// Pong message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongMessage {
    pub nonce: u64,
}

/// Inventory item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryItem {
    pub inv_type: u32,
    pub hash: [u8; 32],
}

/// Inventory message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvMessage {
    pub inventory: Vec<InventoryItem>,
}

/// Cooperative sync checkpoint announced by a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMessage {
    pub height: i32,
    pub hash: [u8; 32],
}

/// Bitcoin protocol message parser
pub struct ProtocolParser;

impl ProtocolParser {
    /// Decode the payload of a command this layer understands.
    ///
    /// Returns `Ok(None)` for commands that belong to other subsystems.
    pub fn parse_payload(command: &str, payload: &[u8]) -> Result<Option<ProtocolMessage>> {
        let message = match command {
            "version" => ProtocolMessage::Version(bincode::deserialize(payload)?),
            "verack" => ProtocolMessage::Verack,
            "ping" => ProtocolMessage::Ping(bincode::deserialize(payload)?),
            "pong" => ProtocolMessage::Pong(bincode::deserialize(payload)?),
            "inv" => ProtocolMessage::Inv(bincode::deserialize(payload)?),
            "checkpoint" => ProtocolMessage::Checkpoint(bincode::deserialize(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }

    /// Serialize a protocol message into a complete frame
    pub fn serialize_message(magic: [u8; 4], message: &ProtocolMessage) -> Result<Vec<u8>> {
        let (command, payload) = match message {
            ProtocolMessage::Version(msg) => ("version", bincode::serialize(msg)?),
            ProtocolMessage::Verack => ("verack", vec![]),
            ProtocolMessage::Ping(msg) => ("ping", bincode::serialize(msg)?),
            ProtocolMessage::Pong(msg) => ("pong", bincode::serialize(msg)?),
            ProtocolMessage::Inv(msg) => ("inv", bincode::serialize(msg)?),
            ProtocolMessage::Checkpoint(msg) => ("checkpoint", bincode::serialize(msg)?),
        };
        serialize_frame(magic, command, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let frame = serialize_frame(BITCOIN_MAGIC_MAINNET, "ping", &[1, 2, 3]).unwrap();
        assert_eq!(frame.len(), MESSAGE_HEADER_SIZE + 3);
        assert_eq!(&frame[0..4], &BITCOIN_MAGIC_MAINNET);
        assert_eq!(&frame[4..8], b"ping");
        assert!(frame[8..16].iter().all(|&b| b == 0));
        assert_eq!(u32::from_le_bytes([frame[16], frame[17], frame[18], frame[19]]), 3);
        assert_eq!(&frame[20..24], &calculate_checksum(&[1, 2, 3]));
    }

    #[test]
    fn test_empty_payload_checksum() {
        // Well-known checksum of the empty payload (verack)
        assert_eq!(calculate_checksum(&[]), [0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn test_command_validity() {
        let good = MessageHeader::new(BITCOIN_MAGIC_REGTEST, "version", &[]).unwrap();
        assert!(good.is_command_valid());
        assert_eq!(good.command_name(), "version");

        let mut bad = good;
        bad.command[9] = b'x'; // non-null after the terminator
        assert!(!bad.is_command_valid());

        let mut ctrl = good;
        ctrl.command[0] = 0x07;
        assert!(!ctrl.is_command_valid());
    }

    #[test]
    fn test_command_too_long() {
        assert!(matches!(
            MessageHeader::new(BITCOIN_MAGIC_REGTEST, "thirteenchars", &[]),
            Err(ProtocolError::CommandTooLong(_))
        ));
    }

    #[test]
    fn test_version_message_roundtrip() {
        let msg = ProtocolMessage::Version(VersionMessage {
            version: PROTOCOL_VERSION,
            services: 1,
            timestamp: 0,
            nonce: 7,
            user_agent: "/bllvm-connman:0.1.0/".to_string(),
            start_height: 1234,
            relay: true,
        });
        let frame = ProtocolParser::serialize_message(BITCOIN_MAGIC_REGTEST, &msg).unwrap();
        let header = MessageHeader::parse(&frame).unwrap();
        let payload = &frame[MESSAGE_HEADER_SIZE..];
        assert_eq!(header.checksum, calculate_checksum(payload));
        let parsed = ProtocolParser::parse_payload(&header.command_name(), payload).unwrap();
        assert_eq!(parsed, Some(msg));
    }

    #[test]
    fn test_unknown_command_is_passed_through() {
        assert!(ProtocolParser::parse_payload("block", &[0xff]).unwrap().is_none());
    }

    #[test]
    fn test_network_from_str() {
        assert_eq!("main".parse::<ChainNetwork>().unwrap(), ChainNetwork::Mainnet);
        assert!("signet".parse::<ChainNetwork>().is_err());
        assert_eq!(ChainNetwork::Testnet.magic(), BITCOIN_MAGIC_TESTNET);
    }
}
