//! Incremental frame decoder
//!
//! Bytes arrive from the reactor in whatever chunks the socket hands out.
//! The decoder keeps a queue of messages, the newest of which may still be
//! filling up; every chunk boundary inside a header or payload is fine.
//!
//! Payload buffers grow in bounded steps rather than to the declared size up
//! front, so a peer announcing a 32MB message must actually send 32MB before
//! we hold 32MB for it.

use crate::network::protocol::{MessageHeader, MAX_PROTOCOL_MESSAGE_LENGTH, MESSAGE_HEADER_SIZE};
use std::collections::VecDeque;
use thiserror::Error;

/// Largest single growth step of a payload buffer
pub const PAYLOAD_GROWTH_STEP: usize = 256 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("declared payload size {size} exceeds maximum {max}")]
    Oversized { size: usize, max: usize },
    #[error("decoder already failed on this stream")]
    Poisoned,
}

/// One message on the receive queue, possibly still incomplete
#[derive(Debug, Clone)]
pub struct NetMessage {
    header_buf: [u8; MESSAGE_HEADER_SIZE],
    header_pos: usize,
    header: Option<MessageHeader>,
    data: Vec<u8>,
    data_pos: usize,
}

impl NetMessage {
    fn new() -> Self {
        Self {
            header_buf: [0u8; MESSAGE_HEADER_SIZE],
            header_pos: 0,
            header: None,
            data: Vec::new(),
            data_pos: 0,
        }
    }

    fn in_data(&self) -> bool {
        self.header.is_some()
    }

    pub fn is_complete(&self) -> bool {
        match &self.header {
            Some(h) => h.payload_len as usize == self.data_pos,
            None => false,
        }
    }

    /// Parsed header, once all 24 header bytes have arrived
    pub fn header(&self) -> Option<&MessageHeader> {
        self.header.as_ref()
    }

    pub fn command(&self) -> String {
        self.header.map(|h| h.command_name()).unwrap_or_default()
    }

    /// Payload bytes received so far
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.data_pos]
    }

    /// Bytes held in memory for this message
    pub fn buffered_size(&self) -> usize {
        self.header_pos + self.data.len()
    }

    fn read_header(&mut self, bytes: &[u8], max_size: usize) -> Result<usize, FrameError> {
        let remaining = MESSAGE_HEADER_SIZE - self.header_pos;
        let copy = remaining.min(bytes.len());
        self.header_buf[self.header_pos..self.header_pos + copy].copy_from_slice(&bytes[..copy]);
        self.header_pos += copy;

        if self.header_pos < MESSAGE_HEADER_SIZE {
            return Ok(copy);
        }

        // A full header buffer always parses; size is the only thing to reject
        let header = MessageHeader::parse(&self.header_buf).map_err(|_| FrameError::Poisoned)?;
        let size = header.payload_len as usize;
        if size > max_size {
            return Err(FrameError::Oversized {
                size,
                max: max_size,
            });
        }
        self.header = Some(header);
        Ok(copy)
    }

    fn read_data(&mut self, bytes: &[u8]) -> usize {
        let declared = self.header.map(|h| h.payload_len as usize).unwrap_or(0);
        let copy = (declared - self.data_pos).min(bytes.len());

        if self.data.len() < self.data_pos + copy {
            let target = declared.min(self.data_pos + copy + PAYLOAD_GROWTH_STEP);
            self.data.resize(target, 0);
        }

        self.data[self.data_pos..self.data_pos + copy].copy_from_slice(&bytes[..copy]);
        self.data_pos += copy;
        copy
    }
}

/// Receive-side framing state of one peer
#[derive(Debug)]
pub struct FrameDecoder {
    messages: VecDeque<NetMessage>,
    max_size: usize,
    failed: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_size(MAX_PROTOCOL_MESSAGE_LENGTH)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            max_size,
            failed: false,
        }
    }

    /// Feed a chunk of received bytes.
    ///
    /// Returns how many messages this chunk completed. On error the message
    /// being assembled is discarded and the decoder refuses all further
    /// input; the caller is expected to disconnect.
    pub fn feed(&mut self, mut bytes: &[u8]) -> Result<usize, FrameError> {
        if self.failed {
            return Err(FrameError::Poisoned);
        }

        let mut completed = 0;
        while !bytes.is_empty() {
            if self.messages.back().map_or(true, NetMessage::is_complete) {
                self.messages.push_back(NetMessage::new());
            }
            let Some(msg) = self.messages.back_mut() else {
                break;
            };

            let used = if msg.in_data() {
                msg.read_data(bytes)
            } else {
                match msg.read_header(bytes, self.max_size) {
                    Ok(n) => n,
                    Err(e) => {
                        self.messages.pop_back();
                        self.failed = true;
                        return Err(e);
                    }
                }
            };

            if msg.is_complete() {
                completed += 1;
            }
            bytes = &bytes[used..];
        }
        Ok(completed)
    }

    /// Take the oldest message if it is complete
    pub fn pop_complete(&mut self) -> Option<NetMessage> {
        if self.messages.front().map_or(false, NetMessage::is_complete) {
            self.messages.pop_front()
        } else {
            None
        }
    }

    pub fn has_complete(&self) -> bool {
        self.messages.front().map_or(false, NetMessage::is_complete)
    }

    /// True while the newest message still waits for bytes
    pub fn has_incomplete_tail(&self) -> bool {
        self.messages.back().map_or(false, |m| !m.is_complete())
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Total bytes held across all queued messages
    pub fn buffered_size(&self) -> usize {
        self.messages.iter().map(NetMessage::buffered_size).sum()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
