//! Per-peer inventory tracking
//!
//! Lives behind the peer's inventory lock. The connection manager only
//! records what a peer announced and what is queued for announcement; the
//! meaning of the hashes belongs to the relay layer.

use super::protocol::InventoryItem;
use std::collections::HashSet;
use tracing::debug;

/// Known-set size at which the oldest knowledge is dropped wholesale
pub const MAX_KNOWN_INVENTORY: usize = 50_000;

/// Largest batch handed out by [`PeerInventory::take_announcements`]
pub const MAX_INV_BATCH: usize = 1000;

#[derive(Debug, Default)]
pub struct PeerInventory {
    known: HashSet<InventoryItem>,
    to_announce: Vec<InventoryItem>,
}

impl PeerInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record items the peer announced; returns how many were new
    pub fn add_known(&mut self, items: &[InventoryItem]) -> usize {
        if self.known.len() + items.len() > MAX_KNOWN_INVENTORY {
            debug!("Known inventory full, resetting");
            self.known.clear();
        }
        items.iter().filter(|item| self.known.insert(**item)).count()
    }

    pub fn is_known(&self, item: &InventoryItem) -> bool {
        self.known.contains(item)
    }

    /// Queue an item for announcement unless the peer already has it
    pub fn push_announcement(&mut self, item: InventoryItem) -> bool {
        if self.known.contains(&item) || self.to_announce.contains(&item) {
            return false;
        }
        self.to_announce.push(item);
        true
    }

    /// Drain up to [`MAX_INV_BATCH`] queued announcements, marking them known
    pub fn take_announcements(&mut self) -> Vec<InventoryItem> {
        let n = self.to_announce.len().min(MAX_INV_BATCH);
        let batch: Vec<InventoryItem> = self.to_announce.drain(..n).collect();
        self.known.extend(batch.iter().copied());
        batch
    }

    pub fn known_len(&self) -> usize {
        self.known.len()
    }

    pub fn pending_len(&self) -> usize {
        self.to_announce.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::{MSG_BLOCK, MSG_TX};

    fn item(t: u32, b: u8) -> InventoryItem {
        InventoryItem {
            inv_type: t,
            hash: [b; 32],
        }
    }

    #[test]
    fn test_add_known_counts_new() {
        let mut inv = PeerInventory::new();
        assert_eq!(inv.add_known(&[item(MSG_TX, 1), item(MSG_BLOCK, 2)]), 2);
        assert_eq!(inv.add_known(&[item(MSG_TX, 1)]), 0);
        assert!(inv.is_known(&item(MSG_BLOCK, 2)));
    }

    #[test]
    fn test_known_items_not_announced() {
        let mut inv = PeerInventory::new();
        inv.add_known(&[item(MSG_TX, 1)]);
        assert!(!inv.push_announcement(item(MSG_TX, 1)));
        assert!(inv.push_announcement(item(MSG_TX, 3)));
        assert!(!inv.push_announcement(item(MSG_TX, 3)));
        assert_eq!(inv.take_announcements(), vec![item(MSG_TX, 3)]);
        assert_eq!(inv.pending_len(), 0);
        assert!(inv.is_known(&item(MSG_TX, 3)));
    }
}
