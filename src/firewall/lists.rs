//! Operator-managed string lists
//!
//! Whitelist, blacklist seed, fork heights and the flooding attack/ignore
//! patterns all share one shape: an append-only list of literal strings
//! matched by exact equality. Removal blanks the slot instead of shifting,
//! so indices an operator has already seen keep pointing at the same entry.

use serde::{Deserialize, Serialize};

/// Append-only list of literal strings with blank-slot removal.
///
/// The empty string is the removed-slot sentinel and never matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotList(Vec<String>);

impl SlotList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(entries.into_iter().map(Into::into).collect())
    }

    /// Append an entry, returning its slot index.
    ///
    /// Empty strings are the removal sentinel and are not appended.
    pub fn push(&mut self, entry: impl Into<String>) -> Option<usize> {
        let entry = entry.into();
        if entry.is_empty() {
            return None;
        }
        self.0.push(entry);
        Some(self.0.len() - 1)
    }

    /// Blank every slot exactly equal to `entry`. Returns true if any slot changed.
    pub fn remove(&mut self, entry: &str) -> bool {
        if entry.is_empty() {
            return false;
        }
        let mut removed = false;
        for slot in self.0.iter_mut().filter(|s| s.as_str() == entry) {
            slot.clear();
            removed = true;
        }
        removed
    }

    /// Exact-equality membership test; never matches the empty sentinel.
    pub fn contains(&self, value: &str) -> bool {
        !value.is_empty() && self.0.iter().any(|s| s == value)
    }

    /// Non-blank entries in slot order.
    pub fn active(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str).filter(|s| !s.is_empty())
    }

    /// Every slot, blanks included.
    pub fn slots(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}
