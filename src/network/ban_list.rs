//! Subnet bans
//!
//! A ban covers a CIDR subnet until an absolute Unix time. Conflicting bans
//! on the same subnet resolve to the longest one: a later ban never
//! shortens an existing entry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Ban duration used when a caller asks for 0 seconds
pub const DEFAULT_BAN_TIME: u64 = 24 * 60 * 60;

/// Why a subnet was banned; the discriminant is the persisted reason code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BanReason {
    Unknown = 0,
    NodeMisbehaving = 1,
    ManuallyAdded = 2,
    BandwidthAbuse = 3,
    DoubleSpendWallet = 4,
    InvalidWallet = 5,
    ForkedWallet = 6,
    FloodingWallet = 7,
    DdosWallet = 8,
}

impl BanReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BanReason::Unknown => "unknown",
            BanReason::NodeMisbehaving => "node misbehaving",
            BanReason::ManuallyAdded => "manually added",
            BanReason::BandwidthAbuse => "bandwidth abuse",
            BanReason::DoubleSpendWallet => "double spend wallet",
            BanReason::InvalidWallet => "invalid wallet",
            BanReason::ForkedWallet => "forked wallet",
            BanReason::FloodingWallet => "flooding wallet",
            BanReason::DdosWallet => "ddos wallet",
        }
    }
}

impl fmt::Display for BanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubNetParseError {
    #[error("invalid address: {0}")]
    Address(String),
    #[error("invalid prefix length: {0}")]
    Prefix(String),
}

/// CIDR subnet; the stored network address is always masked
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubNet {
    network: IpAddr,
    prefix_len: u8,
}

impl SubNet {
    /// Subnet of exactly one host (/32 or /128)
    pub fn single(ip: IpAddr) -> Self {
        let ip = ip.to_canonical();
        let prefix_len = max_prefix(&ip);
        Self {
            network: ip,
            prefix_len,
        }
    }

    pub fn new(ip: IpAddr, prefix_len: u8) -> Result<Self, SubNetParseError> {
        let ip = ip.to_canonical();
        if prefix_len > max_prefix(&ip) {
            return Err(SubNetParseError::Prefix(prefix_len.to_string()));
        }
        Ok(Self {
            network: mask(ip, prefix_len),
            prefix_len,
        })
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        ip.is_ipv4() == self.network.is_ipv4() && mask(ip, self.prefix_len) == self.network
    }
}

fn max_prefix(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask(ip: IpAddr, prefix_len: u8) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let m = u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0);
            IpAddr::V4((bits & m).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let m = u128::MAX.checked_shl(128 - u32::from(prefix_len)).unwrap_or(0);
            IpAddr::V6((bits & m).into())
        }
    }
}

impl fmt::Display for SubNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for SubNet {
    type Err = SubNetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let ip: IpAddr = addr
            .trim()
            .parse()
            .map_err(|_| SubNetParseError::Address(addr.to_string()))?;
        match prefix {
            None => Ok(SubNet::single(ip)),
            Some(p) => {
                let len: u8 = p
                    .trim()
                    .parse()
                    .map_err(|_| SubNetParseError::Prefix(p.to_string()))?;
                SubNet::new(ip, len)
            }
        }
    }
}

/// One ban table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEntry {
    pub create_time: u64,
    pub ban_until: u64,
    pub reason: BanReason,
}

impl BanEntry {
    pub fn new(create_time: u64, ban_until: u64, reason: BanReason) -> Self {
        Self {
            create_time,
            ban_until,
            reason,
        }
    }

    pub fn is_active(&self, now: u64) -> bool {
        now < self.ban_until
    }
}

/// Serialized form of the ban table
pub type BanMap = BTreeMap<SubNet, BanEntry>;

/// Subnet → ban entry, with a dirty bit for the flush task
#[derive(Debug, Clone, Default)]
pub struct BanTable {
    entries: BanMap,
    dirty: bool,
}

impl BanTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a loaded map without marking the table dirty
    pub fn from_map(entries: BanMap) -> Self {
        Self {
            entries,
            dirty: false,
        }
    }

    /// Ban `subnet` for `ban_time` seconds from `now` (0 = default), or until
    /// the absolute time `ban_time` when `absolute` is set.
    ///
    /// Returns true if the table changed.
    pub fn ban(
        &mut self,
        subnet: SubNet,
        reason: BanReason,
        ban_time: u64,
        absolute: bool,
        now: u64,
    ) -> bool {
        let until = if absolute {
            ban_time
        } else {
            let offset = if ban_time == 0 {
                DEFAULT_BAN_TIME
            } else {
                ban_time
            };
            now.saturating_add(offset)
        };
        self.insert(subnet, BanEntry::new(now, until, reason))
    }

    /// Insert with longest-ban-wins resolution
    pub fn insert(&mut self, subnet: SubNet, entry: BanEntry) -> bool {
        match self.entries.get_mut(&subnet) {
            Some(existing) if existing.ban_until >= entry.ban_until => false,
            Some(existing) => {
                *existing = entry;
                self.dirty = true;
                true
            }
            None => {
                self.entries.insert(subnet, entry);
                self.dirty = true;
                true
            }
        }
    }

    pub fn unban(&mut self, subnet: &SubNet) -> bool {
        let removed = self.entries.remove(subnet).is_some();
        self.dirty |= removed;
        removed
    }

    /// True if any subnet covering `ip` is banned at `now`
    pub fn is_banned(&self, ip: IpAddr, now: u64) -> bool {
        self.entries
            .iter()
            .any(|(subnet, entry)| entry.is_active(now) && subnet.contains(ip))
    }

    pub fn is_subnet_banned(&self, subnet: &SubNet, now: u64) -> bool {
        self.entries
            .get(subnet)
            .map(|e| e.is_active(now))
            .unwrap_or(false)
    }

    pub fn get(&self, subnet: &SubNet) -> Option<&BanEntry> {
        self.entries.get(subnet)
    }

    /// Drop every entry whose `ban_until` is before `now`
    pub fn sweep(&mut self, now: u64) -> Vec<SubNet> {
        let expired: Vec<SubNet> = self
            .entries
            .iter()
            .filter(|(_, e)| e.ban_until < now)
            .map(|(s, _)| *s)
            .collect();
        for subnet in &expired {
            self.entries.remove(subnet);
        }
        if !expired.is_empty() {
            self.dirty = true;
        }
        expired
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.dirty = true;
        }
    }

    pub fn entries(&self) -> &BanMap {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }
}
