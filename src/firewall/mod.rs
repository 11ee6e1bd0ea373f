//! Inline heuristic firewall
//!
//! The [`Firewall`] context owns the live tunables and the process-wide
//! [`Baseline`]. It is shared by reference with the reactor (connect hook),
//! the dispatcher (send hook) and the RPC layer; nothing in here is global.
//!
//! Baseline folding only ever happens from the dispatcher thread, but the
//! baseline still sits behind a mutex so RPC snapshots stay consistent.

/// Log a firewall event at `info` when its live-debug topic is on, at
/// `debug` otherwise. Always under the `firewall` target.
macro_rules! live_log {
    ($live:expr, $($arg:tt)+) => {
        if $live {
            ::tracing::info!(target: "firewall", $($arg)+);
        } else {
            ::tracing::debug!(target: "firewall", $($arg)+);
        }
    };
}
pub(crate) use live_log;

pub mod baseline;
pub mod detection;
pub mod lists;
pub mod mitigation;
pub mod warnings;

pub use baseline::Baseline;
pub use detection::{AttackKind, PeerSample, Verdict};
pub use lists::SlotList;
pub use mitigation::MitigationOutcome;

use crate::config::FirewallConfig;
use crate::network::directory::ConnectionDirectory;
use crate::network::peer::Peer;
use crate::utils::lock::lock_or_recover;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};

/// Minimum seconds between two traffic folds for the same peer
pub const TRAFFIC_FOLD_INTERVAL: u64 = 5;

/// Why a connection was refused before any message exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Banned,
    Blacklisted,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::Banned => "banned",
            Rejection::Blacklisted => "blacklisted",
        }
    }
}

pub struct Firewall {
    settings: RwLock<FirewallConfig>,
    baseline: Mutex<Baseline>,
    directory: Arc<ConnectionDirectory>,
}

impl Firewall {
    pub fn new(settings: FirewallConfig, directory: Arc<ConnectionDirectory>) -> Self {
        Self {
            settings: RwLock::new(settings),
            baseline: Mutex::new(Baseline::new()),
            directory,
        }
    }

    /// Read access to the live tunables
    pub fn settings(&self) -> RwLockReadGuard<'_, FirewallConfig> {
        self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the live tunables; takes effect on the next examination
    pub fn update_settings<R>(&self, f: impl FnOnce(&mut FirewallConfig) -> R) -> R {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut settings)
    }

    pub fn baseline(&self) -> Baseline {
        *lock_or_recover(&self.baseline)
    }

    pub fn directory(&self) -> &Arc<ConnectionDirectory> {
        &self.directory
    }

    pub fn is_whitelisted(&self, addr: &str) -> bool {
        self.settings().whitelist.contains(addr)
    }

    /// Session blacklist or configured blacklist
    pub fn is_blacklisted(&self, addr: &str) -> bool {
        self.directory.is_blacklisted(addr) || self.settings().blacklist.contains(addr)
    }

    /// Decide whether an address may connect at all. Whitelisted
    /// addresses are never refused.
    pub fn screen(&self, ip: IpAddr, now: u64) -> Option<Rejection> {
        let addr = ip.to_canonical().to_string();
        if self.is_whitelisted(&addr) {
            return None;
        }
        if self.directory.is_banned(ip, now) {
            return Some(Rejection::Banned);
        }
        if self.is_blacklisted(&addr) {
            return Some(Rejection::Blacklisted);
        }
        None
    }

    /// Clear the blacklist (and optionally the bans) once the peer count
    /// has dropped to the configured floor.
    pub fn autoclear(&self, peer_count: usize) {
        let (clear_blacklist, clear_bans, floor, live) = {
            let s = self.settings();
            (
                s.clear_blacklist,
                s.clear_bans,
                s.clear_min_peers,
                s.live_debug.enabled && s.live_debug.blacklist,
            )
        };
        if peer_count > floor {
            return;
        }
        if clear_blacklist {
            let cleared = self.directory.clear_blacklist();
            if cleared > 0 {
                live_log!(live, "Autoclear: {} blacklisted addresses released ({} peers)", cleared, peer_count);
            }
        }
        if clear_bans && !self.directory.with_bans(|bans| bans.is_empty()) {
            self.directory.clear_bans();
            live_log!(live, "Autoclear: ban table cleared ({} peers)", peer_count);
        }
    }

    /// Connect hook. Runs before any message exchange; a hit is forcibly
    /// disconnected and the reason handed back.
    pub fn on_connect(&self, peer: &Peer, now: u64) -> Result<(), Rejection> {
        let enabled = self.settings().enabled;
        if !enabled {
            return Ok(());
        }
        self.autoclear(self.directory.len());

        match self.screen(peer.ip(), now) {
            None => Ok(()),
            Some(rejection) => {
                let live = {
                    let s = self.settings();
                    s.live_debug.enabled && s.live_debug.disconnect
                };
                live_log!(live, "Refusing {} peer={}: {}", peer.addr(), peer.id(), rejection.as_str());
                peer.force_disconnect();
                Err(rejection)
            }
        }
    }

    /// Send hook. Examines the peer and enforces any verdict. Returns true
    /// if the outbound queue may be flushed.
    pub fn on_send(&self, peer: &Peer, now: u64) -> bool {
        let verdict = self.examine(peer, now);
        if !verdict.detected {
            return true;
        }
        let live = self.settings().live_debug.clone();
        mitigation::execute(&self.directory, peer, &verdict, &live, now);
        false
    }

    /// Fold the peer into the baseline, then run the detection pipeline.
    ///
    /// Returns a clean verdict when the firewall is disabled. Whitelisted
    /// peers neither move the baseline nor get checked.
    pub fn examine(&self, peer: &Peer, now: u64) -> Verdict {
        let settings = self.settings();
        if !settings.enabled || settings.whitelist.contains(&peer.ip_string()) {
            return Verdict::clean();
        }

        let sync_height = peer.sync_height();
        let recv = peer.bytes_recv();
        let sent = peer.bytes_sent();
        {
            let mut baseline = lock_or_recover(&self.baseline);
            baseline.fold_height(sync_height, settings.average_tolerance, settings.average_range);

            if recv >= 1 {
                let mut traffic = peer.traffic_mut();
                traffic.ratio = sent as f64 / recv as f64;
                traffic.average += traffic.ratio / 2.0;
                if now.saturating_sub(traffic.last_fold) >= TRAFFIC_FOLD_INTERVAL {
                    baseline.fold_traffic(
                        traffic.average,
                        settings.traffic_tolerance,
                        settings.traffic_zone,
                    );
                    baseline.fold_bytes(sent, recv, self.directory.len());
                    traffic.last_fold = now;
                }
            }
        }

        let live = settings.live_debug.enabled && settings.live_debug.exam;
        live_log!(
            live,
            "Examined {} peer={} height={} sent={} recv={}",
            peer.addr(),
            peer.id(),
            sync_height,
            sent,
            recv
        );
        drop(settings);

        self.check_attack(peer, now)
    }

    /// Run the detection pipeline against the current baseline
    pub fn check_attack(&self, peer: &Peer, now: u64) -> Verdict {
        let settings = self.settings();
        if !settings.enabled {
            return Verdict::clean();
        }
        let sample = PeerSample::from_peer(peer, now);
        if settings.whitelist.contains(&sample.addr) {
            return Verdict::clean();
        }
        let baseline = self.baseline();
        detection::check_attack(&sample, &baseline, &settings)
    }

    /// Per-detector switches, for status queries
    pub fn detector_status(&self) -> Vec<(&'static str, bool)> {
        let s = self.settings();
        vec![
            ("bandwidth_abuse", s.bandwidth_abuse.detect),
            ("invalid_wallet", s.invalid_wallet.detect),
            ("forked_wallet", s.forked_wallet.detect),
            ("flooding_wallet", s.flooding_wallet.detect),
        ]
    }
}
