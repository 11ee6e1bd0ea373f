//! Detection pipeline
//!
//! Four filters run in a fixed order over a [`PeerSample`] and the current
//! [`Baseline`], all writing into one [`Verdict`]. A filter that fires
//! replaces the attack kind, ban reason and ban time left by an earlier one;
//! the blacklist and ban switches accumulate. With `first_detection_wins`
//! set, the first filter to fire keeps the verdict instead.

use crate::config::FirewallConfig;
use crate::firewall::baseline::Baseline;
use crate::firewall::live_log;
use crate::firewall::warnings::FloodWarnings;
use crate::network::ban_list::BanReason;
use crate::network::peer::{Peer, TrafficStats};
use crate::utils::time::seconds_since;
use serde::Serialize;

/// Protocol versions at or below this predate version negotiation
pub const LEGACY_PROTOCOL_FLOOR: i32 = 209;

/// Invalid frames per received kilobyte above which a peer is flooding
pub const DOS_INVALID_PER_KB: f64 = 1.0;

/// Point-in-time copy of the peer values the filters read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerSample {
    pub addr: String,
    pub sync_height: i32,
    pub starting_height: i32,
    pub version: i32,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub invalid_recv: u64,
    pub traffic: TrafficStats,
    /// Connection age in seconds
    pub age: u64,
}

impl PeerSample {
    pub fn from_peer(peer: &Peer, now: u64) -> Self {
        Self {
            addr: peer.ip_string(),
            sync_height: peer.sync_height(),
            starting_height: peer.starting_height(),
            version: peer.version(),
            bytes_sent: peer.bytes_sent(),
            bytes_recv: peer.bytes_recv(),
            invalid_recv: peer.invalid_recv(),
            traffic: peer.traffic(),
            age: seconds_since(peer.conn_time(), now),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum AttackKind {
    #[default]
    None,
    LowBandwidthHighHeight,
    HighBandwidthHighHeight,
    LowBandwidthLowHeight,
    HighBandwidthLowHeight,
    DoubleSpend,
    InvalidStartingHeight,
    ProtocolZero,
    ProtocolBelowOne,
    ProtocolOutdated,
    ForkedHeight,
    FloodingPattern,
    FloodingDos,
}

impl AttackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackKind::None => "",
            AttackKind::LowBandwidthHighHeight => "1-LowBW-HighHeight",
            AttackKind::HighBandwidthHighHeight => "2-HighBW-HighHeight",
            AttackKind::LowBandwidthLowHeight => "3-LowBW-LowHeight",
            AttackKind::HighBandwidthLowHeight => "4-HighBW-LowHeight",
            AttackKind::DoubleSpend => "DoubleSpend",
            AttackKind::InvalidStartingHeight => "Invalid-StartHeight",
            AttackKind::ProtocolZero => "Invalid-ProtocolZero",
            AttackKind::ProtocolBelowOne => "Invalid-Protocol",
            AttackKind::ProtocolOutdated => "Outdated-Protocol",
            AttackKind::ForkedHeight => "Forked-NodeHeight",
            AttackKind::FloodingPattern => "Flooding-Pattern",
            AttackKind::FloodingDos => "Flooding-DDoS",
        }
    }
}

impl std::fmt::Display for AttackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one filter found
#[derive(Debug, Clone, Copy)]
struct Finding {
    kind: AttackKind,
    reason: BanReason,
    ban_time: u64,
    blacklist: bool,
    ban: bool,
}

/// Outcome of one detection pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub detected: bool,
    pub kind: AttackKind,
    pub blacklist: bool,
    pub ban: bool,
    /// Seconds; 0 means the default ban time
    pub ban_time: u64,
    pub ban_reason: BanReason,
    /// Flooding signature of this pass, empty if the flooding filter is off
    pub warnings: String,
}

impl Default for Verdict {
    fn default() -> Self {
        Self {
            detected: false,
            kind: AttackKind::None,
            blacklist: false,
            ban: false,
            ban_time: 0,
            ban_reason: BanReason::Unknown,
            warnings: String::new(),
        }
    }
}

impl Verdict {
    pub fn clean() -> Self {
        Self::default()
    }

    fn record(&mut self, finding: Finding, first_wins: bool) {
        if self.detected && first_wins {
            return;
        }
        self.detected = true;
        self.kind = finding.kind;
        self.ban_reason = finding.reason;
        self.ban_time = finding.ban_time;
        self.blacklist |= finding.blacklist;
        self.ban |= finding.ban;
    }

    fn clear(&mut self) {
        self.detected = false;
        self.kind = AttackKind::None;
        self.blacklist = false;
        self.ban = false;
        self.ban_time = 0;
        self.ban_reason = BanReason::Unknown;
    }
}

trait Detector: Sync {
    fn evaluate(
        &self,
        sample: &PeerSample,
        baseline: &Baseline,
        cfg: &FirewallConfig,
        verdict: &mut Verdict,
    );
}

struct BandwidthAbuse;
struct InvalidWallet;
struct ForkedWallet;
struct FloodingWallet;

static PIPELINE: [&dyn Detector; 4] = [&BandwidthAbuse, &InvalidWallet, &ForkedWallet, &FloodingWallet];

/// Run every filter in order and return the combined verdict
pub fn check_attack(sample: &PeerSample, baseline: &Baseline, cfg: &FirewallConfig) -> Verdict {
    let mut verdict = Verdict::clean();
    for detector in PIPELINE.iter() {
        detector.evaluate(sample, baseline, cfg, &mut verdict);
    }
    verdict
}

impl Detector for BandwidthAbuse {
    fn evaluate(&self, s: &PeerSample, b: &Baseline, cfg: &FirewallConfig, verdict: &mut Verdict) {
        let c = &cfg.bandwidth_abuse;
        if !c.detect || s.age <= c.max_check {
            return;
        }

        let traffic = s.traffic.average;
        let low = traffic < b.min_traffic;
        let high = traffic > b.max_traffic;
        let kind = if s.sync_height > b.min_height {
            if low {
                AttackKind::LowBandwidthHighHeight
            } else if high {
                AttackKind::HighBandwidthHighHeight
            } else {
                return;
            }
        } else if s.sync_height < b.min_height {
            if low {
                AttackKind::LowBandwidthLowHeight
            } else if high {
                AttackKind::HighBandwidthLowHeight
            } else {
                return;
            }
        } else {
            return;
        };

        let live = cfg.live_debug.enabled && cfg.live_debug.bandwidth_abuse;
        let mut finding = Finding {
            kind,
            reason: BanReason::BandwidthAbuse,
            ban_time: c.ban_time,
            blacklist: c.blacklist,
            ban: c.ban,
        };

        if c.no_false_positive {
            let nfp_live = cfg.live_debug.enabled && cfg.live_debug.no_false_positive;
            if kind != AttackKind::HighBandwidthLowHeight {
                live_log!(nfp_live, "{} {} treated as catch-up sync", s.addr, kind);
                return;
            }

            finding.kind = AttackKind::DoubleSpend;
            finding.reason = BanReason::DoubleSpendWallet;
            finding.ban_time = c.double_spend_ban_time;

            // no received bytes means no ratio, which is outside any band
            let in_band = s.bytes_recv > 0 && {
                let ratio = s.bytes_sent as f64 / s.bytes_recv as f64;
                ratio >= c.min_attack && ratio <= c.max_attack
            };
            if !in_band || s.bytes_sent > s.bytes_recv {
                live_log!(nfp_live, "{} {} looks like a full sync", s.addr, finding.kind);
                return;
            }
        }

        live_log!(
            live,
            "{} {} (height {} band {}..{}, traffic {:.4} band {:.4}..{:.4})",
            s.addr,
            finding.kind,
            s.sync_height,
            b.min_height,
            b.max_height,
            traffic,
            b.min_traffic,
            b.max_traffic
        );
        verdict.record(finding, cfg.first_detection_wins);
    }
}

impl Detector for InvalidWallet {
    fn evaluate(&self, s: &PeerSample, _b: &Baseline, cfg: &FirewallConfig, verdict: &mut Verdict) {
        let c = &cfg.invalid_wallet;
        if !c.detect || s.age <= c.max_check {
            return;
        }

        let mut kind = None;
        if s.starting_height < 0 {
            kind = Some(AttackKind::InvalidStartingHeight);
        }
        if s.version == 0 {
            kind = Some(AttackKind::ProtocolZero);
        } else if s.version < 1 {
            kind = Some(AttackKind::ProtocolBelowOne);
        } else if s.version < c.min_protocol_version && s.version > LEGACY_PROTOCOL_FLOOR {
            kind = Some(AttackKind::ProtocolOutdated);
        }

        if let Some(kind) = kind {
            live_log!(
                cfg.live_debug.enabled && cfg.live_debug.invalid_wallet,
                "{} {} (version {}, starting height {})",
                s.addr,
                kind,
                s.version,
                s.starting_height
            );
            verdict.record(
                Finding {
                    kind,
                    reason: BanReason::InvalidWallet,
                    ban_time: c.ban_time,
                    blacklist: c.blacklist,
                    ban: c.ban,
                },
                cfg.first_detection_wins,
            );
        }
    }
}

impl Detector for ForkedWallet {
    fn evaluate(&self, s: &PeerSample, _b: &Baseline, cfg: &FirewallConfig, verdict: &mut Verdict) {
        let c = &cfg.forked_wallet;
        if !c.detect || !c.node_heights.contains(&s.sync_height.to_string()) {
            return;
        }
        live_log!(
            cfg.live_debug.enabled && cfg.live_debug.forked_wallet,
            "{} stuck at fork height {}",
            s.addr,
            s.sync_height
        );
        verdict.record(
            Finding {
                kind: AttackKind::ForkedHeight,
                reason: BanReason::ForkedWallet,
                ban_time: c.ban_time,
                blacklist: c.blacklist,
                ban: c.ban,
            },
            cfg.first_detection_wins,
        );
    }
}

impl Detector for FloodingWallet {
    fn evaluate(&self, s: &PeerSample, b: &Baseline, cfg: &FirewallConfig, verdict: &mut Verdict) {
        let c = &cfg.flooding_wallet;
        if !c.detect {
            return;
        }
        let live = cfg.live_debug.enabled && cfg.live_debug.flooding_wallet;

        let warnings = FloodWarnings::evaluate(s, b, c, verdict.detected);
        let code = warnings.code();

        if c.attack_patterns.contains(&code) {
            live_log!(live, "{} matched flooding pattern {}", s.addr, code);
            verdict.record(
                Finding {
                    kind: AttackKind::FloodingPattern,
                    reason: BanReason::FloodingWallet,
                    ban_time: c.ban_time,
                    blacklist: c.blacklist,
                    ban: c.ban,
                },
                cfg.first_detection_wins,
            );
        }

        if c.ignore_patterns.contains(&code) {
            if verdict.detected {
                live_log!(live, "{} ignore pattern {} clears {}", s.addr, code, verdict.kind);
            }
            verdict.clear();
        }
        verdict.warnings = code;

        if s.age > c.min_check && s.bytes_recv > 0 {
            let invalid_per_kb = s.invalid_recv as f64 / (s.bytes_recv as f64 / 1000.0);
            if invalid_per_kb > DOS_INVALID_PER_KB {
                live_log!(
                    live,
                    "{} sent {} invalid frames in {} bytes",
                    s.addr,
                    s.invalid_recv,
                    s.bytes_recv
                );
                verdict.record(
                    Finding {
                        kind: AttackKind::FloodingDos,
                        reason: BanReason::DdosWallet,
                        ban_time: c.ban_time,
                        blacklist: c.blacklist,
                        ban: c.ban,
                    },
                    cfg.first_detection_wins,
                );
            }
        }
    }
}
