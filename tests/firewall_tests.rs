//! Firewall hooks and detection pipeline, end to end over loopback peers

mod common;

use bllvm_connman::config::FirewallConfig;
use bllvm_connman::firewall::detection::check_attack;
use bllvm_connman::firewall::warnings::FloodWarnings;
use bllvm_connman::firewall::{AttackKind, Baseline, Firewall, PeerSample, Rejection, SlotList};
use bllvm_connman::network::ban_list::{BanReason, SubNet};
use bllvm_connman::network::directory::ConnectionDirectory;
use common::loopback_peer;
use std::sync::Arc;

fn firewall() -> Firewall {
    let mut cfg = FirewallConfig::default();
    cfg.flooding_wallet.attack_patterns = SlotList::new();
    Firewall::new(cfg, Arc::new(ConnectionDirectory::new(16, 16)))
}

fn localhost() -> SubNet {
    SubNet::single("127.0.0.1".parse().unwrap())
}

#[test]
fn test_invalid_starting_height_is_banned_after_max_check() {
    let fw = firewall();
    let (peer, _remote) = loopback_peer(1, 0);
    peer.set_version(70015);
    peer.set_starting_height(-1);

    // inside the check window nothing fires
    assert!(fw.on_send(&peer, 60));
    assert!(!peer.is_disconnecting());

    assert!(!fw.on_send(&peer, 61));
    assert!(peer.is_disconnecting());
    assert!(fw.directory().is_blacklisted("127.0.0.1"));

    let bans = fw.directory().ban_entries();
    let entry = bans.get(&localhost()).unwrap();
    assert_eq!(entry.reason, BanReason::InvalidWallet);
    assert_eq!(entry.ban_until, 61 + 2_600_000);
}

#[test]
fn test_disabled_firewall_never_blocks() {
    let fw = firewall();
    fw.update_settings(|s| s.enabled = false);
    let (peer, _remote) = loopback_peer(1, 0);
    peer.set_starting_height(-1);
    assert!(fw.on_send(&peer, 1_000));
    assert!(!peer.is_disconnecting());
    assert_eq!(fw.baseline(), Baseline::default());
}

#[test]
fn test_whitelisted_peer_is_not_checked() {
    let fw = firewall();
    fw.update_settings(|s| {
        s.whitelist.push("127.0.0.1");
    });
    let (peer, _remote) = loopback_peer(1, 0);
    peer.set_starting_height(-1);
    assert!(fw.on_send(&peer, 1_000));
    assert!(fw.directory().ban_entries().is_empty());
}

#[test]
fn test_connect_hook_refuses_banned_and_blacklisted() {
    let fw = firewall();
    let (peer, _remote) = loopback_peer(1, 100);
    assert_eq!(fw.on_connect(&peer, 100), Ok(()));

    fw.directory()
        .ban(localhost(), BanReason::ManuallyAdded, 0, false, 100);
    assert_eq!(fw.screen(peer.ip(), 100), Some(Rejection::Banned));
    assert_eq!(fw.on_connect(&peer, 100), Err(Rejection::Banned));
    assert!(peer.is_disconnecting());

    let fw = firewall();
    fw.update_settings(|s| {
        s.blacklist.push("127.0.0.1");
    });
    assert_eq!(fw.screen(peer.ip(), 100), Some(Rejection::Blacklisted));
}

#[test]
fn test_blacklist_only_mitigation_skips_ban() {
    let fw = firewall();
    fw.update_settings(|s| s.invalid_wallet.ban = false);
    let (peer, _remote) = loopback_peer(1, 0);
    peer.set_version(70015);
    peer.set_starting_height(-5);
    assert!(!fw.on_send(&peer, 100));
    assert!(fw.directory().is_blacklisted("127.0.0.1"));
    assert!(fw.directory().ban_entries().is_empty());
}

fn sample() -> PeerSample {
    PeerSample {
        addr: "10.0.0.1".into(),
        version: 0,
        sync_height: 10000,
        starting_height: 10000,
        age: 100,
        ..PeerSample::default()
    }
}

#[test]
fn test_last_filter_wins_by_default() {
    let mut cfg = FirewallConfig::default();
    cfg.flooding_wallet.attack_patterns = SlotList::new();
    let baseline = Baseline::default();

    let verdict = check_attack(&sample(), &baseline, &cfg);
    assert!(verdict.detected);
    assert_eq!(verdict.kind, AttackKind::ForkedHeight);
    assert_eq!(verdict.ban_reason, BanReason::ForkedWallet);

    cfg.first_detection_wins = true;
    let verdict = check_attack(&sample(), &baseline, &cfg);
    assert_eq!(verdict.kind, AttackKind::ProtocolZero);
    assert_eq!(verdict.ban_reason, BanReason::InvalidWallet);
}

#[test]
fn test_ignore_pattern_suppresses_attack_pattern() {
    let mut cfg = FirewallConfig::default();
    cfg.invalid_wallet.detect = false;
    cfg.forked_wallet.detect = false;
    let baseline = Baseline::default();
    let s = sample();

    let code = FloodWarnings::evaluate(&s, &baseline, &cfg.flooding_wallet, false).code();
    cfg.flooding_wallet.attack_patterns = SlotList::from_entries([code.clone()]);
    let verdict = check_attack(&s, &baseline, &cfg);
    assert_eq!(verdict.kind, AttackKind::FloodingPattern);
    assert_eq!(verdict.warnings, code);

    cfg.flooding_wallet.ignore_patterns = SlotList::from_entries([code.clone()]);
    let verdict = check_attack(&s, &baseline, &cfg);
    assert!(!verdict.detected);
    assert_eq!(verdict.warnings, code);
}

#[test]
fn test_invalid_frame_flood_is_ddos() {
    let mut cfg = FirewallConfig::default();
    cfg.flooding_wallet.attack_patterns = SlotList::new();
    let s = PeerSample {
        addr: "10.0.0.2".into(),
        version: 70015,
        bytes_recv: 2_000,
        invalid_recv: 5,
        age: 31,
        ..PeerSample::default()
    };
    let verdict = check_attack(&s, &Baseline::default(), &cfg);
    assert_eq!(verdict.kind, AttackKind::FloodingDos);
    assert_eq!(verdict.ban_reason, BanReason::DdosWallet);
}
