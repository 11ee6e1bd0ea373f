//! Mitigation executor
//!
//! Applies a verdict: session blacklist, persistent ban, forced disconnect.
//! Never blocks the calling thread; the disconnect falls back to marking
//! the send queue ended when the send lock is busy.

use crate::config::LiveDebugConfig;
use crate::firewall::detection::Verdict;
use crate::firewall::live_log;
use crate::network::ban_list::SubNet;
use crate::network::directory::ConnectionDirectory;
use crate::network::peer::Peer;

/// What [`execute`] actually did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MitigationOutcome {
    /// Address newly added to the blacklist
    pub blacklisted: bool,
    /// Ban table changed
    pub banned: bool,
    pub disconnected: bool,
}

/// Enforce `verdict` against `peer`. A clean verdict is a no-op.
pub fn execute(
    directory: &ConnectionDirectory,
    peer: &Peer,
    verdict: &Verdict,
    live: &LiveDebugConfig,
    now: u64,
) -> MitigationOutcome {
    let mut outcome = MitigationOutcome::default();
    if !verdict.detected {
        return outcome;
    }
    let addr = peer.ip_string();

    if verdict.blacklist {
        outcome.blacklisted = directory.blacklist_insert(&addr);
        if outcome.blacklisted {
            live_log!(
                live.enabled && live.blacklist,
                "Blacklisted {} ({})",
                addr,
                verdict.kind
            );
        }
    }

    if verdict.ban {
        outcome.banned = directory.ban(
            SubNet::single(peer.ip()),
            verdict.ban_reason,
            verdict.ban_time,
            false,
            now,
        );
        live_log!(
            live.enabled && live.bans,
            "Banned {} ({}) ban_time={}",
            addr,
            verdict.ban_reason,
            verdict.ban_time
        );
    }

    peer.force_disconnect();
    outcome.disconnected = true;
    live_log!(
        live.enabled && live.disconnect,
        "Disconnected {} peer={} attack={}",
        addr,
        peer.id(),
        verdict.kind
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::detection::AttackKind;
    use crate::network::ban_list::{BanReason, DEFAULT_BAN_TIME};
    use crate::network::peer::test_support::loopback_peer;

    fn verdict(blacklist: bool, ban: bool) -> Verdict {
        Verdict {
            detected: true,
            kind: AttackKind::ForkedHeight,
            blacklist,
            ban,
            ban_time: 0,
            ban_reason: BanReason::ForkedWallet,
            warnings: String::new(),
        }
    }

    #[test]
    fn test_clean_verdict_does_nothing() {
        let dir = ConnectionDirectory::new(8, 8);
        let (peer, _remote) = loopback_peer(1, 100);
        let out = execute(&dir, &peer, &Verdict::clean(), &LiveDebugConfig::default(), 100);
        assert_eq!(out, MitigationOutcome::default());
        assert!(!peer.is_disconnecting());
    }

    #[test]
    fn test_flags_select_actions() {
        for (blacklist, ban) in [(false, false), (true, false), (false, true), (true, true)] {
            let dir = ConnectionDirectory::new(8, 8);
            let (peer, _remote) = loopback_peer(1, 100);
            let out = execute(&dir, &peer, &verdict(blacklist, ban), &LiveDebugConfig::default(), 100);
            assert_eq!(out.blacklisted, blacklist);
            assert_eq!(out.banned, ban);
            assert!(out.disconnected);
            assert!(peer.is_disconnecting());
            assert_eq!(dir.is_blacklisted("127.0.0.1"), blacklist);
            assert_eq!(dir.is_banned(peer.ip(), 101), ban);
        }
    }

    #[test]
    fn test_zero_ban_time_uses_default() {
        let dir = ConnectionDirectory::new(8, 8);
        let (peer, _remote) = loopback_peer(1, 100);
        execute(&dir, &peer, &verdict(false, true), &LiveDebugConfig::default(), 100);
        let bans = dir.ban_entries();
        let entry = bans.get(&SubNet::single(peer.ip())).unwrap();
        assert_eq!(entry.ban_until, 100 + DEFAULT_BAN_TIME);
        assert_eq!(entry.reason, BanReason::ForkedWallet);
    }

    #[test]
    fn test_busy_send_lock_marks_queue_ended() {
        let dir = ConnectionDirectory::new(8, 8);
        let (peer, _remote) = loopback_peer(1, 100);
        let guard = peer.send_lock().lock().unwrap();
        execute(&dir, &peer, &verdict(false, false), &LiveDebugConfig::default(), 100);
        drop(guard);
        assert!(peer.is_disconnecting());
        assert!(peer.is_send_ended());
    }
}
