//! Flooding warning conditions
//!
//! Twenty-five fixed boolean conditions, kept as a flag set. Operators match
//! on the signature string: the 1-based numbers of the conditions that hold,
//! concatenated in order (`"2471113"`...). The numbering below is part of
//! that contract; existing patterns stop matching if it changes.

use crate::config::FloodingWalletConfig;
use crate::firewall::baseline::Baseline;
use crate::firewall::detection::PeerSample;
use bitflags::bitflags;

pub const WARNING_COUNT: u32 = 25;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FloodWarnings: u32 {
        /// 1: behind the height band while above the traffic band
        const HIGH_TRAFFIC_LOW_HEIGHT = 1 << 0;
        /// 2
        const SENT_BELOW_MIN = 1 << 1;
        /// 3
        const SENT_ABOVE_MIN = 1 << 2;
        /// 4
        const SENT_BELOW_MAX = 1 << 3;
        /// 5
        const SENT_ABOVE_MAX = 1 << 4;
        /// 6
        const RECV_ABOVE_HALF_MIN = 1 << 5;
        /// 7
        const RECV_BELOW_HALF_MIN = 1 << 6;
        /// 8
        const RECV_ABOVE_HALF_MAX = 1 << 7;
        /// 9
        const RECV_BELOW_HALF_MAX = 1 << 8;
        /// 10
        const RECV_ABOVE_MIN = 1 << 9;
        /// 11
        const RECV_BELOW_MIN = 1 << 10;
        /// 12
        const RECV_ABOVE_MAX = 1 << 11;
        /// 13
        const RECV_BELOW_MAX = 1 << 12;
        /// 14
        const TRAFFIC_ABOVE_MIN = 1 << 13;
        /// 15
        const TRAFFIC_BELOW_MAX = 1 << 14;
        /// 16
        const STARTING_IS_SYNC = 1 << 15;
        /// 17
        const AGE_ABOVE_MIN_CHECK = 1 << 16;
        /// 18
        const AGE_BELOW_MIN_CHECK = 1 << 17;
        /// 19
        const AGE_ABOVE_MAX_CHECK = 1 << 18;
        /// 20
        const AGE_BELOW_MAX_CHECK = 1 << 19;
        /// 21
        const HEIGHT_ABOVE_MAX = 1 << 20;
        /// 22
        const HEIGHT_BELOW_MAX = 1 << 21;
        /// 23
        const HEIGHT_ABOVE_MIN = 1 << 22;
        /// 24
        const HEIGHT_BELOW_MIN = 1 << 23;
        /// 25: an earlier filter already detected an attack
        const ATTACK_DETECTED = 1 << 24;
    }
}

impl FloodWarnings {
    /// Evaluate every condition for one peer
    pub fn evaluate(
        sample: &PeerSample,
        baseline: &Baseline,
        cfg: &FloodingWalletConfig,
        attack_detected: bool,
    ) -> Self {
        let sent = sample.bytes_sent;
        let recv = sample.bytes_recv;
        let traffic = sample.traffic.average;
        let sync = sample.sync_height;
        let age = sample.age;

        let conditions = [
            (
                Self::HIGH_TRAFFIC_LOW_HEIGHT,
                sync < baseline.min_height && traffic > baseline.max_traffic,
            ),
            (Self::SENT_BELOW_MIN, sent < cfg.min_bytes),
            (Self::SENT_ABOVE_MIN, sent > cfg.min_bytes),
            (Self::SENT_BELOW_MAX, sent < cfg.max_bytes),
            (Self::SENT_ABOVE_MAX, sent > cfg.max_bytes),
            (Self::RECV_ABOVE_HALF_MIN, recv > cfg.min_bytes / 2),
            (Self::RECV_BELOW_HALF_MIN, recv < cfg.min_bytes / 2),
            (Self::RECV_ABOVE_HALF_MAX, recv > cfg.max_bytes / 2),
            (Self::RECV_BELOW_HALF_MAX, recv < cfg.max_bytes / 2),
            (Self::RECV_ABOVE_MIN, recv > cfg.min_bytes),
            (Self::RECV_BELOW_MIN, recv < cfg.min_bytes),
            (Self::RECV_ABOVE_MAX, recv > cfg.max_bytes),
            (Self::RECV_BELOW_MAX, recv < cfg.max_bytes),
            (Self::TRAFFIC_ABOVE_MIN, traffic > cfg.min_traffic_average),
            (Self::TRAFFIC_BELOW_MAX, traffic < cfg.max_traffic_average),
            (Self::STARTING_IS_SYNC, sample.starting_height == sync),
            (Self::AGE_ABOVE_MIN_CHECK, age > cfg.min_check),
            (Self::AGE_BELOW_MIN_CHECK, age < cfg.min_check),
            (Self::AGE_ABOVE_MAX_CHECK, age > cfg.max_check),
            (Self::AGE_BELOW_MAX_CHECK, age < cfg.max_check),
            (Self::HEIGHT_ABOVE_MAX, sync > baseline.max_height),
            (Self::HEIGHT_BELOW_MAX, sync < baseline.max_height),
            (Self::HEIGHT_ABOVE_MIN, sync > baseline.min_height),
            (Self::HEIGHT_BELOW_MIN, sync < baseline.min_height),
            (Self::ATTACK_DETECTED, attack_detected),
        ];

        conditions
            .into_iter()
            .filter(|(_, holds)| *holds)
            .fold(Self::empty(), |acc, (flag, _)| acc | flag)
    }

    /// Signature string matched against attack and ignore patterns
    pub fn code(&self) -> String {
        (0..WARNING_COUNT)
            .filter(|i| self.bits() & (1 << i) != 0)
            .map(|i| (i + 1).to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_concatenates_numbers_in_order() {
        let w = FloodWarnings::SENT_BELOW_MIN
            | FloodWarnings::SENT_BELOW_MAX
            | FloodWarnings::RECV_BELOW_HALF_MIN
            | FloodWarnings::AGE_ABOVE_MAX_CHECK
            | FloodWarnings::ATTACK_DETECTED;
        assert_eq!(w.code(), "2471925");
        assert_eq!(FloodWarnings::empty().code(), "");
        assert_eq!(FloodWarnings::all().bits().count_ones(), WARNING_COUNT);
    }

    #[test]
    fn test_idle_fresh_peer() {
        let sample = PeerSample::default();
        let w = FloodWarnings::evaluate(
            &sample,
            &Baseline::default(),
            &FloodingWalletConfig::default(),
            false,
        );
        // nothing sent or received, height 0 equals starting height 0,
        // age 0 is inside both windows, traffic 0 is below the max
        assert_eq!(w.code(), "2479111315161820");
    }

    #[test]
    fn test_heavy_peer_inside_window() {
        let mut sample = PeerSample::default();
        sample.bytes_sent = 3_000_000;
        sample.bytes_recv = 2_000_000;
        sample.sync_height = 500;
        sample.starting_height = 500;
        sample.age = 45;
        sample.traffic.average = 1.5;
        let baseline = Baseline {
            average_height: 498,
            min_height: 398,
            max_height: 598,
            ..Baseline::default()
        };
        let w = FloodWarnings::evaluate(&sample, &baseline, &FloodingWalletConfig::default(), false);
        assert_eq!(w.code(), "35681012151617202223");
    }
}
