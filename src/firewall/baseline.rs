//! Process-wide baseline of "normal" peer behaviour
//!
//! Height and traffic references are simple self-reinforcing smoothers,
//! not true moving averages, and the detectors' bands are defined in terms
//! of them:
//!
//! ```text
//! height:   if sync > avg { avg = (avg + sync) / 2 - tolerance }
//!           min = avg - range, max = avg + range
//! traffic:  avg = (avg + peer_avg) / 2 - tolerance
//!           min = avg - zone,  max = avg + zone
//! bytes:    avg_sent = (avg_sent + sent / peers) / 2   (same for received)
//! ```
//!
//! Heights are integers and divide with truncation.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Baseline {
    pub average_height: i32,
    pub min_height: i32,
    pub max_height: i32,
    pub average_traffic: f64,
    pub min_traffic: f64,
    pub max_traffic: f64,
    pub average_sent: f64,
    pub average_recv: f64,
}

impl Baseline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a peer's sync height in; only heights above the average move it.
    ///
    /// Returns true if the baseline changed.
    pub fn fold_height(&mut self, sync_height: i32, tolerance: i32, range: i32) -> bool {
        if sync_height <= self.average_height {
            return false;
        }
        let sum = i64::from(self.average_height) + i64::from(sync_height);
        self.average_height = ((sum / 2) as i32).saturating_sub(tolerance);
        self.min_height = self.average_height.saturating_sub(range);
        self.max_height = self.average_height.saturating_add(range);
        true
    }

    /// Fold a peer's smoothed traffic ratio into the global traffic band
    pub fn fold_traffic(&mut self, peer_average: f64, tolerance: f64, zone: f64) {
        self.average_traffic = (self.average_traffic + peer_average) / 2.0 - tolerance;
        self.min_traffic = self.average_traffic - zone;
        self.max_traffic = self.average_traffic + zone;
    }

    /// Fold per-peer byte counts into the running sent/received averages
    pub fn fold_bytes(&mut self, sent: u64, recv: u64, peer_count: usize) {
        let peers = peer_count.max(1) as f64;
        self.average_sent = (self.average_sent + sent as f64 / peers) / 2.0;
        self.average_recv = (self.average_recv + recv as f64 / peers) / 2.0;
    }
}
