// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Beacon statistics.

use crate::wire::TimeStamp;

/// Exponentially weighted moving average.
///
/// `alpha` weighs the history: `new = alpha * old + (1 - alpha) * sample`.
#[derive(Debug, Clone, Copy)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    #[must_use]
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) {
        self.value = Some(match self.value {
            Some(old) => self.alpha * old + (1.0 - self.alpha) * sample,
            None => sample,
        });
    }

    /// Current average; NaN before the first sample.
    #[must_use]
    pub fn get(&self) -> f64 {
        self.value.unwrap_or(f64::NAN)
    }
}

/// Daemon-wide beacon counters and averages.
#[derive(Debug)]
pub struct BpStats {
    pub beacons_sent: u64,
    pub beacons_received: u64,
    /// Malformed frames and payloads for unregistered protocols.
    pub dropped_unknown: u64,
    /// Indications lost to full client queues.
    pub dropped_incoming: u64,
    /// Submissions dropped by DROPTAIL queues.
    pub dropped_outgoing: u64,
    pub avg_beacon_size: Ewma,
    pub avg_inter_beacon_time: Ewma,
    pub last_foreign_rx: Option<TimeStamp>,
}

impl BpStats {
    #[must_use]
    pub fn new(beacon_size_alpha: f64, inter_beacon_alpha: f64) -> Self {
        Self {
            beacons_sent: 0,
            beacons_received: 0,
            dropped_unknown: 0,
            dropped_incoming: 0,
            dropped_outgoing: 0,
            avg_beacon_size: Ewma::new(beacon_size_alpha),
            avg_inter_beacon_time: Ewma::new(inter_beacon_alpha),
            last_foreign_rx: None,
        }
    }

    /// Record a well-formed foreign beacon arrival at `now`.
    pub fn record_foreign_beacon(&mut self, now: TimeStamp) {
        self.beacons_received += 1;
        if let Some(last) = self.last_foreign_rx {
            self.avg_inter_beacon_time
                .update(now.micros().saturating_sub(last.micros()) as f64 / 1000.0);
        }
        self.last_foreign_rx = Some(now);
    }
}
