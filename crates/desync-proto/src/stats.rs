//! Monotonic bypass counters, read-only from the outside and reset only by
//! an explicit control-plane command.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BypassStats {
    packets_total: AtomicU64,
    packets_bypassed: AtomicU64,
    packets_dropped: AtomicU64,
    bytes_total: AtomicU64,
}

/// A point-in-time copy of the counters, suitable for serializing into a
/// control-plane `status` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct StatsSnapshot {
    pub packets_total: u64,
    pub packets_bypassed: u64,
    pub packets_dropped: u64,
    pub bytes_total: u64,
}

impl BypassStats {
    pub fn new() -> Self {
        BypassStats::default()
    }

    /// Counts one processed packet, regardless of eligibility. Called once
    /// per packet the engine sees, mirroring the reference daemon's
    /// top-of-loop counters.
    pub fn record_packet(&self, packet_len: u64) {
        self.packets_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_total.fetch_add(packet_len, Ordering::Relaxed);
    }

    pub fn record_bypassed(&self) {
        self.packets_bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_total: self.packets_total.load(Ordering::Relaxed),
            packets_bypassed: self.packets_bypassed.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.packets_total.store(0, Ordering::Relaxed);
        self.packets_bypassed.store(0, Ordering::Relaxed);
        self.packets_dropped.store(0, Ordering::Relaxed);
        self.bytes_total.store(0, Ordering::Relaxed);
    }
}
