//! Chainstate connection metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ConnectMetrics {
    connect_us: AtomicU64,
    connected_blocks: AtomicU64,
    disconnect_us: AtomicU64,
    disconnected_blocks: AtomicU64,
    script_us: AtomicU64,
    script_checks: AtomicU64,
    undo_bytes: AtomicU64,
    flush_us: AtomicU64,
    flushes: AtomicU64,
    reorgs: AtomicU64,
    deepest_reorg: AtomicU64,
    invalid_blocks: AtomicU64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectMetricsSnapshot {
    pub connect_us: u64,
    pub connected_blocks: u64,
    pub disconnect_us: u64,
    pub disconnected_blocks: u64,
    pub script_us: u64,
    pub script_checks: u64,
    pub undo_bytes: u64,
    pub flush_us: u64,
    pub flushes: u64,
    pub reorgs: u64,
    pub deepest_reorg: u64,
    pub invalid_blocks: u64,
}

fn micros(elapsed: Duration) -> u64 {
    elapsed.as_micros() as u64
}

impl ConnectMetrics {
    pub fn record_connect(&self, elapsed: Duration, undo_bytes: usize) {
        self.connect_us.fetch_add(micros(elapsed), Ordering::Relaxed);
        self.connected_blocks.fetch_add(1, Ordering::Relaxed);
        self.undo_bytes
            .fetch_add(undo_bytes as u64, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self, elapsed: Duration) {
        self.disconnect_us
            .fetch_add(micros(elapsed), Ordering::Relaxed);
        self.disconnected_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scripts(&self, elapsed: Duration, checks: usize) {
        self.script_us.fetch_add(micros(elapsed), Ordering::Relaxed);
        self.script_checks
            .fetch_add(checks as u64, Ordering::Relaxed);
    }

    pub fn record_flush(&self, elapsed: Duration) {
        self.flush_us.fetch_add(micros(elapsed), Ordering::Relaxed);
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a chain switch that disconnected `depth` blocks.
    pub fn record_reorg(&self, depth: u64) {
        self.reorgs.fetch_add(1, Ordering::Relaxed);
        self.deepest_reorg.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.invalid_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectMetricsSnapshot {
        ConnectMetricsSnapshot {
            connect_us: self.connect_us.load(Ordering::Relaxed),
            connected_blocks: self.connected_blocks.load(Ordering::Relaxed),
            disconnect_us: self.disconnect_us.load(Ordering::Relaxed),
            disconnected_blocks: self.disconnected_blocks.load(Ordering::Relaxed),
            script_us: self.script_us.load(Ordering::Relaxed),
            script_checks: self.script_checks.load(Ordering::Relaxed),
            undo_bytes: self.undo_bytes.load(Ordering::Relaxed),
            flush_us: self.flush_us.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            reorgs: self.reorgs.load(Ordering::Relaxed),
            deepest_reorg: self.deepest_reorg.load(Ordering::Relaxed),
            invalid_blocks: self.invalid_blocks.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorg_depth_keeps_maximum() {
        let metrics = ConnectMetrics::default();
        metrics.record_reorg(3);
        metrics.record_reorg(1);
        metrics.record_connect(Duration::from_micros(40), 12);
        metrics.record_connect(Duration::from_micros(2), 0);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.reorgs, 2);
        assert_eq!(snapshot.deepest_reorg, 3);
        assert_eq!(snapshot.connected_blocks, 2);
        assert_eq!(snapshot.connect_us, 42);
        assert_eq!(snapshot.undo_bytes, 12);
    }
}
