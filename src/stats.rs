//! Throughput counters and the periodic rate reporter.
//!
//! Counters are a write-only side channel: listener instances bump them,
//! the reporter task reads them, and nothing about classification depends
//! on their values.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::classify::BatchOutput;

/// Per-instance counters, updated once per classified batch.
#[derive(Debug)]
pub struct InstanceCounters {
    /// Display label, typically `addr:port`.
    pub label: String,
    packets: AtomicU64,
    bytes_received: AtomicU64,
    bytes_ordered: AtomicU64,
    bytes_orphaned: AtomicU64,
    fragments_dropped: AtomicU64,
}

/// Point-in-time copy of one instance's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    /// Datagrams received.
    pub packets: u64,
    /// Bytes received off the wire.
    pub bytes_received: u64,
    /// Bytes appended to the ordered spool.
    pub bytes_ordered: u64,
    /// Bytes appended to the orphan spool.
    pub bytes_orphaned: u64,
    /// Duplicate fragments dropped.
    pub fragments_dropped: u64,
}

impl CountersSnapshot {
    /// Total bytes persisted to disk.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_ordered + self.bytes_orphaned
    }
}

impl InstanceCounters {
    /// Fresh counters for one instance.
    pub fn new(label: String) -> Self {
        Self {
            label,
            packets: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_ordered: AtomicU64::new(0),
            bytes_orphaned: AtomicU64::new(0),
            fragments_dropped: AtomicU64::new(0),
        }
    }

    /// Fold one batch's totals into the counters.
    pub fn record_batch(&self, packets: u64, bytes_received: u64, output: &BatchOutput) {
        self.packets.fetch_add(packets, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes_received, Ordering::Relaxed);
        self.bytes_ordered
            .fetch_add(output.bytes_ordered, Ordering::Relaxed);
        self.bytes_orphaned
            .fetch_add(output.bytes_orphaned, Ordering::Relaxed);
        self.fragments_dropped
            .fetch_add(output.dropped, Ordering::Relaxed);
    }

    /// Read a consistent-enough copy for reporting.
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_ordered: self.bytes_ordered.load(Ordering::Relaxed),
            bytes_orphaned: self.bytes_orphaned.load(Ordering::Relaxed),
            fragments_dropped: self.fragments_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Log instantaneous and cumulative throughput once per `period` until
/// cancelled.
pub async fn report_loop(
    counters: Vec<Arc<InstanceCounters>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut previous: Vec<CountersSnapshot> = counters.iter().map(|c| c.snapshot()).collect();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; swallow it so deltas cover a full
    // period.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let secs = period.as_secs_f64();
        let mut total_kpps = 0.0;
        let mut total_mbps = 0.0;
        for (instance, prev) in counters.iter().zip(previous.iter_mut()) {
            let now = instance.snapshot();
            let kpps = (now.packets - prev.packets) as f64 / secs / 1e3;
            let mbps = (now.bytes_received - prev.bytes_received) as f64 / secs / 1e6;
            total_kpps += kpps;
            total_mbps += mbps;
            info!(
                instance = %instance.label,
                kpps,
                mbps,
                packets = now.packets,
                written_mb = now.bytes_written() as f64 / 1e6,
                dropped = now.fragments_dropped,
                "throughput"
            );
            *prev = now;
        }
        if counters.len() > 1 {
            info!(kpps = total_kpps, mbps = total_mbps, "throughput total");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_accumulate_into_snapshots() {
        let counters = InstanceCounters::new("0.0.0.0:1338".to_string());
        let output = BatchOutput {
            bytes_ordered: 100,
            bytes_orphaned: 50,
            accepted: 2,
            orphaned: 1,
            dropped: 1,
        };
        counters.record_batch(4, 4096, &output);
        counters.record_batch(4, 4096, &output);

        let snap = counters.snapshot();
        assert_eq!(snap.packets, 8);
        assert_eq!(snap.bytes_received, 8192);
        assert_eq!(snap.bytes_ordered, 200);
        assert_eq!(snap.bytes_orphaned, 100);
        assert_eq!(snap.fragments_dropped, 2);
        assert_eq!(snap.bytes_written(), 300);
    }

    #[tokio::test]
    async fn report_loop_exits_on_cancel() {
        let cancel = CancellationToken::new();
        let counters = vec![Arc::new(InstanceCounters::new("test".to_string()))];
        let handle = tokio::spawn(report_loop(
            counters,
            Duration::from_millis(10),
            cancel.clone(),
        ));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
