//! Counters and size histograms kept by the aggregator and the flat combiners.
//!
//! Every core keeps its own copy; nothing here is shared between threads. Snapshots
//! are plain values that can be merged, printed, or serialized.

use serde::Serialize;

/// A histogram with power-of-two buckets.
///
/// Bucket `0` counts zeros, bucket `i > 0` counts values in `[2^(i-1), 2^i)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Histogram {
    buckets: Vec<u64>,
    count: u64,
    sum: u64,
    max: u64,
}

impl Histogram {
    pub fn new() -> Histogram {
        Histogram::default()
    }

    fn bucket_for(value: u64) -> usize {
        (u64::BITS - value.leading_zeros()) as usize
    }

    pub fn record(&mut self, value: u64) {
        let bucket = Histogram::bucket_for(value);
        if self.buckets.len() <= bucket {
            self.buckets.resize(bucket + 1, 0);
        }
        self.buckets[bucket] += 1;
        self.count += 1;
        self.sum += value;
        self.max = self.max.max(value);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    /// Per bucket counts, see the type level docs for the bucket bounds.
    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    pub fn merge(&mut self, other: &Histogram) {
        if self.buckets.len() < other.buckets.len() {
            self.buckets.resize(other.buckets.len(), 0);
        }
        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *mine += theirs;
        }
        self.count += other.count;
        self.sum += other.sum;
        self.max = self.max.max(other.max);
    }
}

/// The reason a buffer was handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlushKind {
    /// explicit `flush(dst)`
    Requested,
    /// the next record would not fit, or a single record reached the target size
    Capacity,
    /// the oldest record waited longer than the autoflush bound
    Timeout,
    /// the core had nothing else to run
    Idle,
    /// part of a `flush_all`
    All,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregatorStats {
    pub messages_aggregated: u64,
    pub bytes_aggregated: u64,
    pub messages_deaggregated: u64,
    pub bytes_deaggregated: u64,
    pub messages_forwarded: u64,
    pub bytes_forwarded: u64,
    pub loopback_messages: u64,
    pub immediate_sends: u64,

    pub transport_sends: u64,
    pub transport_bytes: u64,
    pub buffers_received: u64,

    pub requested_flushes: u64,
    pub capacity_flushes: u64,
    pub timeout_flushes: u64,
    pub idle_flushes: u64,
    pub all_flushes: u64,
    pub multi_flushes: u64,

    /// bytes per transport send
    pub aggregated_sizes: Histogram,
    /// records per transport send
    pub records_per_flush: Histogram,
    /// ticks the oldest record of a buffer waited before its flush
    pub oldest_wait_ticks: Histogram,
    /// ticks the newest record of a buffer waited before its flush
    pub newest_wait_ticks: Histogram,
}

impl AggregatorStats {
    pub(crate) fn record_flush(
        &mut self,
        kind: FlushKind,
        bytes: usize,
        records: usize,
        oldest_wait: u64,
        newest_wait: u64,
    ) {
        match kind {
            FlushKind::Requested => self.requested_flushes += 1,
            FlushKind::Capacity => self.capacity_flushes += 1,
            FlushKind::Timeout => self.timeout_flushes += 1,
            FlushKind::Idle => self.idle_flushes += 1,
            FlushKind::All => self.all_flushes += 1,
        }
        self.transport_sends += 1;
        self.transport_bytes += bytes as u64;
        self.aggregated_sizes.record(bytes as u64);
        self.records_per_flush.record(records as u64);
        self.oldest_wait_ticks.record(oldest_wait);
        self.newest_wait_ticks.record(newest_wait);
    }

    /// Total number of buffer flushes regardless of their trigger.
    pub fn flushes(&self) -> u64 {
        self.requested_flushes
            + self.capacity_flushes
            + self.timeout_flushes
            + self.idle_flushes
            + self.all_flushes
    }

    pub fn merge(&mut self, other: &AggregatorStats) {
        self.messages_aggregated += other.messages_aggregated;
        self.bytes_aggregated += other.bytes_aggregated;
        self.messages_deaggregated += other.messages_deaggregated;
        self.bytes_deaggregated += other.bytes_deaggregated;
        self.messages_forwarded += other.messages_forwarded;
        self.bytes_forwarded += other.bytes_forwarded;
        self.loopback_messages += other.loopback_messages;
        self.immediate_sends += other.immediate_sends;
        self.transport_sends += other.transport_sends;
        self.transport_bytes += other.transport_bytes;
        self.buffers_received += other.buffers_received;
        self.requested_flushes += other.requested_flushes;
        self.capacity_flushes += other.capacity_flushes;
        self.timeout_flushes += other.timeout_flushes;
        self.idle_flushes += other.idle_flushes;
        self.all_flushes += other.all_flushes;
        self.multi_flushes += other.multi_flushes;
        self.aggregated_sizes.merge(&other.aggregated_sizes);
        self.records_per_flush.merge(&other.records_per_flush);
        self.oldest_wait_ticks.merge(&other.oldest_wait_ticks);
        self.newest_wait_ticks.merge(&other.newest_wait_ticks);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CombinerStats {
    pub operations: u64,
    pub satisfied: u64,
    pub matched: u64,
    pub blocked: u64,
    pub flushes: u64,
    /// flushes whose accumulator needed a remote synchronization
    pub syncs: u64,
    /// flushes skipped because every operation in the batch was matched
    pub skipped_syncs: u64,
    /// waiters woken alone to flush the next batch
    pub elected_senders: u64,
    /// largest number of tasks seen flushing the same flusher at once
    pub max_concurrent_senders: u64,
    /// blocked operations merged into each flush
    pub combining_depth: Histogram,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets() {
        let mut h = Histogram::new();
        h.record(0);
        h.record(1);
        h.record(2);
        h.record(3);
        h.record(4096);
        assert_eq!(h.buckets()[0], 1);
        assert_eq!(h.buckets()[1], 1);
        assert_eq!(h.buckets()[2], 2);
        assert_eq!(h.buckets()[13], 1);
        assert_eq!(h.count(), 5);
        assert_eq!(h.sum(), 4106);
        assert_eq!(h.max(), 4096);
    }

    #[test]
    fn histogram_merge() {
        let mut a = Histogram::new();
        let mut b = Histogram::new();
        a.record(5);
        b.record(100);
        b.record(7);
        a.merge(&b);
        assert_eq!(a.count(), 3);
        assert_eq!(a.max(), 100);
        assert_eq!(a.buckets()[3], 2);
        assert_eq!(a.buckets()[7], 1);
    }

    #[test]
    fn flush_kinds_are_counted() {
        let mut stats = AggregatorStats::default();
        stats.record_flush(FlushKind::Capacity, 100, 3, 10, 2);
        stats.record_flush(FlushKind::Idle, 50, 1, 1, 1);
        stats.record_flush(FlushKind::Requested, 20, 1, 0, 0);
        assert_eq!(stats.flushes(), 3);
        assert_eq!(stats.transport_sends, 3);
        assert_eq!(stats.transport_bytes, 170);
        assert_eq!(stats.capacity_flushes, 1);
        assert_eq!(stats.records_per_flush.sum(), 5);
    }
}
