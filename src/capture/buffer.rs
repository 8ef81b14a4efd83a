//! The bounded ring between the Sniffer and the FlowBuilder: the only
//! synchronisation point between the capture path and the consumer path.

use crossbeam_queue::ArrayQueue;

use crate::metrics::Metrics;
use crate::types::PacketRecord;
use std::sync::Arc;

/// Fixed-capacity ring. On overflow the oldest record is discarded and the
/// overflow is counted, never signalled as an error.
pub struct PacketBuffer {
    queue: ArrayQueue<PacketRecord>,
    capacity: usize,
    metrics: Arc<Metrics>,
}

impl PacketBuffer {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            capacity: capacity.max(1),
            metrics,
        }
    }

    /// Pushes a record, dropping the oldest one first if the ring is full.
    pub fn push(&self, record: PacketRecord) {
        if let Err(rejected) = self.queue.push(record) {
            // Ring full: evict the oldest entry and retry once. Another
            // producer could in principle race us here, but the Sniffer is
            // the buffer's sole producer, so this is uncontended in
            // practice and at worst drops one extra record under a race.
            let _ = self.queue.pop();
            self.metrics
                .buffer_overflow_total
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            if self.queue.push(rejected).is_err() {
                self.metrics
                    .buffer_overflow_total
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
    }

    /// Drains up to `max` records for a single ingest batch.
    pub fn drain_batch(&self, max: usize) -> Vec<PacketRecord> {
        let mut batch = Vec::with_capacity(max.min(self.queue.len()));
        while batch.len() < max {
            match self.queue.pop() {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Protocol, Timestamp};
    use std::net::{IpAddr, Ipv4Addr};

    fn sample_record() -> PacketRecord {
        PacketRecord {
            timestamp: Timestamp::now(),
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port: 1234,
            dst_port: 80,
            protocol: Protocol::Tcp,
            size: 64,
            tcp_flags: None,
            header_len: 20,
            payload_len: 0,
            tcp_window: None,
        }
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let metrics = Arc::new(Metrics::new());
        let buffer = PacketBuffer::new(2, metrics.clone());
        buffer.push(sample_record());
        buffer.push(sample_record());
        assert_eq!(buffer.len(), 2);

        buffer.push(sample_record());
        assert_eq!(buffer.len(), 2, "capacity must not grow past the ring size");
        assert_eq!(
            metrics
                .buffer_overflow_total
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn drain_batch_respects_max_and_empties_in_order() {
        let metrics = Arc::new(Metrics::new());
        let buffer = PacketBuffer::new(10, metrics);
        for _ in 0..5 {
            buffer.push(sample_record());
        }
        let batch = buffer.drain_batch(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(buffer.len(), 2);
    }
}
