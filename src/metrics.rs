//! Process-wide counters the pipeline bumps instead of propagating errors.
//!
//! Every stage increments one of these on a recoverable failure rather than
//! surfacing it; the counters are what `/readyz` and `status()` report back.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub packets_captured: AtomicU64,
    pub capture_errors: AtomicU64,
    pub buffer_overflow_total: AtomicU64,
    pub flows_completed_total: AtomicU64,
    pub inference_queue_drops_total: AtomicU64,
    pub persistence_failures_total: AtomicU64,
    pub publish_failures_total: AtomicU64,
    pub publish_success_total: AtomicU64,
    pub alerts_created_total: AtomicU64,
    pub ws_clients_dropped_total: AtomicU64,

    pub datastore_healthy: AtomicBool,
    pub pubsub_healthy: AtomicBool,
    pub capture_healthy: AtomicBool,
    pub models_healthy: AtomicBool,
}

impl Metrics {
    pub fn new() -> Self {
        let m = Self::default();
        m.datastore_healthy.store(true, Ordering::Relaxed);
        m.pubsub_healthy.store(true, Ordering::Relaxed);
        m.capture_healthy.store(false, Ordering::Relaxed);
        m.models_healthy.store(false, Ordering::Relaxed);
        m
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_captured: self.packets_captured.load(Ordering::Relaxed),
            capture_errors: self.capture_errors.load(Ordering::Relaxed),
            buffer_overflow_total: self.buffer_overflow_total.load(Ordering::Relaxed),
            flows_completed_total: self.flows_completed_total.load(Ordering::Relaxed),
            inference_queue_drops_total: self.inference_queue_drops_total.load(Ordering::Relaxed),
            persistence_failures_total: self.persistence_failures_total.load(Ordering::Relaxed),
            publish_failures_total: self.publish_failures_total.load(Ordering::Relaxed),
            publish_success_total: self.publish_success_total.load(Ordering::Relaxed),
            alerts_created_total: self.alerts_created_total.load(Ordering::Relaxed),
            ws_clients_dropped_total: self.ws_clients_dropped_total.load(Ordering::Relaxed),
            datastore_healthy: self.datastore_healthy.load(Ordering::Relaxed),
            pubsub_healthy: self.pubsub_healthy.load(Ordering::Relaxed),
            capture_healthy: self.capture_healthy.load(Ordering::Relaxed),
            models_healthy: self.models_healthy.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub packets_captured: u64,
    pub capture_errors: u64,
    pub buffer_overflow_total: u64,
    pub flows_completed_total: u64,
    pub inference_queue_drops_total: u64,
    pub persistence_failures_total: u64,
    pub publish_failures_total: u64,
    pub publish_success_total: u64,
    pub alerts_created_total: u64,
    pub ws_clients_dropped_total: u64,
    pub datastore_healthy: bool,
    pub pubsub_healthy: bool,
    pub capture_healthy: bool,
    pub models_healthy: bool,
}

impl MetricsSnapshot {
    pub fn fully_healthy(&self) -> bool {
        self.datastore_healthy && self.pubsub_healthy && self.capture_healthy && self.models_healthy
    }
}
