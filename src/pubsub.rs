//! In-process publish/subscribe standing in for the external channel the
//! design calls `nds:alerts:realtime`: an internal event bus realized with
//! `tokio::sync::broadcast` rather than a network round trip, since nothing
//! downstream of this pipeline needs alerts fanned out across processes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::error::{NdsError, Result};
use crate::metrics::Metrics;
use crate::types::AlertRecord;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);
const THREAT_SCORE_ALPHA: f64 = 0.3;

pub const ALERTS_CHANNEL: &str = "nds:alerts:realtime";

/// The abstraction DecisionEngine publishes through; an external pub/sub
/// backend could implement this trait without the rest of the pipeline
/// changing.
pub trait PubSub: Send + Sync {
    fn publish_alert(&self, alert: &AlertRecord) -> Result<()>;
    fn update_threat_score(&self, final_risk: f64);
    fn threat_score(&self) -> f64;
    fn subscribe(&self) -> broadcast::Receiver<Arc<AlertRecord>>;
}

pub struct InProcessPubSub {
    sender: broadcast::Sender<Arc<AlertRecord>>,
    threat_score_bits: AtomicU64,
    metrics: Arc<Metrics>,
    last_publish_error: Mutex<Option<String>>,
}

impl InProcessPubSub {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            threat_score_bits: AtomicU64::new(0.0f64.to_bits()),
            metrics,
            last_publish_error: Mutex::new(None),
        }
    }

    /// Runs the 1s-timeout publish on the current tokio runtime; publication
    /// failures are logged and counted, never propagated as pipeline errors.
    fn publish_with_timeout(&self, alert: Arc<AlertRecord>) -> Result<()> {
        let sender = self.sender.clone();
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            NdsError::PubSub("publish attempted outside a tokio runtime".into())
        })?;
        let result = handle.block_on(async {
            timeout(PUBLISH_TIMEOUT, async { sender.send(alert).map_err(|_| ()) }).await
        });
        match result {
            Ok(Ok(_)) => {
                self.metrics.publish_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(_)) => {
                // No active subscribers is not a failure; broadcast::send
                // only errors when the channel has zero receivers.
                debug!("published alert with no active subscribers");
                self.metrics.publish_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => {
                let msg = "publish to nds:alerts:realtime timed out after 1s".to_string();
                warn!("{}", msg);
                *self.last_publish_error.lock() = Some(msg.clone());
                self.metrics.publish_failures_total.fetch_add(1, Ordering::Relaxed);
                Err(NdsError::PubSub(msg))
            }
        }
    }
}

impl PubSub for InProcessPubSub {
    fn publish_alert(&self, alert: &AlertRecord) -> Result<()> {
        self.publish_with_timeout(Arc::new(alert.clone()))
    }

    fn update_threat_score(&self, final_risk: f64) {
        loop {
            let old_bits = self.threat_score_bits.load(Ordering::Relaxed);
            let old = f64::from_bits(old_bits);
            let new = THREAT_SCORE_ALPHA * final_risk + (1.0 - THREAT_SCORE_ALPHA) * old;
            if self
                .threat_score_bits
                .compare_exchange(old_bits, new.to_bits(), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    fn threat_score(&self) -> f64 {
        f64::from_bits(self.threat_score_bits.load(Ordering::Relaxed))
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<AlertRecord>> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertStatus, Decision, Severity};
    use uuid::Uuid;

    fn sample_alert(risk: f64) -> AlertRecord {
        AlertRecord {
            alert_id: Uuid::new_v4(),
            flow_id: Uuid::new_v4(),
            severity: Severity::from_risk(risk),
            attack_type: Some("DDoS".into()),
            threat_score: risk,
            decision: Decision::ConfirmedAttack,
            status: AlertStatus::Open,
            priority: 1,
            metadata: serde_json::json!({}),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_with_active_subscriber_is_received() {
        let metrics = Arc::new(Metrics::new());
        let bus = InProcessPubSub::new(16, metrics);
        let mut rx = bus.subscribe();
        let alert = sample_alert(0.9);
        bus.publish_alert(&alert).unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.alert_id, alert.alert_id);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_still_succeeds() {
        let metrics = Arc::new(Metrics::new());
        let bus = InProcessPubSub::new(16, metrics);
        let alert = sample_alert(0.9);
        assert!(bus.publish_alert(&alert).is_ok());
    }

    #[tokio::test]
    async fn threat_score_is_exponentially_smoothed() {
        let metrics = Arc::new(Metrics::new());
        let bus = InProcessPubSub::new(16, metrics);
        bus.update_threat_score(1.0);
        assert!((bus.threat_score() - 0.3).abs() < 1e-9);
        bus.update_threat_score(1.0);
        assert!((bus.threat_score() - 0.51).abs() < 1e-9);
    }
}
