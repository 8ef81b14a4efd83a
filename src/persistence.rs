//! Embedded datastore: one sled transaction per completed flow across four
//! conceptual tables (flows, predictions, anomaly_scores, alerts), plus
//! secondary index trees so the core surface can serve sorted queries
//! without a full scan.
//!
//! Key format follows the ML-insights storage convention this pipeline's
//! sibling components use: a sortable prefix followed by the primary key,
//! so range scans over a `sled::Tree` come back already ordered.

use std::path::Path;

use chrono::Utc;
use log::error;
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, Tree};
use uuid::Uuid;

use crate::error::{NdsError, Result};
use crate::types::{AlertRecord, AnomalyRecord, Decision, Flow, PredictionRecord};

pub struct Datastore {
    #[allow(dead_code)]
    db: Db,
    flows: Tree,
    predictions: Tree,
    anomaly_scores: Tree,
    alerts: Tree,
    flows_by_time: Tree,
    alerts_by_severity_time: Tree,
    alerts_by_flow: Tree,
}

/// Everything DecisionEngine needs committed together for one flow.
pub struct FlowOutcome<'a> {
    pub flow: &'a Flow,
    pub prediction: &'a PredictionRecord,
    pub anomaly: &'a AnomalyRecord,
    pub alert: Option<&'a AlertRecord>,
    pub raw_features: Option<&'a [f64]>,
}

impl Datastore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).map_err(NdsError::from)?;
        Ok(Self {
            flows: db.open_tree("flows").map_err(NdsError::from)?,
            predictions: db.open_tree("predictions").map_err(NdsError::from)?,
            anomaly_scores: db.open_tree("anomaly_scores").map_err(NdsError::from)?,
            alerts: db.open_tree("alerts").map_err(NdsError::from)?,
            flows_by_time: db.open_tree("flows_by_time").map_err(NdsError::from)?,
            alerts_by_severity_time: db.open_tree("alerts_by_severity_time").map_err(NdsError::from)?,
            alerts_by_flow: db.open_tree("alerts_by_flow").map_err(NdsError::from)?,
            db,
        })
    }

    pub fn open_temp() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open().map_err(NdsError::from)?;
        Ok(Self {
            flows: db.open_tree("flows").map_err(NdsError::from)?,
            predictions: db.open_tree("predictions").map_err(NdsError::from)?,
            anomaly_scores: db.open_tree("anomaly_scores").map_err(NdsError::from)?,
            alerts: db.open_tree("alerts").map_err(NdsError::from)?,
            flows_by_time: db.open_tree("flows_by_time").map_err(NdsError::from)?,
            alerts_by_severity_time: db.open_tree("alerts_by_severity_time").map_err(NdsError::from)?,
            alerts_by_flow: db.open_tree("alerts_by_flow").map_err(NdsError::from)?,
            db,
        })
    }

    /// Commits the flow, prediction, anomaly and (if present) alert records
    /// as one transaction. Rolls back all four on any failure; the caller
    /// counts the failure and drops the flow rather than retrying, since the
    /// same flow will not reappear.
    pub fn persist_flow_outcome(&self, outcome: &FlowOutcome<'_>) -> Result<()> {
        let flow_json = serde_json::to_vec(&PersistedFlow::from_outcome(outcome)).map_err(NdsError::from)?;
        let prediction_json = serde_json::to_vec(outcome.prediction).map_err(NdsError::from)?;
        let anomaly_json = serde_json::to_vec(outcome.anomaly).map_err(NdsError::from)?;
        let alert_json = outcome
            .alert
            .map(|a| serde_json::to_vec(a))
            .transpose()
            .map_err(NdsError::from)?;

        let flow_id = outcome.flow.flow_id;
        let time_key = sortable_time_key(outcome.flow.last_ts.wall_utc().timestamp_millis(), flow_id);

        let result: std::result::Result<(), TransactionError<NdsError>> = (
            &self.flows,
            &self.predictions,
            &self.anomaly_scores,
            &self.alerts,
            &self.flows_by_time,
            &self.alerts_by_severity_time,
            &self.alerts_by_flow,
        )
            .transaction(
                |(flows, predictions, anomaly_scores, alerts, flows_by_time, alerts_by_severity_time, alerts_by_flow)| {
                    flows.insert(flow_id.as_bytes(), flow_json.clone())?;
                    predictions.insert(flow_id.as_bytes(), prediction_json.clone())?;
                    anomaly_scores.insert(flow_id.as_bytes(), anomaly_json.clone())?;
                    flows_by_time.insert(time_key.clone(), flow_id.as_bytes())?;

                    if let (Some(alert), Some(alert_json)) = (outcome.alert, &alert_json) {
                        alerts.insert(alert.alert_id.as_bytes(), alert_json.clone())?;
                        let severity_key = sortable_severity_time_key(
                            alert.severity.sort_rank(),
                            alert.created_at.timestamp_millis(),
                            alert.alert_id,
                        );
                        alerts_by_severity_time.insert(severity_key, alert.alert_id.as_bytes())?;
                        alerts_by_flow.insert(flow_id.as_bytes(), alert.alert_id.as_bytes())?;
                    }
                    Ok::<(), ConflictableTransactionError<NdsError>>(())
                },
            );

        result.map_err(NdsError::from)
    }

    pub fn get_alert(&self, alert_id: Uuid) -> Result<Option<AlertRecord>> {
        match self.alerts.get(alert_id.as_bytes()).map_err(NdsError::from)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(NdsError::from)?)),
            None => Ok(None),
        }
    }

    pub fn alert_for_flow(&self, flow_id: Uuid) -> Result<Option<AlertRecord>> {
        match self.alerts_by_flow.get(flow_id.as_bytes()).map_err(NdsError::from)? {
            Some(alert_id_bytes) => {
                let alert_id = Uuid::from_slice(&alert_id_bytes).map_err(|e| NdsError::Persistence(e.to_string()))?;
                self.get_alert(alert_id)
            }
            None => Ok(None),
        }
    }

    /// Most recent alerts first, across all severities. `alerts_by_severity_time`
    /// is keyed severity-first, so it can only serve "most recent within a
    /// severity bucket"; this scans `alerts` directly and sorts by
    /// `created_at` to get a true global ordering.
    pub fn recent_alerts(&self, limit: usize) -> Result<Vec<AlertRecord>> {
        let mut out = Vec::new();
        for entry in self.alerts.iter() {
            let (_, bytes) = entry.map_err(NdsError::from)?;
            out.push(serde_json::from_slice::<AlertRecord>(&bytes).map_err(NdsError::from)?);
        }
        out.sort_unstable_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        Ok(out)
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }
}

/// Big-endian-encoded so lexicographic byte order matches numeric order;
/// the UUID suffix breaks ties between records with identical timestamps.
fn sortable_time_key(millis: i64, tie_break: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&(millis as u64).to_be_bytes());
    key.extend_from_slice(tie_break.as_bytes());
    key
}

fn sortable_severity_time_key(severity_rank: u8, millis: i64, tie_break: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(25);
    // Severity rank is already "critical sorts first"; to preserve that
    // under ascending byte order while iterating `.rev()` for newest-first
    // we invert the timestamp instead of the rank.
    key.push(severity_rank);
    key.extend_from_slice(&(u64::MAX - millis as u64).to_be_bytes());
    key.extend_from_slice(tie_break.as_bytes());
    key
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PersistedFlow {
    flow_id: Uuid,
    initiator: crate::types::Endpoint,
    responder: crate::types::Endpoint,
    protocol: crate::types::Protocol,
    duration_secs: f64,
    fwd_packet_count: usize,
    bwd_packet_count: usize,
    fwd_bytes: u64,
    bwd_bytes: u64,
    completion_reason: crate::types::CompletionReason,
    closed_at: chrono::DateTime<Utc>,
    decision: Option<Decision>,
    raw_features: Option<Vec<f64>>,
}

impl PersistedFlow {
    fn from_outcome(outcome: &FlowOutcome<'_>) -> Self {
        let flow = outcome.flow;
        Self {
            flow_id: flow.flow_id,
            initiator: flow.initiator,
            responder: flow.responder,
            protocol: flow.protocol,
            duration_secs: flow.duration_secs(),
            fwd_packet_count: flow.fwd_packets.len(),
            bwd_packet_count: flow.bwd_packets.len(),
            fwd_bytes: flow.total_fwd_bytes(),
            bwd_bytes: flow.total_bwd_bytes(),
            completion_reason: flow.completion_reason,
            closed_at: flow.last_ts.wall_utc(),
            decision: outcome.alert.map(|a| a.decision),
            raw_features: outcome.raw_features.map(|f| f.to_vec()),
        }
    }
}

pub fn log_persistence_failure(context: &str, err: &NdsError) {
    error!("persistence failed for {}: {}", context, err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertStatus, CompletionReason, Endpoint, FlowKey, Protocol, Severity, Timestamp};
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};

    fn endpoint(octet: u8, port: u16) -> Endpoint {
        Endpoint {
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet)),
            port,
        }
    }

    fn sample_flow() -> Flow {
        let a = endpoint(1, 4000);
        let b = endpoint(2, 80);
        let (key, _) = FlowKey::canonical(a, b, Protocol::Tcp);
        let now = Timestamp::now();
        Flow {
            flow_id: Uuid::new_v4(),
            key,
            initiator: a,
            responder: b,
            protocol: Protocol::Tcp,
            first_ts: now,
            last_ts: now,
            fwd_packets: Vec::new(),
            bwd_packets: Vec::new(),
            init_fwd_win: None,
            init_bwd_win: None,
            completion_reason: CompletionReason::IdleTimeout,
        }
    }

    #[test]
    fn persisting_a_flow_with_no_alert_leaves_alert_trees_empty() {
        let store = Datastore::open_temp().unwrap();
        let flow = sample_flow();
        let prediction = PredictionRecord {
            flow_id: flow.flow_id,
            predicted_label: "BENIGN".into(),
            confidence: 0.99,
            class_probabilities: HashMap::new(),
        };
        let anomaly = AnomalyRecord {
            flow_id: flow.flow_id,
            reconstruction_error: 0.001,
            anomaly_score: 0.0,
            threshold_used: 0.025,
            is_anomaly: false,
        };
        let outcome = FlowOutcome {
            flow: &flow,
            prediction: &prediction,
            anomaly: &anomaly,
            alert: None,
            raw_features: None,
        };
        store.persist_flow_outcome(&outcome).unwrap();
        assert_eq!(store.flow_count(), 1);
        assert!(store.alert_for_flow(flow.flow_id).unwrap().is_none());
    }

    #[test]
    fn persisting_a_flow_with_an_alert_makes_it_queryable_both_ways() {
        let store = Datastore::open_temp().unwrap();
        let flow = sample_flow();
        let prediction = PredictionRecord {
            flow_id: flow.flow_id,
            predicted_label: "DDoS".into(),
            confidence: 0.95,
            class_probabilities: HashMap::new(),
        };
        let anomaly = AnomalyRecord {
            flow_id: flow.flow_id,
            reconstruction_error: 0.2,
            anomaly_score: 0.9,
            threshold_used: 0.025,
            is_anomaly: true,
        };
        let alert = AlertRecord {
            alert_id: Uuid::new_v4(),
            flow_id: flow.flow_id,
            severity: Severity::Critical,
            attack_type: Some("DDoS".into()),
            threat_score: 0.9,
            decision: Decision::ConfirmedAttack,
            status: AlertStatus::Open,
            priority: 1,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        };
        let outcome = FlowOutcome {
            flow: &flow,
            prediction: &prediction,
            anomaly: &anomaly,
            alert: Some(&alert),
            raw_features: None,
        };
        store.persist_flow_outcome(&outcome).unwrap();

        assert!(store.alert_for_flow(flow.flow_id).unwrap().is_some());
        assert_eq!(store.get_alert(alert.alert_id).unwrap().unwrap().alert_id, alert.alert_id);
        assert_eq!(store.recent_alerts(10).unwrap().len(), 1);
    }

    fn persist_alert(store: &Datastore, severity: Severity, created_at: chrono::DateTime<Utc>) -> Uuid {
        let flow = sample_flow();
        let prediction = PredictionRecord {
            flow_id: flow.flow_id,
            predicted_label: "DDoS".into(),
            confidence: 0.95,
            class_probabilities: HashMap::new(),
        };
        let anomaly = AnomalyRecord {
            flow_id: flow.flow_id,
            reconstruction_error: 0.2,
            anomaly_score: 0.9,
            threshold_used: 0.025,
            is_anomaly: true,
        };
        let alert = AlertRecord {
            alert_id: Uuid::new_v4(),
            flow_id: flow.flow_id,
            severity,
            attack_type: Some("DDoS".into()),
            threat_score: 0.9,
            decision: Decision::ConfirmedAttack,
            status: AlertStatus::Open,
            priority: 1,
            metadata: serde_json::json!({}),
            created_at,
        };
        let outcome = FlowOutcome {
            flow: &flow,
            prediction: &prediction,
            anomaly: &anomaly,
            alert: Some(&alert),
            raw_features: None,
        };
        store.persist_flow_outcome(&outcome).unwrap();
        alert.alert_id
    }

    /// `alerts_by_severity_time` groups by severity first, so a naive
    /// reverse-iteration would surface an older low-severity alert ahead of
    /// a newer critical one. `recent_alerts` must sort by `created_at`
    /// globally instead.
    #[test]
    fn recent_alerts_orders_by_time_across_severities() {
        let store = Datastore::open_temp().unwrap();
        let now = Utc::now();
        let critical_id = persist_alert(&store, Severity::Critical, now - chrono::Duration::seconds(100));
        let low_id = persist_alert(&store, Severity::Low, now);

        let recent = store.recent_alerts(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].alert_id, low_id, "the more recent alert must come first regardless of severity");
        assert_eq!(recent[1].alert_id, critical_id);

        let top_one = store.recent_alerts(1).unwrap();
        assert_eq!(top_one.len(), 1);
        assert_eq!(top_one[0].alert_id, low_id);
    }
}
