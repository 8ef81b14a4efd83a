//! DecisionEngine: fuses the two predictor outputs and an IP-reputation
//! signal into a single decision, then persists and publishes the result.

use chrono::Utc;
use log::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::persistence::{log_persistence_failure, Datastore, FlowOutcome};
use crate::pubsub::PubSub;
use crate::types::{
    AlertRecord, AlertStatus, AnomalyRecord, Decision, Flow, PredictionRecord, Severity, SupervisedOutput,
    UnsupervisedOutput,
};

pub struct FusionWeights {
    pub supervised: f64,
    pub unsupervised: f64,
    pub reputation: f64,
}

pub struct DecisionEngine {
    weights: FusionWeights,
    threshold_attack: f64,
    confirmed_attack_confidence: f64,
    persist_raw_features: bool,
}

/// Everything a completed inference cycle produces for one flow, before
/// fusion. Not persisted directly; `DecisionEngine::decide` turns it into
/// the persisted/published shape.
pub struct InferenceOutcome {
    pub flow: Flow,
    pub supervised: SupervisedOutput,
    pub unsupervised: UnsupervisedOutput,
    pub ip_reputation: f64,
    pub raw_features: Vec<f64>,
}

impl DecisionEngine {
    pub fn new(
        weights: FusionWeights,
        threshold_attack: f64,
        confirmed_attack_confidence: f64,
        persist_raw_features: bool,
    ) -> Self {
        Self {
            weights,
            threshold_attack,
            confirmed_attack_confidence,
            persist_raw_features,
        }
    }

    fn sup_risk(p: f64, is_attack: bool) -> f64 {
        if is_attack {
            p
        } else {
            1.0 - p
        }
    }

    fn final_risk(&self, sup_risk: f64, anomaly_score: f64, ip_reputation: f64) -> f64 {
        let risk = self.weights.supervised * sup_risk + self.weights.unsupervised * anomaly_score + self.weights.reputation * ip_reputation;
        risk.clamp(0.0, 1.0)
    }

    fn decision(&self, is_attack: bool, is_anomaly: bool, confidence: f64, final_risk: f64) -> Decision {
        match (is_attack, is_anomaly) {
            (true, true) => Decision::ConfirmedAttack,
            (true, false) => {
                if confidence >= self.confirmed_attack_confidence {
                    Decision::ConfirmedAttack
                } else {
                    Decision::Suspicious
                }
            }
            (false, true) => Decision::UnknownAnomaly,
            (false, false) => {
                if final_risk >= self.threshold_attack {
                    Decision::Suspicious
                } else {
                    Decision::Normal
                }
            }
        }
    }

    fn priority(severity: Severity, decision: Decision) -> u8 {
        match (severity, decision) {
            (_, Decision::Normal) => 5,
            (Severity::Critical, Decision::ConfirmedAttack) => 1,
            (Severity::Critical, Decision::UnknownAnomaly) => 1,
            (Severity::Critical, Decision::Suspicious) => 2,
            (Severity::High, Decision::ConfirmedAttack) => 2,
            (Severity::High, Decision::UnknownAnomaly) => 2,
            (Severity::High, Decision::Suspicious) => 3,
            (Severity::Medium, Decision::ConfirmedAttack) => 3,
            (Severity::Medium, Decision::UnknownAnomaly) => 3,
            (Severity::Medium, Decision::Suspicious) => 4,
            (Severity::Low, _) => 5,
        }
    }

    /// Fuses scores into a decision; does not persist or publish. Pure and
    /// deterministic given the same inputs, per the replay invariant.
    pub fn decide(&self, outcome: &InferenceOutcome) -> (PredictionRecord, AnomalyRecord, Option<AlertRecord>) {
        let sup = &outcome.supervised;
        let unsup = &outcome.unsupervised;

        let sup_risk = Self::sup_risk(sup.confidence, sup.is_attack);
        let final_risk = self.final_risk(sup_risk, unsup.anomaly_score, outcome.ip_reputation);
        let decision = self.decision(sup.is_attack, unsup.is_anomaly, sup.confidence, final_risk);
        let severity = Severity::from_risk(final_risk);
        let priority = Self::priority(severity, decision);

        let prediction = PredictionRecord {
            flow_id: outcome.flow.flow_id,
            predicted_label: sup.predicted_label.clone(),
            confidence: sup.confidence,
            class_probabilities: sup.class_probabilities.clone(),
        };
        let anomaly = AnomalyRecord {
            flow_id: outcome.flow.flow_id,
            reconstruction_error: unsup.reconstruction_error,
            anomaly_score: unsup.anomaly_score,
            threshold_used: unsup.threshold_used,
            is_anomaly: unsup.is_anomaly,
        };

        let alert = if decision != Decision::Normal {
            Some(AlertRecord {
                alert_id: Uuid::new_v4(),
                flow_id: outcome.flow.flow_id,
                severity,
                attack_type: if sup.is_attack { Some(sup.predicted_label.clone()) } else { None },
                threat_score: final_risk,
                decision,
                status: AlertStatus::Open,
                priority,
                metadata: serde_json::json!({
                    "ip_reputation": outcome.ip_reputation,
                    "sup_risk": sup_risk,
                }),
                created_at: Utc::now(),
            })
        } else {
            None
        };

        (prediction, anomaly, alert)
    }

    /// Runs `decide`, then the persistence and publication protocols in
    /// order. Persistence failure drops the flow (counted, no retry);
    /// publication failure is logged and counted but never fails the call.
    pub fn process(&self, outcome: InferenceOutcome, datastore: &Datastore, pubsub: &dyn PubSub) -> Result<Option<AlertRecord>> {
        let (prediction, anomaly, alert) = self.decide(&outcome);
        let raw_features = if self.persist_raw_features {
            Some(outcome.raw_features.as_slice())
        } else {
            None
        };

        let flow_outcome = FlowOutcome {
            flow: &outcome.flow,
            prediction: &prediction,
            anomaly: &anomaly,
            alert: alert.as_ref(),
            raw_features,
        };

        if let Err(e) = datastore.persist_flow_outcome(&flow_outcome) {
            log_persistence_failure("flow outcome", &e);
            return Err(e);
        }

        if let Some(alert) = &alert {
            if let Err(e) = pubsub.publish_alert(alert) {
                warn!("alert publication failed, continuing: {}", e);
            }
            pubsub.update_threat_score(alert.threat_score);
        }

        Ok(alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CompletionReason, Endpoint, FlowKey, Protocol, Timestamp};
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

    fn engine() -> DecisionEngine {
        DecisionEngine::new(
            FusionWeights {
                supervised: 0.5,
                unsupervised: 0.3,
                reputation: 0.2,
            },
            0.70,
            0.80,
            false,
        )
    }

    #[test]
    fn confirmed_attack_scenario_matches_documented_example() {
        let outcome = InferenceOutcome {
            flow: sample_flow(),
            supervised: SupervisedOutput {
                class_probabilities: HashMap::new(),
                predicted_label: "DDoS".into(),
                confidence: 0.95,
                is_attack: true,
            },
            unsupervised: UnsupervisedOutput {
                reconstruction_error: 0.5,
                anomaly_score: 0.9,
                is_anomaly: true,
                threshold_used: 0.025,
            },
            ip_reputation: 0.8,
            raw_features: vec![],
        };
        let (_, _, alert) = engine().decide(&outcome);
        let alert = alert.expect("non-normal decision must produce an alert");
        assert!((alert.threat_score - 0.905).abs() < 1e-9);
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.decision, Decision::ConfirmedAttack);
        assert_eq!(alert.priority, 1);
    }

    #[test]
    fn normal_flow_produces_no_alert() {
        let outcome = InferenceOutcome {
            flow: sample_flow(),
            supervised: SupervisedOutput {
                class_probabilities: HashMap::new(),
                predicted_label: "BENIGN".into(),
                confidence: 0.99,
                is_attack: false,
            },
            unsupervised: UnsupervisedOutput {
                reconstruction_error: 0.001,
                anomaly_score: 0.0,
                is_anomaly: false,
                threshold_used: 0.025,
            },
            ip_reputation: 0.1,
            raw_features: vec![],
        };
        let (_, _, alert) = engine().decide(&outcome);
        assert!(alert.is_none());
    }

    #[test]
    fn attack_without_anomaly_below_confidence_is_suspicious_not_confirmed() {
        let outcome = InferenceOutcome {
            flow: sample_flow(),
            supervised: SupervisedOutput {
                class_probabilities: HashMap::new(),
                predicted_label: "PortScan".into(),
                confidence: 0.6,
                is_attack: true,
            },
            unsupervised: UnsupervisedOutput {
                reconstruction_error: 0.01,
                anomaly_score: 0.1,
                is_anomaly: false,
                threshold_used: 0.025,
            },
            ip_reputation: 0.2,
            raw_features: vec![],
        };
        let (_, _, alert) = engine().decide(&outcome);
        assert_eq!(alert.unwrap().decision, Decision::Suspicious);
    }

    #[test]
    fn unknown_anomaly_without_classifier_attack_is_flagged() {
        let outcome = InferenceOutcome {
            flow: sample_flow(),
            supervised: SupervisedOutput {
                class_probabilities: HashMap::new(),
                predicted_label: "BENIGN".into(),
                confidence: 0.9,
                is_attack: false,
            },
            unsupervised: UnsupervisedOutput {
                reconstruction_error: 0.3,
                anomaly_score: 0.95,
                is_anomaly: true,
                threshold_used: 0.025,
            },
            ip_reputation: 0.1,
            raw_features: vec![],
        };
        let (_, _, alert) = engine().decide(&outcome);
        assert_eq!(alert.unwrap().decision, Decision::UnknownAnomaly);
    }

    #[test]
    fn final_risk_is_always_clamped_to_unit_interval() {
        let outcome = InferenceOutcome {
            flow: sample_flow(),
            supervised: SupervisedOutput {
                class_probabilities: HashMap::new(),
                predicted_label: "DDoS".into(),
                confidence: 1.0,
                is_attack: true,
            },
            unsupervised: UnsupervisedOutput {
                reconstruction_error: 1.0,
                anomaly_score: 1.0,
                is_anomaly: true,
                threshold_used: 0.025,
            },
            ip_reputation: 1.0,
            raw_features: vec![],
        };
        let (_, _, alert) = engine().decide(&outcome);
        assert!(alert.unwrap().threat_score <= 1.0);
    }
}
