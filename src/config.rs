//! Recognised configuration keys, loaded from CLI flags or environment
//! variables (flags win when both are given). Every row of the
//! configuration table in the design doc is one field here.

use std::path::PathBuf;

use clap::Parser;
use log::warn;

use crate::error::{NdsError, Result};

#[derive(Debug, Clone, Parser)]
#[command(name = "nds", about = "Real-time network intrusion detection pipeline")]
pub struct Config {
    /// Interface name, or "auto" for the platform default.
    #[arg(long, env = "CAPTURE_INTERFACE", default_value = "auto")]
    pub capture_interface: String,

    /// Ring buffer capacity between the Sniffer and the FlowBuilder.
    #[arg(long, env = "CAPTURE_BUFFER_SIZE", default_value_t = 1000)]
    pub capture_buffer_size: usize,

    /// Idle timeout, in seconds, before a flow with no new packets closes.
    #[arg(long, env = "CAPTURE_FLOW_TIMEOUT", default_value_t = 120)]
    pub capture_flow_timeout: u64,

    /// Hard cap, in seconds, on flow lifetime regardless of activity.
    #[arg(long, env = "CAPTURE_FLOW_HARD_CAP", default_value_t = 3600)]
    pub capture_flow_hard_cap: u64,

    /// Standard-deviation multiplier for the anomaly threshold (mu + k*sigma).
    #[arg(long, env = "ANOMALY_THRESHOLD_K", default_value_t = 3.0)]
    pub anomaly_threshold_k: f64,

    /// Minimum classifier confidence for a non-benign label to count as an attack.
    #[arg(long, env = "MIN_CLASSIFICATION_CONFIDENCE", default_value_t = 0.5)]
    pub min_classification_confidence: f64,

    #[arg(long, env = "WEIGHT_SUPERVISED", default_value_t = 0.5)]
    pub weight_supervised: f64,

    #[arg(long, env = "WEIGHT_UNSUPERVISED", default_value_t = 0.3)]
    pub weight_unsupervised: f64,

    #[arg(long, env = "WEIGHT_REPUTATION", default_value_t = 0.2)]
    pub weight_reputation: f64,

    /// Minimum final_risk for a non-attack, non-anomaly flow to be flagged suspicious.
    #[arg(long, env = "THRESHOLD_ATTACK", default_value_t = 0.7)]
    pub threshold_attack: f64,

    /// Confidence above which a supervised is_attack=true becomes confirmed rather than suspicious.
    #[arg(long, env = "CONFIRMED_ATTACK_CONFIDENCE", default_value_t = 0.8)]
    pub confirmed_attack_confidence: f64,

    /// Directory holding the six pre-trained artifacts.
    #[arg(long, env = "MODEL_DIR", default_value = "./ai/artifacts")]
    pub model_dir: PathBuf,

    /// Inference worker pool size; defaults to the number of logical cores.
    #[arg(long, env = "INFERENCE_WORKERS")]
    pub inference_workers: Option<usize>,

    /// Bound on the queue between FlowBuilder and the inference pool.
    #[arg(long, env = "INFERENCE_QUEUE_CAPACITY", default_value_t = 4096)]
    pub inference_queue_capacity: usize,

    /// Directory the embedded datastore persists to.
    #[arg(long, env = "DATA_DIR", default_value = "./data/nds.sled")]
    pub data_dir: PathBuf,

    /// Whether to retain the full feature vector alongside each flow record.
    #[arg(long, env = "PERSIST_RAW_FEATURES", default_value_t = false)]
    pub persist_raw_features: bool,

    /// Address the health/WebSocket HTTP server binds to.
    #[arg(long, env = "HTTP_BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub http_bind_addr: String,

    /// Max queued-but-unsent messages before a WebSocket client is dropped.
    #[arg(long, env = "WS_CLIENT_QUEUE_LEN", default_value_t = 64)]
    pub ws_client_queue_len: usize,
}

impl Config {
    pub fn inference_workers(&self) -> usize {
        self.inference_workers.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Validates and, where the design allows it, repairs configuration:
    /// fusion weights that don't sum to 1 are renormalised rather than
    /// rejected; a missing model directory is left for the caller to turn
    /// into degraded mode rather than treated as fatal here.
    pub fn validate(&mut self) -> Result<()> {
        let sum = self.weight_supervised + self.weight_unsupervised + self.weight_reputation;
        if (sum - 1.0).abs() > 1e-6 {
            if sum <= 0.0 {
                return Err(NdsError::Config(
                    "fusion weights sum to zero or less, cannot renormalise".into(),
                ));
            }
            warn!(
                "fusion weights summed to {:.4}, renormalising (was {:.2}/{:.2}/{:.2})",
                sum, self.weight_supervised, self.weight_unsupervised, self.weight_reputation
            );
            self.weight_supervised /= sum;
            self.weight_unsupervised /= sum;
            self.weight_reputation /= sum;
        }
        Ok(())
    }
}
