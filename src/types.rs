//! Shared, tagged data types that flow between pipeline stages.
//!
//! Every structured result that crosses a stage boundary gets its own type
//! here instead of a dynamically-typed map, so the compiler enforces the
//! contract between stages.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// IANA protocol numbers the pipeline understands; anything else is kept as
/// its raw value so generic (non-TCP/UDP/ICMP) IP traffic still flows
/// through the same 5-tuple machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Icmp,
    Tcp,
    Udp,
    Other(u8),
}

impl Protocol {
    pub fn from_number(n: u8) -> Self {
        match n {
            1 => Protocol::Icmp,
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            other => Protocol::Other(other),
        }
    }

    pub fn as_number(self) -> u8 {
        match self {
            Protocol::Icmp => 1,
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Other(n) => n,
        }
    }
}

/// TCP flag bitfield, laid out the way the wire does: FIN SYN RST PSH ACK URG ECE CWR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
    pub const ECE: u8 = 0x40;
    pub const CWR: u8 = 0x80;

    pub fn has(self, mask: u8) -> bool {
        self.0 & mask != 0
    }

    pub fn fin(self) -> bool {
        self.has(Self::FIN)
    }

    pub fn syn(self) -> bool {
        self.has(Self::SYN)
    }

    pub fn rst(self) -> bool {
        self.has(Self::RST)
    }
}

/// A monotonic instant paired with the wall-clock time it corresponds to.
/// Ordering and duration math use the monotonic half; persistence and
/// display use the wall-clock half.
#[derive(Debug, Clone, Copy)]
pub struct Timestamp {
    pub monotonic: Instant,
    pub wall: SystemTime,
}

impl Timestamp {
    pub fn now() -> Self {
        Self {
            monotonic: Instant::now(),
            wall: SystemTime::now(),
        }
    }

    pub fn duration_since(&self, earlier: &Timestamp) -> std::time::Duration {
        self.monotonic.saturating_duration_since(earlier.monotonic)
    }

    pub fn wall_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.wall)
    }
}

/// An ephemeral, normalised packet as it leaves the Sniffer. Lives only in
/// the capture buffer; it is never persisted.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub timestamp: Timestamp,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
    pub size: usize,
    pub tcp_flags: Option<TcpFlags>,
    pub header_len: usize,
    pub payload_len: usize,
    pub tcp_window: Option<u16>,
}

/// One endpoint of a flow: an (ip, port) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

/// The canonical 5-tuple key: endpoints sorted so A->B and B->A collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub low: Endpoint,
    pub high: Endpoint,
    pub protocol: Protocol,
}

impl FlowKey {
    /// Builds the canonical key and reports which side was numerically
    /// lower as well as whether the given (src, dst) pair matches the
    /// "forward" (low->high) direction.
    pub fn canonical(src: Endpoint, dst: Endpoint, protocol: Protocol) -> (Self, bool) {
        let forward = match src.cmp(&dst) {
            Ordering::Less | Ordering::Equal => true,
            Ordering::Greater => false,
        };
        let (low, high) = if forward { (src, dst) } else { (dst, src) };
        (
            FlowKey {
                low,
                high,
                protocol,
            },
            forward,
        )
    }
}

/// Why a flow transitioned from `active` to `complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionReason {
    IdleTimeout,
    TcpReset,
    TcpFinAck,
    HardCap,
}

/// A single packet's contribution to a flow, retained only for the
/// duration the flow is active so FeatureExtractor can derive statistics.
#[derive(Debug, Clone)]
pub struct PacketSample {
    pub timestamp: Timestamp,
    pub size: u32,
    pub tcp_flags: Option<TcpFlags>,
    pub header_len: u32,
    pub payload_len: u32,
}

/// A completed, immutable flow handed from FlowBuilder to FeatureExtractor
/// and onward. Nothing mutates a `Flow` after construction.
#[derive(Debug, Clone)]
pub struct Flow {
    pub flow_id: Uuid,
    pub key: FlowKey,
    pub initiator: Endpoint,
    pub responder: Endpoint,
    pub protocol: Protocol,
    pub first_ts: Timestamp,
    pub last_ts: Timestamp,
    pub fwd_packets: Vec<PacketSample>,
    pub bwd_packets: Vec<PacketSample>,
    pub init_fwd_win: Option<u16>,
    pub init_bwd_win: Option<u16>,
    pub completion_reason: CompletionReason,
}

impl Flow {
    pub fn duration_secs(&self) -> f64 {
        self.last_ts.duration_since(&self.first_ts).as_secs_f64()
    }

    pub fn total_fwd_bytes(&self) -> u64 {
        self.fwd_packets.iter().map(|p| p.size as u64).sum()
    }

    pub fn total_bwd_bytes(&self) -> u64 {
        self.bwd_packets.iter().map(|p| p.size as u64).sum()
    }
}

/// The fixed-length, fixed-order feature vector fed to the preprocessing
/// chain. Order is a contract: it must match the artifacts the models were
/// fitted on.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector(pub Vec<f64>);

impl FeatureVector {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

/// Output of the supervised classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisedOutput {
    pub class_probabilities: HashMap<String, f64>,
    pub predicted_label: String,
    pub confidence: f64,
    pub is_attack: bool,
}

/// Output of the auto-encoder anomaly detector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UnsupervisedOutput {
    pub reconstruction_error: f64,
    pub anomaly_score: f64,
    pub is_anomaly: bool,
    pub threshold_used: f64,
}

/// Persisted prediction record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub flow_id: Uuid,
    pub predicted_label: String,
    pub confidence: f64,
    pub class_probabilities: HashMap<String, f64>,
}

/// Persisted anomaly record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub flow_id: Uuid,
    pub reconstruction_error: f64,
    pub anomaly_score: f64,
    pub threshold_used: f64,
    pub is_anomaly: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_risk(final_risk: f64) -> Self {
        if final_risk >= 0.85 {
            Severity::Critical
        } else if final_risk >= 0.65 {
            Severity::High
        } else if final_risk >= 0.40 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Rank used only to build the `alerts(severity, timestamp DESC)` sort
    /// key; critical sorts first.
    pub fn sort_rank(self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::High => 1,
            Severity::Medium => 2,
            Severity::Low => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    ConfirmedAttack,
    Suspicious,
    UnknownAnomaly,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Resolved,
}

/// Persisted and published alert. Created iff `decision != Decision::Normal`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub alert_id: Uuid,
    pub flow_id: Uuid,
    pub severity: Severity,
    pub attack_type: Option<String>,
    pub threat_score: f64,
    pub decision: Decision,
    pub status: AlertStatus,
    pub priority: u8,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Capture backend currently in effect, reported by `Sniffer::status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureMode {
    L2Bpf,
    L2Raw,
    L3Raw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureStatus {
    pub running: bool,
    pub packets_captured: u64,
    pub buffer_fill: usize,
    pub buffer_capacity: usize,
    pub last_error: Option<String>,
    pub interface: String,
    pub mode: Option<CaptureMode>,
}
