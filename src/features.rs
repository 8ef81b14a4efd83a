//! FeatureExtractor: turns a completed flow into the fixed-length,
//! fixed-order feature vector the preprocessing chain and models expect.

use wide::f64x4;

use crate::types::{Flow, FeatureVector, PacketSample, TcpFlags};

/// Name, in contractual order, of every coordinate `extract` produces.
/// `FEATURE_VECTOR_LEN` is derived from this list rather than hand-counted
/// so the two can never drift apart.
pub const FEATURE_NAMES: &[&str] = &[
    "duration",
    "fwd_pkts",
    "bwd_pkts",
    "fwd_bytes",
    "bwd_bytes",
    "bytes_per_sec",
    "packets_per_sec",
    "fwd_pkt_len_mean",
    "fwd_pkt_len_std",
    "fwd_pkt_len_max",
    "fwd_pkt_len_min",
    "bwd_pkt_len_mean",
    "bwd_pkt_len_std",
    "bwd_pkt_len_max",
    "bwd_pkt_len_min",
    "pkt_len_mean",
    "pkt_len_std",
    "pkt_len_max",
    "pkt_len_min",
    "flow_iat_mean",
    "flow_iat_std",
    "flow_iat_max",
    "flow_iat_min",
    "fwd_iat_mean",
    "fwd_iat_std",
    "fwd_iat_max",
    "fwd_iat_min",
    "bwd_iat_mean",
    "bwd_iat_std",
    "bwd_iat_max",
    "bwd_iat_min",
    "fwd_fin",
    "fwd_syn",
    "fwd_rst",
    "fwd_psh",
    "fwd_ack",
    "fwd_urg",
    "fwd_ece",
    "fwd_cwr",
    "bwd_fin",
    "bwd_syn",
    "bwd_rst",
    "bwd_psh",
    "bwd_ack",
    "bwd_urg",
    "bwd_ece",
    "bwd_cwr",
    "down_up_ratio",
    "avg_fwd_segment_size",
    "avg_bwd_segment_size",
];

pub const FEATURE_VECTOR_LEN: usize = FEATURE_NAMES.len();

pub struct FeatureExtractor;

impl FeatureExtractor {
    /// Pure function: the same flow always yields the same vector.
    pub fn extract(flow: &Flow) -> FeatureVector {
        let duration = flow.duration_secs();
        let fwd_pkts = flow.fwd_packets.len() as f64;
        let bwd_pkts = flow.bwd_packets.len() as f64;
        let fwd_bytes = flow.total_fwd_bytes() as f64;
        let bwd_bytes = flow.total_bwd_bytes() as f64;
        let total_pkts = fwd_pkts + bwd_pkts;
        let total_bytes = fwd_bytes + bwd_bytes;

        let bytes_per_sec = safe_div(total_bytes, duration);
        let packets_per_sec = safe_div(total_pkts, duration);

        let fwd_sizes: Vec<f64> = flow.fwd_packets.iter().map(|p| p.size as f64).collect();
        let bwd_sizes: Vec<f64> = flow.bwd_packets.iter().map(|p| p.size as f64).collect();
        let all_sizes: Vec<f64> = fwd_sizes.iter().chain(bwd_sizes.iter()).copied().collect();

        let fwd_size_stats = simd_stats(&fwd_sizes);
        let bwd_size_stats = simd_stats(&bwd_sizes);
        let total_size_stats = simd_stats(&all_sizes);

        let flow_iats = inter_arrival_secs(&flow.fwd_packets, &flow.bwd_packets, true);
        let fwd_iats = inter_arrival_secs(&flow.fwd_packets, &[], false);
        let bwd_iats = inter_arrival_secs(&flow.bwd_packets, &[], false);

        let flow_iat_stats = simd_stats(&flow_iats);
        let fwd_iat_stats = simd_stats(&fwd_iats);
        let bwd_iat_stats = simd_stats(&bwd_iats);

        let fwd_flags = flag_counts(&flow.fwd_packets);
        let bwd_flags = flag_counts(&flow.bwd_packets);

        let down_up_ratio = safe_div(bwd_bytes, fwd_bytes);
        let avg_fwd_segment_size = safe_div(fwd_bytes, fwd_pkts);
        let avg_bwd_segment_size = safe_div(bwd_bytes, bwd_pkts);

        let values = vec![
            duration,
            fwd_pkts,
            bwd_pkts,
            fwd_bytes,
            bwd_bytes,
            bytes_per_sec,
            packets_per_sec,
            fwd_size_stats.mean,
            fwd_size_stats.std_dev,
            fwd_size_stats.max,
            fwd_size_stats.min,
            bwd_size_stats.mean,
            bwd_size_stats.std_dev,
            bwd_size_stats.max,
            bwd_size_stats.min,
            total_size_stats.mean,
            total_size_stats.std_dev,
            total_size_stats.max,
            total_size_stats.min,
            flow_iat_stats.mean,
            flow_iat_stats.std_dev,
            flow_iat_stats.max,
            flow_iat_stats.min,
            fwd_iat_stats.mean,
            fwd_iat_stats.std_dev,
            fwd_iat_stats.max,
            fwd_iat_stats.min,
            bwd_iat_stats.mean,
            bwd_iat_stats.std_dev,
            bwd_iat_stats.max,
            bwd_iat_stats.min,
            fwd_flags.fin as f64,
            fwd_flags.syn as f64,
            fwd_flags.rst as f64,
            fwd_flags.psh as f64,
            fwd_flags.ack as f64,
            fwd_flags.urg as f64,
            fwd_flags.ece as f64,
            fwd_flags.cwr as f64,
            bwd_flags.fin as f64,
            bwd_flags.syn as f64,
            bwd_flags.rst as f64,
            bwd_flags.psh as f64,
            bwd_flags.ack as f64,
            bwd_flags.urg as f64,
            bwd_flags.ece as f64,
            bwd_flags.cwr as f64,
            down_up_ratio,
            avg_fwd_segment_size,
            avg_bwd_segment_size,
        ];

        debug_assert_eq!(values.len(), FEATURE_VECTOR_LEN);
        FeatureVector(values)
    }
}

/// 0 instead of NaN/Inf whenever the denominator is non-positive.
fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

#[derive(Default)]
struct Stats {
    mean: f64,
    std_dev: f64,
    max: f64,
    min: f64,
}

/// SIMD-accelerated mean/std/min/max, four lanes at a time. Empty input
/// yields all-zero stats, never NaN.
fn simd_stats(values: &[f64]) -> Stats {
    if values.is_empty() {
        return Stats::default();
    }

    let mean = simd_mean(values);
    let std_dev = simd_std_dev(values, mean);
    let (min, max) = simd_min_max(values);
    Stats { mean, std_dev, max, min }
}

fn simd_mean(values: &[f64]) -> f64 {
    if values.len() < 4 {
        return values.iter().sum::<f64>() / values.len() as f64;
    }
    let mut sum = f64x4::splat(0.0);
    let chunks = values.len() / 4;
    for i in 0..chunks {
        sum += f64x4::new([values[i * 4], values[i * 4 + 1], values[i * 4 + 2], values[i * 4 + 3]]);
    }
    let simd_sum: f64 = sum.to_array().iter().sum();
    let remaining_sum: f64 = values[chunks * 4..].iter().sum();
    (simd_sum + remaining_sum) / values.len() as f64
}

fn simd_std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 4 {
        let variance = values.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / values.len() as f64;
        return variance.sqrt();
    }
    let mean_vec = f64x4::splat(mean);
    let mut sum_sq_diff = f64x4::splat(0.0);
    let chunks = values.len() / 4;
    for i in 0..chunks {
        let chunk = f64x4::new([values[i * 4], values[i * 4 + 1], values[i * 4 + 2], values[i * 4 + 3]]);
        let diff = chunk - mean_vec;
        sum_sq_diff += diff * diff;
    }
    let simd_variance: f64 = sum_sq_diff.to_array().iter().sum();
    let remaining_variance: f64 = values[chunks * 4..].iter().map(|x| (x - mean) * (x - mean)).sum();
    ((simd_variance + remaining_variance) / values.len() as f64).sqrt()
}

fn simd_min_max(values: &[f64]) -> (f64, f64) {
    if values.len() < 4 {
        return values.iter().fold((values[0], values[0]), |(min, max), &v| (min.min(v), max.max(v)));
    }
    let mut min_vec = f64x4::splat(f64::INFINITY);
    let mut max_vec = f64x4::splat(f64::NEG_INFINITY);
    let chunks = values.len() / 4;
    for i in 0..chunks {
        let chunk = f64x4::new([values[i * 4], values[i * 4 + 1], values[i * 4 + 2], values[i * 4 + 3]]);
        min_vec = min_vec.min(chunk);
        max_vec = max_vec.max(chunk);
    }
    let simd_min = min_vec.to_array().iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let simd_max = max_vec.to_array().iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    values[chunks * 4..]
        .iter()
        .fold((simd_min, simd_max), |(min, max), &v| (min.min(v), max.max(v)))
}

/// Inter-arrival times in seconds, in packet-timestamp order. `merge_both`
/// interleaves both directions by timestamp for the whole-flow IAT block;
/// otherwise only `fwd` is used (call twice for fwd/bwd separately).
fn inter_arrival_secs(fwd: &[PacketSample], bwd: &[PacketSample], merge_both: bool) -> Vec<f64> {
    let mut timestamps: Vec<std::time::Instant> = if merge_both {
        fwd.iter().chain(bwd.iter()).map(|p| p.timestamp.monotonic).collect()
    } else {
        fwd.iter().map(|p| p.timestamp.monotonic).collect()
    };
    timestamps.sort();
    timestamps
        .windows(2)
        .map(|w| w[1].saturating_duration_since(w[0]).as_secs_f64())
        .collect()
}

struct FlagCounts {
    fin: u32,
    syn: u32,
    rst: u32,
    psh: u32,
    ack: u32,
    urg: u32,
    ece: u32,
    cwr: u32,
}

fn flag_counts(packets: &[PacketSample]) -> FlagCounts {
    let mut counts = FlagCounts {
        fin: 0,
        syn: 0,
        rst: 0,
        psh: 0,
        ack: 0,
        urg: 0,
        ece: 0,
        cwr: 0,
    };
    for packet in packets {
        if let Some(flags) = packet.tcp_flags {
            if flags.has(TcpFlags::FIN) {
                counts.fin += 1;
            }
            if flags.has(TcpFlags::SYN) {
                counts.syn += 1;
            }
            if flags.has(TcpFlags::RST) {
                counts.rst += 1;
            }
            if flags.has(TcpFlags::PSH) {
                counts.psh += 1;
            }
            if flags.has(TcpFlags::ACK) {
                counts.ack += 1;
            }
            if flags.has(TcpFlags::URG) {
                counts.urg += 1;
            }
            if flags.has(TcpFlags::ECE) {
                counts.ece += 1;
            }
            if flags.has(TcpFlags::CWR) {
                counts.cwr += 1;
            }
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CompletionReason, Endpoint, FlowKey, Protocol, Timestamp};
    use std::net::{IpAddr, Ipv4Addr};
    use uuid::Uuid;

    fn endpoint(octet: u8, port: u16) -> Endpoint {
        Endpoint {
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet)),
            port,
        }
    }

    fn empty_flow() -> Flow {
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
    fn empty_flow_has_no_nan_and_correct_length() {
        let flow = empty_flow();
        let vector = FeatureExtractor::extract(&flow);
        assert_eq!(vector.len(), FEATURE_VECTOR_LEN);
        assert!(vector.as_slice().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn feature_names_and_vector_length_agree() {
        assert_eq!(FEATURE_NAMES.len(), FEATURE_VECTOR_LEN);
    }

    #[test]
    fn single_packet_each_direction_produces_zero_std() {
        let mut flow = empty_flow();
        flow.fwd_packets.push(PacketSample {
            timestamp: flow.first_ts,
            size: 100,
            tcp_flags: None,
            header_len: 20,
            payload_len: 80,
        });
        flow.bwd_packets.push(PacketSample {
            timestamp: flow.first_ts,
            size: 200,
            tcp_flags: None,
            header_len: 20,
            payload_len: 180,
        });
        let vector = FeatureExtractor::extract(&flow);
        let std_idx = FEATURE_NAMES.iter().position(|n| *n == "fwd_pkt_len_std").unwrap();
        assert_eq!(vector.0[std_idx], 0.0);
    }
}
