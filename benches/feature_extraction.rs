use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use nds::features::FeatureExtractor;
use nds::types::{CompletionReason, Endpoint, Flow, FlowKey, PacketSample, Protocol, TcpFlags, Timestamp};

fn endpoint(octet: u8, port: u16) -> Endpoint {
    Endpoint {
        ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet)),
        port,
    }
}

/// A flow with `packet_count` packets split evenly across both directions,
/// each offset by one millisecond so inter-arrival stats aren't degenerate.
fn flow_with_packets(packet_count: usize) -> Flow {
    let a = endpoint(1, 4000);
    let b = endpoint(2, 80);
    let (key, _) = FlowKey::canonical(a, b, Protocol::Tcp);
    let base = Timestamp::now();

    let mut flow = Flow {
        flow_id: uuid::Uuid::new_v4(),
        key,
        initiator: a,
        responder: b,
        protocol: Protocol::Tcp,
        first_ts: base,
        last_ts: base,
        fwd_packets: Vec::with_capacity(packet_count / 2),
        bwd_packets: Vec::with_capacity(packet_count / 2),
        init_fwd_win: Some(65535),
        init_bwd_win: Some(65535),
        completion_reason: CompletionReason::IdleTimeout,
    };

    for i in 0..packet_count {
        let ts = Timestamp {
            monotonic: base.monotonic + Duration::from_millis(i as u64),
            wall: base.wall + Duration::from_millis(i as u64),
        };
        let sample = PacketSample {
            timestamp: ts,
            size: (64 + (i % 1400)) as u32,
            tcp_flags: Some(TcpFlags(if i == 0 { TcpFlags::SYN } else { TcpFlags::ACK })),
            header_len: 20,
            payload_len: (44 + (i % 1400)) as u32,
        };
        if i % 2 == 0 {
            flow.fwd_packets.push(sample);
        } else {
            flow.bwd_packets.push(sample);
        }
    }
    flow.last_ts = Timestamp {
        monotonic: base.monotonic + Duration::from_millis(packet_count as u64),
        wall: base.wall + Duration::from_millis(packet_count as u64),
    };
    flow
}

fn bench_extract_by_flow_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("FeatureExtractor::extract");

    for packet_count in [1, 10, 100, 1000].iter() {
        let flow = flow_with_packets(*packet_count);
        group.throughput(Throughput::Elements(*packet_count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(packet_count), &flow, |b, flow| {
            b.iter(|| black_box(FeatureExtractor::extract(black_box(flow))));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_extract_by_flow_size);
criterion_main!(benches);
