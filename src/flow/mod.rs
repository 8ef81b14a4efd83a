//! FlowBuilder: reconstructs bidirectional flows from packet records and
//! closes them on timeout, explicit TCP close, or a hard duration cap.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use uuid::Uuid;

use crate::types::{CompletionReason, Endpoint, Flow, FlowKey, PacketRecord, PacketSample, Timestamp};

/// Mutable, exclusively-owned state for one in-progress flow. Never shared
/// outside the FlowBuilder; on completion its contents are moved into an
/// immutable `Flow`.
struct FlowTracker {
    key: FlowKey,
    initiator: Endpoint,
    responder: Endpoint,
    first_ts: Timestamp,
    last_ts: Timestamp,
    fwd_packets: Vec<PacketSample>,
    bwd_packets: Vec<PacketSample>,
    init_fwd_win: Option<u16>,
    init_bwd_win: Option<u16>,
    fwd_fin: bool,
    bwd_fin: bool,
}

impl FlowTracker {
    fn new(key: FlowKey, initiator: Endpoint, responder: Endpoint, first_ts: Timestamp) -> Self {
        Self {
            key,
            initiator,
            responder,
            first_ts,
            last_ts: first_ts,
            fwd_packets: Vec::new(),
            bwd_packets: Vec::new(),
            init_fwd_win: None,
            init_bwd_win: None,
            fwd_fin: false,
            bwd_fin: false,
        }
    }

    fn into_flow(self, completion_reason: CompletionReason) -> Flow {
        Flow {
            flow_id: Uuid::new_v4(),
            key: self.key,
            initiator: self.initiator,
            responder: self.responder,
            protocol: self.key.protocol,
            first_ts: self.first_ts,
            last_ts: self.last_ts,
            fwd_packets: self.fwd_packets,
            bwd_packets: self.bwd_packets,
            init_fwd_win: self.init_fwd_win,
            init_bwd_win: self.init_bwd_win,
            completion_reason,
        }
    }
}

pub struct FlowBuilder {
    active: HashMap<FlowKey, FlowTracker>,
    idle_timeout: Duration,
    hard_cap: Duration,
}

impl FlowBuilder {
    pub fn new(idle_timeout_secs: u64, hard_cap_secs: u64) -> Self {
        Self {
            active: HashMap::new(),
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            hard_cap: Duration::from_secs(hard_cap_secs),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Ingests a batch of packet records in arrival order, returning any
    /// flows that completed as a direct result (TCP RST, or FIN observed on
    /// both directions followed by an ACK).
    pub fn ingest(&mut self, batch: Vec<PacketRecord>) -> Vec<Flow> {
        let mut completed = Vec::new();
        for record in batch {
            if let Some(flow) = self.ingest_one(record) {
                completed.push(flow);
            }
        }
        completed
    }

    fn ingest_one(&mut self, record: PacketRecord) -> Option<Flow> {
        let src = Endpoint {
            ip: record.src_ip,
            port: record.src_port,
        };
        let dst = Endpoint {
            ip: record.dst_ip,
            port: record.dst_port,
        };
        let (key, _) = FlowKey::canonical(src, dst, record.protocol);

        if !self.active.contains_key(&key) {
            // The initiator is whoever sent this packet, not the lexicographically
            // lower endpoint `FlowKey::canonical` picks for the lookup key.
            self.active
                .insert(key, FlowTracker::new(key, src, dst, record.timestamp));
        }

        let is_forward = {
            let tracker = self.active.get(&key).expect("just inserted or pre-existing");
            src == tracker.initiator
        };

        let sample = PacketSample {
            timestamp: record.timestamp,
            size: record.size as u32,
            tcp_flags: record.tcp_flags,
            header_len: record.header_len as u32,
            payload_len: record.payload_len as u32,
        };

        let mut close_reason = None;
        {
            let tracker = self.active.get_mut(&key).expect("just inserted or pre-existing");
            tracker.last_ts = record.timestamp;

            if is_forward {
                tracker.fwd_packets.push(sample);
                if tracker.init_fwd_win.is_none() {
                    tracker.init_fwd_win = record.tcp_window;
                }
            } else {
                tracker.bwd_packets.push(sample);
                if tracker.init_bwd_win.is_none() {
                    tracker.init_bwd_win = record.tcp_window;
                }
            }

            if let Some(flags) = record.tcp_flags {
                if flags.rst() {
                    close_reason = Some(CompletionReason::TcpReset);
                } else {
                    if flags.fin() {
                        if is_forward {
                            tracker.fwd_fin = true;
                        } else {
                            tracker.bwd_fin = true;
                        }
                    }
                    if tracker.fwd_fin && tracker.bwd_fin && flags.has(crate::types::TcpFlags::ACK) {
                        close_reason = Some(CompletionReason::TcpFinAck);
                    }
                }
            }

            if close_reason.is_none() {
                let age = tracker.last_ts.duration_since(&tracker.first_ts);
                if age >= self.hard_cap {
                    close_reason = Some(CompletionReason::HardCap);
                }
            }
        }

        close_reason.map(|reason| {
            let tracker = self.active.remove(&key).expect("key present");
            debug!("flow {:?} closed: {:?}", key, reason);
            tracker.into_flow(reason)
        })
    }

    /// Closes every flow that has been idle for at least the configured
    /// timeout, or has exceeded the hard cap, as of `now`.
    pub fn poll_timeouts(&mut self, now: Timestamp) -> Vec<Flow> {
        let idle_timeout = self.idle_timeout;
        let hard_cap = self.hard_cap;
        let expired: Vec<FlowKey> = self
            .active
            .iter()
            .filter(|(_, tracker)| {
                now.duration_since(&tracker.last_ts) >= idle_timeout
                    || now.duration_since(&tracker.first_ts) >= hard_cap
            })
            .map(|(key, _)| *key)
            .collect();

        expired
            .into_iter()
            .filter_map(|key| {
                self.active.remove(&key).map(|tracker| {
                    let reason = if now.duration_since(&tracker.first_ts) >= hard_cap {
                        CompletionReason::HardCap
                    } else {
                        CompletionReason::IdleTimeout
                    };
                    debug!("flow {:?} closed: {:?}", key, reason);
                    tracker.into_flow(reason)
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Protocol, TcpFlags};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration as StdDuration;

    fn endpoint(octet: u8, port: u16) -> Endpoint {
        Endpoint {
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet)),
            port,
        }
    }

    fn record(src: Endpoint, dst: Endpoint, protocol: Protocol, ts: Timestamp, flags: Option<TcpFlags>) -> PacketRecord {
        PacketRecord {
            timestamp: ts,
            src_ip: src.ip,
            dst_ip: dst.ip,
            src_port: src.port,
            dst_port: dst.port,
            protocol,
            size: 100,
            tcp_flags: flags,
            header_len: 20,
            payload_len: 50,
            tcp_window: Some(8192),
        }
    }

    fn tick(base: Timestamp, secs: u64) -> Timestamp {
        Timestamp {
            monotonic: base.monotonic + StdDuration::from_secs(secs),
            wall: base.wall + StdDuration::from_secs(secs),
        }
    }

    #[test]
    fn flow_symmetry_interleaved_both_directions() {
        let mut builder = FlowBuilder::new(120, 3600);
        let a = endpoint(1, 4000);
        let b = endpoint(2, 80);
        let base = Timestamp::now();

        for i in 0..10u64 {
            builder.ingest_one(record(a, b, Protocol::Tcp, tick(base, i), None));
            builder.ingest_one(record(b, a, Protocol::Tcp, tick(base, i), None));
        }

        assert_eq!(builder.active_count(), 1);
        let flows = builder.poll_timeouts(tick(base, 10_000));
        assert_eq!(flows.len(), 1);
        let flow = &flows[0];
        assert_eq!(flow.fwd_packets.len() + flow.bwd_packets.len(), 20);
        assert_eq!(flow.initiator, a);
    }

    #[test]
    fn initiator_is_the_sender_of_the_first_packet_even_when_lexicographically_greater() {
        let mut builder = FlowBuilder::new(120, 3600);
        let client = endpoint(9, 4000); // sorts after `server` by IP
        let server = endpoint(1, 80);
        let base = Timestamp::now();

        builder.ingest_one(record(client, server, Protocol::Tcp, base, None));
        builder.ingest_one(record(server, client, Protocol::Tcp, tick(base, 1), None));

        let flows = builder.poll_timeouts(tick(base, 10_000));
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].initiator, client);
        assert_eq!(flows[0].responder, server);
    }

    #[test]
    fn idle_timeout_closes_exactly_at_threshold() {
        let mut builder = FlowBuilder::new(120, 3600);
        let a = endpoint(1, 4000);
        let b = endpoint(2, 80);
        let base = Timestamp::now();
        builder.ingest(vec![record(a, b, Protocol::Udp, base, None)]);
        assert_eq!(builder.active_count(), 1);

        let flows = builder.poll_timeouts(tick(base, 121));
        assert_eq!(flows.len(), 1);
        assert_eq!(builder.active_count(), 0);
    }

    #[test]
    fn rst_closes_flow_immediately() {
        let mut builder = FlowBuilder::new(120, 3600);
        let a = endpoint(1, 4000);
        let b = endpoint(2, 80);
        let base = Timestamp::now();
        let completed = builder.ingest(vec![
            record(a, b, Protocol::Tcp, base, Some(TcpFlags(TcpFlags::SYN))),
            record(b, a, Protocol::Tcp, tick(base, 1), Some(TcpFlags(TcpFlags::RST))),
        ]);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].completion_reason, CompletionReason::TcpReset);
    }

    #[test]
    fn icmp_uses_zero_ports_and_still_keys_by_ip() {
        let mut builder = FlowBuilder::new(120, 3600);
        let a = endpoint(1, 0);
        let b = endpoint(2, 0);
        let base = Timestamp::now();
        builder.ingest(vec![record(a, b, Protocol::Icmp, base, None)]);
        assert_eq!(builder.active_count(), 1);
    }
}
