//! Sniffer: acquires raw IP packets from one interface and normalises them
//! into `PacketRecord`s on the bounded buffer.

pub mod buffer;
mod raw_l3;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use pnet::datalink::{self, Channel::Ethernet, NetworkInterface};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;

use crate::error::{NdsError, Result};
use crate::metrics::Metrics;
use crate::types::{CaptureMode, CaptureStatus, PacketRecord, Protocol, TcpFlags, Timestamp};

use buffer::PacketBuffer;
use raw_l3::RawL3Socket;

const RUNTIME_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub struct Sniffer {
    buffer: Arc<PacketBuffer>,
    metrics: Arc<Metrics>,
    interface: Mutex<String>,
    running: Arc<AtomicBool>,
    mode: Arc<Mutex<Option<CaptureMode>>>,
    last_error: Arc<Mutex<Option<String>>>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Sniffer {
    pub fn new(interface: String, buffer: Arc<PacketBuffer>, metrics: Arc<Metrics>) -> Self {
        Self {
            buffer,
            metrics,
            interface: Mutex::new(interface),
            running: Arc::new(AtomicBool::new(false)),
            mode: Arc::new(Mutex::new(None)),
            last_error: Arc::new(Mutex::new(None)),
            handle: Mutex::new(None),
        }
    }

    pub fn list_interfaces() -> Vec<String> {
        datalink::interfaces().into_iter().map(|i| i.name).collect()
    }

    /// Rejected while running, per contract.
    pub fn set_interface(&self, name_or_auto: String) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(NdsError::Capture(
                "cannot change interface while capture is running".into(),
            ));
        }
        *self.interface.lock() = name_or_auto;
        Ok(())
    }

    pub fn status(&self) -> CaptureStatus {
        CaptureStatus {
            running: self.running.load(Ordering::SeqCst),
            packets_captured: self.metrics.packets_captured.load(Ordering::Relaxed),
            buffer_fill: self.buffer.len(),
            buffer_capacity: self.buffer.capacity(),
            last_error: self.last_error.lock().clone(),
            interface: self.interface.lock().clone(),
            mode: *self.mode.lock(),
        }
    }

    /// Resolves interfaces selection; "auto" picks the first interface with
    /// an assigned IP that isn't loopback.
    fn resolve_interface(&self) -> Result<NetworkInterface> {
        let wanted = self.interface.lock().clone();
        let interfaces = datalink::interfaces();
        if wanted == "auto" {
            interfaces
                .into_iter()
                .find(|i| !i.is_loopback() && !i.ips.is_empty())
                .ok_or_else(|| NdsError::Capture("no usable interface found for auto selection".into()))
        } else {
            interfaces
                .into_iter()
                .find(|i| i.name == wanted)
                .ok_or_else(|| NdsError::Capture(format!("interface '{}' not found", wanted)))
        }
    }

    /// Opens the capture channel, trying BPF-filtered L2, then unfiltered
    /// L2, then an L3 raw socket. Only setup/permission failures advance to
    /// the next mode; this is evaluated once at `start()`.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(()); // already running; start() is not required to be idempotent beyond this
        }

        let interface = self.resolve_interface().map_err(|e| {
            self.running.store(false, Ordering::SeqCst);
            e
        })?;

        // (a) promiscuous L2 datalink channel — the closest pnet's public API
        // gets to "BPF filter applied": promiscuous mode plus the kernel's
        // own AF_PACKET filtering, rather than a hand-compiled BPF program.
        let mut promisc_config = datalink::Config::default();
        promisc_config.promiscuous = true;
        let l2_promisc = datalink::channel(&interface, promisc_config);

        let (mode, l2_rx) = match l2_promisc {
            Ok(Ethernet(_, rx)) => (CaptureMode::L2Bpf, Some(rx)),
            Err(e) => {
                warn!(
                    "promiscuous L2 capture unavailable on {} ({}), retrying without promiscuous mode",
                    interface.name, e
                );
                // (b) plain L2 datalink channel, no promiscuous mode.
                match datalink::channel(&interface, datalink::Config::default()) {
                    Ok(Ethernet(_, rx)) => (CaptureMode::L2Raw, Some(rx)),
                    Err(e) => {
                        warn!("L2 capture unavailable on {} ({}), falling back to raw socket", interface.name, e);
                        (CaptureMode::L3Raw, None)
                    }
                    Ok(_) => {
                        warn!("unsupported datalink channel type on {}, falling back to raw socket", interface.name);
                        (CaptureMode::L3Raw, None)
                    }
                }
            }
            Ok(_) => {
                warn!("unsupported datalink channel type on {}, falling back to raw socket", interface.name);
                (CaptureMode::L3Raw, None)
            }
        };

        let l3_socket = if l2_rx.is_none() {
            match RawL3Socket::open() {
                Ok(s) => {
                    *self.mode.lock() = Some(CaptureMode::L3Raw);
                    Some(s)
                }
                Err(e) => {
                    self.running.store(false, Ordering::SeqCst);
                    let msg = format!("all capture backends failed: {}", e);
                    *self.last_error.lock() = Some(msg.clone());
                    return Err(NdsError::Capture(msg));
                }
            }
        } else {
            *self.mode.lock() = Some(mode);
            None
        };

        self.metrics.capture_healthy.store(true, Ordering::Relaxed);
        info!("capture started on {} using {:?}", interface.name, self.mode.lock());

        let buffer = self.buffer.clone();
        let metrics = self.metrics.clone();
        let running = self.running.clone();
        let last_error = self.last_error.clone();

        let join = std::thread::Builder::new()
            .name("nds-sniffer".into())
            .spawn(move || {
                if let Some(mut rx) = l2_rx {
                    run_l2_loop(&mut *rx, &running, &buffer, &metrics, &last_error);
                } else if let Some(socket) = l3_socket {
                    run_l3_loop(&socket, &running, &buffer, &metrics, &last_error);
                }
                metrics.capture_healthy.store(false, Ordering::Relaxed);
            })
            .map_err(NdsError::from)?;

        *self.handle.lock() = Some(join);
        Ok(())
    }

    /// Idempotent: calling `stop()` when not running is a no-op.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        info!("capture stopped");
    }
}

fn run_l2_loop(
    rx: &mut dyn datalink::DataLinkReceiver,
    running: &AtomicBool,
    buffer: &PacketBuffer,
    metrics: &Metrics,
    last_error: &Mutex<Option<String>>,
) {
    while running.load(Ordering::SeqCst) {
        match rx.next() {
            Ok(frame) => {
                if let Some(record) = parse_ip_frame(frame) {
                    metrics.packets_captured.fetch_add(1, Ordering::Relaxed);
                    buffer.push(record);
                }
            }
            Err(e) => {
                metrics.capture_errors.fetch_add(1, Ordering::Relaxed);
                *last_error.lock() = Some(e.to_string());
                debug!("capture read error: {}", e);
                std::thread::sleep(RUNTIME_ERROR_BACKOFF);
            }
        }
    }
}

fn run_l3_loop(
    socket: &RawL3Socket,
    running: &AtomicBool,
    buffer: &PacketBuffer,
    metrics: &Metrics,
    last_error: &Mutex<Option<String>>,
) {
    while running.load(Ordering::SeqCst) {
        match socket.read_one() {
            Ok(Some(record)) => {
                metrics.packets_captured.fetch_add(1, Ordering::Relaxed);
                buffer.push(record);
            }
            Ok(None) => continue,
            Err(e) => {
                metrics.capture_errors.fetch_add(1, Ordering::Relaxed);
                *last_error.lock() = Some(e.to_string());
                error!("raw socket read error: {}", e);
                std::thread::sleep(RUNTIME_ERROR_BACKOFF);
            }
        }
    }
}

/// Parses an Ethernet frame's IP payload into a `PacketRecord`. Non-IP
/// frames and malformed packets are dropped silently, matching the
/// Sniffer's contract.
fn parse_ip_frame(frame: &[u8]) -> Option<PacketRecord> {
    if let Some(ipv4) = Ipv4Packet::new(frame) {
        return parse_ipv4(&ipv4);
    }
    if let Some(ipv6) = Ipv6Packet::new(frame) {
        return parse_ipv6(&ipv6);
    }
    None
}

fn parse_ipv4(ipv4: &Ipv4Packet) -> Option<PacketRecord> {
    let src_ip = IpAddr::V4(ipv4.get_source());
    let dst_ip = IpAddr::V4(ipv4.get_destination());
    let protocol = Protocol::from_number(ipv4.get_next_level_protocol().0);
    let size = ipv4.get_total_length() as usize;
    let (src_port, dst_port, tcp_flags, tcp_window, header_len, payload_len) =
        parse_transport(protocol, ipv4.payload());

    Some(PacketRecord {
        timestamp: Timestamp::now(),
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol,
        size,
        tcp_flags,
        header_len: (ipv4.get_header_length() as usize) * 4 + header_len,
        payload_len,
        tcp_window,
    })
}

fn parse_ipv6(ipv6: &Ipv6Packet) -> Option<PacketRecord> {
    let src_ip = IpAddr::V6(ipv6.get_source());
    let dst_ip = IpAddr::V6(ipv6.get_destination());
    let protocol = Protocol::from_number(ipv6.get_next_header().0);
    let size = ipv6.payload().len() + 40;
    let (src_port, dst_port, tcp_flags, tcp_window, header_len, payload_len) =
        parse_transport(protocol, ipv6.payload());

    Some(PacketRecord {
        timestamp: Timestamp::now(),
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol,
        size,
        tcp_flags,
        header_len: 40 + header_len,
        payload_len,
        tcp_window,
    })
}

fn parse_transport(protocol: Protocol, payload: &[u8]) -> (u16, u16, Option<TcpFlags>, Option<u16>, usize, usize) {
    match protocol {
        Protocol::Tcp => {
            if let Some(tcp) = TcpPacket::new(payload) {
                let header_len = (tcp.get_data_offset() as usize) * 4;
                (
                    tcp.get_source(),
                    tcp.get_destination(),
                    Some(TcpFlags(tcp.get_flags())),
                    Some(tcp.get_window()),
                    header_len,
                    tcp.payload().len(),
                )
            } else {
                (0, 0, None, None, 0, payload.len())
            }
        }
        Protocol::Udp => {
            if let Some(udp) = UdpPacket::new(payload) {
                (udp.get_source(), udp.get_destination(), None, None, 8, udp.payload().len())
            } else {
                (0, 0, None, None, 0, payload.len())
            }
        }
        Protocol::Icmp => (0, 0, None, None, 0, payload.len()),
        Protocol::Other(_) => (0, 0, None, None, 0, payload.len()),
    }
}
