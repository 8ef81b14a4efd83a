//! Capture-backend mode (c): an L3 raw IP socket, used only when both L2
//! datalink modes fail to open (permission or setup failure, not a runtime
//! read error).

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::types::{PacketRecord, Protocol as NdsProtocol, TcpFlags, Timestamp};

const MAX_DATAGRAM_LEN: usize = 65536;

pub struct RawL3Socket {
    socket: Socket,
}

impl RawL3Socket {
    /// Opens a raw IPv4 socket bound to all interfaces. Requires elevated
    /// privileges; a permission failure here is a setup failure and should
    /// be treated as exhausting the fallback chain, not retried.
    pub fn open() -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(0)))?;
        socket.set_nonblocking(true)?;
        socket.set_read_timeout(Some(Duration::from_millis(200)))?;
        let addr = std::net::SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        socket.bind(&addr.into())?;
        Ok(Self { socket })
    }

    /// Reads one datagram and parses it into a packet record. Returns
    /// `Ok(None)` on a would-block/timeout (no data available, not an
    /// error); non-IPv4 or truncated frames are dropped silently, matching
    /// the Sniffer's contract for non-IP traffic.
    pub fn read_one(&self) -> io::Result<Option<PacketRecord>> {
        let mut buf = [std::mem::MaybeUninit::new(0u8); MAX_DATAGRAM_LEN];
        match self.socket.recv(&mut buf) {
            Ok(n) => {
                let bytes: Vec<u8> = buf[..n].iter().map(|b| unsafe { b.assume_init() }).collect();
                Ok(parse_ipv4_datagram(&bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Parses a raw IPv4 datagram (as handed back by an `SOCK_RAW` socket,
/// i.e. with no Ethernet framing) into a `PacketRecord`.
fn parse_ipv4_datagram(data: &[u8]) -> Option<PacketRecord> {
    if data.len() < 20 {
        return None;
    }
    let version = (data[0] >> 4) & 0x0F;
    if version != 4 {
        return None;
    }
    let header_len = ((data[0] & 0x0F) as usize) * 4;
    if data.len() < header_len {
        return None;
    }
    let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let protocol_num = data[9];
    let src_ip = IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15]));
    let dst_ip = IpAddr::V4(Ipv4Addr::new(data[16], data[17], data[18], data[19]));
    let payload = &data[header_len..];

    let protocol = NdsProtocol::from_number(protocol_num);
    let (src_port, dst_port, tcp_flags, tcp_window, transport_header_len, payload_len) = match protocol {
        NdsProtocol::Tcp if payload.len() >= 20 => {
            let src_port = u16::from_be_bytes([payload[0], payload[1]]);
            let dst_port = u16::from_be_bytes([payload[2], payload[3]]);
            let data_offset = ((payload[12] >> 4) as usize) * 4;
            let flags = TcpFlags(payload[13]);
            let window = u16::from_be_bytes([payload[14], payload[15]]);
            let payload_len = payload.len().saturating_sub(data_offset);
            (src_port, dst_port, Some(flags), Some(window), data_offset, payload_len)
        }
        NdsProtocol::Udp if payload.len() >= 8 => {
            let src_port = u16::from_be_bytes([payload[0], payload[1]]);
            let dst_port = u16::from_be_bytes([payload[2], payload[3]]);
            (src_port, dst_port, None, None, 8, payload.len().saturating_sub(8))
        }
        NdsProtocol::Icmp => (0, 0, None, None, 0, payload.len()),
        _ => (0, 0, None, None, 0, payload.len()),
    };

    Some(PacketRecord {
        timestamp: Timestamp::now(),
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol,
        size: total_len.max(data.len()),
        tcp_flags,
        header_len: header_len + transport_header_len,
        payload_len,
        tcp_window,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_header(protocol: u8, total_len: u16) -> Vec<u8> {
        let mut h = vec![0u8; 20];
        h[0] = 0x45;
        h[2..4].copy_from_slice(&total_len.to_be_bytes());
        h[9] = protocol;
        h[12..16].copy_from_slice(&[10, 0, 0, 1]);
        h[16..20].copy_from_slice(&[10, 0, 0, 2]);
        h
    }

    #[test]
    fn parses_tcp_datagram() {
        let mut datagram = ipv4_header(6, 40);
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&1234u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&80u16.to_be_bytes());
        tcp[12] = 5 << 4;
        tcp[13] = TcpFlags::SYN;
        datagram.extend_from_slice(&tcp);

        let record = parse_ipv4_datagram(&datagram).unwrap();
        assert_eq!(record.src_port, 1234);
        assert_eq!(record.dst_port, 80);
        assert!(record.tcp_flags.unwrap().syn());
    }

    #[test]
    fn rejects_non_ipv4() {
        let mut bad = ipv4_header(6, 40);
        bad[0] = 0x60; // version 6
        assert!(parse_ipv4_datagram(&bad).is_none());
    }

    #[test]
    fn parses_icmp_with_zero_ports() {
        let mut datagram = ipv4_header(1, 28);
        datagram.extend_from_slice(&[8, 0, 0, 0, 0, 0, 0, 0]);
        let record = parse_ipv4_datagram(&datagram).unwrap();
        assert_eq!(record.src_port, 0);
        assert_eq!(record.dst_port, 0);
    }
}
