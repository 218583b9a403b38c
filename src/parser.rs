use pnet_packet::ethernet::{EtherType, EtherTypes, EthernetPacket};
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::tcp::{TcpFlags, TcpPacket};
use pnet_packet::udp::UdpPacket;
use pnet_packet::vlan::VlanPacket;
use pnet_packet::Packet;
use std::fmt;
use std::net::IpAddr;
use std::time::SystemTime;
use trust_dns_proto::op::{Message, MessageType, OpCode};

use crate::capture::RawFrame;
use crate::error::DecodeError;

/// Shown for an address whose device name is not (yet) known.
pub const UNKNOWN_DEVICE: &str = "Unknown";

const ETHERNET_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const IPV4_MIN_HEADER_LEN: usize = 20;
const TCP_MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Ipv4Tcp,
    Ipv4Udp,
    Ipv4Other,
    NonIp,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProtocolKind::Ipv4Tcp => "TCP",
            ProtocolKind::Ipv4Udp => "UDP",
            ProtocolKind::Ipv4Other => "IPv4",
            ProtocolKind::NonIp => "non-IP",
        };
        f.write_str(label)
    }
}

/// A decoded, enriched view of one frame. Built once by the decoder (and
/// named by the processing stage) and never changed afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketRecord {
    pub kind: ProtocolKind,
    pub timestamp: SystemTime,
    /// Frame length on the wire.
    pub length: u32,
    pub ether_type: u16,
    pub source_ip: Option<IpAddr>,
    pub dest_ip: Option<IpAddr>,
    /// IPv4 protocol number, for any IPv4 frame.
    pub ip_protocol: Option<u8>,
    pub source_port: Option<u16>,
    pub dest_port: Option<u16>,
    pub tcp_flags: Option<u16>,
    pub dns_query: Option<String>,
    pub source_name: Option<String>,
    pub dest_name: Option<String>,
}

impl PacketRecord {
    fn non_ip(frame: &RawFrame, ether_type: u16) -> Self {
        PacketRecord {
            kind: ProtocolKind::NonIp,
            timestamp: frame.timestamp(),
            length: frame.wire_len(),
            ether_type,
            source_ip: None,
            dest_ip: None,
            ip_protocol: None,
            source_port: None,
            dest_port: None,
            tcp_flags: None,
            dns_query: None,
            source_name: None,
            dest_name: None,
        }
    }

    /// Attaches resolved device names, consuming the decoder's record.
    pub fn with_names(self, source_name: Option<String>, dest_name: Option<String>) -> Self {
        PacketRecord {
            source_name,
            dest_name,
            ..self
        }
    }

    pub fn source_device(&self) -> &str {
        self.source_name.as_deref().unwrap_or(UNKNOWN_DEVICE)
    }

    pub fn dest_device(&self) -> &str {
        self.dest_name.as_deref().unwrap_or(UNKNOWN_DEVICE)
    }

    /// Application protocol guessed from well-known ports, lower port first.
    pub fn service(&self) -> Option<&'static str> {
        let mut ports = [self.source_port?, self.dest_port?];
        ports.sort_unstable();
        ports.into_iter().find_map(|port| well_known_service(self.kind, port))
    }

    pub fn flag_names(&self) -> Vec<&'static str> {
        let Some(flags) = self.tcp_flags else {
            return Vec::new();
        };
        [
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::URG, "URG"),
        ]
        .into_iter()
        .filter(|(bit, _)| flags & (*bit as u16) != 0)
        .map(|(_, name)| name)
        .collect()
    }
}

impl fmt::Display for PacketRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (Some(src), Some(dst)) = (self.source_ip, self.dest_ip) else {
            return write!(f, "{} frame (ethertype 0x{:04x}) {} bytes", self.kind, self.ether_type, self.length);
        };
        write!(f, "{}", self.kind)?;
        if let Some(service) = self.service() {
            write!(f, "/{}", service)?;
        }
        write!(f, " {} ({}", self.source_device(), src)?;
        if let Some(port) = self.source_port {
            write!(f, ":{}", port)?;
        }
        write!(f, ") -> {} ({}", self.dest_device(), dst)?;
        if let Some(port) = self.dest_port {
            write!(f, ":{}", port)?;
        }
        write!(f, ") {} bytes", self.length)?;
        let flags = self.flag_names();
        if !flags.is_empty() {
            write!(f, " [{}]", flags.join(","))?;
        }
        if let Some(query) = &self.dns_query {
            write!(f, " query {}", query)?;
        }
        Ok(())
    }
}

fn well_known_service(kind: ProtocolKind, port: u16) -> Option<&'static str> {
    let service = match (kind, port) {
        (_, 53) => "DNS",
        (ProtocolKind::Ipv4Tcp, 20 | 21) => "FTP",
        (ProtocolKind::Ipv4Tcp, 22) => "SSH",
        (ProtocolKind::Ipv4Tcp, 23) => "TELNET",
        (ProtocolKind::Ipv4Tcp, 25) => "SMTP",
        (ProtocolKind::Ipv4Tcp, 80 | 8080) => "HTTP",
        (ProtocolKind::Ipv4Tcp, 443) => "HTTPS",
        (ProtocolKind::Ipv4Udp, 67 | 68) => "DHCP",
        (ProtocolKind::Ipv4Udp, 123) => "NTP",
        (ProtocolKind::Ipv4Udp, 443) => "QUIC",
        _ => return None,
    };
    Some(service)
}

/// Decodes an Ethernet frame. Frames that are not IPv4 come back as
/// `NonIp` records; frames whose headers are cut short or inconsistent are
/// reported as errors. Never panics, whatever the input.
pub fn decode(frame: &RawFrame) -> Result<PacketRecord, DecodeError> {
    let data = frame.data();
    let ethernet = EthernetPacket::new(data).ok_or(DecodeError::Truncated {
        layer: "ethernet",
        needed: ETHERNET_HEADER_LEN,
        available: data.len(),
    })?;

    let (ether_type, l3) = match ethernet.get_ethertype() {
        EtherTypes::Vlan => {
            let payload = ethernet.payload();
            let vlan = VlanPacket::new(payload).ok_or(DecodeError::Truncated {
                layer: "802.1Q",
                needed: VLAN_TAG_LEN,
                available: payload.len(),
            })?;
            (vlan.get_ethertype(), &payload[VLAN_TAG_LEN..])
        }
        other => (other, ethernet.payload()),
    };

    if ether_type != EtherTypes::Ipv4 {
        return Ok(PacketRecord::non_ip(frame, ether_type.0));
    }
    decode_ipv4(frame, ether_type, l3)
}

fn decode_ipv4(frame: &RawFrame, ether_type: EtherType, bytes: &[u8]) -> Result<PacketRecord, DecodeError> {
    let ipv4 = Ipv4Packet::new(bytes).ok_or(DecodeError::Truncated {
        layer: "ipv4",
        needed: IPV4_MIN_HEADER_LEN,
        available: bytes.len(),
    })?;
    if ipv4.get_version() != 4 {
        return Err(DecodeError::IpVersion(ipv4.get_version()));
    }
    let header_len = ipv4.get_header_length() as usize * 4;
    if header_len < IPV4_MIN_HEADER_LEN {
        return Err(DecodeError::HeaderLength {
            layer: "ipv4",
            declared: header_len,
        });
    }
    if header_len > bytes.len() {
        return Err(DecodeError::Truncated {
            layer: "ipv4",
            needed: header_len,
            available: bytes.len(),
        });
    }

    let protocol = ipv4.get_next_level_protocol();
    let mut record = PacketRecord {
        kind: ProtocolKind::Ipv4Other,
        source_ip: Some(IpAddr::V4(ipv4.get_source())),
        dest_ip: Some(IpAddr::V4(ipv4.get_destination())),
        ip_protocol: Some(protocol.0),
        ..PacketRecord::non_ip(frame, ether_type.0)
    };

    // Only the first fragment carries the transport header.
    if ipv4.get_fragment_offset() != 0 {
        return Ok(record);
    }
    let transport = &bytes[header_len..];
    decode_transport(&mut record, protocol, transport)?;
    Ok(record)
}

fn decode_transport(
    record: &mut PacketRecord,
    protocol: IpNextHeaderProtocol,
    bytes: &[u8],
) -> Result<(), DecodeError> {
    match protocol {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(bytes).ok_or(DecodeError::Truncated {
                layer: "tcp",
                needed: TCP_MIN_HEADER_LEN,
                available: bytes.len(),
            })?;
            let header_len = tcp.get_data_offset() as usize * 4;
            if header_len < TCP_MIN_HEADER_LEN {
                return Err(DecodeError::HeaderLength {
                    layer: "tcp",
                    declared: header_len,
                });
            }
            if header_len > bytes.len() {
                return Err(DecodeError::Truncated {
                    layer: "tcp",
                    needed: header_len,
                    available: bytes.len(),
                });
            }
            record.kind = ProtocolKind::Ipv4Tcp;
            record.source_port = Some(tcp.get_source());
            record.dest_port = Some(tcp.get_destination());
            record.tcp_flags = Some(u16::from(tcp.get_flags()));
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(bytes).ok_or(DecodeError::Truncated {
                layer: "udp",
                needed: UDP_HEADER_LEN,
                available: bytes.len(),
            })?;
            record.kind = ProtocolKind::Ipv4Udp;
            record.source_port = Some(udp.get_source());
            record.dest_port = Some(udp.get_destination());
            if udp.get_destination() == 53 {
                record.dns_query = dns_query_name(&bytes[UDP_HEADER_LEN..]);
            }
        }
        // ICMP, GRE, ... carry no ports.
        _ => {}
    }
    Ok(())
}

fn dns_query_name(payload: &[u8]) -> Option<String> {
    let message = Message::from_vec(payload).ok()?;
    if message.message_type() != MessageType::Query || message.op_code() != OpCode::Query {
        return None;
    }
    let query = message.queries().first()?;
    Some(query.name().to_string().trim_end_matches('.').to_string())
}
