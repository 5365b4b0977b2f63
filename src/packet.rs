//! Frame encoding for the stream template and ARP announcements.
//!
//! The device treats both as opaque byte blobs; this module only has to get
//! the header fields right for the router to accept them.

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::topology::{FlowSpec, MacAddr};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

const ETH_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const ARP_PAYLOAD_LEN: usize = 28;
const IP_PROTO_UDP: u8 = 17;
const DEFAULT_TTL: u8 = 64;
const PAD_BYTE: u8 = b'x';

/// Packet template for the flow under test: Ether / IPv4 / UDP / padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketTemplate {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub flow: FlowSpec,
}

impl PacketTemplate {
    pub fn new(src_mac: MacAddr, dst_mac: MacAddr, flow: FlowSpec) -> Self {
        Self {
            src_mac,
            dst_mac,
            flow,
        }
    }

    /// On-wire frame length without FCS.
    pub fn frame_len(&self) -> usize {
        ETH_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN + self.flow.payload_size
    }

    pub fn encode(&self) -> Bytes {
        let flow = &self.flow;
        let udp_len = UDP_HEADER_LEN + flow.payload_size;
        let ip_len = IPV4_HEADER_LEN + udp_len;

        let mut buf = BytesMut::with_capacity(self.frame_len());
        put_ethernet(&mut buf, self.dst_mac, self.src_mac, ETHERTYPE_IPV4);

        let mut ip = [0u8; IPV4_HEADER_LEN];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&(ip_len as u16).to_be_bytes());
        ip[8] = DEFAULT_TTL;
        ip[9] = IP_PROTO_UDP;
        ip[12..16].copy_from_slice(&flow.source_ip.octets());
        ip[16..20].copy_from_slice(&flow.destination_ip.octets());
        let csum = ipv4_checksum(&ip);
        ip[10..12].copy_from_slice(&csum.to_be_bytes());
        buf.put_slice(&ip);

        buf.put_u16(flow.udp_source_port);
        buf.put_u16(flow.udp_destination_port);
        buf.put_u16(udp_len as u16);
        // Zero UDP checksum is legal over IPv4 and lets the device rewrite
        // payload bytes without recomputing it.
        buf.put_u16(0);
        buf.put_bytes(PAD_BYTE, flow.payload_size);

        buf.freeze()
    }
}

/// Broadcast ARP reply asserting `ip is-at mac` (gratuitous ARP).
pub fn gratuitous_arp(mac: MacAddr, ip: Ipv4Addr) -> Bytes {
    let mut buf = BytesMut::with_capacity(ETH_HEADER_LEN + ARP_PAYLOAD_LEN);
    put_ethernet(&mut buf, MacAddr::BROADCAST, mac, ETHERTYPE_ARP);

    buf.put_u16(1); // Ethernet
    buf.put_u16(ETHERTYPE_IPV4);
    buf.put_u8(6);
    buf.put_u8(4);
    buf.put_u16(2); // reply
    buf.put_slice(&mac.octets());
    buf.put_slice(&ip.octets());
    buf.put_slice(&mac.octets());
    buf.put_slice(&ip.octets());

    buf.freeze()
}

/// Sender protocol/hardware address of an ARP frame, if `frame` is one.
pub fn parse_arp_sender(frame: &[u8]) -> Option<(MacAddr, Ipv4Addr)> {
    if frame.len() < ETH_HEADER_LEN + ARP_PAYLOAD_LEN {
        return None;
    }
    if u16::from_be_bytes([frame[12], frame[13]]) != ETHERTYPE_ARP {
        return None;
    }
    let arp = &frame[ETH_HEADER_LEN..];
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&arp[8..14]);
    let ip = Ipv4Addr::new(arp[14], arp[15], arp[16], arp[17]);
    Some((MacAddr(mac), ip))
}

fn put_ethernet(buf: &mut BytesMut, dst: MacAddr, src: MacAddr, ethertype: u16) {
    buf.put_slice(&dst.octets());
    buf.put_slice(&src.octets());
    buf.put_u16(ethertype);
}

/// RFC 1071 one's-complement header checksum.
fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|w| u32::from(u16::from_be_bytes([w[0], *w.get(1).unwrap_or(&0)])))
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
