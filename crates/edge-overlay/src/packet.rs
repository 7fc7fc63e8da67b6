//! Packet inspection for routing.

use std::net::Ipv4Addr;

/// Minimum IPv4 header length.
pub const IPV4_HEADER_LEN: usize = 20;

/// Destination address of an IPv4 datagram (header bytes 16..20).
///
/// Returns `None` when the buffer is too short to hold a header. No other
/// validation is done; the router only needs the destination field.
pub fn extract_dest_ip(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < IPV4_HEADER_LEN {
        return None;
    }
    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}

/// Build a minimal IPv4 packet addressed to `dst`, for tests and probes.
pub fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total_len = (IPV4_HEADER_LEN + payload.len()) as u16;
    let mut packet = Vec::with_capacity(total_len as usize);
    packet.push(0x45); // version 4, IHL 5
    packet.push(0);
    packet.extend_from_slice(&total_len.to_be_bytes());
    packet.extend_from_slice(&[0, 0, 0, 0]); // id, flags, fragment offset
    packet.push(64); // TTL
    packet.push(17); // UDP
    packet.extend_from_slice(&[0, 0]); // checksum (unchecked)
    packet.extend_from_slice(&src.octets());
    packet.extend_from_slice(&dst.octets());
    packet.extend_from_slice(payload);
    packet
}
