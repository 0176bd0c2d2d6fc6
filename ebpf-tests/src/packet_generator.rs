//! Raw frame construction for classifier tests.
//!
//! Builds complete Ethernet II frames byte by byte so the tests exercise the
//! same parsing path the XDP program sees, including deliberately truncated
//! and malformed variants.

use std::net::Ipv4Addr;

use obsidianprotection_ebpf::{
    IPPROTO_TCP, IPPROTO_UDP, RAKNET_MAGIC, RAKNET_UNCONNECTED_PING,
};

pub const TCP_SYN: u8 = 0x02;
pub const TCP_ACK: u8 = 0x10;
pub const TCP_PSH: u8 = 0x08;

/// Encode a Minecraft VarInt.
pub fn encode_varint(value: u32) -> Vec<u8> {
    let mut out = Vec::new();
    let mut val = value;
    loop {
        let mut byte = (val & 0x7f) as u8;
        val >>= 7;
        if val != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if val == 0 {
            break;
        }
    }
    out
}

/// A well-formed Java handshake payload: VarInt length, packet id 0x00,
/// VarInt protocol version, hostname string, port, next state.
pub fn java_handshake(protocol_version: u32, hostname: &str, port: u16, next_state: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(0x00);
    body.extend(encode_varint(protocol_version));
    body.extend(encode_varint(hostname.len() as u32));
    body.extend_from_slice(hostname.as_bytes());
    body.extend_from_slice(&port.to_be_bytes());
    body.extend(encode_varint(next_state));

    let mut payload = encode_varint(body.len() as u32);
    payload.extend(body);
    payload
}

/// Minimal handshake-shaped payload with an explicit declared length.
pub fn java_handshake_raw(declared_len: u32, packet_id: u8, protocol_version: u32) -> Vec<u8> {
    let mut payload = encode_varint(declared_len);
    payload.push(packet_id);
    payload.extend(encode_varint(protocol_version));
    // Pad out to the declared length so the shape is self-consistent.
    while payload.len() < declared_len as usize + 1 {
        payload.push(0xaa);
    }
    payload
}

/// RakNet unconnected ping: id, 8-byte time, 16-byte magic, 8-byte GUID.
pub fn raknet_ping(time: u64, guid: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(33);
    payload.push(RAKNET_UNCONNECTED_PING);
    payload.extend_from_slice(&time.to_be_bytes());
    payload.extend_from_slice(&RAKNET_MAGIC);
    payload.extend_from_slice(&guid.to_be_bytes());
    payload
}

/// RakNet datagram with an arbitrary first byte and trailing bytes.
pub fn raknet_raw(id: u8, trailer: &[u8]) -> Vec<u8> {
    let mut payload = vec![id];
    payload.extend_from_slice(trailer);
    payload
}

fn ip_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in header.chunks(2) {
        let word = ((chunk[0] as u32) << 8) | (*chunk.get(1).unwrap_or(&0) as u32);
        sum += word;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !sum as u16
}

fn ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload_len: usize) -> Vec<u8> {
    let total_len = 20 + payload_len;
    let mut header = Vec::with_capacity(20);
    header.push(0x45);
    header.push(0);
    header.extend_from_slice(&(total_len as u16).to_be_bytes());
    header.extend_from_slice(&[0, 0, 0, 0]); // id + flags/frag
    header.push(64); // ttl
    header.push(protocol);
    header.extend_from_slice(&[0, 0]); // checksum placeholder
    header.extend_from_slice(&src.octets());
    header.extend_from_slice(&dst.octets());

    let checksum = ip_checksum(&header);
    header[10] = (checksum >> 8) as u8;
    header[11] = (checksum & 0xff) as u8;
    header
}

fn eth_header(ether_type: u16) -> Vec<u8> {
    let mut header = Vec::with_capacity(14);
    header.extend_from_slice(&[0xff; 6]);
    header.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
    header.extend_from_slice(&ether_type.to_be_bytes());
    header
}

/// Complete TCP frame carrying `payload`.
pub fn tcp_frame(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut tcp = Vec::with_capacity(20 + payload.len());
    tcp.extend_from_slice(&src_port.to_be_bytes());
    tcp.extend_from_slice(&dst_port.to_be_bytes());
    tcp.extend_from_slice(&1000u32.to_be_bytes()); // seq
    tcp.extend_from_slice(&0u32.to_be_bytes()); // ack
    tcp.extend_from_slice(&(((5u16) << 12) | flags as u16).to_be_bytes());
    tcp.extend_from_slice(&0xffffu16.to_be_bytes()); // window
    tcp.extend_from_slice(&[0, 0, 0, 0]); // checksum + urgent
    tcp.extend_from_slice(payload);

    let mut frame = eth_header(obsidianprotection_ebpf::ETH_P_IP);
    frame.extend(ipv4_header(src, dst, IPPROTO_TCP, tcp.len()));
    frame.extend(tcp);
    frame
}

/// Complete UDP frame carrying `payload`.
pub fn udp_frame(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut udp = Vec::with_capacity(8 + payload.len());
    udp.extend_from_slice(&src_port.to_be_bytes());
    udp.extend_from_slice(&dst_port.to_be_bytes());
    udp.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(payload);

    let mut frame = eth_header(obsidianprotection_ebpf::ETH_P_IP);
    frame.extend(ipv4_header(src, dst, IPPROTO_UDP, udp.len()));
    frame.extend(udp);
    frame
}

/// Non-IPv4 frame (ARP ethertype).
pub fn arp_frame() -> Vec<u8> {
    let mut frame = eth_header(0x0806);
    frame.extend_from_slice(&[0u8; 28]);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use obsidianprotection_ebpf::read_varint;

    #[test]
    fn varint_round_trip() {
        for value in [0u32, 1, 127, 128, 255, 765, 25565, 2_097_151] {
            let encoded = encode_varint(value);
            let (decoded, len) = read_varint(&encoded, 0).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(len, encoded.len());
        }
    }

    #[test]
    fn varint_rejects_overlong() {
        assert!(read_varint(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01], 0).is_none());
        assert!(read_varint(&[0x80, 0x80], 0).is_none());
    }

    #[test]
    fn handshake_has_expected_shape() {
        let payload = java_handshake(765, "play.example.net", 25565, 2);
        let (declared, len_bytes) = read_varint(&payload, 0).unwrap();
        assert_eq!(payload.len(), len_bytes + declared as usize);
        assert_eq!(payload[len_bytes], 0x00);
    }

    #[test]
    fn raknet_ping_layout() {
        let payload = raknet_ping(0, 0xdead_beef);
        assert_eq!(payload.len(), 33);
        assert_eq!(payload[0], RAKNET_UNCONNECTED_PING);
        assert_eq!(&payload[9..25], &RAKNET_MAGIC);
    }

    #[test]
    fn tcp_frame_minimum_size() {
        let frame = tcp_frame(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            40000,
            25565,
            TCP_SYN,
            &[],
        );
        assert_eq!(frame.len(), 14 + 20 + 20);
    }
}
