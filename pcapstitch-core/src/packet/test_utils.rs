//! Frame builders for tests.
//!
//! Builds Ethernet/IPv4/TCP frames byte by byte so reassembly and TLS tests
//! can feed the engine exactly the packets they describe.

use super::{TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_SYN};

/// Builder for constructing Ethernet frames.
#[derive(Debug, Clone)]
pub struct EthernetBuilder {
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    ethertype: u16,
    payload: Vec<u8>,
}

impl Default for EthernetBuilder {
    fn default() -> Self {
        Self {
            src_mac: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
            dst_mac: [0x02, 0x00, 0x00, 0x00, 0x00, 0x02],
            ethertype: 0x0800,
            payload: Vec::new(),
        }
    }
}

impl EthernetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ethertype(mut self, ethertype: u16) -> Self {
        self.ethertype = ethertype;
        self
    }

    pub fn ipv4(self) -> Self {
        self.ethertype(0x0800)
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(14 + self.payload.len());
        frame.extend_from_slice(&self.dst_mac);
        frame.extend_from_slice(&self.src_mac);
        frame.extend_from_slice(&self.ethertype.to_be_bytes());
        frame.extend_from_slice(&self.payload);
        frame
    }
}

/// Builder for constructing IPv4 packets.
#[derive(Debug, Clone)]
pub struct Ipv4Builder {
    ttl: u8,
    protocol: u8,
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    payload: Vec<u8>,
}

impl Default for Ipv4Builder {
    fn default() -> Self {
        Self {
            ttl: 64,
            protocol: 6,
            src_ip: [10, 0, 0, 1],
            dst_ip: [10, 0, 0, 2],
            payload: Vec::new(),
        }
    }
}

impl Ipv4Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn tcp(self) -> Self {
        self.protocol(6)
    }

    pub fn udp(self) -> Self {
        self.protocol(17)
    }

    pub fn src_ip(mut self, ip: [u8; 4]) -> Self {
        self.src_ip = ip;
        self
    }

    pub fn dst_ip(mut self, ip: [u8; 4]) -> Self {
        self.dst_ip = ip;
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let total_length = (20 + self.payload.len()) as u16;
        let mut packet = Vec::with_capacity(20 + self.payload.len());

        packet.push(0x45); // Version 4, IHL 5
        packet.push(0x00);
        packet.extend_from_slice(&total_length.to_be_bytes());
        packet.extend_from_slice(&[0x00, 0x01]); // Identification
        packet.extend_from_slice(&[0x40, 0x00]); // Don't fragment
        packet.push(self.ttl);
        packet.push(self.protocol);
        packet.extend_from_slice(&[0x00, 0x00]); // Checksum (not calculated)
        packet.extend_from_slice(&self.src_ip);
        packet.extend_from_slice(&self.dst_ip);
        packet.extend_from_slice(&self.payload);

        packet
    }
}

/// Builder for constructing TCP segments.
#[derive(Debug, Clone)]
pub struct TcpBuilder {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    options: Vec<u8>,
    payload: Vec<u8>,
}

impl Default for TcpBuilder {
    fn default() -> Self {
        Self {
            src_port: 49152,
            dst_port: 80,
            seq: 1,
            ack: 0,
            flags: TCP_FLAG_SYN,
            window: 65535,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }
}

impl TcpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn src_port(mut self, port: u16) -> Self {
        self.src_port = port;
        self
    }

    pub fn dst_port(mut self, port: u16) -> Self {
        self.dst_port = port;
        self
    }

    pub fn seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub fn ack_num(mut self, ack: u32) -> Self {
        self.ack = ack;
        self
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn syn(self) -> Self {
        self.flags(TCP_FLAG_SYN)
    }

    pub fn syn_ack(self) -> Self {
        self.flags(TCP_FLAG_SYN | TCP_FLAG_ACK)
    }

    pub fn ack(self) -> Self {
        self.flags(TCP_FLAG_ACK)
    }

    pub fn fin_ack(self) -> Self {
        self.flags(TCP_FLAG_FIN | TCP_FLAG_ACK)
    }

    pub fn psh_ack(self) -> Self {
        self.flags(TCP_FLAG_PSH | TCP_FLAG_ACK)
    }

    /// Append NOP, NOP, Timestamp(tsval, tsecr).
    pub fn timestamp(mut self, tsval: u32, tsecr: u32) -> Self {
        self.options.extend_from_slice(&[0x01, 0x01, 0x08, 0x0a]);
        self.options.extend_from_slice(&tsval.to_be_bytes());
        self.options.extend_from_slice(&tsecr.to_be_bytes());
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        while self.options.len() % 4 != 0 {
            self.options.push(0x00);
        }
        let data_offset = (5 + self.options.len() / 4) as u8;
        let mut segment = Vec::with_capacity(20 + self.options.len() + self.payload.len());

        segment.extend_from_slice(&self.src_port.to_be_bytes());
        segment.extend_from_slice(&self.dst_port.to_be_bytes());
        segment.extend_from_slice(&self.seq.to_be_bytes());
        segment.extend_from_slice(&self.ack.to_be_bytes());
        segment.push(data_offset << 4);
        segment.push(self.flags);
        segment.extend_from_slice(&self.window.to_be_bytes());
        segment.extend_from_slice(&[0x00, 0x00]); // Checksum
        segment.extend_from_slice(&[0x00, 0x00]); // Urgent pointer
        segment.extend_from_slice(&self.options);
        segment.extend_from_slice(&self.payload);

        segment
    }
}

/// Build a complete Ethernet/IPv4/TCP frame.
#[allow(clippy::too_many_arguments)]
pub fn build_tcp_frame(
    src_ip: [u8; 4],
    src_port: u16,
    dst_ip: [u8; 4],
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let tcp = TcpBuilder::new()
        .src_port(src_port)
        .dst_port(dst_port)
        .seq(seq)
        .ack_num(ack)
        .flags(flags)
        .payload(payload.to_vec())
        .build();

    let ipv4 = Ipv4Builder::new()
        .src_ip(src_ip)
        .dst_ip(dst_ip)
        .tcp()
        .payload(tcp)
        .build();

    EthernetBuilder::new().ipv4().payload(ipv4).build()
}

/// Generates the frames of one client/server TCP conversation, tracking
/// sequence and acknowledgment numbers for both sides.
#[derive(Debug, Clone)]
pub struct Conversation {
    client: ([u8; 4], u16),
    server: ([u8; 4], u16),
    client_next: u32,
    server_next: u32,
}

impl Conversation {
    /// Start a conversation with the given initial sequence numbers.
    pub fn new(client: ([u8; 4], u16), server: ([u8; 4], u16), client_isn: u32, server_isn: u32) -> Self {
        Self {
            client,
            server,
            client_next: client_isn,
            server_next: server_isn,
        }
    }

    /// SYN, SYN-ACK, ACK.
    pub fn handshake(&mut self) -> Vec<Vec<u8>> {
        let syn = self.client_frame(TCP_FLAG_SYN, &[], 0);
        self.client_next = self.client_next.wrapping_add(1);
        let syn_ack = self.server_frame(TCP_FLAG_SYN | TCP_FLAG_ACK, &[]);
        self.server_next = self.server_next.wrapping_add(1);
        let ack = self.client_frame(TCP_FLAG_ACK, &[], self.server_next);
        vec![syn, syn_ack, ack]
    }

    /// A data segment from the client.
    pub fn client_data(&mut self, payload: &[u8]) -> Vec<u8> {
        let frame = self.client_frame(TCP_FLAG_PSH | TCP_FLAG_ACK, payload, self.server_next);
        self.client_next = self.client_next.wrapping_add(payload.len() as u32);
        frame
    }

    /// A data segment from the server.
    pub fn server_data(&mut self, payload: &[u8]) -> Vec<u8> {
        let frame = self.server_frame(TCP_FLAG_PSH | TCP_FLAG_ACK, payload);
        self.server_next = self.server_next.wrapping_add(payload.len() as u32);
        frame
    }

    /// FIN from the client.
    pub fn client_fin(&mut self) -> Vec<u8> {
        let frame = self.client_frame(TCP_FLAG_FIN | TCP_FLAG_ACK, &[], self.server_next);
        self.client_next = self.client_next.wrapping_add(1);
        frame
    }

    /// FIN from the server.
    pub fn server_fin(&mut self) -> Vec<u8> {
        let frame = self.server_frame(TCP_FLAG_FIN | TCP_FLAG_ACK, &[]);
        self.server_next = self.server_next.wrapping_add(1);
        frame
    }

    fn client_frame(&self, flags: u8, payload: &[u8], ack: u32) -> Vec<u8> {
        build_tcp_frame(
            self.client.0,
            self.client.1,
            self.server.0,
            self.server.1,
            self.client_next,
            ack,
            flags,
            payload,
        )
    }

    fn server_frame(&self, flags: u8, payload: &[u8]) -> Vec<u8> {
        build_tcp_frame(
            self.server.0,
            self.server.1,
            self.client.0,
            self.client.1,
            self.server_next,
            self.client_next,
            flags,
            payload,
        )
    }
}

/// Write frames into an in-memory legacy PCAP file (little-endian,
/// microsecond timestamps, Ethernet link type).
pub fn pcap_file(frames: &[(i64, Vec<u8>)]) -> Vec<u8> {
    let mut data = Vec::new();

    // Global header
    data.extend_from_slice(&0xa1b2c3d4u32.to_le_bytes()); // Magic
    data.extend_from_slice(&2u16.to_le_bytes()); // Version major
    data.extend_from_slice(&4u16.to_le_bytes()); // Version minor
    data.extend_from_slice(&0i32.to_le_bytes()); // Thiszone
    data.extend_from_slice(&0u32.to_le_bytes()); // Sigfigs
    data.extend_from_slice(&65535u32.to_le_bytes()); // Snaplen
    data.extend_from_slice(&1u32.to_le_bytes()); // Network (Ethernet)

    for (timestamp_us, frame) in frames {
        let len = frame.len() as u32;
        data.extend_from_slice(&((timestamp_us / 1_000_000) as u32).to_le_bytes());
        data.extend_from_slice(&((timestamp_us % 1_000_000) as u32).to_le_bytes());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(frame);
    }

    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ethernet_builder() {
        let frame = EthernetBuilder::new().ipv4().payload(vec![0x45, 0x00]).build();

        assert_eq!(frame.len(), 16);
        assert_eq!(&frame[12..14], &[0x08, 0x00]);
    }

    #[test]
    fn test_tcp_builder_with_timestamp() {
        let segment = TcpBuilder::new()
            .src_port(443)
            .dst_port(54321)
            .syn()
            .timestamp(7, 9)
            .build();

        assert_eq!(segment.len(), 32);
        assert_eq!(segment[12] >> 4, 8);
        assert_eq!(segment[13], TCP_FLAG_SYN);
    }

    #[test]
    fn test_build_tcp_frame() {
        let frame = build_tcp_frame([10, 0, 0, 1], 1234, [10, 0, 0, 2], 80, 1, 0, TCP_FLAG_SYN, &[]);

        // Ethernet (14) + IPv4 (20) + TCP (20)
        assert_eq!(frame.len(), 54);
    }

    #[test]
    fn test_conversation_sequence_tracking() {
        let mut conv = Conversation::new(([10, 0, 0, 1], 40000), ([10, 0, 0, 2], 80), 100, 500);
        let hs = conv.handshake();
        assert_eq!(hs.len(), 3);

        // SYN-ACK acknowledges client ISN + 1
        assert_eq!(&hs[1][42..46], &101u32.to_be_bytes());
        // Data after handshake starts at ISN + 1
        let data = conv.client_data(b"abc");
        assert_eq!(&data[38..42], &101u32.to_be_bytes());
        assert_eq!(&data[42..46], &501u32.to_be_bytes());
    }

    #[test]
    fn test_pcap_file_layout() {
        let data = pcap_file(&[(2_000_003, vec![0xaa; 60])]);
        assert_eq!(data.len(), 24 + 16 + 60);
        assert_eq!(&data[..4], &[0xd4, 0xc3, 0xb2, 0xa1]);
        assert_eq!(&data[24..28], &2u32.to_le_bytes());
        assert_eq!(&data[28..32], &3u32.to_le_bytes());
    }
}
