use std::net::{IpAddr, Ipv4Addr};

use thiserror::Error;

/// Fixed Ethernet II header length.
pub const ETH_HEADER_LEN: usize = 14;
/// EtherType for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// IPv4 protocol number for TCP.
pub const IP_PROTO_TCP: u8 = 6;

pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;

const TCP_MIN_HEADER_LEN: usize = 20;
const TCP_OPT_END: u8 = 0;
const TCP_OPT_NOP: u8 = 1;
const TCP_OPT_TIMESTAMP: u8 = 8;
const TCP_OPT_TIMESTAMP_LEN: usize = 10;

/// Errors produced when a frame cannot yield a TCP segment.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short for {field} ({len} bytes)")]
    Truncated { field: &'static str, len: usize },

    #[error("not an IPv4 frame (ethertype 0x{ethertype:04x}, version {version})")]
    NotIpv4 { ethertype: u16, version: u8 },

    #[error("not a TCP packet (IP protocol {0})")]
    NotTcp(u8),
}

/// Borrowed view over one captured Ethernet/IPv4/TCP frame.
///
/// Every accessor is a pure function of the frame bytes and returns `None`
/// when the frame is too short for the requested field.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    data: &'a [u8],
}

impl<'a> RawFrame<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// The underlying frame bytes.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    fn byte(&self, offset: usize) -> Option<u8> {
        self.data.get(offset).copied()
    }

    #[inline]
    fn be_u16(&self, offset: usize) -> Option<u16> {
        let b = self.data.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    #[inline]
    fn be_u32(&self, offset: usize) -> Option<u32> {
        let b = self.data.get(offset..offset + 4)?;
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn ipv4_at(&self, offset: usize) -> Option<Ipv4Addr> {
        let b = self.data.get(offset..offset + 4)?;
        Some(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
    }

    // ========================================================================
    // Ethernet / IPv4
    // ========================================================================

    pub fn ether_type(&self) -> Option<u16> {
        self.be_u16(12)
    }

    pub fn ip_version(&self) -> Option<u8> {
        self.byte(ETH_HEADER_LEN).map(|b| b >> 4)
    }

    /// IP header length in bytes (IHL nibble x 4).
    pub fn ip_header_len(&self) -> Option<usize> {
        self.byte(ETH_HEADER_LEN).map(|b| (b & 0x0f) as usize * 4)
    }

    /// IPv4 total length field.
    pub fn ip_total_len(&self) -> Option<usize> {
        self.be_u16(ETH_HEADER_LEN + 2).map(usize::from)
    }

    pub fn ip_protocol(&self) -> Option<u8> {
        self.byte(ETH_HEADER_LEN + 9)
    }

    /// True when the IP protocol field says TCP.
    pub fn is_tcp(&self) -> bool {
        self.ip_protocol() == Some(IP_PROTO_TCP)
    }

    pub fn src_ip(&self) -> Option<Ipv4Addr> {
        self.ipv4_at(ETH_HEADER_LEN + 12)
    }

    pub fn dst_ip(&self) -> Option<Ipv4Addr> {
        self.ipv4_at(ETH_HEADER_LEN + 16)
    }

    // ========================================================================
    // TCP
    // ========================================================================

    fn tcp_offset(&self) -> Option<usize> {
        Some(ETH_HEADER_LEN + self.ip_header_len()?)
    }

    /// TCP header length in bytes (data offset nibble x 4).
    pub fn tcp_header_len(&self) -> Option<usize> {
        self.byte(self.tcp_offset()? + 12)
            .map(|b| (b >> 4) as usize * 4)
    }

    pub fn src_port(&self) -> Option<u16> {
        self.be_u16(self.tcp_offset()?)
    }

    pub fn dst_port(&self) -> Option<u16> {
        self.be_u16(self.tcp_offset()? + 2)
    }

    pub fn seq(&self) -> Option<u32> {
        self.be_u32(self.tcp_offset()? + 4)
    }

    pub fn ack(&self) -> Option<u32> {
        self.be_u32(self.tcp_offset()? + 8)
    }

    /// Raw TCP flag byte.
    pub fn tcp_flags(&self) -> Option<u8> {
        self.byte(self.tcp_offset()? + 13)
    }

    pub fn is_syn(&self) -> Option<bool> {
        self.tcp_flags().map(|f| f & TCP_FLAG_SYN != 0)
    }

    pub fn is_fin(&self) -> Option<bool> {
        self.tcp_flags().map(|f| f & TCP_FLAG_FIN != 0)
    }

    pub fn is_ack(&self) -> Option<bool> {
        self.tcp_flags().map(|f| f & TCP_FLAG_ACK != 0)
    }

    pub fn is_psh(&self) -> Option<bool> {
        self.tcp_flags().map(|f| f & TCP_FLAG_PSH != 0)
    }

    /// Offset of the first payload byte.
    pub fn payload_offset(&self) -> Option<usize> {
        Some(self.tcp_offset()? + self.tcp_header_len()?)
    }

    /// TCP payload: everything after the headers.
    ///
    /// The end is the IPv4 total length when that field is consistent with
    /// the frame, so Ethernet trailer padding is excluded; otherwise the
    /// frame length.
    pub fn payload(&self) -> Option<&'a [u8]> {
        let start = self.payload_offset()?;
        let end = match self.ip_total_len() {
            Some(total) if total > 0 => {
                let ip_end = ETH_HEADER_LEN + total;
                if ip_end >= start && ip_end <= self.data.len() {
                    ip_end
                } else {
                    self.data.len()
                }
            }
            _ => self.data.len(),
        };
        self.data.get(start..end)
    }

    /// Length of the TCP payload.
    pub fn payload_len(&self) -> Option<usize> {
        self.payload().map(<[u8]>::len)
    }

    /// Value of the TCP Timestamp option (`tsval`), if present.
    pub fn tcp_timestamp(&self) -> Option<u32> {
        let tcp = self.tcp_offset()?;
        let header_end = tcp + self.tcp_header_len()?;
        let options = self.data.get(tcp + TCP_MIN_HEADER_LEN..header_end)?;

        let mut i = 0;
        while i < options.len() {
            match options[i] {
                TCP_OPT_END => return None,
                TCP_OPT_NOP => i += 1,
                kind => {
                    let len = *options.get(i + 1)? as usize;
                    if kind == TCP_OPT_TIMESTAMP && len == TCP_OPT_TIMESTAMP_LEN {
                        let v = options.get(i + 2..i + 6)?;
                        return Some(u32::from_be_bytes([v[0], v[1], v[2], v[3]]));
                    }
                    if len < 2 {
                        return None;
                    }
                    i += len;
                }
            }
        }
        None
    }
}

/// TCP flags relevant to reassembly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub psh: bool,
}

impl TcpFlags {
    /// Decode from the TCP flag byte.
    pub fn from_bits(bits: u8) -> Self {
        Self {
            syn: bits & TCP_FLAG_SYN != 0,
            ack: bits & TCP_FLAG_ACK != 0,
            fin: bits & TCP_FLAG_FIN != 0,
            psh: bits & TCP_FLAG_PSH != 0,
        }
    }

    /// Encode back into a flag byte.
    pub fn bits(&self) -> u8 {
        let mut bits = 0;
        if self.syn {
            bits |= TCP_FLAG_SYN;
        }
        if self.ack {
            bits |= TCP_FLAG_ACK;
        }
        if self.fin {
            bits |= TCP_FLAG_FIN;
        }
        if self.psh {
            bits |= TCP_FLAG_PSH;
        }
        bits
    }
}

/// The fields of one TCP segment needed for reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment<'a> {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    /// Sender's TCP Timestamp option value.
    pub tsval: Option<u32>,
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    /// Extract a segment from raw frame bytes.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, FrameError> {
        Self::parse(&RawFrame::new(data))
    }

    /// Extract a segment from a frame, rejecting non-IPv4/TCP and truncated frames.
    pub fn parse(frame: &RawFrame<'a>) -> Result<Self, FrameError> {
        let len = frame.len();
        let truncated = |field| FrameError::Truncated { field, len };

        let ethertype = frame.ether_type().ok_or_else(|| truncated("ethertype"))?;
        let version = frame.ip_version().ok_or_else(|| truncated("ip header"))?;
        if ethertype != ETHERTYPE_IPV4 || version != 4 {
            return Err(FrameError::NotIpv4 { ethertype, version });
        }

        let protocol = frame.ip_protocol().ok_or_else(|| truncated("ip protocol"))?;
        if protocol != IP_PROTO_TCP {
            return Err(FrameError::NotTcp(protocol));
        }

        Ok(Self {
            src_ip: IpAddr::V4(frame.src_ip().ok_or_else(|| truncated("source address"))?),
            dst_ip: IpAddr::V4(
                frame
                    .dst_ip()
                    .ok_or_else(|| truncated("destination address"))?,
            ),
            src_port: frame.src_port().ok_or_else(|| truncated("source port"))?,
            dst_port: frame.dst_port().ok_or_else(|| truncated("destination port"))?,
            seq: frame.seq().ok_or_else(|| truncated("sequence number"))?,
            ack: frame.ack().ok_or_else(|| truncated("acknowledgment number"))?,
            flags: TcpFlags::from_bits(frame.tcp_flags().ok_or_else(|| truncated("tcp flags"))?),
            tsval: frame.tcp_timestamp(),
            payload: frame.payload().ok_or_else(|| truncated("tcp header"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::test_utils::{EthernetBuilder, Ipv4Builder, TcpBuilder};

    fn http_request_frame() -> Vec<u8> {
        let tcp = TcpBuilder::new()
            .src_port(34059)
            .dst_port(80)
            .seq(2415239731)
            .ack_num(2518192935)
            .psh_ack()
            .timestamp(2011387883, 1023)
            .payload(vec![b'x'; 445])
            .build();
        let ip = Ipv4Builder::new()
            .src_ip([192, 168, 69, 2])
            .dst_ip([192, 168, 69, 1])
            .tcp()
            .payload(tcp)
            .build();
        EthernetBuilder::new().ipv4().payload(ip).build()
    }

    // Test 1: Every field of a data segment with timestamp option
    #[test]
    fn test_extract_all_fields() {
        let data = http_request_frame();
        let frame = RawFrame::new(&data);

        assert_eq!(frame.len(), 511);
        assert_eq!(frame.ip_header_len(), Some(20));
        assert!(frame.is_tcp());
        assert_eq!(frame.tcp_header_len(), Some(32));
        assert_eq!(frame.src_ip(), Some(Ipv4Addr::new(192, 168, 69, 2)));
        assert_eq!(frame.dst_ip(), Some(Ipv4Addr::new(192, 168, 69, 1)));
        assert_eq!(frame.src_port(), Some(34059));
        assert_eq!(frame.dst_port(), Some(80));
        assert_eq!(frame.seq(), Some(2415239731));
        assert_eq!(frame.ack(), Some(2518192935));
        assert_eq!(frame.payload_len(), Some(445));
        assert_eq!(frame.is_syn(), Some(false));
        assert_eq!(frame.is_fin(), Some(false));
        assert_eq!(frame.is_ack(), Some(true));
        assert_eq!(frame.is_psh(), Some(true));
        assert_eq!(frame.tcp_timestamp(), Some(2011387883));
    }

    // Test 2: Truncated frames return None instead of reading out of bounds
    #[test]
    fn test_truncated_frame_accessors() {
        let data = http_request_frame();
        let frame = RawFrame::new(&data[..40]);

        assert_eq!(frame.ip_header_len(), Some(20));
        assert_eq!(frame.src_port(), Some(34059));
        assert_eq!(frame.seq(), None);
        assert_eq!(frame.tcp_flags(), None);
        assert_eq!(frame.payload(), None);
        assert_eq!(frame.tcp_timestamp(), None);

        let empty = RawFrame::new(&[]);
        assert!(!empty.is_tcp());
        assert_eq!(empty.ip_header_len(), None);
        assert_eq!(empty.src_ip(), None);
    }

    // Test 3: No timestamp option
    #[test]
    fn test_no_timestamp_option() {
        let tcp = TcpBuilder::new().ack().build();
        let ip = Ipv4Builder::new().tcp().payload(tcp).build();
        let data = EthernetBuilder::new().ipv4().payload(ip).build();

        assert_eq!(RawFrame::new(&data).tcp_timestamp(), None);
    }

    // Test 4: Ethernet padding is not treated as payload
    #[test]
    fn test_ethernet_padding_excluded() {
        let tcp = TcpBuilder::new().ack().build();
        let ip = Ipv4Builder::new().tcp().payload(tcp).build();
        let mut data = EthernetBuilder::new().ipv4().payload(ip).build();
        data.extend_from_slice(&[0u8; 6]);

        assert_eq!(data.len(), 60);
        assert_eq!(RawFrame::new(&data).payload_len(), Some(0));
    }

    // Test 5: Segment extraction
    #[test]
    fn test_segment_parse() {
        let data = http_request_frame();
        let seg = TcpSegment::from_bytes(&data).unwrap();

        assert_eq!(seg.src_port, 34059);
        assert_eq!(seg.dst_port, 80);
        assert!(seg.flags.ack && seg.flags.psh);
        assert!(!seg.flags.syn && !seg.flags.fin);
        assert_eq!(seg.tsval, Some(2011387883));
        assert_eq!(seg.payload.len(), 445);
    }

    // Test 6: Non-TCP and non-IPv4 frames are rejected
    #[test]
    fn test_segment_rejects_other_protocols() {
        let ip = Ipv4Builder::new().udp().payload(vec![0; 8]).build();
        let data = EthernetBuilder::new().ipv4().payload(ip).build();
        assert_eq!(TcpSegment::from_bytes(&data), Err(FrameError::NotTcp(17)));

        let data = EthernetBuilder::new()
            .ethertype(0x86dd)
            .payload(vec![0x60; 40])
            .build();
        assert!(matches!(
            TcpSegment::from_bytes(&data),
            Err(FrameError::NotIpv4 { ethertype: 0x86dd, .. })
        ));

        assert!(matches!(
            TcpSegment::from_bytes(&[0u8; 10]),
            Err(FrameError::Truncated { .. })
        ));
    }

    // Test 7: Flag round trip through the flag byte
    #[test]
    fn test_tcp_flags_bits() {
        let flags = TcpFlags::from_bits(TCP_FLAG_SYN | TCP_FLAG_ACK);
        assert!(flags.syn && flags.ack);
        assert!(!flags.fin && !flags.psh);
        assert_eq!(flags.bits(), 0x12);
    }
}
