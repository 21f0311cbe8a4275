//! Captured frame access.
//!
//! [`RawFrame`] is a borrowed, allocation-free view that extracts
//! Ethernet/IPv4/TCP fields by fixed byte offsets. [`TcpSegment`] collects the
//! fields the reassembler needs from one frame in a single pass.

mod frame;
pub mod test_utils;

pub use frame::{
    FrameError, RawFrame, TcpFlags, TcpSegment, ETHERTYPE_IPV4, ETH_HEADER_LEN, IP_PROTO_TCP,
    TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST, TCP_FLAG_SYN,
};
