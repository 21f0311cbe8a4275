//! Capture file reading.
//!
//! - [`PcapReader`] - Legacy PCAP and PCAPNG reader
//! - [`CapturedFrame`] - One owned frame with its timestamp

mod reader;

pub use reader::{CapturedFrame, PcapFormat, PcapReader, LINKTYPE_ETHERNET};
