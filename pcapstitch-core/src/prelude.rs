//! Convenient re-exports for common usage.
//!
//! # Example
//!
//! ```rust,no_run
//! use pcapstitch_core::prelude::*;
//!
//! let manager = StreamManager::new(StreamConfig::default());
//! let streams: Vec<ReconstructedStream> = manager.drain();
//! ```

// Reassembly
pub use crate::stream::{
    ConnectionKey, Direction, ReconstructedStream, StreamConfig, StreamManager, TcpReconstructor,
};

// TLS
pub use crate::tls::{PrivateKeyStore, TlsContext};

// Input
pub use crate::pcap::{CapturedFrame, PcapReader};
pub use crate::packet::TcpSegment;

// Error types
pub use crate::error::{Error, Result};
