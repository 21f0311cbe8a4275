//! # pcapstitch-core
//!
//! Session-aware TCP stream reconstruction with passive TLS decryption.
//!
//! Captured frames go in, in whatever order they were captured; complete
//! bidirectional byte streams come out, with TLS application data decrypted
//! when the server's RSA private key is available.
//!
//! ## Features
//!
//! - **Order-independent reassembly**: out-of-order segments are held as
//!   fragments until their predecessors arrive
//! - **Connection reuse**: a new SYN-ACK on a closed connection re-arms it
//! - **Idle eviction**: partially reassembled streams are flushed, not lost
//! - **Round-trip timing**: push-to-FIN intervals from TCP timestamps
//! - **Passive TLS decryption**: RSA key exchange, SSLv3 through TLS 1.2,
//!   RC4/3DES/AES/Camellia, session resumption
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pcapstitch_core::pcap::PcapReader;
//! use pcapstitch_core::stream::{StreamConfig, StreamManager};
//!
//! let manager = StreamManager::from_config(StreamConfig::default())?;
//! let reader = PcapReader::open("capture.pcap")?;
//!
//! for frame in reader {
//!     let frame = frame?;
//!     if let Some(stream) = manager.process_frame(&frame.data, frame.timestamp_us) {
//!         println!("{}", stream.metadata().header());
//!     }
//! }
//! let remaining = manager.drain();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                        pcapstitch-core                              |
//! +---------------------------------------------------------------------+
//! |  packet/     - Fixed-offset Ethernet/IPv4/TCP field extraction      |
//! |  stream/     - TcpReconstructor, StreamManager                      |
//! |  cache/      - SessionCache, idle eviction                          |
//! |  tls/        - Cipher suites, DER, key derivation, record decryption|
//! |  pcap/       - PCAP/PCAPNG reading                                  |
//! |  config      - Properties file configuration                        |
//! |  error/      - Error types                                          |
//! +---------------------------------------------------------------------+
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod packet;
pub mod pcap;
pub mod prelude;
pub mod stream;
pub mod tls;

// Re-export commonly used types at crate root for convenience
pub use cache::{SessionCache, SessionCacheStats};
pub use config::{ConfigError, Properties};
pub use error::{Error, PcapError, Result};
pub use packet::{FrameError, RawFrame, TcpFlags, TcpSegment};
pub use pcap::{CapturedFrame, PcapReader};
pub use stream::{
    ConnectionKey, Direction, Endpoint, Reassembly, ReconstructedStream, ReconstructorState,
    RoundTrip, RoundTripTracker, StreamConfig, StreamManager, TcpReconstructor,
};
pub use tls::{
    CipherSuite, KeyStoreError, PrivateKeyStore, SessionError, TlsContext, TlsDirection,
    TlsSession,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
