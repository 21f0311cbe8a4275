//! TCP stream reconstruction.
//!
//! Rebuilds the two byte streams of a TCP connection from captured segments
//! that may arrive in any order, optionally decrypting TLS on the way.
//!
//! ## Components
//!
//! - [`ConnectionKey`] - Direction-agnostic connection identity
//! - [`TcpReconstructor`] - Per-connection reassembly state machine
//! - [`ReconstructedStream`] - Output of a finished connection
//! - [`StreamManager`] - Frames in, streams out, via the session cache
//! - [`RoundTripTracker`] - Push-to-FIN timing from TCP timestamps
//!
//! ## Example
//!
//! ```rust,no_run
//! use pcapstitch_core::stream::{StreamConfig, StreamManager};
//!
//! let manager = StreamManager::new(StreamConfig::default());
//!
//! # let frames: Vec<(Vec<u8>, i64)> = Vec::new();
//! for (frame, timestamp_us) in &frames {
//!     if let Some(stream) = manager.process_frame(frame, *timestamp_us) {
//!         println!("{}", String::from_utf8_lossy(&stream.to_bytes()));
//!     }
//! }
//! for stream in manager.drain() {
//!     println!("{} bytes", stream.payload_len());
//! }
//! ```

mod connection;
mod manager;
mod reassembly;
mod roundtrip;

pub use crate::packet::TcpFlags;
pub use connection::{ConnectionKey, Direction, Endpoint};
pub use manager::{StreamConfig, StreamManager, DEFAULT_TLS_PORT};
pub use reassembly::{
    Fragment, Reassembly, ReconstructedStream, ReconstructorState, StreamChunk, StreamMetadata,
    TcpReconstructor,
};
pub use roundtrip::{RoundTrip, RoundTripTracker, DEFAULT_PUSH_TTL_US};
