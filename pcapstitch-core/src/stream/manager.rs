use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::{SessionCache, SessionCacheStats};
use crate::packet::TcpSegment;
use crate::tls::{KeyStoreError, PrivateKeyStore, TlsContext};

use super::roundtrip::{RoundTrip, RoundTripTracker};
use super::ReconstructedStream;

/// Default TLS service port.
pub const DEFAULT_TLS_PORT: u16 = 443;

/// Configuration for the StreamManager.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Responder port whose payload is treated as TLS.
    pub tls_port: u16,
    /// Idle time after which a connection is evicted (microseconds).
    pub idle_timeout_us: i64,
    /// Private key file (`.key`) or server-to-key mapping file.
    pub private_key_path: Option<PathBuf>,
    /// Report push-to-FIN round trips from TCP timestamps.
    pub track_round_trips: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            tls_port: DEFAULT_TLS_PORT,
            idle_timeout_us: 1_000_000, // 1 second
            private_key_path: None,
            track_round_trips: false,
        }
    }
}

/// Central orchestrator: frames in, reconstructed streams out.
///
/// All methods take `&self`; the manager can be shared between threads that
/// each feed part of a capture.
pub struct StreamManager {
    config: StreamConfig,
    cache: SessionCache,
    tls: Option<Arc<TlsContext>>,
    round_trips: Option<RoundTripTracker>,
    reported: Mutex<Vec<RoundTrip>>,
    frames: AtomicU64,
    skipped: AtomicU64,
}

impl StreamManager {
    /// Create a manager without TLS decryption.
    pub fn new(config: StreamConfig) -> Self {
        let cache = SessionCache::new(config.tls_port, config.idle_timeout_us, None);
        let round_trips = config
            .track_round_trips
            .then(RoundTripTracker::default);
        Self {
            config,
            cache,
            tls: None,
            round_trips,
            reported: Mutex::new(Vec::new()),
            frames: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    /// Create a manager, loading private keys from `config.private_key_path`
    /// when set.
    pub fn from_config(config: StreamConfig) -> Result<Self, KeyStoreError> {
        let keys = config
            .private_key_path
            .as_ref()
            .map(PrivateKeyStore::from_path)
            .transpose()?;
        let manager = Self::new(config);
        Ok(match keys {
            Some(keys) => manager.with_private_keys(keys),
            None => manager,
        })
    }

    /// Enable TLS decryption with the provided keys.
    ///
    /// Must be called before any frame is processed; live connections are
    /// discarded.
    pub fn with_private_keys(mut self, keys: PrivateKeyStore) -> Self {
        tracing::debug!(keys = keys.len(), "TLS decryption enabled");
        let ctx = Arc::new(TlsContext::new(keys));
        self.cache = SessionCache::new(
            self.config.tls_port,
            self.config.idle_timeout_us,
            Some(Arc::clone(&ctx)),
        );
        self.tls = Some(ctx);
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Shared TLS state, if decryption is enabled.
    pub fn tls_context(&self) -> Option<&TlsContext> {
        self.tls.as_deref()
    }

    /// Process one captured Ethernet frame.
    ///
    /// Frames that are not IPv4/TCP or are truncated are skipped. Returns the
    /// stream this frame completed, if any.
    pub fn process_frame(&self, frame: &[u8], timestamp_us: i64) -> Option<ReconstructedStream> {
        self.frames.fetch_add(1, Ordering::Relaxed);
        match TcpSegment::from_bytes(frame) {
            Ok(segment) => self.process_segment(&segment, timestamp_us),
            Err(e) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(error = %e, len = frame.len(), "Skipping frame");
                None
            }
        }
    }

    /// Process an already extracted segment.
    pub fn process_segment(
        &self,
        segment: &TcpSegment<'_>,
        timestamp_us: i64,
    ) -> Option<ReconstructedStream> {
        if let Some(tracker) = &self.round_trips {
            if let Some(round_trip) = tracker.observe(segment, timestamp_us) {
                self.reported.lock().push(round_trip);
            }
        }
        self.cache.process(segment, timestamp_us)
    }

    /// Evict idle connections as of `now_us`.
    pub fn sweep(&self, now_us: i64) -> Vec<ReconstructedStream> {
        if let Some(tracker) = &self.round_trips {
            let expired = tracker.expire(now_us);
            if expired > 0 {
                tracing::trace!(expired, "Expired unmatched pushes");
            }
        }
        self.cache.sweep(now_us)
    }

    /// Take the round trips reported since the last call.
    ///
    /// Always empty unless [`StreamConfig::track_round_trips`] is set.
    pub fn take_round_trips(&self) -> Vec<RoundTrip> {
        std::mem::take(&mut *self.reported.lock())
    }

    /// Close all connections (end of capture).
    pub fn drain(&self) -> Vec<ReconstructedStream> {
        self.cache.drain()
    }

    pub fn stats(&self) -> SessionCacheStats {
        self.cache.stats()
    }

    /// Frames seen by [`process_frame`](Self::process_frame).
    pub fn frames_processed(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Frames skipped as non-TCP or malformed.
    pub fn frames_skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::test_utils::{Conversation, EthernetBuilder, Ipv4Builder};

    // Test 1: Default configuration
    #[test]
    fn test_default_config() {
        let config = StreamConfig::default();
        assert_eq!(config.tls_port, 443);
        assert_eq!(config.idle_timeout_us, 1_000_000);
    }

    // Test 2: Non-TCP frames are counted and skipped
    #[test]
    fn test_skip_non_tcp() {
        let manager = StreamManager::new(StreamConfig::default());
        let udp = EthernetBuilder::new()
            .ipv4()
            .payload(Ipv4Builder::new().udp().payload(vec![0; 8]).build())
            .build();
        assert!(manager.process_frame(&udp, 0).is_none());
        assert!(manager.process_frame(&[0u8; 10], 0).is_none());
        assert_eq!(manager.frames_processed(), 2);
        assert_eq!(manager.frames_skipped(), 2);
    }

    // Test 3: End-to-end through frames
    #[test]
    fn test_process_frames() {
        let manager = StreamManager::new(StreamConfig::default());
        let mut conv = Conversation::new(([10, 1, 1, 1], 1234), ([10, 1, 1, 2], 80), 1, 1);
        let mut frames = conv.handshake();
        frames.push(conv.client_data(b"hello"));
        frames.push(conv.client_fin());
        frames.push(conv.server_fin());

        let streams: Vec<_> = frames
            .iter()
            .filter_map(|f| manager.process_frame(f, 0))
            .collect();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].initiator_bytes(), b"hello");
        assert_eq!(manager.stats().completed, 1);
    }

    // Test 4: Missing key file fails at construction
    #[test]
    fn test_from_config_missing_key() {
        let config = StreamConfig {
            private_key_path: Some(PathBuf::from("/nonexistent/server.key")),
            ..Default::default()
        };
        assert!(StreamManager::from_config(config).is_err());
    }

    // Test 5: Keys enable the TLS context
    #[test]
    fn test_from_config_with_key() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("testdata/server.key");
        let config = StreamConfig {
            private_key_path: Some(path),
            ..Default::default()
        };
        let manager = StreamManager::from_config(config).unwrap();
        assert!(manager.tls_context().is_some());
        assert_eq!(manager.tls_context().unwrap().keys().len(), 1);
    }

    // Test 6: Round trips are reported only when tracking is enabled
    #[test]
    fn test_round_trip_tracking() {
        use crate::packet::test_utils::TcpBuilder;

        let ip = Ipv4Builder::new().src_ip([10, 1, 1, 2]).dst_ip([10, 1, 1, 1]).tcp();
        let segment = |tcp: TcpBuilder| {
            let tcp = tcp.src_port(80).dst_port(1234).build();
            EthernetBuilder::new()
                .ipv4()
                .payload(ip.clone().payload(tcp).build())
                .build()
        };
        let frames = [
            segment(TcpBuilder::new().seq(10).psh_ack().timestamp(100, 0).payload(b"ok".to_vec())),
            segment(TcpBuilder::new().seq(12).fin_ack().timestamp(130, 0)),
        ];

        let plain = StreamManager::new(StreamConfig::default());
        for frame in &frames {
            plain.process_frame(frame, 0);
        }
        assert!(plain.take_round_trips().is_empty());

        let config = StreamConfig {
            track_round_trips: true,
            ..Default::default()
        };
        let manager = StreamManager::new(config);
        for frame in &frames {
            manager.process_frame(frame, 0);
        }
        let reported = manager.take_round_trips();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].ticks, 30);
        assert!(manager.take_round_trips().is_empty());
    }
}
