//! Round-trip timing from TCP timestamps.
//!
//! A PSH segment records its sender's `tsval` under the sequence number that
//! follows its payload. When the same sender's FIN+ACK arrives at exactly
//! that sequence number, the connection closed right after the push, and the
//! difference between the two `tsval`s is reported in the sender's timestamp
//! clock ticks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::Endpoint;
use crate::packet::TcpSegment;

/// How long an unmatched push is remembered after last access (microseconds).
pub const DEFAULT_PUSH_TTL_US: i64 = 30_000_000;

/// Elapsed ticks at or above this are a wrapped, earlier timestamp.
const MAX_TICKS: u32 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PushKey {
    source: Endpoint,
    destination: Endpoint,
    /// Sequence number right after the pushed payload.
    next_seq: u32,
}

#[derive(Debug, Clone, Copy)]
struct Push {
    tsval: u32,
    last_access_us: i64,
}

/// Time between a sender's last push and its FIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTrip {
    pub source: Endpoint,
    pub destination: Endpoint,
    /// Difference of the two `tsval`s, in the sender's clock ticks.
    pub ticks: u32,
}

impl RoundTrip {
    /// Report line in the same key/value style as the stream header.
    pub fn to_message(&self) -> String {
        format!(
            "{{ \"source_ip\" : \"{}\", \"source_port\" : \"{}\", \
             \"destination_ip\" : \"{}\", \"destination_port\" : \"{}\", \
             \"roundtrip time\" : \"{}\" }}",
            self.source.ip,
            self.source.port,
            self.destination.ip,
            self.destination.port,
            self.ticks
        )
    }
}

/// Matches FIN+ACK segments to the push they follow.
///
/// Shared between threads like the session cache: one map lock around
/// lookup and update.
pub struct RoundTripTracker {
    ttl_us: i64,
    pushes: Mutex<HashMap<PushKey, Push>>,
    matched: AtomicU64,
}

impl Default for RoundTripTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PUSH_TTL_US)
    }
}

impl RoundTripTracker {
    pub fn new(ttl_us: i64) -> Self {
        Self {
            ttl_us,
            pushes: Mutex::new(HashMap::new()),
            matched: AtomicU64::new(0),
        }
    }

    /// Feed one segment seen at capture time `timestamp_us`.
    ///
    /// Returns the round trip this segment closes, if any. Segments without
    /// a Timestamp option are ignored.
    pub fn observe(&self, segment: &TcpSegment<'_>, timestamp_us: i64) -> Option<RoundTrip> {
        let tsval = segment.tsval?;
        let source = Endpoint::new(segment.src_ip, segment.src_port);
        let destination = Endpoint::new(segment.dst_ip, segment.dst_port);

        if segment.flags.psh {
            let key = PushKey {
                source,
                destination,
                next_seq: segment.seq.wrapping_add(segment.payload.len() as u32),
            };
            self.pushes.lock().insert(
                key,
                Push {
                    tsval,
                    last_access_us: timestamp_us,
                },
            );
            return None;
        }
        if !(segment.flags.fin && segment.flags.ack) {
            return None;
        }

        let key = PushKey {
            source,
            destination,
            next_seq: segment.seq,
        };
        let push = self.pushes.lock().remove(&key)?;
        if timestamp_us.saturating_sub(push.last_access_us) > self.ttl_us {
            tracing::trace!(%source, "Push expired before FIN");
            return None;
        }

        let ticks = tsval.wrapping_sub(push.tsval);
        if ticks == 0 || ticks >= MAX_TICKS {
            return None;
        }
        self.matched.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%source, %destination, ticks, "Round trip");
        Some(RoundTrip {
            source,
            destination,
            ticks,
        })
    }

    /// Forget pushes not accessed within the TTL as of `now_us`.
    pub fn expire(&self, now_us: i64) -> usize {
        let mut pushes = self.pushes.lock();
        let before = pushes.len();
        pushes.retain(|_, p| now_us.saturating_sub(p.last_access_us) <= self.ttl_us);
        before - pushes.len()
    }

    /// Forget every pending push.
    pub fn clear(&self) {
        self.pushes.lock().clear();
    }

    /// Pushes waiting for a FIN.
    pub fn len(&self) -> usize {
        self.pushes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Round trips reported so far.
    pub fn matched(&self) -> u64 {
        self.matched.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::test_utils::{EthernetBuilder, Ipv4Builder, TcpBuilder};

    const CLIENT: [u8; 4] = [10, 0, 0, 1];
    const SERVER: [u8; 4] = [10, 0, 0, 2];

    fn frame(from_server: bool, tcp: TcpBuilder) -> Vec<u8> {
        let (src, dst, sport, dport) = if from_server {
            (SERVER, CLIENT, 80, 40000)
        } else {
            (CLIENT, SERVER, 40000, 80)
        };
        let tcp = tcp.src_port(sport).dst_port(dport).build();
        let ip = Ipv4Builder::new()
            .src_ip(src)
            .dst_ip(dst)
            .tcp()
            .payload(tcp)
            .build();
        EthernetBuilder::new().ipv4().payload(ip).build()
    }

    fn push(seq: u32, tsval: u32, payload: &[u8]) -> Vec<u8> {
        frame(
            true,
            TcpBuilder::new()
                .seq(seq)
                .psh_ack()
                .timestamp(tsval, 1)
                .payload(payload.to_vec()),
        )
    }

    fn fin(seq: u32, tsval: u32) -> Vec<u8> {
        frame(true, TcpBuilder::new().seq(seq).fin_ack().timestamp(tsval, 1))
    }

    fn observe(tracker: &RoundTripTracker, data: &[u8], at_us: i64) -> Option<RoundTrip> {
        tracker.observe(&TcpSegment::from_bytes(data).unwrap(), at_us)
    }

    // Test 1: FIN right after the push reports the tsval difference
    #[test]
    fn test_push_then_fin() {
        let tracker = RoundTripTracker::default();
        assert!(observe(&tracker, &push(1000, 500, b"response"), 0).is_none());
        assert_eq!(tracker.len(), 1);

        let rt = observe(&tracker, &fin(1008, 540), 10).unwrap();
        assert_eq!(rt.ticks, 40);
        assert_eq!(rt.source.port, 80);
        assert_eq!(rt.destination.port, 40000);
        assert!(tracker.is_empty());
        assert_eq!(tracker.matched(), 1);
    }

    // Test 2: FIN at another sequence number or from the other side is no match
    #[test]
    fn test_fin_must_follow_push() {
        let tracker = RoundTripTracker::default();
        observe(&tracker, &push(1000, 500, b"response"), 0);

        assert!(observe(&tracker, &fin(1009, 540), 1).is_none());
        let client_fin = frame(false, TcpBuilder::new().seq(1008).fin_ack().timestamp(9, 1));
        assert!(observe(&tracker, &client_fin, 2).is_none());
        assert_eq!(tracker.len(), 1);
    }

    // Test 3: A timestamp that did not advance reports nothing but is consumed
    #[test]
    fn test_non_increasing_timestamp() {
        let tracker = RoundTripTracker::default();
        observe(&tracker, &push(1000, 500, b"x"), 0);
        assert!(observe(&tracker, &fin(1001, 500), 1).is_none());
        assert!(tracker.is_empty());

        // Sequence and timestamp both wrap
        observe(&tracker, &push(u32::MAX, u32::MAX - 4, b"ab"), 0);
        assert_eq!(observe(&tracker, &fin(1, 6), 1).unwrap().ticks, 11);
    }

    // Test 4: Pushes are forgotten after the TTL
    #[test]
    fn test_push_expiry() {
        let tracker = RoundTripTracker::new(1_000);
        observe(&tracker, &push(1000, 500, b"x"), 0);
        assert!(observe(&tracker, &fin(1001, 600), 5_000).is_none());

        observe(&tracker, &push(2000, 500, b"x"), 0);
        observe(&tracker, &push(3000, 500, b"x"), 4_000);
        assert_eq!(tracker.expire(4_500), 1);
        assert_eq!(tracker.len(), 1);
    }

    // Test 5: Segments without a Timestamp option are ignored
    #[test]
    fn test_no_timestamp_ignored() {
        let tracker = RoundTripTracker::default();
        let data = frame(true, TcpBuilder::new().seq(1).psh_ack().payload(b"x".to_vec()));
        assert!(observe(&tracker, &data, 0).is_none());
        assert!(tracker.is_empty());
    }

    // Test 6: Report line format
    #[test]
    fn test_message() {
        let tracker = RoundTripTracker::default();
        observe(&tracker, &push(1, 10, b"x"), 0);
        let rt = observe(&tracker, &fin(2, 35), 0).unwrap();
        assert_eq!(
            rt.to_message(),
            "{ \"source_ip\" : \"10.0.0.2\", \"source_port\" : \"80\", \
             \"destination_ip\" : \"10.0.0.1\", \"destination_port\" : \"40000\", \
             \"roundtrip time\" : \"25\" }"
        );
    }
}
