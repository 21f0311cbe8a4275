//! Time-bounded cache owning one reconstructor per connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::SessionCacheStats;
use crate::packet::TcpSegment;
use crate::stream::{ConnectionKey, Reassembly, ReconstructedStream, TcpReconstructor};
use crate::tls::TlsContext;

struct Entry {
    reconstructor: Arc<Mutex<TcpReconstructor>>,
    /// Timestamp of the last segment touching this connection (microseconds).
    last_seen_us: i64,
}

/// Owns the live [`TcpReconstructor`]s, at most one per [`ConnectionKey`].
///
/// The map lock only covers lookup, creation and removal. Each reconstructor
/// has its own lock, so segments of different connections are processed in
/// parallel while segments of one connection are serialized.
pub struct SessionCache {
    tls_port: u16,
    idle_timeout_us: i64,
    tls: Option<Arc<TlsContext>>,
    entries: Mutex<HashMap<ConnectionKey, Entry>>,

    created: AtomicU64,
    completed: AtomicU64,
    evicted: AtomicU64,
    peak_entries: AtomicUsize,
}

impl SessionCache {
    pub fn new(tls_port: u16, idle_timeout_us: i64, tls: Option<Arc<TlsContext>>) -> Self {
        Self {
            tls_port,
            idle_timeout_us,
            tls,
            entries: Mutex::new(HashMap::new()),
            created: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            peak_entries: AtomicUsize::new(0),
        }
    }

    /// Route a segment to its connection's reconstructor.
    ///
    /// Returns the stream when this segment completes the connection.
    pub fn process(
        &self,
        segment: &TcpSegment<'_>,
        timestamp_us: i64,
    ) -> Option<ReconstructedStream> {
        let key = ConnectionKey::from_segment(segment);
        let reconstructor = self.get_or_create(key, timestamp_us);

        let (result, output) = {
            let mut r = reconstructor.lock();
            let result = r.process(segment);
            let output = match result {
                Reassembly::Complete => r.take_output(),
                Reassembly::InProgress => None,
            };
            (result, output)
        };

        if result == Reassembly::Complete {
            let mut entries = self.entries.lock();
            let same = entries
                .get(&key)
                .is_some_and(|e| Arc::ptr_eq(&e.reconstructor, &reconstructor));
            if same {
                entries.remove(&key);
            }
            drop(entries);

            self.completed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                connection = %key,
                bytes = output.as_ref().map_or(0, ReconstructedStream::payload_len),
                "Connection complete"
            );
        }
        output
    }

    fn get_or_create(&self, key: ConnectionKey, timestamp_us: i64) -> Arc<Mutex<TcpReconstructor>> {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(&key) {
            if !entry.reconstructor.lock().is_closed() {
                entry.last_seen_us = entry.last_seen_us.max(timestamp_us);
                return Arc::clone(&entry.reconstructor);
            }
        }

        let reconstructor = Arc::new(Mutex::new(TcpReconstructor::new(
            self.tls_port,
            self.tls.clone(),
        )));
        entries.insert(
            key,
            Entry {
                reconstructor: Arc::clone(&reconstructor),
                last_seen_us: timestamp_us,
            },
        );
        self.created.fetch_add(1, Ordering::Relaxed);
        self.peak_entries.fetch_max(entries.len(), Ordering::Relaxed);
        tracing::trace!(connection = %key, "New connection");

        reconstructor
    }

    /// Evict connections idle for longer than the timeout at `now_us` and
    /// return whatever they had reassembled.
    pub fn sweep(&self, now_us: i64) -> Vec<ReconstructedStream> {
        let expired: Vec<(ConnectionKey, Entry)> = {
            let mut entries = self.entries.lock();
            let keys: Vec<ConnectionKey> = entries
                .iter()
                .filter(|(_, e)| now_us.saturating_sub(e.last_seen_us) > self.idle_timeout_us)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e)))
                .collect()
        };

        self.evicted
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired
            .into_iter()
            .filter_map(|(key, entry)| {
                tracing::debug!(connection = %key, "Evicting idle connection");
                flush(&entry)
            })
            .collect()
    }

    /// Close every connection, returning all reassembled streams.
    pub fn drain(&self) -> Vec<ReconstructedStream> {
        let entries: Vec<Entry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        self.evicted
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        entries.iter().filter_map(flush).collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> SessionCacheStats {
        SessionCacheStats {
            created: self.created.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            entries: self.len(),
            peak_entries: self.peak_entries.load(Ordering::Relaxed),
        }
    }
}

fn flush(entry: &Entry) -> Option<ReconstructedStream> {
    let mut r = entry.reconstructor.lock();
    r.close();
    r.take_output()
}
