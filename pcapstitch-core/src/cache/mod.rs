//! Connection session cache.
//!
//! Every connection being reassembled lives in the cache until both sides
//! close it or it sits idle longer than the configured timeout. Eviction
//! never calls back into the caller: [`SessionCache::sweep`] returns the
//! streams to flush and the caller decides where they go.

mod session;

pub use session::SessionCache;

/// Cache statistics for monitoring.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionCacheStats {
    /// Connections created.
    pub created: u64,
    /// Connections closed by both FINs.
    pub completed: u64,
    /// Connections closed by idle eviction or drain.
    pub evicted: u64,
    /// Current number of live connections.
    pub entries: usize,
    /// Peak number of live connections (high watermark).
    pub peak_entries: usize,
}

impl SessionCacheStats {
    /// Share of finished connections that closed cleanly.
    pub fn completion_ratio(&self) -> f64 {
        let total = self.completed + self.evicted;
        if total == 0 {
            0.0
        } else {
            self.completed as f64 / total as f64
        }
    }

    /// Format statistics as a human-readable string.
    pub fn format_summary(&self) -> String {
        format!(
            "Session Cache Statistics:\n\
             \x20 Created:     {:>10}\n\
             \x20 Completed:   {:>10} ({:.1}%)\n\
             \x20 Evicted:     {:>10}\n\
             \x20 Live:        {:>10}\n\
             \x20 Peak:        {:>10}",
            self.created,
            self.completed,
            self.completion_ratio() * 100.0,
            self.evicted,
            self.entries,
            self.peak_entries,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_ratio() {
        let stats = SessionCacheStats {
            completed: 3,
            evicted: 1,
            ..Default::default()
        };
        assert!((stats.completion_ratio() - 0.75).abs() < 0.001);
        assert_eq!(SessionCacheStats::default().completion_ratio(), 0.0);
    }

    #[test]
    fn test_format_summary() {
        let stats = SessionCacheStats {
            created: 12,
            completed: 10,
            evicted: 2,
            entries: 0,
            peak_entries: 4,
        };
        let summary = stats.format_summary();
        assert!(summary.contains("Created:             12"));
        assert!(summary.contains("(83.3%)"));
        assert!(summary.contains("Peak:                 4"));
    }
}
