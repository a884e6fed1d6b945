//! Cache-wide counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every cache component
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Served from disk
    pub hits: AtomicU64,
    /// Served from the write-behind queue before reaching disk
    pub buffered_hits: AtomicU64,
    pub misses: AtomicU64,
    /// Producer invocations
    pub builds: AtomicU64,
    /// Callers that joined an in-flight build instead of starting one
    pub coalesced: AtomicU64,
    pub build_failures: AtomicU64,
    pub drift_events: AtomicU64,
    pub evictions: AtomicU64,
    pub evicted_bytes: AtomicU64,
    /// Queued writes persisted by the background worker
    pub flushed: AtomicU64,
    /// Queued writes abandoned after exhausting retries or at shutdown
    pub dropped: AtomicU64,
    /// Writes performed inline because the queue budget was exhausted
    pub sync_writes: AtomicU64,
}

impl CacheStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Fraction of lookups answered without building (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = (self.hits.load(Ordering::Relaxed)
            + self.buffered_hits.load(Ordering::Relaxed)) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 { 0.0 } else { hits / total }
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            hits: load(&self.hits),
            buffered_hits: load(&self.buffered_hits),
            misses: load(&self.misses),
            builds: load(&self.builds),
            coalesced: load(&self.coalesced),
            build_failures: load(&self.build_failures),
            drift_events: load(&self.drift_events),
            evictions: load(&self.evictions),
            evicted_bytes: load(&self.evicted_bytes),
            flushed: load(&self.flushed),
            dropped: load(&self.dropped),
            sync_writes: load(&self.sync_writes),
            hit_ratio: self.hit_ratio(),
        }
    }
}

/// Serializable view of [`CacheStats`]
#[derive(Clone, Debug, Default, Serialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub buffered_hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub coalesced: u64,
    pub build_failures: u64,
    pub drift_events: u64,
    pub evictions: u64,
    pub evicted_bytes: u64,
    pub flushed: u64,
    pub dropped: u64,
    pub sync_writes: u64,
    pub hit_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_ratio(), 0.0);

        CacheStats::incr(&stats.hits);
        CacheStats::incr(&stats.buffered_hits);
        CacheStats::incr(&stats.misses);
        CacheStats::incr(&stats.misses);
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.snapshot().misses, 2);
    }
}
