//! Collection statistics

use std::time::Duration;

/// Counters kept across collections
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Minor collections run
    pub minor_collections: u64,
    /// Major collections run
    pub major_collections: u64,
    /// Sum of minor pause times
    pub minor_pause_total: Duration,
    /// Sum of major pause times
    pub major_pause_total: Duration,
    /// Longest single pause
    pub max_pause: Duration,
    /// Bytes copied out of the nursery over the lifetime of the heap
    pub promoted_bytes: u64,
    /// Objects pinned over the lifetime of the heap
    pub pinned_objects: u64,
    /// Finalizable objects made ready
    pub finalized_objects: u64,
    /// Is the nursery currently in degraded mode
    pub degraded: bool,
    /// Bytes in major sections after the last collection
    pub major_used_bytes: usize,
    /// Bytes reserved by major sections
    pub major_heap_bytes: usize,
    /// Bytes in large objects
    pub los_used_bytes: usize,
    /// Live bytes after the last major collection
    pub live_after_major: usize,
}

/// What one pause did, reported by the collection drivers
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PauseSummary {
    pub(crate) promoted_bytes: usize,
    pub(crate) pinned_objects: usize,
    pub(crate) finalized_objects: usize,
}

impl GcStats {
    /// Total collections
    pub fn collections(&self) -> u64 {
        self.minor_collections + self.major_collections
    }

    pub(crate) fn record_pause(&mut self, major: bool, pause: Duration) {
        if major {
            self.major_collections += 1;
            self.major_pause_total += pause;
        } else {
            self.minor_collections += 1;
            self.minor_pause_total += pause;
        }
        self.max_pause = self.max_pause.max(pause);
    }

    pub(crate) fn record_summary(&mut self, summary: &PauseSummary) {
        self.promoted_bytes += summary.promoted_bytes as u64;
        self.pinned_objects += summary.pinned_objects as u64;
        self.finalized_objects += summary.finalized_objects as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_pause() {
        let mut stats = GcStats::default();
        stats.record_pause(false, Duration::from_millis(2));
        stats.record_pause(true, Duration::from_millis(5));
        stats.record_pause(false, Duration::from_millis(1));
        assert_eq!(stats.minor_collections, 2);
        assert_eq!(stats.collections(), 3);
        assert_eq!(stats.minor_pause_total, Duration::from_millis(3));
        assert_eq!(stats.max_pause, Duration::from_millis(5));
    }
}
