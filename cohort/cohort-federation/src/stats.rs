//! Event exchange counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the exchange components
#[derive(Debug, Default)]
pub struct ExchangeStats {
    published: AtomicU64,
    publish_retries: AtomicU64,
    abandoned: AtomicU64,
    received: AtomicU64,
    applied: AtomicU64,
    duplicates: AtomicU64,
    gap_buffered: AtomicU64,
    reconciled: AtomicU64,
    conflicts: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time copy of [`ExchangeStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeStatistics {
    /// Events accepted by the topic
    pub published: u64,
    /// Extra publication attempts after transient failures
    pub publish_retries: u64,
    /// Events dropped after the retry budget ran out
    pub abandoned: u64,
    /// Remote events taken off the topic
    pub received: u64,
    pub applied: u64,
    /// Events discarded as already applied
    pub duplicates: u64,
    /// Events held back behind a version gap
    pub gap_buffered: u64,
    /// Gaps closed by re-fetching from the home collection
    pub reconciled: u64,
    pub conflicts: u64,
    /// Events refused, e.g. incompatible registrations
    pub rejected: u64,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl ExchangeStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_published, published);
    counter!(record_received, received);
    counter!(record_abandoned, abandoned);
    counter!(record_applied, applied);
    counter!(record_duplicate, duplicates);
    counter!(record_gap_buffered, gap_buffered);
    counter!(record_reconciled, reconciled);
    counter!(record_conflict, conflicts);
    counter!(record_rejected, rejected);

    pub fn record_publish_retries(&self, retries: u64) {
        self.publish_retries.fetch_add(retries, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ExchangeStatistics {
        ExchangeStatistics {
            published: self.published.load(Ordering::Relaxed),
            publish_retries: self.publish_retries.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            gap_buffered: self.gap_buffered.load(Ordering::Relaxed),
            reconciled: self.reconciled.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = ExchangeStats::new();
        stats.record_published();
        stats.record_publish_retries(3);
        stats.record_duplicate();
        stats.record_duplicate();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.published, 1);
        assert_eq!(snapshot.publish_retries, 3);
        assert_eq!(snapshot.duplicates, 2);
        assert_eq!(snapshot.applied, 0);
    }
}
