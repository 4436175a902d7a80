use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hooks for counting transaction, journal, and name-cache activity.
pub trait GraphFsMetrics: Send + Sync {
    /// A transaction was begun.
    fn txn_begun(&self);

    /// A transaction's commit replay finished successfully.
    fn txn_committed(&self);

    /// A transaction was rolled back, explicitly or by recovery.
    fn txn_rolled_back(&self);

    /// Recovery re-applied a committed transaction.
    fn txn_recovered(&self);

    /// An entry was appended to the journal.
    fn journal_appended(&self);

    /// A cache-entry lookup completed.
    ///
    /// # Parameters
    /// * `hit` - The child was already cached; the backing store was not asked.
    /// * `negative` - The resolved child is a cached miss.
    fn cache_lookup(&self, hit: bool, negative: bool);
}

/// [`GraphFsMetrics`] that records nothing.
#[derive(Default)]
pub struct NoopMetrics;

impl GraphFsMetrics for NoopMetrics {
    fn txn_begun(&self) {}
    fn txn_committed(&self) {}
    fn txn_rolled_back(&self) {}
    fn txn_recovered(&self) {}
    fn journal_appended(&self) {}
    fn cache_lookup(&self, _hit: bool, _negative: bool) {}
}

/// Atomic counters behind [`GraphFsMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Transactions begun.
    pub txns_begun: AtomicU64,

    /// Transactions committed.
    pub txns_committed: AtomicU64,

    /// Transactions rolled back.
    pub txns_rolled_back: AtomicU64,

    /// Transactions re-applied by recovery.
    pub txns_recovered: AtomicU64,

    /// Journal entries appended.
    pub journal_entries: AtomicU64,

    /// Lookups served from the cache.
    pub cache_hits: AtomicU64,

    /// Lookups that consulted the backing store.
    pub cache_misses: AtomicU64,

    /// Lookups that resolved to a negative entry.
    pub negative_lookups: AtomicU64,
}

/// Point-in-time copy of [`CounterMetrics`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MetricsSnapshot {
    /// See [`CounterMetrics::txns_begun`].
    pub txns_begun: u64,
    /// See [`CounterMetrics::txns_committed`].
    pub txns_committed: u64,
    /// See [`CounterMetrics::txns_rolled_back`].
    pub txns_rolled_back: u64,
    /// See [`CounterMetrics::txns_recovered`].
    pub txns_recovered: u64,
    /// See [`CounterMetrics::journal_entries`].
    pub journal_entries: u64,
    /// See [`CounterMetrics::cache_hits`].
    pub cache_hits: u64,
    /// See [`CounterMetrics::cache_misses`].
    pub cache_misses: u64,
    /// See [`CounterMetrics::negative_lookups`].
    pub negative_lookups: u64,
}

impl CounterMetrics {
    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            txns_begun: self.txns_begun.load(Ordering::Relaxed),
            txns_committed: self.txns_committed.load(Ordering::Relaxed),
            txns_rolled_back: self.txns_rolled_back.load(Ordering::Relaxed),
            txns_recovered: self.txns_recovered.load(Ordering::Relaxed),
            journal_entries: self.journal_entries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            negative_lookups: self.negative_lookups.load(Ordering::Relaxed),
        }
    }
}

impl GraphFsMetrics for CounterMetrics {
    fn txn_begun(&self) {
        self.txns_begun.fetch_add(1, Ordering::Relaxed);
    }

    fn txn_committed(&self) {
        self.txns_committed.fetch_add(1, Ordering::Relaxed);
    }

    fn txn_rolled_back(&self) {
        self.txns_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    fn txn_recovered(&self) {
        self.txns_recovered.fetch_add(1, Ordering::Relaxed);
    }

    fn journal_appended(&self) {
        self.journal_entries.fetch_add(1, Ordering::Relaxed);
    }

    fn cache_lookup(&self, hit: bool, negative: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
        if negative {
            self.negative_lookups.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// The default, zero-overhead metrics sink.
pub fn default_metrics() -> Arc<dyn GraphFsMetrics> {
    Arc::new(NoopMetrics)
}
