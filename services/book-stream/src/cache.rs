//! Shared order-book cache
//!
//! Maps each instrument to the most recently committed snapshot. The map is
//! sharded (`DashMap`), so writers for different instruments do not contend,
//! and each critical section only moves an `Arc`: readers clone a pointer to
//! an immutable snapshot and never copy book data under a lock.
//!
//! Writes are whole-value replacements. Two concurrent `put`s for the same
//! instrument serialize on that instrument's shard; whichever commits last
//! is the one every later `get` observes, in full.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use types::book::OrderBookSnapshot;
use types::instrument::InstrumentName;

/// A committed cache entry.
///
/// `revision` is assigned inside the write critical section, so for any one
/// instrument revisions increase strictly in commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBook {
    pub revision: u64,
    pub snapshot: Arc<OrderBookSnapshot>,
}

/// Latest-value store keyed by instrument.
#[derive(Debug, Default)]
pub struct OrderBookCache {
    books: DashMap<InstrumentName, CachedBook>,
    revisions: AtomicU64,
}

impl OrderBookCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest snapshot for `instrument`, or `None` if nothing was ever stored.
    pub fn get(&self, instrument: &str) -> Option<CachedBook> {
        self.books.get(instrument).map(|entry| entry.value().clone())
    }

    /// Replace the entry for the snapshot's instrument.
    pub fn put(&self, snapshot: OrderBookSnapshot) -> CachedBook {
        let snapshot = Arc::new(snapshot);

        // The entry guard holds the shard lock, so the revision is assigned
        // in commit order.
        let slot = self.books.entry(snapshot.instrument().clone());
        let cached = CachedBook {
            revision: self.next_revision(),
            snapshot,
        };
        slot.insert(cached.clone());
        cached
    }

    /// Number of instruments with data.
    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    /// All instruments with data, sorted.
    pub fn instruments(&self) -> Vec<InstrumentName> {
        let mut names: Vec<InstrumentName> =
            self.books.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    fn next_revision(&self) -> u64 {
        self.revisions.fetch_add(1, Ordering::Relaxed) + 1
    }
}
