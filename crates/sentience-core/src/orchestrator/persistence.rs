//! Write-through persistence with a bounded backfill queue.
//!
//! A write that fails with `PersistenceUnavailable` parks the record (and everything after
//! it in the batch) here. The next batch drains the queue first; a fresh record for the same
//! key supersedes the parked one.

use std::collections::VecDeque;

use tracing::{debug, error, warn};

use crate::error::{SentienceError, SentienceResult};
use crate::store::PersistenceStore;

/// Records held while the store is unreachable. Oldest are dropped past this.
pub const BACKFILL_LIMIT: usize = 256;

#[derive(Debug, Default)]
pub(crate) struct Backfill {
    pending: VecDeque<(String, Vec<u8>)>,
}

impl Backfill {
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    fn enqueue(&mut self, key: String, bytes: Vec<u8>) {
        self.pending.retain(|(k, _)| *k != key);
        if self.pending.len() >= BACKFILL_LIMIT {
            if let Some((dropped, _)) = self.pending.pop_front() {
                warn!(target: "sentience::store", key = %dropped, "backfill full; oldest record dropped");
            }
        }
        self.pending.push_back((key, bytes));
    }

    /// Writes parked records, then `records`. Stops at the first unavailable error and parks
    /// whatever was not written. Other per-record errors are logged and the record skipped.
    pub(crate) fn write_through(
        &mut self,
        store: &dyn PersistenceStore,
        records: Vec<(String, Vec<u8>)>,
    ) -> SentienceResult<usize> {
        let mut batch: Vec<(String, Vec<u8>)> = self
            .pending
            .drain(..)
            .filter(|(k, _)| !records.iter().any(|(fresh, _)| fresh == k))
            .collect();
        let replayed = batch.len();
        batch.extend(records);

        let mut written = 0;
        let mut remaining = batch.into_iter();
        while let Some((key, bytes)) = remaining.next() {
            match store.save(&key, &bytes) {
                Ok(()) => written += 1,
                Err(SentienceError::PersistenceUnavailable(reason)) => {
                    self.enqueue(key, bytes);
                    for (k, v) in remaining {
                        self.enqueue(k, v);
                    }
                    warn!(
                        target: "sentience::store",
                        pending = self.pending.len(),
                        reason = %reason,
                        "store unavailable; records queued for backfill"
                    );
                    return Err(SentienceError::PersistenceUnavailable(reason));
                }
                Err(e) => error!(target: "sentience::store", key = %key, error = %e, "record not persisted"),
            }
        }
        if replayed > 0 {
            debug!(target: "sentience::store", replayed, "backfill flushed");
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn rec(key: &str, v: &str) -> (String, Vec<u8>) {
        (key.to_string(), v.as_bytes().to_vec())
    }

    #[test]
    fn outage_parks_records_until_next_window() {
        let store = MemoryStore::new();
        let mut backfill = Backfill::default();
        store.set_available(false);
        assert!(backfill.write_through(&store, vec![rec("a", "1"), rec("b", "1")]).is_err());
        assert_eq!(backfill.len(), 2);

        store.set_available(true);
        // fresh "a" supersedes the parked one
        assert_eq!(backfill.write_through(&store, vec![rec("a", "2")]).unwrap(), 2);
        assert_eq!(backfill.len(), 0);
        assert_eq!(store.load("a").unwrap(), b"2".to_vec());
        assert_eq!(store.load("b").unwrap(), b"1".to_vec());
    }

    #[test]
    fn queue_is_bounded() {
        let mut backfill = Backfill::default();
        for i in 0..BACKFILL_LIMIT + 10 {
            backfill.enqueue(format!("k{}", i), Vec::new());
        }
        assert_eq!(backfill.len(), BACKFILL_LIMIT);
        assert_eq!(backfill.pending.front().map(|(k, _)| k.as_str()), Some("k10"));
    }
}
