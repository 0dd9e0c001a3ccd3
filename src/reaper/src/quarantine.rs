//! Process-local contention quarantine.
//!
//! When a batch fails with a lock conflict its keys are parked here for a
//! randomized window so that workers back off instead of hammering the
//! same contended rows. The ledger is intentionally not persisted: after a
//! restart the worst case is one extra contention retry.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use common::EntryKey;

/// Mapping from candidate key to "retry not before" timestamp.
///
/// Owned by a single worker loop; never shared across loop instances.
pub struct QuarantineLedger {
    entries: HashMap<EntryKey, DateTime<Utc>>,
    min_backoff: Duration,
    max_backoff: Duration,
}

impl QuarantineLedger {
    /// Ledger handing out jittered windows in `[min_backoff, max_backoff]`.
    pub fn new(min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            min_backoff,
            max_backoff,
        }
    }

    /// Remove every entry whose retry deadline has passed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.entries.retain(|_, retry_not_before| *retry_not_before > now);
    }

    /// Whether `key` is currently quarantined.
    pub fn contains(&self, key: &EntryKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Quarantine `key` until `now` plus a uniformly random backoff.
    ///
    /// Re-quarantining overwrites the previous deadline. The per-entry
    /// jitter avoids synchronized retries across keys and workers.
    pub fn quarantine(&mut self, key: EntryKey, now: DateTime<Utc>) {
        let backoff_secs = rand::thread_rng()
            .gen_range(self.min_backoff.as_secs()..=self.max_backoff.as_secs());
        let retry_not_before = now + chrono::Duration::seconds(backoff_secs as i64);
        self.entries.insert(key, retry_not_before);
    }

    /// Retry deadline for `key`, if quarantined.
    pub fn retry_not_before(&self, key: &EntryKey) -> Option<DateTime<Utc>> {
        self.entries.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
