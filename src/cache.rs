//! Response cache (spec §4.E).
//!
//! Every completed reply is retained for `cache_period` so a retried
//! submission (same fingerprint, client re-sent because it never saw the
//! ack) replays the cached reply instead of re-executing the query.
//! Grounded in the retention-window idiom of
//! `forwarder::storage::journal::Journal::prune_acked`, here applied to an
//! in-memory map rather than a SQLite table.

use crate::model::{Fingerprint, ReplyFrame};
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct CacheEntry {
    reply: ReplyFrame,
    inserted_at: Instant,
}

/// A `cache_period`-bounded map from fingerprint to completed reply.
pub struct ReplyCache {
    entries: HashMap<Fingerprint, CacheEntry>,
    cache_period: Duration,
}

impl ReplyCache {
    pub fn new(cache_period: Duration) -> Self {
        ReplyCache {
            entries: HashMap::new(),
            cache_period,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a completed reply. A later insert for the same fingerprint
    /// (a retry that got a fresh execution rather than a cache hit)
    /// overwrites the earlier one and resets its retention clock.
    pub fn insert(&mut self, fingerprint: Fingerprint, reply: ReplyFrame) {
        self.entries.insert(
            fingerprint,
            CacheEntry {
                reply,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Look up a cached reply, regardless of age; callers that need
    /// freshness should call `trim` first (the pipeline does this once per
    /// iteration, not per lookup, per spec §4.F step 13).
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&ReplyFrame> {
        self.entries.get(fingerprint).map(|e| &e.reply)
    }

    /// Evict every entry older than `cache_period`. Returns the number
    /// evicted.
    pub fn trim(&mut self) -> usize {
        let now = Instant::now();
        let stale: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.inserted_at) >= self.cache_period)
            .map(|(fp, _)| fp.clone())
            .collect();
        for fp in &stale {
            self.entries.remove(fp);
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StatusCode;
    use std::thread::sleep;

    fn reply(msg_id: u32) -> ReplyFrame {
        ReplyFrame::empty(msg_id, StatusCode::Ok)
    }

    #[test]
    fn cached_reply_is_retrievable_before_expiry() {
        let mut cache = ReplyCache::new(Duration::from_secs(60));
        let fp = Fingerprint::new("c1", 1);
        cache.insert(fp.clone(), reply(1));
        assert!(cache.get(&fp).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn trim_evicts_entries_past_the_retention_window() {
        let mut cache = ReplyCache::new(Duration::from_millis(10));
        let fp = Fingerprint::new("c1", 1);
        cache.insert(fp.clone(), reply(1));
        sleep(Duration::from_millis(20));
        let evicted = cache.trim();
        assert_eq!(evicted, 1);
        assert!(cache.get(&fp).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn reinsertion_resets_the_retention_clock() {
        let mut cache = ReplyCache::new(Duration::from_millis(30));
        let fp = Fingerprint::new("c1", 1);
        cache.insert(fp.clone(), reply(1));
        sleep(Duration::from_millis(20));
        cache.insert(fp.clone(), reply(2));
        sleep(Duration::from_millis(20));
        // Still within 30ms of the second insert, even though the first
        // insert is now 40ms old.
        assert_eq!(cache.trim(), 0);
        assert!(cache.get(&fp).is_some());
    }
}
