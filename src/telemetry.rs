//! Telemetry (spec §4.I).
//!
//! One aggregate counters object owned by the relay instance (spec §9:
//! "process-wide counters... a single aggregate object"). Rates are
//! computed every `stats_period` against a wall-clock delta and the whole
//! thing serialises to JSON for both the log pipeline and an
//! operator-observable endpoint (4.M). Field names follow the counter list
//! in `original_source/ReceiveSQL.h` (`write_queries_recvd`,
//! `read_queries_failed`, `master_clashes`, etc.) rather than inventing a
//! new naming scheme.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Per-channel counters for one direction of traffic (reads, writes, logs,
/// acks, or peer broadcasts).
#[derive(Debug, Default, Serialize, Clone, Copy)]
pub struct ChannelCounters {
    pub received: u64,
    pub receive_fails: u64,
    pub sent: u64,
    pub send_fails: u64,
    pub executed: u64,
    pub execute_fails: u64,
    pub dropped: u64,
}

/// All counters the relay tracks, grounded in the original implementation's
/// exhaustive stat list.
#[derive(Debug, Default, Serialize, Clone, Copy)]
pub struct Counters {
    pub writes: ChannelCounters,
    pub reads: ChannelCounters,
    pub logs_in: ChannelCounters,
    pub logs_out: ChannelCounters,
    pub acks: ChannelCounters,
    pub mm_broadcasts: ChannelCounters,

    pub master_clashes: u64,
    pub master_clashes_failed: u64,
    pub standby_clashes: u64,
    pub standby_clashes_failed: u64,
    pub self_promotions: u64,
    pub self_promotions_failed: u64,
    pub promotions: u64,
    pub promotions_failed: u64,
    pub demotions: u64,
    pub demotions_failed: u64,
}

/// A point-in-time JSON-serialisable snapshot, including the rates computed
/// since the previous snapshot.
#[derive(Debug, Serialize, Clone, Copy)]
pub struct Snapshot {
    pub counters: Counters,
    pub read_query_rate: f64,
    pub write_query_rate: f64,
}

/// Tracks counters plus the state needed to compute rates every
/// `stats_period`.
pub struct TelemetryTracker {
    counters: Counters,
    stats_period: Duration,
    last_stats_at: Instant,
    reads_at_last_stats: u64,
    writes_at_last_stats: u64,
    last_snapshot: Snapshot,
}

impl TelemetryTracker {
    pub fn new(stats_period: Duration) -> Self {
        TelemetryTracker {
            counters: Counters::default(),
            stats_period,
            last_stats_at: Instant::now(),
            reads_at_last_stats: 0,
            writes_at_last_stats: 0,
            last_snapshot: Snapshot {
                counters: Counters::default(),
                read_query_rate: 0.0,
                write_query_rate: 0.0,
            },
        }
    }

    pub fn counters_mut(&mut self) -> &mut Counters {
        &mut self.counters
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// True once `stats_period` has elapsed since the last rate
    /// computation; the pipeline calls this once per iteration (4.F step
    /// 13 / "TrimQueue/TrackStats").
    pub fn due_for_stats(&self) -> bool {
        self.last_stats_at.elapsed() >= self.stats_period
    }

    /// Recompute rates against the wall-clock delta since the last call,
    /// returning the fresh snapshot. The caller (pipeline) is responsible
    /// for only calling this when `due_for_stats()` is true.
    pub fn snapshot(&mut self) -> Snapshot {
        let elapsed = self.last_stats_at.elapsed().as_secs_f64().max(f64::EPSILON);
        let reads_delta = self.counters.reads.executed.saturating_sub(self.reads_at_last_stats);
        let writes_delta = self.counters.writes.executed.saturating_sub(self.writes_at_last_stats);

        let snapshot = Snapshot {
            counters: self.counters,
            read_query_rate: reads_delta as f64 / elapsed,
            write_query_rate: writes_delta as f64 / elapsed,
        };

        self.last_stats_at = Instant::now();
        self.reads_at_last_stats = self.counters.reads.executed;
        self.writes_at_last_stats = self.counters.writes.executed;
        self.last_snapshot = snapshot;
        snapshot
    }

    /// The most recently computed snapshot, for callers (e.g. the metrics
    /// endpoint) that must not force a recomputation outside the pipeline's
    /// own cadence.
    pub fn last_snapshot(&self) -> Snapshot {
        self.last_snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_for_stats_is_false_until_the_period_elapses() {
        let tracker = TelemetryTracker::new(Duration::from_millis(50));
        assert!(!tracker.due_for_stats());
    }

    #[test]
    fn snapshot_computes_rate_from_executed_delta() {
        let mut tracker = TelemetryTracker::new(Duration::from_millis(10));
        tracker.counters_mut().writes.executed = 5;
        std::thread::sleep(Duration::from_millis(20));
        let snap = tracker.snapshot();
        assert!(snap.write_query_rate > 0.0);
        assert_eq!(snap.counters.writes.executed, 5);
    }

    #[test]
    fn second_snapshot_measures_only_the_new_delta() {
        let mut tracker = TelemetryTracker::new(Duration::from_millis(5));
        tracker.counters_mut().reads.executed = 10;
        std::thread::sleep(Duration::from_millis(10));
        tracker.snapshot();
        tracker.counters_mut().reads.executed = 12;
        std::thread::sleep(Duration::from_millis(10));
        let snap = tracker.snapshot();
        // Only the 2-read delta since the previous snapshot should count,
        // not the full 12.
        assert!(snap.read_query_rate < 12.0 / 0.005);
    }

    #[test]
    fn counters_serialise_to_json() {
        let tracker = TelemetryTracker::new(Duration::from_secs(1));
        let json = serde_json::to_string(tracker.counters()).unwrap();
        assert!(json.contains("write_query_rate") == false); // field lives on Snapshot, not Counters
        assert!(json.contains("writes"));
    }
}
