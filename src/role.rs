//! Role controller — master/standby protocol (spec §4.G).
//!
//! A small state machine plus the timers and tiebreak rule that drive it.
//! The controller never touches sockets directly; promotion/demotion is
//! reported back to the caller as a [`Transition`], which the pipeline
//! forwards to the socket lifecycle component (4.H) to construct or tear
//! down the master-only sockets. Keeping role state and socket state in
//! separate objects mirrors `services/server/src/state.rs`'s `AppState`,
//! which holds connection registries but never owns the transport itself.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Standby,
}

/// A role change the caller must react to by reconstructing or tearing
/// down master-only sockets (4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    PromotedToMaster,
    DemotedToStandby,
}

/// Tiebreak inputs for a negotiation round: the relay's own stable header
/// (e.g. hostname) and its database `last_update` timestamp.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NegotiationClaim {
    pub last_update: chrono::DateTime<chrono::Utc>,
    pub header: String,
}

/// Outcome of comparing two negotiation claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// We keep the master role.
    WeWin,
    /// We must demote.
    WeLose,
}

/// Resolve a negotiation: newer `last_update` wins; on an exact tie,
/// lexicographically greater header wins (spec §4.G).
pub fn negotiate(ours: &NegotiationClaim, theirs: &NegotiationClaim) -> NegotiationOutcome {
    if ours.last_update != theirs.last_update {
        if ours.last_update > theirs.last_update {
            NegotiationOutcome::WeWin
        } else {
            NegotiationOutcome::WeLose
        }
    } else if ours.header >= theirs.header {
        NegotiationOutcome::WeWin
    } else {
        NegotiationOutcome::WeLose
    }
}

/// Timing configuration the controller needs (subset of spec §6's config
/// keys relevant to role transitions).
#[derive(Debug, Clone)]
pub struct RoleTimers {
    pub broadcast_period: Duration,
    pub promote_timeout: Duration,
    pub negotiation_timeout: Duration,
    /// Threshold past which a master with `warn_no_standby` set emits an
    /// escalating warning about peer silence (spec §3: "warn-no-standby").
    pub mm_warn_timeout: Duration,
}

/// The master/standby state machine for one relay instance.
pub struct RoleController {
    role: Role,
    timers: RoleTimers,
    /// If set, the relay never self-promotes regardless of silence.
    pinned_standby: bool,
    /// If set while master, emit escalating warnings once the peer has
    /// been silent past `mm_warn_timeout`.
    warn_no_standby: bool,
    last_mm_receipt: Instant,
    last_broadcast: Instant,
    self_promotions: u64,
    master_clashes: u64,
    master_clashes_failed: u64,
    demotions: u64,
    promotions: u64,
    /// Escalating warning counter for a pinned standby past promote_timeout.
    silence_warnings: u64,
    /// Escalating warning counter for a master with no standby past
    /// mm_warn_timeout.
    no_standby_warnings: u64,
}

impl RoleController {
    pub fn new(role: Role, timers: RoleTimers, pinned_standby: bool, warn_no_standby: bool) -> Self {
        let now = Instant::now();
        RoleController {
            role,
            timers,
            pinned_standby,
            warn_no_standby,
            last_mm_receipt: now,
            last_broadcast: now,
            self_promotions: 0,
            master_clashes: 0,
            master_clashes_failed: 0,
            demotions: 0,
            promotions: 0,
            no_standby_warnings: 0,
            silence_warnings: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    pub fn self_promotions(&self) -> u64 {
        self.self_promotions
    }

    pub fn master_clashes_failed(&self) -> u64 {
        self.master_clashes_failed
    }

    /// Record receipt of a peer heartbeat; resets the silence timer.
    pub fn record_heartbeat_received(&mut self) {
        self.last_mm_receipt = Instant::now();
        self.silence_warnings = 0;
    }

    /// True once `broadcast_period` has elapsed since our last heartbeat
    /// send; the pipeline calls this once per iteration (4.F step 11).
    pub fn due_for_heartbeat(&self) -> bool {
        self.last_broadcast.elapsed() >= self.timers.broadcast_period
    }

    pub fn mark_heartbeat_sent(&mut self) {
        self.last_broadcast = Instant::now();
    }

    /// Called once per pipeline iteration while standby. If the silence
    /// timeout has been exceeded and we are not pinned, self-promote and
    /// return a transition. A pinned standby instead escalates a warning
    /// and stays standby, per spec §4.G.
    pub fn check_promotion(&mut self) -> Option<Transition> {
        if self.role != Role::Standby {
            return None;
        }
        if self.last_mm_receipt.elapsed() <= self.timers.promote_timeout {
            return None;
        }
        if self.pinned_standby {
            self.silence_warnings += 1;
            return None;
        }
        self.role = Role::Master;
        self.self_promotions += 1;
        self.promotions += 1;
        self.last_broadcast = Instant::now();
        Some(Transition::PromotedToMaster)
    }

    /// Escalating warning level for a pinned standby that has exceeded
    /// `promote_timeout`; 0 means no warning is due.
    pub fn silence_warning_level(&self) -> u64 {
        self.silence_warnings
    }

    /// Called once per pipeline iteration while master. If
    /// `warn_no_standby` is set and the peer has been silent past
    /// `mm_warn_timeout`, escalate the warning counter; returns the new
    /// level, or 0 if no warning is due.
    pub fn check_no_standby_warning(&mut self) -> u64 {
        if self.role != Role::Master || !self.warn_no_standby {
            return 0;
        }
        if self.last_mm_receipt.elapsed() <= self.timers.mm_warn_timeout {
            self.no_standby_warnings = 0;
            return 0;
        }
        self.no_standby_warnings += 1;
        self.no_standby_warnings
    }

    /// Resolve a conflicting heartbeat received while we believe we are
    /// master. Returns `Some(transition)` if we lose and must demote.
    pub fn resolve_conflict(&mut self, ours: &NegotiationClaim, theirs: &NegotiationClaim) -> Option<Transition> {
        if self.role != Role::Master {
            return None;
        }
        self.master_clashes += 1;
        match negotiate(ours, theirs) {
            NegotiationOutcome::WeWin => None,
            NegotiationOutcome::WeLose => {
                self.role = Role::Standby;
                self.demotions += 1;
                self.last_mm_receipt = Instant::now();
                Some(Transition::DemotedToStandby)
            }
        }
    }

    /// A negotiation round that failed to complete within
    /// `negotiation_timeout`; both sides retry on the next heartbeat.
    pub fn record_negotiation_timeout(&mut self) {
        self.master_clashes_failed += 1;
    }

    /// Administrative demotion, independent of negotiation.
    pub fn demote(&mut self) -> Option<Transition> {
        if self.role != Role::Master {
            return None;
        }
        self.role = Role::Standby;
        self.demotions += 1;
        self.last_mm_receipt = Instant::now();
        Some(Transition::DemotedToStandby)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        self.timers.negotiation_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn timers() -> RoleTimers {
        RoleTimers {
            broadcast_period: Duration::from_millis(50),
            promote_timeout: Duration::from_millis(20),
            negotiation_timeout: Duration::from_millis(100),
            mm_warn_timeout: Duration::from_millis(20),
        }
    }

    fn ts(secs: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn standby_self_promotes_after_silence_timeout() {
        let mut ctrl = RoleController::new(Role::Standby, timers(), false, false);
        std::thread::sleep(Duration::from_millis(30));
        let transition = ctrl.check_promotion();
        assert_eq!(transition, Some(Transition::PromotedToMaster));
        assert_eq!(ctrl.role(), Role::Master);
        assert_eq!(ctrl.self_promotions(), 1);
    }

    #[test]
    fn pinned_standby_never_self_promotes_but_escalates_warnings() {
        let mut ctrl = RoleController::new(Role::Standby, timers(), true, false);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(ctrl.check_promotion(), None);
        assert_eq!(ctrl.role(), Role::Standby);
        assert_eq!(ctrl.silence_warning_level(), 1);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(ctrl.check_promotion(), None);
        assert_eq!(ctrl.silence_warning_level(), 2);
    }

    #[test]
    fn master_with_warn_no_standby_escalates_once_peer_goes_silent() {
        let mut ctrl = RoleController::new(Role::Master, timers(), false, true);
        assert_eq!(ctrl.check_no_standby_warning(), 0);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(ctrl.check_no_standby_warning(), 1);
        assert_eq!(ctrl.check_no_standby_warning(), 2);
        ctrl.record_heartbeat_received();
        assert_eq!(ctrl.check_no_standby_warning(), 0);
    }

    #[test]
    fn heartbeat_receipt_resets_the_silence_clock() {
        let mut ctrl = RoleController::new(Role::Standby, timers(), false, false);
        std::thread::sleep(Duration::from_millis(15));
        ctrl.record_heartbeat_received();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(ctrl.check_promotion(), None);
    }

    #[test]
    fn negotiation_prefers_newer_last_update() {
        let ours = NegotiationClaim { last_update: ts(100), header: "a".into() };
        let theirs = NegotiationClaim { last_update: ts(200), header: "z".into() };
        assert_eq!(negotiate(&ours, &theirs), NegotiationOutcome::WeLose);
    }

    #[test]
    fn negotiation_tiebreaks_on_header_when_timestamps_match() {
        let ours = NegotiationClaim { last_update: ts(100), header: "b".into() };
        let theirs = NegotiationClaim { last_update: ts(100), header: "a".into() };
        assert_eq!(negotiate(&ours, &theirs), NegotiationOutcome::WeWin);

        let ours = NegotiationClaim { last_update: ts(100), header: "a".into() };
        let theirs = NegotiationClaim { last_update: ts(100), header: "b".into() };
        assert_eq!(negotiate(&ours, &theirs), NegotiationOutcome::WeLose);
    }

    #[test]
    fn losing_a_conflict_demotes_and_counts_a_clash() {
        let mut ctrl = RoleController::new(Role::Master, timers(), false, false);
        let ours = NegotiationClaim { last_update: ts(100), header: "a".into() };
        let theirs = NegotiationClaim { last_update: ts(200), header: "z".into() };
        let transition = ctrl.resolve_conflict(&ours, &theirs);
        assert_eq!(transition, Some(Transition::DemotedToStandby));
        assert_eq!(ctrl.role(), Role::Standby);
    }

    #[test]
    fn winning_a_conflict_stays_master_and_still_counts_a_clash() {
        let mut ctrl = RoleController::new(Role::Master, timers(), false, false);
        let ours = NegotiationClaim { last_update: ts(200), header: "a".into() };
        let theirs = NegotiationClaim { last_update: ts(100), header: "z".into() };
        assert_eq!(ctrl.resolve_conflict(&ours, &theirs), None);
        assert_eq!(ctrl.role(), Role::Master);
    }

    #[test]
    fn administrative_demote_only_applies_while_master() {
        let mut ctrl = RoleController::new(Role::Standby, timers(), false, false);
        assert_eq!(ctrl.demote(), None);
        let mut ctrl = RoleController::new(Role::Master, timers(), false, false);
        assert_eq!(ctrl.demote(), Some(Transition::DemotedToStandby));
    }
}
