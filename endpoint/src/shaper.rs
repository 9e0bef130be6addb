//! The endpoint shaper: request path (§4.4.2), grant path (§4.4.3), timeslot
//! advance (§4.4.4), and alloc-report reconciliation (§4.4.5). Owns the flow
//! table and the allocation schedule; driven by `EndpointConnection`'s
//! `ConnectionCallbacks` impl and by a periodic tick from the host.

use std::collections::HashMap;

use log::warn;

use fastpass_shared::config::REQUEST_WINDOW;
use fastpass_shared::protocol::{alloc_advance, nearest, AllocPayload, AreqEntry};
use fastpass_shared::{NodeId, Pacer};

use crate::config::ShaperConfig;
use crate::error::EndpointError;
use crate::flow::FlowTable;

/// Observability counters for the grant and advance paths (§4.4.3/§4.4.4).
#[derive(Debug, Default, Clone, Copy)]
pub struct ShaperStats {
    pub early_enqueue: u64,
    pub late_enqueue: [u64; 4],
    pub dropped_too_late: u64,
    pub dropped_too_early: u64,
    pub missed_timeslots: u64,
    pub unwanted_alloc: u64,
    pub paused_for_backlog: u64,
}

impl ShaperStats {
    fn record_late(&mut self, lateness: u64, miss_threshold: u64) {
        let bucket = (lateness * 4 / miss_threshold.max(1)).min(3) as usize;
        self.late_enqueue[bucket] += 1;
    }
}

/// Holds the shaper's mutable state: flow table, allocation schedule, pacer,
/// current timeslot, and stats. A `Mutex<Shaper>` sits behind the same lock
/// as the reliability connection, mirroring the arbiter side's one-lock-per-
/// peer policy.
pub struct Shaper {
    config: ShaperConfig,
    flows: FlowTable,
    /// timeslot -> destination for every grant accepted into the schedule.
    schedule: HashMap<u64, NodeId>,
    request_pacer: Pacer,
    current_timeslot: u64,
    dev_backlog_ns: u64,
    pub stats: ShaperStats,
}

impl Shaper {
    pub fn new(config: ShaperConfig, initial_timeslot: u64) -> Self {
        let request_pacer = Pacer::new(
            config.request_pacer.cost_ns,
            config.request_pacer.max_credit_ns,
            config.request_pacer.min_gap_ns,
        );
        Shaper {
            config,
            flows: FlowTable::new(),
            schedule: HashMap::new(),
            request_pacer,
            current_timeslot: initial_timeslot,
            dev_backlog_ns: 0,
            stats: ShaperStats::default(),
        }
    }

    pub fn current_timeslot(&self) -> u64 {
        self.current_timeslot
    }

    /// Host tells the shaper how busy the egress NIC is, ahead of the next
    /// `update_current_timeslot` tick (§4.4.4).
    pub fn set_device_backlog_ns(&mut self, ns: u64) {
        self.dev_backlog_ns = ns;
    }

    /// A packet bound for `dst` was enqueued; charges one timeslot of demand
    /// (§4.4.1).
    pub fn enqueue_packet(&mut self, dst: NodeId) {
        self.flows.add_demand(dst, 1);
    }

    pub fn flow(&self, dst: NodeId) -> crate::flow::Flow {
        self.flows.get(dst)
    }

    /// Triggers the request pacer; the host calls this whenever new demand
    /// arrives so a request gets scheduled if one isn't already pending.
    pub fn trigger_request_pacer(&mut self, now: u64) -> bool {
        self.flows.has_unrequested() && self.request_pacer.trigger(now)
    }

    pub fn request_pacer_deadline(&self) -> Option<u64> {
        self.request_pacer.next_event()
    }

    /// Call once the pacer's scheduled event has actually fired, before
    /// building the next A-REQ packet.
    pub fn request_pacer_fired(&mut self) {
        self.request_pacer.fired();
    }

    /// A committed A-REQ packet was acknowledged: advances `acked` for every
    /// destination it named.
    pub fn ack_requested(&mut self, dst: NodeId, new_acked: u64) {
        self.flows.ack_requested(dst, new_acked);
    }

    /// A committed A-REQ packet was lost: re-marks its destinations as
    /// unrequested so the next pacer cycle retries them.
    pub fn requeue_unrequested(&mut self, dst: NodeId) {
        self.flows.force_unrequested(dst);
    }

    /// Builds up to `MAX_AREQ` A-REQ entries for flows with unrequested
    /// demand (§4.4.2 steps 4-5). Call once the pacer's scheduled event has
    /// actually fired (`fired()` already called by the caller).
    pub fn build_areq(&mut self) -> Vec<AreqEntry> {
        let mut entries = Vec::with_capacity(fastpass_shared::config::MAX_AREQ);
        while entries.len() < fastpass_shared::config::MAX_AREQ {
            let Some(dst) = self.flows.pop_unrequested() else { break };
            let flow = self.flows.get(dst);
            let new_requested = flow.demand.min(flow.acked + REQUEST_WINDOW - 1);
            if new_requested <= flow.acked {
                self.flows.requeue_if_still_unrequested(dst);
                continue;
            }
            self.flows.set_requested(dst, new_requested);
            entries.push(AreqEntry { dst: u16::from(dst), cumulative_tslots: new_requested as u16 });
        }
        entries
    }

    /// Handles an ALLOC payload (§4.4.3). An `Err` means a grant violated an
    /// invariant severe enough to warrant a full reset (§4.4.6); the caller
    /// is responsible for actually forcing one.
    pub fn handle_alloc(&mut self, alloc: &AllocPayload) -> Result<(), EndpointError> {
        let mut cursor = u64::from(alloc.base_tslot);
        for t in &alloc.tslots {
            let advance = alloc_advance(t);
            let Some(dst_index) = t.dst_index else {
                cursor += advance;
                continue;
            };
            // A grant's timeslot is the cursor position *before* the
            // advance; the advance itself (gap + 1) is how far the cursor
            // moves past the granted slot for the next entry.
            let granted = cursor + advance - 1;
            cursor += advance;
            let Some(&dst_wire) = alloc.dsts.get(usize::from(dst_index)) else {
                warn!("ALLOC referenced out-of-range dst index {dst_index}");
                continue;
            };
            let hint = self.current_timeslot.wrapping_sub(1 << 18);
            let full_tslot = nearest(hint, granted & 0xF_FFFF, 20);
            self.accept_grant(NodeId::new(dst_wire), full_tslot)?;
        }
        Ok(())
    }

    fn accept_grant(&mut self, dst: NodeId, tslot: u64) -> Result<(), EndpointError> {
        let current = self.current_timeslot;
        if tslot < current.saturating_sub(self.config.miss_threshold) {
            self.stats.dropped_too_late += 1;
            return Ok(());
        }
        if tslot > current + self.config.max_preload {
            self.stats.dropped_too_early += 1;
            return Ok(());
        }
        if tslot > current {
            self.stats.early_enqueue += 1;
        } else {
            self.stats.record_late(current - tslot, self.config.miss_threshold);
        }

        let flow = self.flows.get(dst);
        if flow.alloc + 1 > flow.demand {
            return Err(EndpointError::AllocExceedsDemand { dst, alloc: flow.alloc + 1, demand: flow.demand });
        }
        if flow.used >= flow.demand {
            // No longer wanted, but still recorded in the schedule: a later
            // demand bump should still be able to use it (§4.4.3 step 4).
            self.flows.count_unwanted_alloc(dst);
            self.stats.unwanted_alloc += 1;
        }
        self.flows.grant_alloc(dst);
        self.schedule.insert(tslot, dst);
        Ok(())
    }

    /// Periodic tick (§4.4.4): advances `current_timeslot` to `now_tslot`,
    /// moving satisfied allocations to the (conceptual) egress queue and
    /// reissuing missed demand. Returns `true` if a forced reset is required
    /// (the clock moved backwards across the configured threshold).
    pub fn update_current_timeslot(&mut self, now_tslot: u64) -> bool {
        if now_tslot < self.current_timeslot
            && self.current_timeslot - now_tslot > self.config.clock_move_reset_threshold_tslots
        {
            return true;
        }

        if now_tslot <= self.current_timeslot {
            self.current_timeslot = now_tslot;
            return false;
        }

        if self.dev_backlog_ns > self.config.max_dev_backlog_ns {
            self.stats.paused_for_backlog += 1;
            self.current_timeslot = now_tslot;
            return false;
        }

        for tslot in self.current_timeslot..now_tslot {
            if let Some(dst) = self.schedule.remove(&tslot) {
                self.flows.use_one(dst);
            }
        }

        // missed slots: anything still scheduled strictly behind the new
        // miss-threshold boundary represents a grant that arrived but whose
        // packet was never moved in time.
        let floor = now_tslot.saturating_sub(self.config.miss_threshold);
        let missed: Vec<u64> = self.schedule.keys().copied().filter(|&t| t < floor).collect();
        for tslot in missed {
            if let Some(dst) = self.schedule.remove(&tslot) {
                self.stats.missed_timeslots += 1;
                self.flows.reissue_demand(dst, 1);
            }
        }

        self.current_timeslot = now_tslot;
        false
    }

    /// Alloc-report reconciliation (§4.4.5): the arbiter's periodic "total
    /// allocated so far" report for `dst`, reconstructed by the caller to a
    /// full 64-bit count nearest `alloc - 2^15` before being passed in here.
    pub fn reconcile_alloc_report(&mut self, dst: NodeId, report: u64) -> Result<(), EndpointError> {
        match self.flows.reconcile_alloc_report(dst, report) {
            Ok(_lost) => Ok(()),
            Err((reported, requested)) => {
                Err(EndpointError::ReportExceedsRequested { dst, reported, requested })
            }
        }
    }

    /// Forced reset (§4.4.6): clears all flow and schedule state. The
    /// connection layer separately resets the reliability protocol.
    pub fn force_reset(&mut self) {
        self.flows.reset_all();
        self.schedule.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastpass_shared::protocol::build_alloc_tslots;

    fn cfg() -> ShaperConfig {
        ShaperConfig::default()
    }

    #[test]
    fn request_path_builds_entries_up_to_max_areq() {
        let mut s = Shaper::new(cfg(), 0);
        for i in 0..20u16 {
            s.enqueue_packet(NodeId::new(i));
        }
        let entries = s.build_areq();
        assert_eq!(entries.len(), fastpass_shared::config::MAX_AREQ);
        for e in &entries {
            assert_eq!(e.cumulative_tslots, 1);
        }
    }

    #[test]
    fn grant_path_moves_allocation_into_schedule() {
        let mut s = Shaper::new(cfg(), 100);
        let dst = NodeId::new(5);
        s.enqueue_packet(dst);
        let tslots = build_alloc_tslots(100, &[(0, 101)]);
        let alloc = AllocPayload { base_tslot: 100, dsts: vec![u16::from(dst)], tslots };
        s.handle_alloc(&alloc).unwrap();
        assert_eq!(s.flows.get(dst).alloc, 1);
    }

    #[test]
    fn too_late_grant_is_dropped() {
        let mut s = Shaper::new(cfg(), 10_000);
        let dst = NodeId::new(5);
        s.enqueue_packet(dst);
        let tslots = build_alloc_tslots(0, &[(0, 0)]);
        let alloc = AllocPayload { base_tslot: 0, dsts: vec![u16::from(dst)], tslots };
        s.handle_alloc(&alloc).unwrap();
        assert_eq!(s.stats.dropped_too_late, 1);
        assert_eq!(s.flows.get(dst).alloc, 0);
    }

    #[test]
    fn advancing_timeslot_uses_scheduled_allocation() {
        let mut s = Shaper::new(cfg(), 0);
        let dst = NodeId::new(5);
        s.enqueue_packet(dst);
        let tslots = build_alloc_tslots(0, &[(0, 1)]);
        let alloc = AllocPayload { base_tslot: 0, dsts: vec![u16::from(dst)], tslots };
        s.handle_alloc(&alloc).unwrap();
        assert!(!s.update_current_timeslot(2));
        assert_eq!(s.flows.get(dst).used, 1);
    }

    #[test]
    fn large_backwards_clock_jump_forces_reset() {
        let mut s = Shaper::new(cfg(), 1000);
        assert!(s.update_current_timeslot(1000 - cfg().clock_move_reset_threshold_tslots - 1));
    }

    #[test]
    fn reconcile_alloc_report_reissues_lost_demand() {
        let mut s = Shaper::new(cfg(), 0);
        let dst = NodeId::new(5);
        for _ in 0..5 {
            s.enqueue_packet(dst);
        }
        s.flows.set_requested(dst, 5);
        s.flows.grant_alloc(dst);
        // The arbiter reports 3 allocated overall, but only 1 ever reached
        // us: the other 2 are lost and must be re-requested.
        s.reconcile_alloc_report(dst, 3).unwrap();
        assert_eq!(s.flows.get(dst).alloc, 3);
        assert_eq!(s.flows.get(dst).used, 2);
        assert_eq!(s.flows.get(dst).demand, 7);
    }

    #[test]
    fn reconcile_alloc_report_above_requested_is_rejected() {
        let mut s = Shaper::new(cfg(), 0);
        let dst = NodeId::new(5);
        s.enqueue_packet(dst);
        s.flows.set_requested(dst, 1);
        assert!(s.reconcile_alloc_report(dst, 2).is_err());
    }
}
