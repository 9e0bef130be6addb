//! Per-destination flow state (§4.4.1) and the table that owns it, keyed by
//! the destination `NodeId`. A `Bigmap` tracks which destinations currently
//! have unrequested demand so the request path (§4.4.2) never has to scan
//! the whole table.

use fastpass_shared::{Bigmap, NodeId, MAX_NODES};

/// One destination's demand/requested/acked/alloc/used counters. The
/// invariants `used <= alloc <= demand` and `acked <= requested <= demand`
/// hold between calls; violating them forces a reset rather than being
/// silently corrected (§4.4.6).
#[derive(Debug, Default, Clone, Copy)]
pub struct Flow {
    pub demand: u64,
    pub requested: u64,
    pub acked: u64,
    pub alloc: u64,
    pub used: u64,
    pub unwanted_alloc: u64,
}

impl Flow {
    fn is_empty(&self) -> bool {
        self.demand == 0
            && self.requested == 0
            && self.acked == 0
            && self.alloc == 0
            && self.used == 0
            && self.unwanted_alloc == 0
    }
}

/// Flow table for one endpoint: `demand`/`requested`/`acked`/`alloc`/`used`
/// per destination, plus a bitmap of destinations with `requested < demand`.
pub struct FlowTable {
    flows: Vec<Flow>,
    unrequested: Bigmap,
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowTable {
    pub fn new() -> Self {
        FlowTable {
            flows: vec![Flow::default(); MAX_NODES as usize],
            unrequested: Bigmap::new(),
        }
    }

    pub fn get(&self, dst: NodeId) -> Flow {
        self.flows[dst.index()]
    }

    /// Records demand for `amount` more timeslots to `dst` (§4.4.1: each
    /// enqueued packet bumps `demand` by the timeslots it occupies). This
    /// implementation charges exactly one timeslot of demand per packet
    /// rather than packing several small packets into one timeslot's
    /// residual credit; see `DESIGN.md`.
    pub fn add_demand(&mut self, dst: NodeId, amount: u64) {
        if amount == 0 {
            return;
        }
        let flow = &mut self.flows[dst.index()];
        flow.demand += amount;
        if flow.requested < flow.demand {
            self.unrequested.set(u32::from(u16::from(dst)));
        }
    }

    /// Re-adds `amount` to `demand` without touching `requested`/`acked`
    /// (§4.4.4's missed-slot reissue and §4.4.5's lost-allocation path).
    pub fn reissue_demand(&mut self, dst: NodeId, amount: u64) {
        self.add_demand(dst, amount);
    }

    pub fn has_unrequested(&self) -> bool {
        !self.unrequested.is_empty()
    }

    /// Pops one destination with `requested < demand`, for the request path
    /// to build an A-REQ entry from. Returns `None` once the bitmap is
    /// empty.
    pub fn pop_unrequested(&mut self) -> Option<NodeId> {
        let idx = self.unrequested.find_any()?;
        self.unrequested.clear(idx);
        Some(NodeId::new(idx as u16))
    }

    /// Re-marks `dst` as having unrequested demand if it still does, after a
    /// dequeued flow was dropped without being sent (§4.4.2 step 5).
    pub fn requeue_if_still_unrequested(&mut self, dst: NodeId) {
        let flow = self.flows[dst.index()];
        if flow.requested < flow.demand {
            self.unrequested.set(u32::from(u16::from(dst)));
        }
    }

    /// Unconditionally re-marks `dst` as needing a request, regardless of
    /// whether `requested < demand`: used when a previously sent A-REQ was
    /// lost, since resending the same cumulative count is harmless (the
    /// arbiter's delta against its last-seen count is simply zero).
    pub fn force_unrequested(&mut self, dst: NodeId) {
        self.unrequested.set(u32::from(u16::from(dst)));
    }

    /// Advances `requested` to `new_requested` for `dst`.
    pub fn set_requested(&mut self, dst: NodeId, new_requested: u64) {
        self.flows[dst.index()].requested = new_requested;
    }

    /// Advances `acked` to `new_acked` for `dst` once the A-REQ packet
    /// carrying it is acknowledged.
    pub fn ack_requested(&mut self, dst: NodeId, new_acked: u64) {
        let flow = &mut self.flows[dst.index()];
        flow.acked = flow.acked.max(new_acked);
    }

    /// Grants one more allocation to `dst` (§4.4.3 step 2).
    pub fn grant_alloc(&mut self, dst: NodeId) {
        self.flows[dst.index()].alloc += 1;
    }

    /// Counts a grant that arrived for a flow that no longer wants it
    /// (§4.4.3 step 4): kept for bookkeeping, not moved to egress.
    pub fn count_unwanted_alloc(&mut self, dst: NodeId) {
        self.flows[dst.index()].unwanted_alloc += 1;
    }

    /// Moves one allocated-but-unused timeslot to the egress queue for
    /// `dst` (§4.4.4), returning whether one was available to use.
    pub fn use_one(&mut self, dst: NodeId) -> bool {
        let flow = &mut self.flows[dst.index()];
        if flow.used < flow.alloc {
            flow.used += 1;
            true
        } else {
            false
        }
    }

    /// `used == demand`: no outstanding need for more slots right now
    /// (§4.4.4's "keep or discard a future slot" check).
    pub fn is_satisfied(&self, dst: NodeId) -> bool {
        let flow = self.flows[dst.index()];
        flow.used >= flow.demand
    }

    /// Reconciles an alloc-report's cumulative count against local state
    /// (§4.4.5). A report that exceeds what was actually delivered means
    /// the arbiter allocated timeslots that never reached us; those are
    /// counted as used (so the invariants hold) and re-added to `demand`
    /// so they get freshly re-requested. Returns the lost amount, or an
    /// error if `report` violates the `report <= requested` invariant.
    pub fn reconcile_alloc_report(&mut self, dst: NodeId, report: u64) -> Result<u64, (u64, u64)> {
        let requested = self.flows[dst.index()].requested;
        if report > requested {
            return Err((report, requested));
        }
        let alloc = self.flows[dst.index()].alloc;
        if report > alloc {
            let lost = report - alloc;
            let flow = &mut self.flows[dst.index()];
            flow.alloc += lost;
            flow.used += lost;
            self.add_demand(dst, lost);
            Ok(lost)
        } else {
            Ok(0)
        }
    }

    /// Clears every flow's state, for a forced reset (§4.4.6). The
    /// destination's wire counters restart from zero; a connection reset
    /// implies the peer does the same.
    pub fn reset_all(&mut self) {
        for flow in self.flows.iter_mut() {
            *flow = Flow::default();
        }
        self.unrequested = Bigmap::new();
    }

    #[cfg(test)]
    fn is_tracked_empty(&self, dst: NodeId) -> bool {
        self.flows[dst.index()].is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_demand_marks_destination_unrequested() {
        let mut t = FlowTable::new();
        let dst = NodeId::new(3);
        assert!(!t.has_unrequested());
        t.add_demand(dst, 5);
        assert!(t.has_unrequested());
        assert_eq!(t.get(dst).demand, 5);
    }

    #[test]
    fn pop_unrequested_drains_the_bitmap() {
        let mut t = FlowTable::new();
        t.add_demand(NodeId::new(1), 1);
        t.add_demand(NodeId::new(2), 1);
        let mut seen = vec![t.pop_unrequested().unwrap().0, t.pop_unrequested().unwrap().0];
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
        assert!(t.pop_unrequested().is_none());
    }

    #[test]
    fn requeue_if_still_unrequested_respects_new_requested() {
        let mut t = FlowTable::new();
        let dst = NodeId::new(7);
        t.add_demand(dst, 10);
        t.pop_unrequested();
        t.set_requested(dst, 10);
        t.requeue_if_still_unrequested(dst);
        assert!(!t.has_unrequested());

        t.add_demand(dst, 5);
        t.pop_unrequested();
        t.set_requested(dst, 12);
        t.requeue_if_still_unrequested(dst);
        assert!(t.has_unrequested());
    }

    #[test]
    fn grant_then_use_respects_alloc_ceiling() {
        let mut t = FlowTable::new();
        let dst = NodeId::new(9);
        t.add_demand(dst, 1);
        t.grant_alloc(dst);
        assert!(t.use_one(dst));
        assert!(!t.use_one(dst));
        assert_eq!(t.get(dst).used, 1);
    }

    #[test]
    fn reconcile_alloc_report_detects_lost_allocations() {
        let mut t = FlowTable::new();
        let dst = NodeId::new(2);
        t.add_demand(dst, 10);
        t.set_requested(dst, 10);
        t.grant_alloc(dst);
        let lost = t.reconcile_alloc_report(dst, 5).unwrap();
        assert_eq!(lost, 4);
        assert_eq!(t.get(dst).alloc, 5);
        assert_eq!(t.get(dst).used, 4);
        assert_eq!(t.get(dst).demand, 14);
        assert!(t.has_unrequested());
    }

    #[test]
    fn reconcile_alloc_report_rejects_report_above_requested() {
        let mut t = FlowTable::new();
        let dst = NodeId::new(2);
        t.add_demand(dst, 1);
        t.set_requested(dst, 1);
        assert!(t.reconcile_alloc_report(dst, 2).is_err());
    }

    #[test]
    fn reset_all_clears_every_flow() {
        let mut t = FlowTable::new();
        let dst = NodeId::new(4);
        t.add_demand(dst, 3);
        t.reset_all();
        assert!(t.is_tracked_empty(dst));
        assert!(!t.has_unrequested());
    }
}
