//! Global per-flow backlog counters. This is the pipeline's one piece of
//! state shared across every worker thread (§5): a flat array indexed by
//! `src * MAX_NODES + dst`, each entry holding an atomic backlog counter and
//! a "last allocated timeslot" hint consulted only by whichever worker
//! currently holds the flow's bin.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use fastpass_shared::{NodeId, MAX_NODES};

struct FlowEntry {
    backlog: AtomicU32,
    last_alloc: AtomicU64,
    total_alloc: AtomicU64,
}

/// Backlog + aging state for every `(src, dst)` pair in the managed node
/// space, including the `OUT_OF_BOUNDARY` destination.
pub struct FlowTable {
    entries: Vec<FlowEntry>,
}

impl FlowTable {
    pub fn new() -> Self {
        let n = MAX_NODES as usize * MAX_NODES as usize;
        let mut entries = Vec::with_capacity(n);
        entries.resize_with(n, || FlowEntry {
            backlog: AtomicU32::new(0),
            last_alloc: AtomicU64::new(0),
            total_alloc: AtomicU64::new(0),
        });
        FlowTable { entries }
    }

    fn index(src: NodeId, dst: NodeId) -> usize {
        src.index() * MAX_NODES as usize + dst.index()
    }

    /// Adds `amount` timeslots of backlog for `(src, dst)`. Returns `true`
    /// iff the backlog was zero before this call — the caller uses that to
    /// decide whether to enqueue a fresh `(bin=0, src, dst)` onto `q_head`,
    /// since a flow already in flight is already tracked by some bin.
    pub fn add_backlog(&self, src: NodeId, dst: NodeId, amount: u32) -> bool {
        if amount == 0 {
            return false;
        }
        let prev = self.entries[Self::index(src, dst)]
            .backlog
            .fetch_add(amount, Ordering::AcqRel);
        prev == 0
    }

    pub fn backlog(&self, src: NodeId, dst: NodeId) -> u32 {
        self.entries[Self::index(src, dst)].backlog.load(Ordering::Acquire)
    }

    /// Consumes one unit of backlog for `(src, dst)` after a successful
    /// allocation. Underflow is a programming error per §4.3.7 and asserts.
    /// Also bumps the running total-allocated counter consulted by the
    /// alloc-report path (§4.4.5).
    pub fn consume_one(&self, src: NodeId, dst: NodeId) -> u32 {
        let entry = &self.entries[Self::index(src, dst)];
        let prev = entry.backlog.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "flow backlog underflow for ({src:?}, {dst:?})");
        entry.total_alloc.fetch_add(1, Ordering::AcqRel);
        prev - 1
    }

    /// Running count of timeslots ever allocated to `(src, dst)`, truncated
    /// to the wire's 16 low bits for an alloc-report entry.
    pub fn total_alloc(&self, src: NodeId, dst: NodeId) -> u64 {
        self.entries[Self::index(src, dst)].total_alloc.load(Ordering::Acquire)
    }

    /// Builds alloc-report entries for every destination `src` currently has
    /// a nonzero running total toward, for the periodic A-REQ-shaped report
    /// (§4.4.5). Capped at `max_entries` per packet.
    pub fn total_alloc_entries(&self, src: NodeId, max_entries: usize) -> Vec<(NodeId, u64)> {
        let mut out = Vec::new();
        for dst in 0..MAX_NODES {
            if out.len() >= max_entries {
                break;
            }
            let dst = NodeId::new(dst);
            let total = self.total_alloc(src, dst);
            if total > 0 {
                out.push((dst, total));
            }
        }
        out
    }

    pub fn last_alloc(&self, src: NodeId, dst: NodeId) -> u64 {
        self.entries[Self::index(src, dst)].last_alloc.load(Ordering::Acquire)
    }

    pub fn set_last_alloc(&self, src: NodeId, dst: NodeId, tslot: u64) {
        self.entries[Self::index(src, dst)].last_alloc.store(tslot, Ordering::Release);
    }

    /// Rebases every flow sourced at `src` to zero backlog, per the reset
    /// garbage-collection rule in §3 ("otherwise counters are rebased to
    /// zero"). Flows with `used == demand` are simply left at zero rather
    /// than removed, since the table never allocates entries dynamically.
    pub fn reset_node_backlog(&self, src: NodeId) {
        for dst in 0..MAX_NODES {
            let dst = NodeId::new(dst);
            let entry = &self.entries[Self::index(src, dst)];
            entry.backlog.store(0, Ordering::Release);
            entry.total_alloc.store(0, Ordering::Release);
        }
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}
