//! Per-batch availability tracking: which timeslots remain free for each
//! endpoint (and, optionally, each rack), per §3 "Batch state" and §4.3.2
//! step 2 / §4.3.4.

use fastpass_shared::{rack, NodeId, MAX_NODES, NUM_RACKS, OUT_OF_BOUNDARY};

pub struct BatchState {
    batch_size: u32,
    oversubscribed: bool,

    /// Bit `t` of `src_free[s]` is set iff source `s` still has timeslot `t`
    /// free in this batch.
    src_free: Vec<u64>,
    dst_free: Vec<u64>,
    src_rack_free: Vec<u64>,
    dst_rack_free: Vec<u64>,
    /// Row-major `[rack][timeslot]` remaining inter-rack capacity.
    src_rack_counts: Vec<u16>,
    dst_rack_counts: Vec<u16>,
    out_of_boundary_counts: Vec<u16>,

    /// Timeslots not yet handed to the output loop. Shifted left by one bit
    /// (forbidding the oldest remaining timeslot) each time §4.3.2 step 7
    /// finishes emitting a timeslot.
    pub allowed_mask: u64,
}

impl BatchState {
    pub fn new(
        batch_size: u32,
        oversubscribed: bool,
        inter_rack_capacity: u16,
        out_of_boundary_capacity: u16,
    ) -> Self {
        let full = if batch_size == 64 { !0u64 } else { (1u64 << batch_size) - 1 };
        let n_nodes = MAX_NODES as usize;
        let n_racks = NUM_RACKS as usize;
        let mut s = BatchState {
            batch_size,
            oversubscribed,
            src_free: vec![full; n_nodes],
            dst_free: vec![full; n_nodes],
            src_rack_free: vec![full; n_racks],
            dst_rack_free: vec![full; n_racks],
            src_rack_counts: vec![inter_rack_capacity; n_racks * batch_size as usize],
            dst_rack_counts: vec![inter_rack_capacity; n_racks * batch_size as usize],
            out_of_boundary_counts: vec![out_of_boundary_capacity; batch_size as usize],
            allowed_mask: full,
        };
        // `OUT_OF_BOUNDARY` has a separate, typically much smaller, capacity
        // than a real destination; seed it to the out-of-boundary budget
        // rather than "fully available".
        let oob = OUT_OF_BOUNDARY.index();
        s.dst_free[oob] = if out_of_boundary_capacity == 0 { 0 } else { full };
        s
    }

    fn rack_count_idx(&self, rack_id: u16, t: u32) -> usize {
        rack_id as usize * self.batch_size as usize + t as usize
    }

    /// The timeslot bitmap still available for `(src, dst)`, honoring
    /// endpoint, out-of-boundary, and (if enabled) rack limits.
    fn avail(&self, src: NodeId, dst: NodeId) -> u64 {
        let mut avail = self.allowed_mask & self.src_free[src.index()] & self.dst_free[dst.index()];
        if self.oversubscribed {
            avail &= self.src_rack_free[rack(src) as usize];
            if !dst.is_out_of_boundary() {
                avail &= self.dst_rack_free[rack(dst) as usize];
            }
        }
        avail
    }

    /// Attempts to claim the lowest free timeslot for `(src, dst)`, updating
    /// every capacity structure touched by the grant. Returns the timeslot
    /// offset within the batch, or `None` if no timeslot is available.
    pub fn allocate(&mut self, src: NodeId, dst: NodeId) -> Option<u32> {
        let avail = self.avail(src, dst);
        if avail == 0 {
            return None;
        }
        let t = avail.trailing_zeros();
        self.src_free[src.index()] &= !(1u64 << t);
        self.dst_free[dst.index()] &= !(1u64 << t);

        if dst.is_out_of_boundary() {
            let c = &mut self.out_of_boundary_counts[t as usize];
            *c -= 1;
            if *c == 0 {
                self.dst_free[dst.index()] &= !(1u64 << t);
            }
        }

        if self.oversubscribed {
            let src_rack = rack(src);
            let idx = self.rack_count_idx(src_rack, t);
            self.src_rack_counts[idx] -= 1;
            if self.src_rack_counts[idx] == 0 {
                self.src_rack_free[src_rack as usize] &= !(1u64 << t);
            }
            if !dst.is_out_of_boundary() {
                let dst_rack = rack(dst);
                let idx = self.rack_count_idx(dst_rack, t);
                self.dst_rack_counts[idx] -= 1;
                if self.dst_rack_counts[idx] == 0 {
                    self.dst_rack_free[dst_rack as usize] &= !(1u64 << t);
                }
            }
        }

        Some(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_timeslot_batch_allocates_lowest_free_slot() {
        let mut s = BatchState::new(8, false, u16::MAX, u16::MAX);
        let (src, dst) = (NodeId::new(0), NodeId::new(1));
        assert_eq!(s.allocate(src, dst), Some(0));
        // src is now busy at t=0, but free again at t=1.
        assert_eq!(s.allocate(src, dst), Some(1));
    }

    #[test]
    fn destination_contention_blocks_second_source() {
        let mut s = BatchState::new(8, false, u16::MAX, u16::MAX);
        let dst = NodeId::new(9);
        assert_eq!(s.allocate(NodeId::new(1), dst), Some(0));
        // a different source to the same dst must wait for t=1.
        assert_eq!(s.allocate(NodeId::new(2), dst), Some(1));
    }

    #[test]
    fn allowed_mask_forbids_timeslots_already_emitted() {
        let mut s = BatchState::new(8, false, u16::MAX, u16::MAX);
        s.allowed_mask <<= 1; // t=0 has been output already
        assert_eq!(s.allocate(NodeId::new(0), NodeId::new(1)), Some(1));
    }
}
