//! One admission worker's batch loop (§4.3.1-§4.3.6): a ring of these,
//! connected by bounded channels, is the whole admission pipeline. Each
//! worker owns a disjoint, tiling slice of the timeline and passes bins of
//! unresolved demand around the ring as it ages them.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use fastpass_shared::{NodeId, Timestamp};
use log::{debug, warn};

use crate::config::AdmissionConfig;

use super::admitted::AdmittedTraffic;
use super::batch_state::BatchState;
use super::bin::Bin;
use super::flow_table::FlowTable;
use super::mempool::Mempool;

/// An entry on the global new-demand ring, guarded by the head token.
#[derive(Debug, Clone, Copy)]
pub struct HeadEntry {
    pub src: NodeId,
    pub dst: NodeId,
}

/// A message on the urgent ring: either the single migrating head token, or
/// a flow a previous worker could not fit into its own bin pass this batch.
#[derive(Debug, Clone, Copy)]
pub enum UrgentMsg {
    Token,
    Retry { bin_index: usize, src: NodeId, dst: NodeId },
}

/// Maps "timeslots since last allocation" to a bin index in `0..=num_bins`.
/// Bin `num_bins` holds the freshest flows (just allocated `batch_size`
/// timeslots ago); bin `0` is the catch-all for anything too old to track
/// precisely. See `DESIGN.md` for why the array is sized `num_bins + 1`
/// rather than `num_bins`.
///
/// Beyond `num_bins`, flows fold into progressively coarser groups (group 0
/// folds 2-to-1, group 1 folds 4-to-1, and so on), matching the bit-trick
/// in the reference's `bin_index_from_timeslot`: `batch_size` must be a
/// power of two, enforced by `AdmissionConfig::validate`.
pub fn bin_index_for_gap(gap: u64, batch_size: u32, num_bins: usize) -> usize {
    let batch_size = batch_size as u64;
    let num_bins = num_bins as u64;
    let batch_shift = u64::from(batch_size.trailing_zeros());

    if gap <= num_bins {
        return (num_bins + batch_size - gap) as usize;
    }

    let gap = gap - (num_bins + 1);
    let group_ind = gap >> batch_shift;
    if group_ind >= batch_shift {
        return 0;
    }

    let raw = (u64::MAX << (batch_shift + 1)) | (gap & (batch_size - 1));
    let bin_gap = raw >> (1 + group_ind);
    (batch_size - 1 - (bin_gap & (batch_size - 1))) as usize
}

pub struct Worker {
    id: usize,
    config: AdmissionConfig,
    flow_table: Arc<FlowTable>,

    bin_mempool: Mempool<Bin>,
    admitted_mempool: Mempool<AdmittedTraffic>,

    q_bin_in: Receiver<Bin>,
    q_bin_out: Sender<Bin>,
    q_urgent_in: Receiver<UrgentMsg>,
    q_urgent_out: Sender<UrgentMsg>,
    q_head: Receiver<HeadEntry>,
    q_admitted_out: Sender<AdmittedTraffic>,

    logical_timeslot: u64,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        config: AdmissionConfig,
        flow_table: Arc<FlowTable>,
        q_bin_in: Receiver<Bin>,
        q_bin_out: Sender<Bin>,
        q_urgent_in: Receiver<UrgentMsg>,
        q_urgent_out: Sender<UrgentMsg>,
        q_head: Receiver<HeadEntry>,
        q_admitted_out: Sender<AdmittedTraffic>,
    ) -> Self {
        let bin_mempool =
            Mempool::new(config.mempool_size, || Bin::with_capacity(config.ring_capacity));
        let admitted_mempool = Mempool::new(config.mempool_size, || {
            AdmittedTraffic::with_capacity(config.ring_capacity)
        });
        let logical_timeslot = config.first_timeslot + (id as u64) * config.batch_size as u64;
        Worker {
            id,
            config,
            flow_table,
            bin_mempool,
            admitted_mempool,
            q_bin_in,
            q_bin_out,
            q_urgent_in,
            q_urgent_out,
            q_head,
            q_admitted_out,
            logical_timeslot,
        }
    }

    /// Runs forever. `holds_token` is true for exactly one worker (id 0) at
    /// startup, matching §4.3.6's "worker 0 creates it".
    pub fn run(mut self, holds_token: bool) -> ! {
        let mut holds_token = holds_token;
        loop {
            holds_token = self.run_batch(holds_token);
        }
    }

    fn acquire_bin(&self) -> Bin {
        loop {
            if let Some(mut b) = self.bin_mempool.get() {
                b.clear();
                return b;
            }
            warn!("worker {}: bin mempool exhausted, retrying", self.id);
            thread::yield_now();
        }
    }

    fn acquire_admitted(&self, timeslot: u64) -> AdmittedTraffic {
        loop {
            if let Some(mut a) = self.admitted_mempool.get() {
                a.clear(timeslot);
                return a;
            }
            warn!("worker {}: admitted-traffic mempool exhausted, retrying", self.id);
            thread::yield_now();
        }
    }

    /// One pass of §4.3.2. Returns whether this worker still (or now) holds
    /// the head token when the batch completes.
    fn run_batch(&mut self, mut holds_token: bool) -> bool {
        let config = self.config;
        let batch_size = config.batch_size;
        let num_bins = config.num_bins;
        let current = self.logical_timeslot;

        let mut admitted: Vec<AdmittedTraffic> =
            (0..batch_size).map(|t| self.acquire_admitted(current + t as u64)).collect();

        let mut batch_state = BatchState::new(
            batch_size,
            config.oversubscribed,
            config.inter_rack_capacity,
            config.out_of_boundary_capacity,
        );

        let mut outgoing_bins: Vec<Bin> = (0..=num_bins).map(|_| self.acquire_bin()).collect();
        let mut new_request_bins: Vec<Bin> = (0..=num_bins).map(|_| self.acquire_bin()).collect();
        let mut temporary_bins: Vec<Bin> = Vec::with_capacity(num_bins + 1);

        // Step 4: wait for the head token to come back around, servicing
        // urgent retries as they arrive (routed into this worker's own
        // new_request_bins so they are tried in the upcoming bin pass).
        if !holds_token {
            loop {
                match self.q_urgent_in.recv() {
                    Ok(UrgentMsg::Token) => {
                        holds_token = true;
                        break;
                    }
                    Ok(UrgentMsg::Retry { bin_index, src, dst }) => {
                        new_request_bins[bin_index].push(src, dst);
                    }
                    Err(_) => panic!("urgent ring disconnected while waiting for head token"),
                }
            }
        }

        // Step 5: while head, drain new demand into the freshest bin before
        // this batch's pass reaches it.
        while holds_token {
            match self.q_head.try_recv() {
                Ok(entry) => new_request_bins[num_bins].push(entry.src, entry.dst),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => panic!("q_head disconnected"),
            }
        }

        // Step 6: walk every bin from oldest-tracked (0) to freshest
        // (num_bins), forwarding the aged-out tail to the next worker as we
        // go and saving what we received for reuse.
        for b in 0..=num_bins {
            let mut incoming = self.q_bin_in.recv().expect("bin ring disconnected");

            self.process_bin(
                &mut incoming,
                b,
                current,
                &mut batch_state,
                &mut admitted,
                &mut outgoing_bins,
            );
            self.process_bin(
                &mut new_request_bins[b],
                b,
                current,
                &mut batch_state,
                &mut admitted,
                &mut outgoing_bins,
            );

            if b >= batch_size as usize {
                let outgoing = std::mem::take(&mut outgoing_bins[b - batch_size as usize]);
                self.q_bin_out.send(outgoing).expect("bin ring disconnected");
            }

            temporary_bins.push(incoming);
        }

        // Step 7: output loop, paced to wall clock every 4 timeslots.
        for (t, slot) in admitted.iter().enumerate() {
            if t % 4 == 0 {
                self.pace_to(current + t as u64);
                holds_token = self.service_urgent_while_pacing(holds_token, &mut new_request_bins);
            }
            self.q_admitted_out.send(slot.clone()).expect("admitted-output ring disconnected");
            batch_state.allowed_mask <<= 1;
        }
        for a in admitted {
            self.admitted_mempool.put(a);
        }

        // Step 8: relinquish headship.
        if holds_token {
            self.q_urgent_out.send(UrgentMsg::Token).expect("urgent ring disconnected");
            holds_token = false;
        }

        // Step 9: the catch-all bin can legitimately accumulate very old
        // flows mid-batch; fold any residual into its outgoing counterpart.
        let mut residual = std::mem::take(&mut new_request_bins[0]);
        outgoing_bins[0].append(&mut residual);
        self.bin_mempool.put(residual);
        for bin in new_request_bins {
            self.bin_mempool.put(bin);
        }

        // Step 10: hand the freshest `batch_size` outgoing bins to the next
        // worker; older ones were already forwarded in the step 6 loop.
        for b in (num_bins + 1 - batch_size as usize)..=num_bins {
            let bin = std::mem::take(&mut outgoing_bins[b]);
            self.q_bin_out.send(bin).expect("bin ring disconnected");
        }
        for bin in outgoing_bins {
            self.bin_mempool.put(bin);
        }

        // Step 11: bins received this batch go back to the pool.
        for bin in temporary_bins {
            self.bin_mempool.put(bin);
        }

        // Step 12: tile forward.
        self.logical_timeslot += batch_size as u64 * config.n_admission_cores as u64;

        holds_token
    }

    /// Tries to admit every flow in `bin`; anything left over (backlog
    /// remains after the batch's timeslots are exhausted) is re-bucketed,
    /// via an urgent retry if its new bin has already been passed this
    /// batch, or left for the normal bin walk otherwise.
    fn process_bin(
        &self,
        bin: &mut Bin,
        bin_index: usize,
        current: u64,
        batch_state: &mut BatchState,
        admitted: &mut [AdmittedTraffic],
        outgoing_bins: &mut [Bin],
    ) {
        while let Some((src, dst)) = bin.pop() {
            self.try_allocate(src, dst, current, batch_state, admitted, bin_index, outgoing_bins);
        }
    }

    /// §4.3.4: drains as much of the flow's backlog as this batch's
    /// remaining capacity allows.
    fn try_allocate(
        &self,
        src: NodeId,
        dst: NodeId,
        current: u64,
        batch_state: &mut BatchState,
        admitted: &mut [AdmittedTraffic],
        bin_index: usize,
        outgoing_bins: &mut [Bin],
    ) {
        loop {
            if self.flow_table.backlog(src, dst) == 0 {
                return;
            }
            let Some(t) = batch_state.allocate(src, dst) else {
                break;
            };
            admitted[t as usize].push(src, dst);
            self.flow_table.set_last_alloc(src, dst, current + t as u64);
            self.flow_table.consume_one(src, dst);
        }

        if self.flow_table.backlog(src, dst) == 0 {
            return;
        }

        let last = self.flow_table.last_alloc(src, dst);
        let gap = (current + self.config.batch_size as u64).saturating_sub(last);
        let next_bin = bin_index_for_gap(gap, self.config.batch_size, self.config.num_bins);

        // Always re-bucket the remaining backlog, or it's silently dropped
        // (§8 backlog conservation). The urgent ring is only a fast path so
        // a younger bin that already went by this batch gets another shot
        // before this worker's next pass reaches it.
        outgoing_bins[next_bin].push(src, dst);

        if next_bin < bin_index {
            let msg = UrgentMsg::Retry { bin_index: next_bin, src, dst };
            if self.q_urgent_out.try_send(msg).is_err() {
                debug!("worker {}: urgent ring full, spinning to retry ({src:?},{dst:?})", self.id);
                while self.q_urgent_out.send(msg).is_err() {
                    thread::yield_now();
                }
            }
        }
    }

    fn pace_to(&self, timeslot: u64) {
        let target_ns = timeslot * self.config.timeslot_len_ns;
        loop {
            match Timestamp::try_now_ns() {
                Ok(now) if now >= target_ns => return,
                _ => thread::sleep(Duration::from_micros(1)),
            }
        }
    }

    fn service_urgent_while_pacing(&self, holds_token: bool, new_request_bins: &mut [Bin]) -> bool {
        let mut holds_token = holds_token;
        loop {
            match self.q_urgent_in.recv_timeout(Duration::from_micros(50)) {
                Ok(UrgentMsg::Token) => {
                    holds_token = true;
                    break;
                }
                Ok(UrgentMsg::Retry { bin_index, src, dst }) => {
                    new_request_bins[bin_index].push(src, dst);
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    panic!("urgent ring disconnected while pacing")
                }
            }
        }
        holds_token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_index_matches_published_test_vectors() {
        assert_eq!(bin_index_for_gap(8, 8, 64), 64);
        assert_eq!(bin_index_for_gap(9, 8, 64), 63);
        assert_eq!(bin_index_for_gap(16, 8, 64), 56);
    }

    #[test]
    fn bin_index_matches_folded_group_test_vectors() {
        // Past num_bins=64, gaps fold 2-to-1, then 4-to-1, then 8-to-1,
        // per the bit-trick fold in `bin_index_from_timeslot`.
        assert_eq!(bin_index_for_gap(66, 8, 64), 7);
        assert_eq!(bin_index_for_gap(67, 8, 64), 6);
        assert_eq!(bin_index_for_gap(72, 8, 64), 4);
        assert_eq!(bin_index_for_gap(73, 8, 64), 3);
        assert_eq!(bin_index_for_gap(88, 8, 64), 1);
        assert_eq!(bin_index_for_gap(89, 8, 64), 0);
        assert_eq!(bin_index_for_gap(176, 8, 64), 0);
    }

    #[test]
    fn bin_index_is_monotonically_non_increasing_in_gap() {
        let mut prev = bin_index_for_gap(1, 8, 64);
        for gap in 2..2000u64 {
            let cur = bin_index_for_gap(gap, 8, 64);
            assert!(cur <= prev, "gap={gap} produced {cur} > previous {prev}");
            prev = cur;
        }
    }

    #[test]
    fn bin_index_eventually_reaches_catch_all() {
        assert_eq!(bin_index_for_gap(1_000_000, 8, 64), 0);
    }

    #[test]
    fn single_worker_matching_scenario() {
        // Mirrors the reference fixed-point scenario: three flows with
        // backlog 3, 2, and 1, admitted against a single batch of 8
        // timeslots with no rack oversubscription.
        let flow_table = FlowTable::new();
        let (s0, d1, d2, s2) = (NodeId::new(0), NodeId::new(1), NodeId::new(2), NodeId::new(2));
        flow_table.add_backlog(s0, d1, 3);
        flow_table.add_backlog(s0, d2, 2);
        flow_table.add_backlog(s2, d1, 1);

        let mut batch_state = BatchState::new(8, false, u16::MAX, u16::MAX);
        let mut admitted: Vec<AdmittedTraffic> = (0..8)
            .map(|t| {
                let mut a = AdmittedTraffic::with_capacity(4);
                a.clear(t);
                a
            })
            .collect();

        for &(src, dst) in &[(s0, d1), (s0, d2), (s2, d1)] {
            loop {
                if flow_table.backlog(src, dst) == 0 {
                    break;
                }
                match batch_state.allocate(src, dst) {
                    Some(t) => {
                        admitted[t as usize].push(src, dst);
                        flow_table.consume_one(src, dst);
                    }
                    None => break,
                }
            }
        }

        assert_eq!(admitted[0].pairs(), &[(s0, d1)]);
        let mut t1 = admitted[1].pairs().to_vec();
        t1.sort();
        assert_eq!(t1, vec![(s0, d2), (s2, d1)]);
        assert_eq!(admitted[2].pairs(), &[(s0, d1)]);
        assert_eq!(admitted[3].pairs(), &[(s0, d2)]);
        for slot in &admitted[4..] {
            assert!(slot.pairs().is_empty());
        }
    }
}
