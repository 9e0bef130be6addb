//! One `AdmittedTraffic` record per finished timeslot: the set of
//! `(src, dst)` pairs admitted to transmit, handed to the control plane via
//! `q_admitted_out` (§6).

use fastpass_shared::{NodeId, MAX_NODES};

#[derive(Debug, Default, Clone)]
pub struct AdmittedTraffic {
    pub timeslot: u64,
    pairs: Vec<(NodeId, NodeId)>,
}

impl AdmittedTraffic {
    pub fn with_capacity(capacity: usize) -> Self {
        AdmittedTraffic { timeslot: 0, pairs: Vec::with_capacity(capacity) }
    }

    pub fn clear(&mut self, timeslot: u64) {
        self.timeslot = timeslot;
        self.pairs.clear();
    }

    pub fn push(&mut self, src: NodeId, dst: NodeId) {
        debug_assert!(self.pairs.len() < MAX_NODES as usize);
        self.pairs.push((src, dst));
    }

    pub fn size(&self) -> usize {
        self.pairs.len()
    }

    pub fn pairs(&self) -> &[(NodeId, NodeId)] {
        &self.pairs
    }
}
