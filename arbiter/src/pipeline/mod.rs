//! The admission pipeline (§4.3): a ring of worker threads that turns
//! per-flow backlog into per-timeslot matchings.

mod admitted;
mod batch_state;
mod bin;
mod flow_table;
mod mempool;
mod worker;

pub use admitted::AdmittedTraffic;
pub use bin::Bin;
pub use flow_table::FlowTable;
pub use mempool::Mempool;
pub use worker::{bin_index_for_gap, HeadEntry, UrgentMsg, Worker};

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use crate::config::AdmissionConfig;

/// A running ring of admission workers plus the two rings the control plane
/// touches directly: new demand in, finished matchings out.
pub struct Pipeline {
    pub q_head_tx: Sender<HeadEntry>,
    pub q_admitted_rx: Receiver<AdmittedTraffic>,
    pub flow_table: Arc<FlowTable>,
    worker_threads: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn spawn(config: AdmissionConfig) -> Self {
        config.validate();
        let n = config.n_admission_cores;
        let flow_table = Arc::new(FlowTable::new());

        let (q_head_tx, q_head_rx) = crossbeam_channel::bounded(config.ring_capacity);
        let (q_admitted_tx, q_admitted_rx) = crossbeam_channel::bounded(config.ring_capacity);

        let bin_channels: Vec<(Sender<Bin>, Receiver<Bin>)> =
            (0..n).map(|_| crossbeam_channel::bounded(config.ring_capacity)).collect();
        let urgent_channels: Vec<(Sender<UrgentMsg>, Receiver<UrgentMsg>)> =
            (0..n).map(|_| crossbeam_channel::bounded(config.ring_capacity.max(2))).collect();

        // Seed the ring: worker 0 starts as a follower and immediately
        // receives the token in its urgent ring; every bin slot begins
        // empty, injected as `batch_size` bins per worker before the ring
        // starts turning.
        urgent_channels[0]
            .0
            .send(UrgentMsg::Token)
            .expect("freshly created urgent ring cannot be full");
        for (tx, _) in &bin_channels {
            for _ in 0..=config.num_bins {
                tx.send(Bin::with_capacity(config.ring_capacity))
                    .expect("freshly created bin ring cannot be full");
            }
        }

        let mut worker_threads = Vec::with_capacity(n);
        for i in 0..n {
            let next = (i + 1) % n;
            let worker = Worker::new(
                i,
                config,
                Arc::clone(&flow_table),
                bin_channels[i].1.clone(),
                bin_channels[next].0.clone(),
                urgent_channels[i].1.clone(),
                urgent_channels[next].0.clone(),
                q_head_rx.clone(),
                q_admitted_tx.clone(),
            );
            worker_threads.push(
                thread::Builder::new()
                    .name(format!("fastpass-admission-{i}"))
                    .spawn(move || worker.run(false))
                    .expect("failed to spawn admission worker thread"),
            );
        }

        Pipeline { q_head_tx, q_admitted_rx, flow_table, worker_threads }
    }

    /// Enqueues `amount` timeslots of backlog for `(src, dst)`, waking the
    /// pipeline via `q_head` the first time this flow goes from idle to
    /// backlogged (§6 "Ingress to the admission core").
    pub fn add_backlog(&self, src: fastpass_shared::NodeId, dst: fastpass_shared::NodeId, amount: u32) {
        if self.flow_table.add_backlog(src, dst, amount) {
            self.q_head_tx.send(HeadEntry { src, dst }).expect("q_head disconnected");
        }
    }

    /// Blocks until every worker thread has exited. Workers never return in
    /// normal operation; this is here for orderly shutdown in tests and for
    /// propagating a worker panic to the caller instead of losing it.
    pub fn join(self) {
        for handle in self.worker_threads {
            let _ = handle.join();
        }
    }
}
