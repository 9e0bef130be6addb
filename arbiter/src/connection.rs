//! The arbiter's per-endpoint wrapper around the reliability protocol
//! connection (§4.2, §5). One instance per endpoint the arbiter has ever
//! heard from; callbacks translate A-REQ demand reports into admission-
//! pipeline backlog and expose the timer/send-trigger state the host's
//! socket loop needs to drive `handle_timeout` and packet sends.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use log::warn;
use parking_lot::Mutex;

use fastpass_shared::config::ProtocolConfig;
use fastpass_shared::protocol::{
    AllocPayload, AllocTslot, AreqEntry, Connection, ConnectionCallbacks, OutgoingPayload,
    PacketDescriptor, ProtocolError,
};
use fastpass_shared::{NodeId, MAX_NODES};

use crate::pipeline::{FlowTable, HeadEntry};

/// State the host's event loop needs to read without holding the
/// connection's own lock: when to next call `handle_timeout`, and whether a
/// reset forced a send that hasn't gone out yet.
pub struct ConnShared {
    next_timer_deadline_ns: AtomicU64,
    wants_send: AtomicBool,
}

impl ConnShared {
    fn new() -> Self {
        ConnShared {
            next_timer_deadline_ns: AtomicU64::new(0),
            wants_send: AtomicBool::new(false),
        }
    }
}

struct ArbiterCallbacks {
    src: NodeId,
    flow_table: Arc<FlowTable>,
    q_head_tx: Sender<HeadEntry>,
    /// Last cumulative A-REQ count seen per destination, so a fresh A-REQ's
    /// absolute count can be turned into a backlog delta.
    last_areq_cumulative: Vec<u16>,
    shared: Arc<ConnShared>,
}

impl ConnectionCallbacks for ArbiterCallbacks {
    fn handle_reset(&mut self) {
        self.flow_table.reset_node_backlog(self.src);
        self.last_areq_cumulative.iter_mut().for_each(|c| *c = 0);
    }

    fn handle_ack(&mut self, _pd: PacketDescriptor) {}

    fn handle_neg_ack(&mut self, _pd: &PacketDescriptor) {
        // A lost ALLOC is recovered by the endpoint's alloc-report
        // reconciliation (§4.4.5), not by the arbiter retransmitting the
        // grant itself.
    }

    fn handle_alloc(&mut self, _alloc: &AllocPayload) {
        warn!("node {:?}: received an ALLOC payload at the arbiter; endpoints never send these", self.src);
    }

    fn handle_areq(&mut self, entries: &[AreqEntry]) {
        for entry in entries {
            if entry.dst >= MAX_NODES {
                warn!("node {:?}: A-REQ named out-of-range dst {}", self.src, entry.dst);
                continue;
            }
            let dst = NodeId::new(entry.dst);
            let idx = dst.index();
            let prev = self.last_areq_cumulative[idx];
            let delta = entry.cumulative_tslots.saturating_sub(prev);
            self.last_areq_cumulative[idx] = entry.cumulative_tslots;
            if delta == 0 {
                continue;
            }
            if self.flow_table.add_backlog(self.src, dst, u32::from(delta)) {
                let _ = self.q_head_tx.send(HeadEntry { src: self.src, dst });
            }
        }
    }

    fn trigger_request(&mut self) {
        self.shared.wants_send.store(true, Ordering::Release);
    }

    fn set_timer(&mut self, deadline_ns: u64) {
        // 0 is the "disarmed" sentinel; nudge a genuine zero deadline to 1
        // so it is never confused with "no timer armed".
        self.shared.next_timer_deadline_ns.store(deadline_ns.max(1), Ordering::Release);
    }

    fn cancel_timer(&mut self) {
        self.shared.next_timer_deadline_ns.store(0, Ordering::Release);
    }
}

/// An arbiter-side connection to one endpoint node. `handle_rx_packet` and
/// `handle_timeout` serialize on an internal lock, matching the reference's
/// per-connection locking policy (§5).
pub struct ArbiterConnection {
    pub node: NodeId,
    shared: Arc<ConnShared>,
    flow_table: Arc<FlowTable>,
    inner: Mutex<Connection<ArbiterCallbacks>>,
}

impl ArbiterConnection {
    pub fn new(
        node: NodeId,
        config: ProtocolConfig,
        saddr: u32,
        daddr: u32,
        now: u64,
        flow_table: Arc<FlowTable>,
        q_head_tx: Sender<HeadEntry>,
    ) -> Self {
        let shared = Arc::new(ConnShared::new());
        let callbacks = ArbiterCallbacks {
            src: node,
            flow_table: Arc::clone(&flow_table),
            q_head_tx,
            last_areq_cumulative: vec![0; MAX_NODES as usize],
            shared: Arc::clone(&shared),
        };
        let inner = Connection::new(true, config, saddr, daddr, now, callbacks);
        ArbiterConnection { node, shared, flow_table, inner: Mutex::new(inner) }
    }

    pub fn handle_rx_packet(&self, pkt: &[u8], now: u64) -> Result<(), ProtocolError> {
        self.inner.lock().handle_rx_packet(pkt, now)
    }

    pub fn handle_timeout(&self, now: u64) {
        self.inner.lock().handle_timeout(now);
    }

    /// Encodes and commits an ALLOC packet for this connection, per
    /// §4.2.4/§4.2.1. `tslots` must already be in the compact
    /// `(dst_index, gap)` form the wire format uses.
    pub fn commit_alloc(
        &self,
        base_tslot: u32,
        dsts: Vec<u16>,
        tslots: Vec<AllocTslot>,
        now: u64,
        buf: &mut [u8],
        min_size: usize,
    ) -> Result<usize, ProtocolError> {
        let mut conn = self.inner.lock();
        conn.prepare_to_send();
        let payload = OutgoingPayload::Alloc(AllocPayload { base_tslot, dsts, tslots });
        let pd = conn.commit_packet(payload, now);
        conn.encode_packet(&pd, buf, min_size)
    }

    /// Builds and commits a periodic alloc-report packet (§4.4.5): an
    /// A-REQ-shaped payload whose entries carry each destination's running
    /// "total timeslots allocated so far", truncated to the wire's 16 bits
    /// for the endpoint to reconstruct against its own `alloc`. Returns
    /// `None` if this node has no nonzero total to report yet.
    pub fn commit_alloc_report(
        &self,
        now: u64,
        buf: &mut [u8],
        min_size: usize,
    ) -> Result<Option<usize>, ProtocolError> {
        let totals = self.flow_table.total_alloc_entries(self.node, fastpass_shared::config::MAX_AREQ);
        if totals.is_empty() {
            return Ok(None);
        }
        let entries = totals
            .into_iter()
            .map(|(dst, total)| AreqEntry { dst: u16::from(dst), cumulative_tslots: total as u16 })
            .collect();
        let mut conn = self.inner.lock();
        conn.prepare_to_send();
        let pd = conn.commit_packet(OutgoingPayload::AReq(entries), now);
        conn.encode_packet(&pd, buf, min_size).map(Some)
    }

    pub fn next_timer_deadline_ns(&self) -> Option<u64> {
        match self.shared.next_timer_deadline_ns.load(Ordering::Acquire) {
            0 => None,
            ns => Some(ns),
        }
    }

    pub fn take_wants_send(&self) -> bool {
        self.shared.wants_send.swap(false, Ordering::AcqRel)
    }

    pub fn in_sync(&self) -> bool {
        self.inner.lock().in_sync()
    }
}
