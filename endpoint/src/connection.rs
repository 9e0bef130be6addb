//! The endpoint's wrapper around the reliability protocol connection
//! (§4.2), symmetric to the arbiter's `ArbiterConnection` but payload-
//! reversed: the endpoint sends A-REQ and receives ALLOC, plus the
//! occasional A-REQ-shaped alloc-report the arbiter sends back (§4.4.5).
//! Callbacks drive the shaper directly since both live behind the same
//! lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use fastpass_shared::config::ProtocolConfig;
use fastpass_shared::protocol::{
    nearest, AllocPayload, AreqEntry, Connection, ConnectionCallbacks, OutgoingPayload,
    PacketDescriptor, ProtocolError,
};
use fastpass_shared::NodeId;

use crate::config::ShaperConfig;
use crate::error::EndpointError;
use crate::shaper::Shaper;

/// State the host's event loop reads without holding the connection lock.
pub struct ConnShared {
    next_timer_deadline_ns: AtomicU64,
    wants_send: AtomicBool,
}

impl ConnShared {
    fn new() -> Self {
        ConnShared { next_timer_deadline_ns: AtomicU64::new(0), wants_send: AtomicBool::new(false) }
    }
}

struct EndpointCallbacks {
    shaper: Arc<Mutex<Shaper>>,
    shared: Arc<ConnShared>,
}

impl ConnectionCallbacks for EndpointCallbacks {
    fn handle_reset(&mut self) {
        self.shaper.lock().force_reset();
    }

    fn handle_ack(&mut self, pd: PacketDescriptor) {
        if let OutgoingPayload::AReq(entries) = pd.payload {
            let mut shaper = self.shaper.lock();
            for e in entries {
                shaper.ack_requested(fastpass_shared::NodeId::new(e.dst), u64::from(e.cumulative_tslots));
            }
        }
    }

    fn handle_neg_ack(&mut self, pd: &PacketDescriptor) {
        // A lost A-REQ is simply resent on the next pacer-triggered request.
        if let OutgoingPayload::AReq(entries) = &pd.payload {
            let mut shaper = self.shaper.lock();
            for e in entries {
                shaper.requeue_unrequested(fastpass_shared::NodeId::new(e.dst));
            }
            shaper.trigger_request_pacer(pd.sent_timestamp);
        }
    }

    fn handle_alloc(&mut self, alloc: &AllocPayload) {
        let mut shaper = self.shaper.lock();
        if let Err(e) = shaper.handle_alloc(alloc) {
            warn!("ALLOC violated an invariant, forcing reset: {e}");
            shaper.force_reset();
            drop(shaper);
            self.shared.wants_send.store(true, Ordering::Release);
        }
    }

    /// The arbiter reuses the A-REQ wire shape to periodically report "total
    /// allocated so far" per destination (§4.4.5). Each entry's cumulative
    /// count is reconstructed relative to the flow's current `alloc` and fed
    /// to the shaper's reconciliation path; a violation forces a reset the
    /// same way a bad ALLOC does.
    fn handle_areq(&mut self, entries: &[AreqEntry]) {
        let mut shaper = self.shaper.lock();
        for e in entries {
            let dst = NodeId::new(e.dst);
            let hint = shaper.flow(dst).alloc.wrapping_sub(1 << 15);
            let report = nearest(hint, u64::from(e.cumulative_tslots), 16);
            if let Err(err) = shaper.reconcile_alloc_report(dst, report) {
                warn!("alloc-report violated an invariant, forcing reset: {err}");
                shaper.force_reset();
                drop(shaper);
                self.shared.wants_send.store(true, Ordering::Release);
                return;
            }
        }
    }

    fn trigger_request(&mut self) {
        self.shared.wants_send.store(true, Ordering::Release);
    }

    fn set_timer(&mut self, deadline_ns: u64) {
        self.shared.next_timer_deadline_ns.store(deadline_ns.max(1), Ordering::Release);
    }

    fn cancel_timer(&mut self) {
        self.shared.next_timer_deadline_ns.store(0, Ordering::Release);
    }
}

/// An endpoint's connection to the arbiter: the reliability protocol plus
/// the shaper it drives. `handle_rx_packet`/`tick` serialize on an internal
/// lock; the shaper's own lock is taken inside the connection's, never the
/// reverse, so there is no lock-ordering hazard between the two.
pub struct EndpointConnection {
    shared: Arc<ConnShared>,
    shaper: Arc<Mutex<Shaper>>,
    inner: Mutex<Connection<EndpointCallbacks>>,
}

impl EndpointConnection {
    pub fn new(
        protocol_config: ProtocolConfig,
        shaper_config: ShaperConfig,
        saddr: u32,
        daddr: u32,
        now: u64,
        initial_timeslot: u64,
    ) -> Self {
        let shared = Arc::new(ConnShared::new());
        let shaper = Arc::new(Mutex::new(Shaper::new(shaper_config, initial_timeslot)));
        let callbacks = EndpointCallbacks { shaper: Arc::clone(&shaper), shared: Arc::clone(&shared) };
        let inner = Connection::new(false, protocol_config, saddr, daddr, now, callbacks);
        EndpointConnection { shared, shaper, inner: Mutex::new(inner) }
    }

    pub fn handle_rx_packet(&self, pkt: &[u8], now: u64) -> Result<(), ProtocolError> {
        self.inner.lock().handle_rx_packet(pkt, now)
    }

    pub fn handle_timeout(&self, now: u64) {
        self.inner.lock().handle_timeout(now);
    }

    pub fn enqueue_packet(&self, dst: fastpass_shared::NodeId, now: u64) {
        let mut shaper = self.shaper.lock();
        shaper.enqueue_packet(dst);
        if shaper.trigger_request_pacer(now) {
            self.shared.wants_send.store(true, Ordering::Release);
        }
    }

    /// Timeslot-advance tick (§4.4.4): advances the shaper's clock. A large
    /// backwards jump discards the schedule rather than replaying history
    /// and asks the host to send a fresh request on the next pacer cycle.
    pub fn tick(&self, now_tslot: u64) {
        let must_reset = self.shaper.lock().update_current_timeslot(now_tslot);
        if must_reset {
            self.shaper.lock().force_reset();
            self.shared.wants_send.store(true, Ordering::Release);
        }
    }

    pub fn set_device_backlog_ns(&self, ns: u64) {
        self.shaper.lock().set_device_backlog_ns(ns);
    }

    pub fn current_timeslot(&self) -> u64 {
        self.shaper.lock().current_timeslot()
    }

    /// Builds and sends a request packet if the pacer has an event due.
    /// Returns the encoded length, or `None` if there was nothing to send.
    pub fn send_request_if_due(
        &self,
        now: u64,
        buf: &mut [u8],
        min_size: usize,
    ) -> Result<Option<usize>, EndpointError> {
        let due = {
            let shaper = self.shaper.lock();
            shaper.request_pacer_deadline().is_some_and(|d| now >= d)
        };
        if !due {
            return Ok(None);
        }
        let entries = {
            let mut shaper = self.shaper.lock();
            shaper.request_pacer_fired();
            shaper.build_areq()
        };
        if entries.is_empty() {
            return Ok(None);
        }

        let mut conn = self.inner.lock();
        conn.prepare_to_send();
        let pd = conn.commit_packet(OutgoingPayload::AReq(entries), now);
        let n = conn.encode_packet(&pd, buf, min_size)?;
        Ok(Some(n))
    }

    /// Sends an empty A-REQ purely to carry the reset handshake (piggybacked
    /// on every packet's header) when `trigger_request` fired but no flow
    /// has fresh demand to report yet.
    pub fn send_control_packet(&self, now: u64, buf: &mut [u8], min_size: usize) -> Result<usize, EndpointError> {
        let mut conn = self.inner.lock();
        conn.prepare_to_send();
        let pd = conn.commit_packet(OutgoingPayload::AReq(Vec::new()), now);
        Ok(conn.encode_packet(&pd, buf, min_size)?)
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
