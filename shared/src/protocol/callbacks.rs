//! Host hooks invoked by the connection state machine. The protocol itself
//! never touches flow tables, timers, or sockets directly; it only calls
//! back into whatever owns it.

use super::packet::{AllocPayload, AreqEntry};
use super::pktdesc::PacketDescriptor;

/// Implemented by whatever embeds a `Connection` (the arbiter's per-endpoint
/// connection handler, or the endpoint's shaper).
pub trait ConnectionCallbacks {
    /// A reset was accepted; all previously committed packets were
    /// implicitly NACKed.
    fn handle_reset(&mut self);

    /// `pd` was acknowledged by the peer. Ownership of `pd` transfers to
    /// the callback.
    fn handle_ack(&mut self, pd: PacketDescriptor);

    /// `pd` is presumed lost (timeout or explicit fall-off). The
    /// descriptor remains owned by the connection until a later ack or
    /// fall-off frees it.
    fn handle_neg_ack(&mut self, pd: &PacketDescriptor);

    /// An ALLOC payload was received (arbiter -> endpoint only).
    fn handle_alloc(&mut self, alloc: &AllocPayload);

    /// An A-REQ-shaped payload was received: a demand request at the
    /// arbiter (endpoint -> arbiter), or a periodic alloc-report at the
    /// endpoint (arbiter -> endpoint, reusing the same wire shape).
    fn handle_areq(&mut self, entries: &[AreqEntry]);

    /// The host should send a request/response packet soon (e.g. because a
    /// reset forced new state to propagate).
    fn trigger_request(&mut self);

    /// Arm the retransmission timer for `deadline_ns`.
    fn set_timer(&mut self, deadline_ns: u64);

    /// Disarm the retransmission timer.
    fn cancel_timer(&mut self);
}
