//! Tunables shared by both sides of a connection (§6 of the design). Built
//! the way the rest of the workspace builds configuration: plain structs
//! with a `Default` giving the reference constants, overridden field by
//! field rather than loaded from a file format.

/// Log2 of the reliability window length; actual capacity is
/// `(1 << wnd_log) - 64` committed-but-unacked packets.
pub const WND_LOG: u32 = 8;

/// Fixed offset added to `base_seqno` for endpoint-originated sequence
/// numbers, so the two directions of a connection never overlap.
pub const EGRESS_OFFSET: u64 = 0;

/// Fixed offset added to `base_seqno` for arbiter-originated sequence
/// numbers.
pub const INGRESS_OFFSET: u64 = 0xDEAD_BEEF;

/// Consecutive checksum failures before a reset is forced.
pub const BAD_PKT_RESET_THRESHOLD: u32 = 10;

/// Minimum time between two forced resets triggered by bad packets.
pub const RESET_WINDOW_NS: u64 = 1_000_000_000;

/// Maximum A-REQ demand records per endpoint packet.
pub const MAX_AREQ: usize = 15;

/// Maximum allocation descriptors per arbiter packet.
pub const MAX_ALLOC_DESCRIPTORS: usize = 64;

/// Size of the request window: how far ahead of `acked` a request may
/// advance `requested`, chosen to safely survive 16-bit wire wraparound
/// reconstruction.
pub const REQUEST_WINDOW: u64 = 8192;

/// How often the arbiter sends an endpoint an A-REQ-shaped alloc-report
/// (§4.4.5), so lost grants are caught well before the 16-bit wire counter
/// could wrap.
pub const ALLOC_REPORT_INTERVAL_NS: u64 = 100_000_000;

#[derive(Debug, Clone, Copy)]
pub struct ProtocolConfig {
    /// Window around "now" in which reset timestamps are accepted.
    pub rst_win_ns: u64,
    /// NACK timeout per committed packet.
    pub send_timeout_ns: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            rst_win_ns: 2_000_000_000,
            send_timeout_ns: 20_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PacerConfig {
    pub cost_ns: u64,
    pub max_credit_ns: u64,
    pub min_gap_ns: u64,
}

impl Default for PacerConfig {
    fn default() -> Self {
        PacerConfig {
            cost_ns: 2_000_000,
            max_credit_ns: 20_000_000,
            min_gap_ns: 200_000,
        }
    }
}
