//! Tunables for the shaper (§6's configuration table and §4.4). Built the
//! same way `fastpass_shared::config` is: a plain `Default`-able struct
//! overridden field by field.

use fastpass_shared::config::PacerConfig;

#[derive(Debug, Clone, Copy)]
pub struct ShaperConfig {
    /// Request pacer parameters: minimum average spacing, burst credit, and
    /// minimum gap between two request packets.
    pub request_pacer: PacerConfig,

    /// Timeslots behind current before a grant is discarded as too late.
    pub miss_threshold: u64,
    /// Device transmit backlog, in nanoseconds, above which the timeslot
    /// advance tick pauses moving packets to the egress queue.
    pub max_dev_backlog_ns: u64,
    /// Maximum timeslots in the future a grant may name before it is
    /// discarded as premature.
    pub max_preload: u64,
    /// How often `update_current_timeslot` is invoked.
    pub update_timeslot_timer_ns: u64,
    /// Length of one timeslot in nanoseconds; used to convert wall-clock
    /// time into a timeslot index.
    pub timeslot_len_ns: u64,
    /// Timeslots the clock may move backwards before a reset is forced
    /// rather than attempting to replay history.
    pub clock_move_reset_threshold_tslots: u64,
}

impl Default for ShaperConfig {
    fn default() -> Self {
        ShaperConfig {
            request_pacer: PacerConfig::default(),
            miss_threshold: 64,
            max_dev_backlog_ns: 1_000_000,
            max_preload: 256,
            update_timeslot_timer_ns: 1_000_000,
            timeslot_len_ns: 10_240,
            clock_move_reset_threshold_tslots: 64,
        }
    }
}
