/// A logical timeslot index. Timeslots are counted from an arbitrary epoch and
/// wrap through the full 64-bit space; comparisons must use signed wrapping
/// arithmetic rather than plain `<`/`>`.
pub type Timeslot = u64;

/// Full 64-bit internal sequence number used by the reliability protocol.
/// Only the low 16 bits travel on the wire; see `protocol::packet`.
pub type SeqNo = u64;

/// A nanosecond timestamp, monotonic where noted.
pub type TimeNs = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostType {
    Arbiter,
    Endpoint,
}

impl HostType {
    pub fn invert(self) -> Self {
        match self {
            HostType::Arbiter => HostType::Endpoint,
            HostType::Endpoint => HostType::Arbiter,
        }
    }
}
