use std::time::SystemTime;

/// Error type for timestamp operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeError {
    /// System time is before UNIX epoch
    SystemTimeBeforeEpoch,
}

impl std::fmt::Display for TimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeError::SystemTimeBeforeEpoch => {
                write!(f, "System time is before UNIX epoch")
            }
        }
    }
}

impl std::error::Error for TimeError {}

pub struct Timestamp;

impl Timestamp {
    /// Returns the current timestamp in nanoseconds since UNIX epoch, the
    /// unit the reliability protocol and admission pipeline time everything
    /// in.
    pub fn try_now_ns() -> Result<u64, TimeError> {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .map_err(|_| TimeError::SystemTimeBeforeEpoch)
    }
}
