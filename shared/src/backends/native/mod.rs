mod timestamp;

pub use timestamp::{TimeError, Timestamp};
