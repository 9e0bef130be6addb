//! # Fastpass Shared
//! Primitives shared between the `fastpass-arbiter` and `fastpass-endpoint`
//! crates: the sliding-window and bigmap bitmap structures, the reliable
//! control-protocol wire format and connection state machine, the request
//! pacer, and the node-addressing/config types both sides agree on.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

#[macro_use]
extern crate cfg_if;
extern crate core;

mod backends;
mod bigmap;
pub mod config;
pub mod jhash;
mod node;
mod pacer;
pub mod protocol;
mod types;
mod window;

pub use backends::{TimeError, Timestamp};
pub use bigmap::Bigmap;
pub use node::{rack, NodeId, MAX_NODES, NODES_PER_RACK, NUM_RACKS, OUT_OF_BOUNDARY};
pub use pacer::Pacer;
pub use types::{HostType, SeqNo, TimeNs, Timeslot};
pub use window::{Window, WindowError};
