//! # Fastpass Arbiter
//! The centralized timeslot arbiter: a pipelined admission scheduler
//! (`pipeline`) feeding per-endpoint reliability connections (`connection`)
//! that speak the wire protocol defined in `fastpass-shared`.

#![deny(trivial_casts, trivial_numeric_casts, unstable_features, unused_import_braces)]

pub mod config;
pub mod connection;
pub mod error;
pub mod pipeline;

pub use config::AdmissionConfig;
pub use connection::ArbiterConnection;
pub use error::ArbiterError;
pub use pipeline::Pipeline;
