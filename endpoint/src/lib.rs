//! # Fastpass Endpoint
//! The per-host traffic shaper: a flow table and request/grant/advance
//! state machine (`shaper`) driven by a reliability connection
//! (`connection`) that speaks the wire protocol defined in
//! `fastpass-shared`.

#![deny(trivial_casts, trivial_numeric_casts, unstable_features, unused_import_braces)]

pub mod config;
pub mod connection;
pub mod error;
pub mod flow;
pub mod shaper;

pub use config::ShaperConfig;
pub use connection::EndpointConnection;
pub use error::EndpointError;
pub use shaper::Shaper;
