use thiserror::Error;

/// Failures the arbiter surfaces as typed `Result`s. Per §7, most pipeline
/// error conditions (mempool exhaustion, ring-full) are retried in place and
/// only counted; they never reach here. What does reach here are conditions
/// a caller outside the pipeline needs to react to.
#[derive(Debug, Error)]
pub enum ArbiterError {
    #[error("no connection registered for endpoint {0:?}")]
    UnknownEndpoint(fastpass_shared::NodeId),

    #[error("reliability protocol error: {0}")]
    Protocol(#[from] fastpass_shared::protocol::ProtocolError),

    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}
