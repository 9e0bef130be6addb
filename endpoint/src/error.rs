use thiserror::Error;

/// Failures the shaper surfaces as typed `Result`s. Invariant violations
/// here (per §4.4.6) are handled by forcing a reset rather than propagating
/// further, but are still constructed as typed errors so the reset path can
/// log *why* it fired.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("grant invariant violated: alloc ({alloc}) would exceed demand ({demand}) for {dst:?}")]
    AllocExceedsDemand { dst: fastpass_shared::NodeId, alloc: u64, demand: u64 },

    #[error("alloc-report invariant violated: reported {reported} exceeds requested {requested} for {dst:?}")]
    ReportExceedsRequested { dst: fastpass_shared::NodeId, reported: u64, requested: u64 },

    #[error("reliability protocol error: {0}")]
    Protocol(#[from] fastpass_shared::protocol::ProtocolError),

    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}
