use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("packet too short: {len} bytes, need at least 8")]
    PacketTooShort { len: usize },
    #[error("checksum mismatch")]
    BadChecksum,
    #[error("payload truncated while decoding a {kind} record")]
    IncompletePayload { kind: &'static str },
    #[error("encode buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    #[error("ALLOC destination index {index} out of bounds (n_dst={n_dst})")]
    AllocDstOutOfBounds { index: u8, n_dst: u8 },
    #[error("window operation failed: {0}")]
    Window(#[from] crate::window::WindowError),
}
