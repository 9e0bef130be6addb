//! Error-handling coverage for `ArbiterError`: each variant's `Display`
//! text, and the `From` conversions that let `?` propagate protocol and I/O
//! failures up through the arbiter's public API.

use fastpass_arbiter::ArbiterError;
use fastpass_shared::protocol::ProtocolError;
use fastpass_shared::NodeId;

// ========== Display ==========

#[test]
fn unknown_endpoint_message_names_the_node() {
    let err = ArbiterError::UnknownEndpoint(NodeId::new(12));
    let msg = format!("{err}");
    assert!(msg.contains("12"), "message was: {msg}");
}

#[test]
fn protocol_error_message_wraps_the_inner_display() {
    let err: ArbiterError = ProtocolError::BadChecksum.into();
    assert_eq!(format!("{err}"), "reliability protocol error: checksum mismatch");
}

#[test]
fn io_error_message_wraps_the_inner_display() {
    let io = std::io::Error::new(std::io::ErrorKind::WouldBlock, "no data");
    let err: ArbiterError = io.into();
    assert!(format!("{err}").starts_with("socket I/O error:"));
}

// ========== From conversions ==========

#[test]
fn protocol_error_converts_via_question_mark() {
    fn returns_err() -> Result<(), ArbiterError> {
        Err(ProtocolError::PacketTooShort { len: 1 })?;
        Ok(())
    }
    assert!(matches!(returns_err(), Err(ArbiterError::Protocol(_))));
}

#[test]
fn io_error_converts_via_question_mark() {
    fn returns_err() -> Result<(), ArbiterError> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))?;
        Ok(())
    }
    assert!(matches!(returns_err(), Err(ArbiterError::Io(_))));
}

// ========== Debug ==========

#[test]
fn unknown_endpoint_debug_is_not_empty() {
    let err = ArbiterError::UnknownEndpoint(NodeId::new(3));
    assert!(!format!("{err:?}").is_empty());
}
