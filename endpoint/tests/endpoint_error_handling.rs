//! Error-handling coverage for `EndpointError`: the invariant-violation
//! variants the shaper raises before forcing a reset, plus the `From`
//! conversions shared with the arbiter side.

use fastpass_endpoint::EndpointError;
use fastpass_shared::protocol::ProtocolError;
use fastpass_shared::NodeId;

// ========== Display ==========

#[test]
fn alloc_exceeds_demand_message_names_the_numbers() {
    let err = EndpointError::AllocExceedsDemand { dst: NodeId::new(4), alloc: 10, demand: 8 };
    let msg = format!("{err}");
    assert!(msg.contains('4') || msg.contains("NodeId"), "message was: {msg}");
    assert!(msg.contains('10'));
    assert!(msg.contains('8'));
}

#[test]
fn report_exceeds_requested_message_names_the_numbers() {
    let err = EndpointError::ReportExceedsRequested { dst: NodeId::new(7), reported: 5, requested: 3 };
    let msg = format!("{err}");
    assert!(msg.contains('5'));
    assert!(msg.contains('3'));
}

#[test]
fn protocol_error_message_wraps_the_inner_display() {
    let err: EndpointError = ProtocolError::BadChecksum.into();
    assert_eq!(format!("{err}"), "reliability protocol error: checksum mismatch");
}

#[test]
fn io_error_message_wraps_the_inner_display() {
    let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer gone");
    let err: EndpointError = io.into();
    assert!(format!("{err}").starts_with("socket I/O error:"));
}

// ========== From conversions ==========

#[test]
fn protocol_error_converts_via_question_mark() {
    fn returns_err() -> Result<(), EndpointError> {
        Err(ProtocolError::PacketTooShort { len: 1 })?;
        Ok(())
    }
    assert!(matches!(returns_err(), Err(EndpointError::Protocol(_))));
}

#[test]
fn io_error_converts_via_question_mark() {
    fn returns_err() -> Result<(), EndpointError> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))?;
        Ok(())
    }
    assert!(matches!(returns_err(), Err(EndpointError::Io(_))));
}

// ========== Debug ==========

#[test]
fn invariant_errors_have_nonempty_debug() {
    let a = EndpointError::AllocExceedsDemand { dst: NodeId::new(1), alloc: 2, demand: 1 };
    let b = EndpointError::ReportExceedsRequested { dst: NodeId::new(1), reported: 2, requested: 1 };
    assert!(!format!("{a:?}").is_empty());
    assert!(!format!("{b:?}").is_empty());
}
