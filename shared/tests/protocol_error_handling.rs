//! Error-handling coverage for the wire format: every decode path must
//! reject truncated, oversized, or otherwise malformed input with a
//! `ProtocolError` instead of panicking or indexing out of bounds.

use fastpass_shared::protocol::packet::{
    decode_alloc, decode_areq, decode_ack_ext, decode_next_payload, decode_reset, encode_alloc,
    encode_areq, encode_reset, peek_payload_type, AllocPayload, AllocTslot, AreqEntry, Header,
    HEADER_LEN,
};
use fastpass_shared::protocol::ProtocolError;
use fastpass_shared::WindowError;

// ========== Header ==========

#[test]
fn header_read_rejects_short_buffer() {
    let buf = [0u8; HEADER_LEN - 1];
    let err = Header::read(&buf).unwrap_err();
    assert_eq!(err, ProtocolError::PacketTooShort { len: HEADER_LEN - 1 });
}

#[test]
fn header_read_accepts_exact_length() {
    let buf = [0u8; HEADER_LEN];
    assert!(Header::read(&buf).is_ok());
}

// ========== RESET ==========

#[test]
fn decode_reset_rejects_truncated_payload() {
    let mut buf = [0u8; 8];
    encode_reset(&mut buf, 0x00AB_CDEF_0123_4567);
    let err = decode_reset(&buf[0..7]).unwrap_err();
    assert_eq!(err, ProtocolError::IncompletePayload { kind: "RESET" });
}

// ========== A-REQ ==========

#[test]
fn decode_areq_rejects_truncated_header() {
    let err = decode_areq(&[0u8]).unwrap_err();
    assert_eq!(err, ProtocolError::IncompletePayload { kind: "A-REQ" });
}

#[test]
fn decode_areq_rejects_truncated_entries() {
    let entries = vec![AreqEntry { dst: 1, cumulative_tslots: 2 }];
    let mut buf = [0u8; 16];
    let n = encode_areq(&mut buf, &entries);
    let err = decode_areq(&buf[0..n - 1]).unwrap_err();
    assert_eq!(err, ProtocolError::IncompletePayload { kind: "A-REQ" });
}

// ========== ALLOC ==========

#[test]
fn decode_alloc_rejects_truncated_header() {
    let err = decode_alloc(&[0u8; 3]).unwrap_err();
    assert_eq!(err, ProtocolError::IncompletePayload { kind: "ALLOC" });
}

#[test]
fn decode_alloc_rejects_truncated_tslots() {
    let payload = AllocPayload {
        base_tslot: 7,
        dsts: vec![10, 20],
        tslots: vec![AllocTslot { dst_index: Some(0), gap: 1 }],
    };
    let mut buf = [0u8; 32];
    let n = encode_alloc(&mut buf, &payload).unwrap();
    let err = decode_alloc(&buf[0..n - 1]).unwrap_err();
    assert_eq!(err, ProtocolError::IncompletePayload { kind: "ALLOC" });
}

#[test]
fn encode_alloc_rejects_buffer_too_small() {
    let payload = AllocPayload {
        base_tslot: 0,
        dsts: vec![1, 2, 3],
        tslots: vec![AllocTslot { dst_index: Some(0), gap: 0 }; 4],
    };
    let mut buf = [0u8; 3];
    let err = encode_alloc(&mut buf, &payload).unwrap_err();
    assert!(matches!(err, ProtocolError::BufferTooSmall { .. }));
}

#[test]
fn decode_alloc_rejects_out_of_bounds_dst_index() {
    let mut buf = [0u8; 16];
    buf[0] = (3 << 4) | 1; // ALLOC tag, n_dst = 1
    buf[1] = 1; // n_tslots / 2
    buf[4..6].copy_from_slice(&1u16.to_be_bytes());
    buf[6] = (5 << 4) | 0; // dst_index nibble 5 -> index 4, out of bounds for n_dst=1
    let err = decode_alloc(&buf[0..8]).unwrap_err();
    assert_eq!(err, ProtocolError::AllocDstOutOfBounds { index: 5, n_dst: 1 });
}

// ========== ACK-ext ==========

#[test]
fn decode_ack_ext_rejects_truncated_payload() {
    let err = decode_ack_ext(&[0u8; 3]).unwrap_err();
    assert_eq!(err, ProtocolError::IncompletePayload { kind: "ACK" });
}

// ========== dispatch ==========

#[test]
fn peek_payload_type_on_empty_buffer_is_none() {
    assert_eq!(peek_payload_type(&[]), None);
}

#[test]
fn decode_next_payload_on_empty_buffer_is_none() {
    assert_eq!(decode_next_payload(&[]).unwrap(), None);
}

#[test]
fn decode_next_payload_on_padding_tag_is_none() {
    let buf = [0u8; 8];
    assert_eq!(decode_next_payload(&buf).unwrap(), None);
}

#[test]
fn decode_next_payload_propagates_truncation_errors() {
    let buf = [1u8 << 4]; // RESET tag, nothing else
    assert!(decode_next_payload(&buf).is_err());
}

// ========== SECURITY: malformed/garbage input never panics ==========

#[test]
fn all_decoders_survive_all_zero_and_all_one_bytes() {
    for fill in [0x00u8, 0xFFu8] {
        let buf = vec![fill; 64];
        let _ = Header::read(&buf[0..HEADER_LEN]);
        let _ = decode_reset(&buf);
        let _ = decode_areq(&buf);
        let _ = decode_alloc(&buf);
        let _ = decode_ack_ext(&buf);
        let _ = decode_next_payload(&buf);
    }
}

#[test]
fn all_decoders_survive_every_short_prefix() {
    let mut buf = vec![0xA5u8; 32];
    // A-REQ header claims a large entry count against a short buffer.
    buf[0] = 0x2F;
    buf[1] = 0xFF;
    for len in 0..buf.len() {
        let _ = decode_areq(&buf[0..len]);
        let _ = decode_alloc(&buf[0..len]);
        let _ = decode_reset(&buf[0..len]);
        let _ = decode_ack_ext(&buf[0..len]);
        let _ = decode_next_payload(&buf[0..len]);
    }
}

// ========== Display / Debug / Clone / Eq ==========

#[test]
fn protocol_error_messages_are_human_readable() {
    assert_eq!(
        format!("{}", ProtocolError::PacketTooShort { len: 3 }),
        "packet too short: 3 bytes, need at least 8"
    );
    assert_eq!(format!("{}", ProtocolError::BadChecksum), "checksum mismatch");
}

#[test]
fn protocol_error_wraps_window_error_via_from() {
    let werr = WindowError::NotMarked { seqno: 9 };
    let perr: ProtocolError = werr.clone().into();
    match perr {
        ProtocolError::Window(inner) => assert_eq!(inner, werr),
        other => panic!("expected Window variant, got {other:?}"),
    }
}

#[test]
fn protocol_error_is_cloneable_and_comparable() {
    let a = ProtocolError::IncompletePayload { kind: "A-REQ" };
    let b = a.clone();
    assert_eq!(a, b);
}
