//! Integration tests for `window::WindowError` conditions: the sliding
//! window surfaces its invariant violations as `Result`s rather than
//! panicking, so a caller driving it from untrusted wire input can recover.

use fastpass_shared::{Window, WindowError};

#[test]
fn mark_outside_window_returns_out_of_range() {
    let mut w = Window::new(8, 1000);
    let err = w.mark(1_000_000).unwrap_err();
    match err {
        WindowError::OutOfRange { seqno, .. } => assert_eq!(seqno, 1_000_000),
        other => panic!("expected OutOfRange, got {other:?}"),
    }
}

#[test]
fn mark_already_marked_returns_already_marked() {
    let mut w = Window::new(8, 1000);
    w.mark(1000).unwrap();
    let err = w.mark(1000).unwrap_err();
    assert_eq!(err, WindowError::AlreadyMarked { seqno: 1000 });
}

#[test]
fn clear_unmarked_returns_not_marked() {
    let mut w = Window::new(8, 1000);
    let err = w.clear(999).unwrap_err();
    assert_eq!(err, WindowError::NotMarked { seqno: 999 });
}

#[test]
fn advance_past_a_marked_seqno_is_refused() {
    let mut w = Window::new(8, 1000);
    let edge = w.edge();
    w.mark(edge).unwrap();
    let err = w.advance(w.wnd_len()).unwrap_err();
    assert!(matches!(err, WindowError::WouldDropMarked { amount } if amount == w.wnd_len()));
}

#[test]
fn window_errors_are_cloneable_and_comparable() {
    let a = WindowError::NotMarked { seqno: 5 };
    let b = a.clone();
    assert_eq!(a, b);
}

#[test]
fn window_error_messages_name_the_seqno() {
    let err = WindowError::OutOfRange { seqno: 42, edge: 0, head: 10 };
    let msg = format!("{err}");
    assert!(msg.contains("42"));
}

#[test]
fn mark_bulk_zero_length_window_never_panics() {
    let mut w = Window::new(6, 100);
    assert!(w.wnd_len() == 0);
    assert!(w.mark(100).is_err());
    assert!(w.mark_bulk(100, 0).is_ok());
}
