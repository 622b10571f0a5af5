//! Constructor, precondition, and no-I/O laws that need no daemon.

use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cadenza::cookie::COOKIE_ENV;
use cadenza::{Code, Context, Direction, State, Stream, StreamState};

/// Points the cookie lookup at a path that cannot exist. Every test in
/// this binary that connects wants exactly this setup.
fn point_cookie_at_missing_file() {
    env::set_var(COOKIE_ENV, "/nonexistent/cadenza-basic-tests/cookie");
}

#[test]
fn context_requires_a_name() {
    assert_eq!(Context::new("").err(), Some(Code::Invalid));
}

#[test]
fn fresh_context_is_clean() {
    let ctx = Context::new("basic").unwrap();
    assert_eq!(ctx.name(), "basic");
    assert_eq!(ctx.state(), State::Unconnected);
    assert_eq!(ctx.errno(), Code::Ok);
    assert_eq!(ctx.server_protocol_version(), None);
    assert!(!ctx.is_pending());
    assert!(ctx.drain(|| panic!("nothing to drain")).is_none());
}

#[test]
fn construction_and_drop_perform_no_io() {
    // No runtime exists here; any I/O or task spawn would panic.
    let ctx = Context::new("idle").unwrap();
    drop(ctx);
}

#[test]
fn operations_outside_ready_are_rejected() {
    let ctx = Context::new("basic").unwrap();
    assert_eq!(ctx.exit_daemon(|_| {}).err(), Some(Code::BadState));
    assert_eq!(
        ctx.subscribe(cadenza::InterestMaskSet::ALL, |_| {})
            .err(),
        Some(Code::BadState)
    );
}

#[tokio::test]
async fn connect_without_a_cookie_fails_with_auth_key() {
    point_cookie_at_missing_file();
    let ctx = Context::new("basic").unwrap();
    let observed = Arc::new(AtomicUsize::new(0));
    let terminal_seen = observed.clone();
    ctx.set_state_callback(move |state| {
        assert_eq!(state, State::Failed);
        terminal_seen.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(
        ctx.connect(Some("/nonexistent/cadenza.socket")).err(),
        Some(Code::AuthKey)
    );
    assert_eq!(ctx.state(), State::Failed);
    assert_eq!(ctx.errno(), Code::AuthKey);
    assert_eq!(observed.load(Ordering::SeqCst), 1);

    // Failed is terminal: no second connection attempt from here.
    assert_eq!(
        ctx.connect(Some("/nonexistent/cadenza.socket")).err(),
        Some(Code::BadState)
    );
    assert_eq!(observed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disconnect_is_valid_from_any_state() {
    point_cookie_at_missing_file();
    let ctx = Context::new("basic").unwrap();
    ctx.disconnect();
    assert_eq!(ctx.state(), State::Terminated);

    // Terminal states are monotone; a failure cannot undo termination.
    let _ = ctx.connect(Some("/nonexistent/cadenza.socket"));
    assert_eq!(ctx.state(), State::Terminated);
    assert_eq!(ctx.errno(), Code::Ok);
}

#[test]
fn stream_requires_a_name() {
    let ctx = Context::new("basic").unwrap();
    assert_eq!(
        Stream::new(&ctx, "", Direction::Playback).err(),
        Some(Code::Invalid)
    );
}

#[test]
fn stream_needs_a_ready_context() {
    let ctx = Context::new("basic").unwrap();
    let stream = Stream::new(&ctx, "pcm", Direction::Playback).unwrap();
    assert_eq!(stream.state(), StreamState::Unconnected);
    assert_eq!(stream.connect().err(), Some(Code::BadState));
    assert_eq!(stream.write(b"data").err(), Some(Code::BadState));

    // A stream that never reached the server terminates locally.
    stream.disconnect().unwrap();
    assert_eq!(stream.state(), StreamState::Terminated);
    assert_eq!(stream.disconnect().err(), Some(Code::BadState));
}

#[test]
fn context_terminal_state_sweeps_unconnected_streams() {
    let ctx = Context::new("basic").unwrap();
    let stream = Stream::new(&ctx, "pcm", Direction::Record).unwrap();
    let observed = Arc::new(AtomicUsize::new(0));
    let seen = observed.clone();
    stream.set_state_callback(move |state| {
        assert_eq!(state, StreamState::Terminated);
        seen.fetch_add(1, Ordering::SeqCst);
    });

    ctx.disconnect();
    assert_eq!(stream.state(), StreamState::Terminated);
    assert_eq!(observed.load(Ordering::SeqCst), 1);
}
