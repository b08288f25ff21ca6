//! State chunk transfer: inline, segmented and refused

use crate::helpers::*;
use linbridge::plugin::SessionOptions;
use linbridge::BridgeError;
use std::thread;

const CAPACITY: usize = TEST_CHUNK_CAPACITY as usize;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

#[test]
fn test_small_chunk_moves_inline() {
    let session = start_session("chunk_inline", SessionOptions::default());
    let state = pattern(100);

    assert_eq!(session.effect.set_chunk(&state, false).unwrap(), 1);
    assert_eq!(*session.probe.chunk.lock(), state);
    assert_eq!(session.effect.get_chunk(false).unwrap(), state);
}

#[test]
fn test_oversize_chunk_refused_without_buffering() {
    let session = start_session("chunk_refused", SessionOptions::default());
    *session.probe.chunk.lock() = pattern(CAPACITY * 3);

    let err = session.effect.get_chunk(false).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::PayloadTooLarge {
            required,
            capacity,
            ..
        } if required == CAPACITY * 3 && capacity == CAPACITY
    ));

    let err = session.effect.set_chunk(&pattern(CAPACITY * 2), false).unwrap_err();
    assert!(matches!(err, BridgeError::PayloadTooLarge { .. }));

    // Refusal is isolated: the session keeps working
    assert!(!session.effect.is_closed());
    assert_eq!(session.effect.vendor().unwrap(), VENDOR);
    let small = pattern(10);
    session.effect.set_chunk(&small, true).unwrap();
    assert_eq!(session.effect.get_chunk(true).unwrap(), small);
}

#[test]
fn test_oversize_chunk_segmented_when_buffered() {
    let session = start_session("chunk_segmented", buffered_chunks());
    let state = pattern(CAPACITY * 3 + 17);

    assert_eq!(session.effect.set_chunk(&state, false).unwrap(), 1);
    assert_eq!(*session.probe.chunk.lock(), state);

    let restored = session.effect.get_chunk(false).unwrap();
    assert_eq!(restored.len(), state.len());
    assert_eq!(restored, state);
}

#[test]
fn test_chunk_of_exact_capacity_is_segmented() {
    let session = start_session("chunk_exact", buffered_chunks());
    let state = pattern(CAPACITY);

    session.effect.set_chunk(&state, false).unwrap();
    assert_eq!(session.effect.get_chunk(false).unwrap(), state);
}

#[test]
fn test_concurrent_transfers_stay_isolated() {
    let session = start_session("chunk_concurrent", buffered_chunks());
    let effect = &session.effect;
    let big = pattern(CAPACITY * 2 + 5);
    let small = vec![0xAB; 64];

    thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..10 {
                effect.set_chunk(&big, false).unwrap();
            }
        });
        s.spawn(|| {
            for _ in 0..10 {
                effect.set_chunk(&small, true).unwrap();
                let seen = effect.get_chunk(true).unwrap();
                assert!(seen == big || seen == small);
            }
        });
    });

    let last = effect.get_chunk(false).unwrap();
    assert!(last == big || last == small, "chunk corrupted: {} bytes", last.len());
}
