//! Block processing through the audio region

use crate::helpers::*;
use linbridge::plugin::SessionOptions;
use linbridge::BridgeError;
use std::sync::atomic::Ordering;

const FRAMES: usize = TEST_FRAMES as usize;

#[test]
fn test_silence_passthrough_2x2_64_frames() {
    let session = start_session("silence", SessionOptions::default());
    let effect = &session.effect;
    effect.open().unwrap();
    effect.set_sample_rate(44100.0).unwrap();
    effect.set_block_size(FRAMES as i32).unwrap();
    effect.resume().unwrap();

    let (left, right) = (vec![0.0f32; FRAMES], vec![0.0f32; FRAMES]);
    let (mut out_l, mut out_r) = (vec![1.0f32; FRAMES], vec![1.0f32; FRAMES]);
    effect
        .process(&[&left, &right], &mut [&mut out_l, &mut out_r], None)
        .unwrap();

    assert!(out_l.iter().all(|&s| s == 0.0));
    assert!(out_r.iter().all(|&s| s == 0.0));
    assert_eq!(session.probe.blocks.load(Ordering::Acquire), 1);
}

#[test]
fn test_signal_passes_through_exactly() {
    let session = start_session("staircase", SessionOptions::default());
    let effect = &session.effect;
    effect.open().unwrap();
    effect.resume().unwrap();

    let left = staircase(FRAMES, 0.0);
    let right = staircase(FRAMES, 1000.0);
    let (mut out_l, mut out_r) = (vec![0.0f32; FRAMES], vec![0.0f32; FRAMES]);
    for _ in 0..8 {
        effect
            .process(&[&left, &right], &mut [&mut out_l, &mut out_r], None)
            .unwrap();
        assert_eq!(out_l, left);
        assert_eq!(out_r, right);
    }
}

#[test]
fn test_double_precision_unsupported_yields_silence() {
    let session = start_session("double", SessionOptions::default());
    let effect = &session.effect;
    effect.open().unwrap();

    let input = vec![0.5f64; FRAMES];
    let mut out_l = vec![1.0f64; FRAMES];
    let mut out_r = vec![1.0f64; FRAMES];
    effect
        .process_double(&[&input, &input], &mut [&mut out_l, &mut out_r], None)
        .unwrap();
    assert!(out_l.iter().chain(out_r.iter()).all(|&s| s == 0.0));
}

#[test]
fn test_block_larger_than_region_is_rejected_locally() {
    let session = start_session("oversize", SessionOptions::default());
    let input = vec![0.0f32; FRAMES * 2];
    let mut output = vec![0.0f32; FRAMES * 2];
    let err = session
        .effect
        .process(&[&input], &mut [&mut output], None)
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidArgument(_)));

    // The session is unaffected
    assert_eq!(session.effect.vendor().unwrap(), VENDOR);
}
