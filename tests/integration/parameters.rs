//! Parameter traffic, direct and through the shared cache

use crate::helpers::*;
use linbridge::plugin::SessionOptions;

fn cached() -> SessionOptions {
    SessionOptions {
        parameter_cache: true,
        ..SessionOptions::default()
    }
}

#[test]
fn test_direct_parameter_round_trip() {
    let session = start_session("param_direct", SessionOptions::default());
    session.effect.set_parameter(2, 0.625).unwrap();
    assert_eq!(session.effect.get_parameter(2).unwrap(), 0.625);
    assert_eq!(session.probe.params.lock()[2], 0.625);
    assert_eq!(session.effect.parameter_name(2).unwrap(), "Param 2");
}

#[test]
fn test_cached_parameter_reads_exact_value() {
    let session = start_session("param_cache", cached());
    session.effect.set_parameter(1, 0.75).unwrap();

    assert!(wait_until(2000, || session.probe.params.lock()[1] == 0.75));
    assert!(wait_until(2000, || session.effect.get_parameter(1).unwrap() == 0.75));
}

#[test]
fn test_cached_parameter_last_writer_wins() {
    let session = start_session("param_lww", cached());
    for step in 0..100 {
        session.effect.set_parameter(0, step as f32 / 100.0).unwrap();
    }
    session.effect.set_parameter(0, 0.9).unwrap();

    assert!(wait_until(2000, || session.probe.params.lock()[0] == 0.9));
    assert!(wait_until(2000, || session.effect.get_parameter(0).unwrap() == 0.9));
}

#[test]
fn test_cache_seeded_from_effect_info() {
    let session = start_session("param_seed", cached());
    session.probe.params.lock()[3] = 0.5;
    session.effect.info().unwrap();
    assert_eq!(session.effect.get_parameter(3).unwrap(), 0.5);
}

#[test]
fn test_engine_automation_reaches_host() {
    let session = start_session("param_automate", SessionOptions::default());
    session.effect.open().unwrap();
    session.effect.set_parameter(1, 0.3).unwrap();

    let automated = session.callbacks.automated.lock();
    assert_eq!(automated.as_slice(), &[(1, 0.3)]);
}

#[test]
fn test_cache_drained_once_per_block_without_parameter_thread() {
    let options = SessionOptions {
        parameter_cache: true,
        parameter_thread: false,
        ..SessionOptions::default()
    };
    let session = start_session("param_block_drain", options);
    let effect = &session.effect;
    effect.open().unwrap();
    effect.resume().unwrap();

    effect.set_parameter(1, 0.4).unwrap();
    // Nothing drains the cache until the next block
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(session.probe.params.lock()[1], 0.0);
    assert_eq!(effect.get_parameter(1).unwrap(), 0.0);

    let frames = TEST_FRAMES as usize;
    let input = vec![0.0f32; frames];
    let mut output = vec![0.0f32; frames];
    effect.process(&[&input], &mut [&mut output], None).unwrap();

    assert_eq!(session.probe.params.lock()[1], 0.4);
    assert_eq!(effect.get_parameter(1).unwrap(), 0.4);
}
