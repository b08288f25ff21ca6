//! Session lifecycle: handshake, introspection, close, startup failure

use crate::helpers::*;
use linbridge::plugin::SessionOptions;
use linbridge::BridgeError;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_vendor_string_end_to_end() {
    let session = start_session("vendor", SessionOptions::default());
    assert_eq!(session.effect.vendor().unwrap(), VENDOR);
    assert_eq!(session.effect.name().unwrap(), EFFECT_NAME);
    assert_eq!(session.effect.vendor_version().unwrap(), 1000);
}

#[test]
fn test_effect_info_carries_derived_unique_id() {
    let session = start_session("info", SessionOptions::default());
    let info = session.effect.info().unwrap();
    assert_eq!(info.num_inputs, 2);
    assert_eq!(info.num_outputs, 2);
    assert_eq!(info.num_params, PARAM_COUNT as i32);
    assert_eq!(
        info.unique_id,
        linbridge::server::derive_unique_id("TestVendor.Passthrough")
    );
    assert_ne!(info.unique_id, 0);
}

#[test]
fn test_open_and_sample_rate_reach_engine() {
    let session = start_session("open", SessionOptions::default());
    session.effect.open().unwrap();
    session.effect.set_sample_rate(48000.0).unwrap();
    assert!(session.probe.opened.load(Ordering::Acquire));
    assert_eq!(*session.probe.sample_rate.lock(), 48000.0);
}

#[test]
fn test_close_ends_server_and_session() {
    let session = start_session("close", SessionOptions::default());
    session.effect.open().unwrap();
    session.effect.close().unwrap();

    assert!(session.effect.is_closed());
    assert!(wait_until(2000, || session.finished.load(Ordering::Acquire) == 1));
    // The server closes an engine the host left open
    assert!(session.probe.closed.load(Ordering::Acquire));

    let err = session.effect.name().unwrap_err();
    assert!(matches!(err, BridgeError::SessionClosed { .. }));
    // Closing twice is a no-op
    session.effect.close().unwrap();
}

#[test]
fn test_close_releases_in_flight_process_calls() {
    let frames = TEST_FRAMES as usize;
    for round in 0..5 {
        let session = start_session(&format!("closerace{}", round), SessionOptions::default());
        let effect = &session.effect;
        effect.open().unwrap();
        effect.resume().unwrap();

        let slowest = thread::scope(|s| {
            let audio = s.spawn(|| {
                let input = vec![0.5f32; frames];
                let mut output = vec![0.0f32; frames];
                let mut slowest = Duration::ZERO;
                loop {
                    let start = Instant::now();
                    let result = effect.process(&[&input], &mut [&mut output], None);
                    slowest = slowest.max(start.elapsed());
                    if result.is_err() {
                        return slowest;
                    }
                }
            });
            thread::sleep(Duration::from_millis(20));
            effect.close().unwrap();
            audio.join().unwrap()
        });

        // Far below the 5 s audio timeout of the test config
        assert!(slowest < Duration::from_secs(1), "round {}: {:?}", round, slowest);
    }
}

#[test]
fn test_parameter_thread_disabled_routes_through_control() {
    let options = SessionOptions {
        parameter_thread: false,
        ..SessionOptions::default()
    };
    let session = start_session("noparamthread", options);
    session.effect.set_parameter(1, 0.25).unwrap();
    assert_eq!(session.effect.get_parameter(1).unwrap(), 0.25);
    assert_eq!(session.effect.parameter_name(1).unwrap(), "Param 1");
}

#[test]
fn test_refused_instantiation_disconnects_host() {
    let session = try_start_session("refused", SessionOptions::default(), TestFactory::refusing())
        .expect("handshake completes before instantiation");

    assert!(wait_until(2000, || session.effect.is_closed()));
    assert!(session.callbacks.disconnected.load(Ordering::Acquire));
    assert!(matches!(
        session.effect.vendor(),
        Err(BridgeError::SessionClosed { .. })
    ));
}
