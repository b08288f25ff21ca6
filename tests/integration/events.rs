//! Event batches and the event area boundary

use crate::helpers::*;
use linbridge::plugin::SessionOptions;
use linbridge::Event;

fn note_on(i: usize) -> Event {
    Event::midi(i as i32 % 64, [0x90, (i % 128) as u8, 100])
}

#[test]
fn test_small_batch_arrives_intact() {
    let session = start_session("events_small", SessionOptions::default());
    let events: Vec<Event> = (0..10).map(note_on).collect();

    assert_eq!(session.effect.process_events(&events).unwrap(), 10);
    let received = session.probe.events.lock();
    assert_eq!(received.len(), 10);
    assert_eq!(received[3].midi_bytes(), Some([0x90, 3, 100]));
}

#[test]
fn test_batch_beyond_area_is_truncated_at_255() {
    let session = start_session("events_boundary", SessionOptions::default());
    let events: Vec<Event> = (0..300).map(note_on).collect();

    assert_eq!(session.effect.process_events(&events).unwrap(), 255);
    let received = session.probe.events.lock();
    assert_eq!(received.len(), 255);
    assert_eq!(received[254].midi_bytes(), note_on(254).midi_bytes());
}

#[test]
fn test_exact_capacity_batch_is_sent_whole() {
    let session = start_session("events_exact", SessionOptions::default());
    let events: Vec<Event> = (0..255).map(note_on).collect();
    assert_eq!(session.effect.process_events(&events).unwrap(), 255);
}

#[test]
fn test_empty_batch_sends_nothing() {
    let session = start_session("events_empty", SessionOptions::default());
    assert_eq!(session.effect.process_events(&[]).unwrap(), 0);
    assert!(session.probe.events.lock().is_empty());
}
