//! Batched timestamped events and their wire encoding.
//!
//! Layout of an event area: `count: i32`, then for each event
//! `kind: i32`, `byte_size: i32`, `delta_frames: i32` and
//! `byte_size - 4` payload bytes. All integers are native-endian.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

const HEADER_BYTES: usize = 4;
const RECORD_HEADER_BYTES: usize = 8;

/// Bytes of a MIDI event body after `delta_frames`.
pub const MIDI_BODY_BYTES: usize = 20;

/// Bytes one MIDI event takes in an event area.
pub const MIDI_RECORD_BYTES: usize = RECORD_HEADER_BYTES + 4 + MIDI_BODY_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Midi,
    SysEx,
    Other(i32),
}

impl EventKind {
    pub fn to_raw(self) -> i32 {
        match self {
            EventKind::Midi => 1,
            EventKind::SysEx => 6,
            EventKind::Other(raw) => raw,
        }
    }

    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => EventKind::Midi,
            6 => EventKind::SysEx,
            other => EventKind::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub delta_frames: i32,
    pub payload: SmallVec<[u8; MIDI_BODY_BYTES]>,
}

/// Stack-first batch; typical blocks carry few events.
pub type EventVec = SmallVec<[Event; 16]>;

impl Event {
    /// MIDI body: flags, note length, note offset (i32 each), 4 data bytes,
    /// detune, note-off velocity and two reserved bytes.
    pub fn midi(delta_frames: i32, data: [u8; 3]) -> Self {
        let mut payload = SmallVec::from_buf([0u8; MIDI_BODY_BYTES]);
        payload[12] = data[0];
        payload[13] = data[1];
        payload[14] = data[2];
        Self {
            kind: EventKind::Midi,
            delta_frames,
            payload,
        }
    }

    pub fn sysex(delta_frames: i32, bytes: &[u8]) -> Self {
        Self {
            kind: EventKind::SysEx,
            delta_frames,
            payload: SmallVec::from_slice(bytes),
        }
    }

    /// The three MIDI data bytes, for MIDI events with a full body.
    pub fn midi_bytes(&self) -> Option<[u8; 3]> {
        if self.kind != EventKind::Midi || self.payload.len() < 15 {
            return None;
        }
        Some([self.payload[12], self.payload[13], self.payload[14]])
    }

    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_BYTES + 4 + self.payload.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOutcome {
    /// Events written to the area (and recorded in its header).
    pub sent: usize,
    pub dropped: usize,
}

impl EncodeOutcome {
    pub fn is_empty(&self) -> bool {
        self.sent == 0
    }
}

/// Encode the longest prefix of `events` that fits `area`. An empty batch
/// writes nothing; the caller must not send it.
pub fn encode_events<'a, I>(events: I, area: &mut [u8]) -> EncodeOutcome
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut sent = 0usize;
    let mut dropped = 0usize;
    let mut offset = HEADER_BYTES;

    if area.len() < HEADER_BYTES {
        return EncodeOutcome {
            sent: 0,
            dropped: events.into_iter().count(),
        };
    }

    for event in events {
        if dropped > 0 || offset + event.encoded_len() > area.len() {
            dropped += 1;
            continue;
        }
        let byte_size = (4 + event.payload.len()) as i32;
        area[offset..offset + 4].copy_from_slice(&event.kind.to_raw().to_ne_bytes());
        area[offset + 4..offset + 8].copy_from_slice(&byte_size.to_ne_bytes());
        area[offset + 8..offset + 12].copy_from_slice(&event.delta_frames.to_ne_bytes());
        let body = offset + 12;
        area[body..body + event.payload.len()].copy_from_slice(&event.payload);
        offset += event.encoded_len();
        sent += 1;
    }

    if sent > 0 {
        area[..HEADER_BYTES].copy_from_slice(&(sent as i32).to_ne_bytes());
    }
    EncodeOutcome { sent, dropped }
}

fn read_i32(area: &[u8], offset: usize) -> Result<i32> {
    area.get(offset..offset + 4)
        .map(|b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| BridgeError::ProtocolError(format!("event area truncated at {offset}")))
}

pub fn decode_events(area: &[u8]) -> Result<EventVec> {
    let count = read_i32(area, 0)?;
    if count < 0 {
        return Err(BridgeError::ProtocolError(format!(
            "negative event count {count}"
        )));
    }

    let mut events = EventVec::new();
    let mut offset = HEADER_BYTES;
    for _ in 0..count {
        let kind = EventKind::from_raw(read_i32(area, offset)?);
        let byte_size = read_i32(area, offset + 4)?;
        if byte_size < 4 {
            return Err(BridgeError::ProtocolError(format!(
                "event byte size {byte_size} too small"
            )));
        }
        let delta_frames = read_i32(area, offset + 8)?;
        let body = offset + 12;
        let end = offset + RECORD_HEADER_BYTES + byte_size as usize;
        let payload = area.get(body..end).ok_or_else(|| {
            BridgeError::ProtocolError(format!("event payload runs past {}", area.len()))
        })?;
        events.push(Event {
            kind,
            delta_frames,
            payload: SmallVec::from_slice(payload),
        });
        offset = end;
    }
    Ok(events)
}

/// Events that fit one area, for capacity checks and tests.
pub fn max_midi_events(area_len: usize) -> usize {
    area_len.saturating_sub(HEADER_BYTES) / MIDI_RECORD_BYTES
}
