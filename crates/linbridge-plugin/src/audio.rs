//! Audio and event transfer region.
//!
//! Layout: input plane, output plane (each `max_channels` channels of
//! `max_frames` samples, 8 bytes per sample slot so either precision fits),
//! then the host-to-server event area and the server-to-host event area.

use crate::error::{BridgeError, Result};
use crate::events::{decode_events, encode_events, EncodeOutcome, Event, EventVec};
use crate::protocol::{Geometry, EVENT_AREA_BYTES};
use crate::shared_memory::SharedRegion;

const SLOT_BYTES: usize = std::mem::size_of::<f64>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLane {
    ToServer,
    ToHost,
}

/// f32 or f64.
pub trait Sample: Copy + Default + sealed::Sealed {}
impl Sample for f32 {}
impl Sample for f64 {}

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
}

pub struct AudioBus {
    region: SharedRegion,
    channels: usize,
    frames: usize,
}

impl AudioBus {
    fn region_len(channels: usize, frames: usize) -> usize {
        2 * channels * frames * SLOT_BYTES + 2 * EVENT_AREA_BYTES
    }

    pub fn create(name: &str, geometry: &Geometry) -> Result<Self> {
        let (channels, frames) = (geometry.max_channels as usize, geometry.max_frames as usize);
        Ok(Self {
            region: SharedRegion::create(name, Self::region_len(channels, frames))?,
            channels,
            frames,
        })
    }

    pub fn open(name: &str, geometry: &Geometry) -> Result<Self> {
        let (channels, frames) = (geometry.max_channels as usize, geometry.max_frames as usize);
        Ok(Self {
            region: SharedRegion::open(name, Self::region_len(channels, frames))?,
            channels,
            frames,
        })
    }

    pub fn max_channels(&self) -> usize {
        self.channels
    }

    pub fn max_frames(&self) -> usize {
        self.frames
    }

    fn channel_offset(&self, plane: Plane, channel: usize) -> Result<usize> {
        if channel >= self.channels {
            return Err(BridgeError::SharedMemoryError(format!(
                "Channel {} out of bounds ({} channels)",
                channel, self.channels
            )));
        }
        let plane_base = match plane {
            Plane::Input => 0,
            Plane::Output => self.channels * self.frames * SLOT_BYTES,
        };
        Ok(plane_base + channel * self.frames * SLOT_BYTES)
    }

    fn event_offset(&self, lane: EventLane) -> usize {
        let planes = 2 * self.channels * self.frames * SLOT_BYTES;
        match lane {
            EventLane::ToServer => planes,
            EventLane::ToHost => planes + EVENT_AREA_BYTES,
        }
    }

    /// Caller must hold the audio mailbox turn.
    pub fn write_channel<T: Sample>(&self, plane: Plane, channel: usize, data: &[T]) -> Result<()> {
        if data.len() > self.frames {
            return Err(BridgeError::SharedMemoryError(
                "Data length exceeds buffer capacity".to_string(),
            ));
        }
        let offset = self.channel_offset(plane, channel)?;
        let bytes = unsafe {
            std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data))
        };
        self.region.write_bytes(offset, bytes)
    }

    /// Zero-copy into the provided buffer. Returns frames copied.
    pub fn read_channel_into<T: Sample>(
        &self,
        plane: Plane,
        channel: usize,
        output: &mut [T],
    ) -> Result<usize> {
        let offset = self.channel_offset(plane, channel)?;
        let frames = output.len().min(self.frames);
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(
                output.as_mut_ptr() as *mut u8,
                frames * std::mem::size_of::<T>(),
            )
        };
        self.region.read_bytes_into(offset, bytes)?;
        Ok(frames)
    }

    /// Encode `events` into `lane`. Nothing is written for an empty batch.
    pub fn write_events<'a>(
        &self,
        lane: EventLane,
        events: impl IntoIterator<Item = &'a Event>,
    ) -> Result<EncodeOutcome> {
        // SAFETY: the lane belongs to whoever holds the turn that carries it
        let area = unsafe {
            self.region
                .bytes_mut(self.event_offset(lane), EVENT_AREA_BYTES)?
        };
        Ok(encode_events(events, area))
    }

    pub fn read_events(&self, lane: EventLane) -> Result<EventVec> {
        // SAFETY: the writer posted before we were woken
        let area = unsafe { self.region.bytes(self.event_offset(lane), EVENT_AREA_BYTES)? };
        decode_events(area)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry {
            max_channels: 2,
            max_frames: 64,
            ..Geometry::default()
        }
    }

    #[test]
    fn test_planes_are_separate() {
        let name = format!("test_audio_planes_{}", std::process::id());
        let bus = AudioBus::create(&name, &geometry()).unwrap();

        let ramp: Vec<f32> = (0..64).map(|i| i as f32 / 64.0).collect();
        bus.write_channel(Plane::Input, 1, &ramp).unwrap();
        bus.write_channel(Plane::Output, 1, &[0.5f32; 64]).unwrap();

        let mut out = vec![0.0f32; 64];
        bus.read_channel_into(Plane::Input, 1, &mut out).unwrap();
        assert_eq!(out, ramp);
        bus.read_channel_into(Plane::Output, 1, &mut out).unwrap();
        assert!(out.iter().all(|s| *s == 0.5));
    }

    #[test]
    fn test_f64_through_second_mapping() {
        let name = format!("test_audio_f64_{}", std::process::id());
        let host = AudioBus::create(&name, &geometry()).unwrap();
        let server = AudioBus::open(&name, &geometry()).unwrap();

        let data: Vec<f64> = (0..64)
            .map(|i| i as f64 * 1e-9 + std::f64::consts::PI)
            .collect();
        host.write_channel(Plane::Input, 0, &data).unwrap();

        let mut out = vec![0.0f64; 64];
        assert_eq!(server.read_channel_into(Plane::Input, 0, &mut out).unwrap(), 64);
        assert_eq!(out, data);
    }

    #[test]
    fn test_bounds() {
        let name = format!("test_audio_bounds_{}", std::process::id());
        let bus = AudioBus::create(&name, &geometry()).unwrap();
        assert!(bus.write_channel(Plane::Input, 2, &[0.0f32; 8]).is_err());
        assert!(bus.write_channel(Plane::Input, 0, &[0.0f32; 65]).is_err());
    }

    #[test]
    fn test_event_lanes_are_separate() {
        let name = format!("test_audio_events_{}", std::process::id());
        let bus = AudioBus::create(&name, &geometry()).unwrap();

        let down = [Event::midi(0, [0x90, 60, 100])];
        let up = [Event::midi(5, [0x80, 60, 0]), Event::midi(6, [0x90, 62, 90])];
        bus.write_events(EventLane::ToServer, &down).unwrap();
        bus.write_events(EventLane::ToHost, &up).unwrap();

        assert_eq!(bus.read_events(EventLane::ToServer).unwrap().as_slice(), &down);
        assert_eq!(bus.read_events(EventLane::ToHost).unwrap().as_slice(), &up);
    }
}
