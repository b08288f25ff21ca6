//! Integration test modules for linbridge

pub mod audio;
pub mod chunks;
pub mod events;
pub mod lifecycle;
pub mod parameters;
