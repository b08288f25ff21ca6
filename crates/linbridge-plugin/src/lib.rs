//! Shared-memory plugin bridge for linbridge
//!
//! This crate holds the wire protocol shared by both processes and the
//! host-side client. The server side lives in `linbridge-server`.
//!
//! ## Layout
//!
//! - **Control region**: one mailbox per traffic class, each a single-slot
//!   request/response channel guarded by a pair of binary semaphores
//! - **Audio region**: channel planes plus two event areas
//! - **Chunk region**: opaque engine state, moved whole or in segments
//! - **Parameter region**: optional per-index value cache
//!
//! ## Usage
//!
//! ```ignore
//! use linbridge_plugin::{BridgeConfig, NullCallbacks, RemoteEffect};
//! use std::sync::Arc;
//!
//! // Spawns the server for Synth.vst3 next to the wrapper
//! let effect = RemoteEffect::load(
//!     BridgeConfig::default(),
//!     "/path/to/Synth.so".as_ref(),
//!     Arc::new(NullCallbacks),
//! )?;
//!
//! effect.open()?;
//! effect.set_sample_rate(48000.0)?;
//! effect.resume()?;
//! ```

pub mod error;
pub use error::{BridgeError, LoadStage, Result};

mod client;
pub use client::RemoteEffect;

mod callbacks;
pub use callbacks::{CallbackService, HostCallbacks, NullCallbacks};

pub mod audio;
pub use audio::{AudioBus, EventLane, Plane, Sample};

pub mod bootstrap;
pub use bootstrap::{
    BootArgs, ModuleIndex, ProcessLauncher, ServerLauncher, ServerProcess, SERVER_BINARY_NAME,
};

pub mod chunk;
pub use chunk::{ChunkArea, ChunkAssembler, ChunkTier};

pub mod events;
pub use events::{Event, EventKind, EventVec};

pub mod module;
pub use module::{resolve_module, ModuleSpec, PeMachine};

pub mod param_cache;
pub use param_cache::ParamCache;

#[doc(hidden)]
pub mod protocol;

pub use protocol::{
    BridgeConfig, ChunkMode, EditorRect, EffectFlags, EffectInfo, EffectOpcode, Geometry,
    HostOpcode, IoLayout, MailboxKind, PlugCategory, Precision, ProcessBlock, SessionOptions,
    TimeInfo,
};

#[doc(hidden)]
pub mod bounded;

#[doc(hidden)]
pub mod control;

#[doc(hidden)]
pub mod semaphore;

#[doc(hidden)]
pub mod shared_memory;
