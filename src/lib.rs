//! # linbridge - cross-process plugin bridge
//!
//! Runs a plugin engine in its own server process and drives it from the
//! host over shared memory.
//!
//! ## Architecture
//!
//! linbridge is an umbrella crate that coordinates:
//! - **linbridge-plugin** - Wire protocol shared by both processes, the
//!   host-side session (`RemoteEffect`) and the host callback service
//! - **linbridge-server** - Server process: engine loading, opcode dispatch,
//!   callback relay and the thread orchestrator
//!
//! ## Quick Start
//!
//! ```ignore
//! use linbridge::prelude::*;
//!
//! let effect = SessionBuilder::new().load("/home/me/.vst/Synth.so")?;
//!
//! effect.open()?;
//! effect.set_sample_rate(48000.0)?;
//! effect.set_block_size(256)?;
//! effect.resume()?;
//!
//! let (left, right) = (vec![0.0f32; 256], vec![0.0f32; 256]);
//! let (mut out_l, mut out_r) = (vec![0.0f32; 256], vec![0.0f32; 256]);
//! effect.process(&[&left, &right], &mut [&mut out_l, &mut out_r], None)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `server` (default) - Server-side crate, for in-process harnesses and
//!   custom server binaries

/// Re-export of linbridge-plugin for direct access
pub use linbridge_plugin as plugin;

/// Re-export of linbridge-server for direct access
#[cfg(feature = "server")]
pub use linbridge_server as server;

mod builder;
pub use builder::SessionBuilder;

pub use linbridge_plugin::{
    resolve_module, BridgeConfig, BridgeError, ChunkMode, EditorRect, EffectFlags, EffectInfo,
    Event, EventKind, HostCallbacks, IoLayout, LoadStage, ModuleIndex, ModuleSpec, NullCallbacks,
    PlugCategory, Precision, RemoteEffect, Result, SessionOptions, TimeInfo,
};

#[cfg(feature = "server")]
pub use linbridge_server::{EngineFactory, HostLink, InnerEngine};

pub mod prelude {
    pub use crate::{
        BridgeConfig, BridgeError, ChunkMode, EffectInfo, Event, EventKind, HostCallbacks,
        NullCallbacks, RemoteEffect, Result, SessionBuilder, SessionOptions, TimeInfo,
    };

    #[cfg(feature = "server")]
    pub use crate::{EngineFactory, HostLink, InnerEngine};
}
