//! Server side of linbridge
//!
//! This crate runs inside the plugin server process. It attaches to the
//! regions the host created, loads the engine module, and serves the host's
//! opcodes from four worker loops plus the main (editor) thread.
//!
//! This crate is used by the `linbridge-server` binary and by in-process test
//! harnesses. Hosts talk to it through `linbridge-plugin`'s `RemoteEffect`.

pub mod dispatch;
pub mod engine;
pub mod loader;
pub mod orchestrator;
pub mod relay;
pub mod server;

// Re-exports
pub use dispatch::{dispatch, ServerContext};
pub use engine::{
    derive_unique_id, EngineFactory, EntryPointFactory, IdleTracker, InnerEngine, PointerTracker,
};
pub use loader::{EngineEntry, ModuleHandle, ModuleLoader};
pub use orchestrator::{
    ContextKind, ExecutionContext, ExitFlag, LoopControl, ShutdownReport, ThreadSet,
};
pub use relay::{CallbackArg, CallbackCall, CallbackReply, HostLink, SessionState};
pub use server::{serve, ServerConfig, ServerRegions};

// Re-export shared types from linbridge-plugin
pub use linbridge_plugin::{
    BootArgs, BridgeError, EditorRect, EffectInfo, Event, EventKind, IoLayout, LoadStage,
    ModuleIndex, PlugCategory, Precision, Result, TimeInfo,
};
