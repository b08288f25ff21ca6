//! Engine module loading.

use crate::engine::InnerEngine;
use crate::relay::HostLink;
use linbridge_plugin::{BridgeError, LoadStage, ModuleIndex, Result};
use std::path::{Path, PathBuf};

/// Entry point exported by an engine module as `linbridge_engine_entry`.
/// Receives the sub-module index and the host link, returns the engine.
pub type EngineEntry = fn(index: u32, host: HostLink) -> Option<Box<dyn InnerEngine>>;

const ENTRY_SYMBOL: &[u8] = b"linbridge_engine_entry\0";
const INIT_SYMBOL: &[u8] = b"InitDll\0";

/// A loaded engine module. The library stays mapped as long as the handle lives.
pub struct ModuleHandle {
    path: PathBuf,
    index: ModuleIndex,
    entry: Option<EngineEntry>,
    // Dropped last so `entry` never outlives the code it points into
    _library: Option<libloading::Library>,
}

impl ModuleHandle {
    /// A handle with no library behind it, for engines created in process.
    pub fn detached(path: impl Into<PathBuf>, index: ModuleIndex) -> Self {
        Self {
            path: path.into(),
            index,
            entry: None,
            _library: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> ModuleIndex {
        self.index
    }

    pub fn entry(&self) -> Option<EngineEntry> {
        self.entry
    }
}

pub struct ModuleLoader;

impl ModuleLoader {
    pub fn load(path: &Path, index: ModuleIndex) -> Result<ModuleHandle> {
        let fail = |reason: String| BridgeError::LoadFailed {
            path: path.to_path_buf(),
            stage: LoadStage::Loading,
            reason,
        };

        let library = unsafe {
            libloading::Library::new(path).map_err(|e| fail(format!("Failed to load library: {}", e)))?
        };

        // Optional one-time module initializer
        let init: std::result::Result<libloading::Symbol<unsafe extern "C" fn() -> bool>, _> =
            unsafe { library.get(INIT_SYMBOL) };
        if let Ok(init) = init {
            if !unsafe { init() } {
                return Err(fail("InitDll failed".to_string()));
            }
        }

        let entry: EngineEntry = unsafe {
            *library
                .get::<EngineEntry>(ENTRY_SYMBOL)
                .map_err(|e| fail(format!("No linbridge_engine_entry symbol: {}", e)))?
        };

        tracing::info!(module = %path.display(), index = index.to_raw(), "engine module loaded");
        Ok(ModuleHandle {
            path: path.to_path_buf(),
            index,
            entry: Some(entry),
            _library: Some(library),
        })
    }
}
