//! Builder for configuring and opening a bridged plugin session.

use linbridge_plugin::{
    resolve_module, BridgeConfig, ChunkMode, HostCallbacks, ModuleSpec, NullCallbacks,
    RemoteEffect, Result, ServerLauncher,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Every option is resolved here, once, and written into the session's boot
/// header; the server reads the same values from there.
///
/// # Example
///
/// ```ignore
/// use linbridge::prelude::*;
///
/// let effect = SessionBuilder::new()
///     .parameter_cache(true)
///     .chunk_mode(ChunkMode::Buffered)
///     .load("/home/me/.vst/Synth.so")?;
///
/// effect.open()?;
/// println!("{}", effect.name()?);
/// ```
pub struct SessionBuilder {
    config: BridgeConfig,
    callbacks: Arc<dyn HostCallbacks>,
    launcher: Option<Arc<dyn ServerLauncher>>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            config: BridgeConfig::default(),
            callbacks: Arc::new(NullCallbacks),
            launcher: None,
        }
    }
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration, e.g. one loaded from disk.
    pub fn from_config(config: BridgeConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Default: `linbridge-server` next to the current executable.
    pub fn server_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.server_path = Some(path.into());
        self
    }

    pub fn shm_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.shm_prefix = prefix.into();
        self
    }

    /// Default: 16
    pub fn max_channels(mut self, channels: u32) -> Self {
        self.config.geometry.max_channels = channels;
        self
    }

    /// Default: 8192
    pub fn max_frames(mut self, frames: u32) -> Self {
        self.config.geometry.max_frames = frames;
        self
    }

    /// Size of the chunk region in bytes. Default: 512 KiB
    pub fn chunk_capacity(mut self, bytes: u32) -> Self {
        self.config.geometry.chunk_capacity = bytes;
        self
    }

    pub fn max_parameters(mut self, count: u32) -> Self {
        self.config.geometry.max_parameters = count;
        self
    }

    /// Serve parameter opcodes on their own server thread. Default: true
    pub fn parameter_thread(mut self, enabled: bool) -> Self {
        self.config.options.parameter_thread = enabled;
        self
    }

    /// Answer parameter reads from a shared cache. Default: false
    pub fn parameter_cache(mut self, enabled: bool) -> Self {
        self.config.options.parameter_cache = enabled;
        self
    }

    pub fn chunk_mode(mut self, mode: ChunkMode) -> Self {
        self.config.options.chunk_mode = mode;
        self
    }

    pub fn drag_tracking(mut self, enabled: bool) -> Self {
        self.config.options.drag_tracking = enabled;
        self
    }

    pub fn control_timeout(mut self, timeout: Duration) -> Self {
        self.config.control_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn audio_timeout(mut self, timeout: Duration) -> Self {
        self.config.audio_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn boot_timeout(mut self, timeout: Duration) -> Self {
        self.config.boot_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn callbacks(mut self, callbacks: Arc<dyn HostCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Replace the default child-process launcher.
    pub fn launcher(mut self, launcher: Arc<dyn ServerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Resolve the engine module next to `wrapper` and open a session for it.
    pub fn load(self, wrapper: impl AsRef<Path>) -> Result<RemoteEffect> {
        let wrapper = wrapper.as_ref();
        tracing::debug!(wrapper = %wrapper.display(), options = ?self.config.options, "opening session");
        match self.launcher {
            Some(launcher) => {
                let module = resolve_module(wrapper)?;
                RemoteEffect::connect(self.config, module, self.callbacks, &*launcher)
            }
            None => RemoteEffect::load(self.config, wrapper, self.callbacks),
        }
    }

    /// Open a session for an already resolved module.
    pub fn connect(self, module: ModuleSpec) -> Result<RemoteEffect> {
        match self.launcher {
            Some(launcher) => RemoteEffect::connect(self.config, module, self.callbacks, &*launcher),
            None => {
                let launcher = linbridge_plugin::ProcessLauncher::from_config(&self.config)?;
                RemoteEffect::connect(self.config, module, self.callbacks, &launcher)
            }
        }
    }
}
