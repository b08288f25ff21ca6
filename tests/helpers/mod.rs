//! Test helpers and fixtures for linbridge integration tests
//!
//! The server side runs on a thread in the test process, attached to the
//! same named regions a real `linbridge-server` would open. Everything the
//! host sees goes through the real client, mailboxes and dispatch table.

#![allow(dead_code)]

use linbridge::plugin::{
    BootArgs, BridgeConfig, ChunkMode, Event, HostCallbacks, ModuleIndex, ModuleSpec,
    RemoteEffect, Result, ServerLauncher, ServerProcess, SessionOptions,
};
use linbridge::server::{
    serve, EngineFactory, HostLink, InnerEngine, ModuleHandle, ServerConfig,
};
use linbridge::{BridgeError, EffectInfo, LoadStage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const TEST_CHANNELS: u32 = 2;
pub const TEST_FRAMES: u32 = 64;
pub const TEST_CHUNK_CAPACITY: u32 = 1024;
pub const PARAM_COUNT: usize = 4;

pub const VENDOR: &str = "TestVendor";
pub const EFFECT_NAME: &str = "Passthrough";

// =============================================================================
// Mock engine
// =============================================================================

/// State of a [`PassthroughEngine`], readable from the test thread.
#[derive(Default)]
pub struct EngineProbe {
    pub params: Mutex<[f32; PARAM_COUNT]>,
    pub chunk: Mutex<Vec<u8>>,
    pub events: Mutex<Vec<Event>>,
    pub sample_rate: Mutex<f32>,
    pub opened: AtomicBool,
    pub closed: AtomicBool,
    pub blocks: AtomicUsize,
}

/// Copies inputs to outputs. Reports parameter edits back to the host.
pub struct PassthroughEngine {
    probe: Arc<EngineProbe>,
    host: HostLink,
}

impl InnerEngine for PassthroughEngine {
    fn info(&self) -> EffectInfo {
        EffectInfo {
            num_inputs: TEST_CHANNELS as i32,
            num_outputs: TEST_CHANNELS as i32,
            num_params: PARAM_COUNT as i32,
            num_programs: 1,
            version: 1000,
            ..EffectInfo::default()
        }
    }

    fn class_id(&self) -> String {
        "TestVendor.Passthrough".to_string()
    }

    fn open(&self) {
        self.probe.opened.store(true, Ordering::Release);
    }

    fn close(&self) {
        self.probe.closed.store(true, Ordering::Release);
    }

    fn set_sample_rate(&self, rate: f32) {
        *self.probe.sample_rate.lock() = rate;
    }

    fn name(&self) -> String {
        EFFECT_NAME.to_string()
    }

    fn vendor(&self) -> String {
        VENDOR.to_string()
    }

    fn product(&self) -> String {
        format!("{} {}", VENDOR, EFFECT_NAME)
    }

    fn vendor_version(&self) -> i32 {
        1000
    }

    fn parameter(&self, index: i32) -> f32 {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.probe.params.lock().get(i).copied())
            .unwrap_or(0.0)
    }

    fn set_parameter(&self, index: i32, value: f32) {
        let Some(slot) = usize::try_from(index).ok().filter(|&i| i < PARAM_COUNT) else {
            return;
        };
        self.probe.params.lock()[slot] = value;
        self.host.automate(index, value);
    }

    fn parameter_name(&self, index: i32) -> String {
        format!("Param {}", index)
    }

    fn chunk(&self, _preset: bool) -> Vec<u8> {
        self.probe.chunk.lock().clone()
    }

    fn set_chunk(&self, data: &[u8], _preset: bool) -> i32 {
        *self.probe.chunk.lock() = data.to_vec();
        1
    }

    fn process_events(&self, events: &[Event]) -> bool {
        self.probe.events.lock().extend_from_slice(events);
        true
    }

    fn process_replacing(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) {
        for (out, input) in outputs.iter_mut().zip(inputs) {
            out.copy_from_slice(input);
        }
        self.probe.blocks.fetch_add(1, Ordering::AcqRel);
    }
}

/// Hands out [`PassthroughEngine`]s sharing one probe.
pub struct TestFactory {
    pub probe: Arc<EngineProbe>,
    pub refuse: bool,
}

impl TestFactory {
    pub fn new() -> Self {
        Self {
            probe: Arc::new(EngineProbe::default()),
            refuse: false,
        }
    }

    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::new()
        }
    }
}

impl EngineFactory for TestFactory {
    fn load_module(&self, args: &BootArgs) -> Result<ModuleHandle> {
        Ok(ModuleHandle::detached(args.path.clone(), args.module))
    }

    fn instantiate(&self, module: &ModuleHandle, host: HostLink) -> Result<Arc<dyn InnerEngine>> {
        if self.refuse {
            return Err(BridgeError::LoadFailed {
                path: module.path().to_path_buf(),
                stage: LoadStage::Instantiation,
                reason: "refused by test factory".to_string(),
            });
        }
        Ok(Arc::new(PassthroughEngine {
            probe: Arc::clone(&self.probe),
            host,
        }))
    }
}

// =============================================================================
// Host callbacks
// =============================================================================

#[derive(Default)]
pub struct RecordingCallbacks {
    pub automated: Mutex<Vec<(i32, f32)>>,
    pub disconnected: AtomicBool,
}

impl HostCallbacks for RecordingCallbacks {
    fn automate(&self, index: i32, value: f32) {
        self.automated.lock().push((index, value));
    }

    fn vendor_string(&self) -> String {
        "linbridge tests".to_string()
    }

    fn disconnected(&self) {
        self.disconnected.store(true, Ordering::Release);
    }
}

// =============================================================================
// In-process server
// =============================================================================

/// Runs the server session on a thread instead of a child process.
pub struct ThreadLauncher {
    factory: Arc<dyn EngineFactory>,
    config: ServerConfig,
    pub finished: Arc<AtomicUsize>,
}

impl ThreadLauncher {
    pub fn new(factory: Arc<dyn EngineFactory>, shm_prefix: &str) -> Self {
        Self {
            factory,
            config: ServerConfig {
                shm_prefix: shm_prefix.to_string(),
                ack_timeout: Duration::from_secs(5),
                shutdown_bound: Duration::from_secs(2),
                callback_timeout: Duration::from_secs(2),
                ..ServerConfig::default()
            },
            finished: Arc::new(AtomicUsize::new(0)),
        }
    }
}

pub struct ServerThread {
    handle: Option<JoinHandle<Result<()>>>,
}

impl ServerProcess for ServerThread {
    fn has_exited(&mut self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.has_exited() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        true
    }

    // Threads cannot be killed; the session's own exit path ends them.
    fn kill(&mut self) {
        self.handle.take();
    }
}

impl ServerLauncher for ThreadLauncher {
    fn launch(&self, args: &BootArgs) -> Result<Box<dyn ServerProcess>> {
        let factory = Arc::clone(&self.factory);
        let config = self.config.clone();
        let finished = Arc::clone(&self.finished);
        let args = args.clone();
        let handle = thread::Builder::new()
            .name("test-server".to_string())
            .spawn(move || {
                let result = serve(&args, &config, factory.as_ref());
                finished.fetch_add(1, Ordering::AcqRel);
                result
            })?;
        Ok(Box::new(ServerThread {
            handle: Some(handle),
        }))
    }
}

// =============================================================================
// Sessions
// =============================================================================

/// Config with small regions and a prefix unique to `tag`.
pub fn test_config(tag: &str, options: SessionOptions) -> BridgeConfig {
    let mut config = BridgeConfig {
        shm_prefix: format!("lbtest_{}_{}_", tag, std::process::id()),
        options,
        control_timeout_ms: 5_000,
        audio_timeout_ms: 5_000,
        boot_timeout_ms: 5_000,
        shutdown_wait_ms: 5_000,
        ..BridgeConfig::default()
    };
    config.geometry.max_channels = TEST_CHANNELS;
    config.geometry.max_frames = TEST_FRAMES;
    config.geometry.chunk_capacity = TEST_CHUNK_CAPACITY;
    config.geometry.max_parameters = PARAM_COUNT as u32;
    config
}

pub fn buffered_chunks() -> SessionOptions {
    SessionOptions {
        chunk_mode: ChunkMode::Buffered,
        ..SessionOptions::default()
    }
}

/// A connected session plus the handles tests poke at.
pub struct TestSession {
    pub effect: RemoteEffect,
    pub probe: Arc<EngineProbe>,
    pub callbacks: Arc<RecordingCallbacks>,
    pub finished: Arc<AtomicUsize>,
}

pub fn start_session(tag: &str, options: SessionOptions) -> TestSession {
    try_start_session(tag, options, TestFactory::new()).expect("Failed to start test session")
}

pub fn try_start_session(
    tag: &str,
    options: SessionOptions,
    factory: TestFactory,
) -> Result<TestSession> {
    let config = test_config(tag, options);
    let probe = Arc::clone(&factory.probe);
    let launcher = ThreadLauncher::new(Arc::new(factory), &config.shm_prefix);
    let finished = Arc::clone(&launcher.finished);
    let callbacks = Arc::new(RecordingCallbacks::default());

    let module = ModuleSpec {
        path: "/plugins/Passthrough.vst3".into(),
        index: ModuleIndex::FirstCompatible,
    };
    let effect = RemoteEffect::connect(config, module, callbacks.clone(), &launcher)?;
    Ok(TestSession {
        effect,
        probe,
        callbacks,
        finished,
    })
}

/// Poll `condition` until it holds or `max_wait_ms` passes.
pub fn wait_until(max_wait_ms: u64, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    let timeout = Duration::from_millis(max_wait_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Generate an integer staircase signal [offset, offset + 1, ...] as f32.
pub fn staircase(num_samples: usize, offset: f32) -> Vec<f32> {
    (0..num_samples).map(|i| i as f32 + offset).collect()
}
