//! Server session: attach the regions, bring up the loops, serve until the
//! host closes or goes away.
//!
//! Startup order matters. The four worker threads exist (parked) before the
//! host is told the server is ready, and the engine only sees a live
//! [`HostLink`] once the host has acknowledged, so no callback can reach a
//! host that is not listening yet.

use crate::dispatch::{dispatch, ServerContext};
use crate::engine::{EngineFactory, PointerTracker};
use crate::orchestrator::{ContextKind, ExecutionContext, ExitFlag, LoopControl, ThreadSet};
use crate::relay::{mark_audio_thread, HostLink, SessionState};
use linbridge_plugin::bootstrap::{announce_ready, SHM_PREFIX_ENV};
use linbridge_plugin::control::{ControlRegion, Responder, Served};
use linbridge_plugin::protocol::PROTOCOL_VERSION;
use linbridge_plugin::shared_memory::{RegionNames, Shared};
use linbridge_plugin::{
    AudioBus, BootArgs, BridgeError, ChunkArea, Geometry, LoadStage, MailboxKind, ParamCache,
    Result, SessionOptions,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_SHM_PREFIX: &str = "linbridge_";
const POINTER_INTERVAL: Duration = Duration::from_millis(1);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

/// Server-side knobs. Everything the host decides arrives in the boot header.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub shm_prefix: String,
    /// How long to wait for `HOST_ACK` after announcing readiness.
    pub ack_timeout: Duration,
    /// Responder wait per loop iteration.
    pub poll_interval: Duration,
    /// Bound on joining the worker threads at shutdown.
    pub shutdown_bound: Duration,
    /// Timeout for one callback round trip to the host.
    pub callback_timeout: Duration,
    /// Exit when the host process disappears.
    pub watch_host: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shm_prefix: DEFAULT_SHM_PREFIX.to_string(),
            ack_timeout: Duration::from_secs(40),
            poll_interval: Duration::from_millis(5),
            shutdown_bound: Duration::from_secs(5),
            callback_timeout: Duration::from_secs(60),
            watch_host: true,
        }
    }
}

impl ServerConfig {
    /// Defaults, with the region prefix taken from the environment the
    /// launcher prepared.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(prefix) = std::env::var(SHM_PREFIX_ENV) {
            if !prefix.is_empty() {
                config.shm_prefix = prefix;
            }
        }
        config
    }
}

/// The session's shared regions, opened from the server side.
pub struct ServerRegions {
    pub control: Arc<Shared<ControlRegion>>,
    pub audio: Arc<AudioBus>,
    pub params: Option<ParamCache>,
    pub chunk: ChunkArea,
    pub options: SessionOptions,
    pub geometry: Geometry,
    pub host_pid: u32,
}

impl ServerRegions {
    pub fn attach(args: &BootArgs, prefix: &str) -> Result<Self> {
        let fail = |reason: String| BridgeError::LoadFailed {
            path: args.path.clone(),
            stage: LoadStage::Attaching,
            reason,
        };
        let names = RegionNames::for_session(prefix, &args.session);

        let control = Shared::<ControlRegion>::open(&names.control)
            .map_err(|e| fail(format!("control region: {}", e)))?;
        let version = control.boot.protocol_version();
        if version != PROTOCOL_VERSION {
            return Err(fail(format!(
                "protocol version {} does not match {}",
                version, PROTOCOL_VERSION
            )));
        }

        let options = control.boot.options();
        let geometry = control.boot.geometry();
        let host_pid = control.boot.host_pid();

        let audio = AudioBus::open(&names.audio, &geometry)
            .map_err(|e| fail(format!("audio region: {}", e)))?;
        let params = if options.parameter_cache {
            Some(
                ParamCache::open(&names.params, geometry.max_parameters as usize)
                    .map_err(|e| fail(format!("parameter region: {}", e)))?,
            )
        } else {
            None
        };
        let chunk = ChunkArea::open(&names.chunk, geometry.chunk_capacity as usize)
            .map_err(|e| fail(format!("chunk region: {}", e)))?;

        Ok(Self {
            control: Arc::new(control),
            audio: Arc::new(audio),
            params,
            chunk,
            options,
            geometry,
            host_pid,
        })
    }
}

// ============================================================================
// Loop bodies
// ============================================================================

/// Serves one mailbox through the dispatch table.
struct MailboxLoop {
    ctx: Arc<ServerContext>,
    responder: Responder,
    exit: ExitFlag,
    poll: Duration,
    audio: bool,
    drains_parameters: bool,
}

impl MailboxLoop {
    fn new(ctx: &Arc<ServerContext>, responder: Responder, exit: &ExitFlag, poll: Duration) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            responder,
            exit: exit.clone(),
            poll,
            audio: false,
            drains_parameters: false,
        }
    }

    fn audio(mut self) -> Self {
        self.audio = true;
        self
    }

    fn draining_parameters(mut self) -> Self {
        self.drains_parameters = true;
        self
    }
}

impl ExecutionContext for MailboxLoop {
    fn enter(&mut self) {
        if self.audio {
            mark_audio_thread();
        }
        tracing::debug!(mailbox = ?self.responder.kind(), "loop started");
    }

    fn run_once(&mut self) -> LoopControl {
        if self.drains_parameters {
            self.ctx.drain_parameters();
        }
        let ctx = &self.ctx;
        let exit = &self.exit;
        match self
            .responder
            .serve_one(self.poll, || exit.is_set(), |ex| dispatch(ctx, ex))
        {
            Served::Cancelled => LoopControl::Break,
            Served::Idle | Served::Handled => LoopControl::Continue,
        }
    }
}

struct PointerLoop {
    tracker: Box<dyn PointerTracker>,
    exit: ExitFlag,
}

impl ExecutionContext for PointerLoop {
    fn run_once(&mut self) -> LoopControl {
        self.tracker.poll_once();
        if self.exit.sleep(POINTER_INTERVAL) {
            LoopControl::Break
        } else {
            LoopControl::Continue
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Whether the host process still exists. Unknown pids count as alive.
#[cfg(target_os = "linux")]
pub fn host_alive(pid: u32) -> bool {
    pid == 0 || std::path::Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(target_os = "linux"))]
pub fn host_alive(_pid: u32) -> bool {
    true
}

fn thread_setup(args: &BootArgs, e: BridgeError) -> BridgeError {
    BridgeError::LoadFailed {
        path: args.path.clone(),
        stage: LoadStage::ThreadSetup,
        reason: e.to_string(),
    }
}

/// Run one server session to completion.
pub fn serve(args: &BootArgs, config: &ServerConfig, factory: &dyn EngineFactory) -> Result<()> {
    tracing::info!(session = %args.session, module = %args.path.display(), "attaching session");
    let regions = ServerRegions::attach(args, &config.shm_prefix)?;
    let options = regions.options;

    let exit = ExitFlag::new();
    let state = Arc::new(SessionState::new(exit.clone()));
    let mut threads = ThreadSet::new(exit.clone());

    let mut kinds = vec![ContextKind::Audio, ContextKind::Control];
    if options.parameter_thread {
        kinds.push(ContextKind::Parameter);
    }
    let tracker = if options.drag_tracking {
        factory.pointer_tracker()
    } else {
        None
    };
    if tracker.is_some() {
        kinds.push(ContextKind::PointerTracking);
    }
    for &kind in &kinds {
        threads
            .spawn_suspended(kind)
            .map_err(|e| thread_setup(args, e))?;
    }

    let module = factory.load_module(args)?;
    announce_ready(&regions.control.boot, config.ack_timeout)?;
    tracing::info!(session = %args.session, "host acknowledged");

    let link = HostLink::new(
        Arc::clone(&state),
        Arc::clone(&regions.control),
        Arc::clone(&regions.audio),
        config.callback_timeout,
    );
    let engine = match factory.instantiate(&module, link.clone()) {
        Ok(engine) => engine,
        Err(e) => {
            link.disconnect();
            return Err(e);
        }
    };

    let ctx = Arc::new(ServerContext::new(
        engine,
        Arc::clone(&state),
        Arc::clone(&regions.audio),
        regions.params,
        regions.chunk,
        options,
        regions.geometry,
    ));

    let poll = config.poll_interval;
    let responder = |kind| Responder::new(Arc::clone(&regions.control), kind);
    let mut tracker = tracker;
    for &kind in &kinds {
        let body: Box<dyn ExecutionContext> = match kind {
            ContextKind::Audio => {
                Box::new(MailboxLoop::new(&ctx, responder(MailboxKind::Audio), &exit, poll).audio())
            }
            ContextKind::Control => {
                Box::new(MailboxLoop::new(&ctx, responder(MailboxKind::Control), &exit, poll))
            }
            ContextKind::Parameter => Box::new(
                MailboxLoop::new(&ctx, responder(MailboxKind::Parameter), &exit, poll)
                    .draining_parameters(),
            ),
            ContextKind::PointerTracking => match tracker.take() {
                Some(tracker) => Box::new(PointerLoop {
                    tracker,
                    exit: exit.clone(),
                }),
                None => continue,
            },
        };
        if let Err(e) = threads.resume(kind, body) {
            link.disconnect();
            threads.shutdown(|| {}, config.shutdown_bound);
            return Err(thread_setup(args, e));
        }
    }
    tracing::info!(session = %args.session, threads = kinds.len(), "session running");

    // The editor lives on the main thread.
    let editor = responder(MailboxKind::Editor);
    let mut next_watch = Instant::now() + WATCHDOG_INTERVAL;
    while !exit.is_set() {
        editor.serve_one(poll, || exit.is_set(), |ex| dispatch(&ctx, ex));
        if config.watch_host && Instant::now() >= next_watch {
            next_watch = Instant::now() + WATCHDOG_INTERVAL;
            if !host_alive(regions.host_pid) {
                tracing::warn!(pid = regions.host_pid, "host process is gone");
                exit.set();
            }
        }
    }

    let responders: Vec<Responder> = [MailboxKind::Audio, MailboxKind::Control, MailboxKind::Parameter]
        .into_iter()
        .map(responder)
        .collect();
    let report = threads.shutdown(
        || responders.iter().for_each(Responder::wake),
        config.shutdown_bound,
    );

    if state.is_effect_open() {
        ctx.engine.close();
        state.set_effect_open(false);
    }
    drop(link);
    drop(ctx);

    if report.is_clean() {
        drop(module);
    } else {
        // A detached loop may still be running engine code.
        tracing::warn!(detached = ?report.detached, "keeping engine module mapped");
        std::mem::forget(module);
    }
    tracing::info!(session = %args.session, "session finished");
    Ok(())
}
