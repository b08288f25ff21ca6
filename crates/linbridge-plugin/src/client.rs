//! Host-side session: a remote engine driven like an in-process one.
//!
//! Every method marshals into a mailbox of the control region, runs one
//! round trip and unmarshals the typed result. A round trip that times out
//! closes the session; every later call fails fast with
//! [`BridgeError::SessionClosed`].

use crate::audio::{AudioBus, EventLane, Plane, Sample};
use crate::bootstrap::{await_server_ready, BootArgs, ProcessLauncher, ServerLauncher, ServerProcess};
use crate::callbacks::{CallbackService, HostCallbacks};
use crate::chunk::{segments, ChunkArea, ChunkTier};
use crate::control::{ClosedFlag, ControlRegion, Reply, Request, Requester};
use crate::error::{BridgeError, Result};
use crate::events::Event;
use crate::module::{resolve_module, ModuleSpec};
use crate::param_cache::ParamCache;
use crate::protocol::{
    BridgeConfig, EditorRect, EffectInfo, EffectOpcode, MailboxKind, PlugCategory, Precision,
    ProcessBlock, TimeInfo, MAX_NAME_LEN,
};
use crate::shared_memory::{RegionNames, Shared};
use parking_lot::Mutex;
use std::cell::Cell;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub struct RemoteEffect {
    config: BridgeConfig,
    session: String,
    control: Arc<Shared<ControlRegion>>,
    audio: Arc<AudioBus>,
    params: Option<ParamCache>,
    chunk: ChunkArea,
    control_mailbox: Requester,
    parameter_mailbox: Requester,
    audio_mailbox: Requester,
    editor_mailbox: Requester,
    /// Serializes whole chunk transfers, which may span several round trips.
    chunk_transfer: Mutex<()>,
    closed: ClosedFlag,
    callbacks: Mutex<Option<CallbackService>>,
    process: Mutex<Option<Box<dyn ServerProcess>>>,
}

impl RemoteEffect {
    /// Resolve the engine module behind `wrapper` and start a server for it.
    pub fn load(
        config: BridgeConfig,
        wrapper: &Path,
        callbacks: Arc<dyn HostCallbacks>,
    ) -> Result<Self> {
        let module = resolve_module(wrapper)?;
        let launcher = ProcessLauncher::from_config(&config)?;
        Self::connect(config, module, callbacks, &launcher)
    }

    /// Create the session regions, launch the server and wait for it to be ready.
    pub fn connect(
        config: BridgeConfig,
        module: ModuleSpec,
        callbacks: Arc<dyn HostCallbacks>,
        launcher: &dyn ServerLauncher,
    ) -> Result<Self> {
        let session = crate::bootstrap::new_session_id();
        let names = RegionNames::for_session(&config.shm_prefix, &session);
        let geometry = config.geometry;

        let control = Arc::new(Shared::<ControlRegion>::create(&names.control)?);
        let audio = Arc::new(AudioBus::create(&names.audio, &geometry)?);
        let params = if config.options.parameter_cache {
            Some(ParamCache::create(
                &names.params,
                geometry.max_parameters as usize,
            )?)
        } else {
            None
        };
        let chunk = ChunkArea::create(&names.chunk, geometry.chunk_capacity as usize)?;
        control
            .boot
            .publish(&geometry, config.options, std::process::id());

        let closed = ClosedFlag::new();
        let callback_service = CallbackService::spawn(
            Arc::clone(&control),
            Arc::clone(&audio),
            callbacks,
            closed.clone(),
            Duration::from_millis(config.poll_interval_ms),
        )?;

        let args = BootArgs {
            module: module.index,
            path: module.path,
            session: session.clone(),
        };
        let mut process = launcher.launch(&args)?;
        let boot_timeout = Duration::from_millis(config.boot_timeout_ms);
        if let Err(e) = await_server_ready(&control.boot, boot_timeout, || !process.has_exited()) {
            tracing::error!(session = %session, "server never became ready: {}", e);
            process.kill();
            return Err(e);
        }
        tracing::info!(session = %session, "server ready");

        let requester = |kind| Requester::new(Arc::clone(&control), kind, closed.clone());
        Ok(Self {
            control_mailbox: requester(MailboxKind::Control),
            parameter_mailbox: requester(MailboxKind::Parameter),
            audio_mailbox: requester(MailboxKind::Audio),
            editor_mailbox: requester(MailboxKind::Editor),
            config,
            session,
            control,
            audio,
            params,
            chunk,
            chunk_transfer: Mutex::new(()),
            closed,
            callbacks: Mutex::new(Some(callback_service)),
            process: Mutex::new(Some(process)),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    // ========================================================================
    // Round trips
    // ========================================================================

    fn call<T>(
        &self,
        opcode: EffectOpcode,
        marshal: impl FnOnce(&mut Request<'_>) -> Result<()>,
        unmarshal: impl FnOnce(&Reply<'_>) -> Result<T>,
    ) -> Result<T> {
        let spec = opcode.spec();
        let (requester, timeout_ms) = match self.config.options.route(spec.mailbox) {
            MailboxKind::Control => (&self.control_mailbox, self.config.control_timeout_ms),
            MailboxKind::Parameter => (&self.parameter_mailbox, self.config.control_timeout_ms),
            MailboxKind::Audio => (&self.audio_mailbox, self.config.audio_timeout_ms),
            MailboxKind::Editor => (&self.editor_mailbox, self.config.control_timeout_ms),
            MailboxKind::Callback => {
                return Err(BridgeError::ProtocolError(format!(
                    "{} is not a host request",
                    spec.name
                )))
            }
        };
        requester.call(
            opcode as i32,
            spec.name,
            Duration::from_millis(timeout_ms),
            marshal,
            unmarshal,
        )
    }

    fn call_int(&self, opcode: EffectOpcode, value: i32, value2: i32, opt: f32) -> Result<i64> {
        self.call(
            opcode,
            |req| {
                req.set_value(value);
                req.set_value2(value2);
                req.set_float(opt);
                Ok(())
            },
            |reply| Ok(reply.ret_int()),
        )
    }

    fn call_text(&self, opcode: EffectOpcode, value: i32) -> Result<String> {
        self.call(
            opcode,
            |req| {
                req.set_value(value);
                Ok(())
            },
            |reply| Ok(reply.text()),
        )
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn open(&self) -> Result<()> {
        self.call_int(EffectOpcode::Open, 0, 0, 0.0).map(|_| ())
    }

    pub fn suspend(&self) -> Result<()> {
        self.call_int(EffectOpcode::Suspend, 0, 0, 0.0).map(|_| ())
    }

    pub fn resume(&self) -> Result<()> {
        self.call_int(EffectOpcode::Resume, 0, 0, 0.0).map(|_| ())
    }

    pub fn set_sample_rate(&self, sample_rate: f32) -> Result<()> {
        self.call_int(EffectOpcode::SetSampleRate, 0, 0, sample_rate)
            .map(|_| ())
    }

    pub fn set_block_size(&self, frames: i32) -> Result<()> {
        self.call_int(EffectOpcode::SetBlockSize, frames, 0, 0.0)
            .map(|_| ())
    }

    pub fn start_process(&self) -> Result<()> {
        self.call_int(EffectOpcode::StartProcess, 0, 0, 0.0).map(|_| ())
    }

    pub fn stop_process(&self) -> Result<()> {
        self.call_int(EffectOpcode::StopProcess, 0, 0, 0.0).map(|_| ())
    }

    pub fn reset(&self) -> Result<()> {
        self.call_int(EffectOpcode::Reset, 0, 0, 0.0).map(|_| ())
    }

    /// Returns whether the engine accepted the precision.
    pub fn set_precision(&self, precision: Precision) -> Result<bool> {
        let raw = match precision {
            Precision::Single => 0,
            Precision::Double => 1,
        };
        Ok(self.call_int(EffectOpcode::SetPrecision, raw, 0, 0.0)? != 0)
    }

    /// End the session: ask the server to exit, stop the callback thread,
    /// reap the process and release the shared memory.
    pub fn close(&self) -> Result<()> {
        if self.closed.is_closed() && self.process.lock().is_none() {
            return Ok(());
        }
        let result = if self.closed.is_closed() {
            Ok(())
        } else {
            self.call_int(EffectOpcode::Close, 0, 0, 0.0).map(|_| ())
        };
        self.closed.close();
        // Host threads still inside a call must not wait out their timeout
        self.control.wake_responses(&[
            MailboxKind::Control,
            MailboxKind::Parameter,
            MailboxKind::Audio,
            MailboxKind::Editor,
        ]);

        if let Some(mut service) = self.callbacks.lock().take() {
            service.shutdown();
        }
        // A server blocked on a callback reply must not outlive the host thread
        self.control.mailbox(MailboxKind::Callback).wake_all();
        if let Some(mut process) = self.process.lock().take() {
            let wait = Duration::from_millis(self.config.shutdown_wait_ms);
            if !process.wait_timeout(wait) {
                tracing::warn!(session = %self.session, "server did not exit, killing it");
                process.kill();
            }
        }
        tracing::info!(session = %self.session, "session closed");
        result
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn info(&self) -> Result<EffectInfo> {
        self.call(EffectOpcode::GetEffectInfo, |_| Ok(()), |reply| reply.value())
    }

    pub fn name(&self) -> Result<String> {
        self.call_text(EffectOpcode::GetName, 0)
    }

    pub fn vendor(&self) -> Result<String> {
        self.call_text(EffectOpcode::GetVendor, 0)
    }

    pub fn product(&self) -> Result<String> {
        self.call_text(EffectOpcode::GetProduct, 0)
    }

    pub fn vendor_version(&self) -> Result<i32> {
        Ok(self.call_int(EffectOpcode::GetVendorVersion, 0, 0, 0.0)? as i32)
    }

    pub fn category(&self) -> Result<PlugCategory> {
        Ok(PlugCategory::from_raw(
            self.call_int(EffectOpcode::GetCategory, 0, 0, 0.0)? as i32,
        ))
    }

    pub fn can_do(&self, capability: &str) -> Result<i32> {
        let ret = self.call(
            EffectOpcode::CanDo,
            |req| {
                req.set_text(capability, MAX_NAME_LEN);
                Ok(())
            },
            |reply| Ok(reply.ret_int()),
        )?;
        Ok(ret as i32)
    }

    // ========================================================================
    // Programs
    // ========================================================================

    pub fn set_program(&self, index: i32) -> Result<()> {
        self.call_int(EffectOpcode::SetProgram, index, 0, 0.0).map(|_| ())
    }

    pub fn program(&self) -> Result<i32> {
        Ok(self.call_int(EffectOpcode::GetProgram, 0, 0, 0.0)? as i32)
    }

    pub fn program_name(&self) -> Result<String> {
        self.call_text(EffectOpcode::GetProgramName, 0)
    }

    pub fn program_name_indexed(&self, index: i32) -> Result<Option<String>> {
        self.call(
            EffectOpcode::GetProgramNameIndexed,
            |req| {
                req.set_value(index);
                Ok(())
            },
            |reply| Ok((reply.ret_int() != 0).then(|| reply.text())),
        )
    }

    // ========================================================================
    // Parameters
    // ========================================================================

    /// With the parameter cache enabled this is a local write picked up on
    /// the server's next drain.
    pub fn set_parameter(&self, index: i32, value: f32) -> Result<()> {
        if let Some(cache) = &self.params {
            if self.closed.is_closed() {
                return Err(BridgeError::session_closed("SetParameter"));
            }
            if index >= 0 && cache.write(index as usize, value) {
                return Ok(());
            }
        }
        self.call_int(EffectOpcode::SetParameter, index, 0, value)
            .map(|_| ())
    }

    pub fn get_parameter(&self, index: i32) -> Result<f32> {
        if let Some(cache) = &self.params {
            if let Some(value) = usize::try_from(index).ok().and_then(|i| cache.value(i)) {
                return Ok(value);
            }
        }
        self.call(
            EffectOpcode::GetParameter,
            |req| {
                req.set_value(index);
                Ok(())
            },
            |reply| Ok(reply.ret_float()),
        )
    }

    pub fn parameter_name(&self, index: i32) -> Result<String> {
        self.call_text(EffectOpcode::GetParameterName, index)
    }

    pub fn parameter_label(&self, index: i32) -> Result<String> {
        self.call_text(EffectOpcode::GetParameterLabel, index)
    }

    pub fn parameter_display(&self, index: i32) -> Result<String> {
        self.call_text(EffectOpcode::GetParameterDisplay, index)
    }

    pub fn can_be_automated(&self, index: i32) -> Result<bool> {
        Ok(self.call_int(EffectOpcode::CanBeAutomated, index, 0, 0.0)? != 0)
    }

    // ========================================================================
    // Chunks
    // ========================================================================

    pub fn get_chunk(&self, preset: bool) -> Result<Vec<u8>> {
        let _transfer = self.chunk_transfer.lock();
        let capacity = self.chunk.capacity();
        let mode = self.config.options.chunk_mode;

        let inline = Cell::new(None);
        let size = self.call(
            EffectOpcode::GetChunk,
            |req| {
                req.set_value(preset as i32);
                Ok(())
            },
            |reply| {
                let size = usize::try_from(reply.ret_int()).map_err(|_| {
                    BridgeError::ProtocolError(format!("chunk size {}", reply.ret_int()))
                })?;
                // Read the inline tier while the turn is still held
                if ChunkTier::for_size(size, capacity, mode) == ChunkTier::Inline {
                    inline.set(Some(self.chunk.read(size)?));
                }
                Ok(size)
            },
        )?;

        match ChunkTier::for_size(size, capacity, mode) {
            ChunkTier::Inline => Ok(inline.take().unwrap_or_default()),
            ChunkTier::Refused => Err(BridgeError::PayloadTooLarge {
                what: "chunk",
                required: size,
                capacity,
            }),
            ChunkTier::Segmented => {
                let mut data = Vec::with_capacity(size);
                for (offset, len) in segments(size, capacity) {
                    let segment = self.call(
                        EffectOpcode::GetChunkSegment,
                        |req| {
                            req.set_value(offset as i32);
                            Ok(())
                        },
                        |reply| {
                            if reply.ret_int() != len as i64 {
                                return Err(BridgeError::ProtocolError(format!(
                                    "chunk segment at {} is {} bytes, expected {}",
                                    offset,
                                    reply.ret_int(),
                                    len
                                )));
                            }
                            self.chunk.read(len)
                        },
                    )?;
                    data.extend_from_slice(&segment);
                }
                Ok(data)
            }
        }
    }

    /// Returns the engine's status for the restored chunk.
    pub fn set_chunk(&self, data: &[u8], preset: bool) -> Result<i32> {
        let _transfer = self.chunk_transfer.lock();
        let capacity = self.chunk.capacity();

        match ChunkTier::for_size(data.len(), capacity, self.config.options.chunk_mode) {
            ChunkTier::Inline => {}
            ChunkTier::Refused => {
                return Err(BridgeError::PayloadTooLarge {
                    what: "chunk",
                    required: data.len(),
                    capacity,
                })
            }
            ChunkTier::Segmented => {
                for (offset, len) in segments(data.len(), capacity) {
                    self.call(
                        EffectOpcode::SetChunkSegment,
                        |req| {
                            req.set_value(offset as i32);
                            req.set_value2(data.len() as i32);
                            self.chunk.write(&data[offset..offset + len])
                        },
                        |reply| Ok(reply.ret_int()),
                    )?;
                }
            }
        }

        let status = self.call(
            EffectOpcode::SetChunk,
            |req| {
                req.set_value(data.len() as i32);
                req.set_value2(preset as i32);
                if data.len() < capacity {
                    self.chunk.write(data)?;
                }
                Ok(())
            },
            |reply| Ok(reply.ret_int()),
        )?;
        Ok(status as i32)
    }

    // ========================================================================
    // Audio
    // ========================================================================

    /// Send events for the next process call. Returns how many were sent;
    /// a batch is truncated to what fits the event area.
    pub fn process_events(&self, events: &[Event]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let sent = Cell::new(0);
        let result = self.call(
            EffectOpcode::ProcessEvents,
            |_| {
                let outcome = self.audio.write_events(EventLane::ToServer, events)?;
                if outcome.dropped > 0 {
                    tracing::debug!(
                        sent = outcome.sent,
                        dropped = outcome.dropped,
                        "event batch truncated"
                    );
                }
                if outcome.is_empty() {
                    return Err(BridgeError::PayloadTooLarge {
                        what: "event batch",
                        required: events[0].encoded_len(),
                        capacity: crate::protocol::EVENT_AREA_BYTES,
                    });
                }
                sent.set(outcome.sent);
                Ok(())
            },
            |reply| Ok(reply.ret_int()),
        );
        match result {
            Ok(_) => Ok(sent.get()),
            Err(BridgeError::PayloadTooLarge { .. }) => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub fn process(
        &self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        time: Option<&TimeInfo>,
    ) -> Result<()> {
        self.process_with(EffectOpcode::Process, inputs, outputs, time)
    }

    pub fn process_double(
        &self,
        inputs: &[&[f64]],
        outputs: &mut [&mut [f64]],
        time: Option<&TimeInfo>,
    ) -> Result<()> {
        self.process_with(EffectOpcode::ProcessDouble, inputs, outputs, time)
    }

    fn process_with<T: Sample>(
        &self,
        opcode: EffectOpcode,
        inputs: &[&[T]],
        outputs: &mut [&mut [T]],
        time: Option<&TimeInfo>,
    ) -> Result<()> {
        let frames = inputs
            .first()
            .map(|c| c.len())
            .or_else(|| outputs.first().map(|c| c.len()))
            .unwrap_or(0);
        if frames == 0 {
            return Ok(());
        }
        if frames > self.audio.max_frames()
            || inputs.len() > self.audio.max_channels()
            || outputs.len() > self.audio.max_channels()
        {
            return Err(BridgeError::InvalidArgument(format!(
                "{} frames x {}/{} channels exceeds the audio region",
                frames,
                inputs.len(),
                outputs.len()
            )));
        }
        if inputs.iter().any(|c| c.len() != frames) || outputs.iter().any(|c| c.len() != frames) {
            return Err(BridgeError::InvalidArgument(
                "channels differ in length".to_string(),
            ));
        }

        let header = ProcessBlock {
            frames: frames as u32,
            inputs: inputs.len() as u32,
            outputs: outputs.len() as u32,
            time: time.copied(),
        };
        self.call(
            opcode,
            |req| {
                for (ch, data) in inputs.iter().enumerate() {
                    self.audio.write_channel(Plane::Input, ch, &data[..])?;
                }
                req.set_value(frames as i32);
                req.set_payload(&header)
            },
            |reply| {
                // The output plane still holds the previous block on failure
                if reply.ret_int() == 0 {
                    tracing::debug!(opcode = opcode.name(), "block failed, rendering silence");
                    for data in outputs.iter_mut() {
                        data.fill(T::default());
                    }
                    return Ok(());
                }
                for (ch, data) in outputs.iter_mut().enumerate() {
                    self.audio.read_channel_into(Plane::Output, ch, &mut data[..])?;
                }
                Ok(())
            },
        )
    }

    // ========================================================================
    // Editor
    // ========================================================================

    /// Open the editor inside `parent` (a native window id).
    pub fn open_editor(&self, parent: u64) -> Result<Option<EditorRect>> {
        self.call(
            EffectOpcode::OpenEditor,
            |req| req.set_payload(&parent),
            |reply| {
                if reply.ret_int() == 0 {
                    return Ok(None);
                }
                reply.value().map(Some)
            },
        )
    }

    pub fn close_editor(&self) -> Result<()> {
        self.call_int(EffectOpcode::CloseEditor, 0, 0, 0.0).map(|_| ())
    }

    pub fn editor_rect(&self) -> Result<Option<EditorRect>> {
        self.call(
            EffectOpcode::GetEditorRect,
            |_| Ok(()),
            |reply| {
                if reply.ret_int() == 0 {
                    return Ok(None);
                }
                reply.value().map(Some)
            },
        )
    }

    pub fn editor_idle(&self) -> Result<()> {
        self.call_int(EffectOpcode::EditorIdle, 0, 0, 0.0).map(|_| ())
    }
}

impl Drop for RemoteEffect {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::debug!("close on drop: {}", e);
        }
    }
}
