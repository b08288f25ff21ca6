//! Server-side opcode dispatch.
//!
//! [`HANDLERS`] maps every effect opcode to a small handler that unmarshals
//! from the control block, calls the engine and marshals the result back.

use crate::engine::{derive_unique_id, InnerEngine};
use crate::relay::SessionState;
use linbridge_plugin::chunk::{ChunkArea, ChunkAssembler, ChunkTier};
use linbridge_plugin::control::Exchange;
use linbridge_plugin::protocol::{EffectOpcode, ReplyKind, MAX_NAME_LEN};
use linbridge_plugin::{
    AudioBus, BridgeError, EventLane, Geometry, ParamCache, Plane, Precision, ProcessBlock,
    Result, Sample, SessionOptions,
};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;

/// Preallocated sample planes for one precision, sized for the region.
struct Planes<T> {
    inputs: Vec<Vec<T>>,
    outputs: Vec<Vec<T>>,
}

impl<T: Sample> Planes<T> {
    fn new(channels: usize, frames: usize) -> Self {
        Self {
            inputs: (0..channels).map(|_| vec![T::default(); frames]).collect(),
            outputs: (0..channels).map(|_| vec![T::default(); frames]).collect(),
        }
    }
}

struct Scratch {
    single: Planes<f32>,
    double: Planes<f64>,
}

/// Everything a handler can touch. One per session, shared by every loop.
pub struct ServerContext {
    pub engine: Arc<dyn InnerEngine>,
    pub state: Arc<SessionState>,
    pub audio: Arc<AudioBus>,
    pub params: Option<ParamCache>,
    pub chunk: ChunkArea,
    pub options: SessionOptions,
    pub geometry: Geometry,
    chunk_stash: Mutex<Option<Vec<u8>>>,
    assembler: Mutex<ChunkAssembler>,
    scratch: Mutex<Scratch>,
}

impl ServerContext {
    pub fn new(
        engine: Arc<dyn InnerEngine>,
        state: Arc<SessionState>,
        audio: Arc<AudioBus>,
        params: Option<ParamCache>,
        chunk: ChunkArea,
        options: SessionOptions,
        geometry: Geometry,
    ) -> Self {
        let (channels, frames) = (geometry.max_channels as usize, geometry.max_frames as usize);
        Self {
            engine,
            state,
            audio,
            params,
            chunk,
            options,
            geometry,
            chunk_stash: Mutex::new(None),
            assembler: Mutex::new(ChunkAssembler::new()),
            scratch: Mutex::new(Scratch {
                single: Planes::new(channels, frames),
                double: Planes::new(channels, frames),
            }),
        }
    }

    /// Apply queued parameter writes from the host. Returns how many applied.
    pub fn drain_parameters(&self) -> usize {
        let Some(cache) = &self.params else {
            return 0;
        };
        let engine = &self.engine;
        cache.drain(cache.capacity(), |index, value| {
            engine.set_parameter(index as i32, value)
        })
    }

    /// The audio loop drains the cache only when no parameter loop exists.
    pub fn audio_drains_parameters(&self) -> bool {
        self.params.is_some() && !self.options.parameter_thread
    }

    fn seed_parameters(&self) {
        let Some(cache) = &self.params else {
            return;
        };
        let count = (self.engine.info().num_params.max(0) as usize).min(cache.capacity());
        for index in 0..count {
            cache.seed(index, self.engine.parameter(index as i32));
        }
    }
}

type Handler = fn(&ServerContext, &mut Exchange<'_>) -> Result<()>;

/// Run the handler for the exchange's opcode. Unknown opcodes answer 0; a
/// failed handler answers the neutral reply of its opcode's [`ReplyKind`].
pub fn dispatch(ctx: &ServerContext, ex: &mut Exchange<'_>) {
    let Some(opcode) = EffectOpcode::from_raw(ex.opcode()) else {
        tracing::debug!(opcode = ex.opcode(), "unknown opcode");
        ex.set_ret_int(0);
        return;
    };
    let (_, handler) = HANDLERS[opcode as usize];
    if let Err(e) = handler(ctx, ex) {
        tracing::warn!(opcode = opcode.name(), "request failed: {}", e);
        neutral_reply(opcode.spec().reply, ex);
    }
}

/// Drop whatever a failed handler left half-written.
fn neutral_reply(kind: ReplyKind, ex: &mut Exchange<'_>) {
    ex.set_ret_int(0);
    match kind {
        ReplyKind::None | ReplyKind::Int => {}
        ReplyKind::Float => ex.set_ret_float(0.0),
        ReplyKind::Text | ReplyKind::Payload => ex.payload_mut().clear(),
    }
}

use EffectOpcode as E;

/// Indexed by the opcode's numeric value.
pub const HANDLERS: [(EffectOpcode, Handler); 38] = [
    (E::Open, open),
    (E::Close, close),
    (E::Suspend, |ctx, _| {
        ctx.engine.suspend();
        Ok(())
    }),
    (E::Resume, |ctx, _| {
        ctx.engine.resume();
        Ok(())
    }),
    (E::SetSampleRate, set_sample_rate),
    (E::SetBlockSize, set_block_size),
    (E::GetEffectInfo, effect_info),
    (E::GetName, |ctx, ex| text(&ctx.engine.name(), ex)),
    (E::GetVendor, |ctx, ex| text(&ctx.engine.vendor(), ex)),
    (E::GetProduct, |ctx, ex| text(&ctx.engine.product(), ex)),
    (E::GetVendorVersion, |ctx, ex| int(ctx.engine.vendor_version() as i64, ex)),
    (E::GetCategory, |ctx, ex| int(ctx.engine.category().to_raw() as i64, ex)),
    (E::CanDo, |ctx, ex| int(ctx.engine.can_do(&ex.text()) as i64, ex)),
    (E::SetProgram, set_program),
    (E::GetProgram, |ctx, ex| int(ctx.engine.program() as i64, ex)),
    (E::GetProgramName, |ctx, ex| text(&ctx.engine.program_name(), ex)),
    (E::GetProgramNameIndexed, program_name_indexed),
    (E::GetChunk, get_chunk),
    (E::GetChunkSegment, get_chunk_segment),
    (E::SetChunk, set_chunk),
    (E::SetChunkSegment, set_chunk_segment),
    (E::CanBeAutomated, |ctx, ex| {
        int(ctx.engine.can_be_automated(ex.value()) as i64, ex)
    }),
    (E::StartProcess, |ctx, _| {
        ctx.engine.start_process();
        Ok(())
    }),
    (E::StopProcess, |ctx, _| {
        ctx.engine.stop_process();
        Ok(())
    }),
    (E::SetPrecision, set_precision),
    (E::Reset, |ctx, _| {
        ctx.engine.reset();
        Ok(())
    }),
    (E::SetParameter, set_parameter),
    (E::GetParameter, |ctx, ex| {
        ex.set_ret_float(ctx.engine.parameter(ex.value()));
        Ok(())
    }),
    (E::GetParameterName, |ctx, ex| text(&ctx.engine.parameter_name(ex.value()), ex)),
    (E::GetParameterLabel, |ctx, ex| text(&ctx.engine.parameter_label(ex.value()), ex)),
    (E::GetParameterDisplay, |ctx, ex| text(&ctx.engine.parameter_display(ex.value()), ex)),
    (E::ProcessEvents, process_events),
    (E::Process, process_single),
    (E::ProcessDouble, process_double),
    (E::OpenEditor, open_editor),
    (E::CloseEditor, close_editor),
    (E::GetEditorRect, editor_rect),
    (E::EditorIdle, |ctx, _| {
        ctx.engine.editor_idle();
        Ok(())
    }),
];

fn int(value: i64, ex: &mut Exchange<'_>) -> Result<()> {
    ex.set_ret_int(value);
    Ok(())
}

fn text(value: &str, ex: &mut Exchange<'_>) -> Result<()> {
    ex.reply_text(value, MAX_NAME_LEN);
    ex.set_ret_int(1);
    Ok(())
}

// ============================================================================
// Lifecycle
// ============================================================================

fn open(ctx: &ServerContext, _: &mut Exchange<'_>) -> Result<()> {
    ctx.engine.open();
    ctx.state.set_effect_open(true);
    tracing::info!("effect opened");
    Ok(())
}

fn close(ctx: &ServerContext, _: &mut Exchange<'_>) -> Result<()> {
    tracing::info!("close requested by host");
    ctx.state.exit.set();
    Ok(())
}

fn set_sample_rate(ctx: &ServerContext, ex: &mut Exchange<'_>) -> Result<()> {
    let rate = ex.float_value();
    ctx.state.set_sample_rate(rate);
    ctx.engine.set_sample_rate(rate);
    Ok(())
}

fn set_block_size(ctx: &ServerContext, ex: &mut Exchange<'_>) -> Result<()> {
    let frames = ex.value();
    if frames <= 0 || frames as u32 > ctx.geometry.max_frames {
        return Err(BridgeError::InvalidArgument(format!(
            "block size {} outside 1..={}",
            frames, ctx.geometry.max_frames
        )));
    }
    ctx.state.set_block_size(frames);
    ctx.engine.set_block_size(frames);
    Ok(())
}

fn effect_info(ctx: &ServerContext, ex: &mut Exchange<'_>) -> Result<()> {
    let mut info = ctx.engine.info();
    if info.unique_id == 0 {
        info.unique_id = derive_unique_id(&ctx.engine.class_id());
    }
    ctx.state.set_unique_id(info.unique_id);
    ctx.state.note_layout(info.io_layout());
    ctx.seed_parameters();
    ex.reply_value(&info)?;
    ex.set_ret_int(1);
    Ok(())
}

fn set_precision(ctx: &ServerContext, ex: &mut Exchange<'_>) -> Result<()> {
    let precision = if ex.value() != 0 {
        Precision::Double
    } else {
        Precision::Single
    };
    int(ctx.engine.set_precision(precision) as i64, ex)
}

// ============================================================================
// Programs and parameters
// ============================================================================

fn set_program(ctx: &ServerContext, ex: &mut Exchange<'_>) -> Result<()> {
    ctx.engine.set_program(ex.value());
    ctx.seed_parameters();
    Ok(())
}

fn program_name_indexed(ctx: &ServerContext, ex: &mut Exchange<'_>) -> Result<()> {
    match ctx.engine.program_name_indexed(ex.value()) {
        Some(name) => text(&name, ex),
        None => int(0, ex),
    }
}

fn set_parameter(ctx: &ServerContext, ex: &mut Exchange<'_>) -> Result<()> {
    let (index, value) = (ex.value(), ex.float_value());
    ctx.engine.set_parameter(index, value);
    if let (Some(cache), Ok(i)) = (&ctx.params, usize::try_from(index)) {
        cache.seed(i, value);
    }
    Ok(())
}

// ============================================================================
// Chunks
// ============================================================================

fn get_chunk(ctx: &ServerContext, ex: &mut Exchange<'_>) -> Result<()> {
    let data = ctx.engine.chunk(ex.value() != 0);
    let capacity = ctx.chunk.capacity();
    match ChunkTier::for_size(data.len(), capacity, ctx.options.chunk_mode) {
        ChunkTier::Inline => ctx.chunk.write(&data)?,
        ChunkTier::Segmented => {
            tracing::debug!(size = data.len(), "chunk stashed for segmented read");
            *ctx.chunk_stash.lock() = Some(data.clone());
        }
        ChunkTier::Refused => {
            tracing::debug!(size = data.len(), capacity, "chunk exceeds transfer area");
        }
    }
    ex.set_ret_int(data.len() as i64);
    Ok(())
}

fn get_chunk_segment(ctx: &ServerContext, ex: &mut Exchange<'_>) -> Result<()> {
    let offset = usize::try_from(ex.value())
        .map_err(|_| BridgeError::ProtocolError(format!("chunk offset {}", ex.value())))?;
    let mut stash = ctx.chunk_stash.lock();
    let data = stash
        .as_ref()
        .ok_or_else(|| BridgeError::ProtocolError("no chunk to read segments from".to_string()))?;
    if offset >= data.len() {
        return Err(BridgeError::ProtocolError(format!(
            "chunk offset {} past {} bytes",
            offset,
            data.len()
        )));
    }

    let len = ctx.chunk.capacity().min(data.len() - offset);
    ctx.chunk.write(&data[offset..offset + len])?;
    if offset + len == data.len() {
        *stash = None;
    }
    ex.set_ret_int(len as i64);
    Ok(())
}

fn set_chunk_segment(ctx: &ServerContext, ex: &mut Exchange<'_>) -> Result<()> {
    let (offset, total) = match (usize::try_from(ex.value()), usize::try_from(ex.value2())) {
        (Ok(offset), Ok(total)) if offset < total => (offset, total),
        _ => {
            return Err(BridgeError::ProtocolError(format!(
                "chunk segment {} of {}",
                ex.value(),
                ex.value2()
            )))
        }
    };
    let len = ctx.chunk.capacity().min(total - offset);
    let data = ctx.chunk.read(len)?;
    ctx.assembler.lock().push(offset, total, &data)?;
    ex.set_ret_int(len as i64);
    Ok(())
}

fn set_chunk(ctx: &ServerContext, ex: &mut Exchange<'_>) -> Result<()> {
    let total = usize::try_from(ex.value())
        .map_err(|_| BridgeError::ProtocolError(format!("chunk size {}", ex.value())))?;
    let preset = ex.value2() != 0;

    let data = if total < ctx.chunk.capacity() {
        ctx.chunk.read(total)?
    } else {
        let mut assembler = ctx.assembler.lock();
        if !assembler.is_complete() {
            return Err(BridgeError::ProtocolError(
                "set chunk before all segments arrived".to_string(),
            ));
        }
        let data = assembler.take().unwrap_or_default();
        if data.len() != total {
            return Err(BridgeError::ProtocolError(format!(
                "assembled {} bytes, expected {}",
                data.len(),
                total
            )));
        }
        data
    };

    let status = ctx.engine.set_chunk(&data, preset);
    ctx.seed_parameters();
    int(status as i64, ex)
}

// ============================================================================
// Audio
// ============================================================================

fn process_events(ctx: &ServerContext, ex: &mut Exchange<'_>) -> Result<()> {
    let events = ctx.audio.read_events(EventLane::ToServer)?;
    int(ctx.engine.process_events(&events) as i64, ex)
}

fn process_single(ctx: &ServerContext, ex: &mut Exchange<'_>) -> Result<()> {
    let header = begin_process(ctx, ex)?;
    let mut scratch = ctx.scratch.lock();
    run_block(ctx, &header, &mut scratch.single, |inputs, outputs| {
        ctx.engine.process_replacing(inputs, outputs);
        true
    })?;
    int(1, ex)
}

fn process_double(ctx: &ServerContext, ex: &mut Exchange<'_>) -> Result<()> {
    let header = begin_process(ctx, ex)?;
    let mut scratch = ctx.scratch.lock();
    run_block(ctx, &header, &mut scratch.double, |inputs, outputs| {
        ctx.engine.process_double_replacing(inputs, outputs)
    })?;
    int(1, ex)
}

fn begin_process(ctx: &ServerContext, ex: &mut Exchange<'_>) -> Result<ProcessBlock> {
    let header: ProcessBlock = ex.arg()?;
    if header.frames > ctx.geometry.max_frames
        || header.inputs > ctx.geometry.max_channels
        || header.outputs > ctx.geometry.max_channels
    {
        return Err(BridgeError::ProtocolError(format!(
            "process block {} frames x {}/{} channels exceeds the audio region",
            header.frames, header.inputs, header.outputs
        )));
    }
    if let Some(time) = header.time {
        ctx.state.set_time(time);
    }
    if ctx.audio_drains_parameters() {
        ctx.drain_parameters();
    }
    Ok(header)
}

fn run_block<T: Sample>(
    ctx: &ServerContext,
    header: &ProcessBlock,
    planes: &mut Planes<T>,
    render: impl FnOnce(&[&[T]], &mut [&mut [T]]) -> bool,
) -> Result<()> {
    let frames = header.frames as usize;
    let (inputs, outputs) = (header.inputs as usize, header.outputs as usize);

    for (ch, buf) in planes.inputs.iter_mut().take(inputs).enumerate() {
        ctx.audio.read_channel_into(Plane::Input, ch, &mut buf[..frames])?;
    }
    for buf in planes.outputs.iter_mut().take(outputs) {
        buf[..frames].fill(T::default());
    }

    let ins: SmallVec<[&[T]; 16]> = planes.inputs[..inputs].iter().map(|c| &c[..frames]).collect();
    let mut outs: SmallVec<[&mut [T]; 16]> = planes.outputs[..outputs]
        .iter_mut()
        .map(|c| &mut c[..frames])
        .collect();
    if !render(&ins, &mut outs) {
        tracing::debug!("engine declined the block, sending silence");
    }

    for (ch, buf) in outs.iter().enumerate() {
        ctx.audio.write_channel(Plane::Output, ch, &buf[..])?;
    }
    Ok(())
}

// ============================================================================
// Editor
// ============================================================================

fn open_editor(ctx: &ServerContext, ex: &mut Exchange<'_>) -> Result<()> {
    let parent: u64 = ex.arg()?;
    match ctx.engine.open_editor(parent) {
        Some(rect) => {
            ctx.state.set_editor_visible(true);
            ex.reply_value(&rect)?;
            int(1, ex)
        }
        None => int(0, ex),
    }
}

fn close_editor(ctx: &ServerContext, _: &mut Exchange<'_>) -> Result<()> {
    ctx.engine.close_editor();
    ctx.state.set_editor_visible(false);
    Ok(())
}

fn editor_rect(ctx: &ServerContext, ex: &mut Exchange<'_>) -> Result<()> {
    match ctx.engine.editor_rect() {
        Some(rect) => {
            ex.reply_value(&rect)?;
            int(1, ex)
        }
        None => int(0, ex),
    }
}
