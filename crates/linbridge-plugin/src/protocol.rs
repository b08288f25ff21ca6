//! Opcodes, payload types and configuration shared by host and server.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Bumped whenever the shared-memory layout changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Host version reported to the engine (VST 2.4).
pub const HOST_VERSION: isize = 2400;

/// Bytes of the per-mailbox payload buffer (strings and encoded structs).
pub const PAYLOAD_CAPACITY: usize = 4096;

/// Longest string sent through a name or label opcode.
pub const MAX_NAME_LEN: usize = 256;

/// Bytes of each event area in the audio region.
pub const EVENT_AREA_BYTES: usize = 8192;

// ============================================================================
// Mailboxes
// ============================================================================

/// One control block per mailbox; each is an independent single-slot channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailboxKind {
    /// Host -> server generic opcodes.
    Control = 0,
    /// Host -> server parameter opcodes (dedicated parameter loop).
    Parameter = 1,
    /// Host -> server process calls.
    Audio = 2,
    /// Host -> server editor opcodes, served on the server's main thread.
    Editor = 3,
    /// Server -> host callbacks.
    Callback = 4,
}

pub const MAILBOX_COUNT: usize = 5;

impl MailboxKind {
    pub const ALL: [MailboxKind; MAILBOX_COUNT] = [
        MailboxKind::Control,
        MailboxKind::Parameter,
        MailboxKind::Audio,
        MailboxKind::Editor,
        MailboxKind::Callback,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// What a request leaves behind in the control block for the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    None,
    Int,
    Float,
    Text,
    Payload,
}

// ============================================================================
// Host -> server opcodes
// ============================================================================

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectOpcode {
    Open = 0,
    Close,
    Suspend,
    Resume,
    SetSampleRate,
    SetBlockSize,
    GetEffectInfo,
    GetName,
    GetVendor,
    GetProduct,
    GetVendorVersion,
    GetCategory,
    CanDo,
    SetProgram,
    GetProgram,
    GetProgramName,
    GetProgramNameIndexed,
    GetChunk,
    GetChunkSegment,
    SetChunk,
    SetChunkSegment,
    CanBeAutomated,
    StartProcess,
    StopProcess,
    SetPrecision,
    Reset,
    SetParameter,
    GetParameter,
    GetParameterName,
    GetParameterLabel,
    GetParameterDisplay,
    ProcessEvents,
    Process,
    ProcessDouble,
    OpenEditor,
    CloseEditor,
    GetEditorRect,
    EditorIdle,
}

/// Routing and reply shape of one opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeSpec {
    pub opcode: EffectOpcode,
    pub name: &'static str,
    pub mailbox: MailboxKind,
    pub reply: ReplyKind,
}

const fn spec(
    opcode: EffectOpcode,
    name: &'static str,
    mailbox: MailboxKind,
    reply: ReplyKind,
) -> OpcodeSpec {
    OpcodeSpec {
        opcode,
        name,
        mailbox,
        reply,
    }
}

use EffectOpcode as E;
use MailboxKind::{Audio, Control, Editor, Parameter};
use ReplyKind as R;

/// Indexed by the opcode's numeric value.
pub const OPCODE_TABLE: [OpcodeSpec; 38] = [
    spec(E::Open, "Open", Control, R::None),
    spec(E::Close, "Close", Control, R::None),
    spec(E::Suspend, "Suspend", Control, R::None),
    spec(E::Resume, "Resume", Control, R::None),
    spec(E::SetSampleRate, "SetSampleRate", Control, R::None),
    spec(E::SetBlockSize, "SetBlockSize", Control, R::None),
    spec(E::GetEffectInfo, "GetEffectInfo", Control, R::Payload),
    spec(E::GetName, "GetName", Control, R::Text),
    spec(E::GetVendor, "GetVendor", Control, R::Text),
    spec(E::GetProduct, "GetProduct", Control, R::Text),
    spec(E::GetVendorVersion, "GetVendorVersion", Control, R::Int),
    spec(E::GetCategory, "GetCategory", Control, R::Int),
    spec(E::CanDo, "CanDo", Control, R::Int),
    spec(E::SetProgram, "SetProgram", Control, R::None),
    spec(E::GetProgram, "GetProgram", Control, R::Int),
    spec(E::GetProgramName, "GetProgramName", Control, R::Text),
    spec(E::GetProgramNameIndexed, "GetProgramNameIndexed", Control, R::Text),
    spec(E::GetChunk, "GetChunk", Control, R::Int),
    spec(E::GetChunkSegment, "GetChunkSegment", Control, R::Int),
    spec(E::SetChunk, "SetChunk", Control, R::Int),
    spec(E::SetChunkSegment, "SetChunkSegment", Control, R::Int),
    spec(E::CanBeAutomated, "CanBeAutomated", Control, R::Int),
    spec(E::StartProcess, "StartProcess", Control, R::None),
    spec(E::StopProcess, "StopProcess", Control, R::None),
    spec(E::SetPrecision, "SetPrecision", Control, R::Int),
    spec(E::Reset, "Reset", Control, R::None),
    spec(E::SetParameter, "SetParameter", Parameter, R::None),
    spec(E::GetParameter, "GetParameter", Parameter, R::Float),
    spec(E::GetParameterName, "GetParameterName", Parameter, R::Text),
    spec(E::GetParameterLabel, "GetParameterLabel", Parameter, R::Text),
    spec(E::GetParameterDisplay, "GetParameterDisplay", Parameter, R::Text),
    spec(E::ProcessEvents, "ProcessEvents", Audio, R::Int),
    spec(E::Process, "Process", Audio, R::Int),
    spec(E::ProcessDouble, "ProcessDouble", Audio, R::Int),
    spec(E::OpenEditor, "OpenEditor", Editor, R::Payload),
    spec(E::CloseEditor, "CloseEditor", Editor, R::None),
    spec(E::GetEditorRect, "GetEditorRect", Editor, R::Payload),
    spec(E::EditorIdle, "EditorIdle", Editor, R::None),
];

impl EffectOpcode {
    pub fn from_raw(raw: i32) -> Option<Self> {
        usize::try_from(raw)
            .ok()
            .and_then(|i| OPCODE_TABLE.get(i))
            .map(|s| s.opcode)
    }

    pub fn spec(self) -> &'static OpcodeSpec {
        &OPCODE_TABLE[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }
}

// ============================================================================
// Server -> host opcodes (audioMaster numbering)
// ============================================================================

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOpcode {
    Automate = 0,
    Version = 1,
    CurrentId = 2,
    Idle = 3,
    WantMidi = 6,
    GetTime = 7,
    ProcessEvents = 8,
    SetTime = 9,
    TempoAt = 10,
    GetNumAutomatableParameters = 11,
    GetParameterQuantization = 12,
    IoChanged = 13,
    NeedIdle = 14,
    SizeWindow = 15,
    GetSampleRate = 16,
    GetBlockSize = 17,
    GetInputLatency = 18,
    GetOutputLatency = 19,
    WillReplaceOrAccumulate = 22,
    GetCurrentProcessLevel = 23,
    GetAutomationState = 24,
    GetVendorString = 32,
    GetProductString = 33,
    GetVendorVersion = 34,
    CanDo = 37,
    GetLanguage = 38,
    UpdateDisplay = 42,
    BeginEdit = 43,
    EndEdit = 44,
    /// Server failed after the ready handshake; the host should stop calling.
    Disconnect = 0x1000,
}

impl HostOpcode {
    pub const ALL: [HostOpcode; 30] = [
        HostOpcode::Automate,
        HostOpcode::Version,
        HostOpcode::CurrentId,
        HostOpcode::Idle,
        HostOpcode::WantMidi,
        HostOpcode::GetTime,
        HostOpcode::ProcessEvents,
        HostOpcode::SetTime,
        HostOpcode::TempoAt,
        HostOpcode::GetNumAutomatableParameters,
        HostOpcode::GetParameterQuantization,
        HostOpcode::IoChanged,
        HostOpcode::NeedIdle,
        HostOpcode::SizeWindow,
        HostOpcode::GetSampleRate,
        HostOpcode::GetBlockSize,
        HostOpcode::GetInputLatency,
        HostOpcode::GetOutputLatency,
        HostOpcode::WillReplaceOrAccumulate,
        HostOpcode::GetCurrentProcessLevel,
        HostOpcode::GetAutomationState,
        HostOpcode::GetVendorString,
        HostOpcode::GetProductString,
        HostOpcode::GetVendorVersion,
        HostOpcode::CanDo,
        HostOpcode::GetLanguage,
        HostOpcode::UpdateDisplay,
        HostOpcode::BeginEdit,
        HostOpcode::EndEdit,
        HostOpcode::Disconnect,
    ];

    pub fn from_raw(raw: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| *op as i32 == raw)
    }
}

/// Answer to `GetCurrentProcessLevel`.
#[repr(isize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessLevel {
    User = 1,
    Realtime = 2,
}

/// Answer to `GetLanguage`.
pub const LANGUAGE_ENGLISH: isize = 1;

// ============================================================================
// Payload types
// ============================================================================

/// Transport state pushed by the host with each process call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeInfo {
    pub sample_pos: f64,
    pub sample_rate: f64,
    pub nano_seconds: f64,
    pub ppq_pos: f64,
    pub tempo: f64,
    pub bar_start_pos: f64,
    pub cycle_start_pos: f64,
    pub cycle_end_pos: f64,
    pub time_sig_numerator: i32,
    pub time_sig_denominator: i32,
    pub samples_to_next_clock: i32,
    pub flags: i32,
}

impl Default for TimeInfo {
    fn default() -> Self {
        Self {
            sample_pos: 0.0,
            sample_rate: 44100.0,
            nano_seconds: 0.0,
            ppq_pos: 0.0,
            tempo: 120.0,
            bar_start_pos: 0.0,
            cycle_start_pos: 0.0,
            cycle_end_pos: 0.0,
            time_sig_numerator: 4,
            time_sig_denominator: 4,
            samples_to_next_clock: 0,
            flags: 0,
        }
    }
}

/// Header of a process call; the samples travel in the audio region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessBlock {
    pub frames: u32,
    pub inputs: u32,
    pub outputs: u32,
    pub time: Option<TimeInfo>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectFlags {
    pub has_editor: bool,
    pub can_replacing: bool,
    pub can_double_replacing: bool,
    pub program_chunks: bool,
    pub is_synth: bool,
    pub no_sound_in_stop: bool,
}

/// Static description of the wrapped engine, exposed by the host-side adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectInfo {
    pub num_inputs: i32,
    pub num_outputs: i32,
    pub num_params: i32,
    pub num_programs: i32,
    pub unique_id: i32,
    pub version: i32,
    pub initial_delay: i32,
    pub flags: EffectFlags,
}

impl EffectInfo {
    pub fn io_layout(&self) -> IoLayout {
        IoLayout {
            num_inputs: self.num_inputs,
            num_outputs: self.num_outputs,
            initial_delay: self.initial_delay,
        }
    }
}

/// The part of [`EffectInfo`] an engine may change at runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoLayout {
    pub num_inputs: i32,
    pub num_outputs: i32,
    pub initial_delay: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditorRect {
    pub top: i16,
    pub left: i16,
    pub bottom: i16,
    pub right: i16,
}

impl EditorRect {
    pub fn width(&self) -> i32 {
        self.right as i32 - self.left as i32
    }

    pub fn height(&self) -> i32 {
        self.bottom as i32 - self.top as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlugCategory {
    Unknown,
    Effect,
    Synth,
    Other(i32),
}

impl PlugCategory {
    pub fn to_raw(self) -> i32 {
        match self {
            PlugCategory::Unknown => 0,
            PlugCategory::Effect => 1,
            PlugCategory::Synth => 2,
            PlugCategory::Other(raw) => raw,
        }
    }

    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => PlugCategory::Unknown,
            1 => PlugCategory::Effect,
            2 => PlugCategory::Synth,
            other => PlugCategory::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    #[default]
    Single,
    Double,
}

// ============================================================================
// Configuration
// ============================================================================

/// How chunks at or above the chunk region capacity are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkMode {
    /// Report the true size and refuse the transfer.
    #[default]
    Inline,
    /// Move the chunk in region-sized segments.
    Buffered,
}

/// Runtime options agreed by both processes at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub parameter_thread: bool,
    pub parameter_cache: bool,
    pub chunk_mode: ChunkMode,
    pub drag_tracking: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            parameter_thread: true,
            parameter_cache: false,
            chunk_mode: ChunkMode::Inline,
            drag_tracking: false,
        }
    }
}

const OPT_PARAMETER_THREAD: u32 = 1;
const OPT_PARAMETER_CACHE: u32 = 1 << 1;
const OPT_CHUNK_BUFFERED: u32 = 1 << 2;
const OPT_DRAG_TRACKING: u32 = 1 << 3;

impl SessionOptions {
    pub fn to_bits(self) -> u32 {
        let mut bits = 0;
        if self.parameter_thread {
            bits |= OPT_PARAMETER_THREAD;
        }
        if self.parameter_cache {
            bits |= OPT_PARAMETER_CACHE;
        }
        if self.chunk_mode == ChunkMode::Buffered {
            bits |= OPT_CHUNK_BUFFERED;
        }
        if self.drag_tracking {
            bits |= OPT_DRAG_TRACKING;
        }
        bits
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            parameter_thread: bits & OPT_PARAMETER_THREAD != 0,
            parameter_cache: bits & OPT_PARAMETER_CACHE != 0,
            chunk_mode: if bits & OPT_CHUNK_BUFFERED != 0 {
                ChunkMode::Buffered
            } else {
                ChunkMode::Inline
            },
            drag_tracking: bits & OPT_DRAG_TRACKING != 0,
        }
    }

    /// Mailbox that actually carries opcodes routed to `mailbox`.
    pub fn route(self, mailbox: MailboxKind) -> MailboxKind {
        match mailbox {
            MailboxKind::Parameter if !self.parameter_thread => MailboxKind::Control,
            other => other,
        }
    }
}

/// Sizes of the audio, chunk and parameter regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub max_channels: u32,
    pub max_frames: u32,
    pub chunk_capacity: u32,
    pub max_parameters: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            max_channels: 16,
            max_frames: 8192,
            chunk_capacity: 512 * 1024,
            max_parameters: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Server executable; defaults to `linbridge-server` next to the current executable.
    pub server_path: Option<PathBuf>,
    pub shm_prefix: String,
    pub geometry: Geometry,
    pub options: SessionOptions,
    pub control_timeout_ms: u64,
    pub audio_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub boot_timeout_ms: u64,
    pub shutdown_wait_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server_path: None,
            shm_prefix: "linbridge_".to_string(),
            geometry: Geometry::default(),
            options: SessionOptions::default(),
            control_timeout_ms: 60_000,
            audio_timeout_ms: 10_000,
            poll_interval_ms: 5,
            boot_timeout_ms: 40_000,
            shutdown_wait_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_table_is_indexed_by_value() {
        for (i, spec) in OPCODE_TABLE.iter().enumerate() {
            assert_eq!(spec.opcode as usize, i, "{} out of place", spec.name);
            assert_eq!(EffectOpcode::from_raw(i as i32), Some(spec.opcode));
        }
    }

    #[test]
    fn test_unknown_effect_opcode() {
        assert_eq!(EffectOpcode::from_raw(-1), None);
        assert_eq!(EffectOpcode::from_raw(OPCODE_TABLE.len() as i32), None);
    }

    #[test]
    fn test_host_opcode_numbering() {
        assert_eq!(HostOpcode::from_raw(0), Some(HostOpcode::Automate));
        assert_eq!(HostOpcode::from_raw(32), Some(HostOpcode::GetVendorString));
        assert_eq!(HostOpcode::from_raw(44), Some(HostOpcode::EndEdit));
        assert_eq!(HostOpcode::from_raw(5), None);
    }

    #[test]
    fn test_parameter_routing_follows_options() {
        let threaded = SessionOptions::default();
        assert_eq!(threaded.route(MailboxKind::Parameter), MailboxKind::Parameter);

        let inline = SessionOptions {
            parameter_thread: false,
            ..SessionOptions::default()
        };
        assert_eq!(inline.route(MailboxKind::Parameter), MailboxKind::Control);
        assert_eq!(inline.route(MailboxKind::Audio), MailboxKind::Audio);
    }

    #[test]
    fn test_session_options_bits() {
        let options = SessionOptions {
            parameter_thread: false,
            parameter_cache: true,
            chunk_mode: ChunkMode::Buffered,
            drag_tracking: true,
        };
        assert_eq!(SessionOptions::from_bits(options.to_bits()), options);
        assert_eq!(SessionOptions::from_bits(0).chunk_mode, ChunkMode::Inline);
    }

    #[test]
    fn test_config_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.control_timeout_ms, 60_000);
        assert_eq!(config.boot_timeout_ms, 40_000);
        assert_eq!(config.geometry.max_parameters, 10_000);
        assert!(config.server_path.is_none());
    }

    #[test]
    fn test_config_json() {
        let config = BridgeConfig {
            server_path: Some("/opt/linbridge/linbridge-server".into()),
            ..BridgeConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: BridgeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_plug_category_raw() {
        assert_eq!(PlugCategory::Synth.to_raw(), 2);
        assert_eq!(PlugCategory::from_raw(1), PlugCategory::Effect);
        assert_eq!(PlugCategory::from_raw(11), PlugCategory::Other(11));
    }

    #[test]
    fn test_time_info_default() {
        let time = TimeInfo::default();
        assert_eq!(time.tempo, 120.0);
        assert_eq!(time.time_sig_numerator, 4);
        assert_eq!(time.time_sig_denominator, 4);
    }
}
