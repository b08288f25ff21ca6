//! Host callback relay.
//!
//! The engine calls back into its host through a [`HostLink`]. Each opcode
//! is resolved through [`CALLBACK_TABLE`]: some are answered from local
//! session state, some with fixed legacy values, the rest are forwarded to
//! the host over the Callback mailbox.

use crate::orchestrator::ExitFlag;
use arc_swap::ArcSwap;
use linbridge_plugin::control::{ClosedFlag, ControlRegion, Request, Requester};
use linbridge_plugin::events::EventKind;
use linbridge_plugin::protocol::{ReplyKind, HOST_VERSION, LANGUAGE_ENGLISH, MAX_NAME_LEN};
use linbridge_plugin::shared_memory::Shared;
use linbridge_plugin::{
    AudioBus, Event, EventLane, HostOpcode, IoLayout, MailboxKind, Result, TimeInfo,
};
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Capabilities the host side always claims.
pub const HOST_CAN_DO: &[&str] = &[
    "sendVstEvents",
    "sendVstMidiEvent",
    "receiveVstEvents",
    "receiveVstMidiEvents",
    "receiveVstTimeInfo",
    "acceptIOChanges",
    "startStopProcess",
    "sizeWindow",
];

thread_local! {
    static IN_AUDIO_CONTEXT: Cell<bool> = const { Cell::new(false) };
}

/// Mark the calling thread as the audio thread for process-level queries.
pub fn mark_audio_thread() {
    IN_AUDIO_CONTEXT.with(|flag| flag.set(true));
}

fn in_audio_context() -> bool {
    IN_AUDIO_CONTEXT.with(Cell::get)
}

/// Server-local session state read by the relay and written by dispatch.
pub struct SessionState {
    pub exit: ExitFlag,
    effect_open: AtomicBool,
    sample_rate: AtomicU32,
    block_size: AtomicI32,
    unique_id: AtomicI32,
    editor_visible: AtomicBool,
    time: ArcSwap<TimeInfo>,
    layout: Mutex<Option<IoLayout>>,
    window: Mutex<Option<(i32, i32)>>,
}

impl SessionState {
    pub fn new(exit: ExitFlag) -> Self {
        Self {
            exit,
            effect_open: AtomicBool::new(false),
            sample_rate: AtomicU32::new(44100.0f32.to_bits()),
            block_size: AtomicI32::new(512),
            unique_id: AtomicI32::new(0),
            editor_visible: AtomicBool::new(false),
            time: ArcSwap::from_pointee(TimeInfo::default()),
            layout: Mutex::new(None),
            window: Mutex::new(None),
        }
    }

    pub fn is_exiting(&self) -> bool {
        self.exit.is_set()
    }

    pub fn is_effect_open(&self) -> bool {
        self.effect_open.load(Ordering::Acquire)
    }

    pub fn set_effect_open(&self, open: bool) {
        self.effect_open.store(open, Ordering::Release);
    }

    pub fn sample_rate(&self) -> f32 {
        f32::from_bits(self.sample_rate.load(Ordering::Relaxed))
    }

    pub fn set_sample_rate(&self, rate: f32) {
        self.sample_rate.store(rate.to_bits(), Ordering::Relaxed);
    }

    pub fn block_size(&self) -> i32 {
        self.block_size.load(Ordering::Relaxed)
    }

    pub fn set_block_size(&self, frames: i32) {
        self.block_size.store(frames, Ordering::Relaxed);
    }

    pub fn unique_id(&self) -> i32 {
        self.unique_id.load(Ordering::Relaxed)
    }

    pub fn set_unique_id(&self, id: i32) {
        self.unique_id.store(id, Ordering::Relaxed);
    }

    pub fn is_editor_visible(&self) -> bool {
        self.editor_visible.load(Ordering::Acquire)
    }

    pub fn set_editor_visible(&self, visible: bool) {
        self.editor_visible.store(visible, Ordering::Release);
        if !visible {
            *self.window.lock() = None;
        }
    }

    pub fn time(&self) -> TimeInfo {
        **self.time.load()
    }

    pub fn set_time(&self, time: TimeInfo) {
        self.time.store(Arc::new(time));
    }

    /// Record the layout the host has been told about.
    pub fn note_layout(&self, layout: IoLayout) {
        *self.layout.lock() = Some(layout);
    }

    /// Returns true if `layout` differs from the last one reported, and
    /// records it.
    fn layout_changed(&self, layout: IoLayout) -> bool {
        let mut current = self.layout.lock();
        if *current == Some(layout) {
            return false;
        }
        *current = Some(layout);
        true
    }

    fn window_changed(&self, size: (i32, i32)) -> bool {
        let mut current = self.window.lock();
        if *current == Some(size) {
            return false;
        }
        *current = Some(size);
        true
    }
}

// ============================================================================
// Calls and routes
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub enum CallbackArg<'a> {
    #[default]
    None,
    Text(&'a str),
    Time(&'a TimeInfo),
    Events(&'a [Event]),
    Layout(IoLayout),
}

/// One host callback as issued by the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallbackCall<'a> {
    pub index: i32,
    pub value: isize,
    pub opt: f32,
    pub arg: CallbackArg<'a>,
}

impl<'a> CallbackCall<'a> {
    pub fn index(index: i32) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    pub fn with_arg(arg: CallbackArg<'a>) -> Self {
        Self {
            arg,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallbackReply {
    pub ret: isize,
    pub text: Option<String>,
    pub time: Option<TimeInfo>,
}

impl CallbackReply {
    pub fn int(ret: isize) -> Self {
        Self {
            ret,
            ..Self::default()
        }
    }
}

/// When a route may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    Always,
    NotExiting,
    /// Not exiting and the effect has been opened.
    EffectOpen,
}

type LocalFn = fn(&LinkInner, &CallbackCall<'_>) -> CallbackReply;
type AdmitFn = fn(&LinkInner, &CallbackCall<'_>) -> bool;
type MarshalFn = fn(&LinkInner, &CallbackCall<'_>, &mut Request<'_>) -> Result<()>;

#[derive(Clone, Copy)]
pub enum Action {
    Fixed(isize),
    Local(LocalFn),
    Remote {
        admit: AdmitFn,
        marshal: MarshalFn,
        reply: ReplyKind,
    },
}

#[derive(Clone, Copy)]
pub struct CallbackRoute {
    pub opcode: HostOpcode,
    pub guard: Guard,
    pub action: Action,
}

const fn local(opcode: HostOpcode, f: LocalFn) -> CallbackRoute {
    CallbackRoute {
        opcode,
        guard: Guard::Always,
        action: Action::Local(f),
    }
}

const fn fixed(opcode: HostOpcode, value: isize) -> CallbackRoute {
    CallbackRoute {
        opcode,
        guard: Guard::Always,
        action: Action::Fixed(value),
    }
}

const fn remote(
    opcode: HostOpcode,
    guard: Guard,
    admit: AdmitFn,
    marshal: MarshalFn,
    reply: ReplyKind,
) -> CallbackRoute {
    CallbackRoute {
        opcode,
        guard,
        action: Action::Remote {
            admit,
            marshal,
            reply,
        },
    }
}

fn admit_all(_: &LinkInner, _: &CallbackCall<'_>) -> bool {
    true
}

fn no_args(_: &LinkInner, _: &CallbackCall<'_>, _: &mut Request<'_>) -> Result<()> {
    Ok(())
}

fn index_and_opt(_: &LinkInner, call: &CallbackCall<'_>, req: &mut Request<'_>) -> Result<()> {
    req.set_value(call.index);
    req.set_float(call.opt);
    Ok(())
}

fn admit_time(_: &LinkInner, call: &CallbackCall<'_>) -> bool {
    matches!(call.arg, CallbackArg::Time(_))
}

fn marshal_time(_: &LinkInner, call: &CallbackCall<'_>, req: &mut Request<'_>) -> Result<()> {
    match call.arg {
        CallbackArg::Time(time) => req.set_payload(time),
        _ => Ok(()),
    }
}

fn forwardable(event: &&Event) -> bool {
    event.kind != EventKind::SysEx
}

fn admit_events(_: &LinkInner, call: &CallbackCall<'_>) -> bool {
    match call.arg {
        CallbackArg::Events(events) => events.iter().any(|e| forwardable(&e)),
        _ => false,
    }
}

fn marshal_events(link: &LinkInner, call: &CallbackCall<'_>, _: &mut Request<'_>) -> Result<()> {
    if let CallbackArg::Events(events) = call.arg {
        let outcome = link
            .audio
            .write_events(EventLane::ToHost, events.iter().filter(forwardable))?;
        if outcome.dropped > 0 {
            tracing::debug!(dropped = outcome.dropped, "engine event batch truncated");
        }
    }
    Ok(())
}

fn admit_layout(link: &LinkInner, call: &CallbackCall<'_>) -> bool {
    match call.arg {
        CallbackArg::Layout(layout) => link.state.layout_changed(layout),
        _ => false,
    }
}

fn marshal_layout(_: &LinkInner, call: &CallbackCall<'_>, req: &mut Request<'_>) -> Result<()> {
    match call.arg {
        CallbackArg::Layout(layout) => req.set_payload(&layout),
        _ => Ok(()),
    }
}

fn admit_window(link: &LinkInner, call: &CallbackCall<'_>) -> bool {
    link.state.is_editor_visible()
        && link.state.window_changed((call.index, call.value as i32))
}

fn marshal_window(_: &LinkInner, call: &CallbackCall<'_>, req: &mut Request<'_>) -> Result<()> {
    req.set_value(call.index);
    req.set_value2(call.value as i32);
    Ok(())
}

fn answer_version(_: &LinkInner, _: &CallbackCall<'_>) -> CallbackReply {
    CallbackReply::int(HOST_VERSION)
}

fn answer_language(_: &LinkInner, _: &CallbackCall<'_>) -> CallbackReply {
    CallbackReply::int(LANGUAGE_ENGLISH)
}

fn answer_process_level(_: &LinkInner, _: &CallbackCall<'_>) -> CallbackReply {
    use linbridge_plugin::protocol::ProcessLevel;
    let level = if in_audio_context() {
        ProcessLevel::Realtime
    } else {
        ProcessLevel::User
    };
    CallbackReply::int(level as isize)
}

fn answer_sample_rate(link: &LinkInner, _: &CallbackCall<'_>) -> CallbackReply {
    CallbackReply::int(link.state.sample_rate() as isize)
}

fn answer_block_size(link: &LinkInner, _: &CallbackCall<'_>) -> CallbackReply {
    CallbackReply::int(link.state.block_size() as isize)
}

fn answer_time(link: &LinkInner, _: &CallbackCall<'_>) -> CallbackReply {
    CallbackReply {
        ret: 1,
        time: Some(link.state.time()),
        ..CallbackReply::default()
    }
}

fn answer_can_do(_: &LinkInner, call: &CallbackCall<'_>) -> CallbackReply {
    let supported = match call.arg {
        CallbackArg::Text(capability) => HOST_CAN_DO.contains(&capability),
        _ => false,
    };
    CallbackReply::int(supported as isize)
}

fn answer_zero(_: &LinkInner, _: &CallbackCall<'_>) -> CallbackReply {
    CallbackReply::int(0)
}

fn answer_current_id(link: &LinkInner, _: &CallbackCall<'_>) -> CallbackReply {
    CallbackReply::int(link.state.unique_id() as isize)
}

use Guard::{Always, EffectOpen, NotExiting};
use HostOpcode as H;

/// Every host opcode the relay knows, in numeric order.
pub const CALLBACK_TABLE: [CallbackRoute; 30] = [
    remote(H::Automate, EffectOpen, admit_all, index_and_opt, ReplyKind::Int),
    local(H::Version, answer_version),
    local(H::CurrentId, answer_current_id),
    local(H::Idle, answer_zero),
    fixed(H::WantMidi, 1),
    local(H::GetTime, answer_time),
    remote(H::ProcessEvents, EffectOpen, admit_events, marshal_events, ReplyKind::Int),
    remote(H::SetTime, EffectOpen, admit_time, marshal_time, ReplyKind::Int),
    fixed(H::TempoAt, 1_200_000),
    fixed(H::GetNumAutomatableParameters, 5000),
    fixed(H::GetParameterQuantization, 1),
    remote(H::IoChanged, EffectOpen, admit_layout, marshal_layout, ReplyKind::Int),
    fixed(H::NeedIdle, 1),
    remote(H::SizeWindow, EffectOpen, admit_window, marshal_window, ReplyKind::Int),
    local(H::GetSampleRate, answer_sample_rate),
    local(H::GetBlockSize, answer_block_size),
    local(H::GetInputLatency, answer_zero),
    local(H::GetOutputLatency, answer_zero),
    fixed(H::WillReplaceOrAccumulate, 1),
    local(H::GetCurrentProcessLevel, answer_process_level),
    remote(H::GetAutomationState, EffectOpen, admit_all, no_args, ReplyKind::Int),
    remote(H::GetVendorString, NotExiting, admit_all, no_args, ReplyKind::Text),
    remote(H::GetProductString, NotExiting, admit_all, no_args, ReplyKind::Text),
    remote(H::GetVendorVersion, NotExiting, admit_all, no_args, ReplyKind::Int),
    local(H::CanDo, answer_can_do),
    local(H::GetLanguage, answer_language),
    remote(H::UpdateDisplay, EffectOpen, admit_all, no_args, ReplyKind::Int),
    remote(H::BeginEdit, EffectOpen, admit_all, index_and_opt, ReplyKind::Int),
    remote(H::EndEdit, EffectOpen, admit_all, index_and_opt, ReplyKind::Int),
    remote(H::Disconnect, Always, admit_all, no_args, ReplyKind::None),
];

pub fn route_for(opcode: HostOpcode) -> Option<&'static CallbackRoute> {
    CALLBACK_TABLE.iter().find(|route| route.opcode == opcode)
}

// ============================================================================
// HostLink
// ============================================================================

pub struct LinkInner {
    state: Arc<SessionState>,
    requester: Requester,
    audio: Arc<AudioBus>,
    timeout: Duration,
}

/// The engine's handle to its host. Cheap to clone.
#[derive(Clone, Default)]
pub struct HostLink {
    inner: Option<Arc<LinkInner>>,
}

impl HostLink {
    pub fn new(
        state: Arc<SessionState>,
        control: Arc<Shared<ControlRegion>>,
        audio: Arc<AudioBus>,
        timeout: Duration,
    ) -> Self {
        let requester = Requester::new(control, MailboxKind::Callback, ClosedFlag::new());
        Self {
            inner: Some(Arc::new(LinkInner {
                state,
                requester,
                audio,
                timeout,
            })),
        }
    }

    /// A link with no session behind it. Only the version query answers.
    pub fn detached() -> Self {
        Self { inner: None }
    }

    pub fn is_attached(&self) -> bool {
        self.inner.is_some()
    }

    /// Resolve a raw opcode number; unknown opcodes answer 0.
    pub fn dispatch_raw(&self, opcode: i32, call: CallbackCall<'_>) -> CallbackReply {
        match HostOpcode::from_raw(opcode) {
            Some(op) => self.dispatch(op, call),
            None => {
                tracing::debug!(opcode, "unknown host callback");
                CallbackReply::default()
            }
        }
    }

    pub fn dispatch(&self, opcode: HostOpcode, call: CallbackCall<'_>) -> CallbackReply {
        let Some(link) = &self.inner else {
            return match opcode {
                HostOpcode::Version => CallbackReply::int(HOST_VERSION),
                _ => CallbackReply::default(),
            };
        };
        let Some(route) = route_for(opcode) else {
            tracing::debug!(?opcode, "host callback without a route");
            return CallbackReply::default();
        };

        let admitted = match route.guard {
            Guard::Always => true,
            Guard::NotExiting => !link.state.is_exiting(),
            Guard::EffectOpen => !link.state.is_exiting() && link.state.is_effect_open(),
        };
        if !admitted {
            return CallbackReply::default();
        }

        match route.action {
            Action::Fixed(value) => CallbackReply::int(value),
            Action::Local(answer) => answer(link, &call),
            Action::Remote {
                admit,
                marshal,
                reply,
            } => {
                if !admit(link, &call) {
                    return CallbackReply::default();
                }
                link.forward(opcode, &call, marshal, reply)
            }
        }
    }

    pub fn version(&self) -> isize {
        self.dispatch(HostOpcode::Version, CallbackCall::default()).ret
    }

    pub fn automate(&self, index: i32, value: f32) {
        let call = CallbackCall {
            index,
            opt: value,
            ..CallbackCall::default()
        };
        self.dispatch(HostOpcode::Automate, call);
    }

    pub fn begin_edit(&self, index: i32) {
        self.dispatch(HostOpcode::BeginEdit, CallbackCall::index(index));
    }

    pub fn end_edit(&self, index: i32) {
        self.dispatch(HostOpcode::EndEdit, CallbackCall::index(index));
    }

    pub fn time(&self) -> Option<TimeInfo> {
        self.dispatch(HostOpcode::GetTime, CallbackCall::default()).time
    }

    pub fn process_events(&self, events: &[Event]) -> bool {
        let call = CallbackCall::with_arg(CallbackArg::Events(events));
        self.dispatch(HostOpcode::ProcessEvents, call).ret != 0
    }

    pub fn io_changed(&self, layout: IoLayout) -> bool {
        let call = CallbackCall::with_arg(CallbackArg::Layout(layout));
        self.dispatch(HostOpcode::IoChanged, call).ret != 0
    }

    pub fn size_window(&self, width: i32, height: i32) -> bool {
        let call = CallbackCall {
            index: width,
            value: height as isize,
            ..CallbackCall::default()
        };
        self.dispatch(HostOpcode::SizeWindow, call).ret != 0
    }

    pub fn update_display(&self) -> bool {
        self.dispatch(HostOpcode::UpdateDisplay, CallbackCall::default()).ret != 0
    }

    pub fn can_do(&self, capability: &str) -> bool {
        let call = CallbackCall::with_arg(CallbackArg::Text(capability));
        self.dispatch(HostOpcode::CanDo, call).ret != 0
    }

    pub fn vendor_string(&self) -> String {
        self.dispatch(HostOpcode::GetVendorString, CallbackCall::default())
            .text
            .unwrap_or_default()
    }

    pub fn product_string(&self) -> String {
        self.dispatch(HostOpcode::GetProductString, CallbackCall::default())
            .text
            .unwrap_or_default()
    }

    /// Tell the host this server is giving up.
    pub fn disconnect(&self) {
        self.dispatch(HostOpcode::Disconnect, CallbackCall::default());
    }
}

impl LinkInner {
    fn forward(
        &self,
        opcode: HostOpcode,
        call: &CallbackCall<'_>,
        marshal: MarshalFn,
        reply: ReplyKind,
    ) -> CallbackReply {
        let result = self.requester.call(
            opcode as i32,
            "host callback",
            self.timeout,
            |req| marshal(self, call, req),
            |r| {
                Ok(match reply {
                    ReplyKind::Text => CallbackReply {
                        ret: r.ret_int() as isize,
                        text: Some(truncate_name(r.text())),
                        ..CallbackReply::default()
                    },
                    _ => CallbackReply::int(r.ret_int() as isize),
                })
            },
        );

        match result {
            Ok(reply) => reply,
            Err(e) if e.is_terminal() => {
                tracing::warn!(?opcode, "host unreachable, exiting: {}", e);
                self.state.exit.set();
                CallbackReply::default()
            }
            Err(e) => {
                tracing::warn!(?opcode, "host callback failed: {}", e);
                CallbackReply::default()
            }
        }
    }
}

fn truncate_name(mut text: String) -> String {
    if text.len() > MAX_NAME_LEN {
        let mut end = MAX_NAME_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use linbridge_plugin::control::{Responder, Served};
    use linbridge_plugin::Geometry;
    use std::thread;

    struct Rig {
        state: Arc<SessionState>,
        link: HostLink,
        control: Arc<Shared<ControlRegion>>,
        audio: Arc<AudioBus>,
    }

    fn rig(tag: &str) -> Rig {
        let pid = std::process::id();
        let control =
            Arc::new(Shared::<ControlRegion>::create(&format!("test_relay_{tag}_{pid}")).unwrap());
        let geometry = Geometry {
            max_channels: 1,
            max_frames: 8,
            ..Geometry::default()
        };
        let audio = Arc::new(
            AudioBus::create(&format!("test_relay_audio_{tag}_{pid}"), &geometry).unwrap(),
        );
        let state = Arc::new(SessionState::new(ExitFlag::new()));
        let link = HostLink::new(
            Arc::clone(&state),
            Arc::clone(&control),
            Arc::clone(&audio),
            Duration::from_millis(200),
        );
        Rig {
            state,
            link,
            control,
            audio,
        }
    }

    /// Answers `count` callbacks on a thread, recording opcodes.
    fn answer(
        control: &Arc<Shared<ControlRegion>>,
        count: usize,
        ret: i64,
    ) -> thread::JoinHandle<Vec<(i32, i32, i32)>> {
        let responder = Responder::new(Arc::clone(control), MailboxKind::Callback);
        thread::spawn(move || {
            let mut seen = Vec::new();
            while seen.len() < count {
                let served = responder.serve_one(
                    Duration::from_millis(5),
                    || false,
                    |ex| {
                        seen.push((ex.opcode(), ex.value(), ex.value2()));
                        ex.reply_text("Host Co", MAX_NAME_LEN);
                        ex.set_ret_int(ret);
                    },
                );
                assert_ne!(served, Served::Cancelled);
            }
            seen
        })
    }

    #[test]
    fn test_table_is_complete() {
        for op in HostOpcode::ALL {
            assert!(route_for(op).is_some(), "{op:?} has no route");
        }
        assert_eq!(CALLBACK_TABLE.len(), HostOpcode::ALL.len());
    }

    #[test]
    fn test_detached_link_answers_version_only() {
        let link = HostLink::detached();
        assert_eq!(link.version(), 2400);
        assert_eq!(
            link.dispatch(HostOpcode::GetSampleRate, CallbackCall::default()),
            CallbackReply::default()
        );
        assert_eq!(link.vendor_string(), "");
    }

    #[test]
    fn test_local_and_fixed_answers() {
        let r = rig("local");
        r.state.set_sample_rate(48000.0);
        r.state.set_block_size(256);
        r.state.set_unique_id(1234);

        let ask = |op| r.link.dispatch(op, CallbackCall::default()).ret;
        assert_eq!(ask(HostOpcode::Version), 2400);
        assert_eq!(ask(HostOpcode::GetLanguage), 1);
        assert_eq!(ask(HostOpcode::GetSampleRate), 48000);
        assert_eq!(ask(HostOpcode::GetBlockSize), 256);
        assert_eq!(ask(HostOpcode::CurrentId), 1234);
        assert_eq!(ask(HostOpcode::TempoAt), 1_200_000);
        assert_eq!(ask(HostOpcode::GetNumAutomatableParameters), 5000);
        assert_eq!(ask(HostOpcode::WillReplaceOrAccumulate), 1);
        assert_eq!(ask(HostOpcode::GetInputLatency), 0);
        assert!(r.link.can_do("sizeWindow"));
        assert!(!r.link.can_do("offline"));
    }

    #[test]
    fn test_process_level_follows_thread() {
        let r = rig("level");
        assert_eq!(
            r.link
                .dispatch(HostOpcode::GetCurrentProcessLevel, CallbackCall::default())
                .ret,
            1
        );
        let link = r.link.clone();
        let level = thread::spawn(move || {
            mark_audio_thread();
            link.dispatch(HostOpcode::GetCurrentProcessLevel, CallbackCall::default())
                .ret
        })
        .join()
        .unwrap();
        assert_eq!(level, 2);
    }

    #[test]
    fn test_time_comes_from_last_process_call() {
        let r = rig("time");
        let time = TimeInfo {
            tempo: 97.0,
            sample_pos: 4096.0,
            ..TimeInfo::default()
        };
        r.state.set_time(time);
        assert_eq!(r.link.time(), Some(time));
    }

    #[test]
    fn test_effect_open_guard_blocks_before_open() {
        let r = rig("guard");
        // No responder: a forwarded call would time out and set exit
        r.link.automate(3, 0.5);
        assert!(!r.state.is_exiting());
    }

    #[test]
    fn test_remote_automate_reaches_host() {
        let r = rig("automate");
        r.state.set_effect_open(true);
        let host = answer(&r.control, 1, 0);
        r.link.automate(9, 0.75);
        let seen = host.join().unwrap();
        assert_eq!(seen, vec![(HostOpcode::Automate as i32, 9, 0)]);
    }

    #[test]
    fn test_vendor_string_text_reply() {
        let r = rig("vendor");
        let host = answer(&r.control, 1, 1);
        assert_eq!(r.link.vendor_string(), "Host Co");
        host.join().unwrap();
    }

    #[test]
    fn test_size_window_needs_visible_editor_and_change() {
        let r = rig("window");
        r.state.set_effect_open(true);
        assert!(!r.link.size_window(800, 600));

        r.state.set_editor_visible(true);
        let host = answer(&r.control, 1, 1);
        assert!(r.link.size_window(800, 600));
        // Same size again: not forwarded
        assert!(!r.link.size_window(800, 600));
        let seen = host.join().unwrap();
        assert_eq!(seen, vec![(HostOpcode::SizeWindow as i32, 800, 600)]);
    }

    #[test]
    fn test_io_changed_only_when_layout_differs() {
        let r = rig("io");
        r.state.set_effect_open(true);
        let layout = IoLayout {
            num_inputs: 2,
            num_outputs: 2,
            initial_delay: 0,
        };
        r.state.note_layout(layout);
        assert!(!r.link.io_changed(layout));

        let host = answer(&r.control, 1, 1);
        assert!(r.link.io_changed(IoLayout {
            initial_delay: 64,
            ..layout
        }));
        host.join().unwrap();
    }

    #[test]
    fn test_events_skip_sysex() {
        let r = rig("events");
        r.state.set_effect_open(true);
        assert!(!r.link.process_events(&[Event::sysex(0, &[0xf0, 0x7e, 0xf7])]));

        let host = answer(&r.control, 1, 1);
        assert!(r.link.process_events(&[
            Event::sysex(0, &[0xf0, 0x7e, 0xf7]),
            Event::midi(4, [0x90, 64, 100]),
        ]));
        host.join().unwrap();

        let forwarded = r.audio.read_events(EventLane::ToHost).unwrap();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].midi_bytes(), Some([0x90, 64, 100]));
    }

    #[test]
    fn test_unanswered_callback_sets_exit() {
        let r = rig("timeout");
        r.state.set_effect_open(true);
        r.link.update_display();
        assert!(r.state.is_exiting());
        // Later callbacks are dropped without waiting
        let start = std::time::Instant::now();
        r.link.automate(0, 0.0);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_unknown_raw_opcode() {
        let r = rig("unknown");
        assert_eq!(r.link.dispatch_raw(4242, CallbackCall::default()).ret, 0);
        assert_eq!(r.link.dispatch_raw(1, CallbackCall::default()).ret, 2400);
    }
}
