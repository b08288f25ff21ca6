//! Control region: boot header plus one single-slot mailbox per channel.
//!
//! A mailbox is a [`ControlBlock`] with two semaphores. The requester
//! writes its arguments, posts `request` and waits on `response`; the
//! responder waits on `request`, reads, writes results and posts
//! `response`. For host-driven mailboxes `request` is the run-server signal
//! and `response` the run-client signal; the callback mailbox uses the same
//! layout with the roles swapped.

use crate::bounded::BoundedBuf;
use crate::error::{BridgeError, Result};
use crate::protocol::{
    Geometry, MailboxKind, SessionOptions, MAILBOX_COUNT, PAYLOAD_CAPACITY, PROTOCOL_VERSION,
};
use crate::semaphore::{BinarySemaphore, WaitOutcome};
use crate::shared_memory::{Shared, ShmLayout};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Boot cell values.
pub const BOOT_PENDING: i32 = 1000;
pub const BOOT_SERVER_READY: i32 = 2000;
pub const BOOT_HOST_ACK: i32 = 6000;

#[repr(C)]
pub struct BootHeader {
    pub state: AtomicI32,
    protocol_version: AtomicU32,
    options: AtomicU32,
    max_channels: AtomicU32,
    max_frames: AtomicU32,
    chunk_capacity: AtomicU32,
    max_parameters: AtomicU32,
    host_pid: AtomicU32,
}

impl BootHeader {
    /// Written by the host before the server is launched.
    pub fn publish(&self, geometry: &Geometry, options: SessionOptions, host_pid: u32) {
        self.protocol_version
            .store(PROTOCOL_VERSION, Ordering::Relaxed);
        self.options.store(options.to_bits(), Ordering::Relaxed);
        self.max_channels
            .store(geometry.max_channels, Ordering::Relaxed);
        self.max_frames.store(geometry.max_frames, Ordering::Relaxed);
        self.chunk_capacity
            .store(geometry.chunk_capacity, Ordering::Relaxed);
        self.max_parameters
            .store(geometry.max_parameters, Ordering::Relaxed);
        self.host_pid.store(host_pid, Ordering::Relaxed);
        self.state.store(BOOT_PENDING, Ordering::Release);
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version.load(Ordering::Acquire)
    }

    pub fn options(&self) -> SessionOptions {
        SessionOptions::from_bits(self.options.load(Ordering::Acquire))
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            max_channels: self.max_channels.load(Ordering::Acquire),
            max_frames: self.max_frames.load(Ordering::Acquire),
            chunk_capacity: self.chunk_capacity.load(Ordering::Acquire),
            max_parameters: self.max_parameters.load(Ordering::Acquire),
        }
    }

    pub fn host_pid(&self) -> u32 {
        self.host_pid.load(Ordering::Acquire)
    }

    pub fn state(&self) -> i32 {
        self.state.load(Ordering::Acquire)
    }

    pub fn set_state(&self, state: i32) {
        self.state.store(state, Ordering::Release);
    }
}

#[repr(C)]
pub struct ControlBlock {
    request: BinarySemaphore,
    response: BinarySemaphore,
    opcode: AtomicI32,
    value: AtomicI32,
    value2: AtomicI32,
    float_value: AtomicU32,
    ret_int: AtomicI64,
    ret_float: AtomicU32,
    payload: UnsafeCell<BoundedBuf<PAYLOAD_CAPACITY>>,
}

// SAFETY: the payload cell is only touched by the current turn holder
unsafe impl Sync for ControlBlock {}

impl ControlBlock {
    /// Post both semaphores so neither side stays blocked on this mailbox.
    pub fn wake_all(&self) {
        self.request.post();
        self.response.post();
    }

    /// Release a requester waiting for a reply on this mailbox.
    pub fn wake_response(&self) {
        self.response.post();
    }
}

#[repr(C)]
pub struct ControlRegion {
    pub boot: BootHeader,
    mailboxes: [ControlBlock; MAILBOX_COUNT],
}

unsafe impl ShmLayout for ControlRegion {}

impl ControlRegion {
    pub fn mailbox(&self, kind: MailboxKind) -> &ControlBlock {
        &self.mailboxes[kind.index()]
    }

    pub fn wake_all(&self) {
        for block in &self.mailboxes {
            block.wake_all();
        }
    }

    /// Release requesters blocked on the given mailboxes. Only meaningful once
    /// the session's `ClosedFlag` is set, so the woken calls fail instead of
    /// reading a reply.
    pub fn wake_responses(&self, kinds: &[MailboxKind]) {
        for &kind in kinds {
            self.mailbox(kind).wake_response();
        }
    }
}

/// Session-wide latch set once the peer is considered gone.
#[derive(Debug, Clone, Default)]
pub struct ClosedFlag(Arc<AtomicBool>);

impl ClosedFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ============================================================================
// Turn-holder views
// ============================================================================

/// Arguments being written by the requester.
pub struct Request<'a> {
    block: &'a ControlBlock,
}

impl Request<'_> {
    pub fn set_value(&mut self, value: i32) {
        self.block.value.store(value, Ordering::Relaxed);
    }

    pub fn set_value2(&mut self, value: i32) {
        self.block.value2.store(value, Ordering::Relaxed);
    }

    pub fn set_float(&mut self, value: f32) {
        self.block
            .float_value
            .store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn payload_mut(&mut self) -> &mut BoundedBuf<PAYLOAD_CAPACITY> {
        // SAFETY: the requester holds the turn until it posts
        unsafe { &mut *self.block.payload.get() }
    }

    pub fn set_text(&mut self, text: &str, max_len: usize) {
        let _ = self.payload_mut().write_str(text, max_len);
    }

    pub fn set_payload<T: Serialize>(&mut self, value: &T) -> Result<()> {
        self.payload_mut().write_value(value)
    }
}

/// Results left by the responder.
pub struct Reply<'a> {
    block: &'a ControlBlock,
}

impl Reply<'_> {
    pub fn ret_int(&self) -> i64 {
        self.block.ret_int.load(Ordering::Acquire)
    }

    pub fn ret_float(&self) -> f32 {
        f32::from_bits(self.block.ret_float.load(Ordering::Acquire))
    }

    pub fn payload(&self) -> &BoundedBuf<PAYLOAD_CAPACITY> {
        // SAFETY: the responder handed the turn back before posting
        unsafe { &*self.block.payload.get() }
    }

    pub fn text(&self) -> String {
        self.payload().read_string()
    }

    pub fn value<T: DeserializeOwned>(&self) -> Result<T> {
        self.payload().read_value()
    }
}

/// The responder's view: arguments in, results out.
pub struct Exchange<'a> {
    block: &'a ControlBlock,
}

impl Exchange<'_> {
    pub fn opcode(&self) -> i32 {
        self.block.opcode.load(Ordering::Acquire)
    }

    pub fn value(&self) -> i32 {
        self.block.value.load(Ordering::Relaxed)
    }

    pub fn value2(&self) -> i32 {
        self.block.value2.load(Ordering::Relaxed)
    }

    pub fn float_value(&self) -> f32 {
        f32::from_bits(self.block.float_value.load(Ordering::Relaxed))
    }

    pub fn payload(&self) -> &BoundedBuf<PAYLOAD_CAPACITY> {
        // SAFETY: the responder holds the turn until it posts
        unsafe { &*self.block.payload.get() }
    }

    pub fn payload_mut(&mut self) -> &mut BoundedBuf<PAYLOAD_CAPACITY> {
        // SAFETY: as above
        unsafe { &mut *self.block.payload.get() }
    }

    pub fn text(&self) -> String {
        self.payload().read_string()
    }

    pub fn arg<T: DeserializeOwned>(&self) -> Result<T> {
        self.payload().read_value()
    }

    pub fn set_ret_int(&mut self, value: i64) {
        self.block.ret_int.store(value, Ordering::Release);
    }

    pub fn set_ret_float(&mut self, value: f32) {
        self.block
            .ret_float
            .store(value.to_bits(), Ordering::Release);
    }

    pub fn reply_text(&mut self, text: &str, max_len: usize) {
        let _ = self.payload_mut().write_str(text, max_len);
    }

    pub fn reply_value<T: Serialize>(&mut self, value: &T) -> Result<()> {
        self.payload_mut().write_value(value)
    }
}

// ============================================================================
// Requester / Responder
// ============================================================================

/// Issues requests on one mailbox, one at a time.
pub struct Requester {
    region: Arc<Shared<ControlRegion>>,
    kind: MailboxKind,
    turn: Mutex<()>,
    closed: ClosedFlag,
}

impl Requester {
    pub fn new(region: Arc<Shared<ControlRegion>>, kind: MailboxKind, closed: ClosedFlag) -> Self {
        Self {
            region,
            kind,
            turn: Mutex::new(()),
            closed,
        }
    }

    pub fn kind(&self) -> MailboxKind {
        self.kind
    }

    /// One round trip. A timeout closes the session: a late response would
    /// otherwise be taken as the answer to the next request.
    pub fn call<T>(
        &self,
        opcode: i32,
        operation: &str,
        timeout: Duration,
        marshal: impl FnOnce(&mut Request<'_>) -> Result<()>,
        unmarshal: impl FnOnce(&Reply<'_>) -> Result<T>,
    ) -> Result<T> {
        if self.closed.is_closed() {
            return Err(BridgeError::session_closed(operation));
        }

        let _turn = self.turn.lock();
        let block = self.region.mailbox(self.kind);

        block.ret_int.store(0, Ordering::Relaxed);
        block.ret_float.store(0, Ordering::Relaxed);
        block.value.store(0, Ordering::Relaxed);
        block.value2.store(0, Ordering::Relaxed);
        block.float_value.store(0, Ordering::Relaxed);
        let mut request = Request { block };
        request.payload_mut().clear();
        marshal(&mut request)?;
        block.opcode.store(opcode, Ordering::Release);

        block.request.post();
        match block.response.wait(timeout) {
            WaitOutcome::Signaled => {
                if self.closed.is_closed() {
                    return Err(BridgeError::session_closed(operation));
                }
                unmarshal(&Reply { block })
            }
            WaitOutcome::TimedOut => {
                tracing::warn!(
                    mailbox = ?self.kind,
                    operation,
                    timeout_ms = timeout.as_millis() as u64,
                    "no response from peer, closing session"
                );
                self.closed.close();
                Err(BridgeError::session_closed(operation))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    /// Nothing arrived within the poll interval.
    Idle,
    Handled,
    /// Woken for shutdown; no handler ran.
    Cancelled,
}

/// Answers requests on one mailbox.
pub struct Responder {
    region: Arc<Shared<ControlRegion>>,
    kind: MailboxKind,
}

impl Responder {
    pub fn new(region: Arc<Shared<ControlRegion>>, kind: MailboxKind) -> Self {
        Self { region, kind }
    }

    pub fn kind(&self) -> MailboxKind {
        self.kind
    }

    pub fn serve_one(
        &self,
        poll: Duration,
        cancelled: impl Fn() -> bool,
        handler: impl FnOnce(&mut Exchange<'_>),
    ) -> Served {
        let block = self.region.mailbox(self.kind);
        if block.request.wait(poll) == WaitOutcome::TimedOut {
            return Served::Idle;
        }
        if cancelled() {
            return Served::Cancelled;
        }
        handler(&mut Exchange { block });
        block.response.post();
        Served::Handled
    }

    /// Unblock a loop waiting in [`serve_one`](Self::serve_one).
    pub fn wake(&self) {
        self.region.mailbox(self.kind).request.post();
    }
}
