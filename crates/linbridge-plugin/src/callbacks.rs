//! Host side of the callback mailbox.
//!
//! The server relays the engine's host callbacks upward; a dedicated host
//! thread answers them through [`HostCallbacks`].

use crate::audio::{AudioBus, EventLane};
use crate::control::{ClosedFlag, ControlRegion, Exchange, Responder, Served};
use crate::error::{BridgeError, Result};
use crate::events::Event;
use crate::protocol::{HostOpcode, IoLayout, MailboxKind, TimeInfo, MAX_NAME_LEN};
use crate::shared_memory::Shared;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// What the outer host offers to the wrapped engine. Every method has a
/// neutral default.
#[allow(unused_variables)]
pub trait HostCallbacks: Send + Sync {
    fn automate(&self, index: i32, value: f32) {}

    fn begin_edit(&self, index: i32) {}

    fn end_edit(&self, index: i32) {}

    fn automation_state(&self) -> i32 {
        0
    }

    fn set_time(&self, time: &TimeInfo) {}

    fn process_events(&self, events: &[Event]) -> bool {
        false
    }

    fn io_changed(&self, layout: IoLayout) -> bool {
        false
    }

    fn size_window(&self, width: i32, height: i32) -> bool {
        false
    }

    fn update_display(&self) -> bool {
        false
    }

    fn vendor_string(&self) -> String {
        String::new()
    }

    fn product_string(&self) -> String {
        String::new()
    }

    fn vendor_version(&self) -> i32 {
        0
    }

    /// The server gave up after the ready handshake.
    fn disconnected(&self) {}
}

/// Answers nothing.
pub struct NullCallbacks;

impl HostCallbacks for NullCallbacks {}

fn handle_callback(
    callbacks: &dyn HostCallbacks,
    audio: &AudioBus,
    closed: &ClosedFlag,
    ex: &mut Exchange<'_>,
) {
    let op = HostOpcode::from_raw(ex.opcode());
    let ret: i64 = match op {
        Some(HostOpcode::Automate) => {
            callbacks.automate(ex.value(), ex.float_value());
            0
        }
        Some(HostOpcode::BeginEdit) => {
            callbacks.begin_edit(ex.value());
            1
        }
        Some(HostOpcode::EndEdit) => {
            callbacks.end_edit(ex.value());
            1
        }
        Some(HostOpcode::GetAutomationState) => callbacks.automation_state() as i64,
        Some(HostOpcode::SetTime) => match ex.arg::<TimeInfo>() {
            Ok(time) => {
                callbacks.set_time(&time);
                1
            }
            Err(e) => {
                tracing::warn!("bad SetTime payload: {}", e);
                0
            }
        },
        Some(HostOpcode::ProcessEvents) => match audio.read_events(EventLane::ToHost) {
            Ok(events) => callbacks.process_events(&events) as i64,
            Err(e) => {
                tracing::warn!("bad event batch from server: {}", e);
                0
            }
        },
        Some(HostOpcode::IoChanged) => match ex.arg::<IoLayout>() {
            Ok(layout) => callbacks.io_changed(layout) as i64,
            Err(e) => {
                tracing::warn!("bad IoChanged payload: {}", e);
                0
            }
        },
        Some(HostOpcode::SizeWindow) => callbacks.size_window(ex.value(), ex.value2()) as i64,
        Some(HostOpcode::UpdateDisplay) => callbacks.update_display() as i64,
        Some(HostOpcode::GetVendorString) => {
            let vendor = callbacks.vendor_string();
            ex.reply_text(&vendor, MAX_NAME_LEN);
            1
        }
        Some(HostOpcode::GetProductString) => {
            let product = callbacks.product_string();
            ex.reply_text(&product, MAX_NAME_LEN);
            1
        }
        Some(HostOpcode::GetVendorVersion) => callbacks.vendor_version() as i64,
        Some(HostOpcode::Disconnect) => {
            tracing::warn!("server disconnected");
            closed.close();
            callbacks.disconnected();
            0
        }
        _ => {
            tracing::debug!(opcode = ex.opcode(), "unhandled host callback");
            0
        }
    };
    ex.set_ret_int(ret);
}

/// Thread serving the callback mailbox. Stops on drop.
pub struct CallbackService {
    responder: Arc<Responder>,
    running: Arc<AtomicBool>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl CallbackService {
    pub fn spawn(
        control: Arc<Shared<ControlRegion>>,
        audio: Arc<AudioBus>,
        callbacks: Arc<dyn HostCallbacks>,
        closed: ClosedFlag,
        poll: Duration,
    ) -> Result<Self> {
        let responder = Arc::new(Responder::new(control, MailboxKind::Callback));
        let running = Arc::new(AtomicBool::new(true));

        let thread_handle = {
            let responder = Arc::clone(&responder);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("linbridge-callbacks".to_string())
                .spawn(move || {
                    while running.load(Ordering::Acquire) {
                        let served = responder.serve_one(
                            poll,
                            || !running.load(Ordering::Acquire),
                            |ex| handle_callback(callbacks.as_ref(), &audio, &closed, ex),
                        );
                        if served == Served::Cancelled {
                            break;
                        }
                    }
                })
                .map_err(|e| BridgeError::ConnectionFailed(format!("callback thread: {e}")))?
        };

        Ok(Self {
            responder,
            running,
            thread_handle: Some(thread_handle),
        })
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        self.responder.wake();

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CallbackService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
