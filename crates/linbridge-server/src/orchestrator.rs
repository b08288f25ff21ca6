//! Server execution contexts.
//!
//! Up to four long-lived loops, each started suspended and released once the
//! engine exists. They stop when the shared [`ExitFlag`] is set.

use crossbeam_channel::{bounded, Receiver, Sender};
use linbridge_plugin::{BridgeError, LoadStage, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// One-way session exit latch. Cloning shares the latch.
#[derive(Clone, Default)]
pub struct ExitFlag {
    inner: Arc<ExitInner>,
}

#[derive(Default)]
struct ExitInner {
    set: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl ExitFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let _guard = self.inner.lock.lock();
        if !self.inner.set.swap(true, Ordering::AcqRel) {
            tracing::debug!("session exiting");
        }
        self.inner.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::Acquire)
    }

    /// Sleep up to `duration`, waking early on exit. Returns true if exiting.
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut guard = self.inner.lock.lock();
        if !self.is_set() {
            self.inner.cond.wait_for(&mut guard, duration);
        }
        self.is_set()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    Audio = 0,
    PointerTracking = 1,
    Parameter = 2,
    Control = 3,
}

impl ContextKind {
    pub const ALL: [ContextKind; 4] = [
        ContextKind::Audio,
        ContextKind::PointerTracking,
        ContextKind::Parameter,
        ContextKind::Control,
    ];

    fn thread_name(self) -> &'static str {
        match self {
            ContextKind::Audio => "linbridge-audio",
            ContextKind::PointerTracking => "linbridge-pointer",
            ContextKind::Parameter => "linbridge-params",
            ContextKind::Control => "linbridge-control",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Break,
}

/// Body of one execution context.
pub trait ExecutionContext: Send {
    /// Called when the thread is released, on that thread.
    fn enter(&mut self) {}

    /// One unit of work.
    fn run_once(&mut self) -> LoopControl;
}

struct Slot {
    gate: Option<Sender<Box<dyn ExecutionContext>>>,
    handle: Option<JoinHandle<()>>,
    finished: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub joined: Vec<ContextKind>,
    /// Threads still running at the bound; their handles were released.
    pub detached: Vec<ContextKind>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.detached.is_empty()
    }
}

/// Exactly four thread slots, indexed by [`ContextKind`].
pub struct ThreadSet {
    exit: ExitFlag,
    slots: [Option<Slot>; 4],
}

impl ThreadSet {
    pub fn new(exit: ExitFlag) -> Self {
        Self {
            exit,
            slots: [None, None, None, None],
        }
    }

    pub fn exit_flag(&self) -> &ExitFlag {
        &self.exit
    }

    /// Start the thread for `kind`, parked until [`resume`](Self::resume).
    pub fn spawn_suspended(&mut self, kind: ContextKind) -> Result<()> {
        let (gate, start): (Sender<Box<dyn ExecutionContext>>, Receiver<_>) = bounded(1);
        let finished = Arc::new(AtomicBool::new(false));

        let handle = {
            let exit = self.exit.clone();
            let finished = Arc::clone(&finished);
            thread::Builder::new()
                .name(kind.thread_name().to_string())
                .spawn(move || {
                    if let Ok(mut body) = start.recv() {
                        body.enter();
                        while !exit.is_set() {
                            if body.run_once() == LoopControl::Break {
                                break;
                            }
                        }
                    }
                    finished.store(true, Ordering::Release);
                })
                .map_err(|e| BridgeError::LoadFailed {
                    path: kind.thread_name().into(),
                    stage: LoadStage::ThreadSetup,
                    reason: e.to_string(),
                })?
        };

        self.slots[kind as usize] = Some(Slot {
            gate: Some(gate),
            handle: Some(handle),
            finished,
        });
        Ok(())
    }

    pub fn is_spawned(&self, kind: ContextKind) -> bool {
        self.slots[kind as usize].is_some()
    }

    pub fn resume(&mut self, kind: ContextKind, body: Box<dyn ExecutionContext>) -> Result<()> {
        let gate = self.slots[kind as usize]
            .as_mut()
            .and_then(|slot| slot.gate.take())
            .ok_or_else(|| BridgeError::LoadFailed {
                path: kind.thread_name().into(),
                stage: LoadStage::ThreadSetup,
                reason: "thread not spawned or already resumed".to_string(),
            })?;
        gate.send(body).map_err(|_| BridgeError::LoadFailed {
            path: kind.thread_name().into(),
            stage: LoadStage::ThreadSetup,
            reason: "thread exited before resume".to_string(),
        })
    }

    pub fn is_finished(&self, kind: ContextKind) -> bool {
        self.slots[kind as usize]
            .as_ref()
            .map_or(true, |slot| slot.finished.load(Ordering::Acquire))
    }

    fn all_finished(&self) -> bool {
        ContextKind::ALL.iter().all(|&kind| self.is_finished(kind))
    }

    /// Set exit, release parked threads, call `wake` until every loop has
    /// finished or `bound` elapses, then join or detach each handle.
    pub fn shutdown(&mut self, wake: impl Fn(), bound: Duration) -> ShutdownReport {
        self.exit.set();
        for slot in self.slots.iter_mut().flatten() {
            slot.gate.take();
        }

        let deadline = Instant::now() + bound;
        wake();
        while !self.all_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
            wake();
        }

        let mut report = ShutdownReport::default();
        for kind in ContextKind::ALL {
            let Some(mut slot) = self.slots[kind as usize].take() else {
                continue;
            };
            let Some(handle) = slot.handle.take() else {
                continue;
            };
            if slot.finished.load(Ordering::Acquire) {
                let _ = handle.join();
                report.joined.push(kind);
            } else {
                tracing::warn!(context = ?kind, "execution context did not finish, detaching");
                drop(handle);
                report.detached.push(kind);
            }
        }
        report
    }
}

impl Drop for ThreadSet {
    fn drop(&mut self) {
        if self.slots.iter().any(Option::is_some) {
            self.shutdown(|| {}, Duration::from_secs(1));
        }
    }
}
