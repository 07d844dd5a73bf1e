//! Signal dispatch and the hook table.
//!
//! OS signals are mapped onto a closed set of lifecycle signals and fed
//! through an mpsc channel to the serve loop, which processes them strictly
//! serially: pre-dispatch hooks, then the built-in transition, then
//! post-dispatch hooks. Administrative calls (via
//! [`ServerController`](crate::ServerController)) travel the same channel,
//! so they share the ordering guarantee.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::HookError;

/// The closed set of lifecycle events a server reacts to.
///
/// On Unix: `SIGHUP` → `Reload`, `SIGINT` → `Interrupt`, `SIGTERM` →
/// `Terminate`. `Unknown` exists for events outside the recognized set;
/// it is logged and ignored — no hooks, no transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleSignal {
    /// Spawn a successor, hand off the socket, then drain and exit.
    Reload,
    /// Stop accepting, drain, exit.
    Interrupt,
    /// Stop accepting, drain, exit.
    Terminate,
    /// Not part of the recognized set; ignored.
    Unknown,
}

impl LifecycleSignal {
    pub fn is_hookable(self) -> bool {
        !matches!(self, LifecycleSignal::Unknown)
    }
}

/// Whether a hook runs before or after the built-in transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    Pre,
    Post,
}

pub(crate) type Hook = Box<dyn Fn() + Send + Sync>;

struct HookEntry {
    id: String,
    hook: Hook,
}

/// Ordered hook lists keyed by (phase, signal).
///
/// Owned by one [`Server`](crate::Server) — never shared across server
/// instances. Registration is open during initialization only; `seal()`
/// makes the table read-only before dispatch can run, so `run()` never
/// races a registration.
#[derive(Default)]
pub(crate) struct SignalHooks {
    sealed: AtomicBool,
    entries: RwLock<HashMap<(HookPhase, LifecycleSignal), Vec<HookEntry>>>,
}

impl SignalHooks {
    pub(crate) fn register(
        &self,
        phase: HookPhase,
        signal: LifecycleSignal,
        id: impl Into<String>,
        hook: Hook,
    ) -> Result<(), HookError> {
        if !signal.is_hookable() {
            return Err(HookError::UnsupportedSignal);
        }
        // Checked before taking the lock so a hook that mistakenly calls
        // register() errors out instead of deadlocking under run()'s lock.
        if self.sealed.load(Ordering::Acquire) {
            return Err(HookError::RegistrationClosed);
        }
        let id = id.into();
        let mut entries = self.entries.write().expect("hook table poisoned");
        let list = entries.entry((phase, signal)).or_default();
        if list.iter().any(|entry| entry.id == id) {
            return Err(HookError::DuplicateHook { id });
        }
        list.push(HookEntry { id, hook });
        Ok(())
    }

    /// Close the table for registration. Called once when serving begins.
    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// Invoke all hooks for (phase, signal) in registration order.
    pub(crate) fn run(&self, phase: HookPhase, signal: LifecycleSignal) {
        let entries = self.entries.read().expect("hook table poisoned");
        if let Some(list) = entries.get(&(phase, signal)) {
            for entry in list {
                debug!(id = %entry.id, ?phase, ?signal, "running signal hook");
                (entry.hook)();
            }
        }
    }
}

/// Subscribe to the process signal set and forward mapped lifecycle
/// signals into `tx`. Runs until the receiving side goes away.
#[cfg(unix)]
pub(crate) fn spawn_os_listener(tx: mpsc::Sender<LifecycleSignal>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::spawn(async move {
        loop {
            let sig = tokio::select! {
                _ = hangup.recv() => LifecycleSignal::Reload,
                _ = interrupt.recv() => LifecycleSignal::Interrupt,
                _ = terminate.recv() => LifecycleSignal::Terminate,
            };
            debug!(?sig, "os signal received");
            if tx.send(sig).await.is_err() {
                // Server is gone.
                break;
            }
        }
    });
}

/// Platforms without Unix process signals: ctrl-c maps to `Interrupt`;
/// there is no reload signal.
#[cfg(not(unix))]
pub(crate) fn spawn_os_listener(tx: mpsc::Sender<LifecycleSignal>) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                break;
            }
            if tx.send(LifecycleSignal::Interrupt).await.is_err() {
                break;
            }
        }
    });
}
