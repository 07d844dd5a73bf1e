//! Error taxonomy.
//!
//! Startup failures (`ServeError`) are fatal and surfaced to the caller.
//! `AcceptError::ListenerClosed` is the expected terminal signal to an
//! accept loop during shutdown and is not an error condition worth
//! logging. `RestartError` is recoverable: a failed handoff leaves the
//! old process serving.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Fatal startup errors returned by [`Server::serve`](crate::Server::serve)
/// and the `listen_and_serve*` entry points. A clean shutdown returns
/// `Ok(())`, never an error.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The listening address could not be bound (in use, permission denied).
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// TLS certificate or key material could not be read.
    #[error("failed to load TLS material from {path}: {source}")]
    CertificateLoad {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The certificate/key pair was rejected by rustls.
    #[error("invalid TLS certificate or key: {0}")]
    Tls(#[from] rustls::Error),
}

/// Errors returned by [`DrainingListener::accept`](crate::DrainingListener::accept).
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The listener was closed for new accepts. Expected during shutdown;
    /// terminates the accept loop.
    #[error("listener closed")]
    ListenerClosed,

    /// A transient accept failure (e.g. fd exhaustion). The accept loop
    /// may log and continue.
    #[error("accept failed: {0}")]
    Io(#[from] io::Error),
}

/// Errors from the handoff path. All variants are recoverable: the old
/// process logs the failure and keeps serving.
#[derive(Debug, Error)]
pub enum RestartError {
    /// This platform has no fork/exec + fd inheritance primitive.
    #[error("graceful restart is not supported on this platform")]
    Unsupported,

    /// The readiness-handshake pipe could not be created.
    #[error("failed to create readiness pipe: {0}")]
    Pipe(#[source] io::Error),

    /// The successor process could not be spawned.
    #[error("failed to spawn successor process: {0}")]
    Spawn(#[source] io::Error),

    /// The successor exited (or closed the readiness pipe) before
    /// acknowledging readiness.
    #[error("successor exited before signalling readiness")]
    SuccessorExited,

    /// The successor did not acknowledge readiness within the deadline.
    #[error("successor not ready within {0:?}")]
    ReadyTimeout(Duration),

    /// I/O failure while waiting for the readiness acknowledgement.
    #[error("readiness handshake failed: {0}")]
    Handshake(#[source] io::Error),
}

/// Errors from [`Server::register_hook`](crate::Server::register_hook).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HookError {
    /// A hook with this id is already registered for the same
    /// (phase, signal) pair.
    #[error("hook {id:?} already registered for this signal and phase")]
    DuplicateHook { id: String },

    /// Hooks cannot be registered for this signal (only reload,
    /// interrupt and terminate are hookable).
    #[error("signal is not hookable")]
    UnsupportedSignal,

    /// The server has left the initializing state; the hook table is
    /// read-only once dispatch may be running.
    #[error("hook registration is only permitted before serving begins")]
    RegistrationClosed,
}
