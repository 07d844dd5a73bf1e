//! # molt
//!
//! Zero-downtime restarts for tokio servers.
//!
//! ## Overview
//!
//! Molt lets a long-running server reload its binary or configuration
//! without dropping a single in-flight connection and without a gap in
//! listening on its port:
//! 1. On a reload signal, the listening socket is passed to a freshly
//!    spawned sibling process via fd inheritance
//! 2. The new process signals readiness and starts accepting on the
//!    inherited socket
//! 3. The old process stops accepting and drains in-flight connections
//! 4. After drain (or the hammer-time deadline), the old process exits
//!
//! ## Signal Conventions
//!
//! - `SIGHUP` — Graceful restart (spawn successor with fd inheritance,
//!   then drain and exit)
//! - `SIGINT` / `SIGTERM` — Graceful shutdown (drain connections, then exit)
//!
//! ## Environment Variables
//!
//! - `LISTEN_FDS` — Number of inherited file descriptors (starting at fd 3)
//! - `LISTEN_FD_NAMES` — Colon-separated names for each inherited fd
//! - `MOLT_READY_FD` — Pipe fd on which a successor acknowledges readiness
//! - `MOLT_HAMMER_TIME_SECS` — Drain deadline in seconds (default: 60)
//!
//! ## Platform
//!
//! The reload/handoff path requires Unix (Linux / macOS). On other
//! platforms a reload signal is logged and ignored; interrupt/terminate
//! still drive a drained shutdown.
//!
//! ## Example
//!
//! ```no_run
//! use molt::{handler_fn, Connection};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), molt::ServeError> {
//!     let addr = "127.0.0.1:4242".parse().unwrap();
//!     molt::listen_and_serve(
//!         addr,
//!         handler_fn(|mut conn: Connection| async move {
//!             let mut buf = [0u8; 1024];
//!             while conn.read(&mut buf).await? > 0 {
//!                 conn.write_all(b"hello\n").await?;
//!             }
//!             Ok(())
//!         }),
//!     )
//!     .await
//! }
//! ```

mod conn;
mod error;
mod lifecycle;
mod listener;
mod restart;
mod server;
mod signal;
mod tls;

pub use conn::{ConnHandle, ConnState, Connection, TrackedStream};
pub use error::{AcceptError, HookError, RestartError, ServeError};
pub use lifecycle::LifecycleState;
pub use listener::{DrainOutcome, DrainingListener};
pub use server::{
    handler_fn, listen_and_serve, listen_and_serve_tls, Handler, HandlerFn, Server,
    ServerController,
};
pub use signal::{HookPhase, LifecycleSignal};
pub use tls::TlsSettings;
