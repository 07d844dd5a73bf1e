//! The server aggregate: lifecycle sequencing, signal handling, and the
//! accept loop.
//!
//! One `Server` per process. `serve` blocks until the lifecycle reaches
//! `Terminate`; a clean shutdown (drained, naturally or hammered) returns
//! `Ok(())`. Only startup failures — bind, certificate load — surface as
//! errors.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::conn::{Connection, TrackedStream};
use crate::error::{AcceptError, HookError, RestartError, ServeError};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::listener::DrainingListener;
use crate::restart;
use crate::signal::{self, HookPhase, LifecycleSignal, SignalHooks};
use crate::tls::TlsSettings;

/// Default drain deadline ("hammer time"), overridable per server or via
/// `MOLT_HAMMER_TIME_SECS`.
pub const DEFAULT_HAMMER_TIME: Duration = Duration::from_secs(60);

const HAMMER_TIME_ENV: &str = "MOLT_HAMMER_TIME_SECS";

/// The user-supplied request handler: serves one connection for its whole
/// lifetime. The core is agnostic to the protocol; implementations that
/// keep connections alive between requests should report
/// [`Connection::set_idle`] / [`Connection::set_active`] so drain
/// accounting reflects reality.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, conn: Connection) -> std::io::Result<()>;
}

/// Adapt an async closure into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::io::Result<()>> + Send + 'static,
{
    HandlerFn(f)
}

/// See [`handler_fn`].
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::io::Result<()>> + Send + 'static,
{
    async fn handle(&self, conn: Connection) -> std::io::Result<()> {
        (self.0)(conn).await
    }
}

/// Administrative handle to a running server. Signals sent here travel
/// the same serialized channel as OS signals, including hook dispatch.
#[derive(Clone)]
pub struct ServerController {
    tx: mpsc::Sender<LifecycleSignal>,
}

impl ServerController {
    /// Deliver a lifecycle signal as if it came from the OS.
    pub async fn signal(&self, sig: LifecycleSignal) {
        // An error just means the server already terminated.
        let _ = self.tx.send(sig).await;
    }

    /// Request a graceful restart (handoff, then drain).
    pub async fn reload(&self) {
        self.signal(LifecycleSignal::Reload).await;
    }

    /// Request a graceful shutdown (drain, then terminate).
    pub async fn shutdown(&self) {
        self.signal(LifecycleSignal::Terminate).await;
    }
}

/// A drain-aware server bound to one address.
pub struct Server {
    addr: SocketAddr,
    tls: Option<TlsSettings>,
    hammer_time: Duration,
    hooks: Arc<SignalHooks>,
    lifecycle: Lifecycle,
    before_serve: Option<Box<dyn FnOnce(SocketAddr) + Send + Sync>>,
    prebound: Option<std::net::TcpListener>,
    successor_program: Option<PathBuf>,
    sig_tx: mpsc::Sender<LifecycleSignal>,
    sig_rx: Option<mpsc::Receiver<LifecycleSignal>>,
}

impl Server {
    pub fn new(addr: SocketAddr) -> Self {
        let hammer_time = std::env::var(HAMMER_TIME_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_HAMMER_TIME);
        let (sig_tx, sig_rx) = mpsc::channel(16);
        Self {
            addr,
            tls: None,
            hammer_time,
            hooks: Arc::new(SignalHooks::default()),
            lifecycle: Lifecycle::new(),
            before_serve: None,
            prebound: None,
            successor_program: None,
            sig_tx,
            sig_rx: Some(sig_rx),
        }
    }

    /// Maximum time to wait for in-flight connections during drain before
    /// force-closing them.
    pub fn hammer_time(mut self, deadline: Duration) -> Self {
        self.hammer_time = deadline;
        self
    }

    /// Serve TLS on the bound socket.
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Use an already-bound listening socket instead of binding `addr`.
    pub fn with_listener(mut self, listener: std::net::TcpListener) -> Self {
        self.prebound = Some(listener);
        self
    }

    /// Callback invoked synchronously after the listener is open and
    /// before the accept loop starts. Must not block for long: it delays
    /// the transition to `Running`.
    pub fn before_serve(mut self, f: impl FnOnce(SocketAddr) + Send + Sync + 'static) -> Self {
        self.before_serve = Some(Box::new(f));
        self
    }

    /// Override the executable spawned on reload. Defaults to the current
    /// binary; pointing this at a newly installed binary upgrades in
    /// place.
    pub fn successor_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.successor_program = Some(program.into());
        self
    }

    /// Register a pre- or post-dispatch hook for a lifecycle signal.
    /// Permitted only before serving begins.
    pub fn register_hook<F>(
        &self,
        phase: HookPhase,
        signal: LifecycleSignal,
        id: impl Into<String>,
        hook: F,
    ) -> Result<(), HookError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.lifecycle.state() != LifecycleState::Initializing {
            return Err(HookError::RegistrationClosed);
        }
        self.hooks.register(phase, signal, id, Box::new(hook))
    }

    /// Administrative handle; usable from any task, before or during
    /// `serve`.
    pub fn controller(&self) -> ServerController {
        ServerController {
            tx: self.sig_tx.clone(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    /// Serve until the lifecycle reaches `Terminate`.
    pub async fn serve<H: Handler>(mut self, handler: H) -> Result<(), ServeError> {
        let handler = Arc::new(handler);
        let tls_acceptor = match &self.tls {
            Some(settings) => Some(TlsAcceptor::from(settings.load()?)),
            None => None,
        };

        let listener = Arc::new(self.open_listener().await?);
        let local_addr = listener.local_addr();

        if let Some(before) = self.before_serve.take() {
            before(local_addr);
        }

        // If this process is a successor, the parent is waiting on this
        // ack before it stops accepting; the listener is attached, so the
        // port now has two holders and at least one acceptor throughout.
        restart::notify_ready();

        self.hooks.seal();
        signal::spawn_os_listener(self.sig_tx.clone());
        let mut sig_rx = self.sig_rx.take().expect("serve called twice");

        self.lifecycle.advance(LifecycleState::Running);
        info!(addr = %local_addr, pid = std::process::id(), tls = self.tls.is_some(), "serving");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection accepted");
                        spawn_connection(stream, peer, handler.clone(), tls_acceptor.clone());
                    }
                    Err(AcceptError::ListenerClosed) => break,
                    Err(AcceptError::Io(e)) => {
                        warn!(error = %e, "accept failed");
                    }
                },
                sig = sig_rx.recv() => {
                    let Some(sig) = sig else { break };
                    if self.handle_signal(sig, &listener).await {
                        break;
                    }
                }
            }
        }

        if self.lifecycle.state() == LifecycleState::Running {
            listener.close();
            self.lifecycle.advance(LifecycleState::ShuttingDown);
        }

        info!(
            active = listener.active_count(),
            hammer_time = ?self.hammer_time,
            "draining connections"
        );
        // Signals keep arriving while draining; their hooks still run,
        // but shutdown is already in progress so nothing transitions.
        let drain = listener.drain(self.hammer_time);
        tokio::pin!(drain);
        loop {
            tokio::select! {
                _ = &mut drain => break,
                sig = sig_rx.recv() => {
                    // self holds a sender, so the channel cannot close here.
                    if let Some(sig) = sig {
                        self.drain_signal(sig);
                    }
                }
            }
        }
        self.lifecycle.advance(LifecycleState::Terminate);
        info!("drain complete; terminating");
        Ok(())
    }

    /// Dispatch a signal delivered while the drain is in progress: hooks
    /// fire on every delivery, but there is no further transition and no
    /// successor is spawned.
    fn drain_signal(&self, sig: LifecycleSignal) {
        if !sig.is_hookable() {
            debug!(?sig, "ignoring unrecognized lifecycle signal");
            return;
        }
        debug!(?sig, "signal received during drain; running hooks only");
        self.hooks.run(HookPhase::Pre, sig);
        self.hooks.run(HookPhase::Post, sig);
    }

    async fn open_listener(&mut self) -> Result<DrainingListener, ServeError> {
        let bind_err = |source| ServeError::Bind {
            addr: self.addr,
            source,
        };
        if let Some(prebound) = self.prebound.take() {
            return DrainingListener::from_std(prebound).map_err(bind_err);
        }
        if let Some(inherited) = restart::inherited_listener() {
            return DrainingListener::from_std(inherited).map_err(bind_err);
        }
        DrainingListener::bind(self.addr).await.map_err(bind_err)
    }

    /// Process one lifecycle signal: pre-hooks, built-in transition,
    /// post-hooks. Returns true when shutdown should begin.
    async fn handle_signal(&self, sig: LifecycleSignal, listener: &DrainingListener) -> bool {
        if !sig.is_hookable() {
            debug!(?sig, "ignoring unrecognized lifecycle signal");
            return false;
        }

        self.hooks.run(HookPhase::Pre, sig);
        let shutdown = match sig {
            LifecycleSignal::Reload => match self.spawn_successor(listener).await {
                Ok(pid) => {
                    info!(successor_pid = pid, "handoff complete; closing listener");
                    listener.close();
                    self.lifecycle.advance(LifecycleState::ShuttingDown);
                    true
                }
                Err(e) => {
                    // No transition: the old process keeps serving and no
                    // connection is endangered by the failed handoff.
                    error!(error = %e, "graceful restart failed; continuing to serve");
                    false
                }
            },
            LifecycleSignal::Interrupt | LifecycleSignal::Terminate => {
                listener.close();
                self.lifecycle.advance(LifecycleState::ShuttingDown);
                true
            }
            LifecycleSignal::Unknown => unreachable!("unknown signals are filtered above"),
        };
        self.hooks.run(HookPhase::Post, sig);
        shutdown
    }

    #[cfg(unix)]
    async fn spawn_successor(&self, listener: &DrainingListener) -> Result<u32, RestartError> {
        let fd = listener.raw_fd().ok_or_else(|| {
            RestartError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "listening socket already closed",
            ))
        })?;
        restart::spawn_successor(
            fd,
            self.successor_program.as_deref(),
            restart::SUCCESSOR_READY_TIMEOUT,
        )
        .await
    }

    #[cfg(not(unix))]
    async fn spawn_successor(&self, _listener: &DrainingListener) -> Result<u32, RestartError> {
        Err(RestartError::Unsupported)
    }
}

fn spawn_connection<H: Handler>(
    stream: TrackedStream<TcpStream>,
    peer: SocketAddr,
    handler: Arc<H>,
    tls_acceptor: Option<TlsAcceptor>,
) {
    tokio::spawn(async move {
        let conn = match tls_acceptor {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => Connection::tls(tls_stream, peer),
                Err(e) => {
                    // Dropping the tracked stream inside the failed
                    // handshake already closed it for drain accounting.
                    debug!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
            },
            None => Connection::plain(stream, peer),
        };
        if let Err(e) = handler.handle(conn).await {
            debug!(%peer, error = %e, "connection handler returned error");
        }
    });
}

/// Listen on `addr` and serve plain TCP connections with `handler`,
/// blocking until a drained shutdown. Subscribes to the process signal
/// set; `SIGHUP` triggers a zero-downtime restart.
pub async fn listen_and_serve<H: Handler>(addr: SocketAddr, handler: H) -> Result<(), ServeError> {
    Server::new(addr).serve(handler).await
}

/// Like [`listen_and_serve`], with TLS. `cert` and `key` are PEM paths;
/// loading failures abort before serving begins.
pub async fn listen_and_serve_tls<H: Handler>(
    addr: SocketAddr,
    cert: impl Into<PathBuf>,
    key: impl Into<PathBuf>,
    handler: H,
) -> Result<(), ServeError> {
    Server::new(addr)
        .with_tls(TlsSettings::new(cert, key))
        .serve(handler)
        .await
}
