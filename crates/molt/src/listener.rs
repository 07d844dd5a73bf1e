//! The draining listener.
//!
//! Wraps one bound TCP socket. Every accepted connection is registered for
//! drain accounting; `close()` stops new accepts while leaving existing
//! connections alive; `drain()` waits (bounded) for the live count to reach
//! zero and force-closes whatever remains at the deadline.

use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::Poll;
use std::time::Duration;
use std::{future, io};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::conn::{ConnShared, ConnState, TrackedStream};
use crate::error::AcceptError;

/// Tracked-connection registry entries are pruned once the backlog of dead
/// weak references grows past this.
const PRUNE_THRESHOLD: usize = 64;

/// Live-connection count shared between a listener and its connections.
///
/// The count is the number of tracked connections in any non-`Closed`
/// state. A decrement below zero means a connection was closed twice;
/// that corrupts drain accounting, so it panics rather than continuing.
pub(crate) struct DrainCounter {
    live: AtomicUsize,
    drained: Notify,
}

impl DrainCounter {
    pub(crate) fn new() -> Self {
        Self {
            live: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn increment(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement(&self) {
        let prev = self.live.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("live-connection counter underflow: a tracked connection was closed twice");
        }
        if prev == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Resolves once the live count reaches zero. Not a busy poll: wakes
    /// only on decrements.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.drained.notified();
            if self.live() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// How a drain completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every connection closed naturally before the deadline.
    Drained,
    /// The deadline fired; this many connections were force-closed.
    Hammered(usize),
}

/// A listening socket with drain accounting.
pub struct DrainingListener {
    socket: Mutex<Option<TcpListener>>,
    addr: SocketAddr,
    closed: AtomicBool,
    close_token: CancellationToken,
    counter: Arc<DrainCounter>,
    conns: Mutex<Vec<Weak<ConnShared>>>,
}

impl DrainingListener {
    /// Bind a new listening socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::from_tokio(listener)
    }

    /// Wrap an already-bound socket (pre-bound override, or one inherited
    /// from a parent process during handoff).
    pub fn from_std(listener: std::net::TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Self::from_tokio(TcpListener::from_std(listener)?)
    }

    fn from_tokio(listener: TcpListener) -> io::Result<Self> {
        let addr = listener.local_addr()?;
        Ok(Self {
            socket: Mutex::new(Some(listener)),
            addr,
            closed: AtomicBool::new(false),
            close_token: CancellationToken::new(),
            counter: Arc::new(DrainCounter::new()),
            conns: Mutex::new(Vec::new()),
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of tracked connections not yet closed.
    pub fn active_count(&self) -> usize {
        self.counter.live()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Accept the next connection, wrapped for drain accounting.
    ///
    /// Fails with [`AcceptError::ListenerClosed`] once [`close`](Self::close)
    /// has been called; transient accept errors are returned as
    /// [`AcceptError::Io`] and the listener remains usable.
    pub async fn accept(&self) -> Result<(TrackedStream<TcpStream>, SocketAddr), AcceptError> {
        let accept = future::poll_fn(|cx| {
            let guard = self.socket.lock().expect("listener mutex poisoned");
            match guard.as_ref() {
                None => Poll::Ready(Err(AcceptError::ListenerClosed)),
                Some(listener) => match listener.poll_accept(cx) {
                    Poll::Ready(Ok(pair)) => Poll::Ready(Ok(pair)),
                    Poll::Ready(Err(e)) => Poll::Ready(Err(AcceptError::Io(e))),
                    Poll::Pending => Poll::Pending,
                },
            }
        });

        let (stream, peer) = tokio::select! {
            biased;
            _ = self.close_token.cancelled() => return Err(AcceptError::ListenerClosed),
            res = accept => res?,
        };

        let shared = ConnShared::new(self.counter.clone());
        self.track(&shared);
        Ok((TrackedStream::new(stream, shared), peer))
    }

    fn track(&self, shared: &Arc<ConnShared>) {
        let mut conns = self.conns.lock().expect("connection registry poisoned");
        if conns.len() >= PRUNE_THRESHOLD {
            conns.retain(|weak| weak.strong_count() > 0);
        }
        conns.push(Arc::downgrade(shared));
    }

    /// Stop accepting and close the OS socket so the kernel stops queuing
    /// new connections. Existing tracked connections are untouched.
    /// Idempotent: repeated calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_token.cancel();
        let socket = self.socket.lock().expect("listener mutex poisoned").take();
        drop(socket);
        info!(addr = %self.addr, "listener closed for new accepts");
    }

    /// Wait for every tracked connection to close, up to `hammer_time`.
    /// Connections still open at the deadline are force-closed regardless
    /// of state; their handling tasks observe `ConnectionAborted`.
    pub async fn drain(&self, hammer_time: Duration) -> DrainOutcome {
        if tokio::time::timeout(hammer_time, self.counter.wait_idle())
            .await
            .is_ok()
        {
            return DrainOutcome::Drained;
        }
        let hammered = self.hammer();
        warn!(
            hammered,
            deadline = ?hammer_time,
            "drain deadline exceeded; remaining connections force-closed"
        );
        DrainOutcome::Hammered(hammered)
    }

    fn hammer(&self) -> usize {
        let conns = mem::take(&mut *self.conns.lock().expect("connection registry poisoned"));
        let mut forced = 0;
        for weak in conns {
            if let Some(shared) = weak.upgrade() {
                if shared.state() != ConnState::Closed {
                    shared.force_close();
                    forced += 1;
                }
            }
        }
        debug_assert_eq!(self.counter.live(), 0);
        forced
    }

    /// Raw descriptor of the listening socket, for handoff. `None` once
    /// closed.
    #[cfg(unix)]
    pub(crate) fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;
        self.socket
            .lock()
            .expect("listener mutex poisoned")
            .as_ref()
            .map(|l| l.as_raw_fd())
    }
}
