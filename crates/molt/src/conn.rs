//! Tracked connections.
//!
//! Every accepted connection is wrapped in a [`TrackedStream`] so that its
//! closure is observable by the owning listener for drain accounting. A
//! connection moves `New → Active ⇄ Idle → Closed`; only the transition to
//! `Closed` decrements the listener's live count, and only once, no matter
//! which path closes the connection (normal close, drop, I/O error, or a
//! force-close at the drain deadline).

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::listener::DrainCounter;

/// Per-connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Accepted, nothing read yet.
    New = 0,
    /// A request is in flight.
    Active = 1,
    /// Kept alive between requests.
    Idle = 2,
    /// Terminal.
    Closed = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::New,
            1 => ConnState::Active,
            2 => ConnState::Idle,
            _ => ConnState::Closed,
        }
    }
}

/// State shared between a [`TrackedStream`], its [`ConnHandle`]s and the
/// owning listener.
pub(crate) struct ConnShared {
    state: AtomicU8,
    counter: Arc<DrainCounter>,
    cancel: CancellationToken,
}

impl ConnShared {
    /// Registers a new live connection with `counter`.
    pub(crate) fn new(counter: Arc<DrainCounter>) -> Arc<Self> {
        counter.increment();
        Arc::new(Self {
            state: AtomicU8::new(ConnState::New as u8),
            counter,
            cancel: CancellationToken::new(),
        })
    }

    pub(crate) fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transition to `Closed` and decrement the live count. The swap makes
    /// this a one-shot: every path that closes a connection funnels through
    /// here, and the counter moves exactly once.
    pub(crate) fn finish(&self) {
        let prev = self.state.swap(ConnState::Closed as u8, Ordering::AcqRel);
        if prev != ConnState::Closed as u8 {
            self.counter.decrement();
        }
    }

    /// Abrupt closure: pending and future I/O through the wrapper fails
    /// with `ConnectionAborted`. Used when the drain deadline fires.
    pub(crate) fn force_close(&self) {
        self.cancel.cancel();
        self.finish();
    }

    fn mark_read(&self) {
        // New → Active on first read, Idle → Active on the next request.
        let _ = self.state.compare_exchange(
            ConnState::New as u8,
            ConnState::Active as u8,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        let _ = self.state.compare_exchange(
            ConnState::Idle as u8,
            ConnState::Active as u8,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    fn set_idle(&self) {
        let _ = self.state.compare_exchange(
            ConnState::Active as u8,
            ConnState::Idle as u8,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    fn set_active(&self) {
        self.mark_read();
    }
}

/// Cloneable handle to a tracked connection's state, independent of the
/// stream itself. Handlers use it to report idle/active transitions for
/// keep-alive accounting.
#[derive(Clone)]
pub struct ConnHandle {
    shared: Arc<ConnShared>,
}

impl ConnHandle {
    pub fn state(&self) -> ConnState {
        self.shared.state()
    }

    /// Mark the connection idle (response complete, kept alive).
    pub fn set_idle(&self) {
        self.shared.set_idle();
    }

    /// Mark the connection active (request in flight).
    pub fn set_active(&self) {
        self.shared.set_active();
    }

    /// Close the connection abruptly. Outstanding I/O through the tracked
    /// stream fails with `ConnectionAborted`.
    pub fn close(&self) {
        self.shared.force_close();
    }
}

/// An accepted stream whose closure is reported to the owning listener.
///
/// Implements `AsyncRead`/`AsyncWrite` by delegation; the first successful
/// read marks the connection active. Dropping the stream counts as closing
/// it.
pub struct TrackedStream<S = TcpStream> {
    inner: S,
    shared: Arc<ConnShared>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<S> TrackedStream<S> {
    pub(crate) fn new(inner: S, shared: Arc<ConnShared>) -> Self {
        let cancelled = Box::pin(shared.cancel.clone().cancelled_owned());
        Self {
            inner,
            shared,
            cancelled,
        }
    }

    pub fn state(&self) -> ConnState {
        self.shared.state()
    }

    pub fn handle(&self) -> ConnHandle {
        ConnHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn aborted() -> io::Error {
        io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "connection force-closed during drain",
        )
    }

    /// Ready when the connection has been force-closed.
    fn poll_cancelled(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.shared.state() == ConnState::Closed {
            return Poll::Ready(());
        }
        self.cancelled.as_mut().poll(cx)
    }
}

impl<S> Drop for TrackedStream<S> {
    fn drop(&mut self) {
        self.shared.finish();
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_cancelled(cx).is_ready() {
            this.shared.finish();
            return Poll::Ready(Err(Self::aborted()));
        }
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    this.shared.mark_read();
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_cancelled(cx).is_ready() {
            this.shared.finish();
            return Poll::Ready(Err(Self::aborted()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.shared.state() == ConnState::Closed {
            return Poll::Ready(Err(Self::aborted()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_shutdown(cx) {
            Poll::Ready(Ok(())) => {
                // Graceful close path.
                this.shared.finish();
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// A connection as handed to the user-supplied [`Handler`](crate::Handler):
/// the tracked stream (plain TCP or TLS-wrapped) plus the peer address and
/// a [`ConnHandle`] for keep-alive accounting.
pub struct Connection {
    stream: ConnStream,
    handle: ConnHandle,
    peer_addr: SocketAddr,
}

enum ConnStream {
    Plain(TrackedStream<TcpStream>),
    Tls(Box<TlsStream<TrackedStream<TcpStream>>>),
}

impl Connection {
    pub(crate) fn plain(stream: TrackedStream<TcpStream>, peer_addr: SocketAddr) -> Self {
        let handle = stream.handle();
        Self {
            stream: ConnStream::Plain(stream),
            handle,
            peer_addr,
        }
    }

    pub(crate) fn tls(stream: TlsStream<TrackedStream<TcpStream>>, peer_addr: SocketAddr) -> Self {
        // Drain accounting lives on the inner TCP stream, so the raw
        // connection lifecycle is tracked regardless of the TLS layering.
        let handle = stream.get_ref().0.handle();
        Self {
            stream: ConnStream::Tls(Box::new(stream)),
            handle,
            peer_addr,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream, ConnStream::Tls(_))
    }

    pub fn state(&self) -> ConnState {
        self.handle.state()
    }

    /// Mark the connection idle between requests. See [`ConnHandle::set_idle`].
    pub fn set_idle(&self) {
        self.handle.set_idle();
    }

    /// Mark the connection active. See [`ConnHandle::set_active`].
    pub fn set_active(&self) {
        self.handle.set_active();
    }

    /// A handle usable after the connection has been split or moved.
    pub fn handle(&self) -> ConnHandle {
        self.handle.clone()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            ConnStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().stream {
            ConnStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            ConnStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            ConnStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
