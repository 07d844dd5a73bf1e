//! Handoff: passing the listening socket across a re-exec boundary.
//!
//! Spawning side: [`spawn_successor`] re-executes the current binary with
//! the same arguments, the listening socket remapped to fd 3, and a
//! readiness pipe remapped to fd 4, advertised through `LISTEN_FDS` /
//! `LISTEN_FD_NAMES` / `MOLT_READY_FD`. The caller's listener stays open
//! until the successor writes its readiness byte, so the port never has a
//! moment without an acceptor.
//!
//! Receiving side: [`inherited_listener`] checks the environment
//! (systemd-style `LISTEN_FDS` numbering, starting at fd 3) and adopts the
//! socket; [`notify_ready`] acknowledges on the pipe once the listener is
//! attached. Fails hard if the env says an fd exists but it is invalid —
//! a half-inherited state is a bug in the parent process.

use std::time::Duration;

pub(crate) const LISTEN_FDS_ENV: &str = "LISTEN_FDS";
pub(crate) const LISTEN_FD_NAMES_ENV: &str = "LISTEN_FD_NAMES";
pub(crate) const READY_FD_ENV: &str = "MOLT_READY_FD";

/// Name advertised in `LISTEN_FD_NAMES` for the single listener.
pub(crate) const LISTENER_NAME: &str = "main";

/// How long the old process waits for the successor's readiness byte
/// before declaring the handoff failed and killing the half-started child.
pub(crate) const SUCCESSOR_READY_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(unix)]
pub(crate) use imp::{inherited_listener, notify_ready, spawn_successor};

#[cfg(not(unix))]
pub(crate) use fallback::{inherited_listener, notify_ready};

#[cfg(unix)]
mod imp {
    use std::io;
    use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::os::unix::process::CommandExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use tokio::io::unix::AsyncFd;
    use tracing::{debug, info, warn};

    use super::{LISTENER_NAME, LISTEN_FDS_ENV, LISTEN_FD_NAMES_ENV, READY_FD_ENV};
    use crate::error::RestartError;

    /// Inherited descriptors start at 3, systemd socket-activation style.
    const INHERITED_FD: RawFd = 3;
    /// The readiness pipe's write end lands here in the successor.
    const INHERITED_READY_FD: RawFd = 4;

    /// Attach to a listener inherited from the parent process.
    ///
    /// Returns `None` when `LISTEN_FDS` is absent or `0` (cold start).
    /// Clears the env vars so this process's own successors do not
    /// re-inherit stale values.
    ///
    /// # Panics
    ///
    /// Panics if `LISTEN_FDS` is set but the fd is invalid or not a
    /// socket — crash loudly rather than serve with broken inheritance.
    pub(crate) fn inherited_listener() -> Option<std::net::TcpListener> {
        let listen_fds: usize = std::env::var(LISTEN_FDS_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        if listen_fds == 0 {
            return None;
        }
        assert_eq!(
            listen_fds, 1,
            "expected exactly one inherited listener, parent passed {listen_fds}",
        );

        let name =
            std::env::var(LISTEN_FD_NAMES_ENV).unwrap_or_else(|_| LISTENER_NAME.to_string());
        assert!(
            is_socket(INHERITED_FD),
            "inherited fd {INHERITED_FD} (name: {name}) is not a valid socket — parent process bug",
        );

        // SAFETY: fd 3 was validated as a socket and is owned by this
        // process from here on.
        let listener = unsafe { std::net::TcpListener::from_raw_fd(INHERITED_FD) };

        std::env::remove_var(LISTEN_FDS_ENV);
        std::env::remove_var(LISTEN_FD_NAMES_ENV);

        info!(
            fd = INHERITED_FD,
            name,
            addr = ?listener.local_addr().ok(),
            "attached to listener inherited from parent process"
        );
        Some(listener)
    }

    /// Acknowledge readiness to the parent, if this process is a
    /// successor. Must be called only once the inherited listener is
    /// attached and accepting is about to begin: the parent keeps its own
    /// listener open until this byte arrives.
    pub(crate) fn notify_ready() {
        let Ok(raw) = std::env::var(READY_FD_ENV) else {
            return;
        };
        std::env::remove_var(READY_FD_ENV);
        let Ok(fd) = raw.parse::<RawFd>() else {
            warn!(value = %raw, "ignoring malformed {READY_FD_ENV}");
            return;
        };

        let byte = [1u8];
        let n = unsafe { libc::write(fd, byte.as_ptr().cast(), 1) };
        if n != 1 {
            warn!(
                fd,
                error = %io::Error::last_os_error(),
                "failed to write readiness byte to parent"
            );
        } else {
            debug!(fd, "acknowledged readiness to parent process");
        }
        unsafe { libc::close(fd) };
    }

    /// Launch a successor process inheriting `listen_fd`, and wait for its
    /// readiness acknowledgement.
    ///
    /// `program` overrides the executable (defaults to the current one);
    /// arguments and standard streams are those of the current process.
    /// On any failure the caller keeps serving: nothing here touches the
    /// caller's listener.
    pub(crate) async fn spawn_successor(
        listen_fd: RawFd,
        program: Option<&Path>,
        ready_timeout: Duration,
    ) -> Result<u32, RestartError> {
        let (ready_rx, ready_tx) = ready_pipe().map_err(RestartError::Pipe)?;

        let program: PathBuf = match program {
            Some(p) => p.to_path_buf(),
            None => std::env::current_exe().map_err(RestartError::Spawn)?,
        };
        let args: Vec<std::ffi::OsString> = std::env::args_os().skip(1).collect();

        let mut cmd = std::process::Command::new(&program);
        cmd.args(&args)
            .env(LISTEN_FDS_ENV, "1")
            .env(LISTEN_FD_NAMES_ENV, LISTENER_NAME)
            .env(READY_FD_ENV, INHERITED_READY_FD.to_string());

        let ready_tx_fd = ready_tx.as_raw_fd();
        // SAFETY: only async-signal-safe calls (fcntl/dup2/close) run
        // between fork and exec.
        unsafe {
            cmd.pre_exec(move || remap_inherited_fds(listen_fd, ready_tx_fd));
        }

        let mut child = cmd.spawn().map_err(RestartError::Spawn)?;
        let pid = child.id();
        // The parent keeps only the read end; the successor's exit (or its
        // explicit ack) is then observable as a pipe event.
        drop(ready_tx);

        info!(pid, program = %program.display(), "successor spawned; waiting for readiness");
        match await_ready(ready_rx, ready_timeout).await {
            Ok(()) => {
                info!(pid, "successor acknowledged readiness");
                Ok(pid)
            }
            Err(e) => {
                // A half-started successor must not linger holding a copy
                // of the socket.
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }

    /// Place copies of the listening socket and the readiness pipe at the
    /// fds the successor expects. Both sources are first duplicated above
    /// the target range so neither dup2 can clobber the other's source;
    /// `F_DUPFD` and `dup2` both produce descriptors with close-on-exec
    /// clear, which is what makes them survive the exec.
    fn remap_inherited_fds(listen_fd: RawFd, ready_fd: RawFd) -> io::Result<()> {
        unsafe {
            let tmp_listen = check(libc::fcntl(listen_fd, libc::F_DUPFD, 16))?;
            let tmp_ready = check(libc::fcntl(ready_fd, libc::F_DUPFD, 16))?;
            check(libc::dup2(tmp_listen, INHERITED_FD))?;
            check(libc::dup2(tmp_ready, INHERITED_READY_FD))?;
            check(libc::close(tmp_listen))?;
            check(libc::close(tmp_ready))?;
        }
        Ok(())
    }

    fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret)
        }
    }

    /// (read end, write end), both close-on-exec; the successor receives
    /// an explicit dup of the write end instead.
    fn ready_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe() returned two fresh descriptors we now own.
        let (rx, tx) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_cloexec(rx.as_raw_fd())?;
        set_cloexec(tx.as_raw_fd())?;
        Ok((rx, tx))
    }

    fn set_cloexec(fd: RawFd) -> io::Result<()> {
        unsafe {
            let flags = check(libc::fcntl(fd, libc::F_GETFD))?;
            check(libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
        }
        Ok(())
    }

    fn set_nonblocking(fd: RawFd) -> io::Result<()> {
        unsafe {
            let flags = check(libc::fcntl(fd, libc::F_GETFL))?;
            check(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
        }
        Ok(())
    }

    /// Wait for one readiness byte on the pipe. EOF means the successor
    /// exited (or closed the pipe) without acknowledging.
    async fn await_ready(ready_rx: OwnedFd, timeout: Duration) -> Result<(), RestartError> {
        set_nonblocking(ready_rx.as_raw_fd()).map_err(RestartError::Handshake)?;
        let afd = AsyncFd::new(ready_rx).map_err(RestartError::Handshake)?;

        let read_one = async {
            loop {
                let mut guard = afd.readable().await.map_err(RestartError::Handshake)?;
                let mut buf = [0u8; 1];
                let res = guard.try_io(|inner| {
                    let n = unsafe {
                        libc::read(inner.get_ref().as_raw_fd(), buf.as_mut_ptr().cast(), 1)
                    };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                });
                match res {
                    Ok(Ok(0)) => return Err(RestartError::SuccessorExited),
                    Ok(Ok(_)) => return Ok(()),
                    Ok(Err(e)) => return Err(RestartError::Handshake(e)),
                    Err(_would_block) => continue,
                }
            }
        };

        match tokio::time::timeout(timeout, read_one).await {
            Ok(res) => res,
            Err(_) => Err(RestartError::ReadyTimeout(timeout)),
        }
    }

    /// Validate that a file descriptor is a socket using fstat.
    fn is_socket(fd: RawFd) -> bool {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            return false;
        }
        (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::io::Write;

        /// Cold start: no env vars → no inherited listener.
        #[test]
        fn test_cold_start_returns_none() {
            std::env::remove_var(LISTEN_FDS_ENV);
            std::env::remove_var(LISTEN_FD_NAMES_ENV);
            assert!(inherited_listener().is_none());
        }

        /// Socket validation: sockets pass, everything else fails.
        #[test]
        fn test_is_socket() {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            assert!(is_socket(listener.as_raw_fd()));
            assert!(!is_socket(9999));
            assert!(!is_socket(-1));
        }

        /// fd adoption round-trip: bind → dup → adopt at the dup'd fd.
        #[test]
        fn test_fd_adoption_round_trip() {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();

            let dup = unsafe { libc::dup(listener.as_raw_fd()) };
            assert!(dup >= 0, "dup failed");
            assert!(is_socket(dup));

            // SAFETY: dup is a fresh descriptor we own.
            let adopted = unsafe { std::net::TcpListener::from_raw_fd(dup) };
            assert_eq!(adopted.local_addr().unwrap(), addr);

            let conn = std::net::TcpStream::connect(addr);
            assert!(conn.is_ok());
        }

        /// The handshake resolves as soon as the byte lands.
        #[tokio::test]
        async fn test_await_ready_ack() {
            let (rx, tx) = ready_pipe().unwrap();
            let mut tx_file = std::fs::File::from(tx);
            tx_file.write_all(&[1]).unwrap();

            await_ready(rx, Duration::from_secs(1)).await.unwrap();
        }

        /// A closed pipe without an ack means the successor died.
        #[tokio::test]
        async fn test_await_ready_eof_is_successor_exit() {
            let (rx, tx) = ready_pipe().unwrap();
            drop(tx);

            let err = await_ready(rx, Duration::from_secs(1)).await.unwrap_err();
            assert!(matches!(err, RestartError::SuccessorExited));
        }

        /// No ack and no EOF within the deadline times out.
        #[tokio::test]
        async fn test_await_ready_timeout() {
            let (rx, _tx) = ready_pipe().unwrap();
            let err = await_ready(rx, Duration::from_millis(50)).await.unwrap_err();
            assert!(matches!(err, RestartError::ReadyTimeout(_)));
        }

        /// Spawning a nonexistent program fails cleanly.
        #[tokio::test]
        async fn test_spawn_nonexistent_program() {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let err = spawn_successor(
                listener.as_raw_fd(),
                Some(std::path::Path::new("/nonexistent/molt-successor")),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, RestartError::Spawn(_)));
        }
    }
}

#[cfg(not(unix))]
mod fallback {
    /// No fd-inheritance primitive on this platform; every start is cold.
    pub(crate) fn inherited_listener() -> Option<std::net::TcpListener> {
        None
    }

    pub(crate) fn notify_ready() {}
}
