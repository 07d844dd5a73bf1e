//! Cross-process handoff scenario: a real testserver process, real OS
//! signals, and a real fd inheritance across re-exec.

#![cfg(unix)]

use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdout, Command};

const BIN: &str = env!("CARGO_BIN_EXE_molt-testserver");

fn spawn_testserver() -> (Child, Lines<BufReader<ChildStdout>>) {
    let mut child = Command::new(BIN)
        .env("MOLT_ADDR", "127.0.0.1:0")
        .env("MOLT_HAMMER_TIME_SECS", "20")
        .env("RUST_LOG", "info")
        .stdout(Stdio::piped())
        .spawn()
        .expect("failed to spawn testserver");
    let stdout = child.stdout.take().expect("stdout piped");
    (child, BufReader::new(stdout).lines())
}

/// Next stdout line starting with `tag`, with the tag stripped. The
/// successor shares the pipe, so tagged lines from both processes arrive
/// here.
async fn next_tagged(lines: &mut Lines<BufReader<ChildStdout>>, tag: &str) -> String {
    loop {
        let line = tokio::time::timeout(Duration::from_secs(10), lines.next_line())
            .await
            .expect("timed out waiting for server output")
            .expect("failed reading server stdout")
            .expect("server stdout closed early");
        if let Some(rest) = line.strip_prefix(tag) {
            return rest.trim().to_string();
        }
    }
}

async fn ping(stream: &mut TcpStream) -> String {
    stream.write_all(b"ping\n").await.unwrap();
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf[..n]).trim().to_string()
}

fn kill(pid: i32, sig: libc::c_int) {
    assert_eq!(unsafe { libc::kill(pid, sig) }, 0, "kill({pid}) failed");
}

/// SIGHUP spawns a successor on the same port; the original three
/// connections drain on the old process while the successor accepts new
/// ones, and the old process exits only after all three close.
#[tokio::test]
async fn test_sighup_handoff_zero_downtime() {
    let (mut child, mut lines) = spawn_testserver();

    let pid1: i32 = next_tagged(&mut lines, "PID ").await.parse().unwrap();
    let addr: SocketAddr = next_tagged(&mut lines, "LISTENING ").await.parse().unwrap();

    let mut c1 = TcpStream::connect(addr).await.unwrap();
    let mut c2 = TcpStream::connect(addr).await.unwrap();
    let mut c3 = TcpStream::connect(addr).await.unwrap();
    assert_eq!(ping(&mut c1).await, format!("pong {pid1}"));
    assert_eq!(ping(&mut c2).await, format!("pong {pid1}"));
    assert_eq!(ping(&mut c3).await, format!("pong {pid1}"));

    kill(pid1, libc::SIGHUP);

    let pid2: i32 = next_tagged(&mut lines, "PID ").await.parse().unwrap();
    let addr2: SocketAddr = next_tagged(&mut lines, "LISTENING ").await.parse().unwrap();
    assert_ne!(pid2, pid1);
    assert_eq!(addr2, addr, "successor must listen on the inherited socket");

    // A fourth connection lands on the successor while the original three
    // are still draining on the old process.
    let mut c4 = TcpStream::connect(addr).await.unwrap();
    assert_eq!(ping(&mut c4).await, format!("pong {pid2}"));

    // The draining process still serves its established connections.
    assert_eq!(ping(&mut c1).await, format!("pong {pid1}"));
    assert_eq!(ping(&mut c2).await, format!("pong {pid1}"));

    // Only after the last of the three closes may the old process exit.
    drop(c1);
    drop(c2);
    drop(c3);

    let terminated: i32 = next_tagged(&mut lines, "TERMINATED ").await.parse().unwrap();
    assert_eq!(terminated, pid1);
    let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("old process did not exit after drain")
        .unwrap();
    assert!(status.success(), "old process exited with {status}");

    // The successor keeps serving; shut it down (it reparented when the
    // old process exited, so it is not our child to wait on).
    assert_eq!(ping(&mut c4).await, format!("pong {pid2}"));
    drop(c4);
    kill(pid2, libc::SIGTERM);
}

/// SIGTERM drains and exits cleanly without spawning anything.
#[tokio::test]
async fn test_sigterm_drains_and_exits() {
    let (mut child, mut lines) = spawn_testserver();

    let pid: i32 = next_tagged(&mut lines, "PID ").await.parse().unwrap();
    let addr: SocketAddr = next_tagged(&mut lines, "LISTENING ").await.parse().unwrap();

    let mut conn = TcpStream::connect(addr).await.unwrap();
    assert_eq!(ping(&mut conn).await, format!("pong {pid}"));

    kill(pid, libc::SIGTERM);

    // Established connection keeps working during the drain.
    assert_eq!(ping(&mut conn).await, format!("pong {pid}"));
    drop(conn);

    let terminated: i32 = next_tagged(&mut lines, "TERMINATED ").await.parse().unwrap();
    assert_eq!(terminated, pid);
    let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("process did not exit after drain")
        .unwrap();
    assert!(status.success());
}
