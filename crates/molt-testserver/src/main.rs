//! A minimal line-based server for exercising molt by hand and from the
//! handoff integration tests.
//!
//! Prints machine-readable lines on stdout (`PID <pid>`,
//! `LISTENING <addr>`, `TERMINATED <pid>`); every received chunk is
//! answered with `pong <pid>\n`. Send `SIGHUP` for a zero-downtime
//! restart, `SIGINT`/`SIGTERM` for a drained shutdown.

use std::net::SocketAddr;

use anyhow::Result;
use molt::{handler_fn, Connection, HookPhase, LifecycleSignal, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout is reserved for the tagged lines the
    // tests parse.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let addr: SocketAddr = std::env::var("MOLT_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:4242".to_string())
        .parse()?;

    println!("PID {}", std::process::id());

    let server = Server::new(addr).before_serve(|addr| println!("LISTENING {addr}"));
    server.register_hook(HookPhase::Pre, LifecycleSignal::Reload, "log-reload", || {
        info!("reload requested");
    })?;

    server.serve(handler_fn(pong)).await?;

    // The reader of our stdout pipe may be gone by the time a drained
    // process gets here; a closed pipe must not turn a clean exit into
    // an EPIPE panic.
    use std::io::Write;
    writeln!(std::io::stdout(), "TERMINATED {}", std::process::id()).ok();
    Ok(())
}

async fn pong(mut conn: Connection) -> std::io::Result<()> {
    let reply = format!("pong {}\n", std::process::id());
    let mut buf = [0u8; 256];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        conn.write_all(reply.as_bytes()).await?;
        conn.set_idle();
    }
}
