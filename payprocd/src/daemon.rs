//! The accept loop and process lifecycle: binds the
//! local socket (removing a stale one after probing its owner with
//! `PING`), spawns one task per connection, runs periodic housekeeping, and
//! reacts to `SIGTERM`/`SIGINT`/`SIGHUP`/`SIGUSR1`/`SIGUSR2`.

use std::io::Write as _;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::Arc;
use std::time::Duration;

use payproc_api_core::error::PayprocError;
use payproc_api_core::kv::KvList;
use payproc_tokio::{NotifyOnce, PpTask};
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, info_span, warn, Instrument};

use crate::commands::{self, Outcome};
use crate::context::Context;
use crate::protocol;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);
const CURRENCY_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Binds `socket_path`, removing a stale file left behind by a crashed
/// previous instance -- but only after confirming nothing answers `PING`
/// on it ("stale socket files are removed by the daemon after
/// probing the existing owner with `PING`").
fn bind_listener(socket_path: &str) -> anyhow::Result<UnixListener> {
    if std::path::Path::new(socket_path).exists() {
        if probe_is_alive(socket_path) {
            anyhow::bail!("a payprocd instance is already listening on {socket_path}");
        }
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = std::path::Path::new(socket_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(UnixListener::bind(socket_path)?)
}

fn probe_is_alive(socket_path: &str) -> bool {
    let Ok(mut stream) = StdUnixStream::connect(socket_path) else {
        return false;
    };
    if stream.write_all(b"PING\n\n").is_err() {
        return false;
    }
    let mut response = [0u8; 2];
    std::io::Read::read(&mut stream, &mut response).map(|n| n > 0).unwrap_or(false)
}

/// Runs the daemon until a shutdown signal is observed. `SIGTERM` requests
/// a graceful drain; `SIGINT` exits immediately; `SIGHUP`/`SIGUSR1`/
/// `SIGUSR2` are logged and otherwise ignored. `SIGPIPE` needs no handler
/// here -- Rust installs `SIG_IGN` for it by default, so writes to a
/// closed socket surface as an ordinary `EPIPE` `io::Error` rather than
/// killing the process; this is not a gap to "fix".
pub async fn run(ctx: Arc<Context>, socket_path: &str) -> anyhow::Result<()> {
    let listener = bind_listener(socket_path)?;
    info!(socket_path, "payprocd listening");

    let shutdown = ctx.shutdown.clone();
    let accept_task = PpTask::spawn("accept-loop", accept_loop(ctx.clone(), listener, shutdown.clone()));
    let housekeeping_task = PpTask::spawn("housekeeping", housekeeping_loop(ctx.clone(), shutdown.clone()));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;
    let mut sigterm_count = 0u32;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                sigterm_count += 1;
                info!(count = sigterm_count, "received SIGTERM");
                ctx.shutdown.send();
                if sigterm_count >= 3 {
                    warn!("third SIGTERM received, forcing immediate exit");
                    std::process::exit(0);
                }
            }
            _ = sigint.recv() => {
                info!("received SIGINT, exiting immediately");
                std::process::exit(0);
            }
            _ = sighup.recv() => info!("received SIGHUP (no-op)"),
            _ = sigusr1.recv() => info!("received SIGUSR1 (no-op)"),
            _ = sigusr2.recv() => info!("received SIGUSR2 (no-op)"),
            () = ctx.shutdown.clone().recv_owned() => break,
        }
    }

    let _ = std::fs::remove_file(socket_path);
    payproc_tokio::task::join_and_shutdown("daemon", vec![accept_task, housekeeping_task], ctx.shutdown.clone(), SHUTDOWN_DRAIN_TIMEOUT).await;
    Ok(())
}

async fn accept_loop(ctx: Arc<Context>, listener: UnixListener, mut shutdown: NotifyOnce) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.recv() => {
                info!("accept loop stopping");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let ctx = ctx.clone();
                        let conn_shutdown = shutdown.clone();
                        PpTask::spawn("connection", handle_connection(ctx, stream, conn_shutdown)).detach();
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

/// One accepted connection: obtains peer credentials (rejecting the
/// connection if they cannot be read), then serves requests
/// until the peer disconnects, a framing error ends the connection, or
/// shutdown is observed.
async fn handle_connection(ctx: Arc<Context>, stream: UnixStream, mut shutdown: NotifyOnce) {
    let uid = match stream.peer_cred() {
        Ok(cred) => cred.uid(),
        Err(e) => {
            warn!(error = %e, "rejecting connection: could not obtain peer credentials");
            return;
        }
    };
    let pid = stream.peer_cred().ok().and_then(|c| c.pid());
    let span = info_span!("connection", uid, pid);

    async move {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = tokio::io::BufReader::new(read_half);

        loop {
            let request = tokio::select! {
                biased;
                () = shutdown.recv() => {
                    info!("connection closing for shutdown");
                    return;
                }
                parsed = protocol::parse_request(&mut reader) => parsed,
            };

            let req = match request {
                Ok(Some(req)) => req,
                Ok(None) => return,
                Err(e) => {
                    let _ = protocol::write_response(&mut write_half, &Err(e), None).await;
                    return;
                }
            };

            match commands::dispatch(&ctx, uid, req).await {
                Outcome::Response(result) => {
                    let (result, ok_extra) = split_ok_extra(result);
                    if protocol::write_response(&mut write_half, &result, ok_extra.as_deref()).await.is_err() {
                        return;
                    }
                }
                Outcome::Shutdown(result) => {
                    let _ = protocol::write_response(&mut write_half, &result, None).await;
                    ctx.shutdown.send();
                    return;
                }
                Outcome::Ipn { ok, body } => {
                    let _ = protocol::write_response(&mut write_half, &ok, None).await;
                    let _ = write_half.shutdown().await;
                    let paypal_ctx = ctx.clone();
                    PpTask::spawn("ppipnhd-verify", async move { verify_ipn(paypal_ctx, body).await }).detach();
                    return;
                }
            }
        }
    }
    .instrument(span)
    .await;
}

/// Extracts [`commands::OK_EXTRA_NAME`] from a successful response, if
/// present, so it can be written as the `OK` status line's trailing text
/// instead of an ordinary data line.
fn split_ok_extra(result: Result<KvList, PayprocError>) -> (Result<KvList, PayprocError>, Option<String>) {
    match result {
        Ok(mut dict) => {
            let extra = payproc_api_core::kv::Name::new(commands::OK_EXTRA_NAME).ok().and_then(|name| dict.remove(&name));
            (Ok(dict), extra)
        }
        Err(e) => (Err(e), None),
    }
}

async fn verify_ipn(ctx: Arc<Context>, body: String) {
    match ctx.paypal.verify_ipn(&body).await {
        Ok(_fields) => info!("PayPal IPN verified"),
        Err(e) => warn!(error = %e, "PayPal IPN verification failed"),
    }
}

async fn housekeeping_loop(ctx: Arc<Context>, mut shutdown: NotifyOnce) {
    let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    let mut since_currency_refresh = Duration::ZERO;
    loop {
        tokio::select! {
            biased;
            () = shutdown.recv() => return,
            _ = ticker.tick() => {
                let evicted = ctx.sessions.housekeeping().await;
                if evicted > 0 {
                    info!(evicted, "session housekeeping swept expired sessions");
                }
                since_currency_refresh += HOUSEKEEPING_INTERVAL;
                if since_currency_refresh >= CURRENCY_REFRESH_INTERVAL {
                    since_currency_refresh = Duration::ZERO;
                    refresh_currency_rates(&ctx).await;
                }
            }
        }
    }
}

/// Exchange rates are refreshed from a configured source; no
/// such source is wired up yet, so this refreshes against a static
/// placeholder that keeps only EUR's identity rate. A future
/// `--exchange-rate-url` flag would plug a real fetch in here without
/// touching `CurrencyTable` itself.
async fn refresh_currency_rates(ctx: &Context) {
    ctx.currency.refresh(|| async { Ok(std::collections::HashMap::new()) }).await;
}
