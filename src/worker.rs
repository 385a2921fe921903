//! Worker runtime: one cooperative event loop serving many connections.
//!
//! A worker process runs a current-thread tokio runtime. Every accepted
//! connection becomes a task on that runtime; tasks interleave at I/O
//! boundaries (reading the request, awaiting the handler, writing the
//! response) and never run handler code in parallel.
//!
//! # Backpressure
//!
//! The accept loop acquires a connection permit *before* it calls `accept`.
//! With `max_connections` connections open the loop simply stops accepting
//! and further clients wait in the kernel listen backlog.
//!
//! # Stopping
//!
//! Graceful stop closes this worker's copy of the listener at once, lets open
//! connections finish until the grace deadline and then aborts whatever is
//! left. Immediate stop aborts everything straight away.

use futures::FutureExt;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::{WorkerBootConfig, WorkerSettings};
use crate::control::{
    ControlCommand, LineReader, LineWriter, StopMode, StopSignal, WorkerEvent, WorkerStatsSnapshot,
};
use crate::error::{json_error_response, ControlError, HandlerError, WorkerErrorCode};
use crate::handler::{self, SharedHandler};
use crate::listener::{self, ListenerHandle};

/// Environment variable carrying the supervisor-assigned worker id
pub const WORKER_ID_ENV: &str = "PREFORK_WORKER_ID";

/// Environment variable carrying [`WorkerBootConfig`] as JSON
pub const WORKER_CONFIG_ENV: &str = "PREFORK_WORKER_CONFIG";

/// Header carrying the request id on responses
const X_REQUEST_ID: &str = "x-request-id";
/// Header naming the worker that served a response
const X_PREFORK_WORKER: &str = "x-prefork-worker";

/// Pause after an accept error that is not tied to a single connection (e.g. EMFILE)
const ACCEPT_ERROR_BACKOFF_MS: u64 = 100;

/// Time the event writer gets to flush the final events on exit
const EVENT_FLUSH_TIMEOUT_MS: u64 = 500;

/// Live counters of a worker
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub active_connections: AtomicUsize,
    pub total_connections: AtomicU64,
    pub requests_served: AtomicU64,
    pub handler_errors: AtomicU64,
}

impl WorkerStats {
    fn connection_opened(self: &Arc<Self>) -> ActiveConnection {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        ActiveConnection(Arc::clone(self))
    }

    fn record_request(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the active count however the connection task ends (including abort)
struct ActiveConnection(Arc<WorkerStats>);

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// State of one accepted connection
#[derive(Debug)]
pub struct ConnectionContext {
    pub id: u64,
    pub remote: SocketAddr,
    pub accepted_at: Instant,
    requests: AtomicU64,
    first_request: Notify,
}

impl ConnectionContext {
    fn new(id: u64, remote: SocketAddr) -> Self {
        Self {
            id,
            remote,
            accepted_at: Instant::now(),
            requests: AtomicU64::new(0),
            first_request: Notify::new(),
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

/// Shared by every request on this worker
struct ServiceState {
    worker_id: u64,
    worker_header: HeaderValue,
    settings: WorkerSettings,
    handler: SharedHandler,
    stats: Arc<WorkerStats>,
}

/// How a worker run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Stop mode in effect when the worker finished
    pub mode: StopMode,
    /// Connections aborted at the grace deadline or by immediate stop
    pub forced: usize,
    pub stats: WorkerStatsSnapshot,
}

pub struct WorkerRuntime {
    state: Arc<ServiceState>,
}

impl WorkerRuntime {
    pub fn new(worker_id: u64, settings: WorkerSettings, handler: SharedHandler) -> Self {
        let worker_header =
            HeaderValue::from_str(&worker_id.to_string()).unwrap_or(HeaderValue::from_static("0"));
        Self {
            state: Arc::new(ServiceState {
                worker_id,
                worker_header,
                settings,
                handler,
                stats: Arc::new(WorkerStats::default()),
            }),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.state.stats)
    }

    /// Serve connections from `listener` until `stop` is requested.
    ///
    /// Lifecycle events are pushed to `events`; a closed receiver is ignored.
    pub async fn run(
        self,
        listener: &ListenerHandle,
        stop: StopSignal,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> std::io::Result<WorkerExit> {
        let listener = listener.to_tokio()?;
        let state = self.state;
        let settings = &state.settings;
        let limit = Arc::new(Semaphore::new(settings.max_connections));
        let mut connections: JoinSet<()> = JoinSet::new();
        let mut stop_watch = stop.watch();
        let mut next_conn_id: u64 = 0;

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&state.stats),
            events.clone(),
            settings.heartbeat_interval(),
        ));

        info!(
            worker_id = state.worker_id,
            pid = std::process::id(),
            max_connections = settings.max_connections,
            "Worker accepting connections"
        );
        let _ = events.send(WorkerEvent::Ready {
            pid: std::process::id(),
        });

        loop {
            // Hold a permit before accepting so excess clients stay in the backlog
            let permit = tokio::select! {
                biased;
                _ = stop_watch.at_least(StopMode::Graceful) => break,
                Some(result) = connections.join_next(), if !connections.is_empty() => {
                    log_connection_result(result);
                    continue;
                }
                permit = Arc::clone(&limit).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let (stream, remote) = tokio::select! {
                biased;
                _ = stop_watch.at_least(StopMode::Graceful) => break,
                Some(result) = connections.join_next(), if !connections.is_empty() => {
                    log_connection_result(result);
                    continue;
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) if is_connection_error(&e) => {
                        debug!(error = %e, "Connection failed during accept");
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(ACCEPT_ERROR_BACKOFF_MS)).await;
                        continue;
                    }
                },
            };

            next_conn_id += 1;
            let ctx = Arc::new(ConnectionContext::new(next_conn_id, remote));
            debug!(conn_id = ctx.id, remote = %remote, "Accepted connection");

            connections.spawn(serve_connection(
                stream,
                ctx,
                Arc::clone(&state),
                stop.watch(),
                permit,
            ));
        }

        // Siblings keep the shared socket open; only our copy goes away.
        drop(listener);
        let stopped_at = Instant::now();
        let in_flight = connections.len();
        info!(worker_id = state.worker_id, in_flight, "Worker draining");
        let _ = events.send(WorkerEvent::Draining { in_flight });

        let deadline = tokio::time::Instant::from_std(stopped_at + settings.graceful_timeout());
        let forced = loop {
            if connections.is_empty() {
                break 0;
            }
            tokio::select! {
                biased;
                _ = stop_watch.at_least(StopMode::Immediate) => {
                    break abort_connections(&mut connections, "immediate stop").await;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    break abort_connections(&mut connections, "grace period expired").await;
                }
                Some(result) = connections.join_next() => log_connection_result(result),
            }
        };

        heartbeat.abort();

        let stats = state.stats.snapshot();
        info!(
            worker_id = state.worker_id,
            forced,
            drained_in_ms = stopped_at.elapsed().as_millis() as u64,
            requests_served = stats.requests_served,
            handler_errors = stats.handler_errors,
            "Worker stopped"
        );
        let _ = events.send(WorkerEvent::Stopped { forced });

        Ok(WorkerExit {
            mode: stop.current(),
            forced,
            stats,
        })
    }
}

async fn abort_connections(connections: &mut JoinSet<()>, reason: &str) -> usize {
    let remaining = connections.len();
    if remaining > 0 {
        warn!(remaining, reason, "Force-closing connections");
    }
    connections.shutdown().await;
    remaining
}

fn log_connection_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Connection task panicked");
        }
    }
}

/// Accept errors caused by one client rather than the listener
fn is_connection_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
    )
}

async fn heartbeat_loop(
    stats: Arc<WorkerStats>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let event = WorkerEvent::Heartbeat {
            stats: stats.snapshot(),
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    ctx: Arc<ConnectionContext>,
    state: Arc<ServiceState>,
    mut stop: crate::control::StopWatcher,
    _permit: OwnedSemaphorePermit,
) {
    let _active = state.stats.connection_opened();
    let _ = stream.set_nodelay(true);
    let io = TokioIo::new(stream);
    let keep_alive = state.settings.keep_alive;

    let service_ctx = Arc::clone(&ctx);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        let ctx = Arc::clone(&service_ctx);
        async move { Ok::<_, Infallible>(handle_request(req, state, ctx).await) }
    });

    let conn = http1::Builder::new()
        .keep_alive(keep_alive)
        .serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        res = conn.as_mut() => res,
        _ = stop.at_least(StopMode::Graceful) => {
            // Accepted before the stop but no request head read yet: hyper would
            // close it on the spot, so let the first request start first.
            // The drain deadline still bounds the wait.
            let finished = if ctx.requests() == 0 {
                tokio::select! {
                    res = conn.as_mut() => Some(res),
                    _ = ctx.first_request.notified() => None,
                }
            } else {
                None
            };
            match finished {
                Some(res) => res,
                None => {
                    // Finish the request in progress, then close
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            }
        }
    };

    match result {
        Ok(()) => debug!(
            conn_id = ctx.id,
            requests = ctx.requests(),
            open_ms = ctx.accepted_at.elapsed().as_millis() as u64,
            "Connection closed"
        ),
        Err(e) => debug!(conn_id = ctx.id, remote = %ctx.remote, error = %e, "Connection error"),
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ServiceState>,
    ctx: Arc<ConnectionContext>,
) -> Response<Full<Bytes>> {
    if ctx.requests.fetch_add(1, Ordering::Relaxed) == 0 {
        ctx.first_request.notify_one();
    }

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, state.settings.max_request_body_bytes)
        .collect()
        .await
    {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let response = if e.downcast_ref::<LengthLimitError>().is_some() {
                json_error_response(
                    WorkerErrorCode::PayloadTooLarge,
                    format!(
                        "request body exceeds {} bytes",
                        state.settings.max_request_body_bytes
                    ),
                )
            } else {
                json_error_response(WorkerErrorCode::BadRequest, e.to_string())
            };
            return finish_response(response, &request_id, &state);
        }
    };

    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let result = invoke_handler(&state, Request::from_parts(parts, body)).await;

    let response = match result {
        Ok(response) => response.map(Full::new),
        Err(e) => {
            state.stats.record_error();
            warn!(
                conn_id = ctx.id,
                %request_id,
                %method,
                %path,
                error = %e,
                "Handler failed"
            );
            json_error_response(e.code(), e.to_string())
        }
    };

    state.stats.record_request();
    finish_response(response, &request_id, &state)
}

/// Run the handler with panic containment and the optional timeout
async fn invoke_handler(
    state: &ServiceState,
    req: Request<Bytes>,
) -> Result<Response<Bytes>, HandlerError> {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| state.handler.handle(req))) {
        Ok(future) => future,
        Err(panic) => return Err(HandlerError::Panicked(panic_message(&*panic))),
    };

    let guarded = AssertUnwindSafe(future).catch_unwind();
    let outcome = match state.settings.handler_timeout() {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(HandlerError::Timeout),
        },
        None => guarded.await,
    };

    match outcome {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::Panicked(panic_message(&*panic))),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn finish_response(
    mut response: Response<Full<Bytes>>,
    request_id: &str,
    state: &ServiceState,
) -> Response<Full<Bytes>> {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    headers.insert(X_PREFORK_WORKER, state.worker_header.clone());
    response
}

/// Entry point of a worker process spawned by the supervisor.
///
/// Blocks until the worker stops. Builds its own single-threaded runtime.
pub fn run_process() -> anyhow::Result<()> {
    let worker_id: u64 = std::env::var(WORKER_ID_ENV)
        .map_err(|_| anyhow::anyhow!("{} is not set; workers are started by the supervisor", WORKER_ID_ENV))?
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid {}: {}", WORKER_ID_ENV, e))?;
    let boot: WorkerBootConfig = serde_json::from_str(
        &std::env::var(WORKER_CONFIG_ENV)
            .map_err(|_| anyhow::anyhow!("{} is not set", WORKER_CONFIG_ENV))?,
    )?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let span = tracing::info_span!("worker", id = worker_id);
    let result = runtime.block_on(serve_process(worker_id, boot).instrument(span));

    // The stdin reader sits in a blocking read; don't wait for it.
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}

async fn serve_process(worker_id: u64, boot: WorkerBootConfig) -> anyhow::Result<()> {
    let listener = listener::inherit_from_env()?;
    let handler = handler::from_config(&boot.app)?;
    let runtime = WorkerRuntime::new(worker_id, boot.worker, handler);
    let stats = runtime.stats();
    let stop = StopSignal::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (start_tx, start_rx) = oneshot::channel();

    let writer = tokio::spawn(write_events(events_rx).in_current_span());
    tokio::spawn(
        read_commands(stop.clone(), start_tx, Arc::clone(&stats), events_tx.clone())
            .in_current_span(),
    );
    tokio::spawn(watch_signals(stop.clone()).in_current_span());

    debug!(addr = %listener.local_addr(), "Waiting for start command");
    let mut watcher = stop.watch();
    tokio::select! {
        started = start_rx => {
            if started.is_err() {
                anyhow::bail!("control channel closed before start");
            }
        }
        mode = watcher.at_least(StopMode::Graceful) => {
            info!(?mode, "Stop requested before start");
            let _ = events_tx.send(WorkerEvent::Stopped { forced: 0 });
            let _ = tokio::time::timeout(Duration::from_millis(EVENT_FLUSH_TIMEOUT_MS), writer).await;
            return Ok(());
        }
    }

    let exit = runtime.run(&listener, stop, events_tx).await?;
    debug!(?exit, "Worker run finished");

    let _ = tokio::time::timeout(Duration::from_millis(EVENT_FLUSH_TIMEOUT_MS), writer).await;
    Ok(())
}

/// Forward events to stdout until the final `Stopped` event
async fn write_events(mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    let mut out = LineWriter::new(tokio::io::stdout());
    while let Some(event) = events.recv().await {
        let last = matches!(event, WorkerEvent::Stopped { .. });
        if let Err(e) = out.send(&event).await {
            warn!(error = %e, "Failed to write event to supervisor");
            return;
        }
        if last {
            return;
        }
    }
}

async fn read_commands(
    stop: StopSignal,
    start: oneshot::Sender<()>,
    stats: Arc<WorkerStats>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut start = Some(start);
    let mut reader = LineReader::new(tokio::io::stdin());

    loop {
        match reader.next::<ControlCommand>().await {
            Ok(Some(ControlCommand::Start)) => {
                if let Some(tx) = start.take() {
                    let _ = tx.send(());
                }
            }
            Ok(Some(ControlCommand::GracefulStop)) => {
                if stop.request(StopMode::Graceful) {
                    info!("Graceful stop requested");
                }
            }
            Ok(Some(ControlCommand::ImmediateStop)) => {
                if stop.request(StopMode::Immediate) {
                    info!("Immediate stop requested");
                }
            }
            Ok(Some(ControlCommand::Heartbeat)) => {
                let _ = events.send(WorkerEvent::Heartbeat {
                    stats: stats.snapshot(),
                });
            }
            Ok(None) => {
                warn!("Control pipe closed by supervisor, stopping gracefully");
                stop.request(StopMode::Graceful);
                return;
            }
            Err(ControlError::Codec(e)) => {
                warn!(error = %e, "Ignoring malformed control command");
            }
            Err(e) => {
                warn!(error = %e, "Control pipe failed, stopping gracefully");
                stop.request(StopMode::Graceful);
                return;
            }
        }
    }
}

#[cfg(unix)]
async fn watch_signals(stop: StopSignal) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut term, mut quit, mut int) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(quit), Ok(int)) => (term, quit, int),
        _ => {
            warn!("Failed to install worker signal handlers");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = term.recv() => {
                info!("Received SIGTERM, stopping gracefully");
                stop.request(StopMode::Graceful);
            }
            _ = quit.recv() => {
                info!("Received SIGQUIT, stopping immediately");
                stop.request(StopMode::Immediate);
            }
            _ = int.recv() => {
                debug!("Ignoring SIGINT; the supervisor coordinates shutdown");
            }
        }
    }
}

#[cfg(not(unix))]
async fn watch_signals(_stop: StopSignal) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot_and_guard() {
        let stats = Arc::new(WorkerStats::default());
        {
            let _a = stats.connection_opened();
            let _b = stats.connection_opened();
            stats.record_request();
            stats.record_error();
            let snap = stats.snapshot();
            assert_eq!(snap.active_connections, 2);
            assert_eq!(snap.total_connections, 2);
            assert_eq!(snap.requests_served, 1);
            assert_eq!(snap.handler_errors, 1);
        }
        // Guards dropped: active goes back to zero, totals stay
        let snap = stats.snapshot();
        assert_eq!(snap.active_connections, 0);
        assert_eq!(snap.total_connections, 2);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static str");
        assert_eq!(panic_message(&*boxed), "static str");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*boxed), "unknown panic");
    }

    #[test]
    fn test_connection_errors_are_not_fatal() {
        use std::io::{Error, ErrorKind};
        assert!(is_connection_error(&Error::from(ErrorKind::ConnectionAborted)));
        assert!(is_connection_error(&Error::from(ErrorKind::ConnectionReset)));
        assert!(!is_connection_error(&Error::from(ErrorKind::Other)));
    }

    #[tokio::test]
    async fn test_invoke_handler_contains_sync_panic() {
        let state = ServiceState {
            worker_id: 1,
            worker_header: HeaderValue::from_static("1"),
            settings: WorkerSettings::default(),
            handler: Arc::new(|_req: Request<Bytes>| -> futures::future::Ready<crate::handler::HandlerResult> {
                panic!("exploded before returning a future")
            }),
            stats: Arc::new(WorkerStats::default()),
        };

        let req = Request::builder().uri("/").body(Bytes::new()).unwrap();
        let result = invoke_handler(&state, req).await;
        match result {
            Err(HandlerError::Panicked(msg)) => assert!(msg.contains("exploded")),
            other => panic!("expected panic error, got {:?}", other.map(|r| r.status())),
        }
    }

    #[tokio::test]
    async fn test_invoke_handler_timeout() {
        let mut settings = WorkerSettings::default();
        settings.handler_timeout_secs = Some(1);
        let state = ServiceState {
            worker_id: 1,
            worker_header: HeaderValue::from_static("1"),
            settings,
            handler: Arc::new(|_req: Request<Bytes>| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Response::new(Bytes::new()))
            }),
            stats: Arc::new(WorkerStats::default()),
        };

        let req = Request::builder().uri("/").body(Bytes::new()).unwrap();
        let started = Instant::now();
        let result = invoke_handler(&state, req).await;
        assert!(matches!(result, Err(HandlerError::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
