//! Worker runtime tests over a real socket, in-process

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::body::Bytes;
use hyper::{Request, Response};
use prefork::config::WorkerSettings;
use prefork::control::{StopMode, StopSignal, WorkerEvent};
use prefork::error::HandlerError;
use prefork::handler::SharedHandler;
use prefork::listener;
use prefork::worker::{WorkerExit, WorkerRuntime, WorkerStats};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct TestWorker {
    addr: SocketAddr,
    stop: StopSignal,
    stats: Arc<WorkerStats>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    task: JoinHandle<std::io::Result<WorkerExit>>,
}

/// Test application: `/sleep/<ms>`, `/fail`, `/panic`, anything else echoes
fn test_handler() -> SharedHandler {
    Arc::new(|req: Request<Bytes>| async move {
        let path = req.uri().path().to_string();
        if let Some(ms) = path.strip_prefix("/sleep/") {
            let ms: u64 = ms.parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(Response::new(Bytes::from(format!("slept {}", ms))));
        }
        match path.as_str() {
            "/fail" => Err(HandlerError::Failed("application said no".into())),
            "/panic" => panic!("handler blew up"),
            _ => Ok(Response::new(req.into_body())),
        }
    }) as SharedHandler
}

fn settings() -> WorkerSettings {
    WorkerSettings {
        graceful_timeout_ms: 5000,
        heartbeat_interval_ms: 100,
        ..WorkerSettings::default()
    }
}

async fn start_worker(settings: WorkerSettings) -> TestWorker {
    let listener = listener::bind_str("127.0.0.1:0", 128).unwrap();
    let addr = listener.local_addr();
    let stop = StopSignal::new();
    let (tx, mut events) = mpsc::unbounded_channel();

    let runtime = WorkerRuntime::new(7, settings, test_handler());
    let stats = runtime.stats();
    let worker_stop = stop.clone();
    let task = tokio::spawn(async move { runtime.run(&listener, worker_stop, tx).await });

    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(WorkerEvent::Ready { .. })) => break,
            Ok(Some(_)) => continue,
            other => panic!("worker did not become ready: {:?}", other),
        }
    }

    TestWorker {
        addr,
        stop,
        stats,
        events,
        task,
    }
}

/// Send one request with `Connection: close` and read until the server closes.
/// A reset or early close yields whatever was read (possibly nothing).
async fn send(addr: SocketAddr, method: &str, path: &str, body: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: test\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).to_string()
}

async fn get(addr: SocketAddr, path: &str) -> String {
    send(addr, "GET", path, "").await
}

async fn wait_for_active(stats: &WorkerStats, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while stats.snapshot().active_connections < expected {
        assert!(Instant::now() < deadline, "connections never became active");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_echo_and_headers() {
    let worker = start_worker(settings()).await;

    let response = send(worker.addr, "POST", "/anything", "hello worker").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
    assert!(response.contains("x-prefork-worker: 7"));
    assert!(response.contains("x-request-id: "));
    assert!(response.ends_with("hello worker"));

    worker.stop.request(StopMode::Graceful);
    let exit = worker.task.await.unwrap().unwrap();
    assert_eq!(exit.forced, 0);
    assert_eq!(exit.stats.requests_served, 1);
}

#[tokio::test]
async fn test_graceful_stop_finishes_short_requests_and_cuts_long_ones() {
    let worker = start_worker(settings()).await;
    let addr = worker.addr;

    let short = tokio::spawn(async move {
        let response = get(addr, "/sleep/2000").await;
        (response, Instant::now())
    });
    let long = tokio::spawn(async move {
        let response = get(addr, "/sleep/10000").await;
        (response, Instant::now())
    });

    wait_for_active(&worker.stats, 2).await;
    let stop_at = Instant::now();
    worker.stop.request(StopMode::Graceful);

    let exit = worker.task.await.unwrap().unwrap();
    assert_eq!(exit.mode, StopMode::Graceful);
    assert_eq!(exit.forced, 1);

    let (short_response, _) = short.await.unwrap();
    assert!(short_response.contains("200 OK"), "{}", short_response);
    assert!(short_response.ends_with("slept 2000"));

    let (long_response, closed_at) = long.await.unwrap();
    assert!(!long_response.contains("200 OK"), "{}", long_response);
    let cut_after = closed_at.duration_since(stop_at);
    assert!(cut_after >= Duration::from_millis(4900), "cut too early: {:?}", cut_after);
    assert!(cut_after < Duration::from_secs(8), "cut too late: {:?}", cut_after);
}

#[tokio::test]
async fn test_graceful_stop_serves_connection_accepted_before_stop() {
    let worker = start_worker(settings()).await;

    // Accepted, but the request has not been written yet
    let mut stream = TcpStream::connect(worker.addr).await.unwrap();
    wait_for_active(&worker.stats, 1).await;

    worker.stop.request(StopMode::Graceful);
    tokio::time::sleep(Duration::from_millis(200)).await;

    stream
        .write_all(b"GET /late HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    let response = String::from_utf8_lossy(&buf);
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);

    let exit = worker.task.await.unwrap().unwrap();
    assert_eq!(exit.mode, StopMode::Graceful);
    assert_eq!(exit.forced, 0);
    assert_eq!(exit.stats.requests_served, 1);
}

#[tokio::test]
async fn test_immediate_stop_aborts_in_flight_work() {
    let worker = start_worker(settings()).await;
    let addr = worker.addr;

    let long = tokio::spawn(async move { get(addr, "/sleep/10000").await });
    wait_for_active(&worker.stats, 1).await;

    let started = Instant::now();
    worker.stop.request(StopMode::Immediate);
    let exit = worker.task.await.unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(exit.mode, StopMode::Immediate);
    assert_eq!(exit.forced, 1);

    let response = long.await.unwrap();
    assert!(!response.contains("200 OK"));
}

#[tokio::test]
async fn test_immediate_stop_escalates_draining() {
    let worker = start_worker(settings()).await;
    let addr = worker.addr;

    let long = tokio::spawn(async move { get(addr, "/sleep/10000").await });
    wait_for_active(&worker.stats, 1).await;

    let started = Instant::now();
    worker.stop.request(StopMode::Graceful);
    tokio::time::sleep(Duration::from_millis(200)).await;
    worker.stop.request(StopMode::Immediate);

    let exit = worker.task.await.unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(exit.forced, 1);
    assert!(!long.await.unwrap().contains("200 OK"));
}

#[tokio::test]
async fn test_failing_handlers_do_not_affect_siblings() {
    let worker = start_worker(settings()).await;
    let addr = worker.addr;

    let slow = tokio::spawn(async move { get(addr, "/sleep/300").await });
    let panicking = tokio::spawn(async move { get(addr, "/panic").await });
    let failing = tokio::spawn(async move { get(addr, "/fail").await });

    let panicked = panicking.await.unwrap();
    assert!(panicked.starts_with("HTTP/1.1 500"), "{}", panicked);
    assert!(panicked.contains("x-prefork-error: HANDLER_PANICKED"));
    assert!(panicked.contains("handler blew up"));

    let failed = failing.await.unwrap();
    assert!(failed.starts_with("HTTP/1.1 500"), "{}", failed);
    assert!(failed.contains("x-prefork-error: HANDLER_FAILED"));

    let ok = slow.await.unwrap();
    assert!(ok.starts_with("HTTP/1.1 200 OK"), "{}", ok);
    assert!(ok.ends_with("slept 300"));

    // The worker keeps serving afterwards
    assert!(get(addr, "/after").await.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(worker.stats.snapshot().handler_errors, 2);

    worker.stop.request(StopMode::Graceful);
    worker.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connection_limit_holds_excess_clients_in_backlog() {
    let worker = start_worker(WorkerSettings {
        max_connections: 1,
        ..settings()
    })
    .await;
    let addr = worker.addr;

    let first = tokio::spawn(async move { get(addr, "/sleep/1000").await });
    wait_for_active(&worker.stats, 1).await;

    let second_started = Instant::now();
    let second = tokio::spawn(async move {
        let response = get(addr, "/sleep/0").await;
        (response, Instant::now())
    });

    // Connected at the TCP level, but not accepted while the permit is held
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(worker.stats.snapshot().total_connections, 1);

    assert!(first.await.unwrap().contains("200 OK"));
    let (response, done_at) = second.await.unwrap();
    assert!(response.contains("200 OK"), "{}", response);
    assert!(done_at.duration_since(second_started) >= Duration::from_millis(500));
    assert_eq!(worker.stats.snapshot().total_connections, 2);

    worker.stop.request(StopMode::Graceful);
    worker.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let worker = start_worker(WorkerSettings {
        max_request_body_bytes: 16,
        ..settings()
    })
    .await;

    let body = "x".repeat(100);
    let response = send(worker.addr, "POST", "/upload", &body).await;
    assert!(response.starts_with("HTTP/1.1 413"), "{}", response);
    assert!(response.contains("x-prefork-error: PAYLOAD_TOO_LARGE"));

    let response = send(worker.addr, "POST", "/upload", "small").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);

    worker.stop.request(StopMode::Graceful);
    worker.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_handler_timeout_returns_504() {
    let worker = start_worker(WorkerSettings {
        handler_timeout_secs: Some(1),
        ..settings()
    })
    .await;

    let started = Instant::now();
    let response = get(worker.addr, "/sleep/5000").await;
    assert!(response.starts_with("HTTP/1.1 504"), "{}", response);
    assert!(response.contains("x-prefork-error: HANDLER_TIMEOUT"));
    assert!(started.elapsed() < Duration::from_secs(3));

    worker.stop.request(StopMode::Graceful);
    worker.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_lifecycle_events() {
    let mut worker = start_worker(settings()).await;

    let heartbeat = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(WorkerEvent::Heartbeat { stats }) = worker.events.recv().await {
                return stats;
            }
        }
    })
    .await
    .expect("no heartbeat");
    assert_eq!(heartbeat.active_connections, 0);

    worker.stop.request(StopMode::Graceful);
    worker.task.await.unwrap().unwrap();

    let mut saw_draining = false;
    let mut saw_stopped = false;
    while let Ok(event) = worker.events.try_recv() {
        match event {
            WorkerEvent::Draining { in_flight } => {
                assert_eq!(in_flight, 0);
                saw_draining = true;
            }
            WorkerEvent::Stopped { forced } => {
                assert_eq!(forced, 0);
                saw_stopped = true;
            }
            _ => {}
        }
    }
    assert!(saw_draining && saw_stopped);
}
