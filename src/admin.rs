//! Admin HTTP API for operators.
//!
//! Served from the supervisor process on `127.0.0.1:<admin_port>`. Everything
//! except `/health` and `/version` requires `Authorization: Bearer <token>`.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::control::ShutdownMode;
use crate::error::SupervisorError;
use crate::supervisor::{ReloadOutcome, SupervisorHandle, WorkerId};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = response(status, body);
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn json_error(status: StatusCode, message: impl std::fmt::Display) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message.to_string() });
    json_response(status, body.to_string())
}

/// Admin API server bound next to the supervisor
pub struct AdminServer {
    bind_addr: SocketAddr,
    supervisor: SupervisorHandle,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        supervisor: SupervisorHandle,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            supervisor,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let supervisor = self.supervisor.clone();
                            let auth_token = Arc::clone(&self.auth_token);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, supervisor, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: tokio::net::TcpStream,
    supervisor: SupervisorHandle,
    auth_token: Arc<String>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
        let supervisor = supervisor.clone();
        let token = Arc::clone(&auth_token);
        async move { Ok::<_, std::convert::Infallible>(handle_admin_request(req, supervisor, token).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(headers: &HeaderMap, expected_token: &str) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

/// `/workers/{id}/reload` → id
fn parse_worker_reload_path(path: &str) -> Option<WorkerId> {
    path.strip_prefix("/workers/")?
        .strip_suffix("/reload")?
        .parse::<u64>()
        .ok()
        .map(WorkerId::new)
}

/// Mode from the `mode=` query parameter; graceful when absent
fn parse_shutdown_mode(query: Option<&str>) -> Result<ShutdownMode, String> {
    let Some(query) = query else {
        return Ok(ShutdownMode::Graceful);
    };
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("mode=") {
            return value.parse();
        }
    }
    Ok(ShutdownMode::Graceful)
}

fn supervisor_error(e: SupervisorError) -> Response<Full<Bytes>> {
    let status = match e {
        SupervisorError::UnknownWorker(_) => StatusCode::NOT_FOUND,
        SupervisorError::ShuttingDown | SupervisorError::Gone => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_error(status, e)
}

fn reload_response(outcome: ReloadOutcome) -> Response<Full<Bytes>> {
    let status = match outcome {
        ReloadOutcome::Started { .. } => StatusCode::ACCEPTED,
        ReloadOutcome::AlreadyInProgress => StatusCode::CONFLICT,
    };
    match serde_json::to_string(&outcome) {
        Ok(body) => json_response(status, body),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn handle_admin_request<B>(
    req: Request<B>,
    supervisor: SupervisorHandle,
    auth_token: Arc<String>,
) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "Admin API request");

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return response(StatusCode::OK, "ok"),
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return json_response(StatusCode::OK, version_info.to_string());
        }
        _ => {}
    }

    if !check_auth(req.headers(), &auth_token) {
        warn!(%path, "Unauthorized admin API request");
        return json_error(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    match (&method, path.as_str()) {
        (&Method::GET, "/status") => match supervisor.status().await {
            Ok(status) => match serde_json::to_string(&status) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
            },
            Err(e) => supervisor_error(e),
        },

        (&Method::POST, "/reload") => {
            info!("Reload requested via admin API");
            match supervisor.reload().await {
                Ok(outcome) => reload_response(outcome),
                Err(e) => supervisor_error(e),
            }
        }

        (&Method::POST, p) if p.starts_with("/workers/") => match parse_worker_reload_path(p) {
            Some(id) => {
                info!(worker_id = %id, "Worker reload requested via admin API");
                match supervisor.reload_one(id).await {
                    Ok(outcome) => reload_response(outcome),
                    Err(e) => supervisor_error(e),
                }
            }
            None => json_error(StatusCode::NOT_FOUND, "not found"),
        },

        (&Method::POST, "/shutdown") => match parse_shutdown_mode(req.uri().query()) {
            Ok(mode) => {
                info!(?mode, "Shutdown requested via admin API");
                match supervisor.shutdown(mode).await {
                    Ok(()) => json_response(
                        StatusCode::ACCEPTED,
                        serde_json::json!({ "shutdown": mode }).to_string(),
                    ),
                    Err(e) => supervisor_error(e),
                }
            }
            Err(e) => json_error(StatusCode::BAD_REQUEST, e),
        },

        _ => json_error(StatusCode::NOT_FOUND, "not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_auth() {
        let mut headers = HeaderMap::new();
        assert!(!check_auth(&headers, "secret"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert!(check_auth(&headers, "secret"));
        assert!(!check_auth(&headers, "other"));

        // Bare token accepted too
        headers.insert(AUTHORIZATION, HeaderValue::from_static("secret"));
        assert!(check_auth(&headers, "secret"));
    }

    #[test]
    fn test_parse_worker_reload_path() {
        assert_eq!(parse_worker_reload_path("/workers/7/reload"), Some(WorkerId::new(7)));
        assert_eq!(parse_worker_reload_path("/workers/x/reload"), None);
        assert_eq!(parse_worker_reload_path("/workers/7"), None);
        assert_eq!(parse_worker_reload_path("/workers//reload"), None);
    }

    #[test]
    fn test_parse_shutdown_mode() {
        assert_eq!(parse_shutdown_mode(None), Ok(ShutdownMode::Graceful));
        assert_eq!(parse_shutdown_mode(Some("mode=immediate")), Ok(ShutdownMode::Immediate));
        assert_eq!(parse_shutdown_mode(Some("x=1&mode=graceful")), Ok(ShutdownMode::Graceful));
        assert!(parse_shutdown_mode(Some("mode=soon")).is_err());
    }

    #[test]
    fn test_error_statuses() {
        let resp = supervisor_error(SupervisorError::UnknownWorker(WorkerId::new(3)));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = supervisor_error(SupervisorError::ShuttingDown);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        assert_eq!(
            reload_response(ReloadOutcome::AlreadyInProgress).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            reload_response(ReloadOutcome::Started { generation: 2 }).status(),
            StatusCode::ACCEPTED
        );
    }
}
