//! The application handler interface.
//!
//! A worker invokes [`Handler::handle`] once per request with the fully
//! buffered request and writes back whatever response it returns. Anything the
//! handler does internally is the application's business; the worker only
//! guarantees that a failing handler cannot take down other connections.

use futures::future::BoxFuture;
use hyper::body::Bytes;
use hyper::{Request, Response, StatusCode};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, AppKind};
use crate::error::HandlerError;
use crate::pool::{ConnectionPool, PoolConfig};

pub type HandlerResult = Result<Response<Bytes>, HandlerError>;
pub type HandlerFuture = BoxFuture<'static, HandlerResult>;

/// An application request handler
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, req: Request<Bytes>) -> HandlerFuture;
}

pub type SharedHandler = Arc<dyn Handler>;

impl<F, Fut> Handler for F
where
    F: Fn(Request<Bytes>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, req: Request<Bytes>) -> HandlerFuture {
        Box::pin(self(req))
    }
}

/// Replies with the request line followed by the request body
pub struct EchoHandler;

impl Handler for EchoHandler {
    fn handle(&self, req: Request<Bytes>) -> HandlerFuture {
        Box::pin(async move {
            let head = format!("{} {}\n", req.method(), req.uri().path());
            let mut body = Vec::with_capacity(head.len() + req.body().len());
            body.extend_from_slice(head.as_bytes());
            body.extend_from_slice(req.body());

            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain")
                .body(Bytes::from(body))
                .map_err(|e| HandlerError::Failed(e.to_string()))
        })
    }
}

/// Forwards requests to an external application
pub struct UpstreamHandler {
    authority: Arc<str>,
    pool: Arc<ConnectionPool>,
}

impl UpstreamHandler {
    pub fn new(authority: &str, pool_config: PoolConfig) -> Self {
        Self {
            authority: Arc::from(authority),
            pool: Arc::new(ConnectionPool::new(pool_config)),
        }
    }
}

impl Handler for UpstreamHandler {
    fn handle(&self, req: Request<Bytes>) -> HandlerFuture {
        let pool = Arc::clone(&self.pool);
        let authority = Arc::clone(&self.authority);
        Box::pin(async move {
            pool.send_request(req, &authority)
                .await
                .map_err(|e| HandlerError::Upstream(e.to_string()))
        })
    }
}

/// Build the handler selected by the `[app]` configuration section
pub fn from_config(app: &AppConfig) -> anyhow::Result<SharedHandler> {
    match app.kind {
        AppKind::Echo => Ok(Arc::new(EchoHandler)),
        AppKind::Upstream => {
            let authority = app
                .upstream
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("upstream handler requires 'upstream' field"))?;
            let pool_config = PoolConfig {
                max_idle_per_host: app.pool_max_idle,
                idle_timeout: Duration::from_secs(app.pool_idle_timeout_secs),
            };
            Ok(Arc::new(UpstreamHandler::new(authority, pool_config)))
        }
    }
}
