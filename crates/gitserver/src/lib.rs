//! History server: exposes the history repository's git directory read-only
//! under `/cluster-config` so plain `git clone` works over the dumb protocol.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use metrics::counter;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::services::ServeDir;
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, info_span, warn};

pub const PREFIX: &str = "/cluster-config";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Bound on reading request headers, and on idle keep-alive connections.
    pub header_timeout: Duration,
    /// Bound on reading a request body.
    pub read_timeout: Duration,
    /// Bound on producing a response.
    pub write_timeout: Duration,
    /// Bound on draining in-flight connections at shutdown.
    pub grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            header_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GitServerError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("connections still open after {0:?}")]
    DrainTimeout(Duration),
}

/// Liveness flag: true only while the server accepts traffic.
#[derive(Debug, Clone, Default)]
pub struct Health(Arc<AtomicBool>);

impl Health {
    pub fn is_healthy(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, healthy: bool) {
        self.0.store(healthy, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct ServerState {
    health: Health,
    git_dir: PathBuf,
}

impl ServerState {
    pub fn new(git_dir: impl Into<PathBuf>) -> Self {
        Self { health: Health::default(), git_dir: git_dir.into() }
    }

    pub fn health(&self) -> &Health {
        &self.health
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }
}

async fn healthz(State(state): State<ServerState>) -> StatusCode {
    if state.health.is_healthy() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Routes plus the request id, tracing and response timeout layers.
pub fn router(state: ServerState, cfg: &ServerConfig) -> Router {
    let files = ServeDir::new(state.git_dir());
    let layers = ServiceBuilder::new()
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
            let id = req.headers().get("x-request-id").and_then(|v| v.to_str().ok()).unwrap_or("unknown");
            info_span!("request", id = %id, method = %req.method(), path = %req.uri().path())
        }))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TimeoutLayer::new(cfg.write_timeout));
    Router::new()
        .route(&format!("{PREFIX}/healthz"), get(healthz))
        .nest_service(PREFIX, files)
        .layer(layers)
        .with_state(state)
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, GitServerError> {
    TcpListener::bind(addr).await.map_err(|source| GitServerError::Bind { addr, source })
}

/// Serve until `shutdown` fires, then flip health, stop accepting and wait
/// for open connections to finish their in-flight request.
pub async fn serve(
    listener: TcpListener,
    state: ServerState,
    cfg: ServerConfig,
    shutdown: CancellationToken,
) -> Result<(), GitServerError> {
    let app = ServiceBuilder::new().layer(RequestBodyTimeoutLayer::new(cfg.read_timeout)).service(router(state.clone(), &cfg));
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder.http1().timer(TokioTimer::new()).header_read_timeout(cfg.header_timeout);
    let graceful = GracefulShutdown::new();

    state.health.set(true);
    info!(addr = ?listener.local_addr().ok(), dir = %state.git_dir().display(), "serving history repository at {PREFIX}");

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        counter!("http_connections_total", 1u64);
        let conn = builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(app.clone())).into_owned();
        let conn = graceful.watch(conn);
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(peer = %peer, error = %e, "connection closed with error");
            }
        });
    }

    state.health.set(false);
    drop(listener);
    info!("history server shutting down");
    match tokio::time::timeout(cfg.grace, graceful.shutdown()).await {
        Ok(()) => {
            info!("history server stopped");
            Ok(())
        }
        Err(_) => {
            error!(grace_ms = cfg.grace.as_millis() as u64, "history server did not drain in time");
            Err(GitServerError::DrainTimeout(cfg.grace))
        }
    }
}
