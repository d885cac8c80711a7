//! In-process HTTP transport for the gated registry.
//!
//! The server binds an ephemeral local port by default, funnels every
//! request into [`StubRegistry::dispatch`], and exposes a small control
//! surface under `/__held/`. Dropping the server tears the transport down
//! along with every registration it carried.

use crate::registry::{CapturedRequest, Reply, StatsSnapshot, StubRegistry};
use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{Path, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Largest request body the transport will capture.
const BODY_LIMIT: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// A running gated mock server.
pub struct HeldMockServer {
    addr: SocketAddr,
    registry: Arc<StubRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl HeldMockServer {
    /// Start on an ephemeral local port.
    pub async fn start(registry: Arc<StubRegistry>) -> Result<Self, ServerError> {
        Self::bind(SocketAddr::from(([127, 0, 0, 1], 0)), registry).await
    }

    /// Start on a specific address.
    pub async fn bind(addr: SocketAddr, registry: Arc<StubRegistry>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let app = router(Arc::clone(&registry));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            let shutdown = async {
                shutdown_rx.await.ok();
            };
            if let Err(error) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(%error, "Mock server terminated");
            }
        });

        info!(%addr, "Mock server listening");
        Ok(Self {
            addr,
            registry,
            shutdown: Some(shutdown_tx),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    /// Base URI the application under test should be pointed at.
    pub fn uri(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn registry(&self) -> &Arc<StubRegistry> {
        &self.registry
    }
}

impl Drop for HeldMockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// `/__held` is reserved for the control surface; everything else funnels
/// into the registry.
fn router(registry: Arc<StubRegistry>) -> Router {
    Router::new()
        .route("/__held/stats", get(stats))
        .route("/__held/release/:id", post(release))
        .fallback(dispatch)
        .with_state(registry)
}

async fn stats(State(registry): State<Arc<StubRegistry>>) -> Json<StatsSnapshot> {
    Json(registry.stats())
}

async fn release(State(registry): State<Arc<StubRegistry>>, Path(id): Path<String>) -> Response {
    if registry.release(&id).await {
        Json(serde_json::json!({"released": id})).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "unknown_stub", "id": id})),
        )
            .into_response()
    }
}

async fn dispatch(State(registry): State<Arc<StubRegistry>>, request: Request) -> Response {
    let captured = capture(request).await;
    debug!(
        method = %captured.method,
        path = %captured.path,
        "Intercepted request"
    );
    let reply = registry.dispatch(captured).await;
    into_response(reply)
}

async fn capture(request: Request) -> CapturedRequest {
    let (parts, body) = request.into_parts();
    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let bytes = to_bytes(body, BODY_LIMIT).await.unwrap_or_else(|_| Bytes::new());

    CapturedRequest {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers,
        body: if bytes.is_empty() {
            None
        } else {
            Some(bytes.to_vec())
        },
    }
}

fn into_response(reply: Reply) -> Response {
    let mut response = Response::builder()
        .status(StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    for (name, value) in &reply.headers {
        if is_framing_header(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (name.parse::<HeaderName>(), HeaderValue::from_str(value)) {
            response = response.header(name, value);
        }
    }
    response
        .body(Body::from(reply.body.unwrap_or_default()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Message-framing headers the transport computes itself.
fn is_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
}
