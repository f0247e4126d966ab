//! HTTP server for the Prometheus metrics endpoint and client certificates.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use mqtt_iot_exporter_core::SharedRegistry;
use tokio::sync::watch;
use tracing::{error, info};

use crate::certs::ClientCertIssuer;
use crate::exposition;
use crate::stats::SharedStats;

/// Path of the client certificate endpoint.
pub const CLIENT_CERT_PATH: &str = "/api/get-client-cert";

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    registry: SharedRegistry,
    stats: SharedStats,
    issuer: Option<Arc<ClientCertIssuer>>,
}

/// Create the HTTP router.
fn create_router(
    registry: SharedRegistry,
    stats: SharedStats,
    issuer: Option<ClientCertIssuer>,
    metrics_path: &str,
) -> Router {
    let state = AppState {
        registry,
        stats,
        issuer: issuer.map(Arc::new),
    };

    Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/health", get(health_handler))
        .route(CLIENT_CERT_PATH, get(client_cert_handler))
        .with_state(state)
}

/// Handler for the metrics endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let families = state.registry.snapshot();
    let body = exposition::render(&families, &state.stats.snapshot());

    (
        StatusCode::OK,
        [("content-type", exposition::CONTENT_TYPE)],
        body,
    )
        .into_response()
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Handler for the client certificate endpoint.
async fn client_cert_handler(State(state): State<AppState>) -> Response {
    let Some(issuer) = state.issuer else {
        return (StatusCode::FORBIDDEN, "Client key generation is disabled\n").into_response();
    };

    match tokio::task::spawn_blocking(move || issuer.issue()).await {
        Ok(Ok(bundle)) => {
            info!("Issued client certificate");
            (StatusCode::OK, [("content-type", "text/plain")], bundle).into_response()
        }
        Ok(Err(e)) => {
            error!(error = %e, "Failed to issue client certificate");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to generate client certificate\n",
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "Certificate task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// HTTP server configuration.
pub struct HttpServer {
    registry: SharedRegistry,
    stats: SharedStats,
    issuer: Option<ClientCertIssuer>,
    listen_addr: SocketAddr,
    metrics_path: String,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(
        registry: SharedRegistry,
        stats: SharedStats,
        listen_addr: SocketAddr,
        metrics_path: String,
    ) -> Self {
        Self {
            registry,
            stats,
            issuer: None,
            listen_addr,
            metrics_path,
        }
    }

    /// Serve client certificates from `issuer`.
    pub fn with_issuer(mut self, issuer: Option<ClientCertIssuer>) -> Self {
        self.issuer = issuer;
        self
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let issuance = self.issuer.is_some();
        let router = create_router(self.registry, self.stats, self.issuer, &self.metrics_path);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(
            addr = %self.listen_addr,
            path = %self.metrics_path,
            client_cert_issuance = issuance,
            "HTTP server listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}
