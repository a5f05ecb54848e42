//! Metrics and health HTTP server.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::metrics::Metrics;
use crate::shutdown::wait_for_shutdown;

#[derive(Clone)]
pub struct MonitorState {
    pub metrics: Arc<Metrics>,
    /// Flips to `true` when a termination signal arrives.
    pub draining: watch::Receiver<bool>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok" or "draining".
    pub status: String,
}

/// Build the monitor router.
///
/// With `keepalive` off every response carries `Connection: close`.
pub fn router(state: MonitorState, keepalive: bool) -> Router {
    let router = Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .with_state(state);

    if keepalive {
        router
    } else {
        router.layer(middleware::map_response(close_connection))
    }
}

/// Serve until `shutdown` flips to `true`.
pub async fn serve(
    listener: TcpListener,
    state: MonitorState,
    keepalive: bool,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "monitor server listening");
    }

    axum::serve(listener, router(state, keepalive))
        .with_graceful_shutdown(async move {
            let mut shutdown = shutdown;
            wait_for_shutdown(&mut shutdown).await;
            info!("monitor server shutting down");
        })
        .await
}

async fn metrics(State(state): State<MonitorState>) -> Response {
    match state.metrics.render() {
        Ok((content_type, body)) => {
            let content_type = HeaderValue::from_str(&content_type).unwrap_or_else(|_| {
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8")
            });
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(e) => {
            error!(error = %e, "failed to encode prometheus metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn healthz(State(state): State<MonitorState>) -> impl IntoResponse {
    if *state.draining.borrow() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "draining".to_string(),
            }),
        )
    } else {
        (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok".to_string(),
            }),
        )
    }
}

async fn close_connection(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}
