//! HTTP routes.

use super::admission::ViewerAdmission;
use super::auth::{require_basic_auth, Credentials};
use super::stream::{StreamBroadcaster, StreamSettings};
use crate::capture::{Frame, TargetState};
use crate::config::TempUnit;
use crate::metrics::Metrics;
use crate::sensor::Reading;
use crate::worker::WorkerStatus;
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Local;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

/// Errors that can occur while serving HTTP.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Shared state for the handlers.
#[derive(Clone)]
pub struct AppState {
    pub frames: watch::Receiver<Option<Frame>>,
    pub status: watch::Receiver<WorkerStatus>,
    pub admission: Arc<ViewerAdmission>,
    pub metrics: Arc<Metrics>,
    pub stream: StreamSettings,
    pub display_name: Arc<str>,
    pub unit: TempUnit,
}

/// Builds the router. Everything except `/health` needs credentials.
pub fn router(state: AppState, credentials: Credentials) -> Router {
    let protected = Router::new()
        .route("/", get(index_handler))
        .route("/stream", get(stream_handler))
        .route("/video_feed", get(stream_handler))
        .route("/status", get(status_handler))
        .route("/temp", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn_with_state(credentials, require_basic_auth));

    Router::new()
        .merge(protected)
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Serves until `shutdown` resolves and open connections finish.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "HTTP server listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn index_handler(State(state): State<AppState>) -> Html<String> {
    let name = escape_html(&state.display_name);
    Html(format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         <title>{name} Cam</title>\n</head>\n<body>\n\
         <h1>{name} Cam</h1>\n\
         <img src=\"/stream\" alt=\"Live feed\" style=\"max-width:100%\">\n\
         <p id=\"status\"></p>\n\
         <script>\n\
         async function refresh() {{\n\
           const r = await fetch('/status');\n\
           document.getElementById('status').textContent = await r.text();\n\
         }}\n\
         refresh();\nsetInterval(refresh, 5000);\n\
         </script>\n</body>\n</html>\n"
    ))
}

async fn stream_handler(State(state): State<AppState>) -> Response {
    let permit = match state.admission.try_acquire() {
        Ok(permit) => permit,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                format!("Max viewers reached ({}). Try again later.", e.capacity),
            )
                .into_response();
        }
    };

    let content_type = state.stream.content_type();
    let broadcaster = StreamBroadcaster::new(state.frames.clone(), state.stream.clone(), Arc::clone(&state.metrics));
    (
        [(header::CONTENT_TYPE, content_type)],
        [
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
        ],
        Body::from_stream(broadcaster.into_stream(permit)),
    )
        .into_response()
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.status.borrow().clone();
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        status_text(&state.display_name, &status, state.unit),
    )
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(output) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            output,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {}", e),
        ),
    }
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Plain-text status line for `/status`.
pub fn status_text(name: &str, status: &WorkerStatus, unit: TempUnit) -> String {
    if let Some(reading) = &status.reading {
        let at = reading.taken_at.with_timezone(&Local).format("%H:%M:%S");
        return format!("{name}: {} (as of {at})", reading_text(reading, unit));
    }
    if !status.running {
        return format!("{name}: temperature unavailable, capture worker is not running");
    }
    let sensor = status.hardware.map(|h| h.sensor);
    let detail = match sensor {
        None | Some(TargetState::Uninitialized | TargetState::Initializing) => "sensor starting up",
        Some(TargetState::Ready) => "sensor read failed, retrying",
        Some(TargetState::Failed) => "sensor failed to initialize",
        Some(TargetState::Absent) => "no sensor configured",
    };
    format!("{name}: temperature unavailable ({detail})")
}

fn reading_text(reading: &Reading, unit: TempUnit) -> String {
    let temp = match unit {
        TempUnit::Celsius => format!("{:.1}°C", reading.celsius),
        TempUnit::Fahrenheit => format!("{:.1}°F", reading.fahrenheit()),
    };
    match reading.humidity {
        Some(h) => format!("{temp}, {h:.0}% humidity"),
        None => temp,
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
