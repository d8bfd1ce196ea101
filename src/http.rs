//! HTTP adapter over the command gateway.
//!
//! Routes:
//! - `GET  /api/health`
//! - `POST /api/start-simulation` (body: run configuration object)
//! - `POST /api/stop-simulation`
//! - `GET  /api/status`
//! - `GET  /api/results/stream` (Server-Sent Events, one `fragment` event per result)

use std::convert::Infallible;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use serde_json::{Value, json};
use simrelay_core::{Acknowledgement, StatusSnapshot};
use simrelay_worker::gateway::INVALID_CONFIG;
use simrelay_worker::{Broker, CommandGateway};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub gateway: CommandGateway,
    pub broker: Arc<dyn Broker>,
    pub results_topic: String,
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/start-simulation", post(start_simulation))
        .route("/api/stop-simulation", post(stop_simulation))
        .route("/api/status", get(status))
        .route("/api/results/stream", get(results_stream))
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
///
/// Open result streams never end on their own, so connections are not
/// drained on shutdown.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP adapter listening");

    tokio::select! {
        result = axum::serve(listener, router(state)).into_future() => result?,
        () = shutdown => info!("HTTP adapter stopping"),
    }
    Ok(())
}

async fn health() -> impl IntoResponse {
    (
        [
            (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate, proxy-revalidate"),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        Json(json!({"status": "ok"})),
    )
}

async fn start_simulation(State(state): State<AppState>, body: Bytes) -> Response {
    // An empty body starts a run with an empty configuration
    let config = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Object(Default::default())
    } else {
        match serde_json::from_slice(&body) {
            Ok(config) => config,
            Err(e) => {
                debug!(error = %e, "start request body is not JSON");
                return ack_response(Acknowledgement::rejected(INVALID_CONFIG));
            }
        }
    };

    ack_response(state.gateway.request_start(config).await)
}

async fn stop_simulation(State(state): State<AppState>) -> Response {
    ack_response(state.gateway.request_stop())
}

async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.gateway.status())
}

async fn results_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.broker.subscribe(&state.results_topic);
    debug!(topic = %state.results_topic, "results stream opened");

    let stream = stream::unfold(subscription, |mut subscription| async move {
        let message = subscription.recv().await?;
        let event = Event::default()
            .event("fragment")
            .data(message.payload.to_string());
        Some((Ok(event), subscription))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

/// Map an acknowledgement to a response. Rejections are `409 Conflict`,
/// except a malformed configuration which is `400 Bad Request`.
fn ack_response(ack: Acknowledgement) -> Response {
    let code = match ack.reason.as_deref() {
        None => StatusCode::OK,
        Some(INVALID_CONFIG) => StatusCode::BAD_REQUEST,
        Some(_) => StatusCode::CONFLICT,
    };
    (code, Json(ack)).into_response()
}
