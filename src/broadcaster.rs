//! AlertBroadcaster: fans the pub/sub alert channel out to connected
//! WebSocket clients, plus the `/healthz` and `/readyz` health surface.

use std::sync::Arc;
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{BoxError, Json, Router};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tower::timeout::TimeoutLayer;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::metrics::Metrics;
use crate::pubsub::PubSub;
use crate::types::AlertRecord;

const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const PING_INTERVAL: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct BroadcasterState {
    pub pubsub: Arc<dyn PubSub>,
    pub metrics: Arc<Metrics>,
    pub client_queue_len: usize,
}

/// `TimeoutLayer` only bounds the upgrade handshake, not the long-lived
/// socket: `ws_handler` returns as soon as the upgrade response is ready,
/// and `handle_socket` runs afterward in its own task.
pub fn router(state: BroadcasterState) -> Router {
    Router::new()
        .route("/ws/alerts", get(ws_handler))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_timeout_error))
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        )
        .with_state(state)
}

async fn handle_timeout_error(err: BoxError) -> impl IntoResponse {
    if err.is::<tower::timeout::error::Elapsed>() {
        (StatusCode::REQUEST_TIMEOUT, "request timed out").into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("unhandled error: {err}")).into_response()
    }
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(State(state): State<BroadcasterState>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot();
    if snapshot.fully_healthy() {
        (StatusCode::OK, Json(snapshot)).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(snapshot)).into_response()
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<BroadcasterState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One connection, one subscription: no replay of alerts that happened
/// before the client connected, matching the contract.
async fn handle_socket(socket: WebSocket, state: BroadcasterState) {
    let (mut sender, mut receiver) = socket.split();
    let mut alerts = state.pubsub.subscribe();
    let metrics = state.metrics.clone();
    let mut queued = 0usize;
    let client_queue_len = state.client_queue_len;

    info!("websocket client connected");

    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = ping_timer.tick() => {
                if write_with_timeout(&mut sender, Message::Ping(Vec::new())).await.is_err() {
                    debug!("websocket client failed ping liveness check, closing");
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if text != "ping" {
                            debug!("ignoring unrecognised client message: {}", text);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("websocket read error: {}", e);
                        break;
                    }
                }
            }
            received = alerts.recv() => {
                match received {
                    Ok(alert) => {
                        if queued >= client_queue_len {
                            metrics.ws_clients_dropped_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            warn!("websocket client exceeded queue capacity of {}, dropping", client_queue_len);
                            break;
                        }
                        queued += 1;
                        let frame = match serde_json::to_string(&*alert) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("failed to serialise alert for websocket client: {}", e);
                                queued -= 1;
                                continue;
                            }
                        };
                        if write_with_timeout(&mut sender, Message::Text(frame)).await.is_err() {
                            metrics.ws_clients_dropped_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            break;
                        }
                        queued = queued.saturating_sub(1);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("websocket client lagged behind alert stream, skipped {} messages", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    info!("websocket client disconnected");
}

async fn write_with_timeout(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    message: Message,
) -> Result<(), ()> {
    match timeout(CLIENT_WRITE_TIMEOUT, sender.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(()),
    }
}

#[allow(dead_code)]
fn assert_alert_serialises(alert: &AlertRecord) -> bool {
    serde_json::to_string(alert).is_ok()
}
