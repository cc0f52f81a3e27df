//! Fan-out read endpoints.
//!
//! Every handler is a pure read of the in-memory buffer and connection
//! health; nothing here ever touches the upstream connection or blocks on
//! network I/O, so the endpoints stay responsive for unbounded concurrent
//! callers even while the feed is down. A disconnected feed serves the
//! last-known buffer contents with `isConnected: false` so consumers can
//! tell "stale" from "empty".

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Side, TradeRecord};
use crate::runtime::FeedRuntime;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<FeedRuntime>,
}

/// Create the API router
pub fn create_router(runtime: Arc<FeedRuntime>) -> Router {
    let state = AppState { runtime };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/trades", get(get_trades))
        .route("/api/trades/stats", get(get_trade_stats))
        .route("/api/admin", post(post_admin))
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct TradeQuery {
    pub limit: Option<usize>,
    pub symbol: Option<String>,
    pub side: Option<String>,
    pub min_notional: Option<f64>,
    /// When true, return only the connection-health summary.
    pub health: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthOnlyResponse {
    pub healthy: bool,
    pub state: &'static str,
    pub last_message_ago_ms: Option<i64>,
    pub total_records_seen: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradesResponse {
    pub is_connected: bool,
    pub records: Vec<TradeRecord>,
    pub count: usize,
    pub timestamp: String,
    pub last_message_ago_ms: Option<i64>,
    pub total_ever_seen: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn last_message_ago_ms(last_message_at_ms: i64, now_ms: i64) -> Option<i64> {
    if last_message_at_ms > 0 {
        Some((now_ms - last_message_at_ms).max(0))
    } else {
        None
    }
}

/// Recent trades with optional filters, or the health summary.
async fn get_trades(
    Query(params): Query<TradeQuery>,
    State(state): State<AppState>,
) -> Response {
    let now_ms = Utc::now().timestamp_millis();
    let health = state.runtime.health.snapshot();

    if params.health.unwrap_or(false) {
        return Json(HealthOnlyResponse {
            healthy: health.is_connected(),
            state: health.state.as_str(),
            last_message_ago_ms: last_message_ago_ms(health.last_message_at_ms, now_ms),
            total_records_seen: health.total_records_seen,
        })
        .into_response();
    }

    let requested_limit = params.limit.unwrap_or(50).clamp(1, 1000);
    let side_filter = params.side.as_deref().and_then(Side::parse);
    let has_filters =
        params.symbol.is_some() || side_filter.is_some() || params.min_notional.is_some();

    // When filtering, over-fetch so the caller still gets a full page after
    // the filter is applied.
    let fetch_limit = if has_filters {
        (requested_limit * 10).min(state.runtime.buffer.capacity())
    } else {
        requested_limit
    };

    let mut records = state.runtime.buffer.snapshot(fetch_limit);

    if let Some(symbol) = params.symbol.as_deref() {
        records.retain(|r| r.symbol.eq_ignore_ascii_case(symbol));
    }
    if let Some(side) = side_filter {
        records.retain(|r| r.side == side);
    }
    if let Some(min_notional) = params.min_notional {
        records.retain(|r| r.notional >= min_notional);
    }
    records.truncate(requested_limit);

    Json(TradesResponse {
        is_connected: health.is_connected(),
        count: records.len(),
        records,
        timestamp: Utc::now().to_rfc3339(),
        last_message_ago_ms: last_message_ago_ms(health.last_message_at_ms, now_ms),
        total_ever_seen: health.total_records_seen,
    })
    .into_response()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeStatsResponse {
    pub durable_rows: usize,
    pub durable_total_ever: i64,
    pub total_records_seen: u64,
    pub records_rejected: u64,
    pub whale_count: u64,
    pub timestamp: String,
}

/// Aggregate counters from the durable store and the ingest path.
async fn get_trade_stats(State(state): State<AppState>) -> Json<TradeStatsResponse> {
    let health = state.runtime.health.snapshot();

    Json(TradeStatsResponse {
        durable_rows: state.runtime.store.len(),
        durable_total_ever: state.runtime.store.total_trades_ever().unwrap_or(0),
        total_records_seen: health.total_records_seen,
        records_rejected: health.records_rejected,
        whale_count: state.runtime.writer.whale_count(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Deserialize)]
pub struct AdminRequest {
    pub action: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminAckResponse {
    pub ok: bool,
    pub action: String,
    pub message: String,
    pub request_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStatusResponse {
    pub ok: bool,
    pub state: &'static str,
    pub reconnect_attempts: u32,
    pub last_message_ago_ms: Option<i64>,
    pub buffer_len: usize,
    pub pending_write_queue_depth: usize,
    pub total_records_seen: u64,
    pub records_rejected: u64,
    pub whale_count: u64,
    pub request_id: String,
}

/// Operator actions: force a reconnect, or report subsystem status
/// (including the pending-write queue depth, the metric to alarm on when the
/// durable store falls behind).
async fn post_admin(
    State(state): State<AppState>,
    Json(req): Json<AdminRequest>,
) -> Response {
    let request_id = Uuid::new_v4().to_string();

    match req.action.as_str() {
        "reconnect" => {
            warn!(request_id = %request_id, "operator requested feed reconnect");
            state.runtime.manager.force_reconnect();
            Json(AdminAckResponse {
                ok: true,
                action: req.action,
                message: "reconnect requested".to_string(),
                request_id,
            })
            .into_response()
        }
        "status" => {
            let now_ms = Utc::now().timestamp_millis();
            let health = state.runtime.health.snapshot();
            Json(AdminStatusResponse {
                ok: true,
                state: health.state.as_str(),
                reconnect_attempts: health.reconnect_attempts,
                last_message_ago_ms: last_message_ago_ms(health.last_message_at_ms, now_ms),
                buffer_len: state.runtime.buffer.len(),
                pending_write_queue_depth: state.runtime.writer.queue_depth(),
                total_records_seen: health.total_records_seen,
                records_rejected: health.records_rejected,
                whale_count: state.runtime.writer.whale_count(),
                request_id,
            })
            .into_response()
        }
        other => (
            StatusCode::BAD_REQUEST,
            Json(AdminAckResponse {
                ok: false,
                action: other.to_string(),
                message: "unknown action (expected reconnect|status)".to_string(),
                request_id,
            }),
        )
            .into_response(),
    }
}

/// WebSocket push for dashboards that prefer streaming over polling.
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut live_rx = state.runtime.subscribe_live();

    // On connect, immediately replay recent history so the UI isn't empty,
    // oldest first so the client renders in order.
    let replay = state
        .runtime
        .buffer
        .snapshot(state.runtime.config.ws_replay_limit);
    for record in replay.into_iter().rev() {
        let msg = serde_json::to_string(&record).unwrap_or_else(|_| "{}".to_string());
        if socket.send(Message::Text(msg)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            live = live_rx.recv() => {
                match live {
                    Ok(record) => {
                        let msg = serde_json::to_string(&record)
                            .unwrap_or_else(|_| "{}".to_string());
                        if socket.send(Message::Text(msg)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Slow consumer: it missed `skipped` records, but the
                        // ingest path never waited for it.
                        debug!(skipped, "ws consumer lagged behind live feed");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if text == "ping" {
                            let _ = socket.send(Message::Text("pong".to_string())).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}
