//! Downstream HTTP/WebSocket surface.
//!
//! One WebSocket endpoint for the browser UI (subscription frames in,
//! routed exchange frames out) plus the order-tracking REST routes used by
//! the signing flow: a successful sign+submit registers the order here and
//! gets the tracking id back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::hyperliquid::api::InfoClient;
use crate::messages::{ClientId, RouterCmd, TrackerCmd};
use crate::tracking::state_machine::{OrderContext, OrderType, TimeInForce};

/// Outbound frame buffer per client; a client that falls this far behind
/// is considered dead and evicted by the router.
const CLIENT_BUFFER: usize = 64;

#[derive(Clone)]
pub struct AppState {
    pub router_tx: mpsc::Sender<RouterCmd>,
    pub tracker_tx: mpsc::Sender<TrackerCmd>,
    pub api: Arc<InfoClient>,
    pub upstream_connected: Arc<AtomicBool>,
    pub chat_enabled: bool,
}

pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    let cors = cors_layer(cors_origins);
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .route("/orders", post(track_order))
        .route("/orders/:tracking_id", get(order_details).delete(stop_tracking))
        .route("/stats", get(stats))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: AppState, settings: &Settings) -> anyhow::Result<()> {
    let app = build_router(state, &settings.cors_origins);
    let addr = settings.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🚀 Listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        )
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
}

// ─────────────────────────────────────────────────────────
// WebSocket endpoint
// ─────────────────────────────────────────────────────────

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let client: ClientId = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<String>(CLIENT_BUFFER);

    if state
        .router_tx
        .send(RouterCmd::Register {
            client,
            tx: tx.clone(),
        })
        .await
        .is_err()
    {
        warn!("Router unavailable — closing client socket");
        return;
    }
    let _ = tx
        .try_send(json!({"type": "connected", "message": "Connected to hl-relay stream"}).to_string());

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Single writer: everything outbound funnels through the mpsc.
    let forward = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => match parse_client_message(client, &text) {
                Ok(cmd) => {
                    if state.router_tx.send(cmd).await.is_err() {
                        break;
                    }
                }
                Err(error) => {
                    debug!("Bad client frame: {error}");
                    let _ = tx.try_send(json!({"error": error}).to_string());
                }
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!("Client socket error: {e}");
                break;
            }
            _ => {}
        }
    }

    let _ = state.router_tx.send(RouterCmd::Disconnect { client }).await;
    forward.abort();
}

// ─────────────────────────────────────────────────────────
// Client frame dispatch
// ─────────────────────────────────────────────────────────

fn default_interval() -> String {
    "1h".to_string()
}

#[derive(Debug, Deserialize)]
struct UserDataPayload {
    #[serde(rename = "userAddress")]
    user_address: String,
}

#[derive(Debug, Deserialize)]
struct CandlePayload {
    coin: String,
    #[serde(default = "default_interval")]
    interval: String,
}

#[derive(Debug, Deserialize)]
struct UnsubscribePayload {
    subscription: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientRequest {
    SubscribeUserData { payload: UserDataPayload },
    UnsubscribeUserData { payload: UserDataPayload },
    SubscribeCandles { payload: CandlePayload },
    Unsubscribe { payload: UnsubscribePayload },
}

fn parse_client_message(client: ClientId, text: &str) -> Result<RouterCmd, &'static str> {
    let value: Value = serde_json::from_str(text).map_err(|_| "Invalid JSON")?;
    let request: ClientRequest =
        serde_json::from_value(value).map_err(|_| "Unknown message type")?;
    Ok(match request {
        ClientRequest::SubscribeUserData { payload } => RouterCmd::SubscribeUser {
            client,
            user: payload.user_address,
        },
        ClientRequest::UnsubscribeUserData { payload } => RouterCmd::UnsubscribeUser {
            client,
            user: payload.user_address,
        },
        ClientRequest::SubscribeCandles { payload } => RouterCmd::SubscribeCandle {
            client,
            coin: payload.coin,
            interval: payload.interval,
        },
        ClientRequest::Unsubscribe { payload } => RouterCmd::UnsubscribeRaw {
            client,
            subscription: payload.subscription,
        },
    })
}

// ─────────────────────────────────────────────────────────
// Order tracking routes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TrackOrderRequest {
    #[serde(rename = "userAddress", alias = "user_address")]
    user_address: String,
    asset_index: u32,
    is_buy: bool,
    price: Decimal,
    size: Decimal,
    #[serde(default)]
    order_type: Option<OrderType>,
    #[serde(default)]
    time_in_force: Option<TimeInForce>,
    #[serde(default)]
    exchange_order_id: Option<String>,
}

async fn track_order(
    State(state): State<AppState>,
    Json(req): Json<TrackOrderRequest>,
) -> impl IntoResponse {
    let tracking_id = Uuid::new_v4().to_string();
    let mut context = OrderContext::new(
        tracking_id.clone(),
        req.user_address,
        req.asset_index,
        req.is_buy,
        req.price,
        req.size,
        req.order_type.unwrap_or(OrderType::Limit),
        req.time_in_force.unwrap_or(TimeInForce::Gtc),
    );
    context.exchange_order_id = req.exchange_order_id;

    let (reply_tx, reply_rx) = oneshot::channel();
    let cmd = TrackerCmd::Track {
        context,
        reply: reply_tx,
    };
    if state.tracker_tx.send(cmd).await.is_err() {
        return service_unavailable("order tracking is not running");
    }
    match reply_rx.await {
        Ok(true) => (
            StatusCode::OK,
            Json(json!({"success": true, "tracking_id": tracking_id})),
        ),
        Ok(false) => service_unavailable("tracker rejected the order (at capacity or duplicate)"),
        Err(_) => service_unavailable("order tracking is not running"),
    }
}

async fn order_details(
    State(state): State<AppState>,
    Path(tracking_id): Path<String>,
) -> impl IntoResponse {
    let (reply_tx, reply_rx) = oneshot::channel();
    let cmd = TrackerCmd::Details {
        tracking_id,
        reply: reply_tx,
    };
    if state.tracker_tx.send(cmd).await.is_err() {
        return service_unavailable("order tracking is not running");
    }
    match reply_rx.await {
        Ok(Some(details)) => (StatusCode::OK, Json(details)),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": "order not tracked"})),
        ),
        Err(_) => service_unavailable("order tracking is not running"),
    }
}

async fn stop_tracking(
    State(state): State<AppState>,
    Path(tracking_id): Path<String>,
) -> impl IntoResponse {
    let (reply_tx, reply_rx) = oneshot::channel();
    let cmd = TrackerCmd::StopTracking {
        tracking_id,
        reason: "stopped via api".to_string(),
        reply: reply_tx,
    };
    if state.tracker_tx.send(cmd).await.is_err() {
        return service_unavailable("order tracking is not running");
    }
    match reply_rx.await {
        Ok(true) => (StatusCode::OK, Json(json!({"success": true}))),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": "order not tracked"})),
        ),
        Err(_) => service_unavailable("order tracking is not running"),
    }
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let tracker = {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = TrackerCmd::Stats { reply: reply_tx };
        if state.tracker_tx.send(cmd).await.is_ok() {
            reply_rx.await.unwrap_or(Value::Null)
        } else {
            Value::Null
        }
    };
    Json(json!({
        "tracker": tracker,
        "api_client": state.api.statistics(),
    }))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "hl-relay",
        "upstream_connected": state.upstream_connected.load(Ordering::Acquire),
        "chat_enabled": state.chat_enabled,
        "circuit_breaker": state.api.breaker_state().as_str(),
    }))
}

fn service_unavailable(detail: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"success": false, "error": detail})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientId {
        Uuid::new_v4()
    }

    #[test]
    fn test_parse_subscribe_user_data() {
        let cmd = parse_client_message(
            client(),
            r#"{"type": "subscribe_user_data", "payload": {"userAddress": "0xAB"}}"#,
        )
        .unwrap();
        assert!(matches!(
            cmd,
            RouterCmd::SubscribeUser { user, .. } if user == "0xAB"
        ));
    }

    #[test]
    fn test_parse_candles_defaults_interval() {
        let cmd = parse_client_message(
            client(),
            r#"{"type": "subscribe_candles", "payload": {"coin": "ETH"}}"#,
        )
        .unwrap();
        assert!(matches!(
            cmd,
            RouterCmd::SubscribeCandle { coin, interval, .. } if coin == "ETH" && interval == "1h"
        ));
    }

    #[test]
    fn test_parse_unsubscribe_forwards_raw_subscription() {
        let cmd = parse_client_message(
            client(),
            r#"{"type": "unsubscribe", "payload": {"subscription": {"type": "candle", "coin": "ETH", "interval": "1h"}}}"#,
        )
        .unwrap();
        assert!(matches!(cmd, RouterCmd::UnsubscribeRaw { .. }));
    }

    #[test]
    fn test_parse_rejects_unknown_and_invalid() {
        let unknown = parse_client_message(client(), r#"{"type": "make_coffee", "payload": {}}"#);
        assert_eq!(unknown.unwrap_err(), "Unknown message type");
        let garbage = parse_client_message(client(), "not json");
        assert_eq!(garbage.unwrap_err(), "Invalid JSON");
    }
}
