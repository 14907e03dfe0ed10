//! Thin HTTP front-end over the market engine.
//!
//! Parses inbound requests, invokes the engine, and renders the outbound
//! result shape (`ok` / `error_kind`). Cash renders at 2 decimal places
//! and shares at 4; all rounding happens here, never in the engine.
//! Retryable store errors get a short bounded retry with backoff.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::events::MarketEvent;
use crate::lmsr::{from_cash, Side};
use crate::pg_store::PgStore;
use crate::store::{Market, NewMarket, Outcome, TransferKind};

const MAX_RETRY_ATTEMPTS: u32 = 3;
const BASE_RETRY_DELAY_MS: u64 = 10;

type ApiError = (StatusCode, Json<Value>);
type ApiResult = Result<Json<Value>, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine<PgStore>>,
    pub admin_token: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health_check))
        .route("/markets", get(list_markets).post(create_market))
        .route("/markets/:id", get(get_market).delete(delete_market))
        .route("/markets/:id/buy", post(buy))
        .route("/markets/:id/sell", post(sell))
        .route("/markets/:id/resolve", post(resolve))
        .route("/markets/:id/redeem", post(redeem))
        .route("/users/:id/balance", get(get_balance))
        .route("/users/:id/positions", get(get_positions))
        .route("/transfers", post(transfer))
        .route("/ws", get(ws_handler))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

// -----------------------
// Request shapes
// -----------------------

#[derive(Debug, Deserialize)]
struct CreateMarketRequest {
    id: String,
    question: String,
    details: Option<String>,
    subject: Option<String>,
    creator: Option<String>,
    b: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BuyRequest {
    user_id: String,
    side: Side,
    amount: f64,
}

#[derive(Debug, Deserialize)]
struct SellRequest {
    user_id: String,
    side: Side,
    percent: f64,
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    outcome: Outcome,
}

#[derive(Debug, Deserialize)]
struct RedeemRequest {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct TransferRequest {
    kind: TransferKind,
    from: Option<String>,
    to: Option<String>,
    amount: f64,
}

// -----------------------
// Handlers
// -----------------------

async fn service_info() -> Json<Value> {
    Json(json!({
        "service": "market-engine",
        "status": "running",
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn list_markets(State(state): State<AppState>) -> ApiResult {
    let markets = state.engine.markets().await.map_err(error_response)?;
    let markets: Vec<Value> = markets.iter().map(market_json).collect();
    Ok(Json(json!({ "ok": true, "markets": markets })))
}

async fn get_market(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let market = state.engine.market(&id).await.map_err(error_response)?;
    Ok(Json(json!({ "ok": true, "market": market_json(&market) })))
}

async fn create_market(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateMarketRequest>,
) -> ApiResult {
    let admin = is_admin(&headers, &state.admin_token);
    let new = NewMarket {
        id: req.id,
        question: req.question,
        details: req.details,
        subject: req.subject,
        creator: req.creator,
        b: req.b.unwrap_or(state.engine.config().default_b),
    };
    let market = state
        .engine
        .create_market(new, admin)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "ok": true, "market": market_json(&market) })))
}

async fn delete_market(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let admin = is_admin(&headers, &state.admin_token);
    state
        .engine
        .delete_market(&id, admin)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "ok": true })))
}

async fn buy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<BuyRequest>,
) -> ApiResult {
    let receipt = with_retry(|| state.engine.execute_buy(&id, &req.user_id, req.side, req.amount))
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "ok": true,
        "market_id": receipt.market_id,
        "side": receipt.side,
        "shares_delta": round4(receipt.shares_delta),
        "amount": round2(from_cash(receipt.amount)),
        "price": round4(receipt.price),
        "new_price": round4(receipt.new_price),
        "balance": round2(from_cash(receipt.balance)),
    })))
}

async fn sell(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SellRequest>,
) -> ApiResult {
    let receipt =
        with_retry(|| state.engine.execute_sell(&id, &req.user_id, req.side, req.percent))
            .await
            .map_err(error_response)?;
    Ok(Json(json!({
        "ok": true,
        "market_id": receipt.market_id,
        "side": receipt.side,
        "shares_delta": round4(receipt.shares_delta),
        "payout": round2(from_cash(receipt.amount)),
        "price": round4(receipt.price),
        "new_price": round4(receipt.new_price),
        "balance": round2(from_cash(receipt.balance)),
    })))
}

async fn resolve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ResolveRequest>,
) -> ApiResult {
    let admin = is_admin(&headers, &state.admin_token);
    let summary = state
        .engine
        .resolve(&id, req.outcome, admin)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "ok": true,
        "market_id": summary.market_id,
        "question": summary.question,
        "outcome": summary.outcome,
        "implied_odds": round4(summary.implied_odds),
        "total_paid": round2(from_cash(summary.total_paid)),
        "total_lost_shares": round4(summary.total_lost_shares),
    })))
}

async fn redeem(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RedeemRequest>,
) -> ApiResult {
    let receipt = with_retry(|| state.engine.redeem(&id, &req.user_id))
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "ok": true,
        "market_id": receipt.market_id,
        "outcome": receipt.outcome,
        "shares_redeemed": round4(receipt.shares_redeemed),
        "payout": round2(from_cash(receipt.payout)),
    })))
}

async fn get_balance(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let balance = state.engine.balance(&id).await.map_err(error_response)?;
    Ok(Json(json!({
        "ok": true,
        "account": balance.account,
        "balance": round2(from_cash(balance.cash)),
        "volume_traded": round2(balance.volume_traded),
        "volume_resolved": round2(balance.volume_resolved),
    })))
}

async fn get_positions(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let positions = state.engine.positions(&id).await.map_err(error_response)?;
    let positions: Vec<Value> = positions
        .iter()
        .map(|p| {
            json!({
                "market_id": p.market,
                "side": p.side,
                "shares": round4(p.shares),
                "cost_basis": round2(from_cash(p.cost_basis)),
                "last_trade": p.last_trade,
            })
        })
        .collect();
    Ok(Json(json!({ "ok": true, "positions": positions })))
}

async fn transfer(State(state): State<AppState>, Json(req): Json<TransferRequest>) -> ApiResult {
    let balance = with_retry(|| async {
        match (req.kind, req.from.as_deref(), req.to.as_deref()) {
            (TransferKind::Deposit, None, Some(to)) => state.engine.deposit(to, req.amount).await,
            (TransferKind::Withdrawal, Some(from), None) => {
                state.engine.withdraw(from, req.amount).await
            }
            (TransferKind::Transfer, Some(from), Some(to)) => {
                state.engine.transfer(from, to, req.amount).await
            }
            _ => Err(EngineError::InvalidAmount),
        }
    })
    .await
    .map_err(error_response)?;
    Ok(Json(json!({
        "ok": true,
        "account": balance.account,
        "balance": round2(from_cash(balance.cash)),
    })))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let rx = state.engine.events().subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, rx))
}

async fn stream_events(socket: WebSocket, mut rx: broadcast::Receiver<MarketEvent>) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "websocket subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = stream.next() => match msg {
                Some(Ok(_)) => {} // inbound frames are ignored
                _ => break,
            },
        }
    }
}

// -----------------------
// Helpers
// -----------------------

/// Bounded retry for the retryable store errors; everything else
/// returns immediately. The engine guarantees retry safety.
async fn with_retry<T, F, Fut>(op: F) -> Result<T, EngineError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, EngineError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < MAX_RETRY_ATTEMPTS => {
                let jitter = rand::thread_rng().gen_range(0..10);
                let delay_ms = BASE_RETRY_DELAY_MS * (1 << (attempt - 1)) + jitter;
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
            other => break other,
        }
    }
}

fn is_admin(headers: &HeaderMap, admin_token: &Option<String>) -> bool {
    let Some(token) = admin_token else {
        return false;
    };
    headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == token)
        .unwrap_or(false)
}

fn market_json(m: &Market) -> Value {
    json!({
        "market_id": m.id,
        "question": m.question,
        "details": m.details,
        "subject": m.subject,
        "creator": m.creator,
        "b": m.b,
        "yes_shares": round4(m.yes_shares),
        "no_shares": round4(m.no_shares),
        "resolved": m.resolved,
        "resolution": m.resolution,
        "resolution_date": m.resolution_date,
        "implied_odds": round4(m.implied_odds),
        "volume_traded": round2(m.volume_traded),
        "last_trade": m.last_trade,
    })
}

fn error_response(e: EngineError) -> ApiError {
    let status = match e {
        EngineError::MarketNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::MarketExists(_)
        | EngineError::MarketAlreadyResolved(_)
        | EngineError::MarketStillOpen(_)
        | EngineError::InsufficientCash
        | EngineError::InsufficientShares => StatusCode::CONFLICT,
        EngineError::InvalidAmount | EngineError::InvalidPercent => StatusCode::BAD_REQUEST,
        EngineError::Unauthorized => StatusCode::UNAUTHORIZED,
        EngineError::StoreConflict | EngineError::StoreUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    (status, Json(json!({ "ok": false, "error_kind": e.kind() })))
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}
