use std::net::SocketAddr;
use std::sync::Arc;

use amm_engine::cache::CacheHooks;
use amm_engine::config::Config;
use amm_engine::execution::{self, BuyRequest, SellRequest, SellSize};
use amm_engine::quote::{self, QuoteRequest, SizeSpec};
use amm_engine::settlement;
use amm_engine::state::OptionSelector;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{sink::SinkExt, stream::StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    db: PgPool,
    cache: CacheHooks,
    config: Arc<Config>,
    tx: broadcast::Sender<String>,
}

type ApiResult<T> = Result<Json<T>, (axum::http::StatusCode, Json<Value>)>;

fn engine_error_response(err: anyhow::Error) -> (axum::http::StatusCode, Json<Value>) {
    if let Some(engine_err) = err.downcast_ref::<amm_engine::error::EngineError>() {
        let status = axum::http::StatusCode::from_u16(engine_err.http_status())
            .unwrap_or(axum::http::StatusCode::BAD_REQUEST);
        return (status, Json(json!({ "error": { "code": engine_err.code, "message": engine_err.message } })));
    }
    error!(error = %err, "unhandled engine error");
    (
        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": { "code": "INTERNAL", "message": "internal server error" } })),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter("info,amm_engine=debug").init();

    info!("starting amm trading engine");

    let config = Config::from_env();
    config.print_config();

    let pool = amm_engine::db::create_pool(&config.db.database_url, config.db.max_connections).await?;
    let cache = CacheHooks::local(Arc::new(amm_engine::cache::LocalCache::new()));
    let (tx, _rx) = broadcast::channel::<String>(256);

    let app_state = AppState { db: pool, cache, config: Arc::new(config), tx };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/markets/:market_id/quote", post(quote_handler))
        .route("/markets/:market_id/buy", post(buy_handler))
        .route("/markets/:market_id/sell", post(sell_handler))
        .route("/markets/:market_id/resolve", post(resolve_handler))
        .route("/markets/:market_id/settle", post(settle_handler))
        .route("/markets/:market_id/resolve_and_settle", post(resolve_and_settle_handler))
        .route("/markets/:market_id/resolve_and_settle_partial", post(resolve_and_settle_partial_handler))
        .route("/ws", get(websocket_handler))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 3001));
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": "amm-engine" }))
}

#[derive(Deserialize)]
struct QuoteBody {
    option_id: Option<i64>,
    option_index: Option<i32>,
    side: String,
    amount: Option<Decimal>,
    shares: Option<Decimal>,
    money_quant: Option<Decimal>,
    is_no_side: Option<bool>,
}

fn selector_from(option_id: Option<i64>, option_index: Option<i32>) -> Result<OptionSelector, (axum::http::StatusCode, Json<Value>)> {
    match (option_id, option_index) {
        (Some(id), _) => Ok(OptionSelector::Id(id)),
        (None, Some(idx)) => Ok(OptionSelector::Index(idx)),
        (None, None) => Err((
            axum::http::StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "code": "INVALID_PARAM", "message": "option_id or option_index is required" } })),
        )),
    }
}

#[derive(Serialize)]
struct QuoteResponse {
    option_id: i64,
    amount: Decimal,
    shares: Decimal,
    fee_amount: Decimal,
    avg_price_bps: i32,
    pre_prob_bps: Vec<i32>,
    post_prob_bps: Vec<i32>,
}

async fn quote_handler(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Json(body): Json<QuoteBody>,
) -> ApiResult<QuoteResponse> {
    let selector = selector_from(body.option_id, body.option_index)?;
    let side = match body.side.as_str() {
        "buy" => quote::Side::Buy,
        "sell" => quote::Side::Sell,
        _ => {
            return Err((
                axum::http::StatusCode::BAD_REQUEST,
                Json(json!({ "error": { "code": "INVALID_PARAM", "message": "side must be buy or sell" } })),
            ))
        }
    };
    let size = match (body.amount, body.shares) {
        (Some(a), None) => SizeSpec::Amount(a),
        (None, Some(s)) => SizeSpec::Shares(s),
        _ => {
            return Err((
                axum::http::StatusCode::BAD_REQUEST,
                Json(json!({ "error": { "code": "INVALID_PARAM", "message": "exactly one of amount or shares is required" } })),
            ))
        }
    };

    let pool_state = load_pool_state_for_quote(&state.db, market_id)
        .await
        .map_err(engine_error_response)?;
    let money_quant = body.money_quant.unwrap_or(state.config.engine.money_quant);
    let req = QuoteRequest { selector, side, size, money_quant, is_no_side: body.is_no_side.unwrap_or(false) };
    let q = quote::quote_from_state(&pool_state, &req).map_err(|e| engine_error_response(e.into()))?;

    Ok(Json(QuoteResponse {
        option_id: q.option_id,
        amount: q.amount,
        shares: q.shares,
        fee_amount: q.fee_amount,
        avg_price_bps: q.avg_price_bps,
        pre_prob_bps: q.pre_prob_bps,
        post_prob_bps: q.post_prob_bps,
    }))
}

async fn load_pool_state_for_quote(pool: &PgPool, market_id: i64) -> anyhow::Result<amm_engine::state::PoolState> {
    let pool_row = sqlx::query_as::<_, (i64, Decimal, i32, bool)>(
        "SELECT ap.id, ap.b, ap.fee_bps, (m.event_id IS NOT NULL) as is_exclusive
         FROM amm_pools ap JOIN markets m ON m.id = ap.market_id WHERE ap.market_id = $1",
    )
    .bind(market_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| anyhow::anyhow!(amm_engine::error::pool_not_found(format!("no pool for market {market_id}"))))?;

    let rows = sqlx::query("SELECT option_id, option_index, q FROM amm_pool_option_state WHERE pool_id = $1 ORDER BY option_index, option_id")
        .bind(pool_row.0)
        .fetch_all(pool)
        .await?;
    let option_rows = rows
        .iter()
        .map(amm_engine::db_adapter::OptionStateRow::from_row)
        .collect::<anyhow::Result<Vec<_>>>()?;

    amm_engine::db_adapter::build_pool_state(
        market_id,
        pool_row.0,
        pool_row.1,
        pool_row.2,
        &option_rows,
        pool_row.3,
        Default::default(),
    )
}

#[derive(Deserialize)]
struct BuyBody {
    user_id: i64,
    option_id: Option<i64>,
    option_index: Option<i32>,
    amount_in: Decimal,
    token: Option<String>,
    wallet_id: Option<i64>,
    client_nonce: Option<String>,
    min_shares_out: Option<Decimal>,
    max_slippage_bps: Option<i32>,
}

async fn buy_handler(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Json(body): Json<BuyBody>,
) -> ApiResult<Value> {
    let selector = selector_from(body.option_id, body.option_index)?;
    let req = BuyRequest {
        user_id: body.user_id,
        market_id,
        selector,
        amount_in: body.amount_in,
        token: body.token,
        wallet_id: body.wallet_id,
        client_nonce: body.client_nonce,
        min_shares_out: body.min_shares_out,
        max_slippage_bps: body.max_slippage_bps,
    };
    let receipt = execution::execute_buy(&state.db, &state.cache, &state.config.engine, req)
        .await
        .map_err(engine_error_response)?;

    broadcast_trade(&state, market_id, &receipt);

    Ok(Json(json!({
        "option_id": receipt.option_id,
        "amount": receipt.amount,
        "shares": receipt.shares,
        "fee_amount": receipt.fee_amount,
        "avg_price_bps": receipt.avg_price_bps,
        "post_prob_bps": receipt.post_prob_bps,
        "order_intent_id": receipt.order_intent_id,
    })))
}

#[derive(Deserialize)]
struct SellBody {
    user_id: i64,
    option_id: Option<i64>,
    option_index: Option<i32>,
    shares: Option<Decimal>,
    amount_out: Option<Decimal>,
    sell_all: Option<bool>,
    token: Option<String>,
    wallet_id: Option<i64>,
    client_nonce: Option<String>,
    min_amount_out: Option<Decimal>,
}

async fn sell_handler(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Json(body): Json<SellBody>,
) -> ApiResult<Value> {
    let selector = selector_from(body.option_id, body.option_index)?;
    let size = if body.sell_all.unwrap_or(false) {
        SellSize::SellAll
    } else if let Some(shares) = body.shares {
        SellSize::Shares(shares)
    } else if let Some(amount_out) = body.amount_out {
        SellSize::DesiredAmountOut(amount_out)
    } else {
        return Err((
            axum::http::StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "code": "INVALID_PARAM", "message": "shares, amount_out, or sell_all is required" } })),
        ));
    };

    let req = SellRequest {
        user_id: body.user_id,
        market_id,
        selector,
        size,
        token: body.token,
        wallet_id: body.wallet_id,
        client_nonce: body.client_nonce,
        min_amount_out: body.min_amount_out,
    };
    let receipt = execution::execute_sell(&state.db, &state.cache, &state.config.engine, req)
        .await
        .map_err(engine_error_response)?;

    broadcast_trade(&state, market_id, &receipt);

    Ok(Json(json!({
        "option_id": receipt.option_id,
        "amount": receipt.amount,
        "shares": receipt.shares,
        "fee_amount": receipt.fee_amount,
        "avg_price_bps": receipt.avg_price_bps,
        "post_prob_bps": receipt.post_prob_bps,
        "order_intent_id": receipt.order_intent_id,
        "dust_cleanup": receipt.dust_cleanup,
    })))
}

fn broadcast_trade(state: &AppState, market_id: i64, receipt: &execution::TradeReceipt) {
    let msg = json!({
        "type": "trade",
        "market_id": market_id,
        "option_id": receipt.option_id,
        "side": match receipt.side { quote::Side::Buy => "buy", quote::Side::Sell => "sell" },
        "amount": receipt.amount,
        "shares": receipt.shares,
        "post_prob_bps": receipt.post_prob_bps,
    })
    .to_string();
    let _ = state.tx.send(msg);
}

#[derive(Deserialize)]
struct ResolveBody {
    winning_option_id: i64,
}

async fn resolve_handler(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Json(body): Json<ResolveBody>,
) -> ApiResult<Value> {
    settlement::resolve_market(&state.db, market_id, body.winning_option_id)
        .await
        .map_err(engine_error_response)?;
    Ok(Json(json!({ "market_id": market_id, "status": "resolved" })))
}

#[derive(Deserialize)]
struct SettleBody {
    winning_option_id: i64,
    settlement_tx_id: Option<Uuid>,
    token: Option<String>,
}

async fn settle_handler(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Json(body): Json<SettleBody>,
) -> ApiResult<Value> {
    let token = body.token.unwrap_or_else(|| state.config.engine.default_token.clone());
    let settlement_tx_id = body.settlement_tx_id.unwrap_or_else(Uuid::new_v4);
    let receipt = settlement::settle_market(&state.db, &state.cache, market_id, settlement_tx_id, &token)
        .await
        .map_err(engine_error_response)?;

    let msg = json!({
        "type": "settlement",
        "market_id": market_id,
        "winning_option_id": receipt.winning_option_id,
        "positions_settled": receipt.positions_settled,
    })
    .to_string();
    let _ = state.tx.send(msg);

    Ok(Json(json!({
        "market_id": market_id,
        "settlement_tx_id": receipt.settlement_tx_id,
        "winning_option_id": receipt.winning_option_id,
        "positions_settled": receipt.positions_settled,
        "total_paid_out": receipt.total_paid_out,
        "already_settled": receipt.already_settled,
    })))
}

#[derive(Deserialize)]
struct ResolveAndSettleBody {
    winning_option_id: i64,
    settlement_tx_id: Option<Uuid>,
    token: Option<String>,
}

/// The canonical settlement path: resolve and settle in a single
/// transaction, so the market is never visible as resolved without the
/// payout having already completed.
async fn resolve_and_settle_handler(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Json(body): Json<ResolveAndSettleBody>,
) -> ApiResult<Value> {
    let token = body.token.unwrap_or_else(|| state.config.engine.default_token.clone());
    let receipt = match body.settlement_tx_id {
        Some(settlement_tx_id) => {
            settlement::resolve_and_settle_market_with_tx_id(
                &state.db,
                &state.cache,
                market_id,
                body.winning_option_id,
                settlement_tx_id,
                &token,
            )
            .await
        }
        None => {
            settlement::resolve_and_settle_market(&state.db, &state.cache, market_id, body.winning_option_id, &token).await
        }
    }
    .map_err(engine_error_response)?;

    let msg = json!({
        "type": "settlement",
        "market_id": market_id,
        "winning_option_id": receipt.winning_option_id,
        "positions_settled": receipt.positions_settled,
    })
    .to_string();
    let _ = state.tx.send(msg);

    Ok(Json(json!({
        "market_id": market_id,
        "settlement_tx_id": receipt.settlement_tx_id,
        "winning_option_id": receipt.winning_option_id,
        "positions_settled": receipt.positions_settled,
        "total_paid_out": receipt.total_paid_out,
        "already_settled": receipt.already_settled,
    })))
}

/// Settles one constituent market of a multi-market event on its NO side
/// without resolving the parent event.
async fn resolve_and_settle_partial_handler(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Json(body): Json<ResolveAndSettleBody>,
) -> ApiResult<Value> {
    let token = body.token.unwrap_or_else(|| state.config.engine.default_token.clone());
    let settlement_tx_id = body.settlement_tx_id.unwrap_or_else(Uuid::new_v4);
    let receipt = settlement::resolve_and_settle_market_partial(
        &state.db,
        &state.cache,
        market_id,
        body.winning_option_id,
        settlement_tx_id,
        &token,
    )
    .await
    .map_err(engine_error_response)?;

    let msg = json!({
        "type": "settlement_partial",
        "market_id": market_id,
        "winning_option_id": receipt.winning_option_id,
        "positions_settled": receipt.positions_settled,
    })
    .to_string();
    let _ = state.tx.send(msg);

    Ok(Json(json!({
        "market_id": market_id,
        "settlement_tx_id": receipt.settlement_tx_id,
        "winning_option_id": receipt.winning_option_id,
        "positions_settled": receipt.positions_settled,
        "total_paid_out": receipt.total_paid_out,
        "already_settled": receipt.already_settled,
    })))
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| websocket_connection(socket, state)).into_response()
}

async fn websocket_connection(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.tx.subscribe();

    let send_task = tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(Message::Text(text))) = receiver.next().await {
            info!(%text, "received websocket message");
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}
