// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Everything lives under `/api/v1/`. Health is public; the rest requires a
// Bearer token. Domain rejections surface as 200 with the rejected order
// record (vendor compatibility) or as 4xx for malformed requests; transient
// internal failures map to 5xx.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AdminGuard;
use crate::app_state::CoreContext;
use crate::execution::engine::OrderRequest;
use crate::execution::BasketLeg;
use crate::market_clock::SessionOverride;
use crate::types::{Depth, Exchange, OrderType, ProductType, Side};

type ApiError = (StatusCode, Json<serde_json::Value>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message.into() })),
    )
}

fn not_found(message: impl Into<String>) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": message.into() })),
    )
}

fn internal(err: anyhow::Error) -> ApiError {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string(), "retry_after": 5 })),
    )
}

// =============================================================================
// Router construction
// =============================================================================

pub fn router(ctx: Arc<CoreContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── State ───────────────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        // ── Orders ──────────────────────────────────────────────────
        .route("/api/v1/orders", post(place_order))
        .route("/api/v1/orders", get(list_orders))
        .route("/api/v1/orders/:id", put(modify_order))
        .route("/api/v1/orders/:id", delete(cancel_order))
        // ── Baskets ─────────────────────────────────────────────────
        .route("/api/v1/baskets", post(create_basket))
        .route("/api/v1/baskets/:id/legs", post(append_basket))
        .route("/api/v1/baskets/:id/execute", post(execute_basket))
        // ── Positions ───────────────────────────────────────────────
        .route("/api/v1/positions", get(list_positions))
        .route("/api/v1/positions/squareoff", post(square_off))
        // ── Watchlist ───────────────────────────────────────────────
        .route("/api/v1/watchlist/add", post(watchlist_add))
        .route("/api/v1/watchlist/remove", post(watchlist_remove))
        .route("/api/v1/watchlist/:user_id", get(watchlist_list))
        // ── Option chain ────────────────────────────────────────────
        .route("/api/v1/option-chain", get(option_chain))
        .route("/api/v1/option-chain/underlyings", get(chain_underlyings))
        .route("/api/v1/option-chain/:underlying/expiries", get(chain_expiries))
        .route("/api/v1/option-chain/:underlying/atm", get(chain_atm))
        // ── Ledger / margin ─────────────────────────────────────────
        .route("/api/v1/ledger/:user_id", get(ledger))
        .route("/api/v1/margin/:user_id", get(margin_account))
        .route("/api/v1/margin/calculate", post(margin_calculate))
        // ── Feed ────────────────────────────────────────────────────
        .route("/api/v1/feed/status", get(feed_status))
        .route("/api/v1/feed/debug", get(feed_debug))
        // ── Admin ───────────────────────────────────────────────────
        .route("/api/v1/admin/feed/kill", post(admin_feed_kill))
        .route("/api/v1/admin/orders/block", post(admin_orders_block))
        .route("/api/v1/admin/market-hours", post(admin_market_hours))
        .route("/api/v1/admin/depth", post(admin_inject_depth))
        .route("/api/v1/admin/margin/recompute", post(admin_margin_recompute))
        .route(
            "/api/v1/admin/brokerage-plans",
            get(admin_list_plans).post(admin_save_plan),
        )
        .route("/api/v1/admin/force-exit", post(admin_force_exit))
        .route("/api/v1/admin/eod-cleanup", post(admin_eod_cleanup))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(ctx)
}

// =============================================================================
// Health & state
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(ctx): State<Arc<CoreContext>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: ctx.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn full_state(_auth: AdminGuard, State(ctx): State<Arc<CoreContext>>) -> impl IntoResponse {
    Json(ctx.build_snapshot())
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Deserialize)]
struct PlaceOrderBody {
    #[serde(default = "default_user_id")]
    user_id: i64,
    symbol: String,
    #[serde(default = "default_segment")]
    exchange_segment: String,
    transaction_type: String,
    quantity: i64,
    #[serde(default = "default_order_type")]
    order_type: String,
    #[serde(default = "default_product_type")]
    product_type: String,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    trigger_price: Option<f64>,
    #[serde(default)]
    is_super: bool,
    #[serde(default)]
    target_price: Option<f64>,
    #[serde(default)]
    stop_loss_price: Option<f64>,
    #[serde(default)]
    trailing_jump: Option<f64>,
}

fn default_user_id() -> i64 {
    1
}
fn default_segment() -> String {
    "NSE_EQ".to_string()
}
fn default_order_type() -> String {
    "MARKET".to_string()
}
fn default_product_type() -> String {
    "MIS".to_string()
}

async fn place_order(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Json(body): Json<PlaceOrderBody>,
) -> Result<impl IntoResponse, ApiError> {
    let side = Side::parse(&body.transaction_type)
        .ok_or_else(|| bad_request("transaction_type must be BUY or SELL"))?;
    let order_type = OrderType::parse(&body.order_type)
        .ok_or_else(|| bad_request("unknown order_type"))?;
    let product_type = ProductType::parse(&body.product_type)
        .ok_or_else(|| bad_request("unknown product_type"))?;
    if body.quantity <= 0 {
        return Err(bad_request("quantity must be positive"));
    }

    let req = OrderRequest {
        user_id: body.user_id,
        symbol: body.symbol,
        exchange_segment: body.exchange_segment,
        side,
        quantity: body.quantity,
        order_type,
        product_type,
        price: body.price,
        trigger_price: body.trigger_price,
        is_super: body.is_super,
        target_price: body.target_price,
        stop_loss_price: body.stop_loss_price,
        trailing_jump: body.trailing_jump,
    };

    let order = ctx.execution.place_order(req).await.map_err(internal)?;
    ctx.increment_version();
    Ok(Json(serde_json::json!({ "data": order })))
}

#[derive(Deserialize)]
struct UserFilter {
    user_id: Option<i64>,
}

async fn list_orders(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Query(filter): Query<UserFilter>,
) -> impl IntoResponse {
    Json(ctx.execution.orders_for(filter.user_id))
}

#[derive(Deserialize)]
struct ModifyOrderBody {
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    quantity: Option<i64>,
    #[serde(default)]
    trigger_price: Option<f64>,
}

async fn modify_order(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Path(order_id): Path<i64>,
    Json(body): Json<ModifyOrderBody>,
) -> Result<impl IntoResponse, ApiError> {
    let order = ctx
        .execution
        .modify_order(order_id, body.price, body.quantity, body.trigger_price)
        .map_err(|e| bad_request(e.to_string()))?;
    ctx.increment_version();
    Ok(Json(serde_json::json!({ "data": order })))
}

async fn cancel_order(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Path(order_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let order = ctx
        .execution
        .cancel_order(order_id)
        .map_err(|e| bad_request(e.to_string()))?;
    ctx.increment_version();
    Ok(Json(serde_json::json!({ "data": order })))
}

// =============================================================================
// Baskets
// =============================================================================

#[derive(Deserialize)]
struct BasketLegBody {
    symbol: String,
    #[serde(default = "default_segment")]
    exchange_segment: String,
    transaction_type: String,
    quantity: i64,
    #[serde(default = "default_order_type")]
    order_type: String,
    #[serde(default = "default_product_type")]
    product_type: String,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    trigger_price: Option<f64>,
}

impl BasketLegBody {
    fn into_leg(self) -> Result<BasketLeg, ApiError> {
        Ok(BasketLeg {
            symbol: self.symbol,
            exchange_segment: self.exchange_segment,
            side: Side::parse(&self.transaction_type)
                .ok_or_else(|| bad_request("transaction_type must be BUY or SELL"))?,
            quantity: self.quantity,
            order_type: OrderType::parse(&self.order_type)
                .ok_or_else(|| bad_request("unknown order_type"))?,
            product_type: ProductType::parse(&self.product_type)
                .ok_or_else(|| bad_request("unknown product_type"))?,
            price: self.price,
            trigger_price: self.trigger_price,
        })
    }
}

#[derive(Deserialize)]
struct CreateBasketBody {
    #[serde(default = "default_user_id")]
    user_id: i64,
    name: String,
    #[serde(default)]
    legs: Vec<BasketLegBody>,
}

async fn create_basket(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Json(body): Json<CreateBasketBody>,
) -> Result<impl IntoResponse, ApiError> {
    let legs = body
        .legs
        .into_iter()
        .map(BasketLegBody::into_leg)
        .collect::<Result<Vec<_>, _>>()?;
    let basket = ctx
        .execution
        .create_basket(body.user_id, &body.name, legs)
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "data": basket })))
}

#[derive(Deserialize)]
struct AppendBasketBody {
    legs: Vec<BasketLegBody>,
}

async fn append_basket(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Path(basket_id): Path<i64>,
    Json(body): Json<AppendBasketBody>,
) -> Result<impl IntoResponse, ApiError> {
    let legs = body
        .legs
        .into_iter()
        .map(BasketLegBody::into_leg)
        .collect::<Result<Vec<_>, _>>()?;
    let basket = ctx
        .execution
        .append_basket_legs(basket_id, legs)
        .map_err(|e| not_found(e.to_string()))?;
    Ok(Json(serde_json::json!({ "data": basket })))
}

async fn execute_basket(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Path(basket_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let orders = ctx
        .execution
        .execute_basket(basket_id)
        .await
        .map_err(|e| not_found(e.to_string()))?;
    ctx.increment_version();
    Ok(Json(serde_json::json!({ "data": orders })))
}

// =============================================================================
// Positions
// =============================================================================

async fn list_positions(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Query(filter): Query<UserFilter>,
) -> impl IntoResponse {
    Json(ctx.positions.all_positions(filter.user_id))
}

#[derive(Deserialize)]
struct SquareOffBody {
    #[serde(default = "default_user_id")]
    user_id: i64,
    symbol: String,
    #[serde(default = "default_product_type")]
    product_type: String,
}

async fn square_off(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Json(body): Json<SquareOffBody>,
) -> Result<impl IntoResponse, ApiError> {
    let product_type = ProductType::parse(&body.product_type)
        .ok_or_else(|| bad_request("unknown product_type"))?;
    let order = ctx
        .execution
        .square_off(body.user_id, &body.symbol, product_type)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    ctx.increment_version();
    Ok(Json(serde_json::json!({ "data": order })))
}

// =============================================================================
// Watchlist
// =============================================================================

#[derive(Deserialize)]
struct WatchlistAddBody {
    #[serde(default = "default_user_id")]
    user_id: i64,
    symbol: String,
    #[serde(default)]
    expiry: String,
    #[serde(default = "default_watchlist_type")]
    instrument_type: String,
    #[serde(default)]
    underlying_ltp: Option<f64>,
}

fn default_watchlist_type() -> String {
    "STOCK_OPTION".to_string()
}

async fn watchlist_add(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Json(body): Json<WatchlistAddBody>,
) -> impl IntoResponse {
    let ltp = body
        .underlying_ltp
        .or_else(|| ctx.market_state.ltp(&body.symbol))
        .or_else(|| ctx.chains.underlying_ltp(&body.symbol));
    let result = ctx.watchlist.add(
        body.user_id,
        &body.symbol,
        &body.expiry,
        &body.instrument_type,
        ltp,
    );
    ctx.increment_version();
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(result))
}

#[derive(Deserialize)]
struct WatchlistRemoveBody {
    #[serde(default = "default_user_id")]
    user_id: i64,
    symbol: String,
    #[serde(default)]
    expiry: String,
}

async fn watchlist_remove(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Json(body): Json<WatchlistRemoveBody>,
) -> impl IntoResponse {
    let expiry = if body.expiry.trim().is_empty() {
        crate::subscription::watchlist::EQUITY_EXPIRY_MARKER.to_string()
    } else {
        body.expiry
    };
    let removed = ctx.watchlist.remove(body.user_id, &body.symbol, &expiry);
    ctx.increment_version();
    Json(serde_json::json!({ "removed": removed }))
}

async fn watchlist_list(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Path(user_id): Path<i64>,
) -> impl IntoResponse {
    Json(ctx.watchlist.list(user_id))
}

// =============================================================================
// Option chain
// =============================================================================

#[derive(Deserialize)]
struct ChainQuery {
    underlying: String,
    #[serde(default)]
    expiry: Option<String>,
}

async fn option_chain(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Query(query): Query<ChainQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let skeleton = ctx
        .chains
        .nearest(&query.underlying, query.expiry.as_deref())
        .ok_or_else(|| not_found(format!("no chain cached for {}", query.underlying)))?;
    Ok(Json(skeleton.snapshot()))
}

async fn chain_underlyings(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
) -> impl IntoResponse {
    Json(ctx.chains.available_underlyings())
}

async fn chain_expiries(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Path(underlying): Path<String>,
) -> impl IntoResponse {
    Json(ctx.chains.available_expiries(&underlying))
}

async fn chain_atm(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Path(underlying): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let atm = ctx
        .chains
        .atm_strike(&underlying)
        .ok_or_else(|| not_found(format!("no ATM cached for {underlying}")))?;
    Ok(Json(serde_json::json!({
        "underlying": underlying,
        "atm_strike": atm,
        "underlying_ltp": ctx.chains.underlying_ltp(&underlying),
    })))
}

// =============================================================================
// Ledger / margin
// =============================================================================

async fn ledger(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Path(user_id): Path<i64>,
) -> impl IntoResponse {
    Json(ctx.accounts.ledger_for(user_id))
}

async fn margin_account(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Path(user_id): Path<i64>,
) -> impl IntoResponse {
    Json(ctx.accounts.margin_for(user_id))
}

/// Strict proxy to the vendor margin calculator; the core never computes
/// margin itself.
async fn margin_calculate(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    let result = ctx.rest.margin_calculator(body).await.map_err(internal)?;
    Ok(Json(result))
}

// =============================================================================
// Feed
// =============================================================================

async fn feed_status(_auth: AdminGuard, State(ctx): State<Arc<CoreContext>>) -> impl IntoResponse {
    Json(ctx.ingestor.status())
}

/// Live-feed debug snapshot: desired vs. active targets plus per-symbol
/// last-tick ages.
async fn feed_debug(_auth: AdminGuard, State(ctx): State<Arc<CoreContext>>) -> impl IntoResponse {
    let targets = ctx.fabric.wire_targets();
    Json(serde_json::json!({
        "status": ctx.ingestor.status(),
        "rate_limiter": ctx.rate_limiter.snapshot(),
        "desired_targets": targets,
        "tick_ages": ctx.market_state.tick_ages(),
        "shards": ctx.fabric.shard_snapshot(),
    }))
}

// =============================================================================
// Admin
// =============================================================================

#[derive(Deserialize)]
struct ToggleBody {
    enabled: bool,
}

async fn admin_feed_kill(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Json(body): Json<ToggleBody>,
) -> impl IntoResponse {
    // enabled=false engages the kill-switch.
    ctx.ingestor.set_killed(!body.enabled);
    {
        let mut config = ctx.runtime_config.write();
        config.live_feed_enabled = body.enabled;
    }
    ctx.increment_version();
    info!(enabled = body.enabled, "live feed toggled via API");
    Json(serde_json::json!({ "live_feed_enabled": body.enabled }))
}

async fn admin_orders_block(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Json(body): Json<ToggleBody>,
) -> impl IntoResponse {
    ctx.execution.set_admin_blocked(!body.enabled);
    {
        let mut config = ctx.runtime_config.write();
        config.order_entry_blocked = !body.enabled;
    }
    ctx.increment_version();
    Json(serde_json::json!({ "order_entry_enabled": body.enabled }))
}

#[derive(Deserialize)]
struct MarketHoursBody {
    exchange: String,
    /// "open", "closed", or "auto" to clear the override.
    state: String,
}

async fn admin_market_hours(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Json(body): Json<MarketHoursBody>,
) -> Result<impl IntoResponse, ApiError> {
    let exchange = Exchange::parse(&body.exchange)
        .ok_or_else(|| bad_request(format!("unknown exchange '{}'", body.exchange)))?;
    let state = match body.state.to_lowercase().as_str() {
        "open" => Some(SessionOverride::ForcedOpen),
        "closed" => Some(SessionOverride::ForcedClosed),
        "auto" => None,
        other => return Err(bad_request(format!("unknown state '{other}'"))),
    };
    ctx.clock.set_override(exchange, state);
    ctx.increment_version();
    Ok(Json(serde_json::json!({
        "overrides": ctx.clock.overrides_snapshot(),
    })))
}

#[derive(Deserialize)]
struct InjectDepthBody {
    symbol: String,
    depth: Depth,
}

async fn admin_inject_depth(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Json(body): Json<InjectDepthBody>,
) -> impl IntoResponse {
    ctx.market_state.inject_depth(&body.symbol, body.depth);
    ctx.increment_version();
    Json(serde_json::json!({ "injected": body.symbol }))
}

#[derive(Deserialize)]
struct RecomputeBody {
    user_id: i64,
}

async fn admin_margin_recompute(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Json(body): Json<RecomputeBody>,
) -> Result<impl IntoResponse, ApiError> {
    let margin = ctx
        .accounts
        .recompute_margin(body.user_id)
        .ok_or_else(|| not_found(format!("no user {}", body.user_id)))?;
    if let Err(e) = ctx.store.upsert_margin(&margin) {
        return Err(internal(e));
    }
    ctx.increment_version();
    Ok(Json(margin))
}

async fn admin_list_plans(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
) -> impl IntoResponse {
    Json(ctx.accounts.list_plans())
}

#[derive(Deserialize)]
struct PlanBody {
    name: String,
    #[serde(default = "default_flat_fee")]
    flat_fee: f64,
    #[serde(default)]
    percent_fee: f64,
    #[serde(default = "default_flat_fee")]
    max_fee: f64,
}

fn default_flat_fee() -> f64 {
    20.0
}

async fn admin_save_plan(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Json(body): Json<PlanBody>,
) -> Result<impl IntoResponse, ApiError> {
    let name = body.name.trim().to_uppercase();
    if name.is_empty() {
        return Err(bad_request("plan name must not be empty"));
    }
    let mut plan = crate::ledger::BrokeragePlan {
        id: 0,
        name,
        flat_fee: body.flat_fee,
        percent_fee: body.percent_fee,
        max_fee: body.max_fee,
    };
    plan.id = ctx.store.save_plan(&plan).map_err(internal)?;
    ctx.accounts.upsert_plan(plan.clone());
    ctx.increment_version();
    Ok(Json(plan))
}

async fn admin_force_exit(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
    Json(body): Json<SquareOffBody>,
) -> Result<impl IntoResponse, ApiError> {
    let product_type = ProductType::parse(&body.product_type)
        .ok_or_else(|| bad_request("unknown product_type"))?;
    let order = ctx
        .execution
        .square_off(body.user_id, &body.symbol, product_type)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    ctx.increment_version();
    info!(user_id = body.user_id, symbol = %body.symbol, "admin force exit");
    Ok(Json(serde_json::json!({ "data": order })))
}

async fn admin_eod_cleanup(
    _auth: AdminGuard,
    State(ctx): State<Arc<CoreContext>>,
) -> impl IntoResponse {
    let open = ctx.positions.open_positions(None);
    let removed = ctx.fabric.unsubscribe_all_tier_a(&open);
    ctx.increment_version();
    Json(serde_json::json!({ "tier_a_unsubscribed": removed }))
}
