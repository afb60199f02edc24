// =============================================================================
// Execution Engine — order lifecycle against the cached book
// =============================================================================
//
// New orders run pre-trade checks, wait out the latency model, then fill
// against the snapshot oracle. Each fill applies atomically to order,
// trade, position, margin, wallet and ledger under one lock, with the
// store mirroring every row. A cooperative sweep revisits PENDING/PARTIAL
// orders: triggers, re-pricing and the per-exchange liquidity timeout.
//
// Compatibility quirk preserved on purpose: a pre-trade margin shortfall
// does NOT reject the order; it is accepted with a MARGIN_EXCEEDED
// warning on the record.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::config::ExecutionConfig;
use super::fills::{compute_fill, Fill};
use super::latency::LatencyModel;
use super::oracle::{QuoteSnapshot, SnapshotOracle};
use super::{Basket, BasketLeg, EventKind, ExecutionEvent, Order, Trade};
use crate::instruments::{parse_option_symbol, InstrumentRegistry, OptionTokenMap};
use crate::ledger::{AccountStore, LedgerKind, PositionBook};
use crate::store::Store;
use crate::types::{Exchange, OrderStatus, OrderType, ProductType, RejectReason, Side};

/// Ring-buffer cap for the recent execution events surfaced to the API.
const MAX_RECENT_EVENTS: usize = 200;

/// Inbound order request (already syntactically valid JSON; semantic
/// validation happens here).
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub user_id: i64,
    pub symbol: String,
    pub exchange_segment: String,
    pub side: Side,
    pub quantity: i64,
    pub order_type: OrderType,
    pub product_type: ProductType,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub is_super: bool,
    pub target_price: Option<f64>,
    pub stop_loss_price: Option<f64>,
    pub trailing_jump: Option<f64>,
}

pub struct ExecutionEngine {
    store: Arc<Store>,
    accounts: Arc<AccountStore>,
    positions: Arc<PositionBook>,
    oracle: SnapshotOracle,
    config: ExecutionConfig,
    token_map: Arc<OptionTokenMap>,
    registry: Arc<InstrumentRegistry>,
    orders: Mutex<BTreeMap<i64, Order>>,
    baskets: Mutex<HashMap<i64, Basket>>,
    recent_events: Mutex<Vec<ExecutionEvent>>,
    /// Serialises apply-fill transactions.
    tx_lock: Mutex<()>,
    /// Cleared on shutdown: no new orders, in-flight fills still land.
    accepting: AtomicBool,
    /// Admin kill-switch for order entry.
    admin_blocked: AtomicBool,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        accounts: Arc<AccountStore>,
        positions: Arc<PositionBook>,
        oracle: SnapshotOracle,
        config: ExecutionConfig,
        token_map: Arc<OptionTokenMap>,
        registry: Arc<InstrumentRegistry>,
    ) -> Self {
        Self {
            store,
            accounts,
            positions,
            oracle,
            config,
            token_map,
            registry,
            orders: Mutex::new(BTreeMap::new()),
            baskets: Mutex::new(HashMap::new()),
            recent_events: Mutex::new(Vec::new()),
            tx_lock: Mutex::new(()),
            accepting: AtomicBool::new(true),
            admin_blocked: AtomicBool::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle controls
    // -------------------------------------------------------------------------

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn set_admin_blocked(&self, blocked: bool) {
        self.admin_blocked.store(blocked, Ordering::SeqCst);
        warn!(blocked, "order-entry kill switch toggled");
    }

    pub fn is_admin_blocked(&self) -> bool {
        self.admin_blocked.load(Ordering::SeqCst)
    }

    /// Reload PENDING/PARTIAL orders after a restart so the sweep resumes
    /// them.
    pub fn rehydrate(&self) -> usize {
        match self.store.load_open_orders() {
            Ok(rows) => {
                let mut orders = self.orders.lock();
                let count = rows.len();
                for order in rows {
                    orders.insert(order.id, order);
                }
                info!(count, "open orders rehydrated");
                count
            }
            Err(e) => {
                warn!(error = %e, "failed to rehydrate open orders");
                0
            }
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn exchange_of(&self, exchange_segment: &str) -> Exchange {
        Exchange::from_segment(exchange_segment).unwrap_or(Exchange::Nse)
    }

    /// Lot step for an order: equities trade single shares; derivatives
    /// use the underlying's contract lot from the token map or registry.
    fn resolve_lot_step(&self, symbol: &str, exchange_segment: &str) -> i64 {
        let segment = exchange_segment.to_uppercase();
        let symbol_upper = symbol.to_uppercase();
        let is_derivative = segment.contains("FNO")
            || segment.contains("NFO")
            || segment.contains("MCX")
            || symbol_upper.ends_with(" CE")
            || symbol_upper.ends_with(" PE");
        if !is_derivative {
            return 1;
        }

        let underlying = parse_option_symbol(&symbol_upper)
            .map(|p| p.underlying)
            .unwrap_or_else(|| {
                symbol_upper
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .to_string()
            });
        if underlying.is_empty() {
            return 1;
        }
        self.token_map
            .lot_size(&underlying)
            .or_else(|| self.registry.lot_size(&underlying))
            .filter(|lot| *lot > 1)
            .unwrap_or(1)
    }

    fn push_event(&self, event: ExecutionEvent) {
        if let Err(e) = self.store.insert_event(&event) {
            warn!(error = %e, "failed to persist execution event");
        }
        let mut events = self.recent_events.lock();
        events.push(event);
        while events.len() > MAX_RECENT_EVENTS {
            events.remove(0);
        }
    }

    fn event_for(
        order: &Order,
        kind: EventKind,
        decision_price: Option<f64>,
        fill: Option<&Fill>,
        reason: Option<String>,
        latency_ms: Option<u64>,
    ) -> ExecutionEvent {
        ExecutionEvent {
            order_id: order.id,
            user_id: order.user_id,
            symbol: order.symbol.clone(),
            kind,
            decision_price,
            fill_price: fill.map(|f| f.price),
            fill_qty: fill.map(|f| f.qty),
            reason,
            latency_ms,
            slippage: fill.map(|f| f.slippage),
            created_at: Utc::now(),
        }
    }

    fn build_order(&self, req: &OrderRequest, status: OrderStatus, remarks: Option<String>) -> Order {
        let now = Utc::now();
        Order {
            id: 0,
            order_ref: Uuid::new_v4().to_string(),
            user_id: req.user_id,
            symbol: req.symbol.trim().to_uppercase(),
            exchange_segment: req.exchange_segment.to_uppercase(),
            side: req.side,
            quantity: req.quantity,
            filled_qty: 0,
            order_type: req.order_type,
            product_type: req.product_type,
            price: req.price.unwrap_or(0.0),
            trigger_price: req.trigger_price,
            is_super: req.is_super,
            target_price: req.target_price,
            stop_loss_price: req.stop_loss_price,
            trailing_jump: req.trailing_jump,
            status,
            remarks,
            margin_warning: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn persist_and_track(&self, mut order: Order) -> Result<Order> {
        order.id = self.store.insert_order(&order)?;
        self.orders.lock().insert(order.id, order.clone());
        Ok(order)
    }

    fn reject(&self, req: &OrderRequest, reason: RejectReason) -> Result<Order> {
        let order = self.build_order(req, OrderStatus::Rejected, Some(reason.to_string()));
        let order = self.persist_and_track(order)?;
        self.push_event(Self::event_for(
            &order,
            EventKind::Rejected,
            None,
            None,
            Some(reason.to_string()),
            None,
        ));
        info!(order_id = order.id, reason = %reason, "order rejected pre-trade");
        Ok(order)
    }

    /// Syntactic/semantic request validation: positive limit prices for
    /// LIMIT-type orders, bracket fields for super orders.
    fn validate(&self, req: &OrderRequest) -> Option<RejectReason> {
        if req.quantity <= 0 {
            return Some(RejectReason::InvalidPrice);
        }
        if req.order_type.requires_price() && req.price.map_or(true, |p| p <= 0.0) {
            return Some(RejectReason::InvalidPrice);
        }
        if req.is_super {
            if req.target_price.map_or(true, |p| p <= 0.0)
                || req.stop_loss_price.map_or(true, |p| p <= 0.0)
            {
                return Some(RejectReason::InvalidPrice);
            }
        }
        None
    }

    /// Trigger evaluation: BUY activates when the ask reaches the trigger,
    /// SELL when the bid falls to it.
    fn trigger_met(order: &Order, snapshot: &QuoteSnapshot) -> bool {
        let trigger = match order.trigger_price {
            Some(trigger) => trigger,
            None => return false,
        };
        match order.side {
            Side::Buy => snapshot.best_ask.map_or(false, |ask| ask >= trigger),
            Side::Sell => snapshot.best_bid.map_or(false, |bid| bid <= trigger),
        }
    }

    // -------------------------------------------------------------------------
    // Order placement
    // -------------------------------------------------------------------------

    pub async fn place_order(&self, req: OrderRequest) -> Result<Order> {
        if !self.accepting.load(Ordering::SeqCst) {
            anyhow::bail!("execution engine is shutting down");
        }

        if let Some(reason) = self.validate(&req) {
            return self.reject(&req, reason);
        }

        let user = self.accounts.ensure_user(req.user_id);
        if !user.is_active() || self.is_admin_blocked() {
            return self.reject(&req, RejectReason::UserBlocked);
        }
        if !user.segment_allowed(&req.exchange_segment) {
            return self.reject(&req, RejectReason::SegmentRestricted);
        }

        // Pre-trade margin check: a shortfall warns, never rejects.
        let snapshot = self
            .oracle
            .snapshot_for(&req.symbol, &req.exchange_segment);
        let decision_price = match req.side {
            Side::Buy => snapshot.best_ask,
            Side::Sell => snapshot.best_bid,
        }
        .or(req.price)
        .unwrap_or(0.0);
        let mut required = (decision_price * req.quantity as f64).abs();
        if req.product_type == ProductType::Mis {
            required /= user.effective_multiplier();
        }
        let margin = self.accounts.margin_for(req.user_id);
        let margin_warning = margin.available_margin < required;

        let mut order = self.build_order(&req, OrderStatus::Pending, None);
        order.margin_warning = margin_warning;
        if margin_warning {
            order.remarks = Some("MARGIN_EXCEEDED".to_string());
        }
        let mut order = self.persist_and_track(order)?;

        self.process_new_order(&mut order).await;

        if let Err(e) = self.store.update_order(&order) {
            warn!(order_id = order.id, error = %e, "failed to persist order state");
        }
        self.orders.lock().insert(order.id, order.clone());
        Ok(order)
    }

    async fn process_new_order(&self, order: &mut Order) {
        let exchange = self.exchange_of(&order.exchange_segment);
        let params = self.config.for_exchange(exchange).clone();
        let snapshot = self
            .oracle
            .snapshot_for(&order.symbol, &order.exchange_segment);

        let mut effective = order.order_type;
        if order.order_type.is_trigger_based() {
            if order.trigger_price.is_none() {
                order.status = OrderStatus::Rejected;
                order.remarks = Some(RejectReason::InvalidTrigger.to_string());
                order.updated_at = Utc::now();
                self.push_event(Self::event_for(
                    order,
                    EventKind::Rejected,
                    snapshot.best_ask.or(snapshot.best_bid),
                    None,
                    Some(RejectReason::InvalidTrigger.to_string()),
                    None,
                ));
                return;
            }
            if !Self::trigger_met(order, &snapshot) {
                // Armed; the pending sweep watches the trigger.
                return;
            }
            effective = order.order_type.activated();
        }

        let latency_ms = LatencyModel::sample_ms(&params, order.user_id);
        tokio::time::sleep(std::time::Duration::from_millis(latency_ms)).await;

        let decision_price = match order.side {
            Side::Buy => snapshot.best_ask,
            Side::Sell => snapshot.best_bid,
        };
        self.push_event(Self::event_for(
            order,
            EventKind::Accepted,
            decision_price,
            None,
            None,
            Some(latency_ms),
        ));

        self.try_fill(order, effective, &snapshot, latency_ms);
    }

    /// Attempt one fill pass for an order against a snapshot.
    fn try_fill(
        &self,
        order: &mut Order,
        effective: OrderType,
        snapshot: &QuoteSnapshot,
        latency_ms: u64,
    ) {
        let exchange = self.exchange_of(&order.exchange_segment);
        let params = self.config.for_exchange(exchange);
        let remaining = order.remaining();
        if remaining <= 0 {
            return;
        }

        let (top_price, top_qty) = match order.side {
            Side::Buy => (
                snapshot.best_ask,
                snapshot.ask_qty.unwrap_or(self.config.default_ask_qty),
            ),
            Side::Sell => (
                snapshot.best_bid,
                snapshot.bid_qty.unwrap_or(self.config.default_bid_qty),
            ),
        };
        let limit = match effective {
            OrderType::Limit => Some(order.price).filter(|p| *p > 0.0),
            _ => None,
        };
        if effective == OrderType::Limit && limit.is_none() {
            return;
        }

        let lot_step = self.resolve_lot_step(&order.symbol, &order.exchange_segment);
        let fill = compute_fill(
            params,
            order.side,
            remaining,
            top_price,
            top_qty,
            snapshot.spread(),
            limit,
            lot_step,
        );

        if let Some(fill) = fill {
            self.apply_fill(order, &fill, latency_ms, top_price);
        }
    }

    // -------------------------------------------------------------------------
    // Apply-fill transaction
    // -------------------------------------------------------------------------

    /// Apply one fill to order, trade, position, margin, wallet and ledger
    /// as a single unit. `filled_qty` only ever grows here.
    fn apply_fill(&self, order: &mut Order, fill: &Fill, latency_ms: u64, decision: Option<f64>) {
        let _guard = self.tx_lock.lock();

        let previous_filled = order.filled_qty;
        order.filled_qty = (previous_filled + fill.qty).min(order.quantity);

        // Market (and price-less) orders record the weighted average fill
        // price as the order price.
        if order.order_type == OrderType::Market || order.price <= 0.0 {
            if previous_filled <= 0 {
                order.price = fill.price;
            } else {
                order.price = (order.price * previous_filled as f64
                    + fill.price * fill.qty as f64)
                    / order.filled_qty.max(1) as f64;
            }
        }
        order.status = if order.filled_qty >= order.quantity {
            OrderStatus::Executed
        } else {
            OrderStatus::Partial
        };
        order.updated_at = Utc::now();

        let trade = Trade {
            id: 0,
            order_id: order.id,
            user_id: order.user_id,
            symbol: order.symbol.clone(),
            side: order.side,
            price: fill.price,
            qty: fill.qty,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_trade(&trade) {
            warn!(order_id = order.id, error = %e, "failed to persist trade");
        }

        let user = self.accounts.ensure_user(order.user_id);
        let turnover = fill.price * fill.qty as f64;
        let brokerage = self.accounts.plan_for(&user).fee_for(turnover);

        // Margin: blocked notional, divided by the multiplier for intraday.
        let mut required = turnover.abs();
        if order.product_type == ProductType::Mis {
            required /= user.effective_multiplier();
        }
        let margin = self.accounts.consume_margin(order.user_id, required);
        if let Err(e) = self.store.upsert_margin(&margin) {
            warn!(order_id = order.id, error = %e, "failed to persist margin");
        }

        // Wallet + ledger: BUY debits turnover + brokerage, SELL credits
        // turnover - brokerage.
        let entry = match order.side {
            Side::Buy => self.accounts.post_ledger(
                order.user_id,
                LedgerKind::TradePnl,
                0.0,
                turnover + brokerage,
                "Order filled BUY",
            ),
            Side::Sell => self.accounts.post_ledger(
                order.user_id,
                LedgerKind::TradePnl,
                turnover - brokerage,
                0.0,
                "Order filled SELL",
            ),
        };
        if let Some(entry) = entry {
            if let Err(e) = self.store.insert_ledger(&entry) {
                warn!(order_id = order.id, error = %e, "failed to persist ledger entry");
            }
        }
        if let Err(e) = self.store.upsert_user(&self.accounts.ensure_user(order.user_id)) {
            warn!(order_id = order.id, error = %e, "failed to persist wallet");
        }

        let signed_qty = fill.qty * order.side.sign();
        let (position, _realized) = self.positions.apply_fill(
            order.user_id,
            &order.symbol,
            &order.exchange_segment,
            order.product_type,
            signed_qty,
            fill.price,
        );
        if let Err(e) = self.store.upsert_position(&position) {
            warn!(order_id = order.id, error = %e, "failed to persist position");
        }

        let kind = if order.status == OrderStatus::Executed {
            EventKind::FullFill
        } else {
            EventKind::PartialFill
        };
        self.push_event(Self::event_for(
            order,
            kind,
            decision,
            Some(fill),
            None,
            Some(latency_ms),
        ));
        if let Err(e) = self.store.update_order(order) {
            warn!(order_id = order.id, error = %e, "failed to persist filled order");
        }

        info!(
            order_id = order.id,
            symbol = %order.symbol,
            side = %order.side,
            fill_price = fill.price,
            fill_qty = fill.qty,
            filled = order.filled_qty,
            status = %order.status,
            "fill applied"
        );
    }

    // -------------------------------------------------------------------------
    // Pending sweep
    // -------------------------------------------------------------------------

    /// One pass over PENDING/PARTIAL orders: liquidity timeout, trigger
    /// evaluation, re-price, fill attempts.
    pub fn process_pending(&self) {
        let open_ids: Vec<i64> = {
            let orders = self.orders.lock();
            orders
                .values()
                .filter(|o| matches!(o.status, OrderStatus::Pending | OrderStatus::Partial))
                .map(|o| o.id)
                .collect()
        };

        for id in open_ids {
            let mut order = match self.orders.lock().get(&id).cloned() {
                Some(order) => order,
                None => continue,
            };
            if order.status.is_terminal() {
                continue;
            }

            let exchange = self.exchange_of(&order.exchange_segment);
            let params = self.config.for_exchange(exchange).clone();

            // Liquidity timeout.
            let age = (Utc::now() - order.created_at).num_seconds();
            if age > params.timeout_seconds && order.remaining() > 0 {
                order.status = OrderStatus::Rejected;
                order.remarks = Some(RejectReason::NoLiquidityTimeout.to_string());
                order.updated_at = Utc::now();
                self.push_event(Self::event_for(
                    &order,
                    EventKind::Rejected,
                    None,
                    None,
                    Some(RejectReason::NoLiquidityTimeout.to_string()),
                    None,
                ));
                if let Err(e) = self.store.update_order(&order) {
                    warn!(order_id = order.id, error = %e, "failed to persist timeout");
                }
                self.orders.lock().insert(order.id, order);
                continue;
            }

            let snapshot = self
                .oracle
                .snapshot_for(&order.symbol, &order.exchange_segment);
            if !snapshot.has_quote() {
                continue;
            }

            let mut effective = order.order_type;
            if order.order_type.is_trigger_based() {
                if !Self::trigger_met(&order, &snapshot) {
                    continue;
                }
                effective = order.order_type.activated();
            }

            let latency_ms = LatencyModel::sample_ms(&params, order.user_id);
            self.try_fill(&mut order, effective, &snapshot, latency_ms);
            self.orders.lock().insert(order.id, order);
        }
    }

    // -------------------------------------------------------------------------
    // Cancel / modify
    // -------------------------------------------------------------------------

    pub fn cancel_order(&self, order_id: i64) -> Result<Order> {
        let mut orders = self.orders.lock();
        let order = orders
            .get_mut(&order_id)
            .with_context(|| format!("order {order_id} not found"))?;
        if order.status.is_terminal() {
            anyhow::bail!("order {order_id} is already {}", order.status);
        }
        order.status = OrderStatus::Cancelled;
        order.remarks = Some("CANCELLED_BY_USER".to_string());
        order.updated_at = Utc::now();
        let snapshot = order.clone();
        drop(orders);
        self.store.update_order(&snapshot)?;
        info!(order_id, "order cancelled");
        Ok(snapshot)
    }

    pub fn modify_order(
        &self,
        order_id: i64,
        price: Option<f64>,
        quantity: Option<i64>,
        trigger_price: Option<f64>,
    ) -> Result<Order> {
        let mut orders = self.orders.lock();
        let order = orders
            .get_mut(&order_id)
            .with_context(|| format!("order {order_id} not found"))?;
        if order.status.is_terminal() {
            anyhow::bail!("order {order_id} is already {}", order.status);
        }
        if let Some(price) = price {
            if price <= 0.0 {
                anyhow::bail!("modified price must be positive");
            }
            order.price = price;
        }
        if let Some(quantity) = quantity {
            if quantity < order.filled_qty {
                anyhow::bail!("cannot shrink below filled quantity");
            }
            order.quantity = quantity;
        }
        if trigger_price.is_some() {
            order.trigger_price = trigger_price;
        }
        order.updated_at = Utc::now();
        let snapshot = order.clone();
        drop(orders);
        self.store.update_order(&snapshot)?;
        info!(order_id, "order modified");
        Ok(snapshot)
    }

    // -------------------------------------------------------------------------
    // Square-off & baskets
    // -------------------------------------------------------------------------

    /// Close an open position with an opposite MARKET order.
    pub async fn square_off(
        &self,
        user_id: i64,
        symbol: &str,
        product_type: ProductType,
    ) -> Result<Order> {
        let position = self
            .positions
            .get(user_id, &symbol.to_uppercase(), product_type)
            .with_context(|| format!("no position for {symbol}"))?;
        if position.quantity == 0 {
            anyhow::bail!("position for {symbol} is already flat");
        }

        let side = if position.quantity > 0 {
            Side::Sell
        } else {
            Side::Buy
        };
        let req = OrderRequest {
            user_id,
            symbol: position.symbol.clone(),
            exchange_segment: position.exchange_segment.clone(),
            side,
            quantity: position.quantity.abs(),
            order_type: OrderType::Market,
            product_type,
            price: None,
            trigger_price: None,
            is_super: false,
            target_price: None,
            stop_loss_price: None,
            trailing_jump: None,
        };
        self.place_order(req).await
    }

    pub fn create_basket(&self, user_id: i64, name: &str, legs: Vec<BasketLeg>) -> Result<Basket> {
        let id = self.store.insert_basket(user_id, name)?;
        for leg in &legs {
            self.store.insert_basket_leg(id, leg)?;
        }
        let basket = Basket {
            id,
            user_id,
            name: name.to_string(),
            legs,
            created_at: Utc::now(),
        };
        self.baskets.lock().insert(id, basket.clone());
        Ok(basket)
    }

    pub fn append_basket_legs(&self, basket_id: i64, legs: Vec<BasketLeg>) -> Result<Basket> {
        let mut baskets = self.baskets.lock();
        let basket = baskets
            .get_mut(&basket_id)
            .with_context(|| format!("basket {basket_id} not found"))?;
        for leg in &legs {
            self.store.insert_basket_leg(basket_id, leg)?;
        }
        basket.legs.extend(legs);
        Ok(basket.clone())
    }

    /// Execute a basket: legs are placed in order; a rejected leg does not
    /// stop the rest.
    pub async fn execute_basket(&self, basket_id: i64) -> Result<Vec<Order>> {
        let basket = self
            .baskets
            .lock()
            .get(&basket_id)
            .cloned()
            .with_context(|| format!("basket {basket_id} not found"))?;

        let mut placed = Vec::with_capacity(basket.legs.len());
        for leg in basket.legs {
            let req = OrderRequest {
                user_id: basket.user_id,
                symbol: leg.symbol,
                exchange_segment: leg.exchange_segment,
                side: leg.side,
                quantity: leg.quantity,
                order_type: leg.order_type,
                product_type: leg.product_type,
                price: leg.price,
                trigger_price: leg.trigger_price,
                is_super: false,
                target_price: None,
                stop_loss_price: None,
                trailing_jump: None,
            };
            match self.place_order(req).await {
                Ok(order) => placed.push(order),
                Err(e) => warn!(basket_id, error = %e, "basket leg placement failed"),
            }
        }
        Ok(placed)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get_order(&self, order_id: i64) -> Option<Order> {
        self.orders.lock().get(&order_id).cloned()
    }

    pub fn orders_for(&self, user_id: Option<i64>) -> Vec<Order> {
        self.orders
            .lock()
            .values()
            .filter(|o| user_id.map_or(true, |uid| o.user_id == uid))
            .cloned()
            .collect()
    }

    pub fn recent_events(&self) -> Vec<ExecutionEvent> {
        self.recent_events.lock().clone()
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("orders", &self.orders.lock().len())
            .field("accepting", &self.accepting.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertSink;
    use crate::chain::bootstrap::CommodityFuturesCache;
    use crate::chain::OptionChainCache;
    use crate::instruments::registry::tests::sample_registry;
    use crate::ledger::PositionStatus;
    use crate::market_state::MarketStateCache;
    use crate::types::{Depth, DepthLevel};

    struct Harness {
        engine: ExecutionEngine,
        market_state: Arc<MarketStateCache>,
        accounts: Arc<AccountStore>,
        positions: Arc<PositionBook>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(sample_registry());
        let token_map = Arc::new(OptionTokenMap::new());
        token_map.rebuild_from(&registry);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let alerts = Arc::new(AlertSink::new(store.clone()));
        let market_state = Arc::new(MarketStateCache::new());
        let chains = Arc::new(OptionChainCache::new(
            token_map.clone(),
            store.clone(),
            alerts,
        ));
        let futures = Arc::new(CommodityFuturesCache::new());
        let accounts = Arc::new(AccountStore::new());
        let positions = Arc::new(PositionBook::new());
        let oracle = SnapshotOracle::new(market_state.clone(), chains, futures);

        // Near-zero latency so the async tests stay fast.
        let mut config = ExecutionConfig::default();
        config.nse.latency_mean_ms = 1.0;
        config.nse.latency_shape = 1.0;
        config.nse.slippage_alpha = 0.0;
        config.nse.slippage_beta = 0.0;

        Harness {
            engine: ExecutionEngine::new(
                store,
                accounts.clone(),
                positions.clone(),
                oracle,
                config,
                token_map,
                registry,
            ),
            market_state,
            accounts,
            positions,
        }
    }

    fn set_book(h: &Harness, symbol: &str, bid: f64, ask: f64, bid_qty: i64, ask_qty: i64) {
        h.market_state.inject_depth(
            symbol,
            Depth {
                bids: vec![DepthLevel {
                    price: bid,
                    qty: bid_qty,
                }],
                asks: vec![DepthLevel {
                    price: ask,
                    qty: ask_qty,
                }],
            },
        );
    }

    fn market_buy(symbol: &str, qty: i64) -> OrderRequest {
        OrderRequest {
            user_id: 1,
            symbol: symbol.to_string(),
            exchange_segment: "NSE_EQ".to_string(),
            side: Side::Buy,
            quantity: qty,
            order_type: OrderType::Market,
            product_type: ProductType::Mis,
            price: None,
            trigger_price: None,
            is_super: false,
            target_price: None,
            stop_loss_price: None,
            trailing_jump: None,
        }
    }

    #[tokio::test]
    async fn market_order_fills_at_ask() {
        let h = harness();
        set_book(&h, "SBIN", 99.5, 100.0, 1_000, 1_000);
        let order = h.engine.place_order(market_buy("SBIN", 100)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Executed);
        assert_eq!(order.filled_qty, 100);
        assert!((order.price - 100.0).abs() < 1e-9);

        let position = h.positions.get(1, "SBIN", ProductType::Mis).unwrap();
        assert_eq!(position.quantity, 100);
        assert_eq!(position.status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn partial_fill_margin_and_ledger() {
        let h = harness();
        // wallet 100k, multiplier 5; ask holds only 60 of 100.
        set_book(&h, "SBIN", 99.5, 100.0, 1_000, 60);
        let order = h.engine.place_order(market_buy("SBIN", 100)).await.unwrap();

        assert_eq!(order.status, OrderStatus::Partial);
        assert_eq!(order.filled_qty, 60);

        let margin = h.accounts.margin_for(1);
        // used += 100 * 60 / 5 = 1200
        assert!((margin.used_margin - 1_200.0).abs() < 1e-6);

        let ledger = h.accounts.ledger_for(1);
        assert_eq!(ledger.len(), 1);
        // debit = turnover 6000 + default brokerage 20
        assert!((ledger[0].debit - 6_020.0).abs() < 1e-6);

        // The remainder fills on the next sweep once the book refreshes.
        set_book(&h, "SBIN", 99.5, 100.0, 1_000, 1_000);
        h.engine.process_pending();
        let order = h.engine.get_order(order.id).unwrap();
        assert_eq!(order.status, OrderStatus::Executed);
        assert_eq!(order.filled_qty, 100);
    }

    #[tokio::test]
    async fn filled_qty_is_monotone_across_partials() {
        let h = harness();
        set_book(&h, "SBIN", 99.5, 100.0, 1_000, 30);
        let order = h.engine.place_order(market_buy("SBIN", 90)).await.unwrap();
        let mut last = order.filled_qty;
        for _ in 0..3 {
            set_book(&h, "SBIN", 99.5, 100.0, 1_000, 30);
            h.engine.process_pending();
            let now = h.engine.get_order(order.id).unwrap().filled_qty;
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 90);
    }

    #[tokio::test]
    async fn sell_credits_wallet_and_realizes_pnl() {
        let h = harness();
        set_book(&h, "SBIN", 99.5, 100.0, 1_000, 1_000);
        h.engine.place_order(market_buy("SBIN", 100)).await.unwrap();

        set_book(&h, "SBIN", 110.0, 110.5, 1_000, 1_000);
        let mut req = market_buy("SBIN", 100);
        req.side = Side::Sell;
        let order = h.engine.place_order(req).await.unwrap();
        assert_eq!(order.status, OrderStatus::Executed);

        let position = h.positions.get(1, "SBIN", ProductType::Mis).unwrap();
        assert_eq!(position.quantity, 0);
        assert_eq!(position.status, PositionStatus::Closed);
        assert!((position.realized_pnl - 1_000.0).abs() < 1e-6);

        let ledger = h.accounts.ledger_for(1);
        assert_eq!(ledger.len(), 2);
        // credit = 11000 - 20 brokerage
        assert!((ledger[1].credit - 10_980.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn sl_limit_sell_activates_on_bid_drop() {
        let h = harness();
        set_book(&h, "SBIN", 200.0, 200.5, 1_000, 1_000);

        let mut req = market_buy("SBIN", 10);
        req.side = Side::Sell;
        req.order_type = OrderType::StopLimit;
        req.trigger_price = Some(199.0);
        req.price = Some(198.0);
        let order = h.engine.place_order(req).await.unwrap();
        // Bid 200 > trigger 199: armed, not active.
        assert_eq!(order.status, OrderStatus::Pending);

        // Bid drops through the trigger; activates as LIMIT and fills at
        // the bid (198.5 >= limit 198).
        set_book(&h, "SBIN", 198.5, 199.0, 1_000, 1_000);
        h.engine.process_pending();
        let order = h.engine.get_order(order.id).unwrap();
        assert_eq!(order.status, OrderStatus::Executed);
        assert!((order.price - 198.0).abs() < 1e-9 || order.price >= 198.0);
        let trade_price = order.price;
        assert!(trade_price >= 198.0);
    }

    #[tokio::test]
    async fn trigger_order_without_trigger_rejects() {
        let h = harness();
        set_book(&h, "SBIN", 99.5, 100.0, 1_000, 1_000);
        let mut req = market_buy("SBIN", 10);
        req.order_type = OrderType::StopMarket;
        req.trigger_price = None;
        let order = h.engine.place_order(req).await.unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert_eq!(order.remarks.as_deref(), Some("INVALID_TRIGGER"));
    }

    #[tokio::test]
    async fn blocked_user_is_rejected() {
        let h = harness();
        let mut user = h.accounts.ensure_user(1);
        user.status = "BLOCKED".to_string();
        h.accounts.upsert_user(user);
        let order = h.engine.place_order(market_buy("SBIN", 10)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert_eq!(order.remarks.as_deref(), Some("USER_BLOCKED"));
    }

    #[tokio::test]
    async fn restricted_segment_is_rejected() {
        let h = harness();
        let mut user = h.accounts.ensure_user(1);
        user.allowed_segments = "MCX".to_string();
        h.accounts.upsert_user(user);
        let order = h.engine.place_order(market_buy("SBIN", 10)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert_eq!(order.remarks.as_deref(), Some("SEGMENT_RESTRICTED"));
    }

    #[tokio::test]
    async fn margin_shortfall_warns_but_fills() {
        let h = harness();
        set_book(&h, "SBIN", 999.5, 1_000.0, 100_000, 100_000);
        // 1000 * 10000 / 5 = 2M required vs 500k available.
        let order = h
            .engine
            .place_order(market_buy("SBIN", 10_000))
            .await
            .unwrap();
        assert!(order.margin_warning);
        assert_eq!(order.status, OrderStatus::Executed);
        assert_eq!(order.remarks.as_deref(), Some("MARGIN_EXCEEDED"));
    }

    #[tokio::test]
    async fn limit_order_rests_until_crossed() {
        let h = harness();
        set_book(&h, "SBIN", 99.5, 100.0, 1_000, 1_000);
        let mut req = market_buy("SBIN", 10);
        req.order_type = OrderType::Limit;
        req.price = Some(99.0);
        let order = h.engine.place_order(req).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);

        // Ask falls to the limit; the resting order fills.
        set_book(&h, "SBIN", 98.5, 99.0, 1_000, 1_000);
        h.engine.process_pending();
        let order = h.engine.get_order(order.id).unwrap();
        assert_eq!(order.status, OrderStatus::Executed);
        assert!(order.price <= 99.0);
    }

    #[tokio::test]
    async fn invalid_limit_price_rejects() {
        let h = harness();
        let mut req = market_buy("SBIN", 10);
        req.order_type = OrderType::Limit;
        req.price = None;
        let order = h.engine.place_order(req).await.unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert_eq!(order.remarks.as_deref(), Some("INVALID_PRICE"));
    }

    #[tokio::test]
    async fn stale_pending_order_times_out() {
        let h = harness();
        // No book for the symbol: order rests.
        let mut req = market_buy("GHOSTSYM", 10);
        req.order_type = OrderType::Limit;
        req.price = Some(50.0);
        let order = h.engine.place_order(req).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);

        // Age the order past the exchange timeout.
        {
            let mut orders = h.engine.orders.lock();
            let o = orders.get_mut(&order.id).unwrap();
            o.created_at = Utc::now() - chrono::Duration::seconds(10_000);
        }
        h.engine.process_pending();
        let order = h.engine.get_order(order.id).unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert_eq!(
            order.remarks.as_deref(),
            Some("NO_LIQUIDITY_TIMEOUT")
        );
    }

    #[tokio::test]
    async fn cancel_and_terminal_stickiness() {
        let h = harness();
        let mut req = market_buy("SBIN", 10);
        req.order_type = OrderType::Limit;
        req.price = Some(10.0);
        let order = h.engine.place_order(req).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);

        let cancelled = h.engine.cancel_order(order.id).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        // Terminal statuses are sticky.
        assert!(h.engine.cancel_order(order.id).is_err());
        assert!(h
            .engine
            .modify_order(order.id, Some(11.0), None, None)
            .is_err());
    }

    #[tokio::test]
    async fn square_off_flattens_position() {
        let h = harness();
        set_book(&h, "SBIN", 99.5, 100.0, 1_000, 1_000);
        h.engine.place_order(market_buy("SBIN", 100)).await.unwrap();

        let order = h
            .engine
            .square_off(1, "SBIN", ProductType::Mis)
            .await
            .unwrap();
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.status, OrderStatus::Executed);
        let position = h.positions.get(1, "SBIN", ProductType::Mis).unwrap();
        assert_eq!(position.quantity, 0);
        // A second square-off has nothing to do.
        assert!(h.engine.square_off(1, "SBIN", ProductType::Mis).await.is_err());
    }

    #[tokio::test]
    async fn basket_executes_each_leg() {
        let h = harness();
        set_book(&h, "SBIN", 99.5, 100.0, 1_000, 1_000);
        set_book(&h, "TCS", 49.5, 50.0, 1_000, 1_000);

        let basket = h
            .engine
            .create_basket(
                1,
                "pair",
                vec![
                    BasketLeg {
                        symbol: "SBIN".to_string(),
                        exchange_segment: "NSE_EQ".to_string(),
                        side: Side::Buy,
                        quantity: 10,
                        order_type: OrderType::Market,
                        product_type: ProductType::Mis,
                        price: None,
                        trigger_price: None,
                    },
                    BasketLeg {
                        symbol: "TCS".to_string(),
                        exchange_segment: "NSE_EQ".to_string(),
                        side: Side::Sell,
                        quantity: 5,
                        order_type: OrderType::Market,
                        product_type: ProductType::Mis,
                        price: None,
                        trigger_price: None,
                    },
                ],
            )
            .unwrap();

        let orders = h.engine.execute_basket(basket.id).await.unwrap();
        assert_eq!(orders.len(), 2);
        assert!(orders.iter().all(|o| o.status == OrderStatus::Executed));
    }

    #[tokio::test]
    async fn derivative_fills_respect_lot_step() {
        let h = harness();
        set_book(&h, "NIFTY 24FEB2099 25000 CE", 119.5, 120.0, 1_000, 1_000);
        let mut req = market_buy("NIFTY 24FEB2099 25000 CE", 130);
        req.exchange_segment = "NSE_FNO".to_string();
        let order = h.engine.place_order(req).await.unwrap();
        // NIFTY lot 65: 130 fills as two lots.
        assert_eq!(order.filled_qty, 130);

        // A quantity under one lot never fills and eventually times out.
        let mut req = market_buy("NIFTY 24FEB2099 25000 CE", 30);
        req.exchange_segment = "NSE_FNO".to_string();
        let order = h.engine.place_order(req).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_orders() {
        let h = harness();
        h.engine.stop_accepting();
        assert!(h.engine.place_order(market_buy("SBIN", 10)).await.is_err());
    }
}
