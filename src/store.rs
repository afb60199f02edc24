// =============================================================================
// Persistence Gateway — SQLite write-through store
// =============================================================================
//
// The in-memory subsystems are the authoritative runtime view; every
// mutation is mirrored here so the process can restart without losing
// subscriptions, watchlists, orders, positions or the ledger. All access
// funnels through one connection behind a mutex; statements are short and
// the gateway never holds the lock across I/O other than SQLite itself.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::execution::{ExecutionEvent, Order, Trade};
use crate::ledger::{
    BrokeragePlan, LedgerEntry, MarginAccount, Position, PositionStatus, UserAccount,
};
use crate::types::{OptionSide, OrderStatus, OrderType, ProductType, Side, Tier};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS subscriptions (
    id               INTEGER PRIMARY KEY,
    instrument_token TEXT NOT NULL UNIQUE,
    symbol           TEXT NOT NULL,
    expiry_date      TEXT,
    strike_price     REAL,
    option_type      TEXT,
    tier             TEXT NOT NULL,
    subscribed_at    TEXT NOT NULL,
    ws_connection_id INTEGER,
    active           INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS subscription_log (
    id               INTEGER PRIMARY KEY,
    action           TEXT NOT NULL,
    instrument_token TEXT,
    reason           TEXT,
    created_at       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS watchlist (
    id              INTEGER PRIMARY KEY,
    user_id         INTEGER NOT NULL,
    symbol          TEXT NOT NULL,
    expiry_date     TEXT NOT NULL,
    instrument_type TEXT NOT NULL,
    added_order     INTEGER NOT NULL,
    added_at        TEXT NOT NULL,
    UNIQUE (user_id, symbol, expiry_date)
);
CREATE TABLE IF NOT EXISTS atm_cache (
    id                INTEGER PRIMARY KEY,
    underlying_symbol TEXT NOT NULL UNIQUE,
    current_ltp       REAL NOT NULL,
    atm_strike        REAL NOT NULL,
    strike_step       REAL NOT NULL,
    cached_at         TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS mock_orders (
    id               INTEGER PRIMARY KEY,
    order_ref        TEXT NOT NULL UNIQUE,
    user_id          INTEGER NOT NULL,
    symbol           TEXT NOT NULL,
    exchange_segment TEXT NOT NULL,
    transaction_type TEXT NOT NULL,
    quantity         INTEGER NOT NULL,
    filled_qty       INTEGER NOT NULL DEFAULT 0,
    order_type       TEXT NOT NULL,
    product_type     TEXT NOT NULL,
    price            REAL NOT NULL DEFAULT 0,
    trigger_price    REAL,
    is_super         INTEGER NOT NULL DEFAULT 0,
    target_price     REAL,
    stop_loss_price  REAL,
    trailing_jump    REAL,
    status           TEXT NOT NULL,
    remarks          TEXT,
    margin_warning   INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS mock_trades (
    id         INTEGER PRIMARY KEY,
    order_id   INTEGER NOT NULL,
    user_id    INTEGER NOT NULL,
    symbol     TEXT NOT NULL,
    side       TEXT NOT NULL,
    price      REAL NOT NULL,
    qty        INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS execution_events (
    id             INTEGER PRIMARY KEY,
    order_id       INTEGER,
    user_id        INTEGER,
    symbol         TEXT NOT NULL,
    event_type     TEXT NOT NULL,
    decision_price REAL,
    fill_price     REAL,
    fill_quantity  INTEGER,
    reason         TEXT,
    latency_ms     INTEGER,
    slippage       REAL,
    created_at     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS mock_positions (
    id               INTEGER PRIMARY KEY,
    user_id          INTEGER NOT NULL,
    symbol           TEXT NOT NULL,
    exchange_segment TEXT NOT NULL,
    product_type     TEXT NOT NULL,
    quantity         INTEGER NOT NULL,
    avg_price        REAL NOT NULL,
    realized_pnl     REAL NOT NULL DEFAULT 0,
    status           TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    UNIQUE (user_id, symbol, product_type)
);
CREATE TABLE IF NOT EXISTS ledger_entries (
    id         INTEGER PRIMARY KEY,
    user_id    INTEGER NOT NULL,
    entry_type TEXT NOT NULL,
    credit     REAL NOT NULL DEFAULT 0,
    debit      REAL NOT NULL DEFAULT 0,
    balance    REAL NOT NULL,
    remarks    TEXT,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS mock_baskets (
    id         INTEGER PRIMARY KEY,
    user_id    INTEGER NOT NULL,
    name       TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS mock_basket_legs (
    id               INTEGER PRIMARY KEY,
    basket_id        INTEGER NOT NULL,
    symbol           TEXT NOT NULL,
    exchange_segment TEXT NOT NULL,
    transaction_type TEXT NOT NULL,
    quantity         INTEGER NOT NULL,
    order_type       TEXT NOT NULL,
    product_type     TEXT NOT NULL,
    price            REAL,
    trigger_price    REAL
);
CREATE TABLE IF NOT EXISTS user_accounts (
    id                INTEGER PRIMARY KEY,
    username          TEXT NOT NULL,
    status            TEXT NOT NULL DEFAULT 'ACTIVE',
    allowed_segments  TEXT NOT NULL DEFAULT '',
    wallet_balance    REAL NOT NULL DEFAULT 0,
    margin_multiplier REAL NOT NULL DEFAULT 5,
    brokerage_plan_id INTEGER
);
CREATE TABLE IF NOT EXISTS margin_accounts (
    user_id          INTEGER PRIMARY KEY,
    available_margin REAL NOT NULL DEFAULT 0,
    used_margin      REAL NOT NULL DEFAULT 0,
    updated_at       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS brokerage_plans (
    id          INTEGER PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    flat_fee    REAL NOT NULL DEFAULT 20,
    percent_fee REAL NOT NULL DEFAULT 0,
    max_fee     REAL NOT NULL DEFAULT 20
);
CREATE TABLE IF NOT EXISTS dhan_credentials (
    id         INTEGER PRIMARY KEY,
    client_id  TEXT NOT NULL,
    auth_token TEXT NOT NULL,
    is_default INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS notifications (
    id         INTEGER PRIMARY KEY,
    message    TEXT NOT NULL,
    level      TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

// ---------------------------------------------------------------------------
// Persistence records
// ---------------------------------------------------------------------------

/// Persisted subscription row. Security metadata is intentionally absent:
/// ids can roll over daily, so rehydration re-resolves them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRow {
    pub token: String,
    pub symbol: String,
    pub expiry: Option<String>,
    pub strike: Option<f64>,
    pub option_side: Option<OptionSide>,
    pub tier: Tier,
    pub subscribed_at: DateTime<Utc>,
    pub ws_id: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistRow {
    pub user_id: i64,
    pub symbol: String,
    pub expiry: String,
    pub instrument_type: String,
    pub added_order: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationRow {
    pub message: String,
    pub level: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRow {
    pub client_id: String,
    pub auth_token: String,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).with_context(|| {
            format!("failed to open store at {}", path.as_ref().display())
        })?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to create store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    pub fn upsert_subscription(&self, row: &SubscriptionRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO subscriptions
                 (instrument_token, symbol, expiry_date, strike_price,
                  option_type, tier, subscribed_at, ws_connection_id, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)
             ON CONFLICT(instrument_token) DO UPDATE SET
                 symbol = excluded.symbol,
                 expiry_date = excluded.expiry_date,
                 strike_price = excluded.strike_price,
                 option_type = excluded.option_type,
                 tier = excluded.tier,
                 subscribed_at = excluded.subscribed_at,
                 ws_connection_id = excluded.ws_connection_id,
                 active = 1",
            params![
                row.token,
                row.symbol,
                row.expiry,
                row.strike,
                row.option_side.map(|s| s.to_string()),
                row.tier.to_string(),
                row.subscribed_at.to_rfc3339(),
                row.ws_id as i64,
            ],
        )?;
        Ok(())
    }

    pub fn deactivate_subscription(&self, token: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE subscriptions SET active = 0 WHERE instrument_token = ?1",
            params![token],
        )?;
        Ok(())
    }

    pub fn load_active_subscriptions(&self) -> Result<Vec<SubscriptionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT instrument_token, symbol, expiry_date, strike_price,
                    option_type, tier, subscribed_at, ws_connection_id
             FROM subscriptions WHERE active = 1 ORDER BY subscribed_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let option_type: Option<String> = row.get(4)?;
            let tier: String = row.get(5)?;
            let subscribed_at: String = row.get(6)?;
            let ws_id: i64 = row.get::<_, Option<i64>>(7)?.unwrap_or(1);
            Ok(SubscriptionRow {
                token: row.get(0)?,
                symbol: row.get(1)?,
                expiry: row.get(2)?,
                strike: row.get(3)?,
                option_side: option_type.as_deref().and_then(OptionSide::parse),
                tier: Tier::parse(&tier).unwrap_or(Tier::A),
                subscribed_at: DateTime::parse_from_rfc3339(&subscribed_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                ws_id: ws_id.clamp(1, 5) as u8,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn log_subscription(&self, action: &str, token: &str, reason: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO subscription_log (action, instrument_token, reason, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![action, token, reason, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ── Watchlist ───────────────────────────────────────────────────────

    pub fn insert_watchlist(&self, row: &WatchlistRow) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO watchlist
                 (user_id, symbol, expiry_date, instrument_type, added_order, added_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.user_id,
                row.symbol,
                row.expiry,
                row.instrument_type,
                row.added_order,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn remove_watchlist(&self, user_id: i64, symbol: &str, expiry: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM watchlist
             WHERE user_id = ?1 AND symbol = ?2 AND expiry_date = ?3",
            params![user_id, symbol, expiry],
        )?;
        Ok(deleted > 0)
    }

    pub fn list_watchlist(&self, user_id: i64) -> Result<Vec<WatchlistRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, symbol, expiry_date, instrument_type, added_order
             FROM watchlist WHERE user_id = ?1 ORDER BY added_order ASC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(WatchlistRow {
                user_id: row.get(0)?,
                symbol: row.get(1)?,
                expiry: row.get(2)?,
                instrument_type: row.get(3)?,
                added_order: row.get(4)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn watchlist_count(&self, user_id: i64) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM watchlist WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── ATM cache ───────────────────────────────────────────────────────

    pub fn upsert_atm(&self, underlying: &str, ltp: f64, atm: f64, step: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO atm_cache (underlying_symbol, current_ltp, atm_strike, strike_step, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(underlying_symbol) DO UPDATE SET
                 current_ltp = excluded.current_ltp,
                 atm_strike = excluded.atm_strike,
                 strike_step = excluded.strike_step,
                 cached_at = excluded.cached_at",
            params![underlying, ltp, atm, step, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ── Orders / trades / events ────────────────────────────────────────

    pub fn insert_order(&self, order: &Order) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO mock_orders
                 (order_ref, user_id, symbol, exchange_segment, transaction_type,
                  quantity, filled_qty, order_type, product_type, price,
                  trigger_price, is_super, target_price, stop_loss_price,
                  trailing_jump, status, remarks, margin_warning, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                     ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                order.order_ref,
                order.user_id,
                order.symbol,
                order.exchange_segment,
                order.side.to_string(),
                order.quantity,
                order.filled_qty,
                order.order_type.to_string(),
                order.product_type.to_string(),
                order.price,
                order.trigger_price,
                order.is_super as i64,
                order.target_price,
                order.stop_loss_price,
                order.trailing_jump,
                order.status.to_string(),
                order.remarks,
                order.margin_warning as i64,
                order.created_at.to_rfc3339(),
                order.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_order(&self, order: &Order) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE mock_orders SET
                 filled_qty = ?2, price = ?3, status = ?4, remarks = ?5,
                 margin_warning = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                order.id,
                order.filled_qty,
                order.price,
                order.status.to_string(),
                order.remarks,
                order.margin_warning as i64,
                order.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_open_orders(&self) -> Result<Vec<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, order_ref, user_id, symbol, exchange_segment,
                    transaction_type, quantity, filled_qty, order_type,
                    product_type, price, trigger_price, is_super, target_price,
                    stop_loss_price, trailing_jump, status, remarks,
                    margin_warning, created_at, updated_at
             FROM mock_orders WHERE status IN ('PENDING', 'PARTIAL')
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let side: String = row.get(5)?;
            let order_type: String = row.get(8)?;
            let product: String = row.get(9)?;
            let status: String = row.get(16)?;
            let created: String = row.get(19)?;
            let updated: String = row.get(20)?;
            Ok(Order {
                id: row.get(0)?,
                order_ref: row.get(1)?,
                user_id: row.get(2)?,
                symbol: row.get(3)?,
                exchange_segment: row.get(4)?,
                side: Side::parse(&side).unwrap_or(Side::Buy),
                quantity: row.get(6)?,
                filled_qty: row.get(7)?,
                order_type: OrderType::parse(&order_type).unwrap_or(OrderType::Market),
                product_type: ProductType::parse(&product).unwrap_or(ProductType::Mis),
                price: row.get(10)?,
                trigger_price: row.get(11)?,
                is_super: row.get::<_, i64>(12)? != 0,
                target_price: row.get(13)?,
                stop_loss_price: row.get(14)?,
                trailing_jump: row.get(15)?,
                status: OrderStatus::parse(&status).unwrap_or(OrderStatus::Pending),
                remarks: row.get(17)?,
                margin_warning: row.get::<_, i64>(18)? != 0,
                created_at: DateTime::parse_from_rfc3339(&created)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                updated_at: DateTime::parse_from_rfc3339(&updated)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn insert_trade(&self, trade: &Trade) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO mock_trades (order_id, user_id, symbol, side, price, qty, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                trade.order_id,
                trade.user_id,
                trade.symbol,
                trade.side.to_string(),
                trade.price,
                trade.qty,
                trade.created_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_event(&self, event: &ExecutionEvent) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO execution_events
                 (order_id, user_id, symbol, event_type, decision_price,
                  fill_price, fill_quantity, reason, latency_ms, slippage, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                event.order_id,
                event.user_id,
                event.symbol,
                event.kind.to_string(),
                event.decision_price,
                event.fill_price,
                event.fill_qty,
                event.reason,
                event.latency_ms.map(|v| v as i64),
                event.slippage,
                event.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ── Positions ───────────────────────────────────────────────────────

    pub fn upsert_position(&self, position: &Position) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO mock_positions
                 (user_id, symbol, exchange_segment, product_type, quantity,
                  avg_price, realized_pnl, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(user_id, symbol, product_type) DO UPDATE SET
                 exchange_segment = excluded.exchange_segment,
                 quantity = excluded.quantity,
                 avg_price = excluded.avg_price,
                 realized_pnl = excluded.realized_pnl,
                 status = excluded.status,
                 updated_at = excluded.updated_at",
            params![
                position.user_id,
                position.symbol,
                position.exchange_segment,
                position.product_type.to_string(),
                position.quantity,
                position.avg_price,
                position.realized_pnl,
                position.status.to_string(),
                position.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, symbol, exchange_segment, product_type, quantity,
                    avg_price, realized_pnl, status, updated_at
             FROM mock_positions",
        )?;
        let rows = stmt.query_map([], |row| {
            let product: String = row.get(3)?;
            let status: String = row.get(7)?;
            let updated: String = row.get(8)?;
            Ok(Position {
                user_id: row.get(0)?,
                symbol: row.get(1)?,
                exchange_segment: row.get(2)?,
                product_type: ProductType::parse(&product).unwrap_or(ProductType::Mis),
                quantity: row.get(4)?,
                avg_price: row.get(5)?,
                realized_pnl: row.get(6)?,
                status: if status == "OPEN" {
                    PositionStatus::Open
                } else {
                    PositionStatus::Closed
                },
                updated_at: DateTime::parse_from_rfc3339(&updated)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ── Ledger, users, margin, plans ────────────────────────────────────

    pub fn insert_ledger(&self, entry: &LedgerEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ledger_entries
                 (user_id, entry_type, credit, debit, balance, remarks, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.user_id,
                entry.kind.to_string(),
                entry.credit,
                entry.debit,
                entry.balance,
                entry.remarks,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn upsert_user(&self, user: &UserAccount) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO user_accounts
                 (id, username, status, allowed_segments, wallet_balance,
                  margin_multiplier, brokerage_plan_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 username = excluded.username,
                 status = excluded.status,
                 allowed_segments = excluded.allowed_segments,
                 wallet_balance = excluded.wallet_balance,
                 margin_multiplier = excluded.margin_multiplier,
                 brokerage_plan_id = excluded.brokerage_plan_id",
            params![
                user.id,
                user.username,
                user.status,
                user.allowed_segments,
                user.wallet_balance,
                user.margin_multiplier,
                user.brokerage_plan_id,
            ],
        )?;
        Ok(())
    }

    pub fn load_users(&self) -> Result<Vec<UserAccount>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, username, status, allowed_segments, wallet_balance,
                    margin_multiplier, brokerage_plan_id
             FROM user_accounts",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(UserAccount {
                id: row.get(0)?,
                username: row.get(1)?,
                status: row.get(2)?,
                allowed_segments: row.get(3)?,
                wallet_balance: row.get(4)?,
                margin_multiplier: row.get(5)?,
                brokerage_plan_id: row.get(6)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn upsert_margin(&self, margin: &MarginAccount) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO margin_accounts (user_id, available_margin, used_margin, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                 available_margin = excluded.available_margin,
                 used_margin = excluded.used_margin,
                 updated_at = excluded.updated_at",
            params![
                margin.user_id,
                margin.available_margin,
                margin.used_margin,
                margin.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Upsert a brokerage plan by name and return its row id.
    pub fn save_plan(&self, plan: &BrokeragePlan) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO brokerage_plans (name, flat_fee, percent_fee, max_fee)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                 flat_fee = excluded.flat_fee,
                 percent_fee = excluded.percent_fee,
                 max_fee = excluded.max_fee",
            params![plan.name, plan.flat_fee, plan.percent_fee, plan.max_fee],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM brokerage_plans WHERE name = ?1",
            params![plan.name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn load_plans(&self) -> Result<Vec<BrokeragePlan>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, flat_fee, percent_fee, max_fee
             FROM brokerage_plans ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BrokeragePlan {
                id: row.get(0)?,
                name: row.get(1)?,
                flat_fee: row.get(2)?,
                percent_fee: row.get(3)?,
                max_fee: row.get(4)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ── Credentials & notifications ─────────────────────────────────────

    pub fn default_credentials(&self) -> Result<Option<CredentialRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT client_id, auth_token FROM dhan_credentials
                 WHERE is_default = 1 ORDER BY updated_at DESC LIMIT 1",
                [],
                |row| {
                    Ok(CredentialRow {
                        client_id: row.get(0)?,
                        auth_token: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn set_default_credentials(&self, client_id: &str, auth_token: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("UPDATE dhan_credentials SET is_default = 0", [])?;
        conn.execute(
            "INSERT INTO dhan_credentials (client_id, auth_token, is_default, updated_at)
             VALUES (?1, ?2, 1, ?3)",
            params![client_id, auth_token, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn insert_notification(&self, message: &str, level: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO notifications (message, level, created_at) VALUES (?1, ?2, ?3)",
            params![message, level, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn recent_notifications(&self, limit: i64) -> Result<Vec<NotificationRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT message, level, created_at FROM notifications
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(NotificationRow {
                message: row.get(0)?,
                level: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ── Baskets ─────────────────────────────────────────────────────────

    pub fn insert_basket(&self, user_id: i64, name: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO mock_baskets (user_id, name, created_at) VALUES (?1, ?2, ?3)",
            params![user_id, name, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_basket_leg(
        &self,
        basket_id: i64,
        leg: &crate::execution::BasketLeg,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO mock_basket_legs
                 (basket_id, symbol, exchange_segment, transaction_type,
                  quantity, order_type, product_type, price, trigger_price)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                basket_id,
                leg.symbol,
                leg.exchange_segment,
                leg.side.to_string(),
                leg.quantity,
                leg.order_type.to_string(),
                leg.product_type.to_string(),
                leg.price,
                leg.trigger_price,
            ],
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn subscription_round_trip_and_deactivate() {
        let store = store();
        let row = SubscriptionRow {
            token: "NIFTY_2026-02-26_25000CE".to_string(),
            symbol: "NIFTY".to_string(),
            expiry: Some("2026-02-26".to_string()),
            strike: Some(25_000.0),
            option_side: Some(OptionSide::CE),
            tier: Tier::B,
            subscribed_at: Utc::now(),
            ws_id: 2,
        };
        store.upsert_subscription(&row).unwrap();
        // Idempotent re-upsert keeps a single active row.
        store.upsert_subscription(&row).unwrap();

        let loaded = store.load_active_subscriptions().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].token, row.token);
        assert_eq!(loaded[0].tier, Tier::B);
        assert_eq!(loaded[0].ws_id, 2);

        store.deactivate_subscription(&row.token).unwrap();
        assert!(store.load_active_subscriptions().unwrap().is_empty());
    }

    #[test]
    fn watchlist_uniqueness_is_enforced() {
        let store = store();
        let row = WatchlistRow {
            user_id: 1,
            symbol: "RELIANCE".to_string(),
            expiry: "2026-02-26".to_string(),
            instrument_type: "STOCK_OPTION".to_string(),
            added_order: 1,
        };
        assert!(store.insert_watchlist(&row).unwrap());
        assert!(!store.insert_watchlist(&row).unwrap());
        assert_eq!(store.watchlist_count(1).unwrap(), 1);
        assert!(store.remove_watchlist(1, "RELIANCE", "2026-02-26").unwrap());
        assert_eq!(store.watchlist_count(1).unwrap(), 0);
    }

    #[test]
    fn order_insert_update_and_open_scan() {
        let store = store();
        let mut order = Order {
            id: 0,
            order_ref: "ref-1".to_string(),
            user_id: 1,
            symbol: "SBIN".to_string(),
            exchange_segment: "NSE_EQ".to_string(),
            side: Side::Buy,
            quantity: 100,
            filled_qty: 0,
            order_type: OrderType::Limit,
            product_type: ProductType::Mis,
            price: 500.0,
            trigger_price: None,
            is_super: false,
            target_price: None,
            stop_loss_price: None,
            trailing_jump: None,
            status: OrderStatus::Pending,
            remarks: None,
            margin_warning: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        order.id = store.insert_order(&order).unwrap();
        assert!(order.id > 0);

        let open = store.load_open_orders().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].order_type, OrderType::Limit);

        order.filled_qty = 100;
        order.status = OrderStatus::Executed;
        store.update_order(&order).unwrap();
        assert!(store.load_open_orders().unwrap().is_empty());
    }

    #[test]
    fn position_upsert_replaces_on_conflict() {
        let store = store();
        let mut pos = Position {
            user_id: 1,
            symbol: "SBIN".to_string(),
            exchange_segment: "NSE_EQ".to_string(),
            product_type: ProductType::Mis,
            quantity: 100,
            avg_price: 500.0,
            realized_pnl: 0.0,
            status: PositionStatus::Open,
            updated_at: Utc::now(),
        };
        store.upsert_position(&pos).unwrap();
        pos.quantity = 0;
        pos.status = PositionStatus::Closed;
        pos.realized_pnl = 250.0;
        store.upsert_position(&pos).unwrap();

        let loaded = store.load_positions().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].quantity, 0);
        assert_eq!(loaded[0].status, PositionStatus::Closed);
    }

    #[test]
    fn plan_upsert_by_name_round_trips() {
        let store = store();
        assert!(store.load_plans().unwrap().is_empty());

        let mut plan = BrokeragePlan::default_plan();
        let id = store.save_plan(&plan).unwrap();
        assert!(id > 0);

        // Re-saving the same name updates in place instead of duplicating.
        plan.flat_fee = 15.0;
        let id_again = store.save_plan(&plan).unwrap();
        assert_eq!(id, id_again);

        let loaded = store.load_plans().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "DEFAULT");
        assert!((loaded[0].flat_fee - 15.0).abs() < 1e-9);

        store
            .save_plan(&BrokeragePlan {
                id: 0,
                name: "PRO".to_string(),
                flat_fee: 10.0,
                percent_fee: 0.0005,
                max_fee: 15.0,
            })
            .unwrap();
        assert_eq!(store.load_plans().unwrap().len(), 2);
    }

    #[test]
    fn credentials_default_flag_moves() {
        let store = store();
        assert!(store.default_credentials().unwrap().is_none());
        store.set_default_credentials("client-a", "token-a").unwrap();
        store.set_default_credentials("client-b", "token-b").unwrap();
        let creds = store.default_credentials().unwrap().unwrap();
        assert_eq!(creds.client_id, "client-b");
    }
}
