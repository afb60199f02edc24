// =============================================================================
// Account Store — wallets, margin accounts, brokerage plans and the ledger
// =============================================================================
//
// The ledger is append-only; every entry carries the running balance after
// the mutation, so the per-user entry sequence *is* the wallet evolution.
// Margin invariant: available = wallet * multiplier - used after any
// settlement pass.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: i64,
    pub username: String,
    /// "ACTIVE" or "BLOCKED". Blocked users have every order rejected.
    pub status: String,
    /// Comma-separated allowed segment prefixes; empty means unrestricted.
    pub allowed_segments: String,
    pub wallet_balance: f64,
    pub margin_multiplier: f64,
    pub brokerage_plan_id: Option<i64>,
}

impl UserAccount {
    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case("ACTIVE")
    }

    /// Segment gate: an empty allow-list permits everything; otherwise the
    /// segment prefix (e.g. "NSE" from "NSE_FNO") or the full segment must
    /// appear in the list.
    pub fn segment_allowed(&self, exchange_segment: &str) -> bool {
        let allowed: Vec<String> = self
            .allowed_segments
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if allowed.is_empty() {
            return true;
        }
        let seg_full = exchange_segment.to_uppercase();
        let seg_prefix = seg_full.split('_').next().unwrap_or("").to_string();
        allowed.contains(&seg_prefix) || allowed.contains(&seg_full)
    }

    /// Multiplier coerced positive with the platform default of 5x.
    pub fn effective_multiplier(&self) -> f64 {
        if self.margin_multiplier > 0.0 {
            self.margin_multiplier
        } else {
            5.0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokeragePlan {
    pub id: i64,
    pub name: String,
    pub flat_fee: f64,
    pub percent_fee: f64,
    pub max_fee: f64,
}

impl BrokeragePlan {
    pub fn default_plan() -> Self {
        Self {
            id: 0,
            name: "DEFAULT".to_string(),
            flat_fee: 20.0,
            percent_fee: 0.0,
            max_fee: 20.0,
        }
    }

    /// Flat + percent-of-turnover, capped at the plan maximum.
    pub fn fee_for(&self, turnover: f64) -> f64 {
        let fee = self.flat_fee + turnover * self.percent_fee;
        let cap = if self.max_fee > 0.0 { self.max_fee } else { fee };
        fee.min(cap)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginAccount {
    pub user_id: i64,
    pub available_margin: f64,
    pub used_margin: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerKind {
    PayIn,
    PayOut,
    TradePnl,
    Adjust,
}

impl std::fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PayIn => write!(f, "PAYIN"),
            Self::PayOut => write!(f, "PAYOUT"),
            Self::TradePnl => write!(f, "TRADE_PNL"),
            Self::Adjust => write!(f, "ADJUST"),
        }
    }
}

impl LedgerKind {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_uppercase().as_str() {
            "PAYIN" => Some(Self::PayIn),
            "PAYOUT" => Some(Self::PayOut),
            "TRADE_PNL" => Some(Self::TradePnl),
            "ADJUST" => Some(Self::Adjust),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub user_id: i64,
    pub kind: LedgerKind,
    pub credit: f64,
    pub debit: f64,
    pub balance: f64,
    pub remarks: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct Inner {
    users: HashMap<i64, UserAccount>,
    margins: HashMap<i64, MarginAccount>,
    plans: HashMap<i64, BrokeragePlan>,
    ledger: Vec<LedgerEntry>,
}

/// In-memory account state. The persistence gateway mirrors every mutation;
/// this store is the authoritative runtime view.
pub struct AccountStore {
    inner: RwLock<Inner>,
}

impl AccountStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                users: HashMap::new(),
                margins: HashMap::new(),
                plans: HashMap::new(),
                ledger: Vec::new(),
            }),
        }
    }

    // ── Users ───────────────────────────────────────────────────────────

    pub fn upsert_user(&self, user: UserAccount) {
        self.inner.write().users.insert(user.id, user);
    }

    pub fn get_user(&self, user_id: i64) -> Option<UserAccount> {
        self.inner.read().users.get(&user_id).cloned()
    }

    pub fn list_users(&self) -> Vec<UserAccount> {
        let mut users: Vec<_> = self.inner.read().users.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        users
    }

    /// Ensure a default account exists for `user_id` (used by order entry
    /// when no admin has provisioned the account).
    pub fn ensure_user(&self, user_id: i64) -> UserAccount {
        let mut inner = self.inner.write();
        inner
            .users
            .entry(user_id)
            .or_insert_with(|| UserAccount {
                id: user_id,
                username: format!("user-{user_id}"),
                status: "ACTIVE".to_string(),
                allowed_segments: String::new(),
                wallet_balance: 100_000.0,
                margin_multiplier: 5.0,
                brokerage_plan_id: None,
            })
            .clone()
    }

    // ── Brokerage plans ─────────────────────────────────────────────────

    pub fn upsert_plan(&self, plan: BrokeragePlan) {
        self.inner.write().plans.insert(plan.id, plan);
    }

    pub fn list_plans(&self) -> Vec<BrokeragePlan> {
        let mut plans: Vec<_> = self.inner.read().plans.values().cloned().collect();
        plans.sort_by_key(|p| p.id);
        plans
    }

    pub fn plan_for(&self, user: &UserAccount) -> BrokeragePlan {
        let inner = self.inner.read();
        user.brokerage_plan_id
            .and_then(|id| inner.plans.get(&id).cloned())
            .or_else(|| {
                inner
                    .plans
                    .values()
                    .find(|p| p.name == "DEFAULT")
                    .cloned()
            })
            .unwrap_or_else(BrokeragePlan::default_plan)
    }

    // ── Margin ──────────────────────────────────────────────────────────

    pub fn margin_for(&self, user_id: i64) -> MarginAccount {
        let mut inner = self.inner.write();
        let wallet = inner
            .users
            .get(&user_id)
            .map(|u| u.wallet_balance * u.effective_multiplier())
            .unwrap_or(0.0);
        inner
            .margins
            .entry(user_id)
            .or_insert_with(|| MarginAccount {
                user_id,
                available_margin: wallet,
                used_margin: 0.0,
                updated_at: Utc::now(),
            })
            .clone()
    }

    /// Block `amount` of margin: used += amount, available -= amount.
    pub fn consume_margin(&self, user_id: i64, amount: f64) -> MarginAccount {
        self.margin_for(user_id);
        let mut inner = self.inner.write();
        let margin = inner
            .margins
            .get_mut(&user_id)
            .expect("margin row just ensured");
        margin.used_margin += amount;
        margin.available_margin -= amount;
        margin.updated_at = Utc::now();
        margin.clone()
    }

    /// Recompute available margin from the wallet and used margin, restoring
    /// the invariant available = wallet * multiplier - used.
    pub fn recompute_margin(&self, user_id: i64) -> Option<MarginAccount> {
        let mut inner = self.inner.write();
        let (wallet, multiplier) = {
            let user = inner.users.get(&user_id)?;
            (user.wallet_balance, user.effective_multiplier())
        };
        let margin = inner.margins.entry(user_id).or_insert_with(|| MarginAccount {
            user_id,
            available_margin: 0.0,
            used_margin: 0.0,
            updated_at: Utc::now(),
        });
        margin.available_margin = wallet * multiplier - margin.used_margin;
        margin.updated_at = Utc::now();
        Some(margin.clone())
    }

    // ── Wallet & ledger ─────────────────────────────────────────────────

    /// Apply a wallet mutation and append the matching ledger entry. The
    /// entry's balance equals the wallet after the mutation; per-user entries
    /// are totally ordered by insertion.
    pub fn post_ledger(
        &self,
        user_id: i64,
        kind: LedgerKind,
        credit: f64,
        debit: f64,
        remarks: &str,
    ) -> Option<LedgerEntry> {
        let mut inner = self.inner.write();
        let user = inner.users.get_mut(&user_id)?;
        user.wallet_balance = user.wallet_balance + credit - debit;
        let entry = LedgerEntry {
            user_id,
            kind,
            credit,
            debit,
            balance: user.wallet_balance,
            remarks: remarks.to_string(),
            created_at: Utc::now(),
        };
        info!(
            user_id,
            kind = %kind,
            credit,
            debit,
            balance = entry.balance,
            "ledger entry posted"
        );
        inner.ledger.push(entry.clone());
        Some(entry)
    }

    pub fn ledger_for(&self, user_id: i64) -> Vec<LedgerEntry> {
        self.inner
            .read()
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }
}

impl Default for AccountStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AccountStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("AccountStore")
            .field("users", &inner.users.len())
            .field("ledger_entries", &inner.ledger.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_balance_matches_prefix_sums() {
        let store = AccountStore::new();
        let user = store.ensure_user(1);
        let initial = user.wallet_balance;

        store.post_ledger(1, LedgerKind::PayIn, 5_000.0, 0.0, "payin");
        store.post_ledger(1, LedgerKind::TradePnl, 0.0, 1_200.0, "buy fill");
        store.post_ledger(1, LedgerKind::TradePnl, 800.0, 0.0, "sell fill");

        let entries = store.ledger_for(1);
        assert_eq!(entries.len(), 3);
        let mut running = initial;
        for entry in &entries {
            running += entry.credit - entry.debit;
            assert!((entry.balance - running).abs() < 1e-9);
        }
        assert!((store.get_user(1).unwrap().wallet_balance - running).abs() < 1e-9);
    }

    #[test]
    fn margin_consume_and_recompute() {
        let store = AccountStore::new();
        store.ensure_user(7); // wallet 100k, multiplier 5 -> 500k available

        let before = store.margin_for(7);
        assert!((before.available_margin - 500_000.0).abs() < 1e-6);

        let after = store.consume_margin(7, 6_000.0);
        assert!((after.used_margin - 6_000.0).abs() < 1e-6);
        assert!((after.available_margin - 494_000.0).abs() < 1e-6);

        // Wallet changes, then recompute restores the invariant.
        store.post_ledger(7, LedgerKind::PayOut, 0.0, 50_000.0, "payout");
        let recomputed = store.recompute_margin(7).unwrap();
        let user = store.get_user(7).unwrap();
        let expected = user.wallet_balance * user.effective_multiplier() - 6_000.0;
        assert!((recomputed.available_margin - expected).abs() < 1e-6);
    }

    #[test]
    fn segment_gate_uses_prefix_or_full() {
        let mut user = AccountStore::new().ensure_user(1);
        user.allowed_segments = "NSE,MCX_FO".to_string();
        assert!(user.segment_allowed("NSE_EQ"));
        assert!(user.segment_allowed("NSE_FNO"));
        assert!(user.segment_allowed("MCX_FO"));
        assert!(!user.segment_allowed("BSE_EQ"));

        user.allowed_segments.clear();
        assert!(user.segment_allowed("BSE_EQ"));
    }

    #[test]
    fn configured_plan_overrides_the_builtin_default() {
        let store = AccountStore::new();
        store.upsert_plan(BrokeragePlan {
            id: 3,
            name: "ZERO".to_string(),
            flat_fee: 0.0,
            percent_fee: 0.0,
            max_fee: 0.0,
        });

        let mut user = store.ensure_user(1);
        // Without a linked plan the builtin default applies.
        assert!((store.plan_for(&user).fee_for(10_000.0) - 20.0).abs() < 1e-9);

        user.brokerage_plan_id = Some(3);
        store.upsert_user(user.clone());
        assert_eq!(store.plan_for(&user).name, "ZERO");
        assert_eq!(store.plan_for(&user).fee_for(10_000.0), 0.0);
        assert_eq!(store.list_plans().len(), 1);
    }

    #[test]
    fn brokerage_fee_is_capped() {
        let plan = BrokeragePlan {
            id: 1,
            name: "PCT".to_string(),
            flat_fee: 10.0,
            percent_fee: 0.001,
            max_fee: 25.0,
        };
        assert!((plan.fee_for(1_000.0) - 11.0).abs() < 1e-9);
        assert!((plan.fee_for(100_000.0) - 25.0).abs() < 1e-9);
    }
}
