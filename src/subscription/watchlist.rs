// =============================================================================
// Watchlist Manager — user intent driving Tier A subscriptions
// =============================================================================
//
// Adding an option row fans out into CE/PE subscriptions across the
// ATM-centered strike window; adding an equity subscribes a single QUOTE
// token. "EQ" is the sentinel expiry for equity rows. Removal unsubscribes
// the matching Tier A entries; EOD clearing protects symbols with open
// positions.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::fabric::SubscriptionFabric;
use crate::chain::window_half_for;
use crate::instruments::{fmt_strike, security_ids, InstrumentRegistry};
use crate::ledger::Position;
use crate::store::{Store, WatchlistRow};
use crate::types::{OptionSide, Tier};

pub const EQUITY_EXPIRY_MARKER: &str = "EQ";

#[derive(Debug, Clone, Serialize)]
pub struct WatchlistAddResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strikes_subscribed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl WatchlistAddResult {
    fn failure(message: impl Into<String>, error: &str) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error.to_string()),
            strikes_subscribed: None,
            token: None,
        }
    }
}

pub struct WatchlistManager {
    store: Arc<Store>,
    fabric: Arc<SubscriptionFabric>,
    registry: Arc<InstrumentRegistry>,
    wide_indices: Vec<String>,
}

impl WatchlistManager {
    pub fn new(
        store: Arc<Store>,
        fabric: Arc<SubscriptionFabric>,
        registry: Arc<InstrumentRegistry>,
        wide_indices: Vec<String>,
    ) -> Self {
        Self {
            store,
            fabric,
            registry,
            wide_indices,
        }
    }

    fn normalize_expiry(expiry: &str, instrument_type: &str) -> String {
        let trimmed = expiry.trim().to_string();
        if instrument_type.eq_ignore_ascii_case("EQUITY") && trimmed.is_empty() {
            EQUITY_EXPIRY_MARKER.to_string()
        } else if trimmed.is_empty() {
            EQUITY_EXPIRY_MARKER.to_string()
        } else {
            trimmed
        }
    }

    /// Option token for a watchlist chain leg.
    fn leg_token(symbol: &str, expiry: &str, strike: f64, side: OptionSide) -> String {
        format!("{symbol}_{expiry}_{}{side}", fmt_strike(strike))
    }

    // -------------------------------------------------------------------------
    // Add
    // -------------------------------------------------------------------------

    pub fn add(
        &self,
        user_id: i64,
        symbol: &str,
        expiry: &str,
        instrument_type: &str,
        underlying_ltp: Option<f64>,
    ) -> WatchlistAddResult {
        let instrument_type = instrument_type.trim().to_uppercase();
        let symbol = security_ids::canonical_symbol(symbol);
        let expiry = Self::normalize_expiry(expiry, &instrument_type);

        if !matches!(
            instrument_type.as_str(),
            "EQUITY" | "STOCK_OPTION" | "INDEX_OPTION"
        ) {
            return WatchlistAddResult::failure(
                format!("instrument_type {instrument_type} not allowed"),
                "INSTRUMENT_TYPE_NOT_ALLOWED",
            );
        }

        let added_order = self.store.watchlist_count(user_id).unwrap_or(0) + 1;
        let row = WatchlistRow {
            user_id,
            symbol: symbol.clone(),
            expiry: expiry.clone(),
            instrument_type: instrument_type.clone(),
            added_order,
        };
        let inserted = match self.store.insert_watchlist(&row) {
            Ok(inserted) => inserted,
            Err(e) => {
                warn!(error = %e, "watchlist insert failed");
                return WatchlistAddResult::failure(
                    format!("error adding {symbol} to watchlist"),
                    "STORAGE",
                );
            }
        };

        // A duplicate row still re-ensures its subscriptions; users expect
        // re-adding a symbol to repair a torn-down chain.
        let duplicate = !inserted;

        let outcome = if instrument_type == "EQUITY" {
            self.subscribe_equity(&symbol)
        } else {
            let ltp = match underlying_ltp {
                Some(ltp) if ltp > 0.0 => ltp,
                _ => {
                    if !duplicate {
                        let _ = self.store.remove_watchlist(user_id, &symbol, &expiry);
                    }
                    return WatchlistAddResult::failure(
                        "underlying_ltp required for option chains",
                        "MISSING_LTP",
                    );
                }
            };
            self.subscribe_chain(&symbol, &expiry, ltp)
        };

        match outcome {
            Ok(result) => {
                info!(
                    user_id,
                    symbol = %symbol,
                    expiry = %expiry,
                    duplicate,
                    "watchlist add complete"
                );
                WatchlistAddResult {
                    success: true,
                    message: if duplicate {
                        format!("{symbol} already in watchlist; subscriptions ensured")
                    } else {
                        format!("Added {symbol} to watchlist ({expiry})")
                    },
                    error: duplicate.then(|| "DUPLICATE".to_string()),
                    strikes_subscribed: result.0,
                    token: result.1,
                }
            }
            Err(reason) => {
                if !duplicate {
                    let _ = self.store.remove_watchlist(user_id, &symbol, &expiry);
                }
                WatchlistAddResult::failure(format!("{symbol}: {reason}"), &reason)
            }
        }
    }

    fn subscribe_equity(&self, symbol: &str) -> Result<(Option<usize>, Option<String>), String> {
        let token = format!("EQUITY_{symbol}");
        let outcome = self.fabric.subscribe(&token, symbol, None, None, None, Tier::A);
        if outcome.ok {
            Ok((None, Some(token)))
        } else {
            Err(outcome.reason.unwrap_or_else(|| "SUBSCRIPTION_FAILED".to_string()))
        }
    }

    fn subscribe_chain(
        &self,
        symbol: &str,
        expiry: &str,
        underlying_ltp: f64,
    ) -> Result<(Option<usize>, Option<String>), String> {
        let step = self.registry.strike_step(symbol);
        if step <= 0.0 {
            return Err("NO_STRIKE_STEP".to_string());
        }
        let half = window_half_for(symbol, &self.wide_indices, &self.registry);
        let atm = (underlying_ltp / step).round() * step;

        let mut subscribed = 0;
        let mut rejected = None;
        for i in -half..=half {
            let strike = atm + i as f64 * step;
            if strike <= 0.0 {
                continue;
            }
            for side in [OptionSide::CE, OptionSide::PE] {
                let token = Self::leg_token(symbol, expiry, strike, side);
                let outcome = self.fabric.subscribe(
                    &token,
                    symbol,
                    Some(expiry),
                    Some(strike),
                    Some(side),
                    Tier::A,
                );
                if outcome.ok {
                    subscribed += 1;
                } else if rejected.is_none() {
                    rejected = outcome.reason;
                }
            }
        }

        if subscribed == 0 {
            Err(rejected.unwrap_or_else(|| "SUBSCRIPTION_FAILED".to_string()))
        } else {
            Ok((Some(subscribed), None))
        }
    }

    // -------------------------------------------------------------------------
    // Remove / list / clear
    // -------------------------------------------------------------------------

    pub fn remove(&self, user_id: i64, symbol: &str, expiry: &str) -> bool {
        let symbol = security_ids::canonical_symbol(symbol);
        let removed = self
            .store
            .remove_watchlist(user_id, &symbol, expiry)
            .unwrap_or(false);
        if removed {
            self.unsubscribe_symbol_entries(&symbol, expiry, "WATCHLIST_REMOVE");
        }
        removed
    }

    fn unsubscribe_symbol_entries(&self, symbol: &str, expiry: &str, reason: &str) {
        for entry in self.fabric.list_active(Some(Tier::A)) {
            if entry.canonical != symbol {
                continue;
            }
            let matches = if expiry == EQUITY_EXPIRY_MARKER {
                entry.expiry.is_none()
            } else {
                entry.expiry.as_deref() == Some(expiry)
            };
            if matches {
                self.fabric.unsubscribe(&entry.token, reason);
            }
        }
    }

    pub fn list(&self, user_id: i64) -> Vec<WatchlistRow> {
        self.store.list_watchlist(user_id).unwrap_or_default()
    }

    /// EOD clearing: drop every watchlist row whose symbol has no open
    /// position. Subscription teardown happens separately through the
    /// fabric's Tier A cleanup.
    pub fn clear_user_with_protection(&self, user_id: i64, open_positions: &[Position]) -> usize {
        let protected: HashSet<String> = open_positions
            .iter()
            .filter_map(|p| {
                crate::instruments::parse_option_symbol(&p.symbol)
                    .map(|parsed| parsed.underlying)
                    .or_else(|| Some(security_ids::canonical_symbol(&p.symbol)))
            })
            .collect();

        let mut cleared = 0;
        for row in self.list(user_id) {
            if protected.contains(&row.symbol) {
                continue;
            }
            if self
                .store
                .remove_watchlist(user_id, &row.symbol, &row.expiry)
                .unwrap_or(false)
            {
                cleared += 1;
            }
        }
        cleared
    }
}

impl std::fmt::Debug for WatchlistManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchlistManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::registry::tests::sample_registry;
    use crate::instruments::OptionTokenMap;

    fn manager() -> WatchlistManager {
        let registry = Arc::new(sample_registry());
        let token_map = Arc::new(OptionTokenMap::new());
        token_map.rebuild_from(&registry);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let fabric = Arc::new(SubscriptionFabric::new(
            registry.clone(),
            token_map,
            store.clone(),
            300,
        ));
        WatchlistManager::new(store, fabric, registry, Vec::new())
    }

    #[test]
    fn equity_add_subscribes_single_token() {
        let manager = manager();
        let result = manager.add(1, "RELIANCE", "", "EQUITY", None);
        assert!(result.success);
        assert_eq!(result.token.as_deref(), Some("EQUITY_RELIANCE"));
        assert!(manager.fabric.get("EQUITY_RELIANCE").is_some());
        assert_eq!(manager.list(1).len(), 1);
        assert_eq!(manager.list(1)[0].expiry, EQUITY_EXPIRY_MARKER);
    }

    #[test]
    fn option_add_fans_out_over_window() {
        let manager = manager();
        let result = manager.add(1, "RELIANCE", "2099-02-26", "STOCK_OPTION", Some(2_605.0));
        assert!(result.success, "{:?}", result);
        // Stock window: 12 each side, step 20, ATM 2600 -> 25 strikes x 2 legs.
        assert_eq!(result.strikes_subscribed, Some(50));
        assert!(manager
            .fabric
            .get("RELIANCE_2099-02-26_2600CE")
            .is_some());
    }

    #[test]
    fn option_add_without_ltp_fails_clean() {
        let manager = manager();
        let result = manager.add(1, "RELIANCE", "2099-02-26", "STOCK_OPTION", None);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("MISSING_LTP"));
        assert!(manager.list(1).is_empty());
    }

    #[test]
    fn duplicate_add_reensures_and_flags() {
        let manager = manager();
        manager.add(1, "RELIANCE", "", "EQUITY", None);
        let again = manager.add(1, "RELIANCE", "", "EQUITY", None);
        assert!(again.success);
        assert_eq!(again.error.as_deref(), Some("DUPLICATE"));
        assert_eq!(manager.list(1).len(), 1);
    }

    #[test]
    fn unknown_instrument_type_rejected() {
        let manager = manager();
        let result = manager.add(1, "RELIANCE", "", "CRYPTO", None);
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("INSTRUMENT_TYPE_NOT_ALLOWED")
        );
    }

    #[test]
    fn remove_tears_down_matching_tier_a() {
        let manager = manager();
        manager.add(1, "RELIANCE", "2099-02-26", "STOCK_OPTION", Some(2_605.0));
        assert!(manager.fabric.active_count() > 0);
        assert!(manager.remove(1, "RELIANCE", "2099-02-26"));
        assert_eq!(manager.fabric.active_count(), 0);
        assert!(manager.list(1).is_empty());
    }

    #[test]
    fn clear_with_protection_keeps_position_symbols() {
        use crate::ledger::{PositionStatus};
        use crate::types::ProductType;

        let manager = manager();
        manager.add(1, "RELIANCE", "2099-02-26", "STOCK_OPTION", Some(2_605.0));
        manager.add(1, "TCS", "", "EQUITY", None);

        let positions = vec![Position {
            user_id: 1,
            symbol: "RELIANCE 26FEB2099 2600 CE".to_string(),
            exchange_segment: "NSE_FNO".to_string(),
            product_type: ProductType::Mis,
            quantity: 250,
            avg_price: 50.0,
            realized_pnl: 0.0,
            status: PositionStatus::Open,
            updated_at: chrono::Utc::now(),
        }];
        let cleared = manager.clear_user_with_protection(1, &positions);
        assert_eq!(cleared, 1);
        let remaining = manager.list(1);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].symbol, "RELIANCE");
    }
}
