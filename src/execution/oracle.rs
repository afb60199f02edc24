// =============================================================================
// Snapshot Oracle — best bid/ask resolution for order pricing
// =============================================================================
//
// Resolution order for a (symbol, exchange_segment):
//   1. the live market-state depth keyed by the full symbol;
//   2. the option-chain leg when the symbol parses as
//      "UNDERLYING [EXPIRY] STRIKE CE|PE";
//   3. the commodity futures cache;
//   4. the last LTP with zero spread.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::chain::bootstrap::CommodityFuturesCache;
use crate::chain::OptionChainCache;
use crate::instruments::parse_option_symbol;
use crate::market_state::MarketStateCache;

#[derive(Debug, Clone, Default, Serialize)]
pub struct QuoteSnapshot {
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub bid_qty: Option<i64>,
    pub ask_qty: Option<i64>,
    pub last_update: Option<DateTime<Utc>>,
}

impl QuoteSnapshot {
    pub fn has_quote(&self) -> bool {
        self.best_bid.is_some() || self.best_ask.is_some()
    }

    pub fn spread(&self) -> f64 {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => (ask - bid).max(0.0),
            _ => 0.0,
        }
    }
}

pub struct SnapshotOracle {
    market_state: Arc<MarketStateCache>,
    chains: Arc<OptionChainCache>,
    futures: Arc<CommodityFuturesCache>,
}

impl SnapshotOracle {
    pub fn new(
        market_state: Arc<MarketStateCache>,
        chains: Arc<OptionChainCache>,
        futures: Arc<CommodityFuturesCache>,
    ) -> Self {
        Self {
            market_state,
            chains,
            futures,
        }
    }

    pub fn snapshot_for(&self, symbol: &str, _exchange_segment: &str) -> QuoteSnapshot {
        let symbol = symbol.trim().to_uppercase();

        // 1. Live depth.
        if let Some(depth) = self.market_state.snapshot(&symbol) {
            if depth.best_bid.is_some() || depth.best_ask.is_some() {
                return QuoteSnapshot {
                    best_bid: depth.best_bid,
                    best_ask: depth.best_ask,
                    bid_qty: depth.bid_qty,
                    ask_qty: depth.ask_qty,
                    last_update: Some(depth.last_update),
                };
            }
        }

        // 2. Option-chain leg.
        if let Some(parsed) = parse_option_symbol(&symbol) {
            let skeleton = self
                .chains
                .nearest(&parsed.underlying, parsed.expiry.as_deref());
            if let Some(skeleton) = skeleton {
                if let Some(row) = skeleton.strike(parsed.strike) {
                    let leg = row.leg(parsed.side);
                    let bid = leg.bid.filter(|v| *v > 0.0).or(leg.ltp);
                    let ask = leg.ask.filter(|v| *v > 0.0).or(leg.ltp);
                    if bid.is_some() || ask.is_some() {
                        return QuoteSnapshot {
                            best_bid: bid,
                            best_ask: ask,
                            bid_qty: leg.depth.as_ref().and_then(|d| d.best_bid().map(|l| l.qty)),
                            ask_qty: leg.depth.as_ref().and_then(|d| d.best_ask().map(|l| l.qty)),
                            last_update: Some(skeleton.last_updated),
                        };
                    }
                }
            }
        }

        // 3. Commodity futures cache.
        if let Some(future) = self.futures.get(&symbol) {
            if future.ltp > 0.0 {
                return QuoteSnapshot {
                    best_bid: future.bid.or(Some(future.ltp)),
                    best_ask: future.ask.or(Some(future.ltp)),
                    bid_qty: None,
                    ask_qty: None,
                    last_update: Some(future.updated_at),
                };
            }
        }

        // 4. Last LTP, zero spread.
        let base = symbol.split_whitespace().next().unwrap_or(&symbol);
        if let Some(ltp) = self
            .market_state
            .ltp(&symbol)
            .or_else(|| self.market_state.ltp(base))
            .or_else(|| self.chains.underlying_ltp(base))
        {
            if ltp > 0.0 {
                return QuoteSnapshot {
                    best_bid: Some(ltp),
                    best_ask: Some(ltp),
                    bid_qty: None,
                    ask_qty: None,
                    last_update: None,
                };
            }
        }

        QuoteSnapshot::default()
    }
}

impl std::fmt::Debug for SnapshotOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotOracle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertSink;
    use crate::chain::cache::{strike_key, ChainSkeleton, StrikeRow};
    use crate::instruments::OptionTokenMap;
    use crate::store::Store;
    use crate::types::{Depth, DepthLevel, OptionSide};
    use std::collections::BTreeMap;

    fn oracle() -> (SnapshotOracle, Arc<MarketStateCache>, Arc<OptionChainCache>, Arc<CommodityFuturesCache>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let market_state = Arc::new(MarketStateCache::new());
        let chains = Arc::new(OptionChainCache::new(
            Arc::new(OptionTokenMap::new()),
            store.clone(),
            Arc::new(AlertSink::new(store.clone())),
        ));
        let futures = Arc::new(CommodityFuturesCache::new());
        (
            SnapshotOracle::new(market_state.clone(), chains.clone(), futures.clone()),
            market_state,
            chains,
            futures,
        )
    }

    fn skeleton_with_leg(ltp: f64) -> ChainSkeleton {
        let mut strikes = BTreeMap::new();
        let mut row = StrikeRow::empty(25_000.0, "CE_T", "PE_T");
        row.ce.ltp = Some(ltp);
        row.ce.bid = Some(ltp - 0.5);
        row.ce.ask = Some(ltp + 0.5);
        strikes.insert(strike_key(25_000.0), row);
        ChainSkeleton {
            underlying: "NIFTY".to_string(),
            expiry: "2099-02-24".to_string(),
            lot_size: 65,
            strike_step: 50.0,
            atm: 25_000.0,
            window_half: 1,
            strikes,
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn depth_beats_everything() {
        let (oracle, market_state, chains, _) = oracle();
        chains.install(skeleton_with_leg(100.0));
        market_state.inject_depth(
            "NIFTY 2099-02-24 25000 CE",
            Depth {
                bids: vec![DepthLevel { price: 101.0, qty: 65 }],
                asks: vec![DepthLevel { price: 102.0, qty: 130 }],
            },
        );
        let snapshot = oracle.snapshot_for("NIFTY 2099-02-24 25000 CE", "NSE_FNO");
        assert_eq!(snapshot.best_bid, Some(101.0));
        assert_eq!(snapshot.ask_qty, Some(130));
    }

    #[test]
    fn option_symbol_falls_back_to_chain_leg() {
        let (oracle, _, chains, _) = oracle();
        chains.install(skeleton_with_leg(100.0));
        let snapshot = oracle.snapshot_for("NIFTY 2099-02-24 25000 CE", "NSE_FNO");
        assert_eq!(snapshot.best_bid, Some(99.5));
        assert_eq!(snapshot.best_ask, Some(100.5));
        assert!((snapshot.spread() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn futures_cache_serves_commodities() {
        let (oracle, _, _, futures) = oracle();
        futures.update(crate::chain::bootstrap::FutureQuote {
            symbol: "CRUDEOIL".to_string(),
            security_id: "428901".to_string(),
            expiry: None,
            ltp: 6_250.0,
            bid: Some(6_249.0),
            ask: Some(6_251.0),
            updated_at: Utc::now(),
        });
        let snapshot = oracle.snapshot_for("CRUDEOIL", "MCX_COMM");
        assert_eq!(snapshot.best_bid, Some(6_249.0));
        assert_eq!(snapshot.best_ask, Some(6_251.0));
    }

    #[test]
    fn ltp_fallback_has_zero_spread() {
        let (oracle, market_state, _, _) = oracle();
        let tick = crate::types::Tick {
            token: "t".to_string(),
            exchange: crate::types::Exchange::Nse,
            segment: "NSE_EQ".to_string(),
            symbol: "SBIN".to_string(),
            kind: crate::types::InstrumentKind::Equity,
            expiry: None,
            strike: None,
            option_side: None,
            ltp: 500.0,
            bid: None,
            ask: None,
            depth: None,
            ts: Utc::now(),
        };
        market_state.apply_tick(&tick);
        let snapshot = oracle.snapshot_for("SBIN", "NSE_EQ");
        assert_eq!(snapshot.best_bid, Some(500.0));
        assert_eq!(snapshot.best_ask, Some(500.0));
        assert_eq!(snapshot.spread(), 0.0);
    }

    #[test]
    fn unknown_symbol_has_no_quote() {
        let (oracle, _, _, _) = oracle();
        let snapshot = oracle.snapshot_for("GHOST", "NSE_EQ");
        assert!(!snapshot.has_quote());
    }

    #[test]
    fn missing_side_leg_is_unusable() {
        let (oracle, _, chains, _) = oracle();
        chains.install(skeleton_with_leg(100.0));
        // The PE leg carries no prices; parse succeeds, leg yields nothing,
        // and no other source knows the symbol.
        let snapshot = oracle.snapshot_for("NIFTY 2099-02-24 25000 PE", "NSE_FNO");
        assert!(!snapshot.has_quote());
    }
}
