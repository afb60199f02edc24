// =============================================================================
// Market State — live depth snapshots shared with the execution engine
// =============================================================================
//
// Written only by the tick consumer; read by the execution engine when
// pricing fills. One lock for the whole map: writes are tiny and reads
// clone a single entry. Admins can inject depth for deterministic tests.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::types::{Depth, Tick};

/// Best-of-book view resolved for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct DepthSnapshot {
    pub symbol: String,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub bid_qty: Option<i64>,
    pub ask_qty: Option<i64>,
    pub ltp: Option<f64>,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct SymbolState {
    depth: Option<Depth>,
    bid: Option<f64>,
    ask: Option<f64>,
    ltp: Option<f64>,
    last_update: DateTime<Utc>,
}

pub struct MarketStateCache {
    symbols: RwLock<HashMap<String, SymbolState>>,
}

impl MarketStateCache {
    pub fn new() -> Self {
        Self {
            symbols: RwLock::new(HashMap::new()),
        }
    }

    /// Key ticks by their display symbol; option ticks key the full option
    /// symbol so the oracle finds the exact leg.
    fn key_for(tick: &Tick) -> String {
        match (&tick.expiry, tick.strike, tick.option_side) {
            (Some(expiry), Some(strike), Some(side)) => format!(
                "{} {} {} {}",
                tick.symbol,
                expiry,
                crate::instruments::fmt_strike(strike),
                side
            ),
            _ => tick.symbol.clone(),
        }
    }

    pub fn apply_tick(&self, tick: &Tick) {
        let key = Self::key_for(tick);
        let mut symbols = self.symbols.write();
        let state = symbols.entry(key).or_insert_with(|| SymbolState {
            depth: None,
            bid: None,
            ask: None,
            ltp: None,
            last_update: tick.ts,
        });
        if tick.ltp > 0.0 {
            state.ltp = Some(tick.ltp);
        }
        if tick.bid.is_some() {
            state.bid = tick.bid;
        }
        if tick.ask.is_some() {
            state.ask = tick.ask;
        }
        if let Some(depth) = &tick.depth {
            state.depth = Some(depth.clone());
        }
        state.last_update = tick.ts;
    }

    /// Admin hook: force a depth snapshot for a symbol (test injection).
    pub fn inject_depth(&self, symbol: &str, depth: Depth) {
        let mut symbols = self.symbols.write();
        let state = symbols
            .entry(symbol.to_uppercase())
            .or_insert_with(|| SymbolState {
                depth: None,
                bid: None,
                ask: None,
                ltp: None,
                last_update: Utc::now(),
            });
        state.bid = depth.best_bid().map(|l| l.price);
        state.ask = depth.best_ask().map(|l| l.price);
        state.depth = Some(depth);
        state.last_update = Utc::now();
    }

    /// Resolve the best-of-book for a symbol: explicit depth first, then
    /// the tracked top-of-book, then LTP with zero spread.
    pub fn snapshot(&self, symbol: &str) -> Option<DepthSnapshot> {
        let symbols = self.symbols.read();
        let state = symbols.get(&symbol.to_uppercase())?;

        let (mut bid, mut ask, mut bid_qty, mut ask_qty) = (state.bid, state.ask, None, None);
        if let Some(depth) = &state.depth {
            if let Some(level) = depth.best_bid() {
                bid = Some(level.price);
                bid_qty = Some(level.qty);
            }
            if let Some(level) = depth.best_ask() {
                ask = Some(level.price);
                ask_qty = Some(level.qty);
            }
        }

        Some(DepthSnapshot {
            symbol: symbol.to_uppercase(),
            best_bid: bid,
            best_ask: ask,
            bid_qty,
            ask_qty,
            ltp: state.ltp,
            last_update: state.last_update,
        })
    }

    pub fn ltp(&self, symbol: &str) -> Option<f64> {
        self.symbols
            .read()
            .get(&symbol.to_uppercase())
            .and_then(|s| s.ltp)
    }

    /// Per-symbol last-tick age for the live-feed debug endpoint.
    pub fn tick_ages(&self) -> Vec<(String, i64)> {
        let now = Utc::now();
        let mut ages: Vec<(String, i64)> = self
            .symbols
            .read()
            .iter()
            .map(|(symbol, state)| {
                (
                    symbol.clone(),
                    (now - state.last_update).num_seconds(),
                )
            })
            .collect();
        ages.sort_by(|a, b| a.0.cmp(&b.0));
        ages
    }
}

impl Default for MarketStateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MarketStateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketStateCache")
            .field("symbols", &self.symbols.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DepthLevel, Exchange, InstrumentKind, OptionSide};

    fn tick(symbol: &str, ltp: f64, depth: Option<Depth>) -> Tick {
        Tick {
            token: "t".to_string(),
            exchange: Exchange::Nse,
            segment: "NSE_EQ".to_string(),
            symbol: symbol.to_string(),
            kind: InstrumentKind::Equity,
            expiry: None,
            strike: None,
            option_side: None,
            ltp,
            bid: None,
            ask: None,
            depth,
            ts: Utc::now(),
        }
    }

    #[test]
    fn depth_wins_over_top_of_book() {
        let cache = MarketStateCache::new();
        let depth = Depth {
            bids: vec![DepthLevel {
                price: 99.5,
                qty: 600,
            }],
            asks: vec![DepthLevel {
                price: 100.0,
                qty: 400,
            }],
        };
        cache.apply_tick(&tick("SBIN", 99.8, Some(depth)));

        let snapshot = cache.snapshot("SBIN").unwrap();
        assert_eq!(snapshot.best_bid, Some(99.5));
        assert_eq!(snapshot.best_ask, Some(100.0));
        assert_eq!(snapshot.bid_qty, Some(600));
        assert_eq!(snapshot.ltp, Some(99.8));
    }

    #[test]
    fn zero_ltp_does_not_erase_last_price() {
        let cache = MarketStateCache::new();
        cache.apply_tick(&tick("SBIN", 100.0, None));
        cache.apply_tick(&tick("SBIN", 0.0, None));
        assert_eq!(cache.ltp("SBIN"), Some(100.0));
    }

    #[test]
    fn option_ticks_key_the_full_symbol() {
        let cache = MarketStateCache::new();
        let mut t = tick("NIFTY", 120.0, None);
        t.kind = InstrumentKind::Option;
        t.expiry = Some("2026-02-26".to_string());
        t.strike = Some(25_000.0);
        t.option_side = Some(OptionSide::CE);
        cache.apply_tick(&t);

        assert!(cache.snapshot("NIFTY 2026-02-26 25000 CE").is_some());
        assert!(cache.snapshot("NIFTY").is_none());
    }

    #[test]
    fn injected_depth_is_visible() {
        let cache = MarketStateCache::new();
        cache.inject_depth(
            "TESTSYM",
            Depth {
                bids: vec![DepthLevel {
                    price: 10.0,
                    qty: 5,
                }],
                asks: vec![DepthLevel {
                    price: 11.0,
                    qty: 7,
                }],
            },
        );
        let snapshot = cache.snapshot("testsym").unwrap();
        assert_eq!(snapshot.best_ask, Some(11.0));
        assert_eq!(snapshot.ask_qty, Some(7));
    }
}
