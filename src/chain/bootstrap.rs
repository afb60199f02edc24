// =============================================================================
// Chain Bootstrap — market-aware REST construction of chain skeletons
// =============================================================================
//
// Market open: live bootstrap from the option-chain Data API. Market
// closed: the same snapshot is treated as a closing snapshot and thin
// quotes are synthesized immediately. REST failures fall back to whatever
// the cache already holds; reads are never blocked by a failed refresh.
// Also maintains the MCX near-month futures cache.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::cache::{
    strike_key, synthetic_token, ChainSkeleton, OptionChainCache, OptionLeg, StrikeRow,
};
use super::expiry::select_expiries;
use super::synth::synthesize_missing;
use super::window_half_for;
use crate::feed::rest::VendorRestClient;
use crate::instruments::{security_ids, InstrumentRegistry, OptionTokenMap};
use crate::market_clock::MarketClock;
use crate::subscription::SubscriptionFabric;
use crate::types::{Exchange, OptionSide, Tier};

// ---------------------------------------------------------------------------
// MCX futures cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize)]
pub struct FutureQuote {
    pub symbol: String,
    pub security_id: String,
    pub expiry: Option<String>,
    pub ltp: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// Near-month commodity futures quotes, fed by REST refresh and live ticks.
pub struct CommodityFuturesCache {
    quotes: RwLock<HashMap<String, FutureQuote>>,
}

impl CommodityFuturesCache {
    pub fn new() -> Self {
        Self {
            quotes: RwLock::new(HashMap::new()),
        }
    }

    pub fn update(&self, quote: FutureQuote) {
        self.quotes.write().insert(quote.symbol.clone(), quote);
    }

    pub fn update_ltp(&self, symbol: &str, ltp: f64) {
        if let Some(quote) = self
            .quotes
            .write()
            .get_mut(&security_ids::canonical_symbol(symbol))
        {
            quote.ltp = ltp;
            quote.updated_at = Utc::now();
        }
    }

    pub fn get(&self, symbol: &str) -> Option<FutureQuote> {
        self.quotes
            .read()
            .get(&security_ids::canonical_symbol(symbol))
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<FutureQuote> {
        let mut quotes: Vec<FutureQuote> = self.quotes.read().values().cloned().collect();
        quotes.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        quotes
    }
}

impl Default for CommodityFuturesCache {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Bootstrapper
// ---------------------------------------------------------------------------

pub struct ChainBootstrapper {
    cache: Arc<OptionChainCache>,
    futures: Arc<CommodityFuturesCache>,
    rest: Arc<VendorRestClient>,
    registry: Arc<InstrumentRegistry>,
    token_map: Arc<OptionTokenMap>,
    clock: Arc<MarketClock>,
    wide_indices: Vec<String>,
}

impl ChainBootstrapper {
    pub fn new(
        cache: Arc<OptionChainCache>,
        futures: Arc<CommodityFuturesCache>,
        rest: Arc<VendorRestClient>,
        registry: Arc<InstrumentRegistry>,
        token_map: Arc<OptionTokenMap>,
        clock: Arc<MarketClock>,
        wide_indices: Vec<String>,
    ) -> Self {
        Self {
            cache,
            futures,
            rest,
            registry,
            token_map,
            clock,
            wide_indices,
        }
    }

    fn exchange_for(&self, underlying: &str) -> Exchange {
        let canonical = security_ids::canonical_symbol(underlying);
        if security_ids::mcx_watch_symbols().contains(&canonical.as_str()) {
            Exchange::Mcx
        } else {
            Exchange::Nse
        }
    }

    /// The (scrip, segment) pair the option-chain Data API wants for an
    /// underlying.
    fn underlying_scrip(&self, underlying: &str) -> Option<(i64, String)> {
        let canonical = security_ids::canonical_symbol(underlying);
        if let Some(curated) = security_ids::default_index_security(&canonical) {
            return curated
                .security_id
                .parse()
                .ok()
                .map(|id| (id, curated.segment.to_string()));
        }
        if let Some(future) = self.registry.nearest_mcx_future(&canonical) {
            return future
                .security_id
                .parse()
                .ok()
                .map(|id| (id, "MCX_COMM".to_string()));
        }
        // Stock options key off the cash scrip.
        self.registry
            .rows_for_underlying(&canonical)
            .into_iter()
            .find(|r| r.is_future() && r.expiry.is_none())
            .and_then(|r| r.security_id.parse().ok().map(|id| (id, "NSE_EQ".to_string())))
    }

    /// Bootstrap every permitted index and MCX option underlying. The index
    /// spot tickers subscribe first; their LTPs drive ATM tracking.
    pub async fn bootstrap_all(&self, fabric: &SubscriptionFabric) {
        for index in security_ids::PERMITTED_INDICES {
            fabric.subscribe(&format!("IDX_{index}"), index, None, None, None, Tier::B);
        }
        for index in security_ids::PERMITTED_INDICES {
            if let Err(e) = self.bootstrap_underlying(index, Some(fabric)).await {
                warn!(underlying = index, error = %e, "chain bootstrap failed");
            }
        }
        for symbol in security_ids::mcx_option_underlyings() {
            if let Err(e) = self.bootstrap_underlying(symbol, Some(fabric)).await {
                warn!(underlying = symbol, error = %e, "MCX chain bootstrap failed");
            }
        }
        self.refresh_mcx_futures(Some(fabric)).await;
    }

    /// Build (or refresh) the cached chains for one underlying. When
    /// `fabric` is given, Tier-B subscriptions are seeded for every leg.
    pub async fn bootstrap_underlying(
        &self,
        underlying: &str,
        fabric: Option<&SubscriptionFabric>,
    ) -> Result<()> {
        let canonical = security_ids::canonical_symbol(underlying);
        let (scrip, segment) = self
            .underlying_scrip(&canonical)
            .with_context(|| format!("no vendor scrip for {canonical}"))?;

        let expiries = match self.rest.expiry_list(scrip, &segment).await {
            Ok(list) if !list.is_empty() => list,
            Ok(_) | Err(_) => {
                debug!(underlying = %canonical, "expiry list fell back to registry");
                self.registry.expiries_for_underlying(&canonical)
            }
        };
        let selected = select_expiries(&canonical, &expiries, Utc::now().date_naive());
        if selected.is_empty() {
            anyhow::bail!("no future expiries listed for {canonical}");
        }

        let market_open = self.clock.is_open(self.exchange_for(&canonical));
        for expiry in &selected {
            match self.rest.option_chain(scrip, &segment, expiry).await {
                Ok(data) => {
                    let mut skeleton = self.build_skeleton(&canonical, expiry, &data)?;
                    if !market_open {
                        // Closing snapshot: fill thin quotes right away.
                        synthesize_missing(&mut skeleton.strikes, OptionSide::CE);
                        synthesize_missing(&mut skeleton.strikes, OptionSide::PE);
                    }
                    if let Some(fabric) = fabric {
                        seed_tier_b(fabric, &skeleton);
                    }
                    self.cache.install(skeleton);
                }
                Err(e) => {
                    // Stale cache beats empty: keep whatever we had.
                    warn!(
                        underlying = %canonical,
                        expiry = %expiry,
                        error = %e,
                        "option chain fetch failed; cache left untouched"
                    );
                }
            }
        }

        info!(underlying = %canonical, expiries = selected.len(), market_open, "chain bootstrapped");
        Ok(())
    }

    /// Parse a vendor option-chain payload into a skeleton. The payload
    /// carries `last_price` and an `oc` map of strike -> { ce, pe }.
    pub fn build_skeleton(
        &self,
        underlying: &str,
        expiry: &str,
        data: &Value,
    ) -> Result<ChainSkeleton> {
        let last_price = data
            .get("last_price")
            .and_then(Value::as_f64)
            .filter(|v| *v > 0.0)
            .context("option chain payload missing last_price")?;

        let step = self.registry.strike_step(underlying);
        let half = window_half_for(underlying, &self.wide_indices, &self.registry);
        let atm = (last_price / step).round() * step;
        let expiry_iso = crate::instruments::normalize_expiry(expiry)
            .unwrap_or_else(|| expiry.to_string());

        let lot_size = self
            .token_map
            .lot_size(underlying)
            .or_else(|| self.registry.lot_size(underlying))
            .or_else(|| data.get("lot_size").and_then(Value::as_i64))
            .unwrap_or(1);

        let oc = data.get("oc").and_then(Value::as_object);

        let mut strikes: BTreeMap<i64, StrikeRow> = BTreeMap::new();
        for i in -half..=half {
            let strike = atm + i as f64 * step;
            if strike <= 0.0 {
                continue;
            }
            let row_data = oc.and_then(|map| {
                map.iter()
                    .find(|(k, _)| k.parse::<f64>().map_or(false, |v| (v - strike).abs() < 1e-6))
                    .map(|(_, v)| v)
            });

            let build_leg = |side: OptionSide| -> OptionLeg {
                let token = self
                    .token_map
                    .resolve(side, underlying, strike, &expiry_iso)
                    .map(|m| m.security_id)
                    .unwrap_or_else(|| synthetic_token(side, underlying, strike, &expiry_iso));
                let mut leg = OptionLeg::new(token);
                if let Some(row) = row_data {
                    let side_key = match side {
                        OptionSide::CE => "ce",
                        OptionSide::PE => "pe",
                    };
                    if let Some(leg_data) = row.get(side_key) {
                        leg.ltp = leg_data.get("last_price").and_then(Value::as_f64);
                        leg.bid = leg_data.get("top_bid_price").and_then(Value::as_f64);
                        leg.ask = leg_data.get("top_ask_price").and_then(Value::as_f64);
                        leg.oi = leg_data.get("oi").and_then(Value::as_i64);
                        leg.volume = leg_data.get("volume").and_then(Value::as_i64);
                        leg.iv = leg_data.get("implied_volatility").and_then(Value::as_f64);
                        leg.greeks = leg_data.get("greeks").and_then(Value::as_object).map(|g| {
                            g.iter()
                                .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
                                .collect()
                        });
                    }
                }
                leg
            };

            strikes.insert(
                strike_key(strike),
                StrikeRow {
                    strike,
                    ce: build_leg(OptionSide::CE),
                    pe: build_leg(OptionSide::PE),
                },
            );
        }

        Ok(ChainSkeleton {
            underlying: underlying.to_string(),
            expiry: expiry_iso,
            lot_size,
            strike_step: step,
            atm,
            window_half: half,
            strikes,
            last_updated: Utc::now(),
        })
    }

    /// Refresh the near-month MCX futures quotes; seeds Tier-B ticker
    /// subscriptions for the contracts themselves.
    pub async fn refresh_mcx_futures(&self, fabric: Option<&SubscriptionFabric>) {
        for symbol in security_ids::mcx_watch_symbols() {
            let future = match self.registry.nearest_mcx_future(symbol) {
                Some(future) => future,
                None => continue,
            };

            if let Some(fabric) = fabric {
                fabric.subscribe(
                    &format!("FUT_{}_{}", symbol, future.security_id),
                    symbol,
                    future.expiry.as_deref(),
                    None,
                    None,
                    Tier::B,
                );
            }

            match self.rest.quote("MCX_COMM", &future.security_id).await {
                Ok(entry) => {
                    let ltp = ["ltp", "LTP", "last_price"]
                        .iter()
                        .find_map(|k| entry.get(*k))
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0);
                    if ltp > 0.0 {
                        self.futures.update(FutureQuote {
                            symbol: symbol.to_string(),
                            security_id: future.security_id.clone(),
                            expiry: future.expiry.clone(),
                            ltp,
                            bid: entry.get("top_bid_price").and_then(Value::as_f64),
                            ask: entry.get("top_ask_price").and_then(Value::as_f64),
                            updated_at: Utc::now(),
                        });
                    }
                }
                Err(e) => {
                    debug!(symbol, error = %e, "MCX futures quote refresh failed");
                }
            }
        }
    }
}

/// Subscribe every leg of a skeleton as Tier B; the fabric keeps these in
/// lock-step with later window rebuilds.
pub fn seed_tier_b(fabric: &SubscriptionFabric, skeleton: &ChainSkeleton) {
    for row in skeleton.strikes.values() {
        for side in [OptionSide::CE, OptionSide::PE] {
            let token = synthetic_token(side, &skeleton.underlying, row.strike, &skeleton.expiry);
            fabric.subscribe(
                &token,
                &skeleton.underlying,
                Some(&skeleton.expiry),
                Some(row.strike),
                Some(side),
                Tier::B,
            );
        }
    }
}

impl std::fmt::Debug for ChainBootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainBootstrapper").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertSink;
    use crate::feed::rate_limit::VendorRateLimiter;
    use crate::instruments::registry::tests::sample_registry;
    use crate::store::Store;
    use serde_json::json;

    fn bootstrapper() -> ChainBootstrapper {
        let registry = Arc::new(sample_registry());
        let token_map = Arc::new(OptionTokenMap::new());
        token_map.rebuild_from(&registry);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let alerts = Arc::new(AlertSink::new(store.clone()));
        let rate = Arc::new(VendorRateLimiter::new());
        ChainBootstrapper::new(
            Arc::new(OptionChainCache::new(
                token_map.clone(),
                store.clone(),
                alerts.clone(),
            )),
            Arc::new(CommodityFuturesCache::new()),
            Arc::new(VendorRestClient::new(rate, alerts)),
            registry,
            token_map,
            Arc::new(MarketClock::new()),
            Vec::new(),
        )
    }

    #[test]
    fn skeleton_builds_window_around_rest_atm() {
        let boot = bootstrapper();
        let data = json!({
            "last_price": 25_012.0,
            "oc": {
                "25000.000000": {
                    "ce": {
                        "last_price": 120.0,
                        "top_bid_price": 119.5,
                        "top_ask_price": 120.5,
                        "oi": 100_000,
                        "volume": 5_000,
                        "implied_volatility": 14.2,
                        "greeks": {"delta": 0.52, "theta": -9.8}
                    },
                    "pe": {"last_price": 95.0}
                }
            }
        });

        let skeleton = boot.build_skeleton("NIFTY", "2099-02-24", &data).unwrap();
        assert_eq!(skeleton.expiry, "2099-02-24");
        assert!((skeleton.atm - 25_000.0).abs() < 1e-9);
        assert_eq!(skeleton.window_half, 25);
        assert_eq!(skeleton.strikes.len(), 51);
        assert_eq!(skeleton.lot_size, 65);

        let atm_row = skeleton.strike(25_000.0).unwrap();
        assert_eq!(atm_row.ce.ltp, Some(120.0));
        assert_eq!(atm_row.ce.oi, Some(100_000));
        assert_eq!(
            atm_row.ce.greeks.as_ref().unwrap().get("delta"),
            Some(&0.52)
        );
        assert_eq!(atm_row.pe.ltp, Some(95.0));
        // Resolved strikes use vendor ids; the rest keep synthetic tokens.
        assert_eq!(atm_row.ce.token, "61001");
        let far_row = skeleton.strike(24_000.0).unwrap();
        assert!(far_row.ce.token.starts_with("CE_NIFTY_24000_"));
    }

    #[test]
    fn skeleton_requires_last_price() {
        let boot = bootstrapper();
        assert!(boot
            .build_skeleton("NIFTY", "2099-02-24", &json!({"oc": {}}))
            .is_err());
    }

    #[test]
    fn futures_cache_round_trips() {
        let futures = CommodityFuturesCache::new();
        futures.update(FutureQuote {
            symbol: "CRUDEOIL".to_string(),
            security_id: "428901".to_string(),
            expiry: Some("2099-02-17".to_string()),
            ltp: 6_250.0,
            bid: None,
            ask: None,
            updated_at: Utc::now(),
        });
        futures.update_ltp("CRUDEOIL", 6_300.0);
        assert_eq!(futures.get("crudeoil").unwrap().ltp, 6_300.0);
        assert_eq!(futures.snapshot().len(), 1);
    }
}
