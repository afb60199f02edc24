// =============================================================================
// Option-Chain Cache — ATM-centered strike windows per (underlying, expiry)
// =============================================================================
//
// Two-level map: underlying -> expiry (ISO) -> skeleton, each underlying
// behind its own lock so index ingest never stalls stock ingest. Readers
// receive cloned snapshots; the ingest path and the window rebuilder are
// the only writers.
//
// ATM invariant: skeleton.atm is always the strike nearest the underlying
// LTP rounded to the strike step. A shift of one full step (or an ATM
// outside the current window) rebuilds the window, preserving overlapping
// legs and reporting the strike diff so Tier-B subscriptions can follow.
// =============================================================================

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::synth::synthesize_missing;
use crate::alerts::{AlertLevel, AlertSink};
use crate::instruments::{fmt_strike, normalize_expiry, security_ids, OptionTokenMap};
use crate::store::Store;
use crate::types::{Depth, OptionSide, Tick};

/// Minimum interval between synthesis passes per (underlying, expiry, side).
const SYNTH_INTERVAL: Duration = Duration::from_secs(5);
/// Warm-up guard: on-demand REST refresh at most once per 20 s per
/// underlying.
const REFRESH_GUARD: Duration = Duration::from_secs(20);

/// Strikes keyed in fixed-point (price * 100) so float noise cannot split
/// map entries.
pub fn strike_key(strike: f64) -> i64 {
    (strike * 100.0).round() as i64
}

// ---------------------------------------------------------------------------
// Skeleton types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct OptionLeg {
    /// Vendor security id when resolved, else the synthetic token key.
    pub token: String,
    pub ltp: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub oi: Option<i64>,
    pub volume: Option<i64>,
    pub iv: Option<f64>,
    pub greeks: Option<HashMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<Depth>,
}

impl OptionLeg {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ltp: None,
            bid: None,
            ask: None,
            oi: None,
            volume: None,
            iv: None,
            greeks: None,
            depth: None,
        }
    }

    /// Zero-priced placeholder used for freshly windowed strikes.
    pub fn zeroed(token: impl Into<String>) -> Self {
        let mut leg = Self::new(token);
        leg.ltp = Some(0.0);
        leg.bid = Some(0.0);
        leg.ask = Some(0.0);
        leg
    }

    pub fn has_price(&self) -> bool {
        self.ltp.map_or(false, |v| v > 0.0)
    }

    fn is_synthetic_token(&self) -> bool {
        self.token.starts_with("CE_") || self.token.starts_with("PE_")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StrikeRow {
    pub strike: f64,
    pub ce: OptionLeg,
    pub pe: OptionLeg,
}

impl StrikeRow {
    pub fn empty(strike: f64, ce_token: impl Into<String>, pe_token: impl Into<String>) -> Self {
        Self {
            strike,
            ce: OptionLeg::new(ce_token),
            pe: OptionLeg::new(pe_token),
        }
    }

    pub fn leg(&self, side: OptionSide) -> &OptionLeg {
        match side {
            OptionSide::CE => &self.ce,
            OptionSide::PE => &self.pe,
        }
    }

    pub fn leg_mut(&mut self, side: OptionSide) -> &mut OptionLeg {
        match side {
            OptionSide::CE => &mut self.ce,
            OptionSide::PE => &mut self.pe,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainSkeleton {
    pub underlying: String,
    /// ISO expiry; cache keys always normalize to this form.
    pub expiry: String,
    pub lot_size: i64,
    pub strike_step: f64,
    pub atm: f64,
    pub window_half: i64,
    pub strikes: BTreeMap<i64, StrikeRow>,
    pub last_updated: DateTime<Utc>,
}

impl ChainSkeleton {
    pub fn min_strike(&self) -> Option<f64> {
        self.strikes.values().next().map(|r| r.strike)
    }

    pub fn max_strike(&self) -> Option<f64> {
        self.strikes.values().next_back().map(|r| r.strike)
    }

    pub fn strike(&self, strike: f64) -> Option<&StrikeRow> {
        self.strikes.get(&strike_key(strike))
    }

    /// Serializable snapshot with strikes in ascending order.
    pub fn snapshot(&self) -> SkeletonSnapshot {
        SkeletonSnapshot {
            underlying: self.underlying.clone(),
            expiry: self.expiry.clone(),
            lot_size: self.lot_size,
            strike_step: self.strike_step,
            atm_strike: self.atm,
            strikes: self.strikes.values().cloned().collect(),
            last_updated: self.last_updated.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkeletonSnapshot {
    pub underlying: String,
    pub expiry: String,
    pub lot_size: i64,
    pub strike_step: f64,
    pub atm_strike: f64,
    pub strikes: Vec<StrikeRow>,
    pub last_updated: String,
}

/// Strike-window change produced by an ATM shift; the Tier-B reconciler
/// turns this into subscribe/unsubscribe calls.
#[derive(Debug, Clone, PartialEq)]
pub struct StrikeDiff {
    pub underlying: String,
    pub expiry: String,
    pub added: Vec<f64>,
    pub removed: Vec<f64>,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

type ExpiryChains = HashMap<String, ChainSkeleton>;

pub struct OptionChainCache {
    token_map: Arc<OptionTokenMap>,
    store: Arc<Store>,
    alerts: Arc<AlertSink>,
    underlyings: RwLock<HashMap<String, Arc<Mutex<ExpiryChains>>>>,
    /// Last seen underlying LTP (the ATM registry).
    underlying_ltp: RwLock<HashMap<String, f64>>,
    last_synth: Mutex<HashMap<(String, String, OptionSide), Instant>>,
    synth_alerted: Mutex<HashSet<(String, String)>>,
    refresh_guard: Mutex<HashMap<String, Instant>>,
}

impl OptionChainCache {
    pub fn new(token_map: Arc<OptionTokenMap>, store: Arc<Store>, alerts: Arc<AlertSink>) -> Self {
        Self {
            token_map,
            store,
            alerts,
            underlyings: RwLock::new(HashMap::new()),
            underlying_ltp: RwLock::new(HashMap::new()),
            last_synth: Mutex::new(HashMap::new()),
            synth_alerted: Mutex::new(HashSet::new()),
            refresh_guard: Mutex::new(HashMap::new()),
        }
    }

    fn chains_for(&self, underlying: &str) -> Arc<Mutex<ExpiryChains>> {
        let canonical = security_ids::canonical_symbol(underlying);
        if let Some(chains) = self.underlyings.read().get(&canonical) {
            return chains.clone();
        }
        self.underlyings
            .write()
            .entry(canonical)
            .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())))
            .clone()
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Install (or replace) a skeleton built by the bootstrap path.
    pub fn install(&self, mut skeleton: ChainSkeleton) {
        skeleton.underlying = security_ids::canonical_symbol(&skeleton.underlying);
        if let Some(iso) = normalize_expiry(&skeleton.expiry) {
            skeleton.expiry = iso;
        }
        let chains = self.chains_for(&skeleton.underlying);
        let mut chains = chains.lock();
        debug!(
            underlying = %skeleton.underlying,
            expiry = %skeleton.expiry,
            strikes = skeleton.strikes.len(),
            "chain skeleton installed"
        );
        chains.insert(skeleton.expiry.clone(), skeleton);
    }

    /// Apply an option tick. Returns true when a leg was updated; ticks for
    /// strikes outside every cached window are dropped.
    pub fn apply_option_tick(&self, tick: &Tick) -> bool {
        let side = match tick.option_side {
            Some(side) => side,
            None => return false,
        };
        let strike = match tick.strike {
            Some(strike) => strike,
            None => return false,
        };
        let expiry_iso = match tick.expiry.as_deref().and_then(normalize_expiry) {
            Some(iso) => iso,
            None => return false,
        };
        let underlying = security_ids::canonical_symbol(&tick.symbol);

        let chains = self.chains_for(&underlying);
        let mut chains = chains.lock();
        let skeleton = match chains.get_mut(&expiry_iso) {
            Some(skeleton) => skeleton,
            None => return false,
        };
        let row = match skeleton.strikes.get_mut(&strike_key(strike)) {
            Some(row) => row,
            None => return false,
        };

        let leg = row.leg_mut(side);
        leg.ltp = Some(tick.ltp);
        leg.bid = tick.bid.or(Some(tick.ltp * 0.99));
        leg.ask = tick.ask.or(Some(tick.ltp * 1.01));
        if let Some(depth) = &tick.depth {
            leg.depth = Some(depth.clone());
        }
        skeleton.last_updated = tick.ts;

        // Periodic synthesis for the side that just ticked.
        if tick.ltp > 0.0 {
            let synth_key = (underlying.clone(), expiry_iso.clone(), side);
            let due = {
                let mut last = self.last_synth.lock();
                match last.get(&synth_key) {
                    Some(at) if at.elapsed() < SYNTH_INTERVAL => false,
                    _ => {
                        last.insert(synth_key, Instant::now());
                        true
                    }
                }
            };
            if due {
                let filled = synthesize_missing(&mut skeleton.strikes, side);
                if filled > 0 {
                    self.notify_synthesis(&underlying, &expiry_iso, filled);
                }
            }
        }

        true
    }

    /// Apply an underlying LTP. Updates the ATM registry and rebuilds any
    /// skeleton whose ATM shifted a full step or left the window. The
    /// per-underlying lock makes the rebuild at-most-once per shift: a
    /// second concurrent tick observes the already-moved ATM.
    pub fn apply_underlying_tick(&self, symbol: &str, ltp: f64) -> Vec<StrikeDiff> {
        if ltp <= 0.0 {
            return Vec::new();
        }
        let underlying = security_ids::canonical_symbol(symbol);
        self.underlying_ltp
            .write()
            .insert(underlying.clone(), ltp);

        let chains = match self.underlyings.read().get(&underlying) {
            Some(chains) => chains.clone(),
            None => return Vec::new(),
        };

        let mut diffs = Vec::new();
        let mut chains = chains.lock();
        for skeleton in chains.values_mut() {
            let step = skeleton.strike_step;
            if step <= 0.0 {
                continue;
            }
            let new_atm = (ltp / step).round() * step;
            let shifted = (new_atm - skeleton.atm).abs() >= step;
            let outside = match (skeleton.min_strike(), skeleton.max_strike()) {
                (Some(min), Some(max)) => new_atm < min || new_atm > max,
                _ => true,
            };
            if !shifted && !outside {
                continue;
            }

            let diff = rebuild_window(skeleton, new_atm, &self.token_map);
            if let Err(e) = self.store.upsert_atm(&underlying, ltp, new_atm, step) {
                warn!(underlying = %underlying, error = %e, "failed to persist ATM");
            }
            info!(
                underlying = %underlying,
                expiry = %skeleton.expiry,
                atm = new_atm,
                added = diff.added.len(),
                removed = diff.removed.len(),
                "strike window rebuilt"
            );
            if !diff.added.is_empty() || !diff.removed.is_empty() {
                diffs.push(diff);
            }
        }
        diffs
    }

    fn notify_synthesis(&self, underlying: &str, expiry: &str, count: usize) {
        let key = (underlying.to_string(), expiry.to_string());
        {
            let mut alerted = self.synth_alerted.lock();
            if !alerted.insert(key) {
                return;
            }
        }
        self.alerts.emit_keyed(
            &format!("Synthesized {count} option prices for {underlying} {expiry} due to missing LTPs"),
            AlertLevel::Warn,
            &format!("synth:{underlying}:{expiry}"),
            Duration::ZERO,
        );
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn get(&self, underlying: &str, expiry: &str) -> Option<ChainSkeleton> {
        let expiry_iso = normalize_expiry(expiry)?;
        let chains = self.chains_for(underlying);
        let chains = chains.lock();
        chains.get(&expiry_iso).cloned()
    }

    /// Exact expiry if cached; else the earliest cached expiry on or after
    /// today; else the nearest cached expiry. Stale-but-present beats 404.
    pub fn nearest(&self, underlying: &str, requested: Option<&str>) -> Option<ChainSkeleton> {
        if let Some(requested) = requested {
            if let Some(skeleton) = self.get(underlying, requested) {
                return Some(skeleton);
            }
        }

        let chains = self.chains_for(underlying);
        let chains = chains.lock();
        if chains.is_empty() {
            return None;
        }

        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        let mut expiries: Vec<&String> = chains.keys().collect();
        expiries.sort();
        let chosen = expiries
            .iter()
            .find(|e| e.as_str() >= today.as_str())
            .or_else(|| expiries.last())
            .cloned();
        chosen.and_then(|e| chains.get(e).cloned())
    }

    pub fn available_underlyings(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .underlyings
            .read()
            .iter()
            .filter(|(_, chains)| !chains.lock().is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn available_expiries(&self, underlying: &str) -> Vec<String> {
        let chains = self.chains_for(underlying);
        let chains = chains.lock();
        let mut expiries: Vec<String> = chains.keys().cloned().collect();
        expiries.sort();
        expiries
    }

    pub fn atm_strike(&self, underlying: &str) -> Option<f64> {
        let chains = self.chains_for(underlying);
        let chains = chains.lock();
        chains.values().next().map(|s| s.atm)
    }

    pub fn underlying_ltp(&self, underlying: &str) -> Option<f64> {
        self.underlying_ltp
            .read()
            .get(&security_ids::canonical_symbol(underlying))
            .copied()
    }

    /// Warm-up guard for on-demand REST refresh: true at most once per
    /// 20 s per underlying.
    pub fn should_refresh(&self, underlying: &str) -> bool {
        let canonical = security_ids::canonical_symbol(underlying);
        let mut guard = self.refresh_guard.lock();
        match guard.get(&canonical) {
            Some(at) if at.elapsed() < REFRESH_GUARD => false,
            _ => {
                guard.insert(canonical, Instant::now());
                true
            }
        }
    }
}

impl std::fmt::Debug for OptionChainCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptionChainCache")
            .field("underlyings", &self.underlyings.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Window rebuild
// ---------------------------------------------------------------------------

/// Regenerate the strike window around `new_atm`: overlapping strikes keep
/// their legs (synthetic tokens re-resolved against the map), new strikes
/// enter zero-priced, vanished strikes drop out.
fn rebuild_window(
    skeleton: &mut ChainSkeleton,
    new_atm: f64,
    token_map: &OptionTokenMap,
) -> StrikeDiff {
    let step = skeleton.strike_step;
    let half = skeleton.window_half;
    let expiry = skeleton.expiry.clone();
    let underlying = skeleton.underlying.clone();

    let mut target: Vec<f64> = Vec::with_capacity((half * 2 + 1) as usize);
    for i in -half..=half {
        let strike = new_atm + i as f64 * step;
        if strike > 0.0 {
            target.push(strike);
        }
    }
    if !target.iter().any(|s| (s - new_atm).abs() < 1e-9) {
        target.push(new_atm);
        target.sort_by(|a, b| a.total_cmp(b));
    }

    let mut new_strikes: BTreeMap<i64, StrikeRow> = BTreeMap::new();
    let mut added = Vec::new();

    for strike in target {
        let key = strike_key(strike);
        if let Some(mut row) = skeleton.strikes.remove(&key) {
            // Keep the row; retry token resolution for synthetic legs.
            if row.ce.is_synthetic_token() {
                if let Some(meta) = token_map.resolve(OptionSide::CE, &underlying, strike, &expiry)
                {
                    row.ce.token = meta.security_id;
                }
            }
            if row.pe.is_synthetic_token() {
                if let Some(meta) = token_map.resolve(OptionSide::PE, &underlying, strike, &expiry)
                {
                    row.pe.token = meta.security_id;
                }
            }
            new_strikes.insert(key, row);
        } else {
            let ce_token = token_map
                .resolve(OptionSide::CE, &underlying, strike, &expiry)
                .map(|m| m.security_id)
                .unwrap_or_else(|| synthetic_token(OptionSide::CE, &underlying, strike, &expiry));
            let pe_token = token_map
                .resolve(OptionSide::PE, &underlying, strike, &expiry)
                .map(|m| m.security_id)
                .unwrap_or_else(|| synthetic_token(OptionSide::PE, &underlying, strike, &expiry));
            new_strikes.insert(
                key,
                StrikeRow {
                    strike,
                    ce: OptionLeg::zeroed(ce_token),
                    pe: OptionLeg::zeroed(pe_token),
                },
            );
            added.push(strike);
        }
    }

    let removed: Vec<f64> = skeleton
        .strikes
        .values()
        .map(|row| row.strike)
        .collect();

    skeleton.strikes = new_strikes;
    skeleton.atm = new_atm;
    skeleton.last_updated = Utc::now();

    StrikeDiff {
        underlying,
        expiry,
        added,
        removed,
    }
}

pub(crate) fn synthetic_token(
    side: OptionSide,
    underlying: &str,
    strike: f64,
    expiry_iso: &str,
) -> String {
    format!("{side}_{underlying}_{}_{expiry_iso}", fmt_strike(strike))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Exchange, InstrumentKind};

    fn cache() -> OptionChainCache {
        let store = Arc::new(Store::open_in_memory().unwrap());
        OptionChainCache::new(
            Arc::new(OptionTokenMap::new()),
            store.clone(),
            Arc::new(AlertSink::new(store)),
        )
    }

    fn skeleton(underlying: &str, expiry: &str, atm: f64, step: f64, half: i64) -> ChainSkeleton {
        let mut strikes = BTreeMap::new();
        for i in -half..=half {
            let strike = atm + i as f64 * step;
            if strike <= 0.0 {
                continue;
            }
            strikes.insert(
                strike_key(strike),
                StrikeRow::empty(
                    strike,
                    synthetic_token(OptionSide::CE, underlying, strike, expiry),
                    synthetic_token(OptionSide::PE, underlying, strike, expiry),
                ),
            );
        }
        ChainSkeleton {
            underlying: underlying.to_string(),
            expiry: expiry.to_string(),
            lot_size: 65,
            strike_step: step,
            atm,
            window_half: half,
            strikes,
            last_updated: Utc::now(),
        }
    }

    fn option_tick(symbol: &str, expiry: &str, strike: f64, side: OptionSide, ltp: f64) -> Tick {
        Tick {
            token: "t".to_string(),
            exchange: Exchange::Nse,
            segment: "NSE_FNO".to_string(),
            symbol: symbol.to_string(),
            kind: InstrumentKind::Option,
            expiry: Some(expiry.to_string()),
            strike: Some(strike),
            option_side: Some(side),
            ltp,
            bid: None,
            ask: None,
            depth: None,
            ts: Utc::now(),
        }
    }

    #[test]
    fn option_tick_updates_leg_and_is_idempotent() {
        let cache = cache();
        cache.install(skeleton("NIFTY", "2026-02-26", 25_000.0, 50.0, 25));

        let tick = option_tick("NIFTY", "2026-02-26", 25_000.0, OptionSide::CE, 120.5);
        assert!(cache.apply_option_tick(&tick));
        let first = cache.get("NIFTY", "2026-02-26").unwrap();

        assert!(cache.apply_option_tick(&tick));
        let second = cache.get("NIFTY", "2026-02-26").unwrap();

        let leg1 = first.strike(25_000.0).unwrap().ce.clone();
        let leg2 = second.strike(25_000.0).unwrap().ce.clone();
        assert_eq!(leg1.ltp, Some(120.5));
        assert_eq!(leg1.ltp, leg2.ltp);
        assert_eq!(leg1.bid, leg2.bid);
        assert_eq!(leg1.ask, leg2.ask);
    }

    #[test]
    fn tick_outside_window_is_dropped() {
        let cache = cache();
        cache.install(skeleton("NIFTY", "2026-02-26", 25_000.0, 50.0, 2));
        let tick = option_tick("NIFTY", "2026-02-26", 30_000.0, OptionSide::CE, 5.0);
        assert!(!cache.apply_option_tick(&tick));
    }

    #[test]
    fn atm_shift_rebuilds_window_with_stable_size() {
        let cache = cache();
        cache.install(skeleton("NIFTY", "2026-02-26", 25_000.0, 50.0, 25));
        let before = cache.get("NIFTY", "2026-02-26").unwrap();
        let count_before = before.strikes.len();

        // 25000 -> 25060 rounds to ATM 25050: one-step shift.
        let diffs = cache.apply_underlying_tick("NIFTY", 25_060.0);
        assert_eq!(diffs.len(), 1);
        let diff = &diffs[0];
        assert_eq!(diff.added, vec![26_300.0]);
        assert_eq!(diff.removed, vec![23_750.0]);

        let after = cache.get("NIFTY", "2026-02-26").unwrap();
        assert_eq!(after.atm, 25_050.0);
        assert_eq!(after.strikes.len(), count_before);
        assert!((after.min_strike().unwrap() - 23_800.0).abs() < 1e-9);
        assert!((after.max_strike().unwrap() - 26_300.0).abs() < 1e-9);
    }

    #[test]
    fn small_move_keeps_window() {
        let cache = cache();
        cache.install(skeleton("NIFTY", "2026-02-26", 25_000.0, 50.0, 25));
        // 25020 rounds back to 25000: no shift.
        let diffs = cache.apply_underlying_tick("NIFTY", 25_020.0);
        assert!(diffs.is_empty());
        assert_eq!(cache.get("NIFTY", "2026-02-26").unwrap().atm, 25_000.0);
    }

    #[test]
    fn rebuild_preserves_overlapping_legs() {
        let cache = cache();
        cache.install(skeleton("NIFTY", "2026-02-26", 25_000.0, 50.0, 25));
        let tick = option_tick("NIFTY", "2026-02-26", 25_050.0, OptionSide::CE, 99.0);
        cache.apply_option_tick(&tick);

        cache.apply_underlying_tick("NIFTY", 25_060.0);
        let after = cache.get("NIFTY", "2026-02-26").unwrap();
        assert_eq!(after.strike(25_050.0).unwrap().ce.ltp, Some(99.0));
        // Freshly windowed strikes enter zero-priced.
        assert_eq!(after.strike(26_300.0).unwrap().ce.ltp, Some(0.0));
    }

    #[test]
    fn second_tick_same_shift_is_a_noop() {
        let cache = cache();
        cache.install(skeleton("NIFTY", "2026-02-26", 25_000.0, 50.0, 25));
        let first = cache.apply_underlying_tick("NIFTY", 25_060.0);
        assert_eq!(first.len(), 1);
        // Same price again: ATM already moved, no second rebuild.
        let second = cache.apply_underlying_tick("NIFTY", 25_060.0);
        assert!(second.is_empty());
    }

    #[test]
    fn nearest_prefers_exact_then_future() {
        let cache = cache();
        cache.install(skeleton("NIFTY", "2099-02-24", 25_000.0, 50.0, 5));
        cache.install(skeleton("NIFTY", "2099-03-31", 25_000.0, 50.0, 5));

        let exact = cache.nearest("NIFTY", Some("2099-03-31")).unwrap();
        assert_eq!(exact.expiry, "2099-03-31");

        let fallback = cache.nearest("NIFTY", Some("2099-01-01")).unwrap();
        assert_eq!(fallback.expiry, "2099-02-24");

        let unspecified = cache.nearest("NIFTY", None).unwrap();
        assert_eq!(unspecified.expiry, "2099-02-24");

        assert!(cache.nearest("BANKNIFTY", None).is_none());
    }

    #[test]
    fn refresh_guard_limits_rate() {
        let cache = cache();
        assert!(cache.should_refresh("NIFTY"));
        assert!(!cache.should_refresh("NIFTY"));
        assert!(cache.should_refresh("BANKNIFTY"));
    }

    #[test]
    fn synthesis_alert_fires_once_per_chain() {
        let cache = cache();
        cache.install(skeleton("NIFTY", "2026-02-26", 25_000.0, 50.0, 3));
        // First priced tick triggers a synthesis pass over zero-priced legs.
        let tick = option_tick("NIFTY", "2026-02-26", 25_000.0, OptionSide::CE, 15.0);
        cache.apply_option_tick(&tick);

        let alerted = cache.synth_alerted.lock().clone();
        assert_eq!(alerted.len(), 1);
        assert!(alerted.contains(&("NIFTY".to_string(), "2026-02-26".to_string())));
    }
}
