// =============================================================================
// Subscription Fabric — desired-set reconciliation over bounded shards
// =============================================================================
//
// Owns every Subscription row and the token -> shard map. Tier A entries
// are LRU-evictable under capacity pressure; Tier B entries are immortal
// for the session. Every mutation is written through to the store and bumps
// the wire version so the ingestor can re-diff its frames.
//
// Universe rule: a subscribe is NOT_ALLOWED unless the canonical underlying
// is an F&O stock, a permitted index, a curated equity or an MCX watch
// symbol.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::resolver::{MetadataResolver, ResolvedMeta};
use super::shards::ShardTable;
use crate::instruments::{normalize_expiry, security_ids, InstrumentRegistry, OptionTokenMap};
use crate::ledger::Position;
use crate::store::{Store, SubscriptionRow};
use crate::types::{FeedMode, OptionSide, RejectReason, Tier};

/// Floor applied to the global feed-target cap.
const MIN_TARGET_CAP: usize = 50;

/// Outcome of a subscribe call.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeOutcome {
    pub ok: bool,
    pub reason: Option<String>,
    pub ws_id: Option<u8>,
}

impl SubscribeOutcome {
    fn ok(ws_id: u8) -> Self {
        Self {
            ok: true,
            reason: None,
            ws_id: Some(ws_id),
        }
    }

    fn rejected(reason: RejectReason) -> Self {
        Self {
            ok: false,
            reason: Some(reason.to_string()),
            ws_id: None,
        }
    }
}

/// One active subscription with its resolved vendor metadata.
#[derive(Debug, Clone)]
pub struct SubscriptionEntry {
    pub token: String,
    pub symbol: String,
    pub canonical: String,
    pub expiry: Option<String>,
    pub strike: Option<f64>,
    pub option_side: Option<OptionSide>,
    pub tier: Tier,
    pub ws_id: u8,
    pub subscribed_at: DateTime<Utc>,
    pub meta: Option<ResolvedMeta>,
}

impl SubscriptionEntry {
    /// Entries without resolved metadata never reach the vendor wire.
    pub fn is_wireable(&self) -> bool {
        self.meta
            .as_ref()
            .map_or(false, |m| m.security_id.chars().all(|c| c.is_ascii_digit()))
    }
}

/// A resolved instrument the ingestor should keep subscribed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireTarget {
    pub token: String,
    pub security_id: String,
    pub segment: String,
    pub symbol: String,
    pub ws_id: u8,
    pub mode: FeedMode,
}

struct FabricInner {
    subs: HashMap<String, SubscriptionEntry>,
    /// LRU queue of Tier A tokens in subscription order.
    tier_a_lru: VecDeque<String>,
    shards: ShardTable,
    /// security_id -> token reverse index for tick enrichment.
    by_security: HashMap<String, String>,
}

pub struct SubscriptionFabric {
    registry: Arc<InstrumentRegistry>,
    resolver: MetadataResolver,
    store: Arc<Store>,
    inner: Mutex<FabricInner>,
    /// Bumped on every mutation that can change the wire set.
    wire_version: AtomicU64,
    wire_changed: Notify,
    max_targets: usize,
}

impl SubscriptionFabric {
    pub fn new(
        registry: Arc<InstrumentRegistry>,
        token_map: Arc<OptionTokenMap>,
        store: Arc<Store>,
        max_targets: usize,
    ) -> Self {
        Self {
            resolver: MetadataResolver::new(registry.clone(), token_map),
            registry,
            store,
            inner: Mutex::new(FabricInner {
                subs: HashMap::new(),
                tier_a_lru: VecDeque::new(),
                shards: ShardTable::new(),
                by_security: HashMap::new(),
            }),
            wire_version: AtomicU64::new(1),
            wire_changed: Notify::new(),
            max_targets: max_targets.max(MIN_TARGET_CAP),
        }
    }

    // -------------------------------------------------------------------------
    // Universe
    // -------------------------------------------------------------------------

    fn symbol_allowed(&self, canonical: &str) -> bool {
        if security_ids::PERMITTED_INDICES.contains(&canonical) {
            return true;
        }
        if security_ids::tier_a_equity_symbols().contains(&canonical) {
            return true;
        }
        if security_ids::mcx_watch_symbols().contains(&canonical) {
            return true;
        }
        self.registry.is_fo_eligible(canonical)
    }

    // -------------------------------------------------------------------------
    // Subscribe / unsubscribe
    // -------------------------------------------------------------------------

    pub fn subscribe(
        &self,
        token: &str,
        symbol: &str,
        expiry: Option<&str>,
        strike: Option<f64>,
        option_side: Option<OptionSide>,
        tier: Tier,
    ) -> SubscribeOutcome {
        let canonical = security_ids::canonical_symbol(symbol);
        if !self.symbol_allowed(&canonical) {
            debug!(token, symbol = %canonical, "subscribe rejected: outside universe");
            return SubscribeOutcome::rejected(RejectReason::NotAllowed);
        }

        // Idempotent: an existing active subscription just echoes its shard.
        if let Some(existing) = self.inner.lock().subs.get(token) {
            return SubscribeOutcome::ok(existing.ws_id);
        }

        let meta = self.resolver.resolve(&canonical, expiry, strike, option_side);

        let ws_id = {
            let mut inner = self.inner.lock();
            match inner.shards.occupy_first_fit() {
                Some(ws_id) => ws_id,
                None => {
                    // One eviction attempt precedes a capacity rejection.
                    drop(inner);
                    if !self.evict_lru_tier_a() {
                        return SubscribeOutcome::rejected(RejectReason::Capacity);
                    }
                    let mut inner = self.inner.lock();
                    match inner.shards.occupy_first_fit() {
                        Some(ws_id) => ws_id,
                        None => return SubscribeOutcome::rejected(RejectReason::Capacity),
                    }
                }
            }
        };

        let entry = SubscriptionEntry {
            token: token.to_string(),
            symbol: symbol.to_string(),
            canonical: canonical.clone(),
            expiry: expiry.map(|e| e.to_string()),
            strike,
            option_side,
            tier,
            ws_id,
            subscribed_at: Utc::now(),
            meta: meta.clone(),
        };

        {
            let mut inner = self.inner.lock();
            if let Some(meta) = &entry.meta {
                inner
                    .by_security
                    .insert(meta.security_id.clone(), token.to_string());
            }
            if tier == Tier::A {
                inner.tier_a_lru.push_back(token.to_string());
            }
            inner.subs.insert(token.to_string(), entry);
        }

        let row = SubscriptionRow {
            token: token.to_string(),
            symbol: canonical,
            expiry: expiry.map(|e| e.to_string()),
            strike,
            option_side,
            tier,
            subscribed_at: Utc::now(),
            ws_id,
        };
        if let Err(e) = self.store.upsert_subscription(&row) {
            warn!(token, error = %e, "failed to persist subscription");
        }
        if let Err(e) = self.store.log_subscription("SUBSCRIBE", token, &tier.to_string()) {
            warn!(token, error = %e, "failed to log subscription");
        }

        self.mark_wire_changed();
        info!(token, tier = %tier, ws_id, resolved = meta.is_some(), "subscribed");
        SubscribeOutcome::ok(ws_id)
    }

    /// Idempotent unsubscribe; returns whether the token was active.
    pub fn unsubscribe(&self, token: &str, reason: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.subs.remove(token) {
                Some(entry) => {
                    inner.shards.release(entry.ws_id);
                    inner.tier_a_lru.retain(|t| t != token);
                    if let Some(meta) = &entry.meta {
                        inner.by_security.remove(&meta.security_id);
                    }
                    true
                }
                None => false,
            }
        };

        if removed {
            if let Err(e) = self.store.deactivate_subscription(token) {
                warn!(token, error = %e, "failed to deactivate subscription");
            }
            if let Err(e) = self.store.log_subscription("UNSUBSCRIBE", token, reason) {
                warn!(token, error = %e, "failed to log unsubscribe");
            }
            self.mark_wire_changed();
            info!(token, reason, "unsubscribed");
        }
        removed
    }

    /// Evict the least-recently-subscribed Tier A entry. Tier B never
    /// evicts.
    fn evict_lru_tier_a(&self) -> bool {
        let victim = self.inner.lock().tier_a_lru.front().cloned();
        match victim {
            Some(token) => self.unsubscribe(&token, "RATE_LIMIT_EVICTION"),
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // EOD cleanup
    // -------------------------------------------------------------------------

    /// Unsubscribe every Tier A entry except those protecting an open
    /// position. Returns the number unsubscribed.
    pub fn unsubscribe_all_tier_a(&self, open_positions: &[Position]) -> usize {
        let mut protected_tokens: HashSet<String> = HashSet::new();
        let mut protected_keys: HashSet<(String, Option<String>, i64, Option<OptionSide>)> =
            HashSet::new();

        for position in open_positions {
            let symbol = position.symbol.trim();
            if symbol.is_empty() {
                continue;
            }
            protected_tokens.insert(symbol.to_string());
            if let Some(parsed) = crate::instruments::parse_option_symbol(symbol) {
                protected_keys.insert((
                    parsed.underlying,
                    parsed.expiry,
                    strike_key(parsed.strike),
                    Some(parsed.side),
                ));
            } else {
                protected_keys.insert((
                    security_ids::canonical_symbol(symbol),
                    None,
                    0,
                    None,
                ));
            }
        }

        let candidates: Vec<SubscriptionEntry> = {
            let inner = self.inner.lock();
            inner
                .subs
                .values()
                .filter(|e| e.tier == Tier::A)
                .cloned()
                .collect()
        };

        let mut removed = 0;
        for entry in candidates {
            if protected_tokens.contains(&entry.token) {
                continue;
            }
            let entry_key = (
                entry.canonical.clone(),
                entry.expiry.as_deref().and_then(normalize_expiry),
                entry.strike.map(strike_key).unwrap_or(0),
                entry.option_side,
            );
            let protected = protected_keys.iter().any(|(und, exp, strike, side)| {
                *und == entry_key.0
                    && *strike == entry_key.2
                    && *side == entry_key.3
                    && (exp.is_none() || *exp == entry_key.1)
            });
            if protected {
                continue;
            }
            if self.unsubscribe(&entry.token, "EOD_CLEANUP") {
                removed += 1;
            }
        }

        info!(removed, "EOD tier-A cleanup complete");
        removed
    }

    // -------------------------------------------------------------------------
    // Wire targets (desired set for the ingestor)
    // -------------------------------------------------------------------------

    /// Current wire version; the ingestor compares against its last synced
    /// version to decide whether to re-diff.
    pub fn wire_version(&self) -> u64 {
        self.wire_version.load(Ordering::SeqCst)
    }

    /// Await the next wire-set change signal.
    pub async fn wire_changed(&self) {
        self.wire_changed.notified().await;
    }

    fn mark_wire_changed(&self) {
        self.wire_version.fetch_add(1, Ordering::SeqCst);
        self.wire_changed.notify_waiters();
    }

    /// Desired wire targets: resolved entries only, capped at the global
    /// target limit with critical index symbols retained first. Two calls
    /// with an unchanged subscription set return identical vectors.
    pub fn wire_targets(&self) -> Vec<WireTarget> {
        let mut targets: Vec<WireTarget> = {
            let inner = self.inner.lock();
            inner
                .subs
                .values()
                .filter(|e| e.is_wireable())
                .map(|e| {
                    let meta = e.meta.as_ref().expect("wireable entries carry meta");
                    WireTarget {
                        token: e.token.clone(),
                        security_id: meta.security_id.clone(),
                        segment: meta.segment.clone(),
                        symbol: e.canonical.clone(),
                        ws_id: e.ws_id,
                        mode: meta.feed_mode(e.option_side, e.strike),
                    }
                })
                .collect()
        };

        targets.sort_by(|a, b| a.token.cmp(&b.token));

        if targets.len() <= self.max_targets {
            return targets;
        }

        let (mut critical, regular): (Vec<WireTarget>, Vec<WireTarget>) =
            targets.into_iter().partition(|t| {
                security_ids::CRITICAL_INDEX_SYMBOLS.contains(&t.symbol.as_str())
            });

        let trimmed_total = critical.len() + regular.len();
        critical.extend(regular);
        critical.truncate(self.max_targets);
        warn!(
            requested = trimmed_total,
            kept = critical.len(),
            cap = self.max_targets,
            "feed target cap applied"
        );
        critical
    }

    /// Re-resolve entries whose metadata is missing or synthetic; called
    /// after every option-token-map refresh.
    pub fn retry_unresolved(&self) -> usize {
        let unresolved: Vec<SubscriptionEntry> = {
            let inner = self.inner.lock();
            inner
                .subs
                .values()
                .filter(|e| !e.is_wireable())
                .cloned()
                .collect()
        };

        let mut fixed = 0;
        for entry in unresolved {
            let meta = self.resolver.resolve(
                &entry.canonical,
                entry.expiry.as_deref(),
                entry.strike,
                entry.option_side,
            );
            if let Some(meta) = meta {
                let mut inner = self.inner.lock();
                if let Some(live) = inner.subs.get_mut(&entry.token) {
                    live.meta = Some(meta.clone());
                }
                inner
                    .by_security
                    .insert(meta.security_id.clone(), entry.token.clone());
                fixed += 1;
            }
        }
        if fixed > 0 {
            self.mark_wire_changed();
            info!(fixed, "re-resolved previously synthetic subscriptions");
        }
        fixed
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get(&self, token: &str) -> Option<SubscriptionEntry> {
        self.inner.lock().subs.get(token).cloned()
    }

    pub fn find_by_security_id(&self, security_id: &str) -> Option<SubscriptionEntry> {
        let inner = self.inner.lock();
        inner
            .by_security
            .get(security_id)
            .and_then(|token| inner.subs.get(token))
            .cloned()
    }

    pub fn list_active(&self, tier: Option<Tier>) -> Vec<SubscriptionEntry> {
        let inner = self.inner.lock();
        let mut entries: Vec<_> = inner
            .subs
            .values()
            .filter(|e| tier.map_or(true, |t| e.tier == t))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.token.cmp(&b.token));
        entries
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().subs.len()
    }

    pub fn shard_snapshot(&self) -> Vec<super::shards::ShardUsage> {
        self.inner.lock().shards.snapshot()
    }

    // -------------------------------------------------------------------------
    // Rehydration
    // -------------------------------------------------------------------------

    /// Reload active rows from the store, re-resolving metadata (security
    /// ids roll over) and re-occupying shard slots.
    pub fn rehydrate(&self) -> usize {
        let rows = match self.store.load_active_subscriptions() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "failed to load persisted subscriptions");
                return 0;
            }
        };

        let mut loaded = 0;
        for row in rows {
            let canonical = security_ids::canonical_symbol(&row.symbol);
            if !self.symbol_allowed(&canonical) {
                continue;
            }
            let meta = self.resolver.resolve(
                &canonical,
                row.expiry.as_deref(),
                row.strike,
                row.option_side,
            );

            let mut inner = self.inner.lock();
            if inner.subs.contains_key(&row.token) {
                continue;
            }
            let ws_id = match inner.shards.occupy(row.ws_id) {
                Some(ws_id) => ws_id,
                None => continue,
            };
            if let Some(meta) = &meta {
                inner
                    .by_security
                    .insert(meta.security_id.clone(), row.token.clone());
            }
            if row.tier == Tier::A {
                inner.tier_a_lru.push_back(row.token.clone());
            }
            inner.subs.insert(
                row.token.clone(),
                SubscriptionEntry {
                    token: row.token.clone(),
                    symbol: row.symbol.clone(),
                    canonical,
                    expiry: row.expiry.clone(),
                    strike: row.strike,
                    option_side: row.option_side,
                    tier: row.tier,
                    ws_id,
                    subscribed_at: row.subscribed_at,
                    meta,
                },
            );
            loaded += 1;
        }

        if loaded > 0 {
            self.mark_wire_changed();
        }
        info!(loaded, "subscriptions rehydrated from store");
        loaded
    }
}

/// Strikes keyed in fixed-point so float noise never splits a match.
fn strike_key(strike: f64) -> i64 {
    (strike * 100.0).round() as i64
}

impl std::fmt::Debug for SubscriptionFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionFabric")
            .field("active", &self.active_count())
            .field("wire_version", &self.wire_version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::registry::tests::sample_registry;
    use crate::ledger::PositionStatus;
    use crate::types::ProductType;

    fn fabric() -> SubscriptionFabric {
        let registry = Arc::new(sample_registry());
        let token_map = Arc::new(OptionTokenMap::new());
        token_map.rebuild_from(&registry);
        SubscriptionFabric::new(
            registry,
            token_map,
            Arc::new(Store::open_in_memory().unwrap()),
            300,
        )
    }

    fn open_position(symbol: &str) -> Position {
        Position {
            user_id: 1,
            symbol: symbol.to_string(),
            exchange_segment: "NSE_FNO".to_string(),
            product_type: ProductType::Mis,
            quantity: 65,
            avg_price: 100.0,
            realized_pnl: 0.0,
            status: PositionStatus::Open,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn subscribe_outside_universe_is_not_allowed() {
        let fabric = fabric();
        let outcome = fabric.subscribe("EQUITY_UNKNOWN", "UNKNOWN", None, None, None, Tier::A);
        assert!(!outcome.ok);
        assert_eq!(outcome.reason.as_deref(), Some("NOT_ALLOWED"));
    }

    #[test]
    fn subscribe_unsubscribe_subscribe_leaves_one_active() {
        let fabric = fabric();
        let token = "NIFTY_2099-02-24_25000CE";
        let first = fabric.subscribe(
            token,
            "NIFTY",
            Some("2099-02-24"),
            Some(25_000.0),
            Some(OptionSide::CE),
            Tier::B,
        );
        assert!(first.ok);
        assert!(fabric.unsubscribe(token, "test"));
        assert!(!fabric.unsubscribe(token, "test")); // idempotent
        let again = fabric.subscribe(
            token,
            "NIFTY",
            Some("2099-02-24"),
            Some(25_000.0),
            Some(OptionSide::CE),
            Tier::B,
        );
        assert!(again.ok);
        assert_eq!(fabric.active_count(), 1);
        assert_eq!(fabric.list_active(Some(Tier::B)).len(), 1);
    }

    #[test]
    fn resubscribe_is_idempotent_and_keeps_shard() {
        let fabric = fabric();
        let first = fabric.subscribe("EQUITY_RELIANCE", "RELIANCE", None, None, None, Tier::A);
        let second = fabric.subscribe("EQUITY_RELIANCE", "RELIANCE", None, None, None, Tier::A);
        assert_eq!(first.ws_id, second.ws_id);
        assert_eq!(fabric.active_count(), 1);
    }

    #[test]
    fn unresolved_option_is_kept_but_not_wireable() {
        let fabric = fabric();
        let outcome = fabric.subscribe(
            "CE_NIFTY_99999_2099-02-24",
            "NIFTY",
            Some("2099-02-24"),
            Some(99_999.0),
            Some(OptionSide::CE),
            Tier::B,
        );
        assert!(outcome.ok);
        let targets = fabric.wire_targets();
        assert!(targets.is_empty());
        let entry = fabric.get("CE_NIFTY_99999_2099-02-24").unwrap();
        assert!(!entry.is_wireable());
    }

    #[test]
    fn wire_targets_are_stable_without_changes() {
        let fabric = fabric();
        fabric.subscribe("EQUITY_RELIANCE", "RELIANCE", None, None, None, Tier::A);
        fabric.subscribe(
            "NIFTY_2099-02-24_25000CE",
            "NIFTY",
            Some("2099-02-24"),
            Some(25_000.0),
            Some(OptionSide::CE),
            Tier::B,
        );
        let version = fabric.wire_version();
        let first = fabric.wire_targets();
        let second = fabric.wire_targets();
        assert_eq!(first, second);
        assert_eq!(fabric.wire_version(), version);
    }

    #[test]
    fn option_targets_stream_quote_mode() {
        let fabric = fabric();
        fabric.subscribe(
            "NIFTY_2099-02-24_25000CE",
            "NIFTY",
            Some("2099-02-24"),
            Some(25_000.0),
            Some(OptionSide::CE),
            Tier::B,
        );
        let targets = fabric.wire_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].mode, FeedMode::Quote);
        assert_eq!(targets[0].security_id, "61001");
    }

    #[test]
    fn eod_cleanup_protects_open_positions() {
        let fabric = fabric();
        fabric.subscribe(
            "NIFTY_2099-02-24_25000CE",
            "NIFTY",
            Some("2099-02-24"),
            Some(25_000.0),
            Some(OptionSide::CE),
            Tier::A,
        );
        fabric.subscribe(
            "NIFTY_2099-02-24_25050CE",
            "NIFTY",
            Some("2099-02-24"),
            Some(25_050.0),
            Some(OptionSide::CE),
            Tier::A,
        );
        fabric.subscribe(
            "RELIANCE_2099-02-26_2600CE",
            "RELIANCE",
            Some("2099-02-26"),
            Some(2_600.0),
            Some(OptionSide::CE),
            Tier::B,
        );

        let positions = vec![open_position("NIFTY 24FEB2099 25000 CE")];
        let removed = fabric.unsubscribe_all_tier_a(&positions);

        assert_eq!(removed, 1);
        assert!(fabric.get("NIFTY_2099-02-24_25000CE").is_some());
        assert!(fabric.get("NIFTY_2099-02-24_25050CE").is_none());
        // Tier B untouched.
        assert!(fabric.get("RELIANCE_2099-02-26_2600CE").is_some());
    }

    #[test]
    fn lru_eviction_prefers_oldest_tier_a() {
        let registry = Arc::new(sample_registry());
        let token_map = Arc::new(OptionTokenMap::new());
        token_map.rebuild_from(&registry);
        let fabric = SubscriptionFabric::new(
            registry,
            token_map,
            Arc::new(Store::open_in_memory().unwrap()),
            300,
        );
        // Shrink capacity: 5 shards x 1 slot.
        fabric.inner.lock().shards = ShardTable::with_capacity(1);

        fabric.subscribe("EQUITY_RELIANCE", "RELIANCE", None, None, None, Tier::A);
        fabric.subscribe("EQUITY_TCS", "TCS", None, None, None, Tier::A);
        for i in 0..3 {
            fabric.subscribe(
                &format!("FILL_{i}"),
                "NIFTY",
                None,
                None,
                None,
                Tier::B,
            );
        }
        assert_eq!(fabric.active_count(), 5);

        // Capacity pressure evicts the oldest Tier A (RELIANCE).
        let outcome = fabric.subscribe("EQUITY_SBIN", "SBIN", None, None, None, Tier::A);
        assert!(outcome.ok);
        assert!(fabric.get("EQUITY_RELIANCE").is_none());
        assert!(fabric.get("EQUITY_TCS").is_some());
    }

    #[test]
    fn capacity_with_only_tier_b_rejects() {
        let registry = Arc::new(sample_registry());
        let token_map = Arc::new(OptionTokenMap::new());
        token_map.rebuild_from(&registry);
        let fabric = SubscriptionFabric::new(
            registry,
            token_map,
            Arc::new(Store::open_in_memory().unwrap()),
            300,
        );
        fabric.inner.lock().shards = ShardTable::with_capacity(1);
        for i in 0..5 {
            fabric.subscribe(&format!("B_{i}"), "NIFTY", None, None, None, Tier::B);
        }
        let outcome = fabric.subscribe("EQUITY_SBIN", "SBIN", None, None, None, Tier::A);
        assert!(!outcome.ok);
        assert_eq!(outcome.reason.as_deref(), Some("CAPACITY"));
    }

    #[test]
    fn rehydrate_restores_and_reresolves() {
        let registry = Arc::new(sample_registry());
        let token_map = Arc::new(OptionTokenMap::new());
        token_map.rebuild_from(&registry);
        let store = Arc::new(Store::open_in_memory().unwrap());

        {
            let fabric = SubscriptionFabric::new(
                registry.clone(),
                token_map.clone(),
                store.clone(),
                300,
            );
            fabric.subscribe(
                "NIFTY_2099-02-24_25000CE",
                "NIFTY",
                Some("2099-02-24"),
                Some(25_000.0),
                Some(OptionSide::CE),
                Tier::B,
            );
        }

        let fabric = SubscriptionFabric::new(registry, token_map, store, 300);
        assert_eq!(fabric.rehydrate(), 1);
        let entry = fabric.get("NIFTY_2099-02-24_25000CE").unwrap();
        assert!(entry.is_wireable());
        assert_eq!(fabric.wire_targets().len(), 1);
    }

    #[test]
    fn sbin_outside_universe_unless_curated() {
        let fabric = fabric();
        // SBIN is in the curated tier-A equity list.
        let outcome = fabric.subscribe("EQUITY_SBIN", "SBIN", None, None, None, Tier::A);
        assert!(outcome.ok);
        // But an arbitrary symbol is rejected.
        assert!(!fabric.subscribe("EQUITY_ZZZ", "ZZZ", None, None, None, Tier::A).ok);
    }
}
