// =============================================================================
// Core Context — the single dependency graph of the terminal backend
// =============================================================================
//
// Every subsystem is constructed once, owned here and shared by Arc; no
// module-level singletons. The atomic state_version drives the client
// WebSocket push: bump it after any mutation a dashboard should see.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::alerts::AlertSink;
use crate::chain::bootstrap::CommodityFuturesCache;
use crate::chain::OptionChainCache;
use crate::execution::oracle::SnapshotOracle;
use crate::execution::ExecutionEngine;
use crate::feed::{LiveFeedIngestor, TickBus, VendorRateLimiter, VendorRestClient};
use crate::feed::ingestor::FeedSettings;
use crate::instruments::{InstrumentRegistry, OptionTokenMap};
use crate::ledger::{AccountStore, PositionBook};
use crate::market_clock::MarketClock;
use crate::market_state::MarketStateCache;
use crate::runtime_config::RuntimeConfig;
use crate::store::Store;
use crate::subscription::{SubscriptionFabric, WatchlistManager};

pub struct CoreContext {
    pub state_version: AtomicU64,
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    pub store: Arc<Store>,
    pub alerts: Arc<AlertSink>,
    pub clock: Arc<MarketClock>,

    pub registry: Arc<InstrumentRegistry>,
    pub token_map: Arc<OptionTokenMap>,

    pub fabric: Arc<SubscriptionFabric>,
    pub watchlist: Arc<WatchlistManager>,

    pub rate_limiter: Arc<VendorRateLimiter>,
    pub rest: Arc<VendorRestClient>,
    pub tick_bus: Arc<TickBus>,
    pub ingestor: Arc<LiveFeedIngestor>,

    pub chains: Arc<OptionChainCache>,
    pub futures: Arc<CommodityFuturesCache>,
    pub market_state: Arc<MarketStateCache>,

    pub accounts: Arc<AccountStore>,
    pub positions: Arc<PositionBook>,
    pub execution: Arc<ExecutionEngine>,

    pub start_time: std::time::Instant,
}

impl CoreContext {
    /// Wire the full dependency graph from configuration. The caller loads
    /// the instrument master and rehydrates persisted state afterwards.
    pub fn build(config: RuntimeConfig, store: Arc<Store>) -> Arc<Self> {
        let alerts = Arc::new(AlertSink::new(store.clone()));
        let clock = Arc::new(MarketClock::new());
        let registry = Arc::new(InstrumentRegistry::new());
        let token_map = Arc::new(OptionTokenMap::new());

        let fabric = Arc::new(SubscriptionFabric::new(
            registry.clone(),
            token_map.clone(),
            store.clone(),
            config.max_feed_targets,
        ));
        let watchlist = Arc::new(WatchlistManager::new(
            store.clone(),
            fabric.clone(),
            registry.clone(),
            config.wide_window_indices.clone(),
        ));

        let rate_limiter = Arc::new(VendorRateLimiter::new());
        let rest = Arc::new(VendorRestClient::new(rate_limiter.clone(), alerts.clone()));
        let tick_bus = Arc::new(TickBus::new());
        let ingestor = Arc::new(LiveFeedIngestor::new(
            fabric.clone(),
            tick_bus.clone(),
            rest.clone(),
            clock.clone(),
            alerts.clone(),
            FeedSettings::from_env(),
        ));

        let chains = Arc::new(OptionChainCache::new(
            token_map.clone(),
            store.clone(),
            alerts.clone(),
        ));
        let futures = Arc::new(CommodityFuturesCache::new());
        let market_state = Arc::new(MarketStateCache::new());

        let accounts = Arc::new(AccountStore::new());
        let positions = Arc::new(PositionBook::new());
        let oracle = SnapshotOracle::new(market_state.clone(), chains.clone(), futures.clone());
        let execution = Arc::new(ExecutionEngine::new(
            store.clone(),
            accounts.clone(),
            positions.clone(),
            oracle,
            config.execution.clone(),
            token_map.clone(),
            registry.clone(),
        ));
        execution.set_admin_blocked(config.order_entry_blocked);
        if !config.live_feed_enabled {
            ingestor.set_killed(true);
        }

        Arc::new(Self {
            state_version: AtomicU64::new(1),
            runtime_config: Arc::new(RwLock::new(config)),
            store,
            alerts,
            clock,
            registry,
            token_map,
            fabric,
            watchlist,
            rate_limiter,
            rest,
            tick_bus,
            ingestor,
            chains,
            futures,
            market_state,
            accounts,
            positions,
            execution,
            start_time: std::time::Instant::now(),
        })
    }

    // ── Version tracking ────────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Rehydrate persisted state: brokerage plans, users, positions,
    /// subscriptions, open orders. The DEFAULT plan is seeded on first run
    /// so fee lookups always resolve against a stored row.
    pub fn rehydrate(&self) {
        match self.store.load_plans() {
            Ok(plans) if !plans.is_empty() => {
                for plan in plans {
                    self.accounts.upsert_plan(plan);
                }
            }
            Ok(_) => {
                let mut plan = crate::ledger::BrokeragePlan::default_plan();
                match self.store.save_plan(&plan) {
                    Ok(id) => {
                        plan.id = id;
                        self.accounts.upsert_plan(plan);
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to seed DEFAULT brokerage plan"),
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to load brokerage plans"),
        }
        if let Ok(users) = self.store.load_users() {
            for user in users {
                self.accounts.upsert_user(user);
            }
        }
        if let Ok(positions) = self.store.load_positions() {
            for position in positions {
                self.positions.restore(position);
            }
        }
        self.fabric.rehydrate();
        self.execution.rehydrate();
        self.increment_version();
    }

    // ── Snapshot builder ────────────────────────────────────────────────

    /// Full state snapshot pushed over the client WebSocket and served by
    /// the REST surface.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = chrono::Utc::now();
        let feed = self.ingestor.status();

        let chains: HashMap<String, Vec<String>> = self
            .chains
            .available_underlyings()
            .into_iter()
            .map(|u| {
                let expiries = self.chains.available_expiries(&u);
                (u, expiries)
            })
            .collect();

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: now.timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            feed,
            subscriptions_active: self.fabric.active_count(),
            shard_usage: self.fabric.shard_snapshot(),
            chains,
            commodity_futures: self.futures.snapshot(),
            tick_bus_published: self.tick_bus.published_count(),
            tick_bus_dropped: self.tick_bus.dropped_count(),
            open_positions: self.positions.open_positions(None).len(),
            recent_events: self
                .execution
                .recent_events()
                .into_iter()
                .rev()
                .take(20)
                .collect(),
        }
    }
}

impl std::fmt::Debug for CoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreContext")
            .field("state_version", &self.current_state_version())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub feed: crate::feed::ingestor::FeedStatus,
    pub subscriptions_active: usize,
    pub shard_usage: Vec<crate::subscription::shards::ShardUsage>,
    pub chains: HashMap<String, Vec<String>>,
    pub commodity_futures: Vec<crate::chain::bootstrap::FutureQuote>,
    pub tick_bus_published: u64,
    pub tick_bus_dropped: u64,
    pub open_positions: usize,
    pub recent_events: Vec<crate::execution::ExecutionEvent>,
}
