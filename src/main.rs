// =============================================================================
// Nexus Terminal Core — Main Entry Point
// =============================================================================
//
// Startup order: config -> store -> context -> instrument master -> vendor
// credentials -> rehydration -> background loops -> API server. The feed
// never connects when an offline flag or the kill-switch is set; everything
// else still serves from cache.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod api;
mod app_state;
mod chain;
mod execution;
mod feed;
mod instruments;
mod ledger;
mod market_clock;
mod market_state;
mod runtime_config;
mod store;
mod subscription;
mod types;

use std::sync::Arc;

use chrono::Timelike;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::CoreContext;
use crate::chain::bootstrap::ChainBootstrapper;
use crate::chain::cache::synthetic_token;
use crate::feed::rest::VendorCredentials;
use crate::runtime_config::RuntimeConfig;
use crate::store::Store;
use crate::types::{InstrumentKind, OptionSide, Tier};

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Nexus Terminal Core starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env();

    // ── 2. Store & context ───────────────────────────────────────────────
    let store = Arc::new(Store::open(&config.store_path)?);
    let ctx = CoreContext::build(config, store);

    // ── 3. Instrument master & option token map ──────────────────────────
    {
        let master_path = ctx.runtime_config.read().instrument_master_path.clone();
        match ctx.registry.load_from_path(&master_path) {
            Ok(()) => {
                ctx.token_map.rebuild_from(&ctx.registry);
            }
            Err(e) => {
                // Startup continues on cached/persisted data; resolution
                // retries after the next successful refresh.
                warn!(path = %master_path, error = %e, "instrument master load failed");
            }
        }
    }

    // ── 4. Vendor credentials ────────────────────────────────────────────
    let credentials = std::env::var("DHAN_CLIENT_ID")
        .ok()
        .zip(std::env::var("DHAN_ACCESS_TOKEN").ok())
        .or_else(|| {
            ctx.store
                .default_credentials()
                .ok()
                .flatten()
                .map(|c| (c.client_id, c.auth_token))
        });
    match credentials {
        Some((client_id, token)) => {
            ctx.rest.set_credentials(Some(VendorCredentials {
                client_id: client_id.clone(),
                access_token: token.clone(),
            }));
            ctx.ingestor.set_credentials(client_id, token);
            info!("vendor credentials configured");
        }
        None => {
            warn!("no vendor credentials; feed and REST bootstrap stay idle");
        }
    }

    // ── 5. Rehydrate persisted state ─────────────────────────────────────
    ctx.rehydrate();

    // ── 6. Tick consumer ─────────────────────────────────────────────────
    {
        let ctx = ctx.clone();
        let mut receiver = ctx.tick_bus.subscribe();
        tokio::spawn(async move {
            while let Some(tick) = receiver.recv().await {
                ctx.market_state.apply_tick(&tick);
                match tick.kind {
                    InstrumentKind::Option => {
                        ctx.chains.apply_option_tick(&tick);
                    }
                    InstrumentKind::Index | InstrumentKind::Equity => {
                        let diffs = ctx.chains.apply_underlying_tick(&tick.symbol, tick.ltp);
                        apply_strike_diffs(&ctx, diffs);
                    }
                    InstrumentKind::Future => {
                        ctx.futures.update_ltp(&tick.symbol, tick.ltp);
                        let diffs = ctx.chains.apply_underlying_tick(&tick.symbol, tick.ltp);
                        apply_strike_diffs(&ctx, diffs);
                    }
                }
                ctx.increment_version();
            }
            warn!("tick bus closed; consumer exiting");
        });
    }

    // ── 7. Live feed ingestor ────────────────────────────────────────────
    let feed_handles = ctx.ingestor.clone().start();
    info!(shards = feed_handles.len(), "live feed workers launched");

    // ── 8. Chain bootstrap & refresh loop ────────────────────────────────
    let bootstrapper = Arc::new(ChainBootstrapper::new(
        ctx.chains.clone(),
        ctx.futures.clone(),
        ctx.rest.clone(),
        ctx.registry.clone(),
        ctx.token_map.clone(),
        ctx.clock.clone(),
        ctx.runtime_config.read().wide_window_indices.clone(),
    ));
    {
        let ctx = ctx.clone();
        let bootstrapper = bootstrapper.clone();
        tokio::spawn(async move {
            if ctx.rest.has_credentials() {
                bootstrapper.bootstrap_all(&ctx.fabric).await;
                ctx.increment_version();
            }
            let mut refresh = tokio::time::interval(std::time::Duration::from_secs(300));
            refresh.tick().await; // first tick is immediate
            loop {
                refresh.tick().await;
                if !ctx.rest.has_credentials() {
                    continue;
                }
                bootstrapper.refresh_mcx_futures(Some(ctx.fabric.as_ref())).await;
                // On-demand underlying refreshes are warm-up guarded.
                for underlying in ctx.chains.available_underlyings() {
                    if ctx.chains.should_refresh(&underlying) {
                        if let Err(e) = bootstrapper.bootstrap_underlying(&underlying, None).await
                        {
                            warn!(underlying = %underlying, error = %e, "chain refresh failed");
                        }
                    }
                }
                ctx.increment_version();
            }
        });
    }

    // ── 9. Pending-order sweep ───────────────────────────────────────────
    {
        let ctx = ctx.clone();
        let period = ctx.runtime_config.read().pending_sweep_secs.max(1);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(period));
            loop {
                interval.tick().await;
                ctx.execution.process_pending();
            }
        });
    }

    // ── 10. Instrument master refresh (token map + unresolved retries) ───
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(6 * 3600));
            interval.tick().await;
            loop {
                interval.tick().await;
                ctx.token_map.rebuild_from(&ctx.registry);
                let fixed = ctx.fabric.retry_unresolved();
                if fixed > 0 {
                    info!(fixed, "token-map refresh resolved pending subscriptions");
                }
            }
        });
    }

    // ── 11. EOD cleanup scheduler (15:30 IST, Tier A only) ───────────────
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut last_run_day: Option<chrono::NaiveDate> = None;
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let ist = chrono::Utc::now() + chrono::Duration::minutes(330);
                let due = ist.hour() == 15 && ist.minute() >= 30 && ist.minute() < 35;
                if !due || last_run_day == Some(ist.date_naive()) {
                    continue;
                }
                last_run_day = Some(ist.date_naive());

                let open = ctx.positions.open_positions(None);
                let removed = ctx.fabric.unsubscribe_all_tier_a(&open);
                for user in ctx.accounts.list_users() {
                    ctx.watchlist.clear_user_with_protection(user.id, &open);
                }
                ctx.increment_version();
                info!(removed, "EOD cleanup complete");
            }
        });
    }

    // ── 12. API server ───────────────────────────────────────────────────
    let bind_addr = ctx.runtime_config.read().bind_addr.clone();
    {
        let ctx = ctx.clone();
        let bind_addr = bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(ctx);
            match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(listener) => {
                    info!(addr = %bind_addr, "API server listening");
                    if let Err(e) = axum::serve(listener, app).await {
                        error!(error = %e, "API server failed");
                    }
                }
                Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind API server"),
            }
        });
    }

    info!("all subsystems running; Ctrl+C to stop");

    // ── 13. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received");

    ctx.execution.stop_accepting();
    ctx.ingestor.stop();
    let drain = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        for handle in feed_handles {
            let _ = handle.await;
        }
    });
    if drain.await.is_err() {
        warn!("feed workers did not drain within 5s");
    }

    if let Err(e) = ctx.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Nexus Terminal Core shut down complete");
    Ok(())
}

/// Keep Tier-B subscriptions in lock-step with a rebuilt strike window:
/// new edge strikes subscribe, vanished strikes unsubscribe.
fn apply_strike_diffs(ctx: &Arc<CoreContext>, diffs: Vec<chain::StrikeDiff>) {
    for diff in diffs {
        for strike in &diff.removed {
            for side in [OptionSide::CE, OptionSide::PE] {
                let token = synthetic_token(side, &diff.underlying, *strike, &diff.expiry);
                ctx.fabric.unsubscribe(&token, "ATM_SHIFT");
            }
        }
        for strike in &diff.added {
            for side in [OptionSide::CE, OptionSide::PE] {
                let token = synthetic_token(side, &diff.underlying, *strike, &diff.expiry);
                ctx.fabric.subscribe(
                    &token,
                    &diff.underlying,
                    Some(&diff.expiry),
                    Some(*strike),
                    Some(side),
                    Tier::B,
                );
            }
        }
    }
}
