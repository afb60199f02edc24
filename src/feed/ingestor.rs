// =============================================================================
// Live Feed Ingestor — the single authoritative vendor WebSocket client
// =============================================================================
//
// State machine per shard connection:
//
//   IDLE -> CONNECTING -> STREAMING -> (disconnect) -> BACKOFF -> ...
//                               \-> 10 consecutive failures -> COOLDOWN
//
// Gates checked before every connect and between reads: env offline flags,
// the admin kill-switch, the cooldown window, and the loopback singleton
// lock (two processes must never share vendor credentials). Ticks are
// normalized by the codec, enriched from the fabric's token map and fanned
// out on the TickBus; unknown payloads are counted, never guessed at.
// =============================================================================

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Notify;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::codec::{self, RawQuote};
use super::rest::VendorRestClient;
use super::tick_bus::TickBus;
use crate::alerts::{AlertLevel, AlertSink};
use crate::market_clock::MarketClock;
use crate::subscription::{SubscriptionEntry, SubscriptionFabric, WireTarget};
use crate::types::{Exchange, FeedMode, InstrumentKind, Tick};

/// Exponential backoff ladder in seconds; index = consecutive failures.
const BACKOFF_LADDER: [u64; 10] = [5, 10, 20, 40, 80, 120, 120, 120, 120, 120];
/// Consecutive failures before the cooldown window.
const MAX_FAILURES: u32 = 10;
/// Instruments per subscribe frame; halved after vendor 804/805 warnings.
const DEFAULT_BATCH: usize = 100;
const UNSUBSCRIBE_REQUEST_CODE: u16 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FeedState {
    Idle,
    Connecting,
    Streaming,
    Backoff,
    Cooldown,
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Streaming => write!(f, "STREAMING"),
            Self::Backoff => write!(f, "BACKOFF"),
            Self::Cooldown => write!(f, "COOLDOWN"),
        }
    }
}

/// Tunables pulled from the environment at startup.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// Any offline env flag set means never connect.
    pub offline: bool,
    pub ws_url: String,
    pub cooldown: Duration,
    pub backoff_cap: Duration,
    pub lock_port: u16,
}

impl FeedSettings {
    pub fn from_env() -> Self {
        let truthy = |name: &str| {
            std::env::var(name)
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false)
        };
        let offline = truthy("DISABLE_DHAN_WS")
            || truthy("BACKEND_OFFLINE")
            || truthy("DISABLE_MARKET_STREAMS");
        let cooldown = std::env::var("LIVE_FEED_COOLDOWN_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(660);
        let lock_port = std::env::var("LIVE_FEED_LOCK_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(47_831);
        Self {
            offline,
            ws_url: "wss://api-feed.dhan.co".to_string(),
            cooldown: Duration::from_secs(cooldown),
            backoff_cap: Duration::from_secs(120),
            lock_port,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedStatus {
    pub state: FeedState,
    pub enabled: bool,
    pub consecutive_failures: u32,
    pub cooldown_remaining_secs: Option<u64>,
    pub desired_targets: usize,
    pub active_targets: usize,
    pub unknown_payloads: u64,
    pub dropped_nonpositive: u64,
    pub last_tick_age_secs: Option<u64>,
}

pub struct LiveFeedIngestor {
    fabric: Arc<SubscriptionFabric>,
    bus: Arc<TickBus>,
    rest: Arc<VendorRestClient>,
    clock: Arc<MarketClock>,
    alerts: Arc<AlertSink>,
    settings: FeedSettings,
    credentials: RwLock<Option<(String, String)>>,

    state: RwLock<FeedState>,
    /// Admin kill-switch: true means the feed must stay down.
    killed: AtomicBool,
    stopping: AtomicBool,
    stop_signal: Notify,
    consecutive_failures: AtomicU32,
    cooldown_until: Mutex<Option<Instant>>,
    batch_size: AtomicU32,
    unknown_payloads: AtomicU64,
    dropped_nonpositive: AtomicU64,
    last_tick: Mutex<Option<Instant>>,
    active_tokens: Mutex<HashSet<String>>,
    /// Held for the process lifetime once bound.
    lock_listener: Mutex<Option<TcpListener>>,
}

impl LiveFeedIngestor {
    pub fn new(
        fabric: Arc<SubscriptionFabric>,
        bus: Arc<TickBus>,
        rest: Arc<VendorRestClient>,
        clock: Arc<MarketClock>,
        alerts: Arc<AlertSink>,
        settings: FeedSettings,
    ) -> Self {
        Self {
            fabric,
            bus,
            rest,
            clock,
            alerts,
            settings,
            credentials: RwLock::new(None),
            state: RwLock::new(FeedState::Idle),
            killed: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            stop_signal: Notify::new(),
            consecutive_failures: AtomicU32::new(0),
            cooldown_until: Mutex::new(None),
            batch_size: AtomicU32::new(DEFAULT_BATCH as u32),
            unknown_payloads: AtomicU64::new(0),
            dropped_nonpositive: AtomicU64::new(0),
            last_tick: Mutex::new(None),
            active_tokens: Mutex::new(HashSet::new()),
            lock_listener: Mutex::new(None),
        }
    }

    pub fn set_credentials(&self, client_id: String, access_token: String) {
        *self.credentials.write() = Some((client_id, access_token));
    }

    // -------------------------------------------------------------------------
    // Gates
    // -------------------------------------------------------------------------

    /// Admin kill-switch. Disabling drains connections and rejects diffs.
    pub fn set_killed(&self, killed: bool) {
        self.killed.store(killed, Ordering::SeqCst);
        if killed {
            warn!("live feed kill-switch engaged");
            self.stop_signal.notify_waiters();
        }
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    fn in_cooldown(&self) -> Option<Duration> {
        self.cooldown_until
            .lock()
            .and_then(|until| until.checked_duration_since(Instant::now()))
    }

    /// Bind the loopback singleton lock. Failure means another ingestor
    /// owns the vendor credentials on this host.
    fn acquire_process_lock(&self) -> bool {
        if self.lock_listener.lock().is_some() {
            return true;
        }
        match TcpListener::bind(("127.0.0.1", self.settings.lock_port)) {
            Ok(listener) => {
                *self.lock_listener.lock() = Some(listener);
                true
            }
            Err(e) => {
                warn!(
                    port = self.settings.lock_port,
                    error = %e,
                    "live-feed singleton lock unavailable; staying idle"
                );
                false
            }
        }
    }

    /// All conditions that must hold before any connect attempt.
    fn may_connect(&self) -> bool {
        if self.settings.offline || self.is_killed() || self.stopping.load(Ordering::SeqCst) {
            return false;
        }
        if self.in_cooldown().is_some() {
            return false;
        }
        if self.credentials.read().is_none() {
            return false;
        }
        self.acquire_process_lock()
    }

    // -------------------------------------------------------------------------
    // Failure accounting
    // -------------------------------------------------------------------------

    fn backoff_delay(&self, failures: u32) -> Duration {
        let idx = (failures.saturating_sub(1) as usize).min(BACKOFF_LADDER.len() - 1);
        Duration::from_secs(BACKOFF_LADDER[idx]).min(self.settings.backoff_cap)
    }

    fn record_failure(&self, cause: &str) -> FeedState {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= MAX_FAILURES {
            *self.cooldown_until.lock() = Some(Instant::now() + self.settings.cooldown);
            self.consecutive_failures.store(0, Ordering::SeqCst);
            self.alerts.emit_keyed(
                &format!(
                    "Live feed entering {}s cooldown after {failures} consecutive failures ({cause})",
                    self.settings.cooldown.as_secs()
                ),
                AlertLevel::Error,
                &format!("feed:cooldown:{cause}"),
                Duration::from_secs(300),
            );
            FeedState::Cooldown
        } else {
            FeedState::Backoff
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    // -------------------------------------------------------------------------
    // Run loops
    // -------------------------------------------------------------------------

    /// Spawn one reconnecting worker per shard. Returns the join handles so
    /// `stop` can drain them.
    pub fn start(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (1..=crate::subscription::shards::SHARD_COUNT as u8)
            .map(|ws_id| {
                let ingestor = Arc::clone(&self);
                tokio::spawn(async move {
                    ingestor.run_shard(ws_id).await;
                })
            })
            .collect()
    }

    /// Cancel the read loops and wait for them to drain (bounded at 5 s by
    /// the caller's join timeout).
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.stop_signal.notify_waiters();
        *self.state.write() = FeedState::Idle;
        info!("live feed ingestor stopping");
    }

    async fn run_shard(self: Arc<Self>, ws_id: u8) {
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }

            if !self.may_connect() {
                *self.state.write() = if self.in_cooldown().is_some() {
                    FeedState::Cooldown
                } else {
                    FeedState::Idle
                };
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    _ = self.stop_signal.notified() => {}
                }
                continue;
            }

            let targets: Vec<WireTarget> = self
                .fabric
                .wire_targets()
                .into_iter()
                .filter(|t| t.ws_id == ws_id)
                .collect();
            if targets.is_empty() {
                *self.state.write() = FeedState::Idle;
                tokio::select! {
                    _ = self.fabric.wire_changed() => {}
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                    _ = self.stop_signal.notified() => {}
                }
                continue;
            }

            *self.state.write() = FeedState::Connecting;
            match self.connect_and_stream(ws_id, targets).await {
                Ok(()) => {
                    // Clean close (stop or kill-switch); loop re-evaluates.
                }
                Err(e) => {
                    let next = self.record_failure("connect");
                    *self.state.write() = next;
                    let failures = self.consecutive_failures.load(Ordering::SeqCst);
                    error!(ws_id, error = %e, state = %next, "feed connection failed");
                    let delay = match next {
                        FeedState::Cooldown => self.settings.cooldown,
                        _ => self.backoff_delay(failures),
                    };
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.stop_signal.notified() => {}
                    }
                }
            }
        }
    }

    async fn connect_and_stream(&self, ws_id: u8, mut targets: Vec<WireTarget>) -> Result<()> {
        let (client_id, token) = self
            .credentials
            .read()
            .clone()
            .context("no feed credentials")?;
        let url = format!(
            "{}?version=2&token={token}&clientId={client_id}&authType=2",
            self.settings.ws_url
        );

        info!(ws_id, targets = targets.len(), "connecting to vendor feed");
        let (ws_stream, _response) = connect_async(&url)
            .await
            .context("vendor feed connect failed")?;
        let (mut write, mut read) = ws_stream.split();

        let batch = self.batch_size.load(Ordering::SeqCst) as usize;
        for frame in build_subscribe_frames(&targets, batch) {
            write
                .send(Message::Text(frame.to_string()))
                .await
                .context("failed to send subscribe frame")?;
        }
        {
            let mut active = self.active_tokens.lock();
            for target in &targets {
                active.insert(target.token.clone());
            }
        }

        self.record_success();
        *self.state.write() = FeedState::Streaming;
        info!(ws_id, "vendor feed streaming");

        let mut synced_version = self.fabric.wire_version();
        loop {
            // Kill-switch consulted between reads.
            if self.is_killed() || self.stopping.load(Ordering::SeqCst) {
                let _ = write.send(Message::Close(None)).await;
                self.active_tokens.lock().clear();
                return Ok(());
            }

            tokio::select! {
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => self.handle_payload(text.as_bytes()),
                        Some(Ok(Message::Binary(bytes))) => self.handle_payload(&bytes),
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            anyhow::bail!("vendor feed closed the connection");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            anyhow::bail!("vendor feed read error: {e}");
                        }
                    }
                }
                _ = self.fabric.wire_changed() => {
                    // Kill-switch also rejects desired-set diffs.
                    if self.is_killed() {
                        continue;
                    }
                    let version = self.fabric.wire_version();
                    if version == synced_version {
                        continue;
                    }
                    synced_version = version;
                    let desired: Vec<WireTarget> = self
                        .fabric
                        .wire_targets()
                        .into_iter()
                        .filter(|t| t.ws_id == ws_id)
                        .collect();
                    let (to_add, to_drop) = diff_targets(&targets, &desired);
                    if !to_add.is_empty() {
                        for frame in build_subscribe_frames(&to_add, batch) {
                            write
                                .send(Message::Text(frame.to_string()))
                                .await
                                .context("failed to send subscribe diff")?;
                        }
                    }
                    if !to_drop.is_empty() {
                        for frame in build_unsubscribe_frames(&to_drop, batch) {
                            write
                                .send(Message::Text(frame.to_string()))
                                .await
                                .context("failed to send unsubscribe diff")?;
                        }
                    }
                    if !to_add.is_empty() || !to_drop.is_empty() {
                        debug!(ws_id, added = to_add.len(), dropped = to_drop.len(), "wire diff applied");
                        let mut active = self.active_tokens.lock();
                        for target in &to_drop {
                            active.remove(&target.token);
                        }
                        for target in &to_add {
                            active.insert(target.token.clone());
                        }
                    }
                    targets = desired;
                }
                _ = self.stop_signal.notified() => {
                    let _ = write.send(Message::Close(None)).await;
                    self.active_tokens.lock().clear();
                    return Ok(());
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Payload handling
    // -------------------------------------------------------------------------

    fn handle_payload(&self, payload: &[u8]) {
        let value: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(_) => {
                self.unknown_payloads.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        // Vendor policy warnings: 804 (instrument count) and 805 (request
        // rate) mean our frames are too aggressive.
        let response_code = value
            .get("ResponseCode")
            .or_else(|| value.get("ErrorCode"))
            .and_then(|v| v.as_i64());
        if matches!(response_code, Some(804) | Some(805)) {
            self.shrink_batch();
            return;
        }

        // Vendor control frames (subscription acks) carry a RequestCode.
        if value.get("RequestCode").is_some() && value.get("SecurityId").is_none() {
            return;
        }

        let quote = match codec::parse_quote(&value) {
            Some(quote) => quote,
            None => {
                self.unknown_payloads.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let entry = match self.fabric.find_by_security_id(&quote.security_id) {
            Some(entry) => entry,
            None => {
                self.unknown_payloads.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let ltp_positive = quote.ltp.map_or(false, |v| v > 0.0);
        if !ltp_positive {
            let exchange = entry
                .meta
                .as_ref()
                .map(|m| m.exchange)
                .unwrap_or(Exchange::Nse);
            if self.clock.is_open(exchange) {
                self.dropped_nonpositive.fetch_add(1, Ordering::Relaxed);
                return;
            }
            // Market closed: publish a one-shot last-close quote instead.
            self.spawn_last_close_publish(entry, quote);
            return;
        }

        let tick = enrich_quote(&entry, quote);
        *self.last_tick.lock() = Some(Instant::now());
        self.bus.publish(tick);
    }

    /// Closed-market fallback: fetch (cached, rate-limited) last close and
    /// publish it once as a synthetic tick.
    fn spawn_last_close_publish(&self, entry: SubscriptionEntry, quote: RawQuote) {
        let rest = self.rest.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let meta = match &entry.meta {
                Some(meta) => meta.clone(),
                None => return,
            };
            match rest.last_close(&meta.segment, &meta.security_id).await {
                Ok(close) if close > 0.0 => {
                    let mut quote = quote;
                    quote.ltp = Some(close);
                    let tick = enrich_quote(&entry, quote);
                    bus.publish(tick);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(token = %entry.token, error = %e, "last-close fetch failed");
                }
            }
        });
    }

    /// Vendor instrument-count / request-rate warnings (804/805): halve the
    /// subscribe batch size and let the backoff ladder slow reconnects.
    pub fn shrink_batch(&self) {
        let current = self.batch_size.load(Ordering::SeqCst);
        let next = (current / 2).max(10);
        self.batch_size.store(next, Ordering::SeqCst);
        warn!(batch = next, "subscribe batch size reduced");
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    pub fn status(&self) -> FeedStatus {
        FeedStatus {
            state: *self.state.read(),
            enabled: !self.settings.offline && !self.is_killed(),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            cooldown_remaining_secs: self.in_cooldown().map(|d| d.as_secs()),
            desired_targets: self.fabric.wire_targets().len(),
            active_targets: self.active_tokens.lock().len(),
            unknown_payloads: self.unknown_payloads.load(Ordering::Relaxed),
            dropped_nonpositive: self.dropped_nonpositive.load(Ordering::Relaxed),
            last_tick_age_secs: self.last_tick.lock().map(|t| t.elapsed().as_secs()),
        }
    }
}

impl std::fmt::Debug for LiveFeedIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveFeedIngestor")
            .field("state", &*self.state.read())
            .field("killed", &self.is_killed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Frame building & enrichment (pure helpers)
// ---------------------------------------------------------------------------

/// Batch subscribe frames grouped by feed mode; the vendor wants one
/// request code per frame.
pub fn build_subscribe_frames(targets: &[WireTarget], batch: usize) -> Vec<serde_json::Value> {
    let mut frames = Vec::new();
    for mode in [FeedMode::Ticker, FeedMode::Quote] {
        let in_mode: Vec<&WireTarget> = targets.iter().filter(|t| t.mode == mode).collect();
        for chunk in in_mode.chunks(batch.max(1)) {
            let list: Vec<serde_json::Value> = chunk
                .iter()
                .map(|t| {
                    json!({
                        "ExchangeSegment": t.segment,
                        "SecurityId": t.security_id,
                    })
                })
                .collect();
            frames.push(json!({
                "RequestCode": mode.request_code(),
                "InstrumentCount": list.len(),
                "InstrumentList": list,
            }));
        }
    }
    frames
}

pub fn build_unsubscribe_frames(targets: &[WireTarget], batch: usize) -> Vec<serde_json::Value> {
    targets
        .chunks(batch.max(1))
        .map(|chunk| {
            let list: Vec<serde_json::Value> = chunk
                .iter()
                .map(|t| {
                    json!({
                        "ExchangeSegment": t.segment,
                        "SecurityId": t.security_id,
                    })
                })
                .collect();
            json!({
                "RequestCode": UNSUBSCRIBE_REQUEST_CODE,
                "InstrumentCount": list.len(),
                "InstrumentList": list,
            })
        })
        .collect()
}

/// Diff the active target set against the desired one.
pub fn diff_targets(
    active: &[WireTarget],
    desired: &[WireTarget],
) -> (Vec<WireTarget>, Vec<WireTarget>) {
    let active_ids: HashSet<&str> = active.iter().map(|t| t.token.as_str()).collect();
    let desired_ids: HashSet<&str> = desired.iter().map(|t| t.token.as_str()).collect();
    let to_add = desired
        .iter()
        .filter(|t| !active_ids.contains(t.token.as_str()))
        .cloned()
        .collect();
    let to_drop = active
        .iter()
        .filter(|t| !desired_ids.contains(t.token.as_str()))
        .cloned()
        .collect();
    (to_add, to_drop)
}

/// Enrich a normalized quote with subscription metadata into a tagged tick.
pub fn enrich_quote(entry: &SubscriptionEntry, quote: RawQuote) -> Tick {
    let meta = entry.meta.as_ref();
    let exchange = meta.map(|m| m.exchange).unwrap_or(Exchange::Nse);
    let segment = meta.map(|m| m.segment.clone()).unwrap_or_default();

    let kind = if entry.option_side.is_some() {
        InstrumentKind::Option
    } else if exchange == Exchange::Idx || segment.starts_with("IDX") {
        InstrumentKind::Index
    } else if entry.expiry.is_some() {
        InstrumentKind::Future
    } else {
        InstrumentKind::Equity
    };

    Tick {
        token: entry.token.clone(),
        exchange,
        segment,
        symbol: entry.canonical.clone(),
        kind,
        expiry: entry.expiry.clone(),
        strike: entry.strike,
        option_side: entry.option_side,
        ltp: quote.ltp.unwrap_or(0.0),
        bid: quote.bid,
        ask: quote.ask,
        depth: quote.depth,
        ts: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::registry::tests::sample_registry;
    use crate::instruments::OptionTokenMap;
    use crate::store::Store;
    use crate::types::{OptionSide, Tier};

    fn ingestor() -> Arc<LiveFeedIngestor> {
        let registry = Arc::new(sample_registry());
        let token_map = Arc::new(OptionTokenMap::new());
        token_map.rebuild_from(&registry);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let alerts = Arc::new(AlertSink::new(store.clone()));
        let fabric = Arc::new(SubscriptionFabric::new(registry, token_map, store, 300));
        let rate = Arc::new(crate::feed::rate_limit::VendorRateLimiter::new());
        Arc::new(LiveFeedIngestor::new(
            fabric,
            Arc::new(TickBus::new()),
            Arc::new(VendorRestClient::new(rate, alerts.clone())),
            Arc::new(MarketClock::new()),
            alerts,
            FeedSettings {
                offline: false,
                ws_url: "wss://example.invalid".to_string(),
                cooldown: Duration::from_secs(660),
                backoff_cap: Duration::from_secs(120),
                lock_port: 0,
            },
        ))
    }

    fn target(token: &str, security_id: &str, mode: FeedMode) -> WireTarget {
        WireTarget {
            token: token.to_string(),
            security_id: security_id.to_string(),
            segment: "NSE_FNO".to_string(),
            symbol: "NIFTY".to_string(),
            ws_id: 1,
            mode,
        }
    }

    #[test]
    fn backoff_ladder_caps_and_escalates() {
        let ingestor = ingestor();
        assert_eq!(ingestor.backoff_delay(1), Duration::from_secs(5));
        assert_eq!(ingestor.backoff_delay(2), Duration::from_secs(10));
        assert_eq!(ingestor.backoff_delay(3), Duration::from_secs(20));
        assert_eq!(ingestor.backoff_delay(4), Duration::from_secs(40));
        assert_eq!(ingestor.backoff_delay(5), Duration::from_secs(80));
        assert_eq!(ingestor.backoff_delay(6), Duration::from_secs(120));
        assert_eq!(ingestor.backoff_delay(25), Duration::from_secs(120));
    }

    #[test]
    fn ten_failures_enter_cooldown() {
        let ingestor = ingestor();
        for _ in 0..9 {
            assert_eq!(ingestor.record_failure("test"), FeedState::Backoff);
        }
        assert_eq!(ingestor.record_failure("test"), FeedState::Cooldown);
        assert!(ingestor.in_cooldown().is_some());
        // Cooldown suppresses connects.
        assert!(!ingestor.may_connect());
    }

    #[test]
    fn success_resets_the_failure_count() {
        let ingestor = ingestor();
        ingestor.record_failure("test");
        ingestor.record_failure("test");
        ingestor.record_success();
        assert_eq!(ingestor.consecutive_failures.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn kill_switch_blocks_connects() {
        let ingestor = ingestor();
        ingestor.set_credentials("client".to_string(), "token".to_string());
        ingestor.set_killed(true);
        assert!(!ingestor.may_connect());
        ingestor.set_killed(false);
        // Lock port 0 binds an ephemeral port; credentials are present.
        assert!(ingestor.may_connect());
    }

    #[test]
    fn missing_credentials_block_connects() {
        let ingestor = ingestor();
        assert!(!ingestor.may_connect());
    }

    #[test]
    fn subscribe_frames_batch_and_split_by_mode() {
        let targets: Vec<WireTarget> = (0..5)
            .map(|i| target(&format!("T{i}"), &format!("{i}"), FeedMode::Quote))
            .chain((5..7).map(|i| target(&format!("T{i}"), &format!("{i}"), FeedMode::Ticker)))
            .collect();
        let frames = build_subscribe_frames(&targets, 2);
        // 5 quote targets in batches of 2 -> 3 frames; 2 ticker -> 1 frame.
        assert_eq!(frames.len(), 4);
        let quote_frames: Vec<_> = frames
            .iter()
            .filter(|f| f["RequestCode"] == 17)
            .collect();
        assert_eq!(quote_frames.len(), 3);
        assert_eq!(quote_frames[0]["InstrumentCount"], 2);
        assert_eq!(
            quote_frames[0]["InstrumentList"][0]["ExchangeSegment"],
            "NSE_FNO"
        );
    }

    #[test]
    fn diff_produces_minimal_frames() {
        let active = vec![
            target("A", "1", FeedMode::Quote),
            target("B", "2", FeedMode::Quote),
        ];
        let desired = vec![
            target("B", "2", FeedMode::Quote),
            target("C", "3", FeedMode::Quote),
        ];
        let (add, drop) = diff_targets(&active, &desired);
        assert_eq!(add.len(), 1);
        assert_eq!(add[0].token, "C");
        assert_eq!(drop.len(), 1);
        assert_eq!(drop[0].token, "A");

        // No change -> no frames.
        let (add, drop) = diff_targets(&desired, &desired);
        assert!(add.is_empty());
        assert!(drop.is_empty());
    }

    #[test]
    fn enrichment_tags_instrument_kinds() {
        let ingestor = ingestor();
        ingestor.fabric.subscribe(
            "NIFTY_2099-02-24_25000CE",
            "NIFTY",
            Some("2099-02-24"),
            Some(25_000.0),
            Some(OptionSide::CE),
            Tier::B,
        );
        let entry = ingestor
            .fabric
            .get("NIFTY_2099-02-24_25000CE")
            .unwrap();
        let quote = RawQuote {
            security_id: "61001".to_string(),
            ltp: Some(120.0),
            bid: Some(119.5),
            ask: Some(120.5),
            bid_qty: None,
            ask_qty: None,
            depth: None,
        };
        let tick = enrich_quote(&entry, quote);
        assert_eq!(tick.kind, InstrumentKind::Option);
        assert_eq!(tick.symbol, "NIFTY");
        assert_eq!(tick.strike, Some(25_000.0));
        assert_eq!(tick.option_side, Some(OptionSide::CE));
        assert_eq!(tick.ltp, 120.0);
    }

    #[test]
    fn batch_shrink_halves_with_floor() {
        let ingestor = ingestor();
        assert_eq!(ingestor.batch_size.load(Ordering::SeqCst), 100);
        ingestor.shrink_batch();
        assert_eq!(ingestor.batch_size.load(Ordering::SeqCst), 50);
        for _ in 0..10 {
            ingestor.shrink_batch();
        }
        assert_eq!(ingestor.batch_size.load(Ordering::SeqCst), 10);
    }
}
