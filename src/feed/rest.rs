// =============================================================================
// Vendor REST Client — quote, option-chain and margin endpoints
// =============================================================================
//
// SECURITY: the access token is never logged or serialized. Every call
// carries `access-token` and `client-id` headers and goes through the
// shared rate limiter; policy failures (401/403/429) block the channel for
// the mandated window. Quote calls time out at 10 s, data calls at 15 s.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::rate_limit::{RestChannel, VendorRateLimiter, AUTH_BLOCK, THROTTLE_BLOCK};
use crate::alerts::{AlertLevel, AlertSink};

/// Quote API timeout.
const QUOTE_TIMEOUT: Duration = Duration::from_secs(10);
/// Data API timeout.
const DATA_TIMEOUT: Duration = Duration::from_secs(15);
/// Last-close cache TTL (closed-market fallback quotes).
const LAST_CLOSE_TTL: Duration = Duration::from_secs(6 * 3600);

#[derive(Debug, Clone)]
pub struct VendorCredentials {
    pub client_id: String,
    pub access_token: String,
}

#[derive(Clone)]
struct CachedClose {
    price: f64,
    fetched_at: Instant,
}

pub struct VendorRestClient {
    http: reqwest::Client,
    base_url: String,
    credentials: RwLock<Option<VendorCredentials>>,
    rate_limiter: Arc<VendorRateLimiter>,
    alerts: Arc<AlertSink>,
    last_close_cache: Mutex<HashMap<String, CachedClose>>,
}

impl VendorRestClient {
    pub fn new(rate_limiter: Arc<VendorRateLimiter>, alerts: Arc<AlertSink>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DATA_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            base_url: "https://api.dhan.co".to_string(),
            credentials: RwLock::new(None),
            rate_limiter,
            alerts,
            last_close_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_credentials(&self, credentials: Option<VendorCredentials>) {
        *self.credentials.write() = credentials;
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.read().is_some()
    }

    fn credentials(&self) -> Result<VendorCredentials> {
        self.credentials
            .read()
            .clone()
            .context("no vendor credentials configured")
    }

    // -------------------------------------------------------------------------
    // Core POST with channel discipline
    // -------------------------------------------------------------------------

    async fn post_json(
        &self,
        channel: RestChannel,
        path: &str,
        body: Value,
        timeout: Duration,
    ) -> Result<Value> {
        if let Err(remaining) = self.rate_limiter.acquire(channel).await {
            anyhow::bail!(
                "vendor {channel} channel blocked for another {}s",
                remaining.as_secs()
            );
        }
        let creds = self.credentials()?;
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .http
            .post(&url)
            .timeout(timeout)
            .header("access-token", &creds.access_token)
            .header("client-id", &creds.client_id)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {path} request failed"))?;

        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if status.as_u16() == 401 || status.as_u16() == 403 {
            self.rate_limiter.block(channel, AUTH_BLOCK, "auth failure");
            self.alerts.emit(
                &format!("Vendor REST auth failure ({status}) on {path}; channel blocked 900s"),
                AlertLevel::Error,
            );
            anyhow::bail!("vendor auth failure on {path}: {status}");
        }
        if status.as_u16() == 429 {
            self.rate_limiter
                .block(channel, THROTTLE_BLOCK, "vendor throttle");
            self.alerts.emit(
                &format!("Vendor REST throttled (429) on {path}; channel blocked 120s"),
                AlertLevel::Error,
            );
            anyhow::bail!("vendor throttled {path}");
        }
        if !status.is_success() {
            anyhow::bail!("vendor POST {path} returned {status}: {payload}");
        }

        Ok(payload)
    }

    // -------------------------------------------------------------------------
    // Quote API
    // -------------------------------------------------------------------------

    /// POST /v2/marketfeed/quote for one security. Returns the per-security
    /// payload object.
    #[instrument(skip(self), name = "vendor::quote")]
    pub async fn quote(&self, segment: &str, security_id: &str) -> Result<Value> {
        let numeric_id: i64 = security_id
            .parse()
            .with_context(|| format!("non-numeric security id '{security_id}'"))?;
        let body = json!({ segment: [numeric_id] });
        let payload = self
            .post_json(RestChannel::Quote, "/v2/marketfeed/quote", body, QUOTE_TIMEOUT)
            .await?;

        let entry = payload
            .get("data")
            .and_then(|d| d.get(segment))
            .and_then(|s| s.get(security_id).or_else(|| s.get(numeric_id.to_string().as_str())))
            .cloned()
            .context("quote response missing security entry")?;

        // Some firmware wraps the quote in a one-element array.
        let entry = match entry {
            Value::Array(mut items) if !items.is_empty() => items.remove(0),
            other => other,
        };

        debug!(segment, security_id, "vendor quote fetched");
        Ok(entry)
    }

    /// Last traded / close price via the quote API with a 6-hour cache.
    /// Used only while the market is closed and no live tick is cached.
    pub async fn last_close(&self, segment: &str, security_id: &str) -> Result<f64> {
        let cache_key = format!("{segment}:{security_id}");
        {
            let cache = self.last_close_cache.lock();
            if let Some(cached) = cache.get(&cache_key) {
                if cached.fetched_at.elapsed() < LAST_CLOSE_TTL {
                    return Ok(cached.price);
                }
            }
        }

        let entry = self.quote(segment, security_id).await?;
        let price = ["ltp", "LTP", "close", "close_price", "prev_close"]
            .iter()
            .find_map(|key| entry.get(*key))
            .and_then(|v| match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .context("quote entry carries no usable close price")?;

        self.last_close_cache.lock().insert(
            cache_key,
            CachedClose {
                price,
                fetched_at: Instant::now(),
            },
        );
        Ok(price)
    }

    // -------------------------------------------------------------------------
    // Option-chain Data APIs
    // -------------------------------------------------------------------------

    /// POST /v2/optionchain/expirylist: all listed expiries for an
    /// underlying scrip.
    #[instrument(skip(self), name = "vendor::expiry_list")]
    pub async fn expiry_list(&self, underlying_scrip: i64, underlying_seg: &str) -> Result<Vec<String>> {
        let body = json!({
            "UnderlyingScrip": underlying_scrip,
            "UnderlyingSeg": underlying_seg,
        });
        let payload = self
            .post_json(
                RestChannel::Data,
                "/v2/optionchain/expirylist",
                body,
                DATA_TIMEOUT,
            )
            .await?;

        let expiries = payload
            .get("data")
            .and_then(|d| d.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        debug!(underlying_scrip, count = expiries.len(), "expiry list fetched");
        Ok(expiries)
    }

    /// POST /v2/optionchain: full chain snapshot for (underlying, expiry).
    #[instrument(skip(self), name = "vendor::option_chain")]
    pub async fn option_chain(
        &self,
        underlying_scrip: i64,
        underlying_seg: &str,
        expiry: &str,
    ) -> Result<Value> {
        let body = json!({
            "UnderlyingScrip": underlying_scrip,
            "UnderlyingSeg": underlying_seg,
            "Expiry": expiry,
        });
        let payload = self
            .post_json(RestChannel::Data, "/v2/optionchain", body, DATA_TIMEOUT)
            .await?;
        payload
            .get("data")
            .cloned()
            .context("option chain response missing data")
    }

    // -------------------------------------------------------------------------
    // Margin proxy
    // -------------------------------------------------------------------------

    /// Proxy a margin calculation to the vendor. The core never computes
    /// margin itself; failures simply bubble to the caller.
    #[instrument(skip(self, body), name = "vendor::margin")]
    pub async fn margin_calculator(&self, body: Value) -> Result<Value> {
        let payload = self
            .post_json(RestChannel::Data, "/v2/margincalculator", body, DATA_TIMEOUT)
            .await;
        if payload.is_err() {
            warn!("vendor margin proxy failed");
        }
        payload
    }
}

impl std::fmt::Debug for VendorRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VendorRestClient")
            .field("base_url", &self.base_url)
            .field("credentials", &"<redacted>")
            .finish()
    }
}
