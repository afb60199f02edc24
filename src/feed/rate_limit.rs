// =============================================================================
// Vendor Rate Limiter — serialises REST bursts within published limits
// =============================================================================
//
// The vendor enforces 1 req/s on the Quote API and 5 req/s on the Data
// APIs. Every REST caller in the process funnels through this limiter.
// Policy failures block the offending channel outright: 401/403 for 900 s,
// 429 for 120 s.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

/// REST channel classes with distinct vendor limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestChannel {
    /// `/marketfeed/quote`: 1 request per second.
    Quote,
    /// Option-chain and other data APIs: 5 requests per second.
    Data,
}

impl RestChannel {
    fn min_interval(self) -> Duration {
        match self {
            Self::Quote => Duration::from_secs(1),
            Self::Data => Duration::from_millis(200),
        }
    }
}

impl std::fmt::Display for RestChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Quote => write!(f, "QUOTE"),
            Self::Data => write!(f, "DATA"),
        }
    }
}

/// Block applied after an auth failure (401/403).
pub const AUTH_BLOCK: Duration = Duration::from_secs(900);
/// Block applied after the vendor rate-limits us (429).
pub const THROTTLE_BLOCK: Duration = Duration::from_secs(120);

#[derive(Default)]
struct ChannelState {
    last_call: Option<Instant>,
    blocked_until: Option<Instant>,
}

/// Serialisable view for the feed-status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub quote_blocked_secs: Option<u64>,
    pub data_blocked_secs: Option<u64>,
}

pub struct VendorRateLimiter {
    quote: Mutex<ChannelState>,
    data: Mutex<ChannelState>,
}

impl VendorRateLimiter {
    pub fn new() -> Self {
        Self {
            quote: Mutex::new(ChannelState::default()),
            data: Mutex::new(ChannelState::default()),
        }
    }

    fn state(&self, channel: RestChannel) -> &Mutex<ChannelState> {
        match channel {
            RestChannel::Quote => &self.quote,
            RestChannel::Data => &self.data,
        }
    }

    /// Whether the channel is currently blocked by a policy failure.
    pub fn is_blocked(&self, channel: RestChannel) -> bool {
        self.state(channel)
            .lock()
            .blocked_until
            .map_or(false, |t| t > Instant::now())
    }

    /// Wait for a slot on `channel`. Returns `Err` immediately when the
    /// channel is policy-blocked; callers surface that as a skipped call,
    /// not a retry loop.
    pub async fn acquire(&self, channel: RestChannel) -> Result<(), Duration> {
        loop {
            let wait = {
                let mut state = self.state(channel).lock();
                let now = Instant::now();
                if let Some(until) = state.blocked_until {
                    if until > now {
                        return Err(until - now);
                    }
                    state.blocked_until = None;
                }
                match state.last_call {
                    Some(last) => {
                        let elapsed = now.duration_since(last);
                        let min = channel.min_interval();
                        if elapsed >= min {
                            state.last_call = Some(now);
                            None
                        } else {
                            Some(min - elapsed)
                        }
                    }
                    None => {
                        state.last_call = Some(now);
                        None
                    }
                }
            };
            match wait {
                None => return Ok(()),
                Some(dur) => tokio::time::sleep(dur).await,
            }
        }
    }

    /// Block a channel for `duration` (auth failures, vendor throttles).
    pub fn block(&self, channel: RestChannel, duration: Duration, reason: &str) {
        warn!(
            channel = %channel,
            seconds = duration.as_secs(),
            reason,
            "vendor REST channel blocked"
        );
        self.state(channel).lock().blocked_until = Some(Instant::now() + duration);
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let remaining = |state: &Mutex<ChannelState>| {
            state
                .lock()
                .blocked_until
                .and_then(|t| t.checked_duration_since(Instant::now()))
                .map(|d| d.as_secs())
        };
        RateLimiterSnapshot {
            quote_blocked_secs: remaining(&self.quote),
            data_blocked_secs: remaining(&self.data),
        }
    }
}

impl Default for VendorRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VendorRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VendorRateLimiter")
            .field("quote_blocked", &self.is_blocked(RestChannel::Quote))
            .field("data_blocked", &self.is_blocked(RestChannel::Data))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn quote_channel_enforces_one_per_second() {
        let limiter = VendorRateLimiter::new();
        let start = Instant::now();
        limiter.acquire(RestChannel::Quote).await.unwrap();
        limiter.acquire(RestChannel::Quote).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn data_channel_is_five_per_second() {
        let limiter = VendorRateLimiter::new();
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire(RestChannel::Data).await.unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(350));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn blocked_channel_fails_fast() {
        let limiter = VendorRateLimiter::new();
        limiter.block(RestChannel::Quote, AUTH_BLOCK, "401");
        let err = limiter.acquire(RestChannel::Quote).await.unwrap_err();
        assert!(err > Duration::from_secs(800));
        // The other channel is unaffected.
        assert!(limiter.acquire(RestChannel::Data).await.is_ok());
    }

    #[tokio::test]
    async fn block_expires() {
        let limiter = VendorRateLimiter::new();
        limiter.block(RestChannel::Data, Duration::from_millis(20), "test");
        assert!(limiter.is_blocked(RestChannel::Data));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(limiter.acquire(RestChannel::Data).await.is_ok());
    }
}
