// =============================================================================
// Market Clock — exchange trading sessions with admin override
// =============================================================================
//
// NSE/BSE trade 09:15–15:30 IST Monday–Friday; MCX trades 09:00–23:30 IST.
// Admins can force an exchange open or closed for testing, which takes
// precedence over the wall clock until cleared.
// =============================================================================

use std::collections::HashMap;

use chrono::{Datelike, Duration, NaiveTime, Utc, Weekday};
use parking_lot::RwLock;
use serde::Serialize;

use crate::types::Exchange;

/// IST offset (UTC+5:30). The exchange calendar is defined in IST regardless
/// of the host timezone.
const IST_OFFSET_MINUTES: i64 = 330;

/// Per-exchange admin override state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionOverride {
    ForcedOpen,
    ForcedClosed,
}

pub struct MarketClock {
    overrides: RwLock<HashMap<Exchange, SessionOverride>>,
}

impl MarketClock {
    pub fn new() -> Self {
        Self {
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Force an exchange open/closed, or clear the override with `None`.
    pub fn set_override(&self, exchange: Exchange, state: Option<SessionOverride>) {
        let mut overrides = self.overrides.write();
        match state {
            Some(s) => {
                overrides.insert(exchange, s);
            }
            None => {
                overrides.remove(&exchange);
            }
        }
    }

    pub fn override_for(&self, exchange: Exchange) -> Option<SessionOverride> {
        self.overrides.read().get(&exchange).copied()
    }

    /// Whether the exchange is currently in its trading session.
    pub fn is_open(&self, exchange: Exchange) -> bool {
        match self.override_for(exchange) {
            Some(SessionOverride::ForcedOpen) => return true,
            Some(SessionOverride::ForcedClosed) => return false,
            None => {}
        }
        let ist = Utc::now() + Duration::minutes(IST_OFFSET_MINUTES);
        Self::session_contains(exchange, ist.weekday(), ist.time())
    }

    /// Pure session check used by `is_open` and the tests.
    fn session_contains(exchange: Exchange, weekday: Weekday, time: NaiveTime) -> bool {
        if matches!(weekday, Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let (open, close) = match exchange {
            Exchange::Mcx => (
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(23, 30, 0).unwrap(),
            ),
            // NSE, BSE and the index feeds share equity-market hours.
            Exchange::Nse | Exchange::Bse | Exchange::Idx => (
                NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
                NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
            ),
        };
        time >= open && time <= close
    }

    /// Snapshot of the override table for the admin API.
    pub fn overrides_snapshot(&self) -> HashMap<String, SessionOverride> {
        self.overrides
            .read()
            .iter()
            .map(|(ex, st)| (ex.to_string(), *st))
            .collect()
    }
}

impl Default for MarketClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equity_session_bounds() {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert!(!MarketClock::session_contains(
            Exchange::Nse,
            Weekday::Mon,
            t(9, 0)
        ));
        assert!(MarketClock::session_contains(
            Exchange::Nse,
            Weekday::Mon,
            t(9, 15)
        ));
        assert!(MarketClock::session_contains(
            Exchange::Nse,
            Weekday::Fri,
            t(15, 30)
        ));
        assert!(!MarketClock::session_contains(
            Exchange::Nse,
            Weekday::Mon,
            t(15, 31)
        ));
    }

    #[test]
    fn mcx_trades_into_the_evening() {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert!(MarketClock::session_contains(
            Exchange::Mcx,
            Weekday::Wed,
            t(22, 0)
        ));
        assert!(!MarketClock::session_contains(
            Exchange::Nse,
            Weekday::Wed,
            t(22, 0)
        ));
    }

    #[test]
    fn weekends_are_closed() {
        let t = NaiveTime::from_hms_opt(11, 0, 0).unwrap();
        assert!(!MarketClock::session_contains(
            Exchange::Nse,
            Weekday::Sat,
            t
        ));
        assert!(!MarketClock::session_contains(
            Exchange::Mcx,
            Weekday::Sun,
            t
        ));
    }

    #[test]
    fn override_wins_over_clock() {
        let clock = MarketClock::new();
        clock.set_override(Exchange::Nse, Some(SessionOverride::ForcedOpen));
        assert!(clock.is_open(Exchange::Nse));
        clock.set_override(Exchange::Nse, Some(SessionOverride::ForcedClosed));
        assert!(!clock.is_open(Exchange::Nse));
        clock.set_override(Exchange::Nse, None);
        assert!(clock.override_for(Exchange::Nse).is_none());
    }
}
