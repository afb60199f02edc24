// =============================================================================
// Execution Configuration — latency, slippage and liquidity parameters
// =============================================================================
//
// Every field carries a serde default so older config files keep loading
// when parameters are added.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::Exchange;

fn default_latency_shape() -> f64 {
    2.0
}

fn default_latency_mean_ms() -> f64 {
    80.0
}

fn default_alpha() -> f64 {
    0.35
}

fn default_beta() -> f64 {
    0.002
}

fn default_gamma() -> f64 {
    1.3
}

fn default_timeout_seconds() -> i64 {
    120
}

fn default_top_qty() -> i64 {
    500
}

/// Parameters for a single exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeParams {
    /// Erlang shape for the latency draw (number of exponential stages).
    #[serde(default = "default_latency_shape")]
    pub latency_shape: f64,

    /// Mean latency in milliseconds.
    #[serde(default = "default_latency_mean_ms")]
    pub latency_mean_ms: f64,

    /// Spread coefficient of the slippage model.
    #[serde(default = "default_alpha")]
    pub slippage_alpha: f64,

    /// Size-impact coefficient.
    #[serde(default = "default_beta")]
    pub slippage_beta: f64,

    /// Size-impact exponent.
    #[serde(default = "default_gamma")]
    pub slippage_gamma: f64,

    /// Seconds a resting order may stay unfilled before
    /// NO_LIQUIDITY_TIMEOUT rejection.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: i64,
}

impl Default for ExchangeParams {
    fn default() -> Self {
        Self {
            latency_shape: default_latency_shape(),
            latency_mean_ms: default_latency_mean_ms(),
            slippage_alpha: default_alpha(),
            slippage_beta: default_beta(),
            slippage_gamma: default_gamma(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub nse: ExchangeParams,
    #[serde(default)]
    pub bse: ExchangeParams,
    #[serde(default)]
    pub mcx: ExchangeParams,

    /// Top-of-book quantity assumed when the snapshot carries none.
    #[serde(default = "default_top_qty")]
    pub default_bid_qty: i64,
    #[serde(default = "default_top_qty")]
    pub default_ask_qty: i64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            nse: ExchangeParams::default(),
            bse: ExchangeParams::default(),
            mcx: ExchangeParams {
                // Commodities run a slower, thinner book.
                latency_mean_ms: 120.0,
                timeout_seconds: 180,
                ..ExchangeParams::default()
            },
            default_bid_qty: default_top_qty(),
            default_ask_qty: default_top_qty(),
        }
    }
}

impl ExecutionConfig {
    pub fn for_exchange(&self, exchange: Exchange) -> &ExchangeParams {
        match exchange {
            Exchange::Bse => &self.bse,
            Exchange::Mcx => &self.mcx,
            Exchange::Nse | Exchange::Idx => &self.nse,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_from_empty_json() {
        let cfg: ExecutionConfig = serde_json::from_str("{}").unwrap();
        assert!((cfg.nse.slippage_alpha - 0.35).abs() < f64::EPSILON);
        assert_eq!(cfg.default_bid_qty, 500);
        assert_eq!(cfg.for_exchange(Exchange::Mcx).timeout_seconds, 120);
    }

    #[test]
    fn built_defaults_slow_down_mcx() {
        let cfg = ExecutionConfig::default();
        assert!(cfg.mcx.latency_mean_ms > cfg.nse.latency_mean_ms);
        assert_eq!(cfg.mcx.timeout_seconds, 180);
    }
}
