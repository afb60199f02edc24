// =============================================================================
// Latency Model — per-exchange order latency sampling
// =============================================================================
//
// Latency is drawn from an Erlang distribution (the integer-shape Gamma):
// the sum of `shape` exponential stages with mean `mean/shape` each. Heavier
// shapes tighten the spread around the mean without changing it. The draw
// is jittered per user so two users never see lock-step latencies.
// =============================================================================

use rand::Rng;

use super::config::ExchangeParams;

pub struct LatencyModel;

impl LatencyModel {
    /// Sample an order latency in milliseconds.
    pub fn sample_ms(params: &ExchangeParams, user_id: i64) -> u64 {
        let shape = params.latency_shape.max(1.0).round() as u32;
        let scale = (params.latency_mean_ms / shape as f64).max(0.1);

        let mut rng = rand::thread_rng();
        let mut total = 0.0;
        for _ in 0..shape {
            // Inverse-CDF exponential draw; clamp away from ln(0).
            let u: f64 = rng.gen_range(1e-9..1.0);
            total += -scale * u.ln();
        }

        // Small per-user skew (0..5ms) so that identical parameter sets
        // still de-synchronise across accounts.
        let skew = (user_id.unsigned_abs() % 5) as f64;
        (total + skew).round().max(1.0) as u64
    }
}
