// =============================================================================
// Slippage Model — spread and size impact per filled unit
// =============================================================================
//
// effective slippage per unit = alpha * spread + beta * (qty / max(top, 1))^gamma
//
// MARKET orders always absorb slippage; LIMIT fills absorb it only because
// they fill when the book crosses their limit, and the fill price is then
// clamped at the limit itself.
// =============================================================================

use super::config::ExchangeParams;

pub struct SlippageModel;

impl SlippageModel {
    /// Per-unit slippage for a fill of `qty` against `top_qty` resting at
    /// the touch with the given spread.
    pub fn per_unit(params: &ExchangeParams, spread: f64, qty: i64, top_qty: i64) -> f64 {
        let spread = spread.max(0.0);
        let pressure = qty.max(0) as f64 / top_qty.max(1) as f64;
        params.slippage_alpha * spread
            + params.slippage_beta * pressure.powf(params.slippage_gamma)
    }
}
