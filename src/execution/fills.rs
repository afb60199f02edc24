// =============================================================================
// Fill Engine — queue-aware fill computation against the touch
// =============================================================================
//
// MARKET: fill whatever the touch holds; a short touch produces a partial
// and the caller enqueues the remainder. LIMIT: fill only when the book is
// at or through the limit, clamped at the limit price. Fill quantities are
// always floored to the instrument's lot step.
// =============================================================================

use serde::Serialize;

use super::config::ExchangeParams;
use super::slippage::SlippageModel;
use crate::types::Side;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fill {
    pub price: f64,
    pub qty: i64,
    pub slippage: f64,
}

/// Compute the fill (if any) for a marketable order against the touch.
///
/// * `remaining`: unfilled quantity.
/// * `top_price`: the touch on the order's side (ask for BUY, bid for SELL).
/// * `top_qty`: quantity resting at the touch.
/// * `limit`: limit price for LIMIT-type fills; `None` for MARKET.
/// * `lot_step`: contract lot size (1 for equities).
pub fn compute_fill(
    params: &ExchangeParams,
    side: Side,
    remaining: i64,
    top_price: Option<f64>,
    top_qty: i64,
    spread: f64,
    limit: Option<f64>,
    lot_step: i64,
) -> Option<Fill> {
    let top_price = top_price.filter(|p| *p > 0.0)?;
    if remaining <= 0 {
        return None;
    }

    // LIMIT orders fill only at or through the touch.
    if let Some(limit) = limit {
        let crossed = match side {
            Side::Buy => limit >= top_price,
            Side::Sell => limit <= top_price,
        };
        if !crossed {
            return None;
        }
    }

    let lot_step = lot_step.max(1);
    let available = if top_qty > 0 { top_qty } else { remaining };
    let mut qty = remaining.min(available);
    qty -= qty % lot_step;
    if qty <= 0 {
        return None;
    }

    let slippage = SlippageModel::per_unit(params, spread, qty, top_qty);
    let raw_price = match side {
        Side::Buy => top_price + slippage,
        Side::Sell => top_price - slippage,
    };
    let price = match (limit, side) {
        (Some(limit), Side::Buy) => raw_price.min(limit),
        (Some(limit), Side::Sell) => raw_price.max(limit),
        (None, _) => raw_price,
    };

    Some(Fill {
        price: (price * 100.0).round() / 100.0,
        qty,
        slippage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ExchangeParams {
        ExchangeParams {
            slippage_alpha: 0.0,
            slippage_beta: 0.0,
            ..ExchangeParams::default()
        }
    }

    #[test]
    fn market_buy_fills_at_ask() {
        let fill = compute_fill(
            &params(),
            Side::Buy,
            100,
            Some(100.0),
            500,
            0.5,
            None,
            1,
        )
        .unwrap();
        assert_eq!(fill.qty, 100);
        assert_eq!(fill.price, 100.0);
    }

    #[test]
    fn short_touch_produces_partial() {
        let fill = compute_fill(
            &params(),
            Side::Buy,
            100,
            Some(100.0),
            60,
            0.5,
            None,
            1,
        )
        .unwrap();
        assert_eq!(fill.qty, 60);
    }

    #[test]
    fn limit_not_crossed_is_no_fill() {
        let fill = compute_fill(
            &params(),
            Side::Buy,
            100,
            Some(100.0),
            500,
            0.5,
            Some(99.0),
            1,
        );
        assert!(fill.is_none());

        let fill = compute_fill(
            &params(),
            Side::Sell,
            100,
            Some(100.0),
            500,
            0.5,
            Some(101.0),
            1,
        );
        assert!(fill.is_none());
    }

    #[test]
    fn limit_fill_clamps_at_limit() {
        let mut p = params();
        p.slippage_alpha = 1.0; // slip = spread = 2.0
        let fill = compute_fill(
            &p,
            Side::Buy,
            10,
            Some(100.0),
            500,
            2.0,
            Some(101.0),
            1,
        )
        .unwrap();
        // Raw price 102 clamps to the 101 limit.
        assert_eq!(fill.price, 101.0);
    }

    #[test]
    fn slippage_moves_price_against_the_order() {
        let mut p = params();
        p.slippage_alpha = 0.5;
        let buy = compute_fill(&p, Side::Buy, 10, Some(100.0), 500, 1.0, None, 1).unwrap();
        let sell = compute_fill(&p, Side::Sell, 10, Some(100.0), 500, 1.0, None, 1).unwrap();
        assert!(buy.price > 100.0);
        assert!(sell.price < 100.0);
    }

    #[test]
    fn lot_step_floors_fill_quantity() {
        let fill = compute_fill(
            &params(),
            Side::Buy,
            130,
            Some(100.0),
            500,
            0.0,
            None,
            65,
        )
        .unwrap();
        assert_eq!(fill.qty, 130);

        let fill = compute_fill(
            &params(),
            Side::Buy,
            130,
            Some(100.0),
            100,
            0.0,
            None,
            65,
        )
        .unwrap();
        // Touch holds 100 but only one full lot fits.
        assert_eq!(fill.qty, 65);

        let fill = compute_fill(
            &params(),
            Side::Buy,
            30,
            Some(100.0),
            500,
            0.0,
            None,
            65,
        );
        // Less than one lot never fills.
        assert!(fill.is_none());
    }

    #[test]
    fn missing_touch_is_no_fill() {
        assert!(compute_fill(&params(), Side::Buy, 10, None, 0, 0.0, None, 1).is_none());
        assert!(compute_fill(&params(), Side::Buy, 10, Some(0.0), 0, 0.0, None, 1).is_none());
    }

    #[test]
    fn empty_touch_quantity_fills_whole_order() {
        // No resting size known: assume the order can fill outright.
        let fill = compute_fill(
            &params(),
            Side::Sell,
            40,
            Some(99.5),
            0,
            0.5,
            None,
            1,
        )
        .unwrap();
        assert_eq!(fill.qty, 40);
    }
}
