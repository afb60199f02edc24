// =============================================================================
// Price Synthesis — fill thin option quotes by interpolation
// =============================================================================
//
// When a chain has strikes with no positive LTP on one side, interpolate
// linearly between the two nearest priced strikes on the same side and
// clamp at the edges. Bid/ask default to the synthesized LTP when absent.
// =============================================================================

use std::collections::BTreeMap;

use crate::types::OptionSide;

use super::cache::StrikeRow;

/// Synthesize missing LTPs for one side of a chain. Returns how many legs
/// were filled. Strikes are keyed in fixed-point (price * 100).
pub fn synthesize_missing(strikes: &mut BTreeMap<i64, StrikeRow>, side: OptionSide) -> usize {
    let mut priced: Vec<(i64, f64)> = Vec::new();
    let mut missing: Vec<i64> = Vec::new();

    for (&key, row) in strikes.iter() {
        let leg = row.leg(side);
        match leg.ltp {
            Some(ltp) if ltp > 0.0 => priced.push((key, ltp)),
            _ => missing.push(key),
        }
    }

    if priced.is_empty() {
        return 0;
    }

    let mut filled = 0;
    for key in missing {
        let lower = priced.iter().rev().find(|(k, _)| *k < key);
        let upper = priced.iter().find(|(k, _)| *k > key);

        let price = match (lower, upper) {
            (Some(&(k1, p1)), Some(&(k2, p2))) => {
                if k2 == k1 {
                    p1
                } else {
                    p1 + (p2 - p1) * ((key - k1) as f64 / (k2 - k1) as f64)
                }
            }
            (Some(&(_, p1)), None) => p1,
            (None, Some(&(_, p2))) => p2,
            (None, None) => continue,
        };

        if let Some(row) = strikes.get_mut(&key) {
            let leg = row.leg_mut(side);
            leg.ltp = Some(price.max(0.0));
            if leg.bid.map_or(true, |b| b <= 0.0) {
                leg.bid = leg.ltp;
            }
            if leg.ask.map_or(true, |a| a <= 0.0) {
                leg.ask = leg.ltp;
            }
            filled += 1;
        }
    }

    filled
}
