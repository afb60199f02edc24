// =============================================================================
// Feed Codec — vendor payload normalization
// =============================================================================
//
// The vendor's feed frames vary by mode and firmware: field names drift
// between camelCase, PascalCase and UPPER_SNAKE, prices arrive as numbers
// or strings, and depth shows up under several shapes. The codec probes a
// fixed candidate-key order, synthesises LTP from bid/ask when the field is
// missing, and parses five-level depth into the normalized form. Payloads
// without a recognisable security id are not ticks; callers count them.
// =============================================================================

use serde_json::Value;

use crate::types::{Depth, DepthLevel};

/// A vendor frame reduced to the fields the enrichment stage needs.
#[derive(Debug, Clone, PartialEq)]
pub struct RawQuote {
    pub security_id: String,
    pub ltp: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub bid_qty: Option<i64>,
    pub ask_qty: Option<i64>,
    pub depth: Option<Depth>,
}

/// Candidate keys for the security id, most common first.
const SECURITY_ID_KEYS: [&str; 6] = [
    "SecurityId",
    "security_id",
    "securityId",
    "SECURITY_ID",
    "token",
    "Token",
];

/// Ordered LTP probe set.
const LTP_KEYS: [&str; 6] = [
    "LastTradedPrice",
    "LTP",
    "ltp",
    "last_price",
    "lastTradedPrice",
    "last_traded_price",
];

const BID_KEYS: [&str; 4] = ["BestBidPrice", "best_bid", "bid", "bidPrice"];
const ASK_KEYS: [&str; 4] = ["BestAskPrice", "best_ask", "ask", "askPrice"];
const BID_QTY_KEYS: [&str; 3] = ["BestBidQuantity", "bid_qty", "bidQty"];
const ASK_QTY_KEYS: [&str; 3] = ["BestAskQuantity", "ask_qty", "askQty"];

/// Parse a vendor frame. Returns `None` when no security id can be found;
/// the caller records such frames in its unknown-payload counter.
pub fn parse_quote(payload: &Value) -> Option<RawQuote> {
    let security_id = probe_security_id(payload, 0)?;

    let mut ltp = probe_number(payload, &LTP_KEYS);
    let bid = probe_number(payload, &BID_KEYS).filter(|v| *v > 0.0);
    let ask = probe_number(payload, &ASK_KEYS).filter(|v| *v > 0.0);
    let bid_qty = probe_number(payload, &BID_QTY_KEYS).map(|v| v as i64);
    let ask_qty = probe_number(payload, &ASK_QTY_KEYS).map(|v| v as i64);
    let depth = parse_depth(payload);

    // Synthesize an LTP from the book when the field is absent: mid when
    // both sides quote, else the best available side.
    if ltp.map_or(true, |v| v <= 0.0) {
        ltp = match (bid, ask) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            (Some(b), None) => Some(b),
            (None, Some(a)) => Some(a),
            (None, None) => ltp,
        };
    }

    Some(RawQuote {
        security_id,
        ltp,
        bid,
        ask,
        bid_qty,
        ask_qty,
        depth,
    })
}

/// Probe for the security id, descending one level into nested objects;
/// some vendor frames wrap the quote in a "data" envelope.
fn probe_security_id(payload: &Value, depth: usize) -> Option<String> {
    if depth > 2 {
        return None;
    }
    if let Some(object) = payload.as_object() {
        for key in SECURITY_ID_KEYS {
            if let Some(value) = object.get(key) {
                if let Some(id) = value_to_id(value) {
                    return Some(id);
                }
            }
        }
        for value in object.values() {
            if value.is_object() {
                if let Some(id) = probe_security_id(value, depth + 1) {
                    return Some(id);
                }
            }
        }
    }
    None
}

fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Probe an ordered key set for a numeric value (number or numeric string).
fn probe_number(payload: &Value, keys: &[&str]) -> Option<f64> {
    let object = payload.as_object()?;
    for key in keys {
        if let Some(value) = object.get(*key) {
            if let Some(v) = value_to_f64(value) {
                return Some(v);
            }
        }
    }
    None
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Parse five-level depth from the shapes the vendor emits:
///   {"depth": {"buy": [{"price":..,"quantity":..}], "sell": [...]}}
///   {"bids": [[price, qty], ...], "asks": [...]}
pub fn parse_depth(payload: &Value) -> Option<Depth> {
    if let Some(depth_obj) = payload.get("depth").or_else(|| payload.get("Depth")) {
        let bids = depth_side(depth_obj, &["buy", "bids", "bid"]);
        let asks = depth_side(depth_obj, &["sell", "asks", "ask"]);
        if !bids.is_empty() || !asks.is_empty() {
            return Some(Depth { bids, asks });
        }
    }

    let bids = depth_side(payload, &["bids"]);
    let asks = depth_side(payload, &["asks"]);
    if !bids.is_empty() || !asks.is_empty() {
        return Some(Depth { bids, asks });
    }
    None
}

fn depth_side(value: &Value, keys: &[&str]) -> Vec<DepthLevel> {
    for key in keys {
        if let Some(levels) = value.get(*key).and_then(|v| v.as_array()) {
            let parsed: Vec<DepthLevel> = levels
                .iter()
                .take(5)
                .filter_map(parse_level)
                .collect();
            if !parsed.is_empty() {
                return parsed;
            }
        }
    }
    Vec::new()
}

fn parse_level(level: &Value) -> Option<DepthLevel> {
    // Object form: {"price": .., "quantity"/"qty": ..}
    if let Some(object) = level.as_object() {
        let price = object
            .get("price")
            .or_else(|| object.get("Price"))
            .and_then(value_to_f64)?;
        let qty = object
            .get("quantity")
            .or_else(|| object.get("qty"))
            .or_else(|| object.get("Quantity"))
            .and_then(value_to_f64)
            .unwrap_or(0.0) as i64;
        if price > 0.0 {
            return Some(DepthLevel { price, qty });
        }
        return None;
    }
    // Array form: [price, qty]
    if let Some(pair) = level.as_array() {
        let price = pair.first().and_then(value_to_f64)?;
        let qty = pair.get(1).and_then(value_to_f64).unwrap_or(0.0) as i64;
        if price > 0.0 {
            return Some(DepthLevel { price, qty });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_pascal_case_quote_frame() {
        let payload = json!({
            "ExchangeSegment": "NSE_FNO",
            "SecurityId": "49081",
            "LastTradedPrice": 102.5,
            "BestBidPrice": 102.0,
            "BestAskPrice": 103.0,
            "BestBidQuantity": 650,
            "BestAskQuantity": 325
        });
        let quote = parse_quote(&payload).unwrap();
        assert_eq!(quote.security_id, "49081");
        assert_eq!(quote.ltp, Some(102.5));
        assert_eq!(quote.bid, Some(102.0));
        assert_eq!(quote.ask_qty, Some(325));
    }

    #[test]
    fn numeric_and_string_ids_both_resolve() {
        let with_number = json!({"SecurityId": 13, "LTP": "25012.4"});
        let quote = parse_quote(&with_number).unwrap();
        assert_eq!(quote.security_id, "13");
        assert_eq!(quote.ltp, Some(25012.4));

        let nested = json!({"data": {"security_id": "25", "ltp": 57000.0}});
        let quote = parse_quote(&nested).unwrap();
        assert_eq!(quote.security_id, "25");
    }

    #[test]
    fn missing_ltp_synthesised_from_mid() {
        let payload = json!({
            "SecurityId": "99",
            "BestBidPrice": 100.0,
            "BestAskPrice": 102.0
        });
        let quote = parse_quote(&payload).unwrap();
        assert_eq!(quote.ltp, Some(101.0));
    }

    #[test]
    fn one_sided_book_uses_best_side() {
        let payload = json!({"SecurityId": "99", "BestBidPrice": 100.0});
        assert_eq!(parse_quote(&payload).unwrap().ltp, Some(100.0));
    }

    #[test]
    fn frames_without_id_are_not_ticks() {
        assert!(parse_quote(&json!({"RequestCode": 15})).is_none());
        assert!(parse_quote(&json!("not an object")).is_none());
    }

    #[test]
    fn depth_object_form_parses_five_levels() {
        let payload = json!({
            "SecurityId": "49081",
            "depth": {
                "buy": [
                    {"price": 101.0, "quantity": 100},
                    {"price": 100.5, "quantity": 200},
                    {"price": 100.0, "quantity": 300},
                    {"price": 99.5, "quantity": 400},
                    {"price": 99.0, "quantity": 500},
                    {"price": 98.5, "quantity": 600}
                ],
                "sell": [
                    {"price": 101.5, "qty": 150}
                ]
            }
        });
        let quote = parse_quote(&payload).unwrap();
        let depth = quote.depth.unwrap();
        assert_eq!(depth.bids.len(), 5);
        assert_eq!(depth.best_bid().unwrap().price, 101.0);
        assert_eq!(depth.asks[0].qty, 150);
    }

    #[test]
    fn depth_array_form_parses() {
        let payload = json!({
            "SecurityId": "13",
            "bids": [["25000.5", "75"], ["25000.0", "150"]],
            "asks": [["25001.0", "75"]]
        });
        let depth = parse_quote(&payload).unwrap().depth.unwrap();
        assert_eq!(depth.bids.len(), 2);
        assert_eq!(depth.bids[1].qty, 150);
        assert_eq!(depth.asks[0].price, 25001.0);
    }
}
