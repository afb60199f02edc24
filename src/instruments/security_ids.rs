// =============================================================================
// Curated Security Tables — canonical aliases and default vendor ids
// =============================================================================
//
// These tables backstop the CSV master: well-known index ids, a small
// curated equity set allowed into Tier A beyond the F&O universe, and the
// MCX watch set with near-month placeholders resolved lazily from the
// registry.
// =============================================================================

use crate::types::Exchange;

/// Default metadata for a curated instrument.
#[derive(Debug, Clone)]
pub struct CuratedSecurity {
    pub security_id: &'static str,
    pub exchange: Exchange,
    pub segment: &'static str,
    pub strike_step: f64,
    pub lot_size: i64,
}

/// Indices permitted in the subscription universe.
pub const PERMITTED_INDICES: [&str; 6] = [
    "NIFTY",
    "BANKNIFTY",
    "SENSEX",
    "FINNIFTY",
    "MIDCPNIFTY",
    "BANKEX",
];

/// Index symbols that survive the global feed-target cap unconditionally.
pub const CRITICAL_INDEX_SYMBOLS: [&str; 6] = [
    "NIFTY",
    "BANKNIFTY",
    "SENSEX",
    "BANKEX",
    "FINNIFTY",
    "MIDCPNIFTY",
];

/// Collapse vendor display names onto canonical symbols.
pub fn canonical_symbol(symbol: &str) -> String {
    let upper = symbol.trim().to_uppercase();
    match upper.as_str() {
        "NIFTY 50" | "NIFTY50" => "NIFTY".to_string(),
        "BANK NIFTY" | "NIFTY BANK" => "BANKNIFTY".to_string(),
        "BSE SENSEX" | "S&P BSE SENSEX" | "SENSEX 50" => "SENSEX".to_string(),
        "NIFTY FIN SERVICE" | "NIFTY FINANCIAL SERVICES" => "FINNIFTY".to_string(),
        "NIFTY MIDCAP SELECT" => "MIDCPNIFTY".to_string(),
        "BSE BANKEX" => "BANKEX".to_string(),
        _ => upper,
    }
}

/// Default vendor ids for the permitted indices (spot index feed).
pub fn default_index_security(symbol: &str) -> Option<CuratedSecurity> {
    let curated = match canonical_symbol(symbol).as_str() {
        "NIFTY" => CuratedSecurity {
            security_id: "13",
            exchange: Exchange::Idx,
            segment: "IDX_I",
            strike_step: 50.0,
            lot_size: 65,
        },
        "BANKNIFTY" => CuratedSecurity {
            security_id: "25",
            exchange: Exchange::Idx,
            segment: "IDX_I",
            strike_step: 100.0,
            lot_size: 30,
        },
        "SENSEX" => CuratedSecurity {
            security_id: "51",
            exchange: Exchange::Idx,
            segment: "IDX_I",
            strike_step: 100.0,
            lot_size: 20,
        },
        "FINNIFTY" => CuratedSecurity {
            security_id: "27",
            exchange: Exchange::Idx,
            segment: "IDX_I",
            strike_step: 50.0,
            lot_size: 40,
        },
        "MIDCPNIFTY" => CuratedSecurity {
            security_id: "442",
            exchange: Exchange::Idx,
            segment: "IDX_I",
            strike_step: 25.0,
            lot_size: 75,
        },
        "BANKEX" => CuratedSecurity {
            security_id: "69",
            exchange: Exchange::Idx,
            segment: "IDX_I",
            strike_step: 100.0,
            lot_size: 15,
        },
        _ => return None,
    };
    Some(curated)
}

/// Curated NSE equities allowed into Tier A even when the F&O set misses
/// them (large liquid cash names users watch intraday).
pub fn tier_a_equity_symbols() -> Vec<&'static str> {
    vec![
        "RELIANCE", "TCS", "HDFCBANK", "ICICIBANK", "INFY", "SBIN", "ITC",
        "BHARTIARTL", "LT", "AXISBANK", "KOTAKBANK", "HINDUNILVR", "TATAMOTORS",
        "MARUTI", "TITAN", "SUNPHARMA", "WIPRO", "ULTRACEMCO", "ASIANPAINT",
        "BAJFINANCE",
    ]
}

/// Default ids for the curated equities (NSE cash segment).
pub fn default_equity_security(symbol: &str) -> Option<CuratedSecurity> {
    let id = match canonical_symbol(symbol).as_str() {
        "RELIANCE" => "2885",
        "TCS" => "11536",
        "HDFCBANK" => "1333",
        "ICICIBANK" => "4963",
        "INFY" => "1594",
        "SBIN" => "3045",
        "ITC" => "1660",
        _ => return None,
    };
    Some(CuratedSecurity {
        security_id: id,
        exchange: Exchange::Nse,
        segment: "NSE_EQ",
        strike_step: 1.0,
        lot_size: 1,
    })
}

/// MCX watch set: symbols the terminal always carries near-month futures
/// (and option chains for the first two) for.
pub fn mcx_watch_symbols() -> Vec<&'static str> {
    vec!["CRUDEOIL", "NATURALGAS", "COPPER"]
}

/// MCX underlyings that also get option chains.
pub fn mcx_option_underlyings() -> Vec<&'static str> {
    vec!["CRUDEOIL", "NATURALGAS"]
}

/// Lot-size overrides for MCX contracts where the CSV column is unreliable.
pub fn mcx_lot_size_override(symbol: &str) -> Option<i64> {
    match canonical_symbol(symbol).as_str() {
        "CRUDEOIL" => Some(100),
        "NATURALGAS" => Some(1250),
        "COPPER" => Some(2500),
        "GOLD" => Some(1),
        "GOLDM" => Some(100),
        "SILVER" => Some(30),
        "SILVERM" => Some(5),
        "SILVERMIC" => Some(1),
        "ALUMINIUM" => Some(5000),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_collapse_to_canonical() {
        assert_eq!(canonical_symbol("NIFTY 50"), "NIFTY");
        assert_eq!(canonical_symbol("Bank Nifty"), "BANKNIFTY");
        assert_eq!(canonical_symbol("S&P BSE SENSEX"), "SENSEX");
        assert_eq!(canonical_symbol("reliance"), "RELIANCE");
    }

    #[test]
    fn permitted_indices_have_default_ids() {
        for index in PERMITTED_INDICES {
            let curated = default_index_security(index).unwrap();
            assert!(!curated.security_id.is_empty());
            assert_eq!(curated.exchange, Exchange::Idx);
            assert!(curated.strike_step > 0.0);
        }
    }

    #[test]
    fn mcx_overrides_cover_the_watch_set() {
        for symbol in mcx_watch_symbols() {
            assert!(mcx_lot_size_override(symbol).is_some());
        }
    }
}
