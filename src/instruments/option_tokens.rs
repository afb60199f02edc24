// =============================================================================
// Option Token Map — canonical option keys to vendor security ids
// =============================================================================
//
// Canonical key: "{CE|PE}_{UNDERLYING}_{STRIKE}_{EXPIRY_ISO}". Legs whose
// key is absent keep the key itself as a synthetic token; those synthetic
// tokens are never put on the vendor wire.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::info;

use super::registry::InstrumentRegistry;
use super::{fmt_strike, security_ids};
use crate::types::OptionSide;

/// Resolved metadata for an option token.
#[derive(Debug, Clone)]
pub struct OptionTokenMeta {
    pub security_id: String,
    pub segment: String,
    pub exchange: String,
    pub lot_size: Option<i64>,
}

struct Inner {
    tokens: HashMap<String, OptionTokenMeta>,
    lot_sizes: HashMap<String, i64>,
}

pub struct OptionTokenMap {
    inner: RwLock<Inner>,
}

impl OptionTokenMap {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                tokens: HashMap::new(),
                lot_sizes: HashMap::new(),
            }),
        }
    }

    /// Build the canonical option key.
    pub fn token_key(side: OptionSide, underlying: &str, strike: f64, expiry_iso: &str) -> String {
        format!(
            "{}_{}_{}_{}",
            side,
            security_ids::canonical_symbol(underlying),
            fmt_strike(strike),
            expiry_iso
        )
    }

    /// Rebuild the map from the registry's option rows. Called after every
    /// master refresh; unresolved subscriptions retry against the new map.
    pub fn rebuild_from(&self, registry: &InstrumentRegistry) {
        let mut tokens = HashMap::new();
        let mut lot_sizes = HashMap::new();

        let mut underlyings: Vec<String> = registry.fo_underlyings().into_iter().collect();
        underlyings.extend(
            security_ids::PERMITTED_INDICES
                .iter()
                .map(|s| s.to_string()),
        );
        underlyings.extend(security_ids::mcx_watch_symbols().iter().map(|s| s.to_string()));
        underlyings.sort();
        underlyings.dedup();

        for underlying in &underlyings {
            for row in registry.rows_for_underlying(underlying) {
                if let Some(lot) = row.lot_size {
                    lot_sizes.entry(underlying.clone()).or_insert(lot);
                }

                let side = match OptionSide::parse(&row.option_type) {
                    Some(side) => side,
                    None => continue,
                };
                let (strike, expiry_date) = match (row.strike, row.expiry_date) {
                    (Some(strike), Some(date)) => (strike, date),
                    _ => continue,
                };
                if row.security_id.is_empty() {
                    continue;
                }

                let expiry_iso = expiry_date.format("%Y-%m-%d").to_string();
                let key = Self::token_key(side, underlying, strike, &expiry_iso);

                let segment = if row.segment.is_empty() {
                    match row.exchange.as_str() {
                        "BSE" => "BSE_FNO".to_string(),
                        "MCX" => "MCX_FO".to_string(),
                        _ => "NSE_FNO".to_string(),
                    }
                } else {
                    row.segment.clone()
                };

                tokens.insert(
                    key,
                    OptionTokenMeta {
                        security_id: row.security_id.clone(),
                        segment,
                        exchange: row.exchange.clone(),
                        lot_size: row.lot_size,
                    },
                );
            }
        }

        info!(
            tokens = tokens.len(),
            lot_sizes = lot_sizes.len(),
            "option token map rebuilt"
        );

        let mut inner = self.inner.write();
        inner.tokens = tokens;
        inner.lot_sizes = lot_sizes;
    }

    pub fn security_id(&self, token_key: &str) -> Option<String> {
        self.inner
            .read()
            .tokens
            .get(token_key)
            .map(|m| m.security_id.clone())
    }

    pub fn meta(&self, token_key: &str) -> Option<OptionTokenMeta> {
        self.inner.read().tokens.get(token_key).cloned()
    }

    pub fn resolve(
        &self,
        side: OptionSide,
        underlying: &str,
        strike: f64,
        expiry_iso: &str,
    ) -> Option<OptionTokenMeta> {
        self.meta(&Self::token_key(side, underlying, strike, expiry_iso))
    }

    /// Lot size for an underlying: MCX overrides first, then CSV.
    pub fn lot_size(&self, underlying: &str) -> Option<i64> {
        let canonical = security_ids::canonical_symbol(underlying);
        if let Some(lot) = security_ids::mcx_lot_size_override(&canonical) {
            return Some(lot);
        }
        self.inner.read().lot_sizes.get(&canonical).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.read().tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().tokens.is_empty()
    }
}

impl Default for OptionTokenMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OptionTokenMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptionTokenMap")
            .field("tokens", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::registry::tests::sample_registry;

    #[test]
    fn token_keys_are_stable_across_strike_spellings() {
        assert_eq!(
            OptionTokenMap::token_key(OptionSide::CE, "NIFTY 50", 25_000.0, "2099-02-24"),
            "CE_NIFTY_25000_2099-02-24"
        );
        assert_eq!(
            OptionTokenMap::token_key(OptionSide::PE, "nifty", 25_000.0, "2099-02-24"),
            "PE_NIFTY_25000_2099-02-24"
        );
    }

    #[test]
    fn rebuild_indexes_option_rows_only() {
        let map = OptionTokenMap::new();
        map.rebuild_from(&sample_registry());
        assert_eq!(
            map.security_id("CE_NIFTY_25000_2099-02-24").as_deref(),
            Some("61001")
        );
        assert_eq!(
            map.security_id("PE_NIFTY_25000_2099-02-24").as_deref(),
            Some("61002")
        );
        // Futures rows never become option tokens.
        assert!(map.security_id("XX_CRUDEOIL_0_2099-02-17").is_none());
    }

    #[test]
    fn resolve_carries_segment_and_lot() {
        let map = OptionTokenMap::new();
        map.rebuild_from(&sample_registry());
        let meta = map
            .resolve(OptionSide::CE, "RELIANCE", 2_600.0, "2099-02-26")
            .unwrap();
        assert_eq!(meta.security_id, "49081");
        assert_eq!(meta.lot_size, Some(250));
    }

    #[test]
    fn lot_size_prefers_overrides() {
        let map = OptionTokenMap::new();
        map.rebuild_from(&sample_registry());
        assert_eq!(map.lot_size("CRUDEOIL"), Some(100));
        assert_eq!(map.lot_size("NIFTY"), Some(65));
    }
}
