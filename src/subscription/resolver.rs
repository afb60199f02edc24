// =============================================================================
// Metadata Resolver — symbolic subscription to vendor (security_id, segment)
// =============================================================================
//
// Resolution order:
//   1. registry rows matched on underlying + expiry + option type + strike;
//   2. the CSV option-token map (options only);
//   3. the NSE equity registry (non-option fallback for cash rows the
//      symbol index can miss);
//   4. curated defaults: equities, well-known indices, MCX near-month.
//
// An option lookup that fails every step resolves to NOTHING, never to
// the underlying index id. Unresolved subscriptions stay off the wire.
// =============================================================================

use std::sync::Arc;

use crate::instruments::{normalize_expiry, security_ids, InstrumentRegistry, OptionTokenMap};
use crate::types::{Exchange, FeedMode, OptionSide};

/// Fully resolved vendor metadata for one subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMeta {
    pub security_id: String,
    pub exchange: Exchange,
    pub segment: String,
    pub symbol: String,
}

impl ResolvedMeta {
    /// Feed mode for this instrument: options and equities stream QUOTE,
    /// indices and futures stream TICKER.
    pub fn feed_mode(&self, option_side: Option<OptionSide>, strike: Option<f64>) -> FeedMode {
        if option_side.is_some() || strike.is_some() {
            FeedMode::Quote
        } else if self.segment.ends_with("_EQ") || self.segment == "E" {
            FeedMode::Quote
        } else {
            FeedMode::Ticker
        }
    }
}

/// Expand the CSV's single-letter segment codes onto wire segment names;
/// full names pass through untouched.
fn expand_segment(exchange: Exchange, raw: &str) -> String {
    match raw {
        "" | "E" => format!("{exchange}_EQ"),
        "D" => format!("{exchange}_FNO"),
        "M" => "MCX_COMM".to_string(),
        "I" => "IDX_I".to_string(),
        other => other.to_string(),
    }
}

pub struct MetadataResolver {
    registry: Arc<InstrumentRegistry>,
    token_map: Arc<OptionTokenMap>,
}

impl MetadataResolver {
    pub fn new(registry: Arc<InstrumentRegistry>, token_map: Arc<OptionTokenMap>) -> Self {
        Self {
            registry,
            token_map,
        }
    }

    pub fn resolve(
        &self,
        symbol: &str,
        expiry: Option<&str>,
        strike: Option<f64>,
        option_side: Option<OptionSide>,
    ) -> Option<ResolvedMeta> {
        let canonical = security_ids::canonical_symbol(symbol);
        let expiry_iso = expiry.and_then(normalize_expiry);

        // 1. Registry rows keyed by underlying (and symbol as a fallback).
        if let Some(meta) =
            self.resolve_from_registry(&canonical, expiry_iso.as_deref(), strike, option_side)
        {
            return Some(meta);
        }

        // 2. Option token map.
        if let (Some(side), Some(strike_val), Some(iso)) = (option_side, strike, &expiry_iso) {
            if let Some(token_meta) = self.token_map.resolve(side, &canonical, strike_val, iso) {
                let exchange = Exchange::from_segment(&token_meta.segment)
                    .or_else(|| Exchange::parse(&token_meta.exchange))
                    .unwrap_or(Exchange::Nse);
                return Some(ResolvedMeta {
                    security_id: token_meta.security_id,
                    exchange,
                    segment: token_meta.segment,
                    symbol: canonical,
                });
            }
        }

        // 3. NSE equity fallback for non-option requests.
        if option_side.is_none() {
            if let Some(meta) = self.resolve_from_equities(&canonical) {
                return Some(meta);
            }
        }

        // Options must resolve through real option rows; an index id is
        // never a valid stand-in for an option leg.
        if option_side.is_some() && strike.is_some() && expiry_iso.is_some() {
            return None;
        }

        // 4. Curated defaults.
        if let Some(curated) = security_ids::default_equity_security(&canonical) {
            return Some(ResolvedMeta {
                security_id: curated.security_id.to_string(),
                exchange: curated.exchange,
                segment: curated.segment.to_string(),
                symbol: canonical,
            });
        }
        if let Some(curated) = security_ids::default_index_security(&canonical) {
            return Some(ResolvedMeta {
                security_id: curated.security_id.to_string(),
                exchange: curated.exchange,
                segment: curated.segment.to_string(),
                symbol: canonical,
            });
        }
        if let Some(future) = self.registry.nearest_mcx_future(&canonical) {
            return Some(ResolvedMeta {
                security_id: future.security_id,
                exchange: Exchange::Mcx,
                segment: expand_segment(Exchange::Mcx, &future.segment),
                symbol: canonical,
            });
        }

        None
    }

    fn resolve_from_registry(
        &self,
        canonical: &str,
        expiry_iso: Option<&str>,
        strike: Option<f64>,
        option_side: Option<OptionSide>,
    ) -> Option<ResolvedMeta> {
        let rows = {
            let by_underlying = self.registry.rows_for_underlying(canonical);
            if by_underlying.is_empty() {
                self.registry.rows_for_symbol(canonical)
            } else {
                by_underlying
            }
        };

        for row in rows {
            let row_expiry_iso = row.expiry_date.map(|d| d.format("%Y-%m-%d").to_string());
            match (expiry_iso, &row_expiry_iso) {
                (Some(wanted), Some(actual)) if wanted != actual => continue,
                (Some(_), None) => continue,
                _ => {}
            }

            match option_side {
                Some(side) => {
                    if OptionSide::parse(&row.option_type) != Some(side) {
                        continue;
                    }
                }
                None => {
                    // Non-option requests only match cash/future rows.
                    if !row.option_type.is_empty() && row.option_type != "XX" {
                        continue;
                    }
                }
            }

            if let Some(wanted_strike) = strike {
                match row.strike {
                    Some(actual) if (actual - wanted_strike).abs() <= 1e-6 => {}
                    _ => continue,
                }
            }

            if row.security_id.is_empty() {
                continue;
            }

            let mut exchange = Exchange::from_segment(&row.segment)
                .or_else(|| Exchange::parse(&row.exchange))
                .unwrap_or(Exchange::Nse);
            let segment;

            // Option rows trade on the FNO segment of their exchange even
            // when the CSV carries the bare exchange code.
            if option_side.is_some() {
                match row.exchange.as_str() {
                    "BSE" => {
                        exchange = Exchange::Bse;
                        segment = "BSE_FNO".to_string();
                    }
                    "MCX" => {
                        exchange = Exchange::Mcx;
                        segment = "MCX_FO".to_string();
                    }
                    _ => {
                        exchange = Exchange::Nse;
                        segment = "NSE_FNO".to_string();
                    }
                }
            } else {
                segment = expand_segment(exchange, &row.segment);
            }

            return Some(ResolvedMeta {
                security_id: row.security_id,
                exchange,
                segment,
                symbol: canonical.to_string(),
            });
        }
        None
    }

    fn resolve_from_equities(&self, canonical: &str) -> Option<ResolvedMeta> {
        for row in self.registry.nse_equities(12_000) {
            let row_symbol = if row.underlying.is_empty() {
                &row.symbol
            } else {
                &row.underlying
            };
            if row_symbol != canonical {
                continue;
            }
            if !matches!(row.instrument_type.as_str(), "ES" | "ETF") {
                continue;
            }
            if row.security_id.is_empty() {
                continue;
            }
            return Some(ResolvedMeta {
                security_id: row.security_id,
                exchange: Exchange::Nse,
                segment: if row.segment == "E" || row.segment.is_empty() {
                    "NSE_EQ".to_string()
                } else {
                    row.segment
                },
                symbol: canonical.to_string(),
            });
        }
        None
    }

}

impl std::fmt::Debug for MetadataResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataResolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::registry::tests::sample_registry;

    fn resolver() -> MetadataResolver {
        let registry = Arc::new(sample_registry());
        let token_map = Arc::new(OptionTokenMap::new());
        token_map.rebuild_from(&registry);
        MetadataResolver::new(registry, token_map)
    }

    #[test]
    fn option_resolves_to_fno_row() {
        let resolver = resolver();
        let meta = resolver
            .resolve("RELIANCE", Some("2099-02-26"), Some(2_600.0), Some(OptionSide::CE))
            .unwrap();
        assert_eq!(meta.security_id, "49081");
        assert_eq!(meta.segment, "NSE_FNO");
        assert_eq!(meta.exchange, Exchange::Nse);
        assert_eq!(meta.feed_mode(Some(OptionSide::CE), Some(2_600.0)), FeedMode::Quote);
    }

    #[test]
    fn unresolved_option_never_falls_back_to_index() {
        let resolver = resolver();
        // NIFTY has a curated index id, but an unknown strike must fail.
        let meta = resolver.resolve(
            "NIFTY",
            Some("2099-02-24"),
            Some(99_999.0),
            Some(OptionSide::CE),
        );
        assert!(meta.is_none());
    }

    #[test]
    fn equity_resolves_from_cash_segment() {
        let resolver = resolver();
        let meta = resolver.resolve("TCS", None, None, None).unwrap();
        assert_eq!(meta.security_id, "11536");
        assert_eq!(meta.segment, "NSE_EQ");
        assert_eq!(meta.feed_mode(None, None), FeedMode::Quote);
    }

    #[test]
    fn index_falls_back_to_curated_table() {
        let resolver = resolver();
        let meta = resolver.resolve("NIFTY 50", None, None, None).unwrap();
        assert_eq!(meta.security_id, "13");
        assert_eq!(meta.exchange, Exchange::Idx);
        // Index spot feed defaults to TICKER mode.
        assert_eq!(meta.feed_mode(None, None), FeedMode::Ticker);
    }

    #[test]
    fn mcx_future_resolves_near_month() {
        let resolver = resolver();
        let meta = resolver.resolve("CRUDEOIL", None, None, None).unwrap();
        assert_eq!(meta.security_id, "428901");
        assert_eq!(meta.exchange, Exchange::Mcx);
    }

    #[test]
    fn expiry_mismatch_skips_rows() {
        let resolver = resolver();
        let meta = resolver.resolve(
            "RELIANCE",
            Some("2099-03-26"),
            Some(2_600.0),
            Some(OptionSide::CE),
        );
        assert!(meta.is_none());
    }
}
