// =============================================================================
// Instrument Registry — indexed view over the provider scrip master CSV
// =============================================================================
//
// The provider publishes ~290k rows. We parse once (lazily on first use or
// eagerly at startup) and build the lookup indexes the subscription fabric
// and option-chain cache need: by symbol, by (underlying, expiry), by
// segment, the F&O-eligible underlying set and per-symbol strike steps.
// =============================================================================

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;
use tracing::info;

use super::{parse_expiry, security_ids};

/// One parsed row of the scrip master.
#[derive(Debug, Clone)]
pub struct InstrumentRow {
    pub symbol: String,
    pub underlying: String,
    pub exchange: String,
    pub segment: String,
    pub security_id: String,
    pub instrument_type: String,
    pub expiry: Option<String>,
    pub expiry_date: Option<NaiveDate>,
    pub strike: Option<f64>,
    pub option_type: String,
    pub lot_size: Option<i64>,
}

impl InstrumentRow {
    /// Futures rows carry OPTION_TYPE "XX" or blank.
    pub fn is_future(&self) -> bool {
        self.option_type.is_empty() || self.option_type == "XX"
    }
}

#[derive(Default)]
struct Indexes {
    rows: Vec<InstrumentRow>,
    by_symbol: HashMap<String, Vec<usize>>,
    by_underlying: HashMap<String, Vec<usize>>,
    by_underlying_expiry: HashMap<(String, String), Vec<usize>>,
    by_segment: HashMap<String, Vec<usize>>,
    fo_underlyings: HashSet<String>,
    strike_steps: HashMap<String, f64>,
}

/// Thread-safe instrument master. `load` is idempotent.
pub struct InstrumentRegistry {
    indexes: RwLock<Indexes>,
    loaded: RwLock<bool>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self {
            indexes: RwLock::new(Indexes::default()),
            loaded: RwLock::new(false),
        }
    }

    pub fn is_loaded(&self) -> bool {
        *self.loaded.read()
    }

    /// Load and index the master CSV from disk.
    pub fn load_from_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open instrument master {}", path.display()))?;
        self.load_from_reader(file)
    }

    /// Load and index the master CSV from any reader (tests feed strings).
    pub fn load_from_reader(&self, reader: impl Read) -> Result<()> {
        {
            if *self.loaded.read() {
                return Ok(());
            }
        }

        let mut csv_reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(reader);
        let headers = csv_reader
            .headers()
            .context("instrument master has no header row")?
            .clone();

        let col = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
        let idx_symbol = col("SYMBOL_NAME").or_else(|| col("SYMBOL"));
        let idx_underlying = col("UNDERLYING_SYMBOL");
        let idx_exchange = col("EXCH_ID").or_else(|| col("EXCHANGE"));
        let idx_segment = col("SEGMENT");
        let idx_security = col("SECURITY_ID");
        let idx_instrument = col("INSTRUMENT_TYPE").or_else(|| col("INSTRUMENT"));
        let idx_expiry = col("SM_EXPIRY_DATE")
            .or_else(|| col("EXPIRY_DATE"))
            .or_else(|| col("EXPIRY"));
        let idx_strike = col("STRIKE_PRICE");
        let idx_option = col("OPTION_TYPE");
        let idx_lot = col("LOT_SIZE").or_else(|| col("MARKET_LOT")).or_else(|| col("LOT"));

        let mut indexes = Indexes::default();
        let field = |record: &csv::StringRecord, idx: Option<usize>| -> String {
            idx.and_then(|i| record.get(i))
                .unwrap_or("")
                .trim()
                .to_string()
        };

        for record in csv_reader.records() {
            let record = match record {
                Ok(r) => r,
                Err(_) => continue, // skip malformed rows, keep loading
            };

            let symbol = field(&record, idx_symbol).to_uppercase();
            let underlying = field(&record, idx_underlying).to_uppercase();
            if symbol.is_empty() && underlying.is_empty() {
                continue;
            }

            let expiry_raw = field(&record, idx_expiry);
            let expiry_date = parse_expiry(&expiry_raw);
            let strike = field(&record, idx_strike).parse::<f64>().ok().filter(|s| *s > 0.0);
            let lot_size = field(&record, idx_lot)
                .parse::<f64>()
                .ok()
                .map(|v| v as i64)
                .filter(|v| *v > 0);

            let row = InstrumentRow {
                symbol: symbol.clone(),
                underlying: underlying.clone(),
                exchange: field(&record, idx_exchange).to_uppercase(),
                segment: field(&record, idx_segment).to_uppercase(),
                security_id: field(&record, idx_security),
                instrument_type: field(&record, idx_instrument).to_uppercase(),
                expiry: if expiry_raw.is_empty() {
                    None
                } else {
                    Some(expiry_raw)
                },
                expiry_date,
                strike,
                option_type: field(&record, idx_option).to_uppercase(),
                lot_size,
            };

            let i = indexes.rows.len();

            if !row.symbol.is_empty() {
                indexes.by_symbol.entry(row.symbol.clone()).or_default().push(i);
            }
            if !row.underlying.is_empty() {
                indexes
                    .by_underlying
                    .entry(row.underlying.clone())
                    .or_default()
                    .push(i);
                if let Some(date) = row.expiry_date {
                    indexes
                        .by_underlying_expiry
                        .entry((row.underlying.clone(), date.format("%Y-%m-%d").to_string()))
                        .or_default()
                        .push(i);
                }
            }
            if !row.segment.is_empty() {
                indexes
                    .by_segment
                    .entry(row.segment.clone())
                    .or_default()
                    .push(i);
            }
            if matches!(row.instrument_type.as_str(), "FUTSTK" | "OPTSTK") {
                let base = if row.underlying.is_empty() {
                    row.symbol.clone()
                } else {
                    row.underlying.clone()
                };
                indexes.fo_underlyings.insert(base);
            }

            indexes.rows.push(row);
        }

        // Derive strike steps per underlying from the smallest positive gap
        // between adjacent option strikes.
        let underlyings: Vec<String> = indexes.by_underlying.keys().cloned().collect();
        for underlying in underlyings {
            let step = Self::derive_strike_step(&indexes, &underlying);
            if let Some(step) = step {
                indexes.strike_steps.insert(underlying, step);
            }
        }

        info!(
            rows = indexes.rows.len(),
            fo_underlyings = indexes.fo_underlyings.len(),
            symbols = indexes.by_symbol.len(),
            "instrument registry loaded"
        );

        *self.indexes.write() = indexes;
        *self.loaded.write() = true;
        Ok(())
    }

    fn derive_strike_step(indexes: &Indexes, underlying: &str) -> Option<f64> {
        let ids = indexes.by_underlying.get(underlying)?;
        let mut strikes = BTreeSet::new();
        for &i in ids.iter().take(500) {
            if let Some(strike) = indexes.rows[i].strike {
                strikes.insert((strike * 100.0).round() as i64);
            }
        }
        let strikes: Vec<i64> = strikes.into_iter().collect();
        let mut min_gap: Option<i64> = None;
        for pair in strikes.windows(2) {
            let gap = pair[1] - pair[0];
            if gap > 0 {
                min_gap = Some(min_gap.map_or(gap, |m: i64| m.min(gap)));
            }
        }
        min_gap.map(|g| g as f64 / 100.0)
    }

    // ── Lookups ─────────────────────────────────────────────────────────

    pub fn rows_for_symbol(&self, symbol: &str) -> Vec<InstrumentRow> {
        let indexes = self.indexes.read();
        indexes
            .by_symbol
            .get(&symbol.to_uppercase())
            .map(|ids| ids.iter().map(|&i| indexes.rows[i].clone()).collect())
            .unwrap_or_default()
    }

    pub fn rows_for_underlying(&self, underlying: &str) -> Vec<InstrumentRow> {
        let indexes = self.indexes.read();
        indexes
            .by_underlying
            .get(&underlying.to_uppercase())
            .map(|ids| ids.iter().map(|&i| indexes.rows[i].clone()).collect())
            .unwrap_or_default()
    }

    pub fn rows_for_underlying_expiry(
        &self,
        underlying: &str,
        expiry_iso: &str,
    ) -> Vec<InstrumentRow> {
        let indexes = self.indexes.read();
        indexes
            .by_underlying_expiry
            .get(&(underlying.to_uppercase(), expiry_iso.to_string()))
            .map(|ids| ids.iter().map(|&i| indexes.rows[i].clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_fo_eligible(&self, symbol: &str) -> bool {
        self.indexes
            .read()
            .fo_underlyings
            .contains(&symbol.to_uppercase())
    }

    pub fn fo_underlyings(&self) -> HashSet<String> {
        self.indexes.read().fo_underlyings.clone()
    }

    /// NSE cash-segment equity rows (SEGMENT = "E"), capped at `limit`.
    pub fn nse_equities(&self, limit: usize) -> Vec<InstrumentRow> {
        let indexes = self.indexes.read();
        indexes
            .by_segment
            .get("E")
            .map(|ids| {
                ids.iter()
                    .map(|&i| &indexes.rows[i])
                    .filter(|r| r.exchange == "NSE")
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Strike step for an underlying; curated defaults backstop the CSV.
    pub fn strike_step(&self, underlying: &str) -> f64 {
        let upper = security_ids::canonical_symbol(underlying);
        if let Some(step) = self.indexes.read().strike_steps.get(&upper) {
            return *step;
        }
        security_ids::default_index_security(&upper)
            .map(|c| c.strike_step)
            .unwrap_or(1.0)
    }

    /// All future-dated expiries for an underlying, ISO-rendered ascending.
    pub fn expiries_for_underlying(&self, underlying: &str) -> Vec<String> {
        let today = Utc::now().date_naive();
        let mut dates: BTreeSet<NaiveDate> = BTreeSet::new();
        for row in self.rows_for_underlying(underlying) {
            if let Some(date) = row.expiry_date {
                if date >= today {
                    dates.insert(date);
                }
            }
        }
        dates
            .into_iter()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .collect()
    }

    /// Nearest-month MCX future for a symbol, skipping expired contracts.
    pub fn nearest_mcx_future(&self, symbol: &str) -> Option<InstrumentRow> {
        let today = Utc::now().date_naive();
        self.rows_for_symbol(symbol)
            .into_iter()
            .filter(|r| r.is_future())
            .filter(|r| r.exchange == "MCX")
            .filter(|r| !r.security_id.is_empty())
            .filter(|r| r.expiry_date.map_or(false, |d| d >= today))
            .min_by_key(|r| r.expiry_date)
    }

    /// Resolve the lot size for an underlying from the master rows.
    pub fn lot_size(&self, underlying: &str) -> Option<i64> {
        if let Some(lot) = security_ids::mcx_lot_size_override(underlying) {
            return Some(lot);
        }
        self.rows_for_underlying(underlying)
            .iter()
            .chain(self.rows_for_symbol(underlying).iter())
            .find_map(|r| r.lot_size)
    }
}

impl Default for InstrumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InstrumentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let indexes = self.indexes.read();
        f.debug_struct("InstrumentRegistry")
            .field("rows", &indexes.rows.len())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE_CSV: &str = "\
EXCH_ID,SEGMENT,SECURITY_ID,INSTRUMENT_TYPE,SYMBOL_NAME,UNDERLYING_SYMBOL,SM_EXPIRY_DATE,STRIKE_PRICE,OPTION_TYPE,LOT_SIZE
NSE,E,2885,ES,RELIANCE,RELIANCE,,,,1
NSE,E,11536,ES,TCS,TCS,,,,1
NSE,D,49081,OPTSTK,RELIANCE,RELIANCE,2099-02-26,2600,CE,250
NSE,D,49082,OPTSTK,RELIANCE,RELIANCE,2099-02-26,2600,PE,250
NSE,D,49083,OPTSTK,RELIANCE,RELIANCE,2099-02-26,2620,CE,250
NSE,D,49090,FUTSTK,RELIANCE,RELIANCE,2099-02-26,,XX,250
NSE,D,61001,OPTIDX,NIFTY,NIFTY,2099-02-24,25000,CE,65
NSE,D,61002,OPTIDX,NIFTY,NIFTY,2099-02-24,25000,PE,65
NSE,D,61003,OPTIDX,NIFTY,NIFTY,2099-02-24,25050,CE,65
MCX,M,428901,FUTCOM,CRUDEOIL,CRUDEOIL,2099-02-17,,XX,100
MCX,M,428902,FUTCOM,CRUDEOIL,CRUDEOIL,2099-03-18,,XX,100
MCX,M,429001,OPTFUT,CRUDEOIL,CRUDEOIL,2099-02-15,6200,CE,100
";

    pub(crate) fn sample_registry() -> InstrumentRegistry {
        let registry = InstrumentRegistry::new();
        registry
            .load_from_reader(SAMPLE_CSV.as_bytes())
            .expect("sample csv loads");
        registry
    }

    #[test]
    fn indexes_cover_symbol_and_underlying() {
        let registry = sample_registry();
        assert!(registry.is_loaded());
        assert_eq!(registry.rows_for_symbol("RELIANCE").len(), 6);
        assert_eq!(
            registry
                .rows_for_underlying_expiry("RELIANCE", "2099-02-26")
                .len(),
            4
        );
    }

    #[test]
    fn fo_set_tracks_stock_derivatives() {
        let registry = sample_registry();
        assert!(registry.is_fo_eligible("RELIANCE"));
        assert!(!registry.is_fo_eligible("TCS"));
    }

    #[test]
    fn strike_step_is_min_adjacent_gap() {
        let registry = sample_registry();
        assert!((registry.strike_step("RELIANCE") - 20.0).abs() < 1e-9);
        assert!((registry.strike_step("NIFTY") - 50.0).abs() < 1e-9);
        // Unknown symbols fall back to 1.0.
        assert!((registry.strike_step("UNKNOWN") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn nearest_mcx_future_picks_front_month() {
        let registry = sample_registry();
        let fut = registry.nearest_mcx_future("CRUDEOIL").unwrap();
        assert_eq!(fut.security_id, "428901");
    }

    #[test]
    fn nse_equities_filters_segment() {
        let registry = sample_registry();
        let equities = registry.nse_equities(100);
        assert_eq!(equities.len(), 2);
        assert!(equities.iter().all(|r| r.segment == "E"));
    }

    #[test]
    fn lot_size_prefers_mcx_override() {
        let registry = sample_registry();
        assert_eq!(registry.lot_size("CRUDEOIL"), Some(100));
        assert_eq!(registry.lot_size("RELIANCE"), Some(1));
    }
}
