// =============================================================================
// Chain — authoritative option-chain cache and its REST bootstrap
// =============================================================================

pub mod bootstrap;
pub mod cache;
pub mod expiry;
pub mod synth;

pub use cache::{ChainSkeleton, OptionChainCache, OptionLeg, StrikeDiff, StrikeRow};

use crate::instruments::{security_ids, InstrumentRegistry};

/// Half-window (strikes each side of ATM) per instrument family. Index
/// chains default to 25 each side; `wide_indices` (config) widens named
/// large-cap underlyings to 50; MCX chains stay narrow; stock options get
/// 12 each side.
pub fn window_half_for(
    underlying: &str,
    wide_indices: &[String],
    _registry: &InstrumentRegistry,
) -> i64 {
    let canonical = security_ids::canonical_symbol(underlying);
    if wide_indices.iter().any(|s| s.eq_ignore_ascii_case(&canonical)) {
        return 50;
    }
    if security_ids::PERMITTED_INDICES.contains(&canonical.as_str()) {
        return 25;
    }
    if security_ids::mcx_watch_symbols().contains(&canonical.as_str()) {
        return 5;
    }
    12
}
