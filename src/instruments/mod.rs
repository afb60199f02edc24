// =============================================================================
// Instruments — static instrument master, curated ids, option token map
// =============================================================================

pub mod option_tokens;
pub mod registry;
pub mod security_ids;

pub use option_tokens::OptionTokenMap;
pub use registry::{InstrumentRegistry, InstrumentRow};

use chrono::NaiveDate;

/// Expiry formats the vendor emits across its CSV and REST payloads.
const EXPIRY_FORMATS: [&str; 4] = ["%Y-%m-%d", "%d%b%Y", "%d%b%y", "%d%B%Y"];

/// Parse an expiry in any vendor format ("2026-02-26", "26FEB2026",
/// "26FEB26", "26FEBRUARY2026"). Returns `None` for blanks and garbage.
pub fn parse_expiry(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim().to_uppercase();
    if trimmed.is_empty() {
        return None;
    }
    // %b matching is case-sensitive for some locales; normalise to title
    // case for the month abbreviation forms.
    for fmt in EXPIRY_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&trimmed, fmt) {
            return Some(date);
        }
        let titled = title_case_months(&trimmed);
        if let Ok(date) = NaiveDate::parse_from_str(&titled, fmt) {
            return Some(date);
        }
    }
    None
}

/// Canonical ISO rendering used in token keys and cache keys.
pub fn normalize_expiry(text: &str) -> Option<String> {
    parse_expiry(text).map(|d| d.format("%Y-%m-%d").to_string())
}

/// Render a strike without a trailing ".0" so token keys stay stable
/// regardless of how the strike arrived (25000 vs 25000.0 vs 25000.5).
pub fn fmt_strike(strike: f64) -> String {
    if (strike - strike.round()).abs() < 1e-9 {
        format!("{}", strike.round() as i64)
    } else {
        format!("{strike}")
    }
}

/// Components parsed out of a display option symbol such as
/// "NIFTY 26FEB2026 25000 CE" or "RELIANCE 2600 PE" (expiry optional).
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOptionSymbol {
    pub underlying: String,
    pub expiry: Option<String>,
    pub strike: f64,
    pub side: crate::types::OptionSide,
}

/// Parse a space-separated option symbol: the last part is CE/PE, the part
/// before it the strike, and an alphanumeric part before that is taken as
/// the expiry hint. Everything remaining is the underlying.
pub fn parse_option_symbol(symbol: &str) -> Option<ParsedOptionSymbol> {
    let parts: Vec<&str> = symbol.split_whitespace().collect();
    if parts.len() < 3 {
        return None;
    }
    let side = crate::types::OptionSide::parse(parts[parts.len() - 1])?;
    let strike: f64 = parts[parts.len() - 2].parse().ok()?;

    let mut underlying_end = parts.len() - 2;
    let mut expiry = None;
    if parts.len() >= 4 {
        let candidate = parts[parts.len() - 3];
        let has_alpha = candidate.chars().any(|c| c.is_ascii_alphabetic());
        let has_digit = candidate.chars().any(|c| c.is_ascii_digit());
        if has_alpha && has_digit {
            expiry = normalize_expiry(candidate).or_else(|| Some(candidate.to_uppercase()));
            underlying_end = parts.len() - 3;
        }
    }

    let underlying = parts[..underlying_end].join(" ");
    if underlying.is_empty() {
        return None;
    }
    Some(ParsedOptionSymbol {
        underlying: security_ids::canonical_symbol(&underlying),
        expiry,
        strike,
        side,
    })
}

fn title_case_months(text: &str) -> String {
    // "26FEB2026" -> "26Feb2026" so chrono's %b accepts it.
    let mut out = String::with_capacity(text.len());
    let mut prev_alpha = false;
    for c in text.chars() {
        if c.is_ascii_alphabetic() {
            if prev_alpha {
                out.push(c.to_ascii_lowercase());
            } else {
                out.push(c);
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}
