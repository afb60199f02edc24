// =============================================================================
// Expiry Selection — per-underlying weekly/monthly rules
// =============================================================================
//
// Index contracts follow exchange-specific schedules:
//   - NIFTY settles weekly on Tuesday, SENSEX weekly on Thursday: take the
//     next two expiries on that weekday.
//   - BANKNIFTY is monthly-only: take the last matching expiry of the next
//     two months.
//   - Everything else: the next two upcoming expiries.
// =============================================================================

use chrono::{Datelike, Duration, NaiveDate, Weekday};

use crate::instruments::parse_expiry;

/// How many expiries each underlying carries in the cache.
pub const EXPIRIES_PER_UNDERLYING: usize = 2;

/// Select the expiries to cache for `underlying` out of the vendor's full
/// listing, relative to `today`. Input strings pass through unchanged so
/// cache keys match the vendor's own rendering.
pub fn select_expiries(underlying: &str, expiries: &[String], today: NaiveDate) -> Vec<String> {
    let mut parsed: Vec<(NaiveDate, String)> = expiries
        .iter()
        .filter_map(|raw| parse_expiry(raw).map(|date| (date, raw.clone())))
        .filter(|(date, _)| *date >= today)
        .collect();
    parsed.sort_by_key(|(date, _)| *date);
    if parsed.is_empty() {
        return Vec::new();
    }

    let upper = underlying.trim().to_uppercase();

    // Weekly-first indices with a per-underlying settlement weekday.
    let weekly_day = match upper.as_str() {
        "NIFTY" | "NIFTY50" => Some(Weekday::Tue),
        "SENSEX" => Some(Weekday::Thu),
        _ => None,
    };
    if let Some(day) = weekly_day {
        let weekly: Vec<&(NaiveDate, String)> =
            parsed.iter().filter(|(date, _)| date.weekday() == day).collect();
        if weekly.len() >= EXPIRIES_PER_UNDERLYING {
            return weekly
                .iter()
                .take(EXPIRIES_PER_UNDERLYING)
                .map(|(_, raw)| raw.clone())
                .collect();
        }
        if let Some(first_weekly) = weekly.first() {
            let mut selected = vec![first_weekly.1.clone()];
            if let Some(next) = parsed.iter().find(|item| item.1 != first_weekly.1) {
                selected.push(next.1.clone());
            }
            return selected;
        }
    }

    // Monthly-only indices: the last listed expiry of each month.
    if upper == "BANKNIFTY" {
        let mut monthly: Vec<(NaiveDate, String)> = Vec::new();
        for (date, raw) in &parsed {
            match monthly
                .iter_mut()
                .find(|(d, _)| d.year() == date.year() && d.month() == date.month())
            {
                Some(slot) if slot.0 < *date => *slot = (*date, raw.clone()),
                Some(_) => {}
                None => monthly.push((*date, raw.clone())),
            }
        }
        monthly.sort_by_key(|(date, _)| *date);
        if !monthly.is_empty() {
            return monthly
                .into_iter()
                .take(EXPIRIES_PER_UNDERLYING)
                .map(|(_, raw)| raw)
                .collect();
        }
    }

    parsed
        .into_iter()
        .take(EXPIRIES_PER_UNDERLYING)
        .map(|(_, raw)| raw)
        .collect()
}

/// True when `date` is the last occurrence of its weekday in its month.
pub fn is_last_weekday_of_month(date: NaiveDate) -> bool {
    (date + Duration::days(7)).month() != date.month()
}
