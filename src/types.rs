// =============================================================================
// Shared types used across the Nexus terminal core
// =============================================================================

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Exchanges & segments
// ---------------------------------------------------------------------------

/// Exchange an instrument trades on. `Idx` covers spot index feeds that carry
/// no tradeable segment of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    Nse,
    Bse,
    Mcx,
    Idx,
}

impl Exchange {
    /// Parse the vendor exchange column ("NSE", "BSE", "MCX", "IDX" and the
    /// FNO variants which collapse onto their cash exchange).
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_uppercase().as_str() {
            "NSE" | "NFO" | "NSE_FNO" | "NSE_EQ" | "NSE_INDEX" => Some(Self::Nse),
            "BSE" | "BFO" | "BSE_FNO" | "BSE_EQ" | "BSE_INDEX" => Some(Self::Bse),
            "MCX" | "MCX_COMM" | "MCX_FO" => Some(Self::Mcx),
            "IDX" | "IDX_I" => Some(Self::Idx),
            _ => None,
        }
    }

    /// Derive the exchange from a segment string, preferring segment hints
    /// over the raw exchange code the way the vendor CSV does.
    pub fn from_segment(segment: &str) -> Option<Self> {
        let upper = segment.to_uppercase();
        if upper.contains("MCX") {
            Some(Self::Mcx)
        } else if upper.contains("BSE") {
            Some(Self::Bse)
        } else if upper.contains("NSE") || upper.contains("NFO") {
            Some(Self::Nse)
        } else if upper.contains("IDX") {
            Some(Self::Idx)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nse => write!(f, "NSE"),
            Self::Bse => write!(f, "BSE"),
            Self::Mcx => write!(f, "MCX"),
            Self::Idx => write!(f, "IDX"),
        }
    }
}

// ---------------------------------------------------------------------------
// Instrument classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentKind {
    Equity,
    Index,
    Future,
    Option,
}

impl std::fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equity => write!(f, "EQUITY"),
            Self::Index => write!(f, "INDEX"),
            Self::Future => write!(f, "FUTURE"),
            Self::Option => write!(f, "OPTION"),
        }
    }
}

/// Call / put side of an option leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionSide {
    CE,
    PE,
}

impl OptionSide {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_uppercase().as_str() {
            "CE" | "CALL" => Some(Self::CE),
            "PE" | "PUT" => Some(Self::PE),
            _ => None,
        }
    }
}

impl std::fmt::Display for OptionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CE => write!(f, "CE"),
            Self::PE => write!(f, "PE"),
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription tiers & feed modes
// ---------------------------------------------------------------------------

/// Tier A is user-driven and evictable; Tier B is always-on and protected
/// for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    A,
    B,
}

impl Tier {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_uppercase().as_str() {
            "TIER_A" | "A" => Some(Self::A),
            "TIER_B" | "B" => Some(Self::B),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "TIER_A"),
            Self::B => write!(f, "TIER_B"),
        }
    }
}

/// Vendor feed mode request codes: TICKER carries LTP only, QUOTE adds
/// bid/ask and five-level depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedMode {
    Ticker,
    Quote,
}

impl FeedMode {
    pub fn request_code(self) -> u16 {
        match self {
            Self::Ticker => 15,
            Self::Quote => 17,
        }
    }
}

impl std::fmt::Display for FeedMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ticker => write!(f, "TICKER"),
            Self::Quote => write!(f, "QUOTE"),
        }
    }
}

// ---------------------------------------------------------------------------
// Order model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }

    pub fn sign(self) -> i64 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    StopLimit,
    Gtt,
    Trigger,
}

impl OrderType {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_uppercase().as_str() {
            "MARKET" => Some(Self::Market),
            "LIMIT" => Some(Self::Limit),
            "SL-M" => Some(Self::StopMarket),
            "SL-L" => Some(Self::StopLimit),
            "GTT" => Some(Self::Gtt),
            "TRIGGER" => Some(Self::Trigger),
            _ => None,
        }
    }

    /// Trigger-gated types stay PENDING until the trigger price is crossed.
    pub fn is_trigger_based(self) -> bool {
        matches!(
            self,
            Self::StopMarket | Self::StopLimit | Self::Gtt | Self::Trigger
        )
    }

    /// Effective type once a trigger fires: SL-M and TRIGGER become MARKET,
    /// SL-L and GTT become LIMIT.
    pub fn activated(self) -> Self {
        match self {
            Self::StopMarket | Self::Trigger => Self::Market,
            Self::StopLimit | Self::Gtt => Self::Limit,
            other => other,
        }
    }

    /// Types that require a valid positive limit price up front.
    pub fn requires_price(self) -> bool {
        matches!(self, Self::Limit | Self::StopLimit | Self::Gtt)
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
            Self::StopMarket => write!(f, "SL-M"),
            Self::StopLimit => write!(f, "SL-L"),
            Self::Gtt => write!(f, "GTT"),
            Self::Trigger => write!(f, "TRIGGER"),
        }
    }
}

/// MIS is the intraday margin product, NORMAL the overnight/carry product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductType {
    Mis,
    Normal,
}

impl ProductType {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_uppercase().as_str() {
            "MIS" => Some(Self::Mis),
            "NORMAL" | "CNC" | "NRML" => Some(Self::Normal),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProductType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mis => write!(f, "MIS"),
            Self::Normal => write!(f, "NORMAL"),
        }
    }
}

/// Order status state machine. Transitions are irreversible except
/// PENDING <-> PARTIAL; EXECUTED, CANCELLED and REJECTED are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Partial,
    Executed,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Executed | Self::Cancelled | Self::Rejected)
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "PARTIAL" => Some(Self::Partial),
            "EXECUTED" => Some(Self::Executed),
            "CANCELLED" => Some(Self::Cancelled),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Partial => write!(f, "PARTIAL"),
            Self::Executed => write!(f, "EXECUTED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Rejected => write!(f, "REJECTED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Market depth & ticks
// ---------------------------------------------------------------------------

/// A single price level in the five-level book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub qty: i64,
}

/// Normalized two-sided depth, best level first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Depth {
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

impl Depth {
    pub fn best_bid(&self) -> Option<&DepthLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&DepthLevel> {
        self.asks.first()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// A normalized tick, tagged by instrument kind at enrichment time. Unknown
/// vendor payloads never become ticks; they are dropped with a counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub token: String,
    pub exchange: Exchange,
    pub segment: String,
    pub symbol: String,
    pub kind: InstrumentKind,
    pub expiry: Option<String>,
    pub strike: Option<f64>,
    pub option_side: Option<OptionSide>,
    pub ltp: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub depth: Option<Depth>,
    pub ts: chrono::DateTime<chrono::Utc>,
}

// ---------------------------------------------------------------------------
// Domain rejection reasons
// ---------------------------------------------------------------------------

/// Enumerated domain rejections surfaced on the order record and as
/// execution events. These are business outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    UserBlocked,
    SegmentRestricted,
    InvalidTrigger,
    InvalidPrice,
    NoLiquidityTimeout,
    NotAllowed,
    Capacity,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserBlocked => write!(f, "USER_BLOCKED"),
            Self::SegmentRestricted => write!(f, "SEGMENT_RESTRICTED"),
            Self::InvalidTrigger => write!(f, "INVALID_TRIGGER"),
            Self::InvalidPrice => write!(f, "INVALID_PRICE"),
            Self::NoLiquidityTimeout => write!(f, "NO_LIQUIDITY_TIMEOUT"),
            Self::NotAllowed => write!(f, "NOT_ALLOWED"),
            Self::Capacity => write!(f, "CAPACITY"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_parsing_covers_fno_variants() {
        assert_eq!(Exchange::parse("NSE_FNO"), Some(Exchange::Nse));
        assert_eq!(Exchange::parse("bse"), Some(Exchange::Bse));
        assert_eq!(Exchange::parse("MCX"), Some(Exchange::Mcx));
        assert_eq!(Exchange::parse("IDX_I"), Some(Exchange::Idx));
        assert_eq!(Exchange::parse("LSE"), None);
    }

    #[test]
    fn segment_hint_resolves_fno_segments() {
        assert_eq!(Exchange::from_segment("MCX_FO"), Some(Exchange::Mcx));
        assert_eq!(Exchange::from_segment("BSE_FNO"), Some(Exchange::Bse));
        assert_eq!(Exchange::from_segment("NSE_EQ"), Some(Exchange::Nse));
    }

    #[test]
    fn trigger_types_activate_correctly() {
        assert_eq!(OrderType::StopMarket.activated(), OrderType::Market);
        assert_eq!(OrderType::Trigger.activated(), OrderType::Market);
        assert_eq!(OrderType::StopLimit.activated(), OrderType::Limit);
        assert_eq!(OrderType::Gtt.activated(), OrderType::Limit);
        assert!(OrderType::StopMarket.is_trigger_based());
        assert!(!OrderType::Market.is_trigger_based());
    }

    #[test]
    fn terminal_statuses_are_sticky_markers() {
        assert!(OrderStatus::Executed.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Partial.is_terminal());
    }

    #[test]
    fn order_type_round_trips_vendor_spelling() {
        for text in ["MARKET", "LIMIT", "SL-M", "SL-L", "GTT", "TRIGGER"] {
            let parsed = OrderType::parse(text).unwrap();
            assert_eq!(parsed.to_string(), text);
        }
    }
}
