// =============================================================================
// Position Book — signed net positions per (user, symbol, product)
// =============================================================================
//
// Same-direction fills average the entry price; opposite-direction fills
// realize PnL on the closing quantity. A flip through zero realizes PnL on
// the closed leg and re-opens the remainder at the fill price.
//
// Invariant: status == OPEN  <=>  quantity != 0.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::ProductType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub user_id: i64,
    pub symbol: String,
    pub exchange_segment: String,
    pub product_type: ProductType,
    /// Signed net quantity: positive long, negative short.
    pub quantity: i64,
    pub avg_price: f64,
    pub realized_pnl: f64,
    pub status: PositionStatus,
    pub updated_at: DateTime<Utc>,
}

type Key = (i64, String, ProductType);

/// Thread-safe book of net positions keyed by (user, symbol, product).
pub struct PositionBook {
    positions: RwLock<HashMap<Key, Position>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
        }
    }

    /// Apply a signed fill to the book and return the updated position.
    ///
    /// `qty` is positive for BUY and negative for SELL. Returns the realized
    /// PnL of this fill (zero unless the fill closed quantity).
    pub fn apply_fill(
        &self,
        user_id: i64,
        symbol: &str,
        exchange_segment: &str,
        product_type: ProductType,
        qty: i64,
        price: f64,
    ) -> (Position, f64) {
        let key: Key = (user_id, symbol.to_string(), product_type);
        let mut positions = self.positions.write();
        let pos = positions.entry(key).or_insert_with(|| Position {
            user_id,
            symbol: symbol.to_string(),
            exchange_segment: exchange_segment.to_string(),
            product_type,
            quantity: 0,
            avg_price: 0.0,
            realized_pnl: 0.0,
            status: PositionStatus::Open,
            updated_at: Utc::now(),
        });

        let mut realized = 0.0;
        let same_direction =
            pos.quantity == 0 || (pos.quantity > 0) == (qty > 0);

        if same_direction {
            let total = pos.quantity + qty;
            if total != 0 {
                pos.avg_price = (pos.avg_price * pos.quantity as f64 + price * qty as f64)
                    / total as f64;
            }
            pos.quantity = total;
        } else {
            let closing_qty = pos.quantity.abs().min(qty.abs());
            let mut pnl = (price - pos.avg_price) * closing_qty as f64;
            if pos.quantity < 0 {
                pnl = -pnl;
            }
            realized = pnl;
            pos.realized_pnl += pnl;
            pos.quantity += qty;
            if pos.quantity != 0 {
                // Flip through zero: the surviving leg opened at this fill.
                pos.avg_price = price;
            }
        }

        pos.status = if pos.quantity != 0 {
            PositionStatus::Open
        } else {
            PositionStatus::Closed
        };
        pos.updated_at = Utc::now();

        info!(
            user_id,
            symbol,
            qty,
            price,
            net_qty = pos.quantity,
            avg_price = pos.avg_price,
            realized,
            "position updated"
        );

        (pos.clone(), realized)
    }

    pub fn get(&self, user_id: i64, symbol: &str, product_type: ProductType) -> Option<Position> {
        self.positions
            .read()
            .get(&(user_id, symbol.to_string(), product_type))
            .cloned()
    }

    pub fn open_positions(&self, user_id: Option<i64>) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .filter(|p| p.status == PositionStatus::Open)
            .filter(|p| user_id.map_or(true, |uid| p.user_id == uid))
            .cloned()
            .collect()
    }

    pub fn all_positions(&self, user_id: Option<i64>) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .filter(|p| user_id.map_or(true, |uid| p.user_id == uid))
            .cloned()
            .collect()
    }

    /// Restore a persisted position (startup rehydration or admin backdate).
    pub fn restore(&self, position: Position) {
        let key = (
            position.user_id,
            position.symbol.clone(),
            position.product_type,
        );
        self.positions.write().insert(key, position);
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let positions = self.positions.read();
        let open = positions
            .values()
            .filter(|p| p.status == PositionStatus::Open)
            .count();
        f.debug_struct("PositionBook")
            .field("total", &positions.len())
            .field("open", &open)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> PositionBook {
        PositionBook::new()
    }

    #[test]
    fn same_direction_fills_average_price() {
        let book = book();
        book.apply_fill(1, "RELIANCE", "NSE_EQ", ProductType::Mis, 100, 100.0);
        let (pos, realized) =
            book.apply_fill(1, "RELIANCE", "NSE_EQ", ProductType::Mis, 100, 110.0);
        assert_eq!(realized, 0.0);
        assert_eq!(pos.quantity, 200);
        assert!((pos.avg_price - 105.0).abs() < 1e-9);
        assert_eq!(pos.status, PositionStatus::Open);
    }

    #[test]
    fn opposite_fill_realizes_pnl_and_closes() {
        let book = book();
        book.apply_fill(1, "TCS", "NSE_EQ", ProductType::Mis, 50, 200.0);
        let (pos, realized) = book.apply_fill(1, "TCS", "NSE_EQ", ProductType::Mis, -50, 210.0);
        assert!((realized - 500.0).abs() < 1e-9);
        assert_eq!(pos.quantity, 0);
        assert_eq!(pos.status, PositionStatus::Closed);
    }

    #[test]
    fn short_position_realizes_inverted_pnl() {
        let book = book();
        book.apply_fill(2, "INFY", "NSE_EQ", ProductType::Normal, -100, 150.0);
        let (pos, realized) =
            book.apply_fill(2, "INFY", "NSE_EQ", ProductType::Normal, 100, 140.0);
        assert!((realized - 1_000.0).abs() < 1e-9);
        assert_eq!(pos.status, PositionStatus::Closed);
    }

    #[test]
    fn flip_through_zero_reopens_at_fill_price() {
        let book = book();
        book.apply_fill(1, "NIFTY 26DEC 25000 CE", "NSE_FNO", ProductType::Mis, 65, 100.0);
        let (pos, realized) = book.apply_fill(
            1,
            "NIFTY 26DEC 25000 CE",
            "NSE_FNO",
            ProductType::Mis,
            -130,
            120.0,
        );
        // 65 closed at +20 each, 65 reopened short at 120.
        assert!((realized - 1_300.0).abs() < 1e-9);
        assert_eq!(pos.quantity, -65);
        assert!((pos.avg_price - 120.0).abs() < 1e-9);
        assert_eq!(pos.status, PositionStatus::Open);
    }

    #[test]
    fn open_iff_nonzero_quantity() {
        let book = book();
        book.apply_fill(1, "SBIN", "NSE_EQ", ProductType::Mis, 10, 500.0);
        for pos in book.all_positions(None) {
            assert_eq!(pos.status == PositionStatus::Open, pos.quantity != 0);
        }
        book.apply_fill(1, "SBIN", "NSE_EQ", ProductType::Mis, -10, 501.0);
        for pos in book.all_positions(None) {
            assert_eq!(pos.status == PositionStatus::Open, pos.quantity != 0);
        }
    }

    #[test]
    fn product_types_are_isolated_books() {
        let book = book();
        book.apply_fill(1, "SBIN", "NSE_EQ", ProductType::Mis, 10, 500.0);
        book.apply_fill(1, "SBIN", "NSE_EQ", ProductType::Normal, -5, 500.0);
        assert_eq!(
            book.get(1, "SBIN", ProductType::Mis).unwrap().quantity,
            10
        );
        assert_eq!(
            book.get(1, "SBIN", ProductType::Normal).unwrap().quantity,
            -5
        );
    }
}
