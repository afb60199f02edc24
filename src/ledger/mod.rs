// =============================================================================
// Ledger — user accounts, margin, wallet and position books
// =============================================================================

pub mod accounts;
pub mod positions;

pub use accounts::{
    AccountStore, BrokeragePlan, LedgerEntry, LedgerKind, MarginAccount, UserAccount,
};
pub use positions::{Position, PositionBook, PositionStatus};
