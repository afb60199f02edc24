// =============================================================================
// Subscription — fabric, shard table, metadata resolution, watchlists
// =============================================================================

pub mod fabric;
pub mod resolver;
pub mod shards;
pub mod watchlist;

pub use fabric::{SubscribeOutcome, SubscriptionEntry, SubscriptionFabric, WireTarget};
pub use resolver::ResolvedMeta;
pub use shards::ShardTable;
pub use watchlist::WatchlistManager;
