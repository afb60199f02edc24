// =============================================================================
// Feed — vendor WebSocket ingestion, REST client and tick fan-out
// =============================================================================

pub mod codec;
pub mod ingestor;
pub mod rate_limit;
pub mod rest;
pub mod tick_bus;

pub use ingestor::{FeedState, LiveFeedIngestor};
pub use rate_limit::{RestChannel, VendorRateLimiter};
pub use rest::VendorRestClient;
pub use tick_bus::{TickBus, TickReceiver};
