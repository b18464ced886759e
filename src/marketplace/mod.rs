//! Marketplace Monitoring Core: venue adapters, price
//! monitor, and arbitrage detector wired together as background cycles.

pub mod adapter;
pub mod arbitrage;
pub mod model;
pub mod price_monitor;

pub use adapter::{MarketplaceAdapter, MarketplaceEvent, VenueConfig, VenuePool};
pub use arbitrage::{ArbitrageConfig, ArbitrageDetector};
pub use model::{
    AlertType, ArbitrageOpportunity, ExecutionRisk, Listing, ListingStatus, MomentPriceState,
    OpportunityStatus, PriceAlert,
};
pub use price_monitor::{PriceMonitor, PriceMonitorConfig};
