pub mod feed;
pub mod klines;
pub mod price_cache;

pub use feed::MarketFeed;
pub use price_cache::PriceCache;
