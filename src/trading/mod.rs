pub mod leverage;
pub mod matcher;
pub mod service;
pub mod settlement;

pub use leverage::LeverageEngine;
pub use matcher::LimitOrderMatcher;
pub use service::TradingService;
pub use settlement::SettlementEngine;
