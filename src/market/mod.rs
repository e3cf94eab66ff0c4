pub mod yahoo;

pub use yahoo::YahooClient;

use async_trait::async_trait;

use crate::error::SignalResult;
use crate::types::PriceBar;

/// Source of daily OHLCV history
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Up to `lookback_days` most recent daily bars, oldest first.
    /// Unknown tickers and empty ranges are `DataUnavailable`.
    async fn fetch(&self, ticker: &str, lookback_days: u32) -> SignalResult<Vec<PriceBar>>;
}
