use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{SignalError, SignalResult};

/// One daily OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl PriceBar {
    /// Bars with a non-positive price or volume carry no usable information
    pub fn is_valid(&self) -> bool {
        self.open > Decimal::ZERO
            && self.high > Decimal::ZERO
            && self.low > Decimal::ZERO
            && self.close > Decimal::ZERO
            && self.volume > Decimal::ZERO
    }

    pub fn close_f64(&self) -> f64 {
        self.close.try_into().unwrap_or(0.0)
    }

    pub fn volume_f64(&self) -> f64 {
        self.volume.try_into().unwrap_or(0.0)
    }
}

/// Validated, strictly time-ordered bar history for one ticker
#[derive(Debug, Clone, Default)]
pub struct PriceHistory {
    pub ticker: String,
    pub bars: Vec<PriceBar>,
}

impl PriceHistory {
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn last(&self) -> Option<&PriceBar> {
        self.bars.last()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close_f64()).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.volume_f64()).collect()
    }
}

/// Validate a fetched bar sequence before it reaches feature building.
///
/// Timestamps must be strictly increasing; a violation means the collaborator
/// handed us something we cannot reason about, so the whole fetch is rejected.
/// Rows with non-positive prices or volume are dropped individually.
pub fn sanitize_bars(ticker: &str, bars: Vec<PriceBar>) -> SignalResult<PriceHistory> {
    if bars.is_empty() {
        return Err(SignalError::data_unavailable(ticker, "empty price history"));
    }

    if let Some(w) = bars.windows(2).find(|w| w[1].timestamp <= w[0].timestamp) {
        return Err(SignalError::data_unavailable(
            ticker,
            format!(
                "timestamps not strictly increasing at {} -> {}",
                w[0].timestamp, w[1].timestamp
            ),
        ));
    }

    let total = bars.len();
    let valid: Vec<PriceBar> = bars.into_iter().filter(PriceBar::is_valid).collect();
    let dropped = total - valid.len();
    if dropped > 0 {
        warn!("{}: dropped {} bars with non-positive price or volume", ticker, dropped);
    }

    if valid.is_empty() {
        return Err(SignalError::data_unavailable(ticker, "no valid bars after filtering"));
    }

    debug!("{}: {} valid bars", ticker, valid.len());
    Ok(PriceHistory {
        ticker: ticker.to_uppercase(),
        bars: valid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn bar(day: i64, close: Decimal, volume: Decimal) -> PriceBar {
        let start = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        PriceBar {
            timestamp: start + Duration::days(day),
            open: close,
            high: close,
            low: close,
            close,
            volume,
        }
    }

    #[test]
    fn test_sanitize_drops_non_positive_rows() {
        let bars = vec![
            bar(0, dec!(100), dec!(1000)),
            bar(1, dec!(0), dec!(1000)),
            bar(2, dec!(101), dec!(0)),
            bar(3, dec!(102), dec!(900)),
        ];
        let history = sanitize_bars("aapl", bars).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.ticker, "AAPL");
        assert_eq!(history.closes(), vec![100.0, 102.0]);
    }

    #[test]
    fn test_sanitize_rejects_unordered_timestamps() {
        let bars = vec![
            bar(1, dec!(100), dec!(1000)),
            bar(1, dec!(101), dec!(1000)),
        ];
        let err = sanitize_bars("AAPL", bars).unwrap_err();
        assert!(matches!(err, SignalError::DataUnavailable { .. }));
    }

    #[test]
    fn test_sanitize_rejects_empty() {
        assert!(sanitize_bars("AAPL", Vec::new()).is_err());
    }
}
