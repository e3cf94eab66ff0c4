use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::num::NonZeroU32;
use tracing::debug;

use super::MarketDataSource;
use crate::config::DataSettings;
use crate::error::{SignalError, SignalResult};
use crate::types::PriceBar;

/// Calendar days requested per trading day wanted
const CALENDAR_PADDING: f64 = 1.5;

/// Yahoo Finance v8 chart API client
pub struct YahooClient {
    client: Client,
    base_url: String,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl YahooClient {
    pub fn new(settings: &DataSettings) -> SignalResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(settings.timeout_secs))
            .user_agent(concat!("quant_signal/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SignalError::data_unavailable("*", format!("http client: {}", e)))?;

        let per_second = NonZeroU32::new(settings.requests_per_second).unwrap_or(NonZeroU32::MIN);
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
        })
    }
}

#[async_trait]
impl MarketDataSource for YahooClient {
    async fn fetch(&self, ticker: &str, lookback_days: u32) -> SignalResult<Vec<PriceBar>> {
        let ticker = ticker.to_uppercase();
        let end = Utc::now();
        let start = end - Duration::days((lookback_days as f64 * CALENDAR_PADDING).ceil() as i64);
        let url = format!(
            "{}/v8/finance/chart/{}?period1={}&period2={}&interval=1d&events=history",
            self.base_url,
            ticker,
            start.timestamp(),
            end.timestamp()
        );

        self.limiter.until_ready().await;
        debug!("GET {}", url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SignalError::data_unavailable(&ticker, e.to_string()))?;

        let status = resp.status();
        let body: ChartResponse = resp
            .json()
            .await
            .map_err(|e| SignalError::data_unavailable(&ticker, format!("HTTP {}: {}", status, e)))?;

        parse_chart(&ticker, body, lookback_days as usize)
    }
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<Quote>,
}

#[derive(Debug, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

/// Rows with any missing field are skipped; the last `limit` remaining rows are kept.
fn parse_chart(ticker: &str, body: ChartResponse, limit: usize) -> SignalResult<Vec<PriceBar>> {
    if let Some(err) = body.chart.error {
        return Err(SignalError::data_unavailable(
            ticker,
            format!("{}: {}", err.code, err.description),
        ));
    }

    let result = body
        .chart
        .result
        .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) })
        .ok_or_else(|| SignalError::data_unavailable(ticker, "empty chart result"))?;
    let quote = result
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| SignalError::data_unavailable(ticker, "no quote block"))?;

    let decimal = |v: Option<&Option<f64>>| v.copied().flatten().and_then(|x| Decimal::try_from(x).ok());

    let mut bars = Vec::with_capacity(result.timestamp.len());
    for (i, &ts) in result.timestamp.iter().enumerate() {
        let timestamp = match Utc.timestamp_opt(ts, 0).single() {
            Some(t) => t,
            None => continue,
        };
        let (Some(open), Some(high), Some(low), Some(close), Some(volume)) = (
            decimal(quote.open.get(i)),
            decimal(quote.high.get(i)),
            decimal(quote.low.get(i)),
            decimal(quote.close.get(i)),
            decimal(quote.volume.get(i)),
        ) else {
            continue;
        };
        bars.push(PriceBar {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        });
    }

    if bars.is_empty() {
        return Err(SignalError::data_unavailable(ticker, "no bars in requested range"));
    }
    if bars.len() > limit {
        bars.drain(..bars.len() - limit);
    }
    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chart(json: &str) -> ChartResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_chart_skips_null_rows_and_keeps_tail() {
        let body = chart(
            r#"{"chart":{"result":[{
                "meta":{"symbol":"AAPL"},
                "timestamp":[1704205800,1704292200,1704378600,1704465000],
                "indicators":{"quote":[{
                    "open":[185.0,null,182.1,181.9],
                    "high":[186.1,184.2,183.0,182.7],
                    "low":[183.4,182.0,180.9,180.1],
                    "close":[185.6,184.0,181.9,181.2],
                    "volume":[82488700,58414500,71983600,62303300]
                }]}
            }],"error":null}}"#,
        );
        let bars = parse_chart("AAPL", body, 2).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close_f64(), 181.9);
        assert!(bars[0].timestamp < bars[1].timestamp);
    }

    #[test]
    fn test_parse_chart_error_is_data_unavailable() {
        let body = chart(
            r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#,
        );
        let err = parse_chart("ZZZZ", body, 252).unwrap_err();
        assert!(matches!(err, SignalError::DataUnavailable { .. }));
        assert!(err.to_string().contains("delisted"));
    }

    #[test]
    fn test_parse_chart_empty_range() {
        let body = chart(r#"{"chart":{"result":[{"indicators":{"quote":[{}]}}],"error":null}}"#);
        assert!(parse_chart("AAPL", body, 252).is_err());
    }
}
