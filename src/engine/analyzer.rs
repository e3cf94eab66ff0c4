use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info};

use super::pipeline::SignalPipeline;
use crate::config::AppConfig;
use crate::database::SignalStore;
use crate::error::{SignalError, SignalResult};
use crate::market::MarketDataSource;
use crate::ml::hmm::GaussianHmm;
use crate::types::{sanitize_bars, Signal};

/// One async mutex per key, created on first use
pub struct KeyedLocks<T> {
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<T>>>>,
}

impl<T: Default> KeyedLocks<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn slot(&self, key: &str) -> Arc<tokio::sync::Mutex<T>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(key.to_uppercase()).or_default().clone()
    }
}

impl<T: Default> Default for KeyedLocks<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A persisted signal plus the closes it was computed from
#[derive(Debug, Clone)]
pub struct Analysis {
    pub signal: Signal,
    pub closes: Vec<f64>,
}

/// Fetch -> pipeline -> persist, for one or many tickers.
///
/// The regime model fitted for a ticker is cached and handed to the next
/// analysis of that ticker as its fallback. Concurrent analyses of the same
/// ticker wait on each other for the fit.
pub struct Analyzer {
    source: Arc<dyn MarketDataSource>,
    store: Arc<dyn SignalStore>,
    pipeline: Arc<SignalPipeline>,
    lookback_days: u32,
    fit_timeout: Option<Duration>,
    max_concurrency: usize,
    regime_cache: KeyedLocks<Option<GaussianHmm>>,
    save_locks: KeyedLocks<()>,
}

impl Analyzer {
    pub fn new(source: Arc<dyn MarketDataSource>, store: Arc<dyn SignalStore>, pipeline: Arc<SignalPipeline>) -> Self {
        Self {
            source,
            store,
            pipeline,
            lookback_days: 252,
            fit_timeout: None,
            max_concurrency: 4,
            regime_cache: KeyedLocks::new(),
            save_locks: KeyedLocks::new(),
        }
    }

    pub fn from_config(
        config: &AppConfig,
        source: Arc<dyn MarketDataSource>,
        store: Arc<dyn SignalStore>,
    ) -> anyhow::Result<Self> {
        let pipeline = SignalPipeline::from_config(config)?;
        Ok(Self::new(source, store, Arc::new(pipeline))
            .with_lookback_days(config.data.lookback_days)
            .with_fit_timeout(Some(Duration::from_secs(config.regime.fit_timeout_secs)))
            .with_max_concurrency(config.analysis.max_concurrency))
    }

    pub fn with_lookback_days(mut self, days: u32) -> Self {
        self.lookback_days = days;
        self
    }

    pub fn with_fit_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fit_timeout = timeout;
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    pub async fn analyze(&self, ticker: &str) -> SignalResult<Analysis> {
        info!("Analyzing {} over {} trading days", ticker, self.lookback_days);
        let started = Instant::now();

        let bars = self.source.fetch(ticker, self.lookback_days).await?;
        let history = sanitize_bars(ticker, bars)?;
        let closes = history.closes();
        info!("{}: {} bars fetched in {} ms", ticker, history.len(), started.elapsed().as_millis());

        let slot = self.regime_cache.slot(ticker);
        let mut cached = slot.lock().await;
        let prior = cached.clone();
        let pipeline = self.pipeline.clone();
        let deadline = self.fit_timeout.map(|t| Instant::now() + t);

        let joined =
            tokio::task::spawn_blocking(move || pipeline.assemble(&history, prior.as_ref(), deadline)).await;
        let output = match joined {
            Ok(result) => result?,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => return Err(SignalError::data_unavailable(ticker, format!("analysis cancelled: {}", e))),
        };
        *cached = Some(output.regime_model);
        drop(cached);

        let signal = output.signal;
        {
            let lock = self.save_locks.slot(ticker);
            let _guard = lock.lock().await;
            let id = self.store.save(&signal).await?;
            info!("{}: signal {} saved as #{}", signal.ticker(), signal.id(), id);
        }
        info!("{}: analysis complete in {} ms", signal.ticker(), started.elapsed().as_millis());
        Ok(Analysis { signal, closes })
    }

    /// Analyze several tickers concurrently. Results come back in completion order.
    pub async fn analyze_many(&self, tickers: &[String]) -> Vec<(String, SignalResult<Analysis>)> {
        stream::iter(tickers.iter().cloned())
            .map(|ticker| async move {
                let result = self.analyze(&ticker).await;
                if let Err(e) = &result {
                    error!("{}: analysis failed: {}", ticker, e);
                }
                (ticker, result)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await
    }
}
