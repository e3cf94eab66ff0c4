use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{SignalError, SignalResult};
use crate::types::PriceHistory;

/// Kinds of per-bar features. Every kind except `AbsReturn` is computed once per lookback window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Return,
    Volatility,
    Momentum,
    MaRatio,
    VolumeRatio,
    Rsi,
    AbsReturn,
}

impl FeatureKind {
    pub const ALL: [FeatureKind; 7] = [
        FeatureKind::Return,
        FeatureKind::Volatility,
        FeatureKind::Momentum,
        FeatureKind::MaRatio,
        FeatureKind::VolumeRatio,
        FeatureKind::Rsi,
        FeatureKind::AbsReturn,
    ];

    fn prefix(&self) -> &'static str {
        match self {
            FeatureKind::Return => "return",
            FeatureKind::Volatility => "volatility",
            FeatureKind::Momentum => "momentum",
            FeatureKind::MaRatio => "ma_ratio",
            FeatureKind::VolumeRatio => "volume_ratio",
            FeatureKind::Rsi => "rsi",
            FeatureKind::AbsReturn => "abs_return",
        }
    }

    fn is_windowed(&self) -> bool {
        !matches!(self, FeatureKind::AbsReturn)
    }

    /// Value at bar `i` over window `w`. Callers guarantee `i >= w >= 1`.
    fn compute(&self, closes: &[f64], volumes: &[f64], i: usize, w: usize) -> f64 {
        match self {
            FeatureKind::Return => closes[i] / closes[i - w] - 1.0,
            FeatureKind::Volatility => {
                let sum_sq: f64 = (i + 1 - w..=i)
                    .map(|j| (closes[j] / closes[j - 1]).ln().powi(2))
                    .sum();
                (sum_sq / w as f64).sqrt()
            }
            FeatureKind::Momentum => {
                let ups = (i + 1 - w..=i).filter(|&j| closes[j] > closes[j - 1]).count();
                ups as f64 / w as f64 - 0.5
            }
            FeatureKind::MaRatio => {
                let sma = closes[i + 1 - w..=i].iter().sum::<f64>() / w as f64;
                closes[i] / sma - 1.0
            }
            FeatureKind::VolumeRatio => {
                let sma = volumes[i + 1 - w..=i].iter().sum::<f64>() / w as f64;
                volumes[i] / sma
            }
            FeatureKind::Rsi => {
                let (mut gains, mut losses) = (0.0, 0.0);
                for j in i + 1 - w..=i {
                    let change = closes[j] - closes[j - 1];
                    if change > 0.0 {
                        gains += change;
                    } else {
                        losses -= change;
                    }
                }
                // (RSI - 50) / 50 reduces to (G - L) / (G + L)
                if gains + losses == 0.0 {
                    0.0
                } else {
                    (gains - losses) / (gains + losses)
                }
            }
            FeatureKind::AbsReturn => (closes[i] / closes[i - 1]).ln().abs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub windows: Vec<usize>,
    pub kinds: Vec<FeatureKind>,
    pub min_rows_for_fit: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            windows: vec![5, 10, 20, 30],
            kinds: FeatureKind::ALL.to_vec(),
            min_rows_for_fit: 60,
        }
    }
}

impl FeatureConfig {
    /// Bars consumed before the first complete row
    pub fn max_lookback(&self) -> usize {
        self.windows.iter().copied().max().unwrap_or(1).max(1)
    }

    /// Column names, in matrix order
    pub fn feature_names(&self) -> Vec<String> {
        self.columns().into_iter().map(|(name, _, _)| name).collect()
    }

    fn columns(&self) -> Vec<(String, FeatureKind, usize)> {
        let mut columns = Vec::new();
        for kind in &self.kinds {
            if kind.is_windowed() {
                for &w in &self.windows {
                    columns.push((format!("{}_{}d", kind.prefix(), w), *kind, w));
                }
            } else {
                columns.push((format!("{}_1d", kind.prefix()), *kind, 1));
            }
        }
        columns
    }
}

/// One row of named features
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

impl FeatureVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

/// Feature matrix aligned with the bars it was computed from.
///
/// Row `r` holds features for some bar `i`; `forward_returns[r]` is the log
/// return `ln(close[i+1] / close[i])` and is `None` only for the most recent bar.
#[derive(Debug, Clone)]
pub struct FeatureSet {
    pub names: Vec<String>,
    pub timestamps: Vec<DateTime<Utc>>,
    pub matrix: Array2<f64>,
    pub forward_returns: Vec<Option<f64>>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_features(&self) -> usize {
        self.names.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Sub-matrix of the named columns, in the given order
    pub fn select(&self, names: &[String]) -> Option<Array2<f64>> {
        let indices: Vec<usize> = names
            .iter()
            .map(|n| self.column_index(n))
            .collect::<Option<_>>()?;
        Some(self.matrix.select(ndarray::Axis(1), &indices))
    }

    /// Number of leading rows that carry a label
    pub fn labelled_len(&self) -> usize {
        self.forward_returns.iter().take_while(|r| r.is_some()).count()
    }

    /// Direction labels for the labelled rows: 1.0 when the next close is higher,
    /// 0.0 when lower. An unchanged close is 0.5 and carries no directional edge.
    pub fn labels(&self) -> Array1<f64> {
        self.forward_returns
            .iter()
            .map_while(|r| *r)
            .map(|r| {
                if r > 0.0 {
                    1.0
                } else if r < 0.0 {
                    0.0
                } else {
                    0.5
                }
            })
            .collect()
    }

    pub fn row_vector(&self, row: usize) -> FeatureVector {
        let values = self
            .names
            .iter()
            .cloned()
            .zip(self.matrix.row(row).iter().copied())
            .collect();
        FeatureVector {
            timestamp: self.timestamps[row],
            values,
        }
    }

    /// Features of the most recent bar, the row every prediction is made from
    pub fn latest(&self) -> Option<FeatureVector> {
        if self.is_empty() {
            None
        } else {
            Some(self.row_vector(self.len() - 1))
        }
    }
}

/// Build the feature matrix. Row for bar `i` reads bars `0..=i` only.
pub fn build_features(history: &PriceHistory, config: &FeatureConfig) -> SignalResult<FeatureSet> {
    let n = history.len();
    let lookback = config.max_lookback();
    let available = n.saturating_sub(lookback);
    if available < config.min_rows_for_fit {
        return Err(SignalError::insufficient_history(available, config.min_rows_for_fit));
    }

    let closes = history.closes();
    let volumes = history.volumes();
    let columns = config.columns();

    let mut data = Vec::with_capacity(available * columns.len());
    let mut timestamps = Vec::with_capacity(available);
    let mut forward_returns = Vec::with_capacity(available);
    let mut dropped = 0;

    for i in lookback..n {
        let row: Vec<f64> = columns
            .iter()
            .map(|(_, kind, w)| kind.compute(&closes, &volumes, i, *w))
            .collect();
        if row.iter().any(|v| !v.is_finite()) {
            dropped += 1;
            continue;
        }
        data.extend(row);
        timestamps.push(history.bars[i].timestamp);
        forward_returns.push(closes.get(i + 1).map(|next| (next / closes[i]).ln()));
    }

    if dropped > 0 {
        debug!("{}: dropped {} feature rows with non-finite values", history.ticker, dropped);
    }

    // Predictions are always made from the most recent bar
    if timestamps.last() != history.bars.last().map(|b| &b.timestamp) {
        return Err(SignalError::data_unavailable(
            &history.ticker,
            "features of the most recent bar are not finite",
        ));
    }

    let rows = timestamps.len();
    if rows < config.min_rows_for_fit {
        return Err(SignalError::insufficient_history(rows, config.min_rows_for_fit));
    }

    let matrix = Array2::from_shape_vec((rows, columns.len()), data)
        .map_err(|_| SignalError::insufficient_history(rows, config.min_rows_for_fit))?;

    Ok(FeatureSet {
        names: columns.into_iter().map(|(name, _, _)| name).collect(),
        timestamps,
        matrix,
        forward_returns,
    })
}
