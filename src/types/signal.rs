use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Directional call of a model or of the ensemble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn from_up_probability(p_up: f64) -> Self {
        if p_up >= 0.5 {
            Direction::Long
        } else {
            Direction::Short
        }
    }

    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Volatility regime, ordered from calmest to most turbulent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegimeLabel {
    LowVol = 0,
    MedVol = 1,
    HighVol = 2,
}

impl RegimeLabel {
    pub const ALL: [RegimeLabel; 3] = [RegimeLabel::LowVol, RegimeLabel::MedVol, RegimeLabel::HighVol];

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(RegimeLabel::LowVol),
            1 => Some(RegimeLabel::MedVol),
            2 => Some(RegimeLabel::HighVol),
            _ => None,
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RegimeLabel::LowVol => "LOW_VOL",
            RegimeLabel::MedVol => "MED_VOL",
            RegimeLabel::HighVol => "HIGH_VOL",
        }
    }
}

impl fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current regime with the filtered posterior over all three states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeState {
    pub label: RegimeLabel,
    pub probabilities: [f64; 3],
}

impl RegimeState {
    /// Build from a posterior vector; the label is always its arg-max.
    pub fn from_probabilities(probabilities: [f64; 3]) -> Self {
        let mut best = 0;
        for i in 1..3 {
            if probabilities[i] > probabilities[best] {
                best = i;
            }
        }
        Self {
            label: RegimeLabel::from_index(best).unwrap_or(RegimeLabel::MedVol),
            probabilities,
        }
    }

    pub fn probability(&self, label: RegimeLabel) -> f64 {
        self.probabilities[label.index()]
    }

    pub fn confidence(&self) -> f64 {
        self.probability(self.label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrediction {
    pub model_id: String,
    pub direction: Direction,
    pub confidence: f64,
    /// Out-of-sample accuracy from walk-forward evaluation
    pub historical_accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleResult {
    pub direction: Direction,
    pub confidence: f64,
    pub win_probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSizing {
    pub full_kelly: f64,
    /// Fractional Kelly after the regime discount, before the cap
    #[serde(default)]
    pub adjusted: f64,
    pub recommended: f64,
    pub max_allowed: f64,
    pub payoff_ratio: f64,
    pub regime_multiplier: f64,
}

/// The one record produced by an analysis run.
///
/// Fields are private; a `Signal` can only be built complete through
/// [`Signal::assemble`] and is read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    id: Uuid,
    ticker: String,
    as_of: DateTime<Utc>,
    price: Decimal,
    regime: RegimeState,
    predictions: Vec<ModelPrediction>,
    ensemble: EnsembleResult,
    sizing: PositionSizing,
}

impl Signal {
    pub fn assemble(
        ticker: &str,
        as_of: DateTime<Utc>,
        price: Decimal,
        regime: RegimeState,
        predictions: Vec<ModelPrediction>,
        ensemble: EnsembleResult,
        sizing: PositionSizing,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticker: ticker.to_uppercase(),
            as_of,
            price,
            regime,
            predictions,
            ensemble,
            sizing,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn as_of(&self) -> DateTime<Utc> {
        self.as_of
    }

    pub fn price(&self) -> Decimal {
        self.price
    }

    pub fn regime(&self) -> &RegimeState {
        &self.regime
    }

    pub fn predictions(&self) -> &[ModelPrediction] {
        &self.predictions
    }

    pub fn ensemble(&self) -> &EnsembleResult {
        &self.ensemble
    }

    pub fn sizing(&self) -> &PositionSizing {
        &self.sizing
    }

    /// Signed portfolio exposure: the recommended fraction applied in the ensemble direction
    pub fn target_exposure(&self) -> f64 {
        self.sizing.recommended * self.ensemble.direction.sign()
    }

    /// True when every model agrees with the ensemble call
    pub fn models_agree(&self) -> bool {
        self.predictions
            .iter()
            .all(|p| p.direction == self.ensemble.direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_regime_label_is_argmax() {
        let state = RegimeState::from_probabilities([0.1, 0.2, 0.7]);
        assert_eq!(state.label, RegimeLabel::HighVol);
        assert!((state.confidence() - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_regime_label_serde_names() {
        let json = serde_json::to_string(&RegimeLabel::MedVol).unwrap();
        assert_eq!(json, "\"MED_VOL\"");
        let json = serde_json::to_string(&Direction::Short).unwrap();
        assert_eq!(json, "\"SHORT\"");
    }

    #[test]
    fn test_signal_roundtrips_through_json() {
        let signal = Signal::assemble(
            "spy",
            Utc::now(),
            dec!(512.34),
            RegimeState::from_probabilities([0.8, 0.15, 0.05]),
            vec![ModelPrediction {
                model_id: "elastic_net".to_string(),
                direction: Direction::Short,
                confidence: 0.6,
                historical_accuracy: 0.55,
            }],
            EnsembleResult {
                direction: Direction::Short,
                confidence: 0.6,
                win_probability: 0.54,
            },
            PositionSizing {
                full_kelly: 0.08,
                adjusted: 0.04,
                recommended: 0.04,
                max_allowed: 0.25,
                payoff_ratio: 1.0,
                regime_multiplier: 1.0,
            },
        );

        let json = serde_json::to_string(&signal).unwrap();
        let back: Signal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, signal);
        assert_eq!(back.ticker(), "SPY");
        assert!((back.target_exposure() + 0.04).abs() < 1e-12);
        assert!(back.models_agree());
    }
}
