use std::time::Instant;
use tracing::info;

use crate::config::AppConfig;
use crate::error::{SignalError, SignalResult};
use crate::ml::ensemble::EnsemblePredictor;
use crate::ml::features::{build_features, FeatureConfig};
use crate::ml::hmm::{GaussianHmm, RegimeDetector};
use crate::risk::{KellySizer, SizingConfigError};
use crate::types::{PriceHistory, Signal};

/// A signal together with the regime model that produced it
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub signal: Signal,
    pub regime_model: GaussianHmm,
}

/// features -> {regime, ensemble} -> sizing -> Signal, for one instrument.
///
/// Pure and synchronous; I/O and caching belong to the caller.
pub struct SignalPipeline {
    features: FeatureConfig,
    regime: RegimeDetector,
    ensemble: EnsemblePredictor,
    sizer: KellySizer,
    assumed_payoff_ratio: Option<f64>,
}

impl SignalPipeline {
    pub fn new(features: FeatureConfig, regime: RegimeDetector, ensemble: EnsemblePredictor, sizer: KellySizer) -> Self {
        Self {
            features,
            regime,
            ensemble,
            sizer,
            assumed_payoff_ratio: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, SizingConfigError> {
        Ok(Self::new(
            config.features.feature_config(),
            RegimeDetector::from_settings(&config.regime),
            EnsemblePredictor::from_settings(&config.ensemble),
            KellySizer::from_settings(&config.sizing)?,
        )
        .with_assumed_payoff_ratio(config.sizing.assumed_payoff_ratio))
    }

    /// Use a fixed payoff ratio instead of the walk-forward estimate
    pub fn with_assumed_payoff_ratio(mut self, ratio: Option<f64>) -> Self {
        self.assumed_payoff_ratio = ratio;
        self
    }

    pub fn assemble(
        &self,
        history: &PriceHistory,
        prior_regime: Option<&GaussianHmm>,
        deadline: Option<Instant>,
    ) -> SignalResult<PipelineOutput> {
        let last = history
            .last()
            .ok_or_else(|| SignalError::data_unavailable(&history.ticker, "empty price history"))?;

        let started = Instant::now();
        let features = build_features(history, &self.features)?;
        info!(
            "{}: {} feature rows x {} features in {} ms",
            history.ticker,
            features.len(),
            features.n_features(),
            started.elapsed().as_millis()
        );

        let started = Instant::now();
        let (regime, regime_model) = self.regime.detect(&features, prior_regime, deadline)?;
        info!(
            "{}: regime {} (p = {:.3}) in {} ms",
            history.ticker,
            regime.label,
            regime.confidence(),
            started.elapsed().as_millis()
        );

        let started = Instant::now();
        let outcome = self.ensemble.predict(&features)?;
        info!(
            "{}: ensemble {} (confidence {:.3}) in {} ms",
            history.ticker,
            outcome.result.direction,
            outcome.result.confidence,
            started.elapsed().as_millis()
        );

        let payoff_ratio = self.assumed_payoff_ratio.unwrap_or(outcome.payoff_ratio);
        let sizing = self
            .sizer
            .size(outcome.result.win_probability, payoff_ratio, regime.label)?;
        info!(
            "{}: win probability {:.3}, payoff {:.3}, size {:+.4}",
            history.ticker,
            outcome.result.win_probability,
            payoff_ratio,
            sizing.recommended
        );

        let signal = Signal::assemble(
            &history.ticker,
            last.timestamp,
            last.close,
            regime,
            outcome.predictions,
            outcome.result,
            sizing,
        );

        Ok(PipelineOutput { signal, regime_model })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{EnsembleSettings, SizingSettings};
    use crate::ml::features::tests::{alternating_closes, history_from_closes};
    use crate::ml::features::FeatureKind;
    use crate::types::RegimeLabel;

    /// Even windows only, so a two-level alternating series gives constant features
    pub(crate) fn test_pipeline() -> SignalPipeline {
        let features = FeatureConfig {
            windows: vec![10, 20],
            kinds: vec![
                FeatureKind::Return,
                FeatureKind::Volatility,
                FeatureKind::Momentum,
                FeatureKind::Rsi,
                FeatureKind::AbsReturn,
            ],
            min_rows_for_fit: 60,
        };
        let regime = RegimeDetector::new(vec!["volatility_10d".to_string(), "abs_return_1d".to_string()]);
        let ensemble = EnsemblePredictor::from_settings(&EnsembleSettings::default());
        let sizer = KellySizer::from_settings(&SizingSettings::default()).unwrap();
        SignalPipeline::new(features, regime, ensemble, sizer)
    }

    #[test]
    fn test_constant_volatility_series() {
        let history = history_from_closes(&alternating_closes(200, 2.0, 2.0, 0));
        let output = test_pipeline().assemble(&history, None, None).unwrap();
        let signal = &output.signal;

        assert_eq!(signal.regime().label, RegimeLabel::LowVol);
        assert!(signal.regime().probability(RegimeLabel::LowVol) >= 0.9);
        assert!((signal.ensemble().confidence - 0.5).abs() < 0.05);
        assert!(signal.sizing().recommended.abs() < 0.05);
        assert_eq!(signal.predictions().len(), 2);
        assert_eq!(signal.as_of(), history.last().unwrap().timestamp);
    }

    #[test]
    fn test_flat_price_series() {
        let history = history_from_closes(&[100.0; 200]);
        let output = test_pipeline().assemble(&history, None, None).unwrap();
        let signal = &output.signal;

        assert_eq!(signal.regime().label, RegimeLabel::LowVol);
        assert!(signal.regime().probability(RegimeLabel::LowVol) >= 0.9);
        assert!((signal.ensemble().confidence - 0.5).abs() < 0.05);
        assert!(signal.sizing().recommended.abs() < 0.05);
        assert_eq!(signal.sizing().payoff_ratio, 1.0);
    }

    #[test]
    fn test_flat_price_series_with_default_config() {
        let history = history_from_closes(&[100.0; 200]);
        let pipeline = SignalPipeline::from_config(&AppConfig::default()).unwrap();
        let signal = pipeline.assemble(&history, None, None).unwrap().signal;

        assert_eq!(signal.regime().label, RegimeLabel::LowVol);
        assert!(signal.sizing().recommended.abs() < 0.05);
    }

    #[test]
    fn test_volatility_spike_shrinks_position() {
        let history = history_from_closes(&alternating_closes(200, 2.0, 1024.0, 20));
        let output = test_pipeline().assemble(&history, None, None).unwrap();
        let signal = &output.signal;

        assert_eq!(signal.regime().label, RegimeLabel::HighVol);
        assert_eq!(signal.sizing().regime_multiplier, 0.3);

        // Same edge in a calm regime; compared before the cap, which would clip the calm size
        let calm = KellySizer::default()
            .size(
                signal.ensemble().win_probability,
                signal.sizing().payoff_ratio,
                RegimeLabel::LowVol,
            )
            .unwrap();
        let sizing = signal.sizing();
        assert!(sizing.adjusted.abs() <= 0.3 * calm.adjusted.abs() + 1e-12);
        assert!(sizing.recommended.abs() <= sizing.adjusted.abs() + 1e-12);
        assert!(sizing.recommended.abs() <= calm.recommended.abs() + 1e-12);
    }

    #[test]
    fn test_short_history_is_insufficient() {
        let history = history_from_closes(&alternating_closes(70, 2.0, 2.0, 0));
        let err = test_pipeline().assemble(&history, None, None).unwrap_err();
        assert!(matches!(err, SignalError::InsufficientHistory { .. }));
    }

    #[test]
    fn test_zero_payoff_ratio_is_rejected() {
        let history = history_from_closes(&alternating_closes(200, 2.0, 2.0, 0));
        let err = test_pipeline()
            .with_assumed_payoff_ratio(Some(0.0))
            .assemble(&history, None, None)
            .unwrap_err();
        assert!(matches!(err, SignalError::InvalidPayoffRatio { .. }));
        assert_eq!(err.stage(), crate::error::Stage::Sizing);
    }

    #[test]
    fn test_signal_fields_are_consistent() {
        let history = history_from_closes(&alternating_closes(240, 2.0, 1024.0, 20));
        let output = test_pipeline().assemble(&history, None, None).unwrap();
        let signal = &output.signal;

        let probs = signal.regime().probabilities;
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-6);
        assert!(signal.sizing().recommended.abs() <= signal.sizing().max_allowed);

        let confidences: Vec<f64> = signal.predictions().iter().map(|p| p.confidence).collect();
        let lo = confidences.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = confidences.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert!(signal.ensemble().confidence >= lo - 1e-12 && signal.ensemble().confidence <= hi + 1e-12);
    }
}
