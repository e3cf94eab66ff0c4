use std::time::Instant;
use tracing::{debug, warn};

use super::{FitOptions, GaussianHmm};
use crate::config::RegimeSettings;
use crate::error::{SignalError, SignalResult};
use crate::ml::features::FeatureSet;
use crate::types::RegimeState;

/// Classifies the current volatility regime from a feature matrix
#[derive(Debug, Clone)]
pub struct RegimeDetector {
    observation_features: Vec<String>,
    max_iter: usize,
    tolerance: f64,
}

impl RegimeDetector {
    pub fn new(observation_features: Vec<String>) -> Self {
        Self {
            observation_features,
            max_iter: 200,
            tolerance: 1e-4,
        }
    }

    pub fn from_settings(settings: &RegimeSettings) -> Self {
        Self::new(settings.observation_features.clone())
            .with_max_iter(settings.max_iter)
            .with_tolerance(settings.tolerance)
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Fit a fresh model and filter to the last row.
    ///
    /// When the fit fails and `prior` is compatible, the prior parameters are used
    /// instead. Returns the model actually used so the caller can cache it.
    pub fn detect(
        &self,
        features: &FeatureSet,
        prior: Option<&GaussianHmm>,
        deadline: Option<Instant>,
    ) -> SignalResult<(RegimeState, GaussianHmm)> {
        let observations = features.select(&self.observation_features).ok_or_else(|| {
            SignalError::regime_divergence(format!(
                "observation features {:?} not present in feature set",
                self.observation_features
            ))
        })?;

        let options = FitOptions {
            max_iter: self.max_iter,
            tol: self.tolerance,
            deadline,
        };

        let model = match GaussianHmm::fit(&observations, &options) {
            Ok((model, report)) => {
                debug!(
                    "Regime HMM converged in {} iterations (logL = {:.2})",
                    report.iterations, report.log_likelihood
                );
                model
            }
            Err(e) => match prior {
                Some(prior) if prior.n_features == observations.ncols() => {
                    warn!("Regime fit failed ({}), falling back to prior parameters", e);
                    prior.clone()
                }
                _ => return Err(SignalError::regime_divergence(e.to_string())),
            },
        };

        let posterior = model
            .filter(&observations)
            .map_err(|e| SignalError::regime_divergence(e.to_string()))?;

        Ok((RegimeState::from_probabilities(posterior), model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::features::tests::{alternating_closes, history_from_closes};
    use crate::ml::features::{build_features, FeatureConfig, FeatureKind};
    use crate::types::RegimeLabel;

    fn vol_config() -> FeatureConfig {
        FeatureConfig {
            windows: vec![10, 20],
            kinds: vec![FeatureKind::Volatility, FeatureKind::AbsReturn],
            min_rows_for_fit: 60,
        }
    }

    fn detector() -> RegimeDetector {
        RegimeDetector::new(vec!["volatility_10d".to_string(), "abs_return_1d".to_string()])
    }

    #[test]
    fn test_constant_volatility_is_low_vol() {
        let history = history_from_closes(&alternating_closes(200, 2.0, 2.0, 0));
        let features = build_features(&history, &vol_config()).unwrap();
        let (state, _) = detector().detect(&features, None, None).unwrap();

        assert_eq!(state.label, RegimeLabel::LowVol);
        assert!(state.probability(RegimeLabel::LowVol) >= 0.9);
        assert!((state.probabilities.iter().sum::<f64>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_volatility_spike_is_high_vol() {
        let history = history_from_closes(&alternating_closes(200, 2.0, 1024.0, 20));
        let features = build_features(&history, &vol_config()).unwrap();
        let (state, model) = detector().detect(&features, None, None).unwrap();

        assert_eq!(state.label, RegimeLabel::HighVol);
        assert!(model.means[[0, 0]] < model.means[[2, 0]]);
    }

    #[test]
    fn test_failed_fit_without_prior_is_divergence() {
        let history = history_from_closes(&alternating_closes(200, 2.0, 1024.0, 20));
        let features = build_features(&history, &vol_config()).unwrap();
        let err = detector()
            .with_max_iter(1)
            .with_tolerance(0.0)
            .detect(&features, None, None)
            .unwrap_err();
        assert!(matches!(err, SignalError::RegimeFitDivergence { .. }));
    }

    #[test]
    fn test_failed_fit_falls_back_to_prior() {
        let history = history_from_closes(&alternating_closes(200, 2.0, 1024.0, 20));
        let features = build_features(&history, &vol_config()).unwrap();
        let (_, prior) = detector().detect(&features, None, None).unwrap();

        let (state, used) = detector()
            .detect(&features, Some(&prior), Some(Instant::now()))
            .unwrap();
        assert_eq!(used, prior);
        assert_eq!(state.label, RegimeLabel::HighVol);
    }

    #[test]
    fn test_missing_observation_feature() {
        let history = history_from_closes(&alternating_closes(200, 2.0, 2.0, 0));
        let features = build_features(&history, &vol_config()).unwrap();
        let err = RegimeDetector::new(vec!["volatility_5d".to_string()])
            .detect(&features, None, None)
            .unwrap_err();
        assert!(matches!(err, SignalError::RegimeFitDivergence { .. }));
    }
}
