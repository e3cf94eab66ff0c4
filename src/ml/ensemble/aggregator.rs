use tracing::{debug, info};

use super::Calibration;
use crate::config::EnsembleSettings;
use crate::error::{SignalError, SignalResult};
use crate::ml::features::FeatureSet;
use crate::ml::models::{payoff_ratio, walk_forward, DirectionalModel, WalkForwardConfig};
use crate::types::{Direction, EnsembleResult, ModelPrediction};

/// Everything the ensemble stage hands to sizing
#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleOutcome {
    pub predictions: Vec<ModelPrediction>,
    pub result: EnsembleResult,
    /// Average win / average loss of the models' out-of-sample calls
    pub payoff_ratio: f64,
}

/// Ensemble of directional models weighted by out-of-sample accuracy
pub struct EnsemblePredictor {
    models: Vec<DirectionalModel>,
    walk_forward: WalkForwardConfig,
    calibration: Calibration,
    max_payoff_ratio: f64,
}

impl EnsemblePredictor {
    pub fn new(walk_forward: WalkForwardConfig, calibration: Calibration, max_payoff_ratio: f64) -> Self {
        Self {
            models: Vec::new(),
            walk_forward,
            calibration,
            max_payoff_ratio,
        }
    }

    /// Gradient boosting plus elastic-net logistic regression
    pub fn from_settings(settings: &EnsembleSettings) -> Self {
        let mut ensemble = Self::new(
            WalkForwardConfig {
                evaluation_fraction: settings.evaluation_fraction,
                folds: settings.walk_forward_folds,
            },
            Calibration::from(&settings.calibration),
            settings.max_payoff_ratio,
        );
        ensemble.add_model(DirectionalModel::gradient_boosting(settings.gradient_boosting.clone()));
        ensemble.add_model(DirectionalModel::elastic_net(settings.elastic_net.clone()));
        ensemble
    }

    pub fn add_model(&mut self, model: DirectionalModel) {
        debug!("Ensemble: added model '{}'", model.id());
        self.models.push(model);
    }

    /// Evaluate every model out of sample, refit on all labelled rows and
    /// predict the latest row. Any model failing fails the whole stage.
    pub fn predict(&self, set: &FeatureSet) -> SignalResult<EnsembleOutcome> {
        if self.models.is_empty() {
            return Err(SignalError::insufficient_models("no models configured"));
        }
        let latest = set
            .latest()
            .ok_or_else(|| SignalError::insufficient_models("empty feature set"))?;
        let labelled = set.labelled_len();

        let mut predictions = Vec::with_capacity(self.models.len());
        let mut evaluations = Vec::with_capacity(self.models.len());

        for template in &self.models {
            let id = template.id();
            let fail = |e: crate::ml::models::ModelError| SignalError::insufficient_models(format!("{}: {}", id, e));

            let evaluation = walk_forward(template, set, &self.walk_forward).map_err(fail)?;

            let mut live = template.untrained();
            live.fit(set, 0..labelled).map_err(fail)?;
            let (direction, confidence) = live.predict(&latest).map_err(fail)?;

            info!(
                "{}: {} (confidence {:.3}, out-of-sample accuracy {:.3})",
                id,
                direction,
                confidence,
                evaluation.accuracy()
            );
            predictions.push(ModelPrediction {
                model_id: id.to_string(),
                direction,
                confidence,
                historical_accuracy: evaluation.accuracy(),
            });
            evaluations.push(evaluation);
        }

        let result = combine(&predictions, &self.calibration)?;
        let payoff_ratio = payoff_ratio(&evaluations, self.max_payoff_ratio);

        Ok(EnsembleOutcome {
            predictions,
            result,
            payoff_ratio,
        })
    }
}

/// Accuracy-weighted vote.
///
/// Direction is the weighted majority (ties go to the single most confident
/// model); confidence is the accuracy-weighted mean of model confidences, with
/// equal weights when every accuracy is zero.
pub fn combine(predictions: &[ModelPrediction], calibration: &Calibration) -> SignalResult<EnsembleResult> {
    if predictions.is_empty() {
        return Err(SignalError::insufficient_models("no predictions to combine"));
    }
    if let Some(bad) = predictions
        .iter()
        .find(|p| !p.confidence.is_finite() || !p.historical_accuracy.is_finite())
    {
        return Err(SignalError::insufficient_models(format!(
            "{} produced a non-finite score",
            bad.model_id
        )));
    }

    let total_accuracy: f64 = predictions.iter().map(|p| p.historical_accuracy.max(0.0)).sum();
    let weight = |p: &ModelPrediction| {
        if total_accuracy > 0.0 {
            p.historical_accuracy.max(0.0)
        } else {
            1.0
        }
    };

    let (mut long_weight, mut short_weight) = (0.0, 0.0);
    let (mut weighted_conf, mut total_weight) = (0.0, 0.0);
    for p in predictions {
        let w = weight(p);
        match p.direction {
            Direction::Long => long_weight += w,
            Direction::Short => short_weight += w,
        }
        weighted_conf += p.confidence * w;
        total_weight += w;
    }

    let direction = if long_weight > short_weight {
        Direction::Long
    } else if short_weight > long_weight {
        Direction::Short
    } else {
        predictions
            .iter()
            .fold(&predictions[0], |best, p| if p.confidence > best.confidence { p } else { best })
            .direction
    };

    let confidence = weighted_conf / total_weight;
    Ok(EnsembleResult {
        direction,
        confidence,
        win_probability: calibration.win_probability(confidence),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::features::tests::history_from_closes;
    use crate::ml::features::{build_features, FeatureConfig};

    fn prediction(id: &str, direction: Direction, confidence: f64, accuracy: f64) -> ModelPrediction {
        ModelPrediction {
            model_id: id.to_string(),
            direction,
            confidence,
            historical_accuracy: accuracy,
        }
    }

    #[test]
    fn test_agreeing_models() {
        let preds = vec![
            prediction("gradient_boosting", Direction::Long, 0.7, 0.6),
            prediction("elastic_net", Direction::Long, 0.6, 0.4),
        ];
        let result = combine(&preds, &Calibration::default()).unwrap();
        assert_eq!(result.direction, Direction::Long);
        assert!((result.confidence - 0.66).abs() < 1e-12);
        assert!(result.win_probability > 0.5);
    }

    #[test]
    fn test_more_accurate_model_wins_the_vote() {
        let preds = vec![
            prediction("gradient_boosting", Direction::Short, 0.55, 0.62),
            prediction("elastic_net", Direction::Long, 0.8, 0.51),
        ];
        let result = combine(&preds, &Calibration::default()).unwrap();
        assert_eq!(result.direction, Direction::Short);
    }

    #[test]
    fn test_tie_goes_to_higher_confidence() {
        let preds = vec![
            prediction("gradient_boosting", Direction::Short, 0.55, 0.5),
            prediction("elastic_net", Direction::Long, 0.8, 0.5),
        ];
        let result = combine(&preds, &Calibration::default()).unwrap();
        assert_eq!(result.direction, Direction::Long);
    }

    #[test]
    fn test_zero_accuracy_uses_equal_weights() {
        let preds = vec![
            prediction("gradient_boosting", Direction::Long, 0.6, 0.0),
            prediction("elastic_net", Direction::Long, 0.8, 0.0),
        ];
        let result = combine(&preds, &Calibration::default()).unwrap();
        assert!((result.confidence - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_confidence_stays_between_model_confidences() {
        let cal = Calibration::default();
        for (c1, c2, a1, a2) in [
            (0.5, 0.9, 0.3, 0.7),
            (0.99, 0.51, 0.55, 0.45),
            (0.6, 0.6, 0.0, 1.0),
            (0.75, 0.52, 1.0, 0.0),
        ] {
            let preds = vec![
                prediction("gradient_boosting", Direction::Long, c1, a1),
                prediction("elastic_net", Direction::Short, c2, a2),
            ];
            let result = combine(&preds, &cal).unwrap();
            assert!(result.confidence >= c1.min(c2) - 1e-12);
            assert!(result.confidence <= c1.max(c2) + 1e-12);
            assert!(result.win_probability > 0.0 && result.win_probability < 1.0);
        }
    }

    #[test]
    fn test_non_finite_confidence_rejected() {
        let preds = vec![prediction("elastic_net", Direction::Long, f64::NAN, 0.5)];
        assert!(matches!(
            combine(&preds, &Calibration::default()),
            Err(SignalError::InsufficientModels { .. })
        ));
    }

    #[test]
    fn test_predict_produces_one_prediction_per_model() {
        let closes: Vec<f64> = (0..220).map(|i| 80.0 + (i as f64 * 0.21).sin() * 4.0 + i as f64 * 0.05).collect();
        let set = build_features(&history_from_closes(&closes), &FeatureConfig::default()).unwrap();

        let ensemble = EnsemblePredictor::from_settings(&EnsembleSettings::default());
        assert_eq!(ensemble.models.len(), 2);

        let outcome = ensemble.predict(&set).unwrap();
        let ids: Vec<&str> = outcome.predictions.iter().map(|p| p.model_id.as_str()).collect();
        assert_eq!(ids, vec!["gradient_boosting", "elastic_net"]);
        for p in &outcome.predictions {
            assert!((0.0..=1.0).contains(&p.historical_accuracy));
        }
        assert!(outcome.payoff_ratio >= 0.0);
    }

    #[test]
    fn test_empty_ensemble_fails() {
        let closes: Vec<f64> = (0..120).map(|i| 80.0 + i as f64).collect();
        let set = build_features(&history_from_closes(&closes), &FeatureConfig::default()).unwrap();
        let ensemble = EnsemblePredictor::new(WalkForwardConfig::default(), Calibration::default(), 10.0);
        assert!(matches!(
            ensemble.predict(&set),
            Err(SignalError::InsufficientModels { .. })
        ));
    }
}
