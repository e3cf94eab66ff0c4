use tracing::debug;

use super::{DirectionalModel, ModelError};
use crate::ml::features::FeatureSet;
use crate::types::Direction;

/// Fewest rows a walk-forward fold may train on
pub const MIN_TRAIN_ROWS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WalkForwardConfig {
    /// Trailing share of labelled rows that is predicted out of sample
    pub evaluation_fraction: f64,
    pub folds: usize,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            evaluation_fraction: 0.3,
            folds: 3,
        }
    }
}

/// Out-of-sample record of one model
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub predictions: usize,
    pub correct: usize,
    /// Returns of calls that made money
    pub wins: Vec<f64>,
    /// Absolute returns of calls that lost money
    pub losses: Vec<f64>,
}

impl Evaluation {
    pub fn accuracy(&self) -> f64 {
        if self.predictions == 0 {
            0.0
        } else {
            self.correct as f64 / self.predictions as f64
        }
    }
}

/// Expanding-window walk-forward: each fold trains on every labelled row before it
/// and predicts the fold. Nothing a fold predicts is ever seen in its training.
pub fn walk_forward(
    template: &DirectionalModel,
    set: &FeatureSet,
    config: &WalkForwardConfig,
) -> Result<Evaluation, ModelError> {
    let labelled = set.labelled_len();
    let folds = config.folds.max(1);
    let eval_len = ((labelled as f64 * config.evaluation_fraction).round() as usize).max(folds);
    if eval_len >= labelled || labelled - eval_len < MIN_TRAIN_ROWS {
        return Err(ModelError::InvalidData(format!(
            "{} labelled rows leave fewer than {} for training",
            labelled, MIN_TRAIN_ROWS
        )));
    }
    let eval_start = labelled - eval_len;
    let labels = set.labels();

    let mut evaluation = Evaluation::default();
    for fold in 0..folds {
        let start = eval_start + fold * eval_len / folds;
        let end = eval_start + (fold + 1) * eval_len / folds;
        if start == end {
            continue;
        }

        let mut model = template.untrained();
        model.fit(set, 0..start)?;

        for row in start..end {
            // Unchanged closes are neither right nor wrong
            if labels[row] == 0.5 {
                continue;
            }
            let p_up = model.predict_proba_row(set.matrix.row(row))?;
            let direction = Direction::from_up_probability(p_up);
            let went_up = labels[row] > 0.5;
            if (direction == Direction::Long) == went_up {
                evaluation.correct += 1;
            }
            evaluation.predictions += 1;

            let trade_return = direction.sign() * set.forward_returns[row].unwrap_or(0.0);
            if trade_return > 0.0 {
                evaluation.wins.push(trade_return);
            } else if trade_return < 0.0 {
                evaluation.losses.push(-trade_return);
            }
        }
    }

    debug!(
        "{}: walk-forward accuracy {:.3} over {} predictions",
        template.id(),
        evaluation.accuracy(),
        evaluation.predictions
    );
    Ok(evaluation)
}

/// Average win over average loss, pooled across evaluations.
///
/// No decisive call at all gives a neutral 1.0. Losing calls only give 0;
/// winning calls with no losing call give `max_ratio`.
pub fn payoff_ratio(evaluations: &[Evaluation], max_ratio: f64) -> f64 {
    let wins: Vec<f64> = evaluations.iter().flat_map(|e| e.wins.iter().copied()).collect();
    let losses: Vec<f64> = evaluations.iter().flat_map(|e| e.losses.iter().copied()).collect();

    if wins.is_empty() && losses.is_empty() {
        return 1.0;
    }
    if wins.is_empty() {
        return 0.0;
    }
    if losses.is_empty() {
        return max_ratio;
    }

    let avg_win = wins.iter().sum::<f64>() / wins.len() as f64;
    let avg_loss = losses.iter().sum::<f64>() / losses.len() as f64;
    (avg_win / avg_loss).min(max_ratio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::features::tests::history_from_closes;
    use crate::ml::features::{build_features, FeatureConfig};
    use crate::ml::models::{ElasticNetParams, GbmParams};

    #[test]
    fn test_walk_forward_counts_only_evaluation_rows() {
        let closes: Vec<f64> = (0..200).map(|i| 50.0 + (i as f64 * 0.45).sin() * 3.0).collect();
        let set = build_features(&history_from_closes(&closes), &FeatureConfig::default()).unwrap();
        let labelled = set.labelled_len();

        let model = DirectionalModel::gradient_boosting(GbmParams::default());
        let evaluation = walk_forward(&model, &set, &WalkForwardConfig::default()).unwrap();

        let expected = (labelled as f64 * 0.3).round() as usize;
        assert_eq!(evaluation.predictions, expected);
        assert!((0.0..=1.0).contains(&evaluation.accuracy()));
        assert!(evaluation.wins.len() + evaluation.losses.len() <= expected);
    }

    #[test]
    fn test_walk_forward_needs_training_rows() {
        let closes: Vec<f64> = (0..95).map(|i| 50.0 + (i as f64 * 0.45).sin() * 3.0).collect();
        let config = FeatureConfig {
            min_rows_for_fit: 20,
            ..FeatureConfig::default()
        };
        let set = build_features(&history_from_closes(&closes), &config).unwrap();
        let model = DirectionalModel::elastic_net(ElasticNetParams::default());
        let wf = WalkForwardConfig {
            evaluation_fraction: 0.8,
            folds: 3,
        };
        assert!(matches!(walk_forward(&model, &set, &wf), Err(ModelError::InvalidData(_))));
    }

    #[test]
    fn test_payoff_ratio_edge_cases() {
        let only_wins = Evaluation {
            predictions: 2,
            correct: 2,
            wins: vec![0.01, 0.02],
            losses: vec![],
        };
        let only_losses = Evaluation {
            predictions: 1,
            correct: 0,
            wins: vec![],
            losses: vec![0.01],
        };
        assert_eq!(payoff_ratio(&[only_wins.clone()], 10.0), 10.0);
        assert_eq!(payoff_ratio(&[only_losses.clone()], 10.0), 0.0);
        assert!((payoff_ratio(&[only_wins, only_losses], 10.0) - 1.5).abs() < 1e-12);
        assert_eq!(payoff_ratio(&[Evaluation::default()], 10.0), 1.0);
        assert_eq!(payoff_ratio(&[], 10.0), 1.0);
    }

    #[test]
    fn test_flat_series_has_no_decisive_calls() {
        let set = build_features(&history_from_closes(&[100.0; 200]), &FeatureConfig::default()).unwrap();
        for model in [
            DirectionalModel::gradient_boosting(GbmParams::default()),
            DirectionalModel::elastic_net(ElasticNetParams::default()),
        ] {
            let evaluation = walk_forward(&model, &set, &WalkForwardConfig::default()).unwrap();
            assert_eq!(evaluation.predictions, 0);
            assert!(evaluation.wins.is_empty() && evaluation.losses.is_empty());
            assert_eq!(payoff_ratio(&[evaluation], 10.0), 1.0);
        }
    }
}
