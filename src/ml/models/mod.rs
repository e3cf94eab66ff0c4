pub mod evaluation;
pub mod linear;
pub mod trees;

pub use evaluation::{payoff_ratio, walk_forward, Evaluation, WalkForwardConfig};
pub use linear::{ElasticNetClassifier, ElasticNetParams};
pub use trees::{GbmClassifier, GbmParams};

use ndarray::{s, Array1, ArrayView1};
use std::ops::Range;
use thiserror::Error;

use crate::ml::features::{FeatureSet, FeatureVector};
use crate::types::Direction;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("model not trained")]
    NotTrained,

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("required feature '{0}' missing")]
    MissingFeature(String),

    #[error("non-finite output: {0}")]
    NonFiniteOutput(String),
}

/// The closed set of directional classifiers the ensemble combines
#[derive(Debug, Clone)]
pub enum DirectionalModel {
    GradientBoosting {
        model: GbmClassifier,
        features: Vec<String>,
    },
    ElasticNet {
        model: ElasticNetClassifier,
        features: Vec<String>,
    },
}

impl DirectionalModel {
    pub fn gradient_boosting(params: GbmParams) -> Self {
        DirectionalModel::GradientBoosting {
            model: GbmClassifier::with_params(params),
            features: Vec::new(),
        }
    }

    pub fn elastic_net(params: ElasticNetParams) -> Self {
        DirectionalModel::ElasticNet {
            model: ElasticNetClassifier::with_params(params),
            features: Vec::new(),
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            DirectionalModel::GradientBoosting { .. } => "gradient_boosting",
            DirectionalModel::ElasticNet { .. } => "elastic_net",
        }
    }

    /// Unfitted copy with the same hyperparameters
    pub fn untrained(&self) -> Self {
        match self {
            DirectionalModel::GradientBoosting { model, .. } => Self::gradient_boosting(model.params().clone()),
            DirectionalModel::ElasticNet { model, .. } => Self::elastic_net(model.params().clone()),
        }
    }

    pub fn is_trained(&self) -> bool {
        match self {
            DirectionalModel::GradientBoosting { model, .. } => model.is_trained(),
            DirectionalModel::ElasticNet { model, .. } => model.is_trained(),
        }
    }

    pub fn feature_names(&self) -> &[String] {
        match self {
            DirectionalModel::GradientBoosting { features, .. } | DirectionalModel::ElasticNet { features, .. } => {
                features
            }
        }
    }

    /// Fit on a contiguous block of labelled rows
    pub fn fit(&mut self, set: &FeatureSet, rows: Range<usize>) -> Result<(), ModelError> {
        if rows.end > set.labelled_len() || rows.is_empty() {
            return Err(ModelError::InvalidData(format!(
                "rows {:?} outside {} labelled rows",
                rows,
                set.labelled_len()
            )));
        }

        let x = set.matrix.slice(s![rows.clone(), ..]).to_owned();
        let y: Array1<f64> = set.labels().slice(s![rows]).to_owned();

        match self {
            DirectionalModel::GradientBoosting { model, features } => {
                model.fit(&x, &y)?;
                *features = set.names.clone();
            }
            DirectionalModel::ElasticNet { model, features } => {
                model.fit(&x, &y)?;
                *features = set.names.clone();
            }
        }
        Ok(())
    }

    /// P(up) for a row laid out like the training matrix
    pub fn predict_proba_row(&self, row: ArrayView1<f64>) -> Result<f64, ModelError> {
        let p = match self {
            DirectionalModel::GradientBoosting { model, .. } => model.predict_proba(row)?,
            DirectionalModel::ElasticNet { model, .. } => model.predict_proba(row)?,
        };
        if !p.is_finite() {
            return Err(ModelError::NonFiniteOutput(format!("{} produced {}", self.id(), p)));
        }
        Ok(p)
    }

    /// Direction and confidence = max(P(up), 1 - P(up))
    pub fn predict(&self, vector: &FeatureVector) -> Result<(Direction, f64), ModelError> {
        if !self.is_trained() {
            return Err(ModelError::NotTrained);
        }
        let row: Array1<f64> = self
            .feature_names()
            .iter()
            .map(|name| vector.get(name).ok_or_else(|| ModelError::MissingFeature(name.clone())))
            .collect::<Result<_, _>>()?;

        let p_up = self.predict_proba_row(row.view())?;
        Ok((Direction::from_up_probability(p_up), p_up.max(1.0 - p_up)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::features::tests::history_from_closes;
    use crate::ml::features::{build_features, FeatureConfig};

    fn feature_set() -> FeatureSet {
        let closes: Vec<f64> = (0..150).map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.1).collect();
        build_features(&history_from_closes(&closes), &FeatureConfig::default()).unwrap()
    }

    #[test]
    fn test_model_ids() {
        assert_eq!(DirectionalModel::gradient_boosting(GbmParams::default()).id(), "gradient_boosting");
        assert_eq!(DirectionalModel::elastic_net(ElasticNetParams::default()).id(), "elastic_net");
    }

    #[test]
    fn test_predict_before_fit_fails() {
        let set = feature_set();
        let model = DirectionalModel::elastic_net(ElasticNetParams::default());
        let latest = set.latest().unwrap();
        assert_eq!(model.predict(&latest), Err(ModelError::NotTrained));
    }

    #[test]
    fn test_fit_and_predict_latest() {
        let set = feature_set();
        for template in [
            DirectionalModel::gradient_boosting(GbmParams::default()),
            DirectionalModel::elastic_net(ElasticNetParams::default()),
        ] {
            let mut model = template.untrained();
            model.fit(&set, 0..set.labelled_len()).unwrap();
            let (_, confidence) = model.predict(&set.latest().unwrap()).unwrap();
            assert!((0.5..=1.0).contains(&confidence));
        }
    }

    #[test]
    fn test_missing_feature_is_reported() {
        let set = feature_set();
        let mut model = DirectionalModel::gradient_boosting(GbmParams::default());
        model.fit(&set, 0..set.labelled_len()).unwrap();

        let mut latest = set.latest().unwrap();
        latest.values.remove("rsi_5d");
        assert_eq!(
            model.predict(&latest),
            Err(ModelError::MissingFeature("rsi_5d".to_string()))
        );
    }

    #[test]
    fn test_fit_rejects_unlabelled_rows() {
        let set = feature_set();
        let mut model = DirectionalModel::elastic_net(ElasticNetParams::default());
        assert!(model.fit(&set, 0..set.len()).is_err());
    }
}
