use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use super::ModelError;

/// Elastic-net logistic regression hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticNetParams {
    /// Overall penalty strength
    pub alpha: f64,
    /// Share of the penalty applied as L1 (0 = ridge, 1 = lasso)
    pub l1_ratio: f64,
    pub learning_rate: f64,
    pub max_iter: usize,
    pub tol: f64,
}

impl Default for ElasticNetParams {
    fn default() -> Self {
        Self {
            alpha: 0.01,
            l1_ratio: 0.5,
            learning_rate: 0.1,
            max_iter: 1000,
            tol: 1e-6,
        }
    }
}

#[derive(Debug, Clone)]
struct LinearWeights {
    coefficients: Array1<f64>,
    intercept: f64,
    feature_means: Array1<f64>,
    feature_stds: Array1<f64>,
}

/// Logistic regression with combined L1/L2 penalty, fit by proximal gradient descent
#[derive(Debug, Clone)]
pub struct ElasticNetClassifier {
    params: ElasticNetParams,
    weights: Option<LinearWeights>,
}

impl ElasticNetClassifier {
    pub fn with_params(params: ElasticNetParams) -> Self {
        Self { params, weights: None }
    }

    pub fn params(&self) -> &ElasticNetParams {
        &self.params
    }

    pub fn is_trained(&self) -> bool {
        self.weights.is_some()
    }

    pub fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> Result<(), ModelError> {
        let n = x.nrows();
        if n == 0 || n != y.len() {
            return Err(ModelError::InvalidData(format!(
                "{} rows vs {} labels",
                n,
                y.len()
            )));
        }

        let means = x
            .mean_axis(Axis(0))
            .ok_or_else(|| ModelError::InvalidData("empty feature matrix".to_string()))?;
        let stds = x.std_axis(Axis(0), 0.0);
        let normalized = standardize(x, &means, &stds);

        let base_rate = (y.sum() / n as f64).clamp(1e-3, 1.0 - 1e-3);
        let mut intercept = (base_rate / (1.0 - base_rate)).ln();
        let mut coefficients = Array1::<f64>::zeros(x.ncols());

        let lr = self.params.learning_rate;
        let l1 = self.params.alpha * self.params.l1_ratio;
        let l2 = self.params.alpha * (1.0 - self.params.l1_ratio);

        for _ in 0..self.params.max_iter {
            let z = normalized.dot(&coefficients) + intercept;
            let error = z.mapv(sigmoid) - y;

            let grad_coef = normalized.t().dot(&error) / n as f64 + &coefficients * l2;
            let grad_intercept = error.mean().unwrap_or(0.0);

            let stepped = &coefficients - &(grad_coef * lr);
            let updated = stepped.mapv(|w| soft_threshold(w, lr * l1));
            let new_intercept = intercept - lr * grad_intercept;

            let max_change = (&updated - &coefficients)
                .iter()
                .fold((new_intercept - intercept).abs(), |acc, d| acc.max(d.abs()));
            coefficients = updated;
            intercept = new_intercept;

            if max_change < self.params.tol {
                break;
            }
        }

        if !intercept.is_finite() || coefficients.iter().any(|c| !c.is_finite()) {
            return Err(ModelError::NonFiniteOutput("diverged during fit".to_string()));
        }

        self.weights = Some(LinearWeights {
            coefficients,
            intercept,
            feature_means: means,
            feature_stds: stds,
        });
        Ok(())
    }

    /// P(up) for one feature row
    pub fn predict_proba(&self, row: ArrayView1<f64>) -> Result<f64, ModelError> {
        let weights = self.weights.as_ref().ok_or(ModelError::NotTrained)?;
        if row.len() != weights.coefficients.len() {
            return Err(ModelError::InvalidData(format!(
                "row has {} features, model expects {}",
                row.len(),
                weights.coefficients.len()
            )));
        }

        let mut z = weights.intercept;
        for j in 0..row.len() {
            let std = weights.feature_stds[j];
            let normalized = if std > 1e-10 {
                (row[j] - weights.feature_means[j]) / std
            } else {
                0.0
            };
            z += weights.coefficients[j] * normalized;
        }
        Ok(sigmoid(z))
    }
}

/// Z-score columns; zero-variance columns become all zeros
fn standardize(x: &Array2<f64>, means: &Array1<f64>, stds: &Array1<f64>) -> Array2<f64> {
    let mut normalized = x.clone();
    for (j, mut column) in normalized.axis_iter_mut(Axis(1)).enumerate() {
        let std = stds[j];
        if std > 1e-10 {
            column.mapv_inplace(|v| (v - means[j]) / std);
        } else {
            column.fill(0.0);
        }
    }
    normalized
}

fn soft_threshold(w: f64, threshold: f64) -> f64 {
    if w > threshold {
        w - threshold
    } else if w < -threshold {
        w + threshold
    } else {
        0.0
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_learns_sign_of_informative_feature() {
        let n = 200;
        let x = Array2::from_shape_fn((n, 2), |(i, j)| {
            if j == 0 {
                (i as f64 / n as f64) - 0.5
            } else {
                ((i * 17) % 5) as f64
            }
        });
        let y = Array1::from_shape_fn(n, |i| if i >= n / 2 { 1.0 } else { 0.0 });

        let mut model = ElasticNetClassifier::with_params(ElasticNetParams::default());
        model.fit(&x, &y).unwrap();

        let coefficients = &model.weights.as_ref().unwrap().coefficients;
        assert!(coefficients[0] > 0.0);
        assert!(coefficients[0].abs() > coefficients[1].abs());
        assert!(model.predict_proba(x.row(199)).unwrap() > 0.5);
        assert!(model.predict_proba(x.row(0)).unwrap() < 0.5);
    }

    #[test]
    fn test_strong_l1_zeroes_coefficients() {
        let x = Array2::from_shape_fn((50, 3), |(i, j)| ((i * (j + 3)) % 11) as f64);
        let y = Array1::from_shape_fn(50, |i| (i % 2) as f64);
        let params = ElasticNetParams {
            alpha: 10.0,
            l1_ratio: 1.0,
            ..ElasticNetParams::default()
        };
        let mut model = ElasticNetClassifier::with_params(params);
        model.fit(&x, &y).unwrap();
        assert!(model.weights.as_ref().unwrap().coefficients.iter().all(|c| *c == 0.0));
    }

    #[test]
    fn test_zero_variance_column_is_ignored() {
        let x = Array2::from_elem((30, 1), 7.0);
        let y = Array1::from_shape_fn(30, |i| (i % 2) as f64);
        let mut model = ElasticNetClassifier::with_params(ElasticNetParams::default());
        model.fit(&x, &y).unwrap();
        let p = model.predict_proba(Array1::from_elem(1, 1000.0).view()).unwrap();
        assert!((p - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_soft_threshold() {
        assert!((soft_threshold(0.5, 0.2) - 0.3).abs() < 1e-12);
        assert!((soft_threshold(-0.5, 0.2) + 0.3).abs() < 1e-12);
        assert_eq!(soft_threshold(0.1, 0.2), 0.0);
    }
}
